//! Key manager — network-issued RSA keypair, message authentication
//!
//! The network issues each node a short-lived RSA keypair, signed by the
//! key-issuer authority. Locally-originated quake broadcasts are signed with
//! it; inbound broadcasts verify against two fixed well-known public keys
//! (the rendezvous server's and the key issuer's). Signatures are RSA
//! PKCS#1 v1.5 over SHA-1, bodies are digested with MD5 in the legacy wire
//! encoding, and everything travels base64.

pub mod store;

use crate::protocol::{codes, ProtocolMessage};
use crate::transport::codec;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{Duration as TimeDelta, Local, NaiveDateTime};
use md5::Md5;
use parking_lot::RwLock;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Wire timestamp layout, e.g. `2030/01/01 00-00-00`.
pub const TIME_FORMAT: &str = "%Y/%m/%d %H-%M-%S";

// Well-known trust anchors (base64 SubjectPublicKeyInfo DER).
const SERVER_PUBLIC_KEY_B64: &str = "MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQDXfI+dMUpoGcLxEGmc+9DIXNRNptnaHs1cl0G9876chugJMdBpPj4SRYZqBL3QcgqpDY0K//9u5Js5i0eGEN1Es82e7OPqaITzpIo/aKvJFNHRM/yPyOERE9zmoinWK7VPqpBH++9Q8JgyIfEDdC1F98qEdJJCmKtgncXxBzu7rQIDAQAB";
const ISSUER_PUBLIC_KEY_B64: &str = "MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQC6xsXEa+LsxJ5X7ZN+KslpT9NdZn/j1HvlI0EAq04oEKzA9w1qJyUinP5vZlPTf13OKjol9kF93zN1LtA/6dA8XFESCO4mKscnTQcJeb6gW7tSadE11SiOpbdeZl3CukYFU6m0bsvCaTxGjC7pRCSh1UJBfUllms9FI7XLMag31wIDAQAB";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no key material available")]
    NoKey,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("signature not yet valid until {0}")]
    NotYetValid(String),
    #[error("signature validity window closed at {0}")]
    Expired(String),
    #[error("malformed key material: {0}")]
    Malformed(String),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn parse_wire_time(s: &str) -> Result<NaiveDateTime, KeyError> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|_| KeyError::Malformed(format!("bad timestamp: {s}")))
}

pub fn format_wire_time(t: &NaiveDateTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Local wall-clock time, before any server offset is applied.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// The active network-issued keypair.
#[derive(Clone)]
pub struct QuakeKeys {
    pub private_key: RsaPrivateKey,
    /// Our public key, base64 DER, as embedded in outgoing broadcasts.
    pub public_key_b64: String,
    /// Issuer signature over `publicKeyDer || invalidationDate`.
    pub signature_b64: String,
    pub invalidation_date: NaiveDateTime,
}

impl QuakeKeys {
    pub fn private_key_b64(&self) -> Result<String, KeyError> {
        let der = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        Ok(BASE64.encode(der.as_bytes()))
    }
}

/// The two fixed well-known public keys remote signatures verify against.
#[derive(Clone)]
pub struct TrustAnchors {
    pub server: RsaPublicKey,
    pub issuer: RsaPublicKey,
}

impl TrustAnchors {
    /// The network's embedded anchors.
    pub fn builtin() -> Result<Self, KeyError> {
        Self::from_base64(SERVER_PUBLIC_KEY_B64, ISSUER_PUBLIC_KEY_B64)
    }

    pub fn from_base64(server_b64: &str, issuer_b64: &str) -> Result<Self, KeyError> {
        Ok(Self {
            server: decode_public_key(server_b64)?,
            issuer: decode_public_key(issuer_b64)?,
        })
    }
}

fn decode_public_key(b64: &str) -> Result<RsaPublicKey, KeyError> {
    let der = BASE64.decode(b64)?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| KeyError::Malformed(e.to_string()))
}

fn sha1_pkcs1() -> Pkcs1v15Sign {
    Pkcs1v15Sign::new::<Sha1>()
}

/// MD5 of the body in the legacy wire encoding.
fn body_digest(body: &str) -> Vec<u8> {
    Md5::digest(codec::encode_text(body)).to_vec()
}

pub struct KeyManager {
    anchors: TrustAnchors,
    store_path: Option<PathBuf>,
    keys: RwLock<Option<QuakeKeys>>,
    /// `parsedServerTime - localTime`, learned from the protocol-time step.
    clock_offset_secs: RwLock<i64>,
}

impl KeyManager {
    /// Restores the persisted keypair when one exists; restoration failure
    /// means "no key available", never a fatal error — the node can still
    /// receive and relay, just not originate authenticated broadcasts.
    pub fn new(anchors: TrustAnchors, store_path: Option<PathBuf>) -> Self {
        let keys = match &store_path {
            Some(path) if path.exists() => match store::load(path) {
                Ok(keys) => Some(keys),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "key restore failed, starting without keys");
                    None
                }
            },
            _ => None,
        };
        Self {
            anchors,
            store_path,
            keys: RwLock::new(keys),
            clock_offset_secs: RwLock::new(0),
        }
    }

    pub fn has_keys(&self) -> bool {
        self.keys.read().is_some()
    }

    pub fn current(&self) -> Option<QuakeKeys> {
        self.keys.read().clone()
    }

    pub fn set_clock_offset(&self, secs: i64) {
        *self.clock_offset_secs.write() = secs;
    }

    pub fn clock_offset_secs(&self) -> i64 {
        *self.clock_offset_secs.read()
    }

    /// True when there is no key or the key's invalidation date falls within
    /// `margin` from now.
    pub fn expires_within(&self, margin: TimeDelta) -> bool {
        match self.keys.read().as_ref() {
            None => true,
            Some(keys) => keys.invalidation_date <= now() + margin,
        }
    }

    /// Adopt a keypair and rewrite the key file.
    pub fn install(&self, keys: QuakeKeys) -> Result<(), KeyError> {
        if let Some(path) = &self.store_path {
            store::save(path, &keys)?;
        }
        *self.keys.write() = Some(keys);
        debug!("key material installed");
        Ok(())
    }

    /// Accept a server-issued key bundle:
    /// `privateKeyB64:publicKeyB64:invalidationDate:signatureB64`.
    pub fn accept_bundle(&self, fields: &[String]) -> Result<(), KeyError> {
        if fields.len() < 4 {
            return Err(KeyError::Malformed("key bundle needs four fields".into()));
        }
        let der = BASE64.decode(&fields[0])?;
        let private_key = RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        self.install(QuakeKeys {
            private_key,
            public_key_b64: fields[1].clone(),
            signature_b64: fields[3].clone(),
            invalidation_date: parse_wire_time(&fields[2])?,
        })
    }

    /// RSA-sign a payload with the active private key (SHA-1, PKCS#1 v1.5);
    /// returns base64.
    pub fn sign(&self, payload: &[u8]) -> Result<String, KeyError> {
        let keys = self.keys.read();
        let keys = keys.as_ref().ok_or(KeyError::NoKey)?;
        let signature = keys
            .private_key
            .sign(sha1_pkcs1(), &Sha1::digest(payload))
            .map_err(|_| KeyError::InvalidSignature)?;
        Ok(BASE64.encode(signature))
    }

    /// Server scheme: signature over `ASCII(timeField) || MD5(body)` against
    /// the fixed server key, valid only once the stated time has elapsed
    /// (a freshness floor, not a window).
    pub fn verify_server_signature(
        &self,
        signature_b64: &str,
        time_field: &str,
        body: &str,
    ) -> Result<(), KeyError> {
        let signature = BASE64.decode(signature_b64)?;
        let mut data = time_field.as_bytes().to_vec();
        data.extend_from_slice(&body_digest(body));
        self.anchors
            .server
            .verify(sha1_pkcs1(), &Sha1::digest(&data), &signature)
            .map_err(|_| KeyError::InvalidSignature)?;
        let stated = parse_wire_time(time_field)?;
        if now() <= stated {
            return Err(KeyError::NotYetValid(time_field.to_string()));
        }
        Ok(())
    }

    /// User scheme: the embedded key must be issuer-signed together with its
    /// validity date, the data signature must verify against that key, and
    /// the stated time must still lie in the future — the opposite direction
    /// from the server check.
    pub fn verify_user_signature(
        &self,
        public_key_b64: &str,
        time: &str,
        key_time: &str,
        data_signature_b64: &str,
        key_signature_b64: &str,
        body: &str,
    ) -> Result<(), KeyError> {
        let key_der = BASE64.decode(public_key_b64)?;

        let mut key_data = key_der.clone();
        key_data.extend_from_slice(key_time.as_bytes());
        self.anchors
            .issuer
            .verify(
                sha1_pkcs1(),
                &Sha1::digest(&key_data),
                &BASE64.decode(key_signature_b64)?,
            )
            .map_err(|_| KeyError::InvalidSignature)?;

        let user_key = RsaPublicKey::from_public_key_der(&key_der)
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        let mut data = time.as_bytes().to_vec();
        data.extend_from_slice(&body_digest(body));
        user_key
            .verify(
                sha1_pkcs1(),
                &Sha1::digest(&data),
                &BASE64.decode(data_signature_b64)?,
            )
            .map_err(|_| KeyError::InvalidSignature)?;

        let stated = parse_wire_time(time)?;
        if now() >= stated {
            return Err(KeyError::Expired(time.to_string()));
        }
        Ok(())
    }

    /// Authenticity check for an inbound message: user broadcasts use the
    /// two-part user scheme, any other coded message with a body the single
    /// server scheme.
    pub fn verify_message(&self, msg: &ProtocolMessage) -> Result<(), KeyError> {
        if msg.code == codes::USER_QUAKE {
            if msg.fields.len() < 6 {
                return Err(KeyError::Malformed(
                    "user broadcast needs six fields".into(),
                ));
            }
            let payload = msg.fields[5..].join(":");
            return self.verify_user_signature(
                &msg.fields[2],
                &msg.fields[1],
                &msg.fields[4],
                &msg.fields[0],
                &msg.fields[3],
                &payload,
            );
        }
        if msg.fields.len() < 2 {
            return Err(KeyError::Malformed("signed body needs two fields".into()));
        }
        let body = msg.fields[2..].join(":");
        self.verify_server_signature(&msg.fields[0], &msg.fields[1], &body)
    }

    /// Build a signed user broadcast for an area code. The payload is
    /// `randomInt64,areaCode`; the validation timestamp is local time shifted
    /// by the server clock offset.
    pub fn create_user_broadcast(&self, area_code: u32) -> Result<ProtocolMessage, KeyError> {
        let keys = self.current().ok_or(KeyError::NoKey)?;
        let payload = format!("{},{}", rand::random::<i64>(), area_code);
        let validation = now() + TimeDelta::seconds(self.clock_offset_secs());
        let validation_str = format_wire_time(&validation);

        let mut data = validation_str.as_bytes().to_vec();
        data.extend_from_slice(&body_digest(&payload));
        let signature = keys
            .private_key
            .sign(sha1_pkcs1(), &Sha1::digest(&data))
            .map_err(|_| KeyError::InvalidSignature)?;

        Ok(ProtocolMessage::new(
            codes::USER_QUAKE,
            1,
            vec![
                BASE64.encode(signature),
                validation_str,
                keys.public_key_b64.clone(),
                keys.signature_b64.clone(),
                format_wire_time(&keys.invalidation_date),
                payload,
            ],
        ))
    }
}
