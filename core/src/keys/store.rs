//! Key persistence — four lines, rewritten on every key change
//!
//! Line order: private key (base64 PKCS#8 DER), public key (base64),
//! invalidation date, issuer signature (base64).

use super::{format_wire_time, parse_wire_time, KeyError, QuakeKeys};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use std::path::Path;

pub fn save(path: &Path, keys: &QuakeKeys) -> Result<(), KeyError> {
    let contents = format!(
        "{}\n{}\n{}\n{}\n",
        keys.private_key_b64()?,
        keys.public_key_b64,
        format_wire_time(&keys.invalidation_date),
        keys.signature_b64,
    );
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn load(path: &Path) -> Result<QuakeKeys, KeyError> {
    let contents = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = contents.lines().map(str::trim).collect();
    if lines.len() < 4 {
        return Err(KeyError::Malformed("key file needs four lines".into()));
    }
    let der = BASE64.decode(lines[0])?;
    let private_key =
        RsaPrivateKey::from_pkcs8_der(&der).map_err(|e| KeyError::Malformed(e.to_string()))?;
    Ok(QuakeKeys {
        private_key,
        public_key_b64: lines[1].to_string(),
        signature_b64: lines[3].to_string(),
        invalidation_date: parse_wire_time(lines[2])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyManager, TrustAnchors};
    use chrono::{Duration as TimeDelta, Local};
    use rsa::pkcs8::EncodePublicKey;

    fn sample_keys() -> QuakeKeys {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pub_der = private_key
            .to_public_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        QuakeKeys {
            private_key,
            public_key_b64: BASE64.encode(pub_der),
            signature_b64: "c2ln".to_string(),
            invalidation_date: Local::now().naive_local() + TimeDelta::days(1),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quake.key");
        let keys = sample_keys();

        save(&path, &keys).unwrap();
        let restored = load(&path).unwrap();

        assert_eq!(restored.public_key_b64, keys.public_key_b64);
        assert_eq!(restored.signature_b64, keys.signature_b64);
        assert_eq!(
            format_wire_time(&restored.invalidation_date),
            format_wire_time(&keys.invalidation_date)
        );
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quake.key");
        std::fs::write(&path, "only\ntwo\n").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_manager_tolerates_corrupt_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quake.key");
        std::fs::write(&path, "garbage\nnot\na\nkey\n").unwrap();

        let km = KeyManager::new(TrustAnchors::builtin().unwrap(), Some(path));
        assert!(!km.has_keys());
    }

    #[test]
    fn test_manager_restores_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quake.key");
        let keys = sample_keys();
        let expected = keys.public_key_b64.clone();

        {
            let km =
                KeyManager::new(TrustAnchors::builtin().unwrap(), Some(path.clone()));
            km.install(keys).unwrap();
        }
        {
            let km = KeyManager::new(TrustAnchors::builtin().unwrap(), Some(path));
            assert_eq!(km.current().unwrap().public_key_b64, expected);
        }
    }
}
