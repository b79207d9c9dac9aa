//! Protocol message — `<code> <relayCount> <field>:<field>:...`

use super::codes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing relay count: {0}")]
    MissingRelayCount(String),
    #[error("invalid integer in header: {0}")]
    InvalidHeader(String),
}

/// One wire message. `code` and `relay_count` are always present; the body
/// may be absent. The relay count is bumped exactly once per forwarding hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub code: u16,
    pub relay_count: u32,
    pub fields: Vec<String>,
    raw: String,
}

impl ProtocolMessage {
    pub fn new(code: u16, relay_count: u32, fields: Vec<String>) -> Self {
        let raw = serialize(code, relay_count, &fields);
        Self {
            code,
            relay_count,
            fields,
            raw,
        }
    }

    /// Parse one received line. The first two whitespace-delimited tokens are
    /// the header; everything after the second space is the body verbatim
    /// (body fields may themselves contain spaces), split on `:`.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut parts = line.splitn(3, ' ');
        let code = parts
            .next()
            .ok_or(ParseError::Empty)?
            .parse::<u16>()
            .map_err(|_| ParseError::InvalidHeader(line.to_string()))?;
        let relay_count = parts
            .next()
            .ok_or_else(|| ParseError::MissingRelayCount(line.to_string()))?
            .parse::<u32>()
            .map_err(|_| ParseError::InvalidHeader(line.to_string()))?;
        let fields = match parts.next() {
            Some(body) if !body.is_empty() => body.split(':').map(str::to_string).collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            code,
            relay_count,
            fields,
            raw: line.to_string(),
        })
    }

    /// Copy of this message with the relay count bumped for the next hop.
    pub fn forwarded(&self) -> Self {
        Self::new(self.code, self.relay_count + 1, self.fields.clone())
    }

    pub fn to_line(&self) -> String {
        serialize(self.code, self.relay_count, &self.fields)
    }

    /// The original line as received (or as first serialized).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Body with fields rejoined by `:`.
    pub fn raw_body(&self) -> String {
        self.fields.join(":")
    }

    pub fn has_body(&self) -> bool {
        !self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Dedup identity. Relay request/ack carry the event id first; other
    /// broadcast codes use event-id or event-id:subtype; unrecognized
    /// messages fall back to the whole body.
    pub fn identity(&self) -> String {
        match self.code {
            codes::RELAY | codes::RELAY_ACK => {
                self.field(0).unwrap_or_default().to_string()
            }
            500..=599 => match (self.field(0), self.field(1)) {
                (Some(id), Some(subtype)) => format!("{id}:{subtype}"),
                (Some(id), None) => id.to_string(),
                _ => String::new(),
            },
            _ => self.raw_body(),
        }
    }
}

impl std::fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_line())
    }
}

fn serialize(code: u16, relay_count: u32, fields: &[String]) -> String {
    if fields.is_empty() {
        format!("{code} {relay_count}")
    } else {
        format!("{code} {relay_count} {}", fields.join(":"))
    }
}
