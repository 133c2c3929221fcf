//! Identifiers and change tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a remote zone.
///
/// A zone is a remote-side partition holding the records of one logical
/// object type. It is the unit of subscription and of per-scope cursor
/// tracking, so the identifier must stay stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(String);

impl ZoneId {
    /// Creates a zone identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the zone name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ZoneId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Unique identifier of a remote record within its zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Creates a record identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the record name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// An opaque resumption cursor issued by the remote store.
///
/// A token marks "everything up to here has been seen". Only the remote
/// service can interpret or order tokens; the engine stores and replays
/// them verbatim. `Option<ChangeToken>::None` means "fetch from the
/// beginning".
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(Vec<u8>);

impl ChangeToken {
    /// Wraps raw token bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the token, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Lowercase hex rendering, used for logs and the CLI.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeToken({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_id_display() {
        let zone = ZoneId::new("NotesZone");
        assert_eq!(zone.to_string(), "NotesZone");
        assert_eq!(zone.as_str(), "NotesZone");
        assert_eq!(ZoneId::from("NotesZone"), zone);
    }

    #[test]
    fn token_hex() {
        let token = ChangeToken::from_bytes(vec![0x00, 0xab, 0x10]);
        assert_eq!(token.to_hex(), "00ab10");
        assert_eq!(format!("{token:?}"), "ChangeToken(00ab10)");
        assert_eq!(token.clone().into_bytes(), vec![0x00, 0xab, 0x10]);
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&ZoneId::new("Dogs")).unwrap();
        assert_eq!(json, "\"Dogs\"");

        let token: ChangeToken = serde_json::from_str("[1,2,3]").unwrap();
        assert_eq!(token.as_bytes(), &[1, 2, 3]);
    }
}
