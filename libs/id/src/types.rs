//! Typed identifier definitions.

use std::net::Ipv4Addr;

use crate::IdError;

// =============================================================================
// Node Key
// =============================================================================

/// Canonical identity of a network-boot client.
///
/// Stored as the four address octets; the string form is always eight
/// uppercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey([u8; 4]);

impl NodeKey {
    /// Number of characters in the canonical string form.
    pub const LEN: usize = 8;

    /// Creates a key from a client IPv4 address.
    #[must_use]
    pub const fn from_ipv4(addr: Ipv4Addr) -> Self {
        Self(addr.octets())
    }

    /// Returns the client IPv4 address this key names.
    #[must_use]
    pub const fn to_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3])
    }

    /// Parses a key from its canonical form.
    ///
    /// Only `[0-9A-F]{8}` is accepted.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let len = s.chars().count();
        if len != Self::LEN {
            return Err(IdError::InvalidLength {
                expected: Self::LEN,
                actual: len,
            });
        }

        if let Some((position, character)) = s
            .chars()
            .enumerate()
            .find(|(_, c)| !matches!(c, '0'..='9' | 'A'..='F'))
        {
            return Err(IdError::InvalidCharacter {
                character,
                position,
            });
        }

        let mut octets = [0u8; 4];
        // Characters were validated above.
        hex::decode_to_slice(s, &mut octets).map_err(|_| IdError::InvalidCharacter {
            character: '?',
            position: 0,
        })?;

        Ok(Self(octets))
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl std::str::FromStr for NodeKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Ipv4Addr> for NodeKey {
    fn from(addr: Ipv4Addr) -> Self {
        Self::from_ipv4(addr)
    }
}

impl From<NodeKey> for Ipv4Addr {
    fn from(key: NodeKey) -> Self {
        key.to_ipv4()
    }
}

impl serde::Serialize for NodeKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode_upper(self.0))
    }
}

impl<'de> serde::Deserialize<'de> for NodeKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Export Identifier
// =============================================================================

/// NFS export filesystem identifier (`fsid=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExportId(u32);

impl ExportId {
    /// Creates a new ExportId from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Returns the identifier following this one, if there is one.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }
}

impl std::fmt::Display for ExportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ExportId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<ExportId> for u32 {
    fn from(id: ExportId) -> Self {
        id.0
    }
}

impl serde::Serialize for ExportId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ExportId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u32::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================
