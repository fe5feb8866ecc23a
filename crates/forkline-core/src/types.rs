//! Member identity and membership views.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity of one member of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(Uuid);

impl Address {
    /// Generate a fresh random address.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell members apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// A membership view: the ordered member list installed at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Member that installed this view.
    pub creator: Address,
    /// Monotonic view number, per cluster.
    pub id: u64,
    /// Current members, oldest first.
    pub members: Vec<Address>,
}

impl View {
    pub const fn new(creator: Address, id: u64, members: Vec<Address>) -> Self {
        Self {
            creator,
            id,
            members,
        }
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.members.contains(addr)
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|{}] (", self.creator, self.id)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{m}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn address_bytes_roundtrip() {
        let addr = Address::random();
        assert_eq!(Address::from_bytes(*addr.as_bytes()), addr);
    }

    #[test]
    fn view_display_lists_members() {
        let a = Address::from_bytes([0x11; 16]);
        let b = Address::from_bytes([0x22; 16]);
        let view = View::new(a, 3, vec![a, b]);
        assert_eq!(view.to_string(), "[11111111|3] (11111111, 22222222)");
        assert!(view.contains(&b));
        assert_eq!(view.size(), 2);
    }
}
