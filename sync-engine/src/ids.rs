//! Row identifiers. The spec only requires "any cryptographically-weak
//! UUID-style 128-bit identifier... collision within a single user's
//! dataset is the only requirement", so a plain v4 UUID rendered in its
//! standard hyphenated hex form is sufficient; there's no need for the
//! stack-optimized small-string representation the teacher's own `Guid`
//! type uses for Places-style 12-byte guids, since sync rows here carry
//! full UUIDs, not short alphanumeric ones.

use std::fmt;

/// An opaque row identifier. Cheap to clone; displays as the hyphenated
/// hex form (`8-4-4-4-12`) required by the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Guid(String);

impl Guid {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Guid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Guid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Guid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<Guid> for String {
    fn from(g: Guid) -> Self {
        g.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_random_ids_dont_collide() {
        let a = Guid::random();
        let b = Guid::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert_eq!(a.as_str().matches('-').count(), 4);
    }
}
