//! Access modes granted on topics and subscriptions.
//!
//! A mode is a bit set rendered as a string of permission letters in the
//! fixed order `JRWPASDO`; the empty set renders as `N`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypesError;

const LETTERS: [(char, u32); 8] = [
    ('J', AccessMode::JOIN.0),
    ('R', AccessMode::READ.0),
    ('W', AccessMode::WRITE.0),
    ('P', AccessMode::PRES.0),
    ('A', AccessMode::APPROVE.0),
    ('S', AccessMode::SHARE.0),
    ('D', AccessMode::DELETE.0),
    ('O', AccessMode::OWNER.0),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AccessMode(pub u32);

impl AccessMode {
    pub const NONE: AccessMode = AccessMode(0);
    pub const JOIN: AccessMode = AccessMode(0x01);
    pub const READ: AccessMode = AccessMode(0x02);
    pub const WRITE: AccessMode = AccessMode(0x04);
    pub const PRES: AccessMode = AccessMode(0x08);
    pub const APPROVE: AccessMode = AccessMode(0x10);
    pub const SHARE: AccessMode = AccessMode(0x20);
    pub const DELETE: AccessMode = AccessMode(0x40);
    pub const OWNER: AccessMode = AccessMode(0x80);

    /// Default mode for participants of one-to-one topics.
    pub const P2P: AccessMode = AccessMode(0x01 | 0x02 | 0x04 | 0x08 | 0x10);
    /// Default mode for authenticated users joining a public group.
    pub const PUBLIC: AccessMode = AccessMode(0x01 | 0x02 | 0x04 | 0x08 | 0x20);

    pub fn contains(&self, other: AccessMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AccessMode {
    type Output = AccessMode;

    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return f.write_str("N");
        }
        for (letter, bit) in LETTERS {
            if self.0 & bit != 0 {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AccessMode {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bits = 0;
        for c in s.chars() {
            let upper = c.to_ascii_uppercase();
            if upper == 'N' {
                continue;
            }
            let (_, bit) = LETTERS
                .iter()
                .find(|(letter, _)| *letter == upper)
                .ok_or(TypesError::InvalidAccessMode(c))?;
            bits |= bit;
        }
        Ok(AccessMode(bits))
    }
}

impl Serialize for AccessMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AccessMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Default access granted to authenticated and anonymous users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultAccess {
    pub auth: AccessMode,
    pub anon: AccessMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_strings() {
        assert_eq!(AccessMode::P2P.to_string(), "JRWPA");
        assert_eq!(AccessMode::PUBLIC.to_string(), "JRWPS");
        assert_eq!(AccessMode::NONE.to_string(), "N");
        assert_eq!("jrwpa".parse::<AccessMode>().unwrap(), AccessMode::P2P);
        assert_eq!("N".parse::<AccessMode>().unwrap(), AccessMode::NONE);
    }

    #[test]
    fn test_invalid_mode_letter() {
        assert_eq!(
            "JX".parse::<AccessMode>(),
            Err(TypesError::InvalidAccessMode('X'))
        );
    }

    #[test]
    fn test_contains() {
        assert!(AccessMode::P2P.contains(AccessMode::READ | AccessMode::WRITE));
        assert!(!AccessMode::P2P.contains(AccessMode::OWNER));
    }
}
