//! Identifiers for documents and participants.
//!
//! Both are opaque strings assigned outside the sync core: a `DocId` comes
//! from the document route, a `UserName` from whoever opens the document.
//! The only rule enforced here is that neither may be blank.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Document ID cannot be empty")]
    EmptyDocId,
    #[error("User name cannot be empty")]
    EmptyUserName,
}

/// Identity of a document, as it appears in `/documents/<id>`.
///
/// # Examples
/// ```
/// use docsync_core::DocId;
///
/// let doc: DocId = "doc1".parse().unwrap();
/// assert_eq!(doc.as_str(), "doc1");
/// assert!("".parse::<DocId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(String);

impl DocId {
    /// Mint a fresh document ID for a newly created document.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Display name of a participant. Not unique: two sessions may share a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserName(String);

impl UserName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_id {
    ($ty:ident, $err:expr) => {
        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::try_from(s.to_string())
            }
        }

        impl TryFrom<String> for $ty {
            type Error = IdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                if s.trim().is_empty() {
                    return Err($err);
                }
                Ok(Self(s))
            }
        }

        impl From<$ty> for String {
            fn from(id: $ty) -> String {
                id.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                Self::try_from(s).map_err(serde::de::Error::custom)
            }
        }
    };
}

string_id!(DocId, IdError::EmptyDocId);
string_id!(UserName, IdError::EmptyUserName);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let doc: DocId = "doc1".parse().unwrap();
        assert_eq!(doc.to_string(), "doc1");

        let user: UserName = "alice".parse().unwrap();
        assert_eq!(user.as_str(), "alice");
    }

    #[test]
    fn test_reject_blank() {
        assert_eq!("".parse::<DocId>(), Err(IdError::EmptyDocId));
        assert_eq!("   ".parse::<UserName>(), Err(IdError::EmptyUserName));
    }

    #[test]
    fn test_generate_is_unique() {
        let a = DocId::generate();
        let b = DocId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_serde_as_plain_string() {
        let user: UserName = "bob".parse().unwrap();
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"bob\"");

        let parsed: UserName = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(parsed, user);

        assert!(serde_json::from_str::<DocId>("\"\"").is_err());
    }
}
