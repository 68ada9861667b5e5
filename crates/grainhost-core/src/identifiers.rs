//! Identifier types used across Grainhost
//!
//! Every record in the document store is keyed by an opaque string id. Each
//! kind of id gets its own newtype so a grain id can never be passed where a
//! token id is expected.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing id string
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the id as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the id, returning the inner string
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// A grain (running application instance)
    GrainId
);
string_id!(
    /// A principal identity; grain ownership is keyed to one identity
    IdentityId
);
string_id!(
    /// A user account; an account may own several identities
    AccountId
);
string_id!(
    /// A capability grant, equal to the base64 SHA-256 of its bearer secret
    TokenId
);
string_id!(
    /// An interactive session
    SessionId
);
string_id!(
    /// The per-session hostname label a browser talks to
    HostId
);
string_id!(
    /// An installed application package
    PackageId
);
string_id!(
    /// An application, shared by all versions of its packages
    AppId
);

/// Generate a random identifier of `len` characters from an unambiguous alphabet.
pub fn random_id(len: usize) -> String {
    const ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
        .into_iter()
        .map(|b| ALPHABET[usize::from(b) % ALPHABET.len()] as char)
        .collect()
}

impl GrainId {
    /// Create a fresh random grain id
    pub fn generate() -> Self {
        Self(random_id(22))
    }
}

impl SessionId {
    /// Create a fresh random session id
    pub fn generate() -> Self {
        Self(random_id(22))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_and_serde() {
        let id = GrainId::new("grain-1");
        assert_eq!(id.to_string(), "grain-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"grain-1\"");
        let back: GrainId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_random_ids_differ() {
        let a = GrainId::generate();
        let b = GrainId::generate();
        assert_eq!(a.as_str().len(), 22);
        assert_ne!(a, b);
    }
}
