//! Identifier newtypes.
//!
//! Users and devices are identified by the authentication layer, operations by
//! their author. All three are opaque strings; the engine only requires them to
//! be non-empty and bounded.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Maximum accepted identifier length in bytes.
pub const MAX_ID_LEN: usize = 256;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true if the identifier is non-empty and at most
            /// [`MAX_ID_LEN`] bytes long.
            #[must_use]
            pub fn is_valid(&self) -> bool {
                !self.0.is_empty() && self.0.len() <= MAX_ID_LEN
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Account whose log an operation belongs to.
    UserId
}

string_id! {
    /// One installation of the app belonging to a user.
    DeviceId
}

string_id! {
    /// Client-generated, globally unique operation identifier.
    ///
    /// Ordering is lexicographic and is the tie-breaker of the log order.
    OperationId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn validity() {
        assert!(UserId::new("u1").is_valid());
        assert!(!UserId::new("").is_valid());
        assert!(!DeviceId::new("x".repeat(MAX_ID_LEN + 1)).is_valid());
    }

    #[test]
    fn operation_ids_order_lexicographically() {
        let a = OperationId::from("op-10");
        let b = OperationId::from("op-9");
        assert!(a < b);
    }

    #[test]
    fn lookup_by_str() {
        let set: HashSet<DeviceId> = [DeviceId::from("phone")].into_iter().collect();
        assert!(set.contains("phone"));
        assert_eq!(DeviceId::from("phone").to_string(), "phone");
    }
}
