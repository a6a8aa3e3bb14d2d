//! Prefixed ID plumbing shared by every ID the orchestrator mints.
//!
//! An ID renders as `{prefix}_{ulid}`, e.g. `task_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//! The prefix keeps a task ID from being accepted where a broadcast ID is
//! expected once both have been flattened into logs or event payloads.

use crate::{IdError, Ulid};

/// A ULID-backed ID with a fixed textual prefix.
pub trait PrefixedId: Sized {
    const PREFIX: &'static str;

    fn from_ulid(ulid: Ulid) -> Self;

    /// Parse the `{prefix}_{ulid}` form.
    fn parse_prefixed(s: &str) -> Result<Self, IdError> {
        let (prefix, ulid) = s
            .split_once('_')
            .ok_or(if s.is_empty() { IdError::Empty } else { IdError::MissingSeparator })?;

        if prefix != Self::PREFIX {
            return Err(IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_owned(),
            });
        }

        Ulid::from_string(ulid)
            .map(Self::from_ulid)
            .map_err(|e| IdError::InvalidUlid(e.to_string()))
    }
}

/// Declare a [`PrefixedId`] newtype with `Display`, `FromStr` and string serde.
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// Mint a fresh ID; IDs minted later sort later.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }
        }

        impl $crate::PrefixedId for $name {
            const PREFIX: &'static str = $prefix;

            fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <Self as $crate::PrefixedId>::parse_prefixed(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}
