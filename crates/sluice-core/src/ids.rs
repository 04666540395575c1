use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Declares a string-backed identifier. Generated values carry a short
/// prefix; values handed to us by a collaborator are wrapped verbatim.
macro_rules! prefixed_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

prefixed_id!(SessionId, "sess");
prefixed_id!(MessageId, "msg");
prefixed_id!(ReplicaId, "replica");
prefixed_id!(LeaseToken, "lease");

impl ReplicaId {
    /// Identity of this process: `HOSTNAME` when the orchestrator sets it,
    /// otherwise a generated id.
    pub fn from_env() -> Self {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .map(Self)
            .unwrap_or_else(Self::generate)
    }
}
