//! Identifier newtypes shared across the log, materializer and matrix.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// A logical editing session; owns one ordered log.
    SessionId
);

string_id!(
    /// A code unit (function, class, script) tracked by the log.
    UnitId
);

string_id!(
    /// An edge between two unit ports.
    ConnectionId
);

impl SessionId {
    /// Fresh random session id (`session-<uuid>`).
    pub fn generate() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    /// Usable as a bare file name: ASCII letters, digits, `-`, `_` and `.`,
    /// not starting with `.`.
    pub fn is_file_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_SESSION_ID_LEN
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

const MAX_SESSION_ID_LEN: usize = 128;

impl UnitId {
    pub fn generate() -> Self {
        Self(format!("unit-{}", Uuid::new_v4()))
    }
}

impl ConnectionId {
    pub fn generate() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }
}

/// Handle for a queued execution request; used to cancel it while pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
