//! Typed identifiers used on the wire.
//!
//! Every id is an opaque string (serde-transparent). Locally minted ids are
//! UUID v4, but peers may send any non-empty string and it is kept verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing token.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Mint a fresh random id.
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Envelope id. Unique per sender per connection lifetime.
    MessageId
);
typed_id!(
    /// Logical session id, minted by the side that sends `SessionInit`.
    SessionId
);
typed_id!(
    /// One generation task inside a session.
    TaskId
);
typed_id!(
    /// Correlation key for anything awaiting a reply: tool calls,
    /// confirmations and session establishment.
    RequestId
);

impl RequestId {
    /// Session establishment is correlated on the session id itself, since
    /// `SessionReady` echoes it back.
    pub fn for_session(session_id: &SessionId) -> Self {
        Self(session_id.as_str().to_owned())
    }
}
