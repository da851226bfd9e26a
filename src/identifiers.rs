//! Type-safe identifiers.
//!
//! Newtype wrappers over UUID v4 keep stream tokens, caller identities and
//! connection ids from being mixed up at compile time. All of them are
//! minted locally and never reused.
//!
//! [`StreamRef`] can only be obtained from [`StreamRef::generate`]: it has no
//! `From<Uuid>` or `Deserialize`, so a token cannot be rebuilt from its text.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// ============================================================================
// Macro
// ============================================================================

macro_rules! uuid_identifier {
    (@opaque $(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            #[inline]
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the underlying UUID.
            #[inline]
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };

    ($(#[$meta:meta])* $name:ident) => {
        uuid_identifier!(@opaque $(#[$meta])* $name);

        impl From<Uuid> for $name {
            #[inline]
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                Uuid::deserialize(deserializer).map(Self)
            }
        }
    };
}

// ============================================================================
// Identifiers
// ============================================================================

uuid_identifier!(
    @opaque
    /// Correlation token for one request/response exchange.
    ///
    /// Minted by [`Connection::request`](crate::Connection::request) and
    /// carried by every event belonging to that stream.
    StreamRef
);

uuid_identifier!(
    /// Identity of a task driving a connection.
    CallerId
);

uuid_identifier!(
    /// Identity of a supervised connection actor.
    ConnectionId
);

// ============================================================================
// Tests
// ============================================================================
