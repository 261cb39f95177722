//! Unique identifiers for skein records.
//!
//! All IDs wrap a v4 UUID and print with a short kind prefix so they can be
//! told apart in log lines.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Create from UUID bytes
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Get as UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Step identifier - one schedulable unit of work
    StepId,
    "step"
);

uuid_id!(
    /// Block identifier - the sibling set a step belongs to
    BlockId,
    "blk"
);

uuid_id!(
    /// Poll cycle identifier, written as a shard heartbeat token
    CycleId,
    "cyc"
);

uuid_id!(
    /// Worker identifier - one polling worker
    WorkerId,
    "worker"
);

uuid_id!(
    /// Claim token - proves ownership of a Running step
    ///
    /// A fresh token is minted on every successful claim, so a worker whose
    /// claim was revoked (forced failure, lease expiry) cannot commit.
    ClaimToken,
    "claim"
);
