//! Strongly-typed identifiers used across the domain.
//!
//! Directory-owned ids (company, warehouse, product, supplier, actor) are opaque:
//! this system never derives them, it only receives them from collaborators.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

uuid_newtype!(
    /// Tenant boundary. Every query and write is scoped by it.
    CompanyId,
    "CompanyId"
);
uuid_newtype!(WarehouseId, "WarehouseId");
uuid_newtype!(ProductId, "ProductId");
uuid_newtype!(SupplierId, "SupplierId");
uuid_newtype!(
    /// The authenticated actor, supplied explicitly by the identity collaborator.
    ActorId,
    "ActorId"
);
uuid_newtype!(LotId, "LotId");
uuid_newtype!(
    /// Ledger entry id. Time-ordered, so it also breaks ties on equal movement dates.
    MovementId,
    "MovementId"
);
uuid_newtype!(DocumentId, "DocumentId");
uuid_newtype!(ClosureId, "ClosureId");
uuid_newtype!(
    /// Shared by the outbound and inbound legs of one inventory transfer.
    TransferCorrelationId,
    "TransferCorrelationId"
);
