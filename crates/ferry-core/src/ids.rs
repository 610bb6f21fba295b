//! Identifiers.

use crate::error::{FerryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! random_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 16]);

        impl $name {
            /// Fresh random identifier.
            ///
            /// # Errors
            ///
            /// Fails if the system RNG is unavailable.
            pub fn generate() -> Result<Self> {
                let mut id = [0u8; 16];
                getrandom::getrandom(&mut id)
                    .map_err(|e| FerryError::Io(format!("random id: {e}")))?;
                Ok(Self(id))
            }

            /// Wrap raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            /// Raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(&self.0[..8]))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

random_id!(
    /// Identifies one sender-to-recipient file transfer
    TransferId
);

random_id!(
    /// Identifies one multi-recipient transfer
    GroupId
);
