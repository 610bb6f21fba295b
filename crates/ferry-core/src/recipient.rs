//! Recipient descriptors supplied by discovery.

use crate::error::{FerryError, Result};
use ferry_crypto::identity::IdentityPublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest accepted recipient id, display name or address
const MAX_FIELD_LEN: usize = 256;

/// Stable identifier of a recipient device
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipientId(String);

impl RecipientId {
    /// Wrap a discovery identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipientId({})", self.0)
    }
}

impl From<&str> for RecipientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One recipient of a transfer; immutable for the transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientDescriptor {
    /// Discovery identifier
    pub id: RecipientId,
    /// Human-readable name
    pub display_name: String,
    /// Opaque addressing information for the transport substrate
    pub address: String,
    /// Identity the recipient is expected to sign its handshake with
    pub identity: Option<IdentityPublicKey>,
}

impl RecipientDescriptor {
    /// Descriptor without a pinned identity.
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: RecipientId::new(id),
            display_name: display_name.into(),
            address: address.into(),
            identity: None,
        }
    }

    /// Pin the recipient's identity key.
    #[must_use]
    pub fn with_identity(mut self, identity: IdentityPublicKey) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Validate the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Validation`] for an empty or oversized id,
    /// an oversized name or address, or control characters.
    pub fn validate(&self) -> Result<()> {
        let id = self.id.as_str();
        if id.trim().is_empty() {
            return Err(FerryError::validation("recipient id is empty"));
        }
        for (field, value) in [
            ("id", id),
            ("display name", self.display_name.as_str()),
            ("address", self.address.as_str()),
        ] {
            if value.len() > MAX_FIELD_LEN {
                return Err(FerryError::validation(format!(
                    "recipient {field} exceeds {MAX_FIELD_LEN} bytes"
                )));
            }
            if value.chars().any(char::is_control) {
                return Err(FerryError::validation(format!(
                    "recipient {field} contains control characters"
                )));
            }
        }
        Ok(())
    }
}

/// Validate a recipient list: non-empty, each valid, ids unique.
///
/// # Errors
///
/// Returns [`FerryError::Validation`] on the first problem found.
pub fn validate_recipients(recipients: &[RecipientDescriptor]) -> Result<()> {
    if recipients.is_empty() {
        return Err(FerryError::validation("no recipients"));
    }
    let mut seen = std::collections::HashSet::new();
    for recipient in recipients {
        recipient.validate()?;
        if !seen.insert(&recipient.id) {
            return Err(FerryError::validation(format!(
                "duplicate recipient {}",
                recipient.id
            )));
        }
    }
    Ok(())
}
