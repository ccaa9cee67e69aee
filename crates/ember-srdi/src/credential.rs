//! Credentials attached to outgoing index messages.

use ember_core::NetworkKey;
use ember_proto::{SrdiMessage, SrdiMessageError};

/// Signs outgoing and checks incoming index messages.
pub trait CredentialProvider: Send + Sync {
    /// Attaches a credential.
    fn sign(&self, message: &mut SrdiMessage);

    /// Checks the attached credential.
    fn verify(&self, message: &SrdiMessage) -> Result<(), SrdiMessageError>;
}

/// Credential derived from the shared network key.
#[derive(Debug, Clone)]
pub struct NetworkCredential {
    key: NetworkKey,
}

impl NetworkCredential {
    /// Creates a provider for `key`.
    pub fn new(key: NetworkKey) -> Self {
        Self { key }
    }
}

impl CredentialProvider for NetworkCredential {
    fn sign(&self, message: &mut SrdiMessage) {
        message.sign(&self.key);
    }

    fn verify(&self, message: &SrdiMessage) -> Result<(), SrdiMessageError> {
        message.verify(&self.key)
    }
}
