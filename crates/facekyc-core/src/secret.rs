use std::fmt;

use zeroize::Zeroizing;

use crate::errors::{AppError, AppResult};

/// Caller-supplied secret used to key the embedding cipher.
///
/// Provisioning happens outside this crate; the bytes are wiped on drop and
/// never appear in `Debug` output.
#[derive(Clone)]
pub struct SecretKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl SecretKey {
    pub fn from_bytes(bytes: Vec<u8>) -> AppResult<Self> {
        if bytes.is_empty() {
            return Err(AppError::MissingKey);
        }
        Ok(Self {
            bytes: Zeroizing::new(bytes),
        })
    }

    pub fn from_passphrase(passphrase: &str) -> AppResult<Self> {
        Self::from_bytes(passphrase.as_bytes().to_vec())
    }

    /// Resolves an optional key handed over at service construction.
    pub fn require(bytes: Option<Vec<u8>>) -> AppResult<Self> {
        bytes.ok_or(AppError::MissingKey).and_then(Self::from_bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            SecretKey::from_bytes(Vec::new()),
            Err(AppError::MissingKey)
        ));
        assert!(matches!(
            SecretKey::from_passphrase(""),
            Err(AppError::MissingKey)
        ));
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let err = SecretKey::require(None).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Configuration);
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let key = SecretKey::from_passphrase("hunter2").unwrap();
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("len: 7"));
        assert_eq!(key.len(), 7);
    }
}
