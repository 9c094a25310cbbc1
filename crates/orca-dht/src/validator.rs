//! Validation of records arriving through STORE

use orca_core::{Error, PeerAddress, Result};

/// Decides whether a value may be stored under a key
///
/// Runs on every incoming STORE and on local puts.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, key: &str, value: &str) -> Result<()>;
}

/// Accepts every record
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RecordValidator for AcceptAll {
    fn validate(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

/// Accepts only values that parse as `host:port`
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressValues;

impl RecordValidator for AddressValues {
    fn validate(&self, key: &str, value: &str) -> Result<()> {
        value
            .parse::<PeerAddress>()
            .map(|_| ())
            .map_err(|e| Error::Validation(format!("record {}: {}", key, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.validate("orca/x", "anything at all").is_ok());
    }

    #[test]
    fn test_address_values() {
        assert!(AddressValues.validate("orca/x", "127.0.0.1:8080").is_ok());
        assert!(matches!(
            AddressValues.validate("orca/x", "not an address"),
            Err(Error::Validation(_))
        ));
    }
}
