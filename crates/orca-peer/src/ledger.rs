//! Payment transactions and the audit trail
//!
//! A [`Wallet`] signs [`Transaction`]s; the receiving node's [`Ledger`]
//! verifies each [`SignedSubmission`] and writes every attempt, accepted or
//! not, to its own file under `transactions/`, named by the time it arrived.

use crate::api::base64_bytes;
use chrono::{DateTime, Utc};
use orca_core::keys::{public_key_from_pem, verify};
use orca_core::{Error, Keypair, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A payment from one wallet to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub uuid: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
}

impl Transaction {
    pub fn new(price: f64, sender_id: impl Into<String>, receiver_id: impl Into<String>) -> Self {
        Self {
            price,
            timestamp: Utc::now(),
            uuid: Uuid::new_v4(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
        }
    }

    /// Canonical bytes that get signed
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Protocol(format!("encode transaction: {}", e)))
    }
}

/// A transaction as it travels to the receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSubmission {
    /// Signature over `transaction`
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    /// Serialized [`Transaction`]
    #[serde(with = "base64_bytes")]
    pub transaction: Vec<u8>,
    /// Signer's verifying key as SPKI PEM
    pub public_key: String,
}

/// Holds the key that signs outgoing payments
pub struct Wallet {
    keypair: Keypair,
}

impl Wallet {
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        Ok(Self {
            keypair: Keypair::load_or_generate(path)?,
        })
    }

    pub fn generate() -> Result<Self> {
        Ok(Self {
            keypair: Keypair::generate()?,
        })
    }

    /// Wallet identifier: hex SHA-256 of the verifying key
    pub fn id(&self) -> String {
        orca_core::hash_to_hex(&self.keypair.node_id())
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.keypair.sign(bytes)
    }

    /// Build and sign a payment to `receiver_id`
    pub fn pay(&self, price: f64, receiver_id: &str) -> Result<(Transaction, SignedSubmission)> {
        let transaction = Transaction::new(price, self.id(), receiver_id);
        let submission = self.sign_transaction(&transaction)?;
        Ok((transaction, submission))
    }

    pub fn sign_transaction(&self, transaction: &Transaction) -> Result<SignedSubmission> {
        let bytes = transaction.to_bytes()?;
        Ok(SignedSubmission {
            bytes: self.sign(&bytes),
            transaction: bytes,
            public_key: self.keypair.public_key_pem()?,
        })
    }
}

/// Result of checking one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    InvalidSignature,
    Malformed,
}

impl Outcome {
    /// Status string reported to the submitter
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted => crate::api::STATUS_ACCEPTED,
            Outcome::InvalidSignature => crate::api::STATUS_INVALID_SIGNATURE,
            Outcome::Malformed => crate::api::STATUS_MALFORMED,
        }
    }
}

/// What the ledger decided about a submission
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub outcome: Outcome,
    /// Present only when accepted
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Transaction uuid when accepted, otherwise a fresh one
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub transaction: Option<Transaction>,
    /// Hex signature as submitted
    pub signature: String,
    pub public_key: String,
}

/// Verifies submissions and keeps the audit trail
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Verify a submission and record the attempt
    ///
    /// Only a failure to write the audit record is an error; rejected
    /// submissions come back as a [`Receipt`] with the reason.
    pub fn submit(&self, submission: &SignedSubmission) -> Result<Receipt> {
        let receipt = check(submission);

        let record = AuditRecord {
            id: receipt
                .transaction
                .as_ref()
                .map(|t| t.uuid)
                .unwrap_or_else(Uuid::new_v4),
            received_at: Utc::now(),
            outcome: receipt.outcome,
            transaction: receipt.transaction.clone(),
            signature: hex::encode(&submission.bytes),
            public_key: submission.public_key.clone(),
        };
        self.write(&record)?;

        match receipt.outcome {
            Outcome::Accepted => tracing::info!(
                "Accepted transaction {}",
                receipt.transaction.as_ref().map(|t| t.uuid.to_string()).unwrap_or_default()
            ),
            other => tracing::warn!("Rejected transaction: {:?}", other),
        }
        Ok(receipt)
    }

    /// Record a submission that could not even be parsed
    pub fn record_unparsable(&self, raw: &[u8]) -> Result<Receipt> {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            outcome: Outcome::Malformed,
            transaction: None,
            signature: String::new(),
            public_key: String::from_utf8_lossy(raw).chars().take(256).collect(),
        };
        self.write(&record)?;
        tracing::warn!("Rejected unparsable transaction submission");
        Ok(Receipt {
            outcome: Outcome::Malformed,
            transaction: None,
        })
    }

    /// Audit file for a submission received at `at`
    ///
    /// Names sort in arrival order.
    pub fn audit_path(&self, at: DateTime<Utc>, id: &Uuid) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", at.format("%Y%m%dT%H%M%S%.9fZ"), id))
    }

    fn write(&self, record: &AuditRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::Protocol(format!("encode audit record: {}", e)))?;

        let path = self.audit_path(record.received_at, &record.id);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        tracing::debug!("Wrote audit record {}", path.display());
        Ok(())
    }

    /// Every audit record on disk, oldest first
    pub fn records(&self) -> Result<Vec<AuditRecord>> {
        let mut paths: Vec<_> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let content = std::fs::read(&path)?;
            let record = serde_json::from_slice(&content).map_err(|e| {
                Error::Protocol(format!("{}: bad audit record: {}", path.display(), e))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

fn check(submission: &SignedSubmission) -> Receipt {
    let rejected = |outcome| Receipt {
        outcome,
        transaction: None,
    };

    let Ok(public_key) = public_key_from_pem(&submission.public_key) else {
        return rejected(Outcome::Malformed);
    };
    if !verify(&submission.bytes, &submission.transaction, &public_key) {
        return rejected(Outcome::InvalidSignature);
    }
    match serde_json::from_slice::<Transaction>(&submission.transaction) {
        Ok(transaction) => Receipt {
            outcome: Outcome::Accepted,
            transaction: Some(transaction),
        },
        Err(_) => rejected(Outcome::Malformed),
    }
}
