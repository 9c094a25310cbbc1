//! Orca Peer Library
//!
//! This library provides the node side of Orca: the two-tier content store,
//! the confirmation-gated HTTP transfer server and client, the transaction
//! ledger, and the glue that publishes content locations in the overlay.

pub mod api;
pub mod client;
pub mod config;
pub mod confirm;
pub mod content_store;
pub mod ledger;
pub mod name_index;
pub mod network;
pub mod server;

pub use client::TransferClient;
pub use config::Config;
pub use confirm::{ConfirmationGate, ConfirmationRequest, Decision, TransferKind};
pub use content_store::{ContentStore, StoreLimits};
pub use ledger::{Ledger, Outcome, Receipt, SignedSubmission, Transaction, Wallet};
pub use name_index::{NameEntry, NameIndex};
pub use server::ServerState;
