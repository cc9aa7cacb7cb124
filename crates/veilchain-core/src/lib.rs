//! veilchain-core
//!
//! Shared data model for the Veilchain ledger: blocks, authorized keys,
//! recovery checkpoints, configuration, limits, and the workspace-wide
//! error taxonomy. Everything here is a plain value type; behaviour lives
//! in the engine crates.

pub mod block;
pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod constants;
pub mod error;
pub mod keys;
pub mod types;

pub use block::{Block, OffChainRef};
pub use cancel::CancelToken;
pub use checkpoint::{CheckpointStatus, RecoveryCheckpoint};
pub use config::{EncryptionConfig, KeyLength, LedgerLimits};
pub use error::LedgerError;
pub use keys::{AuthorizedKey, DeletedKeyRecord, KeyDeletionImpact};
pub use types::{canonical_timestamp, truncate_to_micros, Timestamp};
