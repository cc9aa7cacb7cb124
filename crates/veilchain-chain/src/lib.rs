//! veilchain-chain
//!
//! The chain engine: append, per-block and whole-chain validation, and the
//! authorized-key lifecycle. A process holds one engine; a readers-writer
//! lock serializes the single logical writer against concurrent readers.

pub mod cache;
pub mod canonical;
pub mod engine;
pub mod genesis;
pub mod validation;

pub use cache::EncryptedBlocksCache;
pub use engine::{AppendOptions, ChainEngine};
pub use validation::{BlockStatus, BlockValidation, ChainReport};
