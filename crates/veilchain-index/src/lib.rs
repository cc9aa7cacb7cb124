//! veilchain-index
//!
//! Two-layer searchable metadata index over the chain, plus a recipient
//! index. The index is derived state living in its own sled database; any
//! layer can be rebuilt from the chain at any time.
//!
//! - **Public layer**: normalized tokens from `category`,
//!   `content_category`, manual keywords, and day-bucketed timestamps,
//!   mapped to plaintext posting lists.
//! - **Private layer**: tokens from block plaintext, keyed by an
//!   HMAC fingerprint under a password-derived master key, with AES-GCM
//!   encrypted posting lists. Without the password neither the terms nor
//!   the postings are recoverable.
//! - **Recipient index**: `recipient_username` is a plaintext block
//!   column, so its posting lists are stored in the clear; the search
//!   engine only consults them for authenticated queries.

pub mod index;
pub mod tokenize;

pub use index::{register_rebuild_handlers, MetadataIndex, RebuildStats};
pub use tokenize::tokenize;
