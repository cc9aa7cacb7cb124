//! veilchain-search
//!
//! Query layer over the chain and the metadata index. Three strategies:
//!
//! - **FastPublic** — public index lookups only.
//! - **AuthenticatedPrivate** — public plus password-derived private-layer
//!   lookups and the recipient index.
//! - **DeepContent** — the above plus a linear content scan over on-chain
//!   data (decrypting what the password opens) and off-chain blobs below a
//!   size threshold; supports cancellation and returns partial results
//!   flagged as truncated.
//!
//! The router picking the strategy is a pure function of the query; the
//! engine takes its collaborators at construction and has no lazily
//! initialized variant.

pub mod engine;
pub mod router;

pub use engine::{MatchOrigin, SearchEngine, SearchHit, SearchQuery, SearchResults};
pub use router::{route, QueryHints, SearchMode};
