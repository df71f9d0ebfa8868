//! Promotion pipeline for the encrypted blob cache.
//!
//! Files written to the rotation-destroyed ephemeral tier survive rotation
//! only by being promoted into the durable tier. Promotion is fail-closed:
//! every byte that becomes durable is validated against the whitelist oracle
//! before and after staging, and the final write is an atomic rename.
//!
//! - `engine`: single-file validate-and-copy pipeline
//! - `batch`: delayed background queue forwarding batches to the authority
//! - `authority`: promote-files RPC client, server router, token derivation

pub mod authority;
pub mod batch;
pub mod engine;

pub use authority::{
    AuthorityClient, PromoteFilesResponse, authority_router, derive_promotion_token,
};
pub use batch::{BatchCachePromoter, PromotionTask};
pub use engine::{BatchOutcome, PromoteError, PromoteOutcome, PromotionEngine};
