//! Asset Filtering
//!
//! Recognizes BLE-advertising devices ("assets") the node is configured to
//! track. Operators upload a versioned set of filters; every scanned
//! advertisement is run through the committed set and accepted assets are
//! forwarded over the mesh, throttled per asset.
//!
//! ## Components
//!
//! - [`store::AssetFilterStore`] owns the filter RAM and the
//!   upload/remove/commit transaction.
//! - [`engine::AssetFilterEngine`] applies committed filters to scanned
//!   advertisements.
//! - [`records::AssetRecords`] tracks recently accepted assets for
//!   throttling.
//! - [`forward::MeshForwarder`] turns acceptances into mesh messages.
//!
//! Filter bodies are either cuckoo filters (see [`crate::cuckoo`]) or
//! exact-match sets; both are addressed through the tagged
//! [`filter::FilterBody`] enum.

pub mod engine;
pub mod exact;
pub mod filter;
pub mod forward;
pub mod records;
pub mod store;

pub use engine::AssetFilterEngine;
pub use exact::{encode_exact_match_body, ExactMatchView};
pub use filter::{FilterBody, FilterMetadata, FilterType, InputSelector, OutputFormat};
pub use forward::{AssetForwarder, MeshForwarder};
pub use records::{AssetRecord, AssetRecords, AssetStore};
pub use store::{
    AssetFilter, AssetFilterStore, CommitFilterChangesCommand, FilterSummaries, FilterSummary,
    RemoveFilterCommand, UploadFilterCommand,
};

/// Maximum number of filters the store holds.
pub const MAX_FILTER_IDS: usize = 8;

/// Total RAM budget for filter payloads, in bytes.
pub const FILTER_BUFFER_SIZE: usize = 512;

/// Protocol version of the filter command set.
pub const FILTER_PROTOCOL_VERSION: u8 = 0;

#[cfg(test)]
mod tests;
