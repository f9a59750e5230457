//! Catalog module
//!
//! What this peer shares and what the rest of the network shares.

pub mod entry;
pub mod local;
pub mod network;

pub use entry::ContentEntry;
pub use local::{digest_for_folder, hash_file, LocalCatalog, ResolvedContent};
pub use network::{CatalogSnapshot, NetworkCatalog, NetworkListing};
