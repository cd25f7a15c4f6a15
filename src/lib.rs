// Resource descriptors and URL/query construction
pub mod catalog;

// TOML configuration
pub mod config;

// Encrypted credential cache
pub mod credentials;

pub mod error;

// Wire record to canonical entity mapping
pub mod mapper;

// Listing pagination
pub mod paginator;

// ALM session handshake and token bag
pub mod session;

// SQLite entity store
pub mod store;

// Fetch-and-store entry point
pub mod sync;

// Retrying HTTP transport
pub mod transport;

pub use catalog::ResourceType;
pub use config::SyncConfig;
pub use error::{FetchError, FetchResult};
pub use mapper::{CanonicalEntity, RawRecord, StorageKind};
pub use sync::{ProjectScope, SyncEngine, SyncResult};
