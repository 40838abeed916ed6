//! mmdbkit - Reader and Writer for MaxMind DB Files
//!
//! mmdbkit parses the MMDB binary container format (search tree, data
//! section, metadata) and answers point lookups mapping an IP address to a
//! decoded structured value. It also builds databases, so fixtures and
//! custom datasets never leave Rust.
//!
//! # Quick Start
//!
//! ```rust
//! use mmdbkit::{DatabaseBuilder, DataValue, Reader};
//!
//! // Build a small country database
//! let mut builder = DatabaseBuilder::new().with_database_type("GeoIP2-Country");
//! let value = DataValue::Map(vec![(
//!     "country".to_string(),
//!     DataValue::Map(vec![(
//!         "iso_code".to_string(),
//!         DataValue::String("GB".to_string()),
//!     )]),
//! )]);
//! builder.insert_cidr("81.2.69.0/24", value)?;
//! let bytes = builder.build()?;
//!
//! // Query it
//! let reader = Reader::from_bytes(bytes)?;
//! let hit = reader.get_str("81.2.69.142")?.expect("network is present");
//! let iso = hit
//!     .get("country")
//!     .and_then(|c| c.get("iso_code"))
//!     .and_then(|v| v.as_str());
//! assert_eq!(iso, Some("GB"));
//!
//! // Absent addresses are a normal outcome, not an error
//! assert!(reader.get_str("203.0.113.1")?.is_none());
//! # Ok::<(), mmdbkit::MmdbError>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  MMDB File Format                    │
//! ├──────────────────────────────────────┤
//! │  1. Search Tree (binary trie)        │
//! │  2. Data Section (self-describing,   │
//! │     deduplicated via pointers)       │
//! │  3. Metadata marker + metadata map   │
//! └──────────────────────────────────────┘
//!          ↓ mmap() at open
//! ┌──────────────────────────────────────┐
//! │  Memory (read-only, shared)          │
//! │  Lookups are pure reads              │
//! └──────────────────────────────────────┘
//! ```
//!
//! The buffer is immutable once opened, so a `Reader` can serve concurrent
//! lookups without locking; the optional bounded result cache is the only
//! synchronized state.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Module declarations
/// Database writer
pub mod builder;
/// Data section encoding/decoding
pub mod data_section;
/// Error types for database operations
pub mod error;
/// Metadata section parsing
pub mod metadata;
/// Reader facade
pub mod reader;
/// Search tree traversal
pub mod tree;

// Re-exports for consumers

/// Decoded value type for database entries
pub use crate::data_section::{DataValue, Decoder};

/// Database writer
pub use crate::builder::DatabaseBuilder;

pub use crate::error::{MmdbError, Result};
pub use crate::metadata::{IpVersion, Metadata, RecordSize};
pub use crate::reader::{Reader, ReaderOptions};
pub use crate::tree::LookupResult;

// Version information
/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
