//! Reader facade.
//!
//! Ties the metadata parser, search tree walker, and data decoder together
//! behind a single handle. The buffer is loaded once at open time (memory
//! map for plain files, owned buffer for `.gz` files and `from_bytes`) and
//! is immutable for the reader's lifetime; lookups are pure reads over it.

use crate::data_section::{DataValue, Decoder};
use crate::error::{MmdbError, Result};
use crate::metadata::{find_metadata_start, Metadata, METADATA_MARKER};
use crate::tree::SearchTree;
use flate2::read::GzDecoder;
use lru::LruCache;
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

/// Backing storage for the database bytes
enum Storage {
    Owned(Vec<u8>),
    Mmap(Mmap),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(v) => v.as_slice(),
            Storage::Mmap(m) => &m[..],
        }
    }
}

/// Options for opening a database
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Maximum number of decoded lookup results to keep in an LRU cache,
    /// keyed by normalized address. Zero (the default) disables caching.
    pub cache_max: usize,
}

impl ReaderOptions {
    /// Create default options (no cache)
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the lookup-result cache at `max` entries
    pub fn with_cache_max(mut self, max: usize) -> Self {
        self.cache_max = max;
        self
    }
}

/// An open MMDB database
///
/// Cheap to query from many threads: the buffer is read-only after open and
/// the only internal mutable state is the optional mutex-guarded result
/// cache. Parse failures fail `open` entirely; a constructed `Reader` is
/// always fully usable. Per-lookup decode failures fail that lookup only.
pub struct Reader {
    storage: Storage,
    metadata: Metadata,
    /// End of the data section: the metadata marker offset
    data_section_end: usize,
    cache: Option<Mutex<LruCache<IpAddr, Option<DataValue>>>>,
}

impl Reader {
    /// Open a database file with default options.
    ///
    /// Plain files are memory-mapped. A path ending in `.gz`
    /// (case-insensitive) is read and decompressed into memory instead,
    /// since a compressed stream cannot be mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ReaderOptions::default())
    }

    /// Open a database file with explicit options
    pub fn open_with<P: AsRef<Path>>(path: P, options: ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            MmdbError::Open(format!("failed to open {}: {}", path.display(), e))
        })?;

        let is_gzip = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("gz"))
            .unwrap_or(false);

        let storage = if is_gzip {
            let mut buffer = Vec::new();
            GzDecoder::new(file).read_to_end(&mut buffer).map_err(|e| {
                MmdbError::Open(format!("failed to decompress {}: {}", path.display(), e))
            })?;
            Storage::Owned(buffer)
        } else {
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                MmdbError::Open(format!("failed to map {}: {}", path.display(), e))
            })?;
            Storage::Mmap(mmap)
        };

        Self::from_storage(storage, options)
    }

    /// Open a database held in an owned byte buffer with default options
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_bytes_with(bytes, ReaderOptions::default())
    }

    /// Open a database held in an owned byte buffer with explicit options
    pub fn from_bytes_with(bytes: Vec<u8>, options: ReaderOptions) -> Result<Self> {
        Self::from_storage(Storage::Owned(bytes), options)
    }

    fn from_storage(storage: Storage, options: ReaderOptions) -> Result<Self> {
        let data = storage.as_slice();

        let metadata_start = find_metadata_start(data)?;
        let metadata = Metadata::parse(&data[metadata_start..])?;

        // The tree, separator, and data section must all fit below the
        // metadata marker.
        let data_section_end = metadata_start - METADATA_MARKER.len();
        if metadata.data_section_start() > data_section_end {
            return Err(MmdbError::Format(format!(
                "search tree of {} bytes overruns the data section",
                metadata.search_tree_size()
            )));
        }

        let cache = NonZeroUsize::new(options.cache_max)
            .map(|max| Mutex::new(LruCache::new(max)));

        Ok(Self {
            storage,
            metadata,
            data_section_end,
            cache,
        })
    }

    /// Database metadata parsed at open time
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up an address.
    ///
    /// Returns `Ok(None)` when no network in the database covers the
    /// address; that is a normal outcome, not an error.
    pub fn get(&self, addr: IpAddr) -> Result<Option<DataValue>> {
        let addr = normalize(addr);

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&addr) {
                return Ok(hit.clone());
            }
        }

        let resolved = self
            .lookup_uncached(addr)?
            .map(|(value, _prefix_len)| value);

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.put(addr, resolved.clone());
        }

        Ok(resolved)
    }

    /// Look up an address given as a string.
    ///
    /// A string that does not parse as an IP address is reported as
    /// `Unknown`, carrying the parser's message.
    pub fn get_str(&self, addr: &str) -> Result<Option<DataValue>> {
        let addr: IpAddr = addr
            .parse()
            .map_err(|e: std::net::AddrParseError| MmdbError::Unknown(e.to_string()))?;
        self.get(addr)
    }

    /// Strict lookup: an absent address is an `AddressNotFound` error.
    ///
    /// This is the only surface that raises `AddressNotFound`.
    pub fn get_strict(&self, addr: IpAddr) -> Result<DataValue> {
        self.get(addr)?.ok_or_else(|| {
            MmdbError::AddressNotFound(format!("address {} not found in database", addr))
        })
    }

    /// Look up an address and report the matched network's prefix length
    /// alongside the value. Bypasses the result cache.
    pub fn get_with_prefix_len(&self, addr: IpAddr) -> Result<Option<(DataValue, u8)>> {
        self.lookup_uncached(normalize(addr))
    }

    /// Release the reader and its underlying buffer or mapping.
    ///
    /// Equivalent to dropping the value; provided so callers can make the
    /// release explicit.
    pub fn close(self) {}

    fn lookup_uncached(&self, addr: IpAddr) -> Result<Option<(DataValue, u8)>> {
        let data = self.storage.as_slice();
        let tree = SearchTree::new(data, &self.metadata);

        let hit = match tree.lookup(addr)? {
            Some(hit) => hit,
            None => return Ok(None),
        };

        let section = &data[self.metadata.data_section_start()..self.data_section_end];
        if hit.data_offset >= section.len() {
            return Err(MmdbError::InvalidDatabase(format!(
                "data record points {} bytes into a {}-byte data section",
                hit.data_offset,
                section.len()
            )));
        }

        let value = Decoder::new(section).decode(hit.data_offset)?;
        Ok(Some((value, hit.prefix_len)))
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("database_type", &self.metadata.database_type)
            .field("node_count", &self.metadata.node_count)
            .field("size", &self.storage.as_slice().len())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

/// Canonicalize IPv4-mapped IPv6 addresses to IPv4 so `::ffff:1.2.3.4` and
/// `1.2.3.4` share a cache slot and resolve identically.
fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            if segments[..5] == [0, 0, 0, 0, 0] && segments[5] == 0xFFFF {
                let octets = v6.octets();
                IpAddr::V4(std::net::Ipv4Addr::new(
                    octets[12], octets[13], octets[14], octets[15],
                ))
            } else {
                addr
            }
        }
        v4 => v4,
    }
}
