//! Database writer.
//!
//! Builds complete MMDB files: a binary search tree over network prefixes,
//! a deduplicated data section, and a trailing metadata map. Longest-prefix
//! semantics are resolved at build time so the reader's single walk per
//! lookup always lands on the most specific covering network.

use crate::data_section::{plain_bytes, DataEncoder, DataValue};
use crate::error::{MmdbError, Result};
use crate::metadata::{IpVersion, RecordSize, DATA_SECTION_SEPARATOR, METADATA_MARKER};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Builder for MMDB database files
///
/// Collects (network, value) entries and assembles the full file with
/// [`DatabaseBuilder::build`]. IPv6 entries switch the tree to IPv6
/// indexing; IPv4 entries are then stored under the ::/96 mapping so both
/// address families resolve.
pub struct DatabaseBuilder {
    entries: Vec<(IpAddr, u8, DataValue)>,
    record_size: RecordSize,
    database_type: String,
    languages: Vec<String>,
    description: Vec<(String, String)>,
}

impl DatabaseBuilder {
    /// Create a builder with 24-bit records and a generic database type
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            record_size: RecordSize::Bits24,
            database_type: "mmdbkit".to_string(),
            languages: vec!["en".to_string()],
            description: Vec::new(),
        }
    }

    /// Use a specific record size (default is 24-bit)
    pub fn with_record_size(mut self, record_size: RecordSize) -> Self {
        self.record_size = record_size;
        self
    }

    /// Set the database type label written to metadata
    pub fn with_database_type(mut self, db_type: impl Into<String>) -> Self {
        self.database_type = db_type.into();
        self
    }

    /// Add a description in a specific language; callable once per language
    pub fn with_description(
        mut self,
        language: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.description.push((language.into(), text.into()));
        self
    }

    /// Add a network with its value
    pub fn insert(&mut self, addr: IpAddr, prefix_len: u8, value: DataValue) -> Result<()> {
        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max_prefix {
            return Err(MmdbError::Format(format!(
                "prefix length {} exceeds {} for {}",
                prefix_len, max_prefix, addr
            )));
        }
        self.entries.push((addr, prefix_len, value));
        Ok(())
    }

    /// Add a network given in CIDR notation; a bare address is a host route
    pub fn insert_cidr(&mut self, network: &str, value: DataValue) -> Result<()> {
        let (addr, prefix_len) = parse_cidr(network)?;
        self.insert(addr, prefix_len, value)
    }

    /// Assemble the database file
    pub fn build(&self) -> Result<Vec<u8>> {
        let needs_v6 = self.entries.iter().any(|(addr, _, _)| addr.is_ipv6());
        let ip_version = if needs_v6 { IpVersion::V6 } else { IpVersion::V4 };

        // Encode values first: section offsets are independent of the tree
        let mut encoder = DataEncoder::new();
        let offsets: Vec<u32> = self
            .entries
            .iter()
            .map(|(_, _, value)| encoder.encode(value))
            .collect();
        let data_section = encoder.into_bytes();

        let mut tree = TreeBuilder::new();
        for ((addr, prefix_len, _), offset) in self.entries.iter().zip(&offsets) {
            let (bits, prefix_len) = match (addr, ip_version) {
                (IpAddr::V4(v4), IpVersion::V4) => {
                    (u128::from(u32::from(*v4)) << 96, *prefix_len)
                }
                (IpAddr::V4(v4), IpVersion::V6) => (u128::from(u32::from(*v4)), 96 + prefix_len),
                (IpAddr::V6(v6), _) => (u128::from(*v6), *prefix_len),
            };
            tree.insert(bits, prefix_len, *offset);
        }

        let (tree_bytes, node_count) = tree.serialize(self.record_size)?;

        let metadata_bytes = plain_bytes(&self.metadata_value(node_count, ip_version));

        let mut database = Vec::with_capacity(
            tree_bytes.len()
                + DATA_SECTION_SEPARATOR
                + data_section.len()
                + METADATA_MARKER.len()
                + metadata_bytes.len(),
        );
        database.extend_from_slice(&tree_bytes);
        database.extend_from_slice(&[0u8; DATA_SECTION_SEPARATOR]);
        database.extend_from_slice(&data_section);
        database.extend_from_slice(METADATA_MARKER);
        database.extend_from_slice(&metadata_bytes);

        Ok(database)
    }

    fn metadata_value(&self, node_count: u32, ip_version: IpVersion) -> DataValue {
        let description = if self.description.is_empty() {
            vec![(
                "en".to_string(),
                DataValue::String(format!("{} database", self.database_type)),
            )]
        } else {
            self.description
                .iter()
                .map(|(lang, text)| (lang.clone(), DataValue::String(text.clone())))
                .collect()
        };

        DataValue::Map(vec![
            (
                "binary_format_major_version".to_string(),
                DataValue::Uint16(2),
            ),
            (
                "binary_format_minor_version".to_string(),
                DataValue::Uint16(0),
            ),
            (
                "build_epoch".to_string(),
                DataValue::Uint64(
                    SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or_default(),
                ),
            ),
            (
                "database_type".to_string(),
                DataValue::String(self.database_type.clone()),
            ),
            ("description".to_string(), DataValue::Map(description)),
            (
                "ip_version".to_string(),
                DataValue::Uint16(match ip_version {
                    IpVersion::V4 => 4,
                    IpVersion::V6 => 6,
                }),
            ),
            (
                "languages".to_string(),
                DataValue::Array(
                    self.languages
                        .iter()
                        .map(|l| DataValue::String(l.clone()))
                        .collect(),
                ),
            ),
            ("node_count".to_string(), DataValue::Uint32(node_count)),
            (
                "record_size".to_string(),
                DataValue::Uint16(self.record_size.bits()),
            ),
        ])
    }
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_cidr(network: &str) -> Result<(IpAddr, u8)> {
    match network.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr
                .parse()
                .map_err(|e| MmdbError::Format(format!("invalid network '{}': {}", network, e)))?;
            let prefix_len: u8 = prefix
                .parse()
                .map_err(|e| MmdbError::Format(format!("invalid prefix '{}': {}", network, e)))?;
            Ok((addr, prefix_len))
        }
        None => {
            let addr: IpAddr = network
                .parse()
                .map_err(|e| MmdbError::Format(format!("invalid address '{}': {}", network, e)))?;
            let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
            Ok((addr, prefix_len))
        }
    }
}

/// A tree slot: empty, an interior node, or a data leaf.
///
/// Data leaves track their prefix length so later inserts can tell whether
/// an existing leaf is more or less specific than the incoming one; the
/// length never reaches the serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Node(u32),
    Data(u32, u8),
}

#[derive(Debug, Clone)]
struct Node {
    left: Slot,
    right: Slot,
}

impl Node {
    fn empty() -> Self {
        Self {
            left: Slot::Empty,
            right: Slot::Empty,
        }
    }

    fn slot(&self, bit: u8) -> Slot {
        if bit == 0 {
            self.left
        } else {
            self.right
        }
    }

    fn set_slot(&mut self, bit: u8, slot: Slot) {
        if bit == 0 {
            self.left = slot;
        } else {
            self.right = slot;
        }
    }
}

/// Arena-allocated search tree under construction
struct TreeBuilder {
    nodes: Vec<Node>,
}

impl TreeBuilder {
    fn new() -> Self {
        Self {
            nodes: vec![Node::empty()],
        }
    }

    /// Insert a network. `bits` is MSB-aligned within 128 bits regardless of
    /// tree depth; `prefix_len` counts from the most significant bit.
    fn insert(&mut self, bits: u128, prefix_len: u8, data_offset: u32) {
        if prefix_len == 0 {
            // Default route: covers every slot the tree will ever branch to
            self.backfill(0, data_offset, 0);
            return;
        }

        let mut node_id = 0u32;
        for depth in 0..prefix_len {
            let bit = ((bits >> (127 - depth)) & 1) as u8;
            let slot = self.nodes[node_id as usize].slot(bit);

            if depth + 1 == prefix_len {
                match slot {
                    Slot::Empty => {
                        self.nodes[node_id as usize].set_slot(bit, Slot::Data(data_offset, prefix_len));
                    }
                    Slot::Data(_, existing_prefix) => {
                        // Equal or more specific replaces; an existing more
                        // specific leaf at the same slot wins.
                        if prefix_len >= existing_prefix {
                            self.nodes[node_id as usize]
                                .set_slot(bit, Slot::Data(data_offset, prefix_len));
                        }
                    }
                    Slot::Node(child) => {
                        // More specific networks already branch below this
                        // slot; fill only the gaps they left.
                        self.backfill(child, data_offset, prefix_len);
                    }
                }
                return;
            }

            match slot {
                Slot::Node(child) => node_id = child,
                Slot::Empty => {
                    let child = self.allocate();
                    self.nodes[node_id as usize].set_slot(bit, Slot::Node(child));
                    node_id = child;
                }
                Slot::Data(existing_offset, existing_prefix) => {
                    // A less specific network occupies the path. Split it:
                    // both children inherit the existing leaf, then continue
                    // down to place the more specific one.
                    let child = self.allocate();
                    self.nodes[child as usize].left = Slot::Data(existing_offset, existing_prefix);
                    self.nodes[child as usize].right = Slot::Data(existing_offset, existing_prefix);
                    self.nodes[node_id as usize].set_slot(bit, Slot::Node(child));
                    node_id = child;
                }
            }
        }
    }

    /// Fill empty and less-specific slots of a subtree with `data_offset`,
    /// leaving more specific leaves untouched.
    fn backfill(&mut self, node_id: u32, data_offset: u32, prefix_len: u8) {
        for bit in 0..2u8 {
            match self.nodes[node_id as usize].slot(bit) {
                Slot::Empty => {
                    self.nodes[node_id as usize].set_slot(bit, Slot::Data(data_offset, prefix_len));
                }
                Slot::Data(_, existing_prefix) => {
                    if prefix_len > existing_prefix {
                        self.nodes[node_id as usize]
                            .set_slot(bit, Slot::Data(data_offset, prefix_len));
                    }
                }
                Slot::Node(child) => self.backfill(child, data_offset, prefix_len),
            }
        }
    }

    fn allocate(&mut self) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(Node::empty());
        id
    }

    /// Serialize the arena into the on-disk tree section
    fn serialize(&self, record_size: RecordSize) -> Result<(Vec<u8>, u32)> {
        let node_count = self.nodes.len() as u32;
        let max_record = match record_size {
            RecordSize::Bits24 => (1u32 << 24) - 1,
            RecordSize::Bits28 => (1u32 << 28) - 1,
            RecordSize::Bits32 => u32::MAX,
        };

        let mut tree = vec![0u8; node_count as usize * record_size.node_bytes()];
        for (node_id, node) in self.nodes.iter().enumerate() {
            let left = self.record_value(node.left, node_count, max_record)?;
            let right = self.record_value(node.right, node_count, max_record)?;
            write_node(&mut tree, record_size, node_id, left, right);
        }

        Ok((tree, node_count))
    }

    fn record_value(&self, slot: Slot, node_count: u32, max_record: u32) -> Result<u32> {
        let value = match slot {
            Slot::Empty => node_count,
            Slot::Node(id) => id,
            Slot::Data(offset, _) => node_count
                .checked_add(DATA_SECTION_SEPARATOR as u32)
                .and_then(|base| base.checked_add(offset))
                .ok_or_else(|| {
                    MmdbError::Format(format!(
                        "data offset {} overflows the record encoding",
                        offset
                    ))
                })?,
        };

        if value > max_record {
            return Err(MmdbError::Format(format!(
                "record value {} does not fit {}-bit records",
                value,
                match max_record {
                    0xFF_FFFF => 24,
                    0xFFF_FFFF => 28,
                    _ => 32,
                }
            )));
        }
        Ok(value)
    }
}

fn write_node(tree: &mut [u8], record_size: RecordSize, node_id: usize, left: u32, right: u32) {
    let offset = node_id * record_size.node_bytes();
    match record_size {
        RecordSize::Bits24 => {
            tree[offset..offset + 3].copy_from_slice(&left.to_be_bytes()[1..]);
            tree[offset + 3..offset + 6].copy_from_slice(&right.to_be_bytes()[1..]);
        }
        RecordSize::Bits28 => {
            tree[offset..offset + 3].copy_from_slice(&left.to_be_bytes()[1..]);
            tree[offset + 3] = ((((left >> 24) & 0x0F) as u8) << 4) | ((right >> 24) & 0x0F) as u8;
            tree[offset + 4..offset + 7].copy_from_slice(&right.to_be_bytes()[1..]);
        }
        RecordSize::Bits32 => {
            tree[offset..offset + 4].copy_from_slice(&left.to_be_bytes());
            tree[offset + 4..offset + 8].copy_from_slice(&right.to_be_bytes());
        }
    }
}
