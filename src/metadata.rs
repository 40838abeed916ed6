//! Metadata section parsing.
//!
//! The metadata block is a map-encoded value trailing the file, introduced
//! by a fixed marker sequence. It is parsed once at open time and describes
//! the shape of everything before it: search tree geometry, record size,
//! and IP version.

use crate::data_section::{DataValue, Decoder};
use crate::error::{MmdbError, Result};
use serde::Serialize;

/// Metadata marker: "\xAB\xCD\xEFMaxMind.com"
pub const METADATA_MARKER: &[u8] = b"\xAB\xCD\xEFMaxMind.com";

/// Bytes between the search tree and the data section
pub const DATA_SECTION_SEPARATOR: usize = 16;

/// The marker is searched only within this trailing window. Marker bytes can
/// spuriously appear earlier in tree or data content; the last occurrence
/// closest to the end wins.
const MARKER_SEARCH_WINDOW: usize = 128 * 1024;

/// IP version the search tree is indexed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IpVersion {
    /// IPv4-only tree (32-bit depth)
    V4,
    /// IPv6 tree (128-bit depth, IPv4 reachable through ::/96)
    V6,
}

/// Record size in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordSize {
    /// 24-bit records (3 bytes per record, 6 bytes per node)
    Bits24,
    /// 28-bit records (two 3-byte records sharing a middle nibble byte)
    Bits28,
    /// 32-bit records (4 bytes per record, 8 bytes per node)
    Bits32,
}

impl RecordSize {
    /// Size of a node (two records) in bytes
    pub fn node_bytes(self) -> usize {
        match self {
            RecordSize::Bits24 => 6,
            RecordSize::Bits28 => 7,
            RecordSize::Bits32 => 8,
        }
    }

    /// Record size as the bit count stored in metadata
    pub fn bits(self) -> u16 {
        match self {
            RecordSize::Bits24 => 24,
            RecordSize::Bits28 => 28,
            RecordSize::Bits32 => 32,
        }
    }

    /// Parse the metadata `record_size` field
    pub fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            24 => Ok(RecordSize::Bits24),
            28 => Ok(RecordSize::Bits28),
            32 => Ok(RecordSize::Bits32),
            _ => Err(MmdbError::Format(format!(
                "unsupported record size: {} bits",
                bits
            ))),
        }
    }
}

/// Parsed database metadata
///
/// Immutable after open. Field meanings follow the MMDB specification; the
/// `description` map preserves the language order found in the database.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    /// Number of nodes in the search tree
    pub node_count: u32,
    /// Record size of the search tree
    pub record_size: RecordSize,
    /// IP version the tree is indexed for
    pub ip_version: IpVersion,
    /// Database type label, e.g. "GeoIP2-City"
    pub database_type: String,
    /// Locale codes the database carries names for
    pub languages: Vec<String>,
    /// Binary format major version (always 2 for supported databases)
    pub binary_format_major_version: u16,
    /// Binary format minor version
    pub binary_format_minor_version: u16,
    /// Database build time, seconds since the Unix epoch
    pub build_epoch: u64,
    /// Human-readable description per language code
    pub description: Vec<(String, String)>,
}

impl Metadata {
    /// Parse the metadata map from the bytes following the marker
    pub fn parse(section: &[u8]) -> Result<Self> {
        let value = Decoder::new(section).decode(0).map_err(|e| match e {
            MmdbError::InvalidDatabase(msg) => {
                MmdbError::Format(format!("failed to decode metadata: {}", msg))
            }
            other => other,
        })?;

        let entries = match value {
            DataValue::Map(entries) => entries,
            _ => return Err(MmdbError::Format("metadata is not a map".to_string())),
        };

        let node_count = required_uint(&entries, "node_count")?;
        let node_count = u32::try_from(node_count)
            .map_err(|_| MmdbError::Format(format!("node_count {} out of range", node_count)))?;
        let record_size = RecordSize::from_bits(required_uint(&entries, "record_size")?)?;

        let ip_version = match required_uint(&entries, "ip_version")? {
            4 => IpVersion::V4,
            6 => IpVersion::V6,
            other => {
                return Err(MmdbError::Format(format!("invalid IP version: {}", other)));
            }
        };

        let binary_format_major_version =
            required_uint(&entries, "binary_format_major_version")? as u16;
        if binary_format_major_version != 2 {
            return Err(MmdbError::Format(format!(
                "unsupported binary format major version: {}",
                binary_format_major_version
            )));
        }
        let binary_format_minor_version =
            required_uint(&entries, "binary_format_minor_version")? as u16;
        let build_epoch = required_uint(&entries, "build_epoch")?;
        let database_type = required_string(&entries, "database_type")?;

        // languages and description are carried when present; an absent
        // field decodes to empty rather than failing the open.
        let languages = match find(&entries, "languages") {
            Some(DataValue::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        MmdbError::Format("languages entry is not a string".to_string())
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(MmdbError::Format(
                    "field 'languages' is not an array".to_string(),
                ))
            }
            None => Vec::new(),
        };

        let description = match find(&entries, "description") {
            Some(DataValue::Map(pairs)) => pairs
                .iter()
                .map(|(lang, text)| {
                    text.as_str()
                        .map(|t| (lang.clone(), t.to_string()))
                        .ok_or_else(|| {
                            MmdbError::Format("description entry is not a string".to_string())
                        })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(MmdbError::Format(
                    "field 'description' is not a map".to_string(),
                ))
            }
            None => Vec::new(),
        };

        Ok(Metadata {
            node_count,
            record_size,
            ip_version,
            database_type,
            languages,
            binary_format_major_version,
            binary_format_minor_version,
            build_epoch,
            description,
        })
    }

    /// Size of the search tree section in bytes
    pub fn search_tree_size(&self) -> usize {
        self.node_count as usize * self.record_size.node_bytes()
    }

    /// Offset of the data section within the file
    pub fn data_section_start(&self) -> usize {
        self.search_tree_size() + DATA_SECTION_SEPARATOR
    }
}

/// Locate the metadata map: the offset just past the marker.
///
/// Scans backward from the buffer end; only the trailing 128 KiB window is
/// searched and the last marker occurrence wins.
pub fn find_metadata_start(data: &[u8]) -> Result<usize> {
    if data.len() < METADATA_MARKER.len() {
        return Err(MmdbError::Format(
            "metadata marker not found".to_string(),
        ));
    }

    let window_start = data.len().saturating_sub(MARKER_SEARCH_WINDOW);
    let window = &data[window_start..];

    match memchr::memmem::rfind(window, METADATA_MARKER) {
        Some(pos) => Ok(window_start + pos + METADATA_MARKER.len()),
        None => Err(MmdbError::Format(
            "metadata marker not found".to_string(),
        )),
    }
}

fn find<'a>(entries: &'a [(String, DataValue)], key: &str) -> Option<&'a DataValue> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn required_uint(entries: &[(String, DataValue)], key: &str) -> Result<u64> {
    match find(entries, key) {
        Some(value) => value.as_u64().ok_or_else(|| {
            MmdbError::Format(format!("field '{}' is not an unsigned integer", key))
        }),
        None => Err(MmdbError::Format(format!(
            "required field '{}' not found",
            key
        ))),
    }
}

fn required_string(entries: &[(String, DataValue)], key: &str) -> Result<String> {
    match find(entries, key) {
        Some(value) => value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MmdbError::Format(format!("field '{}' is not a string", key))),
        None => Err(MmdbError::Format(format!(
            "required field '{}' not found",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::plain_bytes;

    fn metadata_value(overrides: &[(&str, DataValue)]) -> Vec<(String, DataValue)> {
        let mut entries = vec![
            ("node_count".to_string(), DataValue::Uint32(42)),
            ("record_size".to_string(), DataValue::Uint16(24)),
            ("ip_version".to_string(), DataValue::Uint16(6)),
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
                DataValue::Uint64(1_700_000_000),
            ),
            (
                "database_type".to_string(),
                DataValue::String("Test-DB".to_string()),
            ),
            (
                "languages".to_string(),
                DataValue::Array(vec![DataValue::String("en".to_string())]),
            ),
            (
                "description".to_string(),
                DataValue::Map(vec![(
                    "en".to_string(),
                    DataValue::String("test fixture".to_string()),
                )]),
            ),
        ];

        for (key, value) in overrides {
            if let Some(slot) = entries.iter_mut().find(|(k, _)| k == key) {
                slot.1 = value.clone();
            }
        }
        entries
    }

    fn encode_metadata(entries: Vec<(String, DataValue)>) -> Vec<u8> {
        plain_bytes(&DataValue::Map(entries))
    }

    #[test]
    fn test_parse_complete_metadata() {
        let bytes = encode_metadata(metadata_value(&[]));
        let meta = Metadata::parse(&bytes).unwrap();

        assert_eq!(meta.node_count, 42);
        assert_eq!(meta.record_size, RecordSize::Bits24);
        assert_eq!(meta.ip_version, IpVersion::V6);
        assert_eq!(meta.database_type, "Test-DB");
        assert_eq!(meta.languages, vec!["en".to_string()]);
        assert_eq!(meta.build_epoch, 1_700_000_000);
        assert_eq!(meta.search_tree_size(), 42 * 6);
        assert_eq!(meta.data_section_start(), 42 * 6 + 16);
    }

    #[test]
    fn test_missing_required_field() {
        let entries = metadata_value(&[])
            .into_iter()
            .filter(|(k, _)| k != "node_count")
            .collect();
        let err = Metadata::parse(&encode_metadata(entries)).unwrap_err();
        match err {
            MmdbError::Format(msg) => assert!(msg.contains("node_count")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_field_type() {
        let bytes = encode_metadata(metadata_value(&[(
            "record_size",
            DataValue::String("24".to_string()),
        )]));
        assert!(matches!(
            Metadata::parse(&bytes),
            Err(MmdbError::Format(_))
        ));
    }

    #[test]
    fn test_unsupported_record_size() {
        let bytes = encode_metadata(metadata_value(&[("record_size", DataValue::Uint16(16))]));
        assert!(matches!(
            Metadata::parse(&bytes),
            Err(MmdbError::Format(_))
        ));
    }

    #[test]
    fn test_unsupported_major_version() {
        let bytes = encode_metadata(metadata_value(&[(
            "binary_format_major_version",
            DataValue::Uint16(3),
        )]));
        assert!(matches!(
            Metadata::parse(&bytes),
            Err(MmdbError::Format(_))
        ));
    }

    #[test]
    fn test_metadata_not_a_map() {
        let bytes = plain_bytes(&DataValue::String("nope".to_string()));
        assert!(matches!(
            Metadata::parse(&bytes),
            Err(MmdbError::Format(_))
        ));
    }

    #[test]
    fn test_find_marker_last_occurrence_wins() {
        let mut data = Vec::new();
        data.extend_from_slice(b"leading content ");
        data.extend_from_slice(METADATA_MARKER);
        data.extend_from_slice(b"spurious middle bytes");
        data.extend_from_slice(METADATA_MARKER);
        data.extend_from_slice(b"tail");

        let start = find_metadata_start(&data).unwrap();
        assert_eq!(start, data.len() - b"tail".len());
    }

    #[test]
    fn test_marker_absent() {
        assert!(matches!(
            find_metadata_start(b"not a valid mmdb file"),
            Err(MmdbError::Format(_))
        ));
        assert!(matches!(find_metadata_start(b"foo"), Err(MmdbError::Format(_))));
        assert!(matches!(find_metadata_start(b""), Err(MmdbError::Format(_))));
    }

    #[test]
    fn test_metadata_serializes_to_json() {
        let bytes = encode_metadata(metadata_value(&[]));
        let meta = Metadata::parse(&bytes).unwrap();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["node_count"], 42);
        assert_eq!(json["database_type"], "Test-DB");
    }
}
