//! Schema definitions for CCIndex tables and records.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Columns of the pointer Parquet schema, in fixed order.
pub const POINTER_COLUMNS: [&str; 13] = [
    "collection",
    "shard_file",
    "surt",
    "ts",
    "url",
    "host",
    "host_rev",
    "status",
    "mime",
    "digest",
    "warc_filename",
    "warc_offset",
    "warc_length",
];

/// One CDXJ capture pointer: a URL mapped to a WARC byte range.
///
/// `(warc_filename, warc_offset, warc_length)` uniquely identifies a capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerRecord {
    /// Collection id, e.g. `CC-MAIN-2024-10`.
    pub collection: String,

    /// Source shard file name, e.g. `cdx-00042.gz`.
    pub shard_file: String,

    /// Sort-friendly URL key from the CDXJ line.
    pub surt: String,

    /// Capture timestamp as a `YYYYMMDDhhmmss` string.
    pub timestamp: Option<String>,

    /// Captured URL.
    pub url: String,

    /// Lowercased host with any leading `www.` stripped.
    pub host: Option<String>,

    /// Dot-reversed, comma-joined host, e.g. `gov,18f` for `18f.gov`.
    pub host_rev: Option<String>,

    /// HTTP status at capture time.
    pub status: Option<i32>,

    /// MIME type reported by Common Crawl.
    pub mime: Option<String>,

    /// Content digest from Common Crawl.
    pub digest: Option<String>,

    /// WARC file holding the capture, relative to the CC data root.
    pub warc_filename: Option<String>,

    /// Byte offset of the capture's gzip member inside the WARC.
    pub warc_offset: Option<i64>,

    /// Byte length of the capture's gzip member.
    pub warc_length: Option<i64>,
}

/// A collection known to a meta-index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRef {
    pub year: Option<i32>,
    pub collection: String,
    pub db_path: PathBuf,
}

/// Extract the year from a collection id like `CC-MAIN-2024-10`.
pub fn collection_year(collection: &str) -> Option<i32> {
    let mut parts = collection.split('-');
    let third = parts.nth(2)?;
    if third.len() == 4 && third.bytes().all(|b| b.is_ascii_digit()) {
        third.parse().ok()
    } else {
        None
    }
}

/// Shard file name (`cdx-NNNNN.gz`) for a shard number.
pub fn shard_file_name(shard: usize) -> String {
    format!("cdx-{:05}.gz", shard)
}

/// Shard stem (`cdx-NNNNN`) parsed from any of the shard's on-disk names.
pub fn shard_stem(file_name: &str) -> Option<&str> {
    let stem = file_name
        .strip_suffix(".gz.sorted.parquet")
        .or_else(|| file_name.strip_suffix(".gz.parquet.empty"))
        .or_else(|| file_name.strip_suffix(".gz.parquet"))
        .or_else(|| file_name.strip_suffix(".gz"))?;
    let digits = stem.strip_prefix("cdx-")?;
    if digits.len() == 5 && digits.bytes().all(|b| b.is_ascii_digit()) {
        Some(stem)
    } else {
        None
    }
}

// DDL for per-collection index databases. Kept as constants so the indexer,
// the meta builder and tests all create identical shapes.

pub const DDL_CC_POINTERS: &str = r#"
CREATE TABLE IF NOT EXISTS cc_pointers (
    collection VARCHAR,
    shard_file VARCHAR,
    surt VARCHAR,
    ts VARCHAR,
    url VARCHAR,
    host VARCHAR,
    host_rev VARCHAR,
    status INTEGER,
    mime VARCHAR,
    digest VARCHAR,
    warc_filename VARCHAR,
    warc_offset BIGINT,
    warc_length BIGINT
);
"#;

pub const DDL_CC_DOMAIN_SHARDS: &str = r#"
CREATE TABLE IF NOT EXISTS cc_domain_shards (
    source_path VARCHAR,
    collection VARCHAR,
    year INTEGER,
    shard_file VARCHAR,
    parquet_relpath VARCHAR,
    host VARCHAR,
    host_rev VARCHAR
);
"#;

pub const DDL_CC_PARQUET_ROWGROUPS: &str = r#"
CREATE TABLE IF NOT EXISTS cc_parquet_rowgroups (
    source_path VARCHAR,
    collection VARCHAR,
    year INTEGER,
    shard_file VARCHAR,
    parquet_relpath VARCHAR,
    row_group INTEGER,
    row_start BIGINT,
    row_end BIGINT,
    host_rev_min VARCHAR,
    host_rev_max VARCHAR
);
"#;

pub const DDL_CC_DOMAIN_ROWGROUPS: &str = r#"
CREATE TABLE IF NOT EXISTS cc_domain_rowgroups (
    source_path VARCHAR,
    collection VARCHAR,
    host_rev VARCHAR,
    row_group INTEGER,
    row_start BIGINT,
    row_end BIGINT
);
"#;

pub const DDL_CC_INGESTED_FILES: &str = r#"
CREATE TABLE IF NOT EXISTS cc_ingested_files (
    path VARCHAR PRIMARY KEY,
    size_bytes BIGINT,
    mtime_ns BIGINT,
    ingested_at VARCHAR,
    rows BIGINT
);
"#;

pub const DDL_COLLECTION_REGISTRY: &str = r#"
CREATE TABLE IF NOT EXISTS collection_registry (
    collection VARCHAR,
    db_path VARCHAR
);
"#;

pub const DDL_COLLECTION_SUMMARY: &str = r#"
CREATE TABLE IF NOT EXISTS collection_summary (
    year INTEGER,
    collection VARCHAR,
    collection_db_path VARCHAR
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_year() {
        assert_eq!(collection_year("CC-MAIN-2024-10"), Some(2024));
        assert_eq!(collection_year("CC-MAIN-2018-17"), Some(2018));
        assert_eq!(collection_year("CC-MAIN"), None);
        assert_eq!(collection_year("whatever"), None);
    }

    #[test]
    fn test_shard_file_name() {
        assert_eq!(shard_file_name(0), "cdx-00000.gz");
        assert_eq!(shard_file_name(299), "cdx-00299.gz");
    }

    #[test]
    fn test_shard_stem() {
        assert_eq!(shard_stem("cdx-00042.gz"), Some("cdx-00042"));
        assert_eq!(shard_stem("cdx-00042.gz.parquet"), Some("cdx-00042"));
        assert_eq!(shard_stem("cdx-00042.gz.sorted.parquet"), Some("cdx-00042"));
        assert_eq!(shard_stem("cdx-00042.gz.parquet.empty"), Some("cdx-00042"));
        assert_eq!(shard_stem("cluster.idx"), None);
        assert_eq!(shard_stem("cdx-42.gz"), None);
    }
}
