//! CDXJ shard parsing.
//!
//! A CDXJ line has the shape `<surt> <timestamp> <json>`, with some shards
//! placing the URL as a third whitespace token before the JSON object. Lines
//! that cannot be understood are classified, never fatal; only I/O errors on
//! the underlying gzip stream abort a shard.

use std::io::{BufRead, BufReader, Read};

use flate2::read::MultiGzDecoder;
use serde_json::Value;

use crate::schema::PointerRecord;
use crate::Result;

/// Classification of one CDXJ line.
#[derive(Debug)]
pub enum CdxjLine {
    /// Line starting with `#`.
    Comment,
    /// Blank line.
    Empty,
    /// A parseable capture pointer.
    Record(Box<PointerRecord>),
    /// Anything else; the payload is the offending line.
    Malformed(String),
}

/// Streaming reader over a gzipped CDXJ shard.
pub struct CdxjReader<R: Read> {
    lines: std::io::Lines<BufReader<MultiGzDecoder<R>>>,
    collection: String,
    shard_file: String,
}

impl<R: Read> CdxjReader<R> {
    pub fn new(reader: R, collection: &str, shard_file: &str) -> Self {
        Self {
            lines: BufReader::new(MultiGzDecoder::new(reader)).lines(),
            collection: collection.to_string(),
            shard_file: shard_file.to_string(),
        }
    }
}

impl<R: Read> Iterator for CdxjReader<R> {
    type Item = Result<CdxjLine>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lines.next()? {
            Ok(line) => Some(Ok(parse_line(&self.collection, &self.shard_file, &line))),
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// Parse one CDXJ line into its classification.
pub fn parse_line(collection: &str, shard_file: &str, line: &str) -> CdxjLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return CdxjLine::Empty;
    }
    if trimmed.starts_with('#') {
        return CdxjLine::Comment;
    }

    let (pre, meta) = match trimmed.find('{') {
        Some(json_pos) => {
            let json_str = trimmed[json_pos..].trim();
            match serde_json::from_str::<Value>(json_str) {
                Ok(Value::Object(map)) => (trimmed[..json_pos].trim(), Some(map)),
                _ => return CdxjLine::Malformed(trimmed.to_string()),
            }
        }
        None => (trimmed, None),
    };

    let mut parts = pre.split_whitespace();
    let surt = match parts.next() {
        Some(s) => s.to_string(),
        None => return CdxjLine::Malformed(trimmed.to_string()),
    };
    let timestamp = parts.next().map(|s| s.to_string());

    // Many shards put the URL in the JSON; some include it in the preamble.
    let url = match parts.next() {
        Some(token) => Some(token.to_string()),
        None => meta
            .as_ref()
            .and_then(|m| m.get("url"))
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    };

    let (Some(url), Some(timestamp)) = (url, timestamp) else {
        return CdxjLine::Malformed(trimmed.to_string());
    };

    let host = extract_host(&url);
    let host_rev = host.as_deref().and_then(host_to_rev);

    let get_str = |key: &str| -> Option<String> {
        meta.as_ref()
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    };

    let status = meta
        .as_ref()
        .and_then(|m| m.get("status"))
        .and_then(value_to_i64)
        .map(|v| v as i32);
    let warc_offset = meta.as_ref().and_then(|m| m.get("offset")).and_then(value_to_i64);
    let warc_length = meta.as_ref().and_then(|m| m.get("length")).and_then(value_to_i64);

    CdxjLine::Record(Box::new(PointerRecord {
        collection: collection.to_string(),
        shard_file: shard_file.to_string(),
        surt,
        timestamp: Some(timestamp),
        url,
        host,
        host_rev,
        status,
        mime: get_str("mime"),
        digest: get_str("digest"),
        warc_filename: get_str("filename"),
        warc_offset,
        warc_length,
    }))
}

/// Coerce a JSON value (number or numeric string) to an integer.
fn value_to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Derive the host from a URL: strip scheme, lowercase, drop leading `www.`.
pub fn extract_host(url: &str) -> Option<String> {
    let u = url.trim();
    let start = u.find("://")? + 3;
    let rest = &u[start..];
    let end = rest.find('/').unwrap_or(rest.len());
    let mut host = rest[..end].to_ascii_lowercase();
    if let Some(stripped) = host.strip_prefix("www.") {
        host = stripped.to_string();
    }
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Convert a host like `a.b.c` to the CC host_rev prefix `c,b,a`.
pub fn host_to_rev(host: &str) -> Option<String> {
    let lower = host.to_ascii_lowercase();
    let mut parts: Vec<&str> = lower.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return None;
    }
    parts.reverse();
    Some(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"gov,18f)/ 20240315120000 {"url": "https://18f.gov/", "mime": "text/html", "status": "200", "digest": "AAAABBBB", "length": "2048", "offset": "1024", "filename": "crawl-data/CC-MAIN-2024-10/segments/1.0/warc/X.warc.gz"}"#;

    fn record(line: &str) -> PointerRecord {
        match parse_line("CC-MAIN-2024-10", "cdx-00000.gz", line) {
            CdxjLine::Record(r) => *r,
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_typical_line() {
        let rec = record(LINE);
        assert_eq!(rec.surt, "gov,18f)/");
        assert_eq!(rec.timestamp.as_deref(), Some("20240315120000"));
        assert_eq!(rec.url, "https://18f.gov/");
        assert_eq!(rec.host.as_deref(), Some("18f.gov"));
        assert_eq!(rec.host_rev.as_deref(), Some("gov,18f"));
        assert_eq!(rec.status, Some(200));
        assert_eq!(rec.warc_offset, Some(1024));
        assert_eq!(rec.warc_length, Some(2048));
        assert!(rec.warc_filename.as_deref().unwrap().contains("/warc/"));
    }

    #[test]
    fn test_parse_url_as_third_token() {
        let line = r#"gov,18f)/about 20240315120000 https://18f.gov/about {"status": 200}"#;
        let rec = record(line);
        assert_eq!(rec.url, "https://18f.gov/about");
        assert_eq!(rec.status, Some(200));
    }

    #[test]
    fn test_parse_comment_and_empty() {
        assert!(matches!(
            parse_line("c", "s", "# generated by cc-index"),
            CdxjLine::Comment
        ));
        assert!(matches!(parse_line("c", "s", "   "), CdxjLine::Empty));
    }

    #[test]
    fn test_parse_bad_json_is_malformed() {
        let line = r#"gov,18f)/ 20240315120000 {"url": "https://18f.gov/", broken"#;
        assert!(matches!(parse_line("c", "s", line), CdxjLine::Malformed(_)));
    }

    #[test]
    fn test_parse_missing_url_is_malformed() {
        let line = r#"gov,18f)/ 20240315120000 {"status": 200}"#;
        assert!(matches!(parse_line("c", "s", line), CdxjLine::Malformed(_)));
    }

    #[test]
    fn test_numeric_fields_tolerate_numbers_and_strings() {
        let line = r#"gov,18f)/ 20240315120000 {"url": "https://18f.gov/", "status": 301, "offset": "77", "length": 13}"#;
        let rec = record(line);
        assert_eq!(rec.status, Some(301));
        assert_eq!(rec.warc_offset, Some(77));
        assert_eq!(rec.warc_length, Some(13));
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("https://WWW.Example.COM/foo"), Some("example.com".into()));
        assert_eq!(extract_host("http://18f.gov"), Some("18f.gov".into()));
        assert_eq!(extract_host("no-scheme.example"), None);
    }

    #[test]
    fn test_host_to_rev() {
        assert_eq!(host_to_rev("18f.gov").as_deref(), Some("gov,18f"));
        assert_eq!(host_to_rev("a.b.c").as_deref(), Some("c,b,a"));
        assert_eq!(host_to_rev(""), None);
    }

    #[test]
    fn test_reader_over_gzip_stream() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        writeln!(enc, "# header").unwrap();
        writeln!(enc).unwrap();
        writeln!(enc, "{}", LINE).unwrap();
        let bytes = enc.finish().unwrap();

        let reader = CdxjReader::new(&bytes[..], "CC-MAIN-2024-10", "cdx-00000.gz");
        let lines: Vec<CdxjLine> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert!(matches!(lines[0], CdxjLine::Comment));
        assert!(matches!(lines[1], CdxjLine::Empty));
        assert!(matches!(lines[2], CdxjLine::Record(_)));
    }
}
