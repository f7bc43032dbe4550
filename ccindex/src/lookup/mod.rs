//! Lookup API: resolve a domain or a batch of URLs to WARC pointers.
//!
//! Resolution walks the meta-index hierarchy (master, then per-year, then
//! per-collection databases) to find the Parquet files that can contain a
//! host, then reads only the row-group slices covering it when a slice
//! index is available. Both operations are read-only; the only side effect
//! is an optional JSONL trace log.

mod domain;
mod urls;

use std::io::Write;

use duckdb::Row;
use serde::Serialize;

use crate::config::Config;
use crate::Result;

pub use urls::ResolveOptions;

/// One pointer hit returned by a lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointerHit {
    pub collection: Option<String>,
    pub shard_file: Option<String>,
    pub timestamp: Option<String>,
    pub url: Option<String>,
    pub host: Option<String>,
    pub host_rev: Option<String>,
    pub status: Option<i32>,
    pub mime: Option<String>,
    pub digest: Option<String>,
    pub warc_filename: Option<String>,
    pub warc_offset: Option<i64>,
    pub warc_length: Option<i64>,
    /// Parquet (or database) the hit was read from.
    pub source_path: Option<String>,
}

/// Per-phase timings for one lookup, in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LookupTimings {
    pub setup_s: f64,
    pub schema_s: f64,
    pub rowgroup_s: f64,
    pub query_s: f64,
    pub filter_s: f64,
}

/// Result of a domain search.
#[derive(Debug, Serialize)]
pub struct DomainSearchResult {
    pub records: Vec<PointerHit>,
    pub collections_considered: usize,
    /// Which tier resolved the collection list: master, year or scan.
    pub meta_source: String,
    pub elapsed_s: f64,
    pub timings: LookupTimings,
}

/// Options for `search_domain`.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub year: Option<i32>,
    pub max_matches: usize,
    pub per_parquet_limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            year: None,
            max_matches: 100,
            per_parquet_limit: 50,
        }
    }
}

/// Read-only lookup handle over the meta-index hierarchy.
pub struct Lookup<'a> {
    config: &'a Config,
}

impl<'a> Lookup<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Resolve a domain to ranked pointer records.
    pub fn search_domain(&self, domain: &str, opts: &SearchOptions) -> Result<DomainSearchResult> {
        domain::search_domain(self.config, domain, opts)
    }

    /// Resolve a batch of URLs to per-URL pointer records.
    pub fn resolve_urls(
        &self,
        input_urls: &[String],
        opts: &ResolveOptions,
    ) -> Result<std::collections::BTreeMap<String, Vec<PointerHit>>> {
        urls::resolve_urls(self.config, input_urls, opts)
    }
}

/// Normalize a domain or URL into a bare hostname.
///
/// `https://www.18f.gov/foo` and `WWW.18F.GOV` both become `18f.gov`.
pub fn normalize_domain(domain_or_url: &str) -> String {
    let mut dom = domain_or_url.trim().to_ascii_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(stripped) = dom.strip_prefix(scheme) {
            dom = stripped.to_string();
            break;
        }
    }
    if let Some(slash) = dom.find('/') {
        dom.truncate(slash);
    }
    if let Some(stripped) = dom.strip_prefix("www.") {
        dom = stripped.to_string();
    }
    dom
}

/// Normalize a URL for equality-ish matching across http/https, `www.` and
/// trailing-slash variations.
pub fn canonicalize_url(url: &str) -> String {
    let u = url.trim();
    if u.is_empty() {
        return String::new();
    }
    let (_, rest) = split_scheme(u);
    let (netloc, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let mut netloc = netloc.to_ascii_lowercase();
    if let Some(stripped) = netloc.strip_prefix("www.") {
        netloc = stripped.to_string();
    }
    let path_and_query = if path_and_query.is_empty() {
        "/"
    } else {
        path_and_query
    };
    format!("{}{}", netloc, path_and_query)
        .trim_end_matches('/')
        .to_string()
}

fn split_scheme(url: &str) -> (Option<&str>, &str) {
    for scheme in ["https", "http"] {
        let prefix = format!("{}://", scheme);
        if url.len() >= prefix.len() && url[..prefix.len()].eq_ignore_ascii_case(&prefix) {
            return (Some(scheme), &url[prefix.len()..]);
        }
    }
    (None, url)
}

/// Generate the small set of URL variants likely to exist in the index:
/// http/https, with and without `www.`, trailing slash toggled. The original
/// URL is kept first when it is already absolute.
pub fn url_variants(url: &str) -> Vec<String> {
    let u = url.trim();
    if u.is_empty() {
        return Vec::new();
    }

    let (scheme, rest) = split_scheme(u);
    let (netloc, path, query) = {
        let (netloc, tail) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let (path, query) = match tail.find('?') {
            Some(idx) => (&tail[..idx], &tail[idx..]),
            None => (tail, ""),
        };
        (netloc, path, query)
    };
    if netloc.is_empty() {
        return vec![u.to_string()];
    }

    let schemes: Vec<&str> = match scheme {
        Some("http") => vec!["http", "https"],
        _ => vec!["https", "http"],
    };

    let lower_netloc = netloc.to_ascii_lowercase();
    let netlocs: Vec<String> = if lower_netloc.starts_with("www.") {
        vec![netloc.to_string(), netloc[4..].to_string()]
    } else {
        vec![netloc.to_string(), format!("www.{}", netloc)]
    };

    let paths: Vec<String> = if path.ends_with('/') {
        vec![path.to_string(), path.trim_end_matches('/').to_string()]
    } else {
        vec![path.to_string(), format!("{}/", path)]
    };

    let mut out = Vec::new();
    if scheme.is_some() {
        out.push(u.to_string());
    }
    for sch in &schemes {
        for nl in &netlocs {
            for pa in &paths {
                let cand = format!("{}://{}{}{}", sch, nl, pa, query);
                if !out.contains(&cand) {
                    out.push(cand);
                }
            }
        }
    }
    out
}

/// Ranking used by `search_domain`: prefer records likely to render as a
/// page, newest first among ties.
pub fn wayback_score(hit: &PointerHit) -> (i32, i64) {
    let wf = hit.warc_filename.as_deref().unwrap_or("");
    let mime = hit.mime.as_deref().unwrap_or("");

    let mut score = 0;
    if wf.contains("/warc/") {
        score += 4;
    }
    if wf.contains("crawldiagnostics") {
        score -= 4;
    }
    if hit.status == Some(200) {
        score += 2;
    }
    if mime.starts_with("text/html") {
        score += 1;
    }

    let ts = hit
        .timestamp
        .as_deref()
        .and_then(|t| t.parse::<i64>().ok())
        .unwrap_or(0);
    (score, ts)
}

/// Column list shared by every pointer query, in `hit_from_row` order.
pub(crate) const HIT_COLUMNS: &str =
    "collection, shard_file, ts, url, host, host_rev, status, mime, digest, \
     warc_filename, warc_offset, warc_length";

pub(crate) fn hit_from_row(row: &Row<'_>, source_path: Option<&str>) -> duckdb::Result<PointerHit> {
    Ok(PointerHit {
        collection: row.get(0)?,
        shard_file: row.get(1)?,
        timestamp: row.get(2)?,
        url: row.get(3)?,
        host: row.get(4)?,
        host_rev: row.get(5)?,
        status: row.get(6)?,
        mime: row.get(7)?,
        digest: row.get(8)?,
        warc_filename: row.get(9)?,
        warc_offset: row.get(10)?,
        warc_length: row.get(11)?,
        source_path: source_path.map(|s| s.to_string()),
    })
}

/// Append one event to the JSONL trace log, best effort.
pub(crate) fn trace_event(config: &Config, event: serde_json::Value) {
    let Some(path) = &config.trace_log else {
        return;
    };
    let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{}", event);
}
