//! WARC record fetching and HTTP envelope parsing.
//!
//! A pointer `(warc_filename, warc_offset, warc_length)` addresses one gzip
//! member inside a multi-GB WARC. The fetcher retrieves exactly that member
//! with an HTTP Range GET (or a seek into a locally cached full WARC),
//! caches the slice on disk keyed by a sha256 of the range, and parses the
//! gzip member's WARC + HTTP envelope into headers, status and a bounded
//! text preview.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use flate2::read::MultiGzDecoder;
use reqwest::header::{HeaderValue, RANGE};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::Config;
use crate::{Error, Result};

pub const DEFAULT_WARC_PREFIX: &str = "https://data.commoncrawl.org/";

/// How a record fetch may use local caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// HTTP Range GET, backed by the range slice cache.
    Range,
    /// Use a cached full WARC when present, otherwise a Range GET.
    Auto,
    /// Ensure the full WARC is cached (downloading it if needed), then read
    /// the slice locally.
    Full,
}

impl std::str::FromStr for CacheMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "range" => Ok(CacheMode::Range),
            "auto" => Ok(CacheMode::Auto),
            "full" => Ok(CacheMode::Full),
            other => Err(Error::Config(format!("unknown cache mode: {}", other))),
        }
    }
}

/// Options for one record fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub prefix: String,
    pub timeout_s: f64,
    /// Upper bound on bytes fetched for one record.
    pub max_bytes: u64,
    pub cache_mode: CacheMode,
    /// Total size cap for the range cache directory.
    pub range_cache_max_bytes: u64,
    /// Slices larger than this are never cached.
    pub range_cache_max_item_bytes: u64,
    /// Refuse to download full WARCs larger than this.
    pub full_warc_max_bytes: u64,
    /// Total size cap for the full-WARC cache. 0 = unbounded.
    pub full_warc_cache_max_total_bytes: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_WARC_PREFIX.to_string(),
            timeout_s: 30.0,
            max_bytes: 2_000_000,
            cache_mode: CacheMode::Range,
            range_cache_max_bytes: 2_000_000_000,
            range_cache_max_item_bytes: 25_000_000,
            full_warc_max_bytes: 5_000_000_000,
            full_warc_cache_max_total_bytes: 0,
        }
    }
}

/// Raw result of fetching one record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WarcFetchResult {
    pub ok: bool,
    pub status: Option<u16>,
    pub url: String,
    pub bytes_requested: i64,
    pub bytes_returned: i64,
    pub sha256: Option<String>,
    pub raw_base64: Option<String>,
    /// Where the bytes came from: range, range_cache or full_cache.
    pub source: String,
    pub error: Option<String>,
}

/// Parsed WARC + HTTP envelope of one record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HttpExtract {
    pub ok: bool,
    pub warc_headers: BTreeMap<String, String>,
    pub http_status: Option<u16>,
    pub http_status_line: Option<String>,
    pub http_headers: BTreeMap<String, String>,
    pub body_base64: Option<String>,
    pub body_text_preview: Option<String>,
    pub body_is_html: bool,
    pub body_mime: Option<String>,
    pub body_charset: Option<String>,
    pub error: Option<String>,
}

impl HttpExtract {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            warc_headers: BTreeMap::new(),
            http_status: None,
            http_status_line: None,
            http_headers: BTreeMap::new(),
            body_base64: None,
            body_text_preview: None,
            body_is_html: false,
            body_mime: None,
            body_charset: None,
            error: Some(error.into()),
        }
    }
}

/// Resolve a WARC filename (or absolute URL) to a download URL.
pub fn download_url(warc_filename_or_url: &str, prefix: &str) -> String {
    let name = warc_filename_or_url.trim();
    if name.starts_with("http://") || name.starts_with("https://") {
        return name.to_string();
    }
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

/// Range-cache file path: sha256 of `range:<url>|<start>|<end_inclusive>`.
pub fn range_cache_path(cache_dir: &Path, url: &str, start: i64, end_inclusive: i64) -> PathBuf {
    let key = sha256_hex(format!("range:{}|{}|{}", url, start, end_inclusive).as_bytes());
    cache_dir.join(format!("{}.bin", key))
}

/// Full-WARC cache path: 16 hex of the URL hash plus the original basename.
pub fn full_warc_cache_path(cache_dir: &Path, warc_filename_or_url: &str) -> PathBuf {
    let hash = sha256_hex(warc_filename_or_url.as_bytes());
    let basename = warc_filename_or_url
        .rsplit('/')
        .next()
        .unwrap_or("file.warc.gz");
    cache_dir.join(format!("{}__{}", &hash[..16], basename))
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// WARC record fetcher with on-disk caching.
pub struct WarcFetcher<'a> {
    config: &'a Config,
}

impl<'a> WarcFetcher<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Fetch one record by pointer.
    ///
    /// Returns the result summary plus the raw bytes when the fetch
    /// succeeded. Network and cache failures are reported in the result,
    /// never panicked on.
    pub fn fetch_record(
        &self,
        warc_filename: &str,
        warc_offset: i64,
        warc_length: i64,
        opts: &FetchOptions,
    ) -> (WarcFetchResult, Option<Vec<u8>>) {
        let url = download_url(warc_filename, &opts.prefix);
        let length = warc_length.clamp(0, opts.max_bytes as i64);

        // Full-WARC cache first for auto/full modes.
        if matches!(opts.cache_mode, CacheMode::Auto | CacheMode::Full) {
            if let Some(cache_dir) = self.config.full_warc_cache_dir.clone() {
                let candidate = full_warc_cache_path(&cache_dir, warc_filename);
                let local = if candidate.is_file() {
                    Some(candidate)
                } else if opts.cache_mode == CacheMode::Full {
                    match self.ensure_full_warc_cached(warc_filename, opts) {
                        Ok(path) => Some(path),
                        Err(e) => {
                            return (
                                fetch_failure(&url, length, "full", format!("full_warc_cache_failed: {}", e)),
                                None,
                            );
                        }
                    }
                } else {
                    None
                };

                if let Some(path) = local {
                    match read_local_range(&path, warc_offset, length as u64) {
                        Ok(data) => {
                            return (fetch_success(&url, length, 200, "full_cache", &data), Some(data));
                        }
                        Err(e) => {
                            if opts.cache_mode == CacheMode::Full {
                                return (
                                    fetch_failure(&url, length, "full_cache", format!("local_range_failed: {}", e)),
                                    None,
                                );
                            }
                            warn!(path = %path.display(), error = %e, "cached full WARC unreadable, falling back to range GET");
                        }
                    }
                }
            } else if opts.cache_mode == CacheMode::Full {
                return (
                    fetch_failure(&url, length, "full", "full WARC cache dir is disabled"),
                    None,
                );
            }
        }

        self.fetch_range(&url, warc_offset, length, opts)
    }

    /// Fetch one record and parse its WARC + HTTP envelope.
    pub fn fetch_and_extract(
        &self,
        warc_filename: &str,
        warc_offset: i64,
        warc_length: i64,
        opts: &FetchOptions,
        max_preview_chars: usize,
        include_body_base64: bool,
    ) -> (WarcFetchResult, Option<HttpExtract>) {
        let (result, data) = self.fetch_record(warc_filename, warc_offset, warc_length, opts);
        let extract = data.as_deref().map(|bytes| {
            extract_http_from_gzip_member(
                bytes,
                10_000_000,
                opts.max_bytes as usize,
                max_preview_chars,
                include_body_base64,
            )
        });
        (result, extract)
    }

    fn fetch_range(
        &self,
        url: &str,
        start: i64,
        length: i64,
        opts: &FetchOptions,
    ) -> (WarcFetchResult, Option<Vec<u8>>) {
        if length <= 0 {
            return (
                fetch_failure(url, length, "range", "non-positive range length"),
                None,
            );
        }
        let end_inclusive = start + length - 1;

        // Cache probe: a cached slice must match the requested size exactly,
        // otherwise it is ignored and refetched.
        let cache_path = self.config.warc_cache_dir.as_ref().and_then(|dir| {
            if length as u64 <= opts.range_cache_max_item_bytes {
                Some(range_cache_path(dir, url, start, end_inclusive))
            } else {
                None
            }
        });
        if let Some(path) = &cache_path {
            if let Ok(meta) = std::fs::metadata(path) {
                if meta.len() == length as u64 {
                    if let Ok(data) = std::fs::read(path) {
                        debug!(url, start, length, "range served from cache");
                        return (fetch_success(url, length, 206, "range_cache", &data), Some(data));
                    }
                }
            }
        }

        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(opts.timeout_s))
            .build()
        {
            Ok(c) => c,
            Err(e) => return (fetch_failure(url, length, "range", e.to_string()), None),
        };

        let range_header = match HeaderValue::from_str(&format!("bytes={}-{}", start, end_inclusive)) {
            Ok(h) => h,
            Err(e) => return (fetch_failure(url, length, "range", e.to_string()), None),
        };

        let response = match client.get(url).header(RANGE, range_header).send() {
            Ok(r) => r,
            Err(e) => return (fetch_failure(url, length, "range", e.to_string()), None),
        };

        let status = response.status().as_u16();
        if status != 206 {
            // Do not read the body: if the server ignored Range this could be
            // a multi-GB response.
            return (
                fetch_failure(url, length, "range", format!("expected 206 for range GET, got {}", status)),
                None,
            );
        }

        let data = match response.bytes() {
            Ok(b) => b.to_vec(),
            Err(e) => return (fetch_failure(url, length, "range", e.to_string()), None),
        };

        if let Some(path) = &cache_path {
            self.persist_range(path, &data, length as u64, opts);
        }

        (fetch_success(url, length, 206, "range", &data), Some(data))
    }

    /// Best-effort cache write: `.part` then rename, only kept when the
    /// slice size matches the request.
    fn persist_range(&self, path: &Path, data: &[u8], expected_len: u64, opts: &FetchOptions) {
        if data.len() as u64 != expected_len {
            return;
        }
        let Some(parent) = path.parent() else {
            return;
        };
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
        let part = path.with_extension("bin.part");
        if std::fs::write(&part, data).is_ok() {
            if std::fs::rename(&part, path).is_err() {
                let _ = std::fs::remove_file(&part);
                return;
            }
            prune_cache_oldest_first(parent, opts.range_cache_max_bytes);
        }
    }

    /// Ensure a full WARC is cached locally, downloading it if needed.
    pub fn ensure_full_warc_cached(
        &self,
        warc_filename: &str,
        opts: &FetchOptions,
    ) -> Result<PathBuf> {
        let cache_dir = self
            .config
            .full_warc_cache_dir
            .clone()
            .ok_or_else(|| Error::Config("full WARC cache dir is disabled".to_string()))?;
        std::fs::create_dir_all(&cache_dir)?;

        let dest = full_warc_cache_path(&cache_dir, warc_filename);
        if dest.is_file() {
            return Ok(dest);
        }

        let url = download_url(warc_filename, &opts.prefix);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(opts.timeout_s.max(60.0)))
            .build()?;

        // Preflight so a 100GB WARC never lands on disk by accident.
        if let Ok(head) = client.head(&url).send() {
            if let Some(len) = head
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
            {
                if opts.full_warc_max_bytes > 0 && len > opts.full_warc_max_bytes {
                    return Err(Error::ResourceExhaustion(format!(
                        "{} is {} bytes, over the {} byte full-WARC cap",
                        url, len, opts.full_warc_max_bytes
                    )));
                }
            }
        }

        let part = dest.with_file_name(format!(
            "{}.part",
            dest.file_name().and_then(|s| s.to_str()).unwrap_or("warc")
        ));
        let result = (|| -> Result<()> {
            let mut response = client.get(&url).send()?.error_for_status()?;
            let mut file = File::create(&part)?;
            response.copy_to(&mut file)?;
            file.flush()?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&part);
            return Err(e);
        }
        std::fs::rename(&part, &dest)?;

        if opts.full_warc_cache_max_total_bytes > 0 {
            prune_cache_oldest_first(&cache_dir, opts.full_warc_cache_max_total_bytes);
        }
        Ok(dest)
    }
}

fn fetch_success(
    url: &str,
    bytes_requested: i64,
    status: u16,
    source: &str,
    data: &[u8],
) -> WarcFetchResult {
    WarcFetchResult {
        ok: true,
        status: Some(status),
        url: url.to_string(),
        bytes_requested,
        bytes_returned: data.len() as i64,
        sha256: Some(sha256_hex(data)),
        raw_base64: Some(base64::engine::general_purpose::STANDARD.encode(data)),
        source: source.to_string(),
        error: None,
    }
}

fn fetch_failure(
    url: &str,
    bytes_requested: i64,
    source: &str,
    error: impl Into<String>,
) -> WarcFetchResult {
    WarcFetchResult {
        ok: false,
        status: None,
        url: url.to_string(),
        bytes_requested,
        bytes_returned: 0,
        sha256: None,
        raw_base64: None,
        source: source.to_string(),
        error: Some(error.into()),
    }
}

/// Read `length` bytes at `start` from a local file.
fn read_local_range(path: &Path, start: i64, length: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start.max(0) as u64))?;
    let mut data = Vec::with_capacity(length as usize);
    file.take(length).read_to_end(&mut data)?;
    Ok(data)
}

/// Delete oldest files first until the directory is under `max_total_bytes`.
fn prune_cache_oldest_first(dir: &Path, max_total_bytes: u64) {
    if max_total_bytes == 0 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut files: Vec<(std::time::SystemTime, u64, PathBuf)> = entries
        .flatten()
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((
                meta.modified().unwrap_or(std::time::UNIX_EPOCH),
                meta.len(),
                e.path(),
            ))
        })
        .collect();

    let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
    if total <= max_total_bytes {
        return;
    }
    files.sort_by_key(|(mtime, _, _)| *mtime);
    for (_, len, path) in files {
        if total <= max_total_bytes {
            break;
        }
        if std::fs::remove_file(&path).is_ok() {
            debug!(path = %path.display(), "evicted cache entry");
            total = total.saturating_sub(len);
        }
    }
}

/// Parse a header block into its first line and a lowercased key map.
fn parse_headers_block(text: &str) -> (Option<String>, BTreeMap<String, String>) {
    let mut first_line = None;
    let mut headers = BTreeMap::new();
    for line in text.lines().map(|l| l.trim_end_matches('\r')) {
        if line.is_empty() {
            continue;
        }
        if first_line.is_none() {
            first_line = Some(line.to_string());
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    (first_line, headers)
}

/// Best-effort HTTP/1.1 chunked transfer decoding.
fn decode_chunked(body: &[u8], max_output_bytes: usize) -> (Vec<u8>, Option<String>) {
    let mut out = Vec::new();
    let mut i = 0usize;
    let n = body.len();
    while i < n {
        let Some(nl) = body[i..].iter().position(|&b| b == b'\n') else {
            return (out, Some("chunked: missing size line".to_string()));
        };
        let mut line = &body[i..i + nl];
        i += nl + 1;
        if let Some(semi) = line.iter().position(|&b| b == b';') {
            line = &line[..semi];
        }
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(size) = usize::from_str_radix(line, 16) else {
            return (out, Some(format!("chunked: bad size line {:?}", line)));
        };
        if size == 0 {
            break;
        }
        if i + size > n {
            return (out, Some("chunked: truncated".to_string()));
        }
        out.extend_from_slice(&body[i..i + size]);
        if out.len() > max_output_bytes {
            out.truncate(max_output_bytes);
            return (out, Some("chunked: output truncated".to_string()));
        }
        i += size;
        // Skip CRLF after chunk
        if body[i..].starts_with(b"\r\n") {
            i += 2;
        } else if body[i..].starts_with(b"\n") {
            i += 1;
        }
    }
    (out, None)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a header/body payload on `\r\n\r\n` (or `\n\n`).
fn split_on_blank_line(payload: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = find_subslice(payload, b"\r\n\r\n") {
        return Some((idx, 4));
    }
    find_subslice(payload, b"\n\n").map(|idx| (idx, 2))
}

/// Extract the HTTP response envelope from one gzip-member WARC record.
pub fn extract_http_from_gzip_member(
    gz_member_bytes: &[u8],
    max_decompressed_bytes: usize,
    max_body_bytes: usize,
    max_preview_chars: usize,
    include_body_base64: bool,
) -> HttpExtract {
    if gz_member_bytes.is_empty() {
        return HttpExtract::failed("empty input");
    }

    let mut decompressed = Vec::new();
    let mut decoder = MultiGzDecoder::new(gz_member_bytes).take(max_decompressed_bytes as u64);
    if let Err(e) = decoder.read_to_end(&mut decompressed) {
        return HttpExtract::failed(format!("gzip_decompress_failed: {}", e));
    }

    // Split WARC headers from payload.
    let Some((sep, sep_len)) = split_on_blank_line(&decompressed) else {
        return HttpExtract::failed("missing_warc_header_separator");
    };
    let warc_hdr_text = String::from_utf8_lossy(&decompressed[..sep]).to_string();
    let (_, warc_headers) = parse_headers_block(&warc_hdr_text);

    let payload = &decompressed[sep + sep_len..];
    let Some(http_idx) = find_subslice(payload, b"HTTP/") else {
        // Not an HTTP response record; return the payload preview as-is.
        let raw = &payload[..payload.len().min(max_body_bytes)];
        let preview: String = String::from_utf8_lossy(raw)
            .chars()
            .take(max_preview_chars)
            .collect();
        return HttpExtract {
            ok: true,
            warc_headers,
            http_status: None,
            http_status_line: None,
            http_headers: BTreeMap::new(),
            body_base64: include_body_base64
                .then(|| base64::engine::general_purpose::STANDARD.encode(raw)),
            body_text_preview: (!preview.is_empty()).then_some(preview),
            body_is_html: false,
            body_mime: None,
            body_charset: None,
            error: Some("no_http_payload".to_string()),
        };
    };

    let http_part = &payload[http_idx..];
    let Some((http_sep, http_sep_len)) = split_on_blank_line(http_part) else {
        return HttpExtract {
            warc_headers,
            ..HttpExtract::failed("missing_http_header_separator")
        };
    };

    let http_hdr_text = String::from_utf8_lossy(&http_part[..http_sep]).to_string();
    let (status_line, http_headers) = parse_headers_block(&http_hdr_text);

    let http_status = status_line
        .as_deref()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok());

    let mut body = http_part[http_sep + http_sep_len..].to_vec();
    body.truncate(max_body_bytes);

    if http_headers
        .get("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    {
        let (decoded, _note) = decode_chunked(&body, max_body_bytes);
        body = decoded;
    }

    let (body_mime, body_charset) = match http_headers.get("content-type") {
        Some(ct) => {
            let mime = ct
                .split(';')
                .next()
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty());
            (mime, charset_from_content_type(ct))
        }
        None => (None, None),
    };

    let mut body_is_html = body_mime
        .as_deref()
        .is_some_and(|m| m == "text/html" || m.ends_with("+html"));
    if !body_is_html {
        let head: Vec<u8> = body
            .iter()
            .take(64)
            .map(|b| b.to_ascii_lowercase())
            .collect();
        let trimmed: &[u8] = {
            let start = head
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(head.len());
            &head[start..]
        };
        body_is_html = trimmed.starts_with(b"<!doctype html") || trimmed.starts_with(b"<html");
    }

    let body_text_preview = if body.is_empty() {
        None
    } else {
        let decoded = match body_charset
            .as_deref()
            .and_then(|cs| encoding_rs::Encoding::for_label(cs.as_bytes()))
        {
            Some(encoding) => encoding.decode(&body).0.to_string(),
            None => String::from_utf8_lossy(&body).to_string(),
        };
        Some(decoded.chars().take(max_preview_chars).collect())
    };

    HttpExtract {
        ok: true,
        warc_headers,
        http_status,
        http_status_line: status_line,
        http_headers,
        body_base64: include_body_base64
            .then(|| base64::engine::general_purpose::STANDARD.encode(&body)),
        body_text_preview,
        body_is_html,
        body_mime,
        body_charset,
        error: None,
    }
}

fn charset_from_content_type(ct: &str) -> Option<String> {
    let lower = ct.to_ascii_lowercase();
    let idx = lower.find("charset=")?;
    let rest = &ct[idx + "charset=".len()..];
    let value: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ';')
        .collect();
    let value = value.trim_matches(|c| c == '"' || c == '\'').to_lowercase();
    (!value.is_empty()).then_some(value)
}
