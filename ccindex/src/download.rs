//! Shard downloads (stage 1).
//!
//! Shards are fetched from the Common Crawl data host in a bounded worker
//! pool with retry and backoff. Each download streams into a `.download`
//! temp file and is renamed only after the payload gunzips cleanly, so a
//! present `cdx-*.gz` is always a valid gzip stream.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::schema::shard_file_name;
use crate::{Error, Result};

/// Options for a download run.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub workers: usize,
    pub retries: u32,
    pub timeout_s: f64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            retries: 3,
            timeout_s: 120.0,
        }
    }
}

/// Aggregate results of a download run.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownloadStats {
    pub downloaded: usize,
    pub present: usize,
    pub failed: usize,
}

/// URL of one index shard on the Common Crawl data host.
pub fn shard_url(base_url: &str, collection: &str, shard_file: &str) -> String {
    format!(
        "{}/cc-index/collections/{}/indexes/{}",
        base_url.trim_end_matches('/'),
        collection,
        shard_file
    )
}

/// Validate that a file is a readable gzip stream.
pub fn gzip_is_valid(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    let mut sink = [0u8; 64 * 1024];
    loop {
        match decoder.read(&mut sink) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}

/// Download every missing shard of a collection.
///
/// A shard is present when its `cdx-NNNNN.gz` exists and gunzips without
/// error; corrupt files are re-downloaded.
pub fn download_collection(
    config: &Config,
    collection: &str,
    opts: &DownloadOptions,
) -> Result<DownloadStats> {
    let dest_dir = config.collection_source_dir(collection);
    std::fs::create_dir_all(&dest_dir)?;

    let mut missing: Vec<String> = Vec::new();
    let mut present = 0usize;
    for shard in 0..config.expected_shards {
        let name = shard_file_name(shard);
        let dest = dest_dir.join(&name);
        if dest.exists() && gzip_is_valid(&dest) {
            present += 1;
        } else {
            if dest.exists() {
                warn!(shard = %name, "existing shard failed gzip validation, re-downloading");
                let _ = std::fs::remove_file(&dest);
            }
            missing.push(name);
        }
    }

    info!(collection, present, missing = missing.len(), "downloading shards");
    let downloaded = download_shards(config, collection, &missing, opts)?;

    Ok(DownloadStats {
        downloaded,
        present,
        failed: missing.len() - downloaded,
    })
}

/// Download a named set of shards. Used by the bulk path above and by the
/// orchestrator's heal chain to re-fetch single source shards.
///
/// Returns the number of shards that are valid on disk afterwards.
pub fn download_shards(
    config: &Config,
    collection: &str,
    names: &[String],
    opts: &DownloadOptions,
) -> Result<usize> {
    if names.is_empty() {
        return Ok(0);
    }

    let dest_dir = config.collection_source_dir(collection);
    std::fs::create_dir_all(&dest_dir)?;

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs_f64(opts.timeout_s))
        .build()?;

    let bar = ProgressBar::new(names.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len:5} {msg}")
            .expect("Invalid progress bar template")
            .progress_chars("##-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.workers.max(1))
        .build()
        .map_err(|e| Error::Stage(format!("thread pool: {}", e)))?;

    let results: Vec<bool> = pool.install(|| {
        names
            .par_iter()
            .map(|name| {
                let url = shard_url(&config.download_base_url, collection, name);
                let dest = dest_dir.join(name);
                let ok = download_one(&client, &url, &dest, opts.retries);
                bar.set_message(name.clone());
                bar.inc(1);
                if !ok {
                    warn!(shard = %name, url, "shard download failed");
                }
                ok
            })
            .collect()
    });
    bar.finish_and_clear();

    Ok(results.into_iter().filter(|ok| *ok).count())
}

/// Fetch one URL into `dest` atomically, retrying with linear backoff.
fn download_one(client: &reqwest::blocking::Client, url: &str, dest: &Path, retries: u32) -> bool {
    for attempt in 0..retries.max(1) {
        if attempt > 0 {
            std::thread::sleep(Duration::from_secs(2 * attempt as u64));
        }
        match try_download(client, url, dest) {
            Ok(()) => return true,
            Err(e) => {
                debug!(url, attempt, error = %e, "download attempt failed");
            }
        }
    }
    false
}

fn try_download(client: &reqwest::blocking::Client, url: &str, dest: &Path) -> Result<()> {
    let tmp: PathBuf = dest.with_extension("gz.download");

    let result = (|| -> Result<()> {
        let mut response = client.get(url).send()?.error_for_status()?;
        let mut file = File::create(&tmp)?;
        response.copy_to(&mut file)?;
        file.flush()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    if !gzip_is_valid(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::CorruptInput(format!(
            "{} did not gunzip cleanly",
            url
        )));
    }

    std::fs::rename(&tmp, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    #[test]
    fn test_shard_url() {
        assert_eq!(
            shard_url("https://data.commoncrawl.org", "CC-MAIN-2024-10", "cdx-00042.gz"),
            "https://data.commoncrawl.org/cc-index/collections/CC-MAIN-2024-10/indexes/cdx-00042.gz"
        );
        // Trailing slash on the base is tolerated.
        assert_eq!(
            shard_url("https://mirror.example/", "CC-MAIN-2024-10", "cdx-00000.gz"),
            "https://mirror.example/cc-index/collections/CC-MAIN-2024-10/indexes/cdx-00000.gz"
        );
    }

    #[test]
    fn test_gzip_is_valid() {
        let tmp = TempDir::new().unwrap();

        let good = tmp.path().join("good.gz");
        let file = File::create(&good).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(b"payload\n").unwrap();
        enc.finish().unwrap();
        assert!(gzip_is_valid(&good));

        let bad = tmp.path().join("bad.gz");
        std::fs::write(&bad, b"\x1f\x8b truncated garbage").unwrap();
        assert!(!gzip_is_valid(&bad));

        assert!(!gzip_is_valid(&tmp.path().join("missing.gz")));
    }
}
