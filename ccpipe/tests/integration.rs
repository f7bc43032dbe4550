//! Integration tests for the ccpipe CLI.

use std::io::Write;
use std::path::Path;
use std::process::Command;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

use ccindex::Config;

fn ccpipe_cmd(state_dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_ccpipe"));
    cmd.env("CCINDEX_STATE_DIR", state_dir);
    cmd
}

fn write_gz_shard(path: &Path, lines: &[String]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = std::fs::File::create(path).unwrap();
    let mut enc = GzEncoder::new(file, Compression::default());
    for line in lines {
        writeln!(enc, "{}", line).unwrap();
    }
    enc.finish().unwrap();
}

fn cdxj_line(host_rev: &str, url: &str, ts: &str, offset: i64) -> String {
    format!(
        r#"{hr})/ {ts} {{"url": "{url}", "mime": "text/html", "status": "200", "digest": "D{offset}", "length": "512", "offset": "{offset}", "filename": "crawl-data/CC-MAIN-2024-10/segments/1.0/warc/X.warc.gz"}}"#,
        hr = host_rev,
        ts = ts,
        url = url,
        offset = offset,
    )
}

/// Seed a state dir with persisted settings and one two-shard collection:
/// shard 0 has real captures, shard 1 is legitimately empty.
fn seed_collection(state_dir: &Path) -> Config {
    let mut config = Config::with_root(state_dir);
    config.expected_shards = 2;
    config.workers = 1;
    config.min_free_disk_gb = 0.0;
    config.min_free_memory_gb = 0.0;
    config.save().unwrap();

    let src = config.collection_source_dir("CC-MAIN-2024-10");
    write_gz_shard(
        &src.join("cdx-00000.gz"),
        &[
            "# cc-index".to_string(),
            cdxj_line("gov,18f", "https://18f.gov/", "20240310000000", 1024),
            cdxj_line("gov,18f", "https://18f.gov/about", "20240310000001", 4096),
            cdxj_line("gov,gsa", "https://gsa.gov/", "20240310000002", 8192),
        ],
    );
    write_gz_shard(
        &src.join("cdx-00001.gz"),
        &["# nothing but comments".to_string(), String::new()],
    );
    config
}

fn run_pipeline(state_dir: &Path) -> std::process::Output {
    ccpipe_cmd(state_dir)
        .args(["run", "--filter", "CC-MAIN-2024-10"])
        .output()
        .expect("failed to run ccpipe")
}

#[test]
fn test_pipeline_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let config = seed_collection(tmp.path());

    let output = run_pipeline(tmp.path());
    assert!(
        output.status.success(),
        "pipeline failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    // Shard 0 sorted, shard 1 marked empty, and never both shapes at once.
    let pq = config.collection_parquet_dir("CC-MAIN-2024-10");
    assert!(pq.join("cdx-00000.gz.sorted.parquet").exists());
    assert!(!pq.join("cdx-00000.gz.parquet").exists());
    assert!(pq.join("cdx-00001.gz.parquet.empty").exists());
    assert!(!pq.join("cdx-00001.gz.sorted.parquet").exists());

    // Index database plus sorted marker.
    assert!(config.collection_db_path("CC-MAIN-2024-10").exists());
    assert!(config.index_sorted_marker("CC-MAIN-2024-10").exists());

    // Validator agrees via the status command.
    let output = ccpipe_cmd(tmp.path())
        .args(["status", "--filter", "CC-MAIN-2024-10"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"complete\": true"), "status: {}", stdout);
}

#[test]
fn test_pipeline_rerun_is_noop_and_search_resolves() {
    let tmp = TempDir::new().unwrap();
    let config = seed_collection(tmp.path());

    assert!(run_pipeline(tmp.path()).status.success());

    // Second run skips the complete collection.
    let db_mtime = std::fs::metadata(config.collection_db_path("CC-MAIN-2024-10"))
        .unwrap()
        .modified()
        .unwrap();
    let output = run_pipeline(tmp.path());
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("already complete"), "stderr: {}", stderr);
    let db_mtime_after = std::fs::metadata(config.collection_db_path("CC-MAIN-2024-10"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(db_mtime, db_mtime_after, "re-run must not rewrite the index");

    // Build meta-indexes, then search through them.
    let output = ccpipe_cmd(tmp.path()).args(["meta"]).output().unwrap();
    assert!(output.status.success());
    assert!(config.master_db_path().exists());

    let output = ccpipe_cmd(tmp.path())
        .args(["search", "18f.gov", "--max-matches", "10"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let hits: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(hits.len(), 2);
    for hit in &hits {
        assert_eq!(hit["host"], "18f.gov");
        assert!(hit["warc_filename"].as_str().unwrap().contains("/warc/"));
    }

    // URL variants resolve to the same capture.
    let output = ccpipe_cmd(tmp.path())
        .args([
            "resolve",
            "http://18f.gov/about",
            "https://www.18f.gov/about/",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let resolved: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("resolve output is JSON");
    let a = &resolved["http://18f.gov/about"][0];
    let b = &resolved["https://www.18f.gov/about/"][0];
    assert_eq!(a["url"], "https://18f.gov/about");
    assert_eq!(a["warc_offset"], b["warc_offset"]);
}

#[test]
fn test_cleanup_dry_run_removes_nothing() {
    let tmp = TempDir::new().unwrap();
    let config = seed_collection(tmp.path());
    assert!(run_pipeline(tmp.path()).status.success());

    // Plant a duplicate unsorted parquet and a leftover tmp.
    let pq = config.collection_parquet_dir("CC-MAIN-2024-10");
    std::fs::write(pq.join("cdx-00000.gz.parquet"), b"dup").unwrap();
    std::fs::write(pq.join("cdx-00005.gz.parquet.tmp"), b"tmp").unwrap();

    let output = ccpipe_cmd(tmp.path())
        .args([
            "run",
            "--filter",
            "CC-MAIN-2024-10",
            "--cleanup-only",
            "--cleanup-dry-run",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cleanup candidate"), "stderr: {}", stderr);
    assert!(pq.join("cdx-00000.gz.parquet").exists());
    assert!(pq.join("cdx-00005.gz.parquet.tmp").exists());

    // Without --cleanup-dry-run the planned files are removed.
    let output = ccpipe_cmd(tmp.path())
        .args(["run", "--filter", "CC-MAIN-2024-10", "--cleanup-only", "--yes"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(!pq.join("cdx-00000.gz.parquet").exists());
    assert!(!pq.join("cdx-00005.gz.parquet.tmp").exists());
    assert!(pq.join("cdx-00000.gz.sorted.parquet").exists());
}

#[test]
fn test_fetch_served_from_range_cache() {
    let tmp = TempDir::new().unwrap();
    let config = seed_collection(tmp.path());

    // Seed the range cache so the fetch needs no network.
    let warc = "crawl-data/CC-MAIN-2024-10/segments/1.0/warc/X.warc.gz";
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(
        b"WARC/1.0\r\nWARC-Type: response\r\nContent-Length: 58\r\n\r\nHTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html>ok</html>",
    )
    .unwrap();
    let member = enc.finish().unwrap();

    let url = ccindex::warc::download_url(warc, ccindex::warc::DEFAULT_WARC_PREFIX);
    let cache_dir = config.warc_cache_dir.clone().unwrap();
    std::fs::create_dir_all(&cache_dir).unwrap();
    let cache_path =
        ccindex::warc::range_cache_path(&cache_dir, &url, 1024, 1024 + member.len() as i64 - 1);
    std::fs::write(&cache_path, &member).unwrap();

    let output = ccpipe_cmd(tmp.path())
        .args([
            "fetch",
            "--warc-filename",
            warc,
            "--offset",
            "1024",
            "--length",
            &member.len().to_string(),
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["fetch"]["ok"], true);
    assert_eq!(parsed["fetch"]["source"], "range_cache");
    assert_eq!(parsed["fetch"]["bytes_returned"], member.len() as i64);
    assert_eq!(parsed["http"]["http_status"], 200);
    assert_eq!(parsed["http"]["body_is_html"], true);
}

#[test]
fn test_jobs_list_empty_and_tail() {
    let tmp = TempDir::new().unwrap();
    seed_collection(tmp.path());

    let output = ccpipe_cmd(tmp.path()).args(["jobs", "list"]).output().unwrap();
    assert!(output.status.success());
    assert!(output.stdout.is_empty());

    let log = tmp.path().join("some.log");
    std::fs::write(&log, "one\ntwo\nthree\n").unwrap();
    let output = ccpipe_cmd(tmp.path())
        .args(["jobs", "tail", log.to_str().unwrap(), "--lines", "2"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "two\nthree");
}

#[test]
fn test_collections_list_requires_cache() {
    let tmp = TempDir::new().unwrap();
    seed_collection(tmp.path());

    let output = ccpipe_cmd(tmp.path())
        .args(["collections", "list"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    // Seed a manifest cache, then list with a year filter.
    let manifest = serde_json::json!([
        {"id": "CC-MAIN-2024-10", "name": "March 2024 Index"},
        {"id": "CC-MAIN-2023-50", "name": "December 2023 Index"},
    ]);
    let config = Config::with_root(tmp.path());
    std::fs::write(
        config.collinfo_cache_path(),
        serde_json::to_vec(&manifest).unwrap(),
    )
    .unwrap();

    let output = ccpipe_cmd(tmp.path())
        .args(["collections", "list", "--filter", "2024"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        "CC-MAIN-2024-10"
    );
}
