//! Pipeline orchestration: download, convert, sort and index each
//! collection, with resume, heartbeat supervision, auto-heal and cleanup.
//!
//! Heavy stages run as subprocesses of the current executable so each one
//! gets its own address space and DuckDB memory budget. The orchestrator
//! streams their output, emits a heartbeat line whenever a child goes
//! silent, and keeps a tail of recent output for failure attribution.
//!
//! State machine per collection:
//! NEW -> DOWNLOADED -> CONVERTED -> SORTED -> INDEXED -> COMPLETE, with
//! FAILED as the terminal state once the heal budget is exhausted. A failed
//! collection never stops the run for other collections; only up-front
//! resource exhaustion does.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::schema::{collection_year, shard_stem};
use crate::validator::{self, CollectionStatus};
use crate::{catalog, download, jobs, meta, slices, sort, Error, Result};

/// Options for one orchestrator run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Collection filter: "all", a 4-digit year, or an exact collection id.
    pub filter: String,
    /// Skip collections the validator reports complete.
    pub resume: bool,
    pub force_reindex: bool,
    pub download_only: bool,
    pub cleanup_only: bool,
    pub cleanup_dry_run: bool,
    pub assume_yes: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            filter: "all".to_string(),
            resume: true,
            force_reindex: false,
            download_only: false,
            cleanup_only: false,
            cleanup_dry_run: false,
            assume_yes: false,
        }
    }
}

/// Collection lifecycle states, derived from the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectionState {
    New,
    Downloaded,
    Converted,
    Sorted,
    Indexed,
    Complete,
    Failed,
}

/// Map a validator status onto the state machine.
pub fn state_of(status: &CollectionStatus) -> CollectionState {
    if status.complete {
        CollectionState::Complete
    } else if status.duckdb_index_exists && status.duckdb_index_sorted {
        CollectionState::Indexed
    } else if status.sorted_count >= status.parquet_expected {
        CollectionState::Sorted
    } else if status.parquet_count >= status.parquet_expected {
        CollectionState::Converted
    } else if status.tar_gz_count >= status.tar_gz_expected {
        CollectionState::Downloaded
    } else {
        CollectionState::New
    }
}

/// Per-run result: final state of every processed collection.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub processed: Vec<(String, CollectionState)>,
    pub ok: bool,
}

struct StageOutput {
    success: bool,
    tail: Vec<String>,
}

/// Pid file that marks this process as an active orchestrator; removed on
/// drop so stale files only survive crashes (liveness is re-checked anyway).
struct PidFileGuard {
    path: PathBuf,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Orchestrator {
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the pipeline over every collection selected by the filter.
    pub fn run(&self, opts: &RunOptions) -> Result<RunSummary> {
        info!("==== Common Crawl index pipeline ====");

        let peers = self.alive_orchestrators()?;
        if !peers.is_empty() {
            if opts.cleanup_only && !opts.cleanup_dry_run && !opts.assume_yes {
                return Err(Error::Contention(format!(
                    "pids {:?} (pass --yes to override)",
                    peers
                )));
            }
            warn!(?peers, "other orchestrator processes appear alive");
        }
        let _pid_guard = self.write_pid_file()?;

        if !(opts.cleanup_only && opts.cleanup_dry_run) {
            self.check_resources()?;
        }

        let collections = self.collections_for_filter(&opts.filter)?;
        if collections.is_empty() {
            warn!(filter = %opts.filter, "no collections matched the filter");
        }

        if opts.cleanup_only {
            for collection in &collections {
                self.cleanup_collection(collection, opts.cleanup_dry_run)?;
            }
            return Ok(RunSummary {
                processed: Vec::new(),
                ok: true,
            });
        }

        let mut processed = Vec::new();
        for collection in &collections {
            match self.process_collection(collection, opts) {
                Ok(state) => processed.push((collection.clone(), state)),
                Err(e) if matches!(e, Error::ResourceExhaustion(_)) => {
                    // Never grind on with too little memory or disk.
                    error!(collection, error = %e, "halting run");
                    processed.push((collection.clone(), CollectionState::Failed));
                    return Ok(RunSummary {
                        processed,
                        ok: false,
                    });
                }
                Err(e) => {
                    error!(collection, error = %e, "collection failed");
                    processed.push((collection.clone(), CollectionState::Failed));
                }
            }
        }

        let all_complete = processed
            .iter()
            .all(|(_, state)| *state == CollectionState::Complete);
        if all_complete && !opts.download_only && !processed.is_empty() {
            self.promote_meta_indexes(&opts.filter)?;
        }

        self.print_summary(&processed);
        Ok(RunSummary {
            ok: all_complete,
            processed,
        })
    }

    fn print_summary(&self, processed: &[(String, CollectionState)]) {
        info!("==== pipeline summary ====");
        for (collection, state) in processed {
            let status = validator::validate_collection(&self.config, collection);
            let pct = if status.parquet_expected > 0 {
                100.0 * status.sorted_count as f64 / status.parquet_expected as f64
            } else {
                0.0
            };
            info!(
                collection,
                state = ?state,
                sorted = %format!("{}/{}", status.sorted_count, status.parquet_expected),
                percent = %format!("{:.1}%", pct),
                indexed = status.duckdb_index_exists,
                "collection result"
            );
        }
    }

    /// After a full-year (or "all") run completes, rebuild the year and
    /// master meta-indexes.
    fn promote_meta_indexes(&self, filter: &str) -> Result<()> {
        let year = filter.parse::<i32>().ok().filter(|_| filter.len() == 4);
        if year.is_none() && !filter.eq_ignore_ascii_case("all") {
            // Single-collection filters never promote.
            return Ok(());
        }
        info!(?year, "building meta-indexes");
        meta::build_meta_indexes(&self.config, year)
    }

    /// Resolve the filter against the catalog, falling back to collections
    /// already on disk when no manifest is cached.
    fn collections_for_filter(&self, filter: &str) -> Result<Vec<String>> {
        match catalog::load_cached(&self.config) {
            Ok(infos) => Ok(catalog::filter_collections(&infos, filter)),
            Err(Error::NotFound(_)) => {
                let known = self.collections_from_disk()?;
                if filter.eq_ignore_ascii_case("all") {
                    return Ok(known);
                }
                if filter.len() == 4 && filter.bytes().all(|b| b.is_ascii_digit()) {
                    let year: i32 = filter.parse().unwrap_or(0);
                    return Ok(known
                        .into_iter()
                        .filter(|c| collection_year(c) == Some(year))
                        .collect());
                }
                // Exact ids are usable even if nothing is on disk yet.
                Ok(vec![filter.to_string()])
            }
            Err(e) => Err(e),
        }
    }

    fn collections_from_disk(&self) -> Result<Vec<String>> {
        let mut names = std::collections::BTreeSet::new();
        if self.config.ccindex_root.exists() {
            for entry in std::fs::read_dir(&self.config.ccindex_root)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if collection_year(&name).is_some() {
                        names.insert(name);
                    }
                }
            }
        }
        for cref in meta::scan_collection_dbs(&self.config)? {
            names.insert(cref.collection);
        }
        Ok(names.into_iter().collect())
    }

    /// Fail fast when memory or disk is below the configured floor.
    fn check_resources(&self) -> Result<()> {
        if let Some(mem) = sort::available_memory_gb() {
            if mem < self.config.min_free_memory_gb {
                return Err(Error::ResourceExhaustion(format!(
                    "{:.1} GB memory available, need {:.1} GB",
                    mem, self.config.min_free_memory_gb
                )));
            }
        }
        std::fs::create_dir_all(&self.config.parquet_root)?;
        if let Some(disk) = sort::free_disk_gb(&self.config.parquet_root) {
            if disk < self.config.min_free_disk_gb {
                return Err(Error::ResourceExhaustion(format!(
                    "{:.1} GB disk free at {}, need {:.1} GB",
                    disk,
                    self.config.parquet_root.display(),
                    self.config.min_free_disk_gb
                )));
            }
        }
        Ok(())
    }

    /// Pids of other live orchestrator-like processes (from pid files under
    /// the log dir).
    fn alive_orchestrators(&self) -> Result<Vec<u32>> {
        let mut alive = Vec::new();
        let dir = &self.config.log_dir;
        if !dir.exists() {
            return Ok(alive);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".pid") {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(pid) = contents.trim().parse::<u32>() else {
                continue;
            };
            if pid != std::process::id() && jobs::pid_alive(pid) {
                alive.push(pid);
            }
        }
        Ok(alive)
    }

    fn write_pid_file(&self) -> Result<PidFileGuard> {
        std::fs::create_dir_all(&self.config.log_dir)?;
        let path = self
            .config
            .log_dir
            .join(format!("orchestrator_{}.pid", std::process::id()));
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(PidFileGuard { path })
    }

    /// Drive one collection through the stage machine.
    pub fn process_collection(
        &self,
        collection: &str,
        opts: &RunOptions,
    ) -> Result<CollectionState> {
        info!("processing collection {}", collection);

        let status = validator::validate_collection(&self.config, collection);
        if opts.resume && status.complete && !opts.force_reindex {
            info!(collection, "already complete, skipping");
            return Ok(CollectionState::Complete);
        }

        // Stage 1: download.
        if status.tar_gz_count < status.tar_gz_expected {
            info!(collection, "pipeline stage: download");
            let stats = download::download_collection(
                &self.config,
                collection,
                &download::DownloadOptions {
                    workers: self.config.workers,
                    ..Default::default()
                },
            )?;
            if stats.failed > 0 {
                return Err(Error::Stage(format!(
                    "{} shard downloads failed for {}",
                    stats.failed, collection
                )));
            }
        }
        if opts.download_only {
            return Ok(state_of(&validator::validate_collection(
                &self.config,
                collection,
            )));
        }

        // Stage 2: convert.
        let status = validator::validate_collection(&self.config, collection);
        if status.parquet_count < status.parquet_expected {
            info!(collection, "pipeline stage: convert");
            self.stage_convert(collection, &[])?;
            self.heal_missing_conversions(collection)?;
        }

        // Stage 3: sort.
        let status = validator::validate_collection(&self.config, collection);
        if status.sorted_count < status.parquet_expected {
            info!(collection, "pipeline stage: sort");
            let output = self.run_stage(&self.sort_args(collection, None, &[]), "sort", 50)?;
            let missing = validator::missing_sorted_stems(&self.config, collection);
            if !output.success || !missing.is_empty() {
                warn!(
                    collection,
                    missing = missing.len(),
                    "sort stage incomplete, attempting auto-heal"
                );
                if !self.autoheal_failed_sorts(collection)? {
                    return Err(Error::Stage(format!(
                        "sort auto-heal failed for {}",
                        collection
                    )));
                }
            }
        }

        // Stage 4: index.
        let status = validator::validate_collection(&self.config, collection);
        if !status.duckdb_index_exists || !status.duckdb_index_sorted || opts.force_reindex {
            info!(collection, "pipeline stage: index");
            if opts.force_reindex {
                self.invalidate_index(collection)?;
            }
            self.stage_index_with_heal(collection, opts.force_reindex)?;
        }

        let status = validator::validate_collection(&self.config, collection);
        if status.complete && self.config.cleanup_enabled {
            self.cleanup_collection(collection, false)?;
        }

        Ok(state_of(&validator::validate_collection(
            &self.config,
            collection,
        )))
    }

    /// Delete a collection's index database and sorted marker.
    fn invalidate_index(&self, collection: &str) -> Result<()> {
        for path in [
            self.config.collection_db_path(collection),
            self.config.index_sorted_marker(collection),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    // ----- stage subprocess plumbing -----

    fn stage_env(&self) -> (&'static str, String) {
        (
            "CCINDEX_STATE_DIR",
            self.config.state_dir.to_string_lossy().to_string(),
        )
    }

    /// Run a stage helper subprocess, streaming output with heartbeats.
    fn run_stage(&self, args: &[String], label: &str, tail_lines: usize) -> Result<StageOutput> {
        let exe = std::env::current_exe()?;
        info!("[{}] running: {} {}", label, exe.display(), args.join(" "));

        let (env_key, env_val) = self.stage_env();
        let mut child = Command::new(&exe)
            .args(args)
            .env(env_key, env_val)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let last_output = Arc::new(Mutex::new(Instant::now()));
        let tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));

        let mut readers = Vec::new();
        let streams: Vec<Box<dyn std::io::Read + Send>> = vec![
            Box::new(child.stdout.take().ok_or_else(|| Error::Stage("no stdout".into()))?),
            Box::new(child.stderr.take().ok_or_else(|| Error::Stage("no stderr".into()))?),
        ];
        for stream in streams {
            let label = label.to_string();
            let last_output = Arc::clone(&last_output);
            let tail = Arc::clone(&tail);
            readers.push(std::thread::spawn(move || {
                for line in BufReader::new(stream).lines().map_while(|l| l.ok()) {
                    info!("[{}] {}", label, line);
                    if let Ok(mut guard) = last_output.lock() {
                        *guard = Instant::now();
                    }
                    if tail_lines > 0 {
                        if let Ok(mut guard) = tail.lock() {
                            guard.push_back(line);
                            while guard.len() > tail_lines {
                                guard.pop_front();
                            }
                        }
                    }
                }
            }));
        }

        let heartbeat = Duration::from_secs(self.config.heartbeat_seconds.max(1));
        let start = Instant::now();
        let mut last_beat = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            std::thread::sleep(Duration::from_millis(500));

            let silent_for = last_output
                .lock()
                .map(|guard| guard.elapsed())
                .unwrap_or_default();
            if silent_for >= heartbeat && last_beat.elapsed() >= heartbeat {
                info!(
                    "[{}] heartbeat: still running (elapsed {:.1} min)",
                    label,
                    start.elapsed().as_secs_f64() / 60.0
                );
                last_beat = Instant::now();
            }
        };
        for reader in readers {
            let _ = reader.join();
        }

        let tail = tail
            .lock()
            .map(|guard| guard.iter().cloned().collect())
            .unwrap_or_default();
        Ok(StageOutput {
            success: status.success(),
            tail,
        })
    }

    fn convert_args(&self, collection: &str, only: &[String]) -> Vec<String> {
        let mut args = vec![
            "convert".to_string(),
            "--collection".to_string(),
            collection.to_string(),
            "--input-dir".to_string(),
            self.config
                .collection_source_dir(collection)
                .to_string_lossy()
                .to_string(),
            "--output-dir".to_string(),
            self.config
                .collection_parquet_dir(collection)
                .to_string_lossy()
                .to_string(),
            "--workers".to_string(),
            self.config.workers.to_string(),
        ];
        for name in only {
            args.push("--only".to_string());
            args.push(name.clone());
        }
        args
    }

    fn sort_args(&self, collection: &str, memory_gb: Option<f64>, only: &[String]) -> Vec<String> {
        let mut args = vec![
            "sort".to_string(),
            "--parquet-root".to_string(),
            self.config
                .collection_parquet_dir(collection)
                .to_string_lossy()
                .to_string(),
            "--sort-unsorted".to_string(),
            "--workers".to_string(),
            self.config.workers.to_string(),
        ];
        if only.is_empty() {
            if let Some(n) = self.config.sort_workers {
                args.push("--sort-workers".to_string());
                args.push(n.to_string());
            }
        } else {
            args.push("--sort-workers".to_string());
            args.push("1".to_string());
        }
        args.push("--memory-per-sort".to_string());
        args.push(
            memory_gb
                .unwrap_or(self.config.sort_memory_per_worker_gb)
                .to_string(),
        );
        if let Some(dir) = &self.config.sort_temp_dir {
            args.push("--temp-dir".to_string());
            args.push(dir.to_string_lossy().to_string());
        }
        for name in only {
            args.push("--only".to_string());
            args.push(name.clone());
        }
        args
    }

    fn index_args(&self, collection: &str, force: bool) -> Vec<String> {
        let mut args = vec![
            "index".to_string(),
            "--collection".to_string(),
            collection.to_string(),
        ];
        if force {
            args.push("--force-reindex".to_string());
        }
        args
    }

    fn stage_convert(&self, collection: &str, only: &[String]) -> Result<()> {
        let output = self.run_stage(&self.convert_args(collection, only), "convert", 0)?;
        if !output.success {
            return Err(Error::Stage(format!("convert failed for {}", collection)));
        }
        Ok(())
    }

    /// Find shards with no Parquet artifact after conversion; re-download
    /// broken sources and convert them again.
    fn heal_missing_conversions(&self, collection: &str) -> Result<()> {
        let status = validator::validate_collection(&self.config, collection);
        if status.parquet_count >= status.parquet_expected {
            return Ok(());
        }

        let parquet_dir = self.config.collection_parquet_dir(collection);
        let source_dir = self.config.collection_source_dir(collection);
        let mut missing_gz = Vec::new();
        let mut missing_only = Vec::new();
        for i in 0..self.config.expected_shards {
            let stem = format!("cdx-{:05}", i);
            let has_artifact = parquet_dir.join(format!("{}.gz.parquet", stem)).exists()
                || parquet_dir.join(format!("{}.gz.sorted.parquet", stem)).exists()
                || parquet_dir.join(format!("{}.gz.parquet.empty", stem)).exists();
            if has_artifact {
                continue;
            }
            let gz_name = format!("{}.gz", stem);
            let gz = source_dir.join(&gz_name);
            if !gz.exists() || !download::gzip_is_valid(&gz) {
                if gz.exists() {
                    let _ = std::fs::remove_file(&gz);
                }
                missing_gz.push(gz_name.clone());
            }
            missing_only.push(gz_name);
        }

        if !missing_gz.is_empty() {
            warn!(
                collection,
                shards = missing_gz.len(),
                "re-downloading broken source shards"
            );
            download::download_shards(
                &self.config,
                collection,
                &missing_gz,
                &download::DownloadOptions::default(),
            )?;
        }
        if !missing_only.is_empty() {
            self.stage_convert(collection, &missing_only)?;
        }

        let status = validator::validate_collection(&self.config, collection);
        if status.parquet_count < status.parquet_expected {
            return Err(Error::Stage(format!(
                "{}/{} shards converted for {}",
                status.parquet_count, status.parquet_expected, collection
            )));
        }
        Ok(())
    }

    /// Escalating per-sort memory budget: 1x, 2x, 4x base, clamped to
    /// [2, 32] GB.
    fn sort_memory_candidates(&self) -> Vec<f64> {
        let base = self.config.sort_memory_per_worker_gb.max(0.1);
        let mut candidates: Vec<f64> = [1.0, 2.0, 4.0]
            .iter()
            .map(|mult| (base * mult).clamp(2.0, 32.0))
            .collect();
        candidates.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);
        candidates
    }

    /// Heal shard-level sort failures.
    ///
    /// Per missing shard: (A) targeted re-sort with escalating memory,
    /// (B) delete + re-convert then re-sort, (C) re-download the source
    /// shard, re-convert, re-sort.
    fn autoheal_failed_sorts(&self, collection: &str) -> Result<bool> {
        let missing = validator::missing_sorted_stems(&self.config, collection);
        if missing.is_empty() {
            warn!(collection, "sort failed but no missing shards were detected");
            return Ok(false);
        }
        warn!(
            collection,
            missing = missing.len(),
            first = ?missing.iter().take(10).collect::<Vec<_>>(),
            "attempting sort auto-heal"
        );

        let parquet_dir = self.config.collection_parquet_dir(collection);
        let candidates = self.sort_memory_candidates();

        for stem in &missing {
            let sorted = parquet_dir.join(format!("{}.gz.sorted.parquet", stem));
            let empty = parquet_dir.join(format!("{}.gz.parquet.empty", stem));
            let healed = |paths: (&PathBuf, &PathBuf)| paths.0.exists() || paths.1.exists();

            // (A) Targeted re-sort with escalating memory.
            for memory_gb in &candidates {
                if healed((&sorted, &empty)) {
                    break;
                }
                warn!(collection, stem, memory_gb, "retrying sort");
                let _ = self.targeted_sort(collection, stem, *memory_gb);
            }
            if healed((&sorted, &empty)) {
                info!(collection, stem, "healed by targeted re-sort");
                continue;
            }

            // (B) Re-convert, then re-sort.
            warn!(collection, stem, "re-converting parquet and retrying sort");
            if self.reconvert_shard(collection, stem)? {
                for memory_gb in &candidates {
                    if healed((&sorted, &empty)) {
                        break;
                    }
                    let _ = self.targeted_sort(collection, stem, *memory_gb);
                }
            }
            if healed((&sorted, &empty)) {
                info!(collection, stem, "healed after re-convert");
                continue;
            }

            // (C) Re-download the source shard, re-convert, re-sort.
            warn!(collection, stem, "re-downloading source shard and retrying");
            let gz_name = format!("{}.gz", stem);
            let gz = self.config.collection_source_dir(collection).join(&gz_name);
            let _ = std::fs::remove_file(&gz);
            download::download_shards(
                &self.config,
                collection,
                std::slice::from_ref(&gz_name),
                &download::DownloadOptions::default(),
            )?;
            if self.reconvert_shard(collection, stem)? {
                for memory_gb in &candidates {
                    if healed((&sorted, &empty)) {
                        break;
                    }
                    let _ = self.targeted_sort(collection, stem, *memory_gb);
                }
            }

            if !healed((&sorted, &empty)) {
                error!(collection, stem, "unable to auto-heal sort");
                return Ok(false);
            }
            info!(collection, stem, "healed after re-download and re-convert");
        }
        Ok(true)
    }

    fn targeted_sort(&self, collection: &str, stem: &str, memory_gb: f64) -> Result<bool> {
        let unsorted_name = format!("{}.gz.parquet", stem);
        let parquet_dir = self.config.collection_parquet_dir(collection);
        if !parquet_dir.join(&unsorted_name).exists() {
            return Ok(false);
        }
        let output = self.run_stage(
            &self.sort_args(collection, Some(memory_gb), &[unsorted_name]),
            "sort-heal",
            0,
        )?;
        let sorted = parquet_dir.join(format!("{}.gz.sorted.parquet", stem));
        Ok(output.success && sorted.exists())
    }

    /// Drop every artifact of a shard and convert it again from the source.
    fn reconvert_shard(&self, collection: &str, stem: &str) -> Result<bool> {
        let parquet_dir = self.config.collection_parquet_dir(collection);
        for suffix in [".gz.parquet", ".gz.sorted.parquet", ".gz.parquet.empty", ".gz.parquet.tmp"] {
            let path = parquet_dir.join(format!("{}{}", stem, suffix));
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
        }

        let gz_name = format!("{}.gz", stem);
        let output = self.run_stage(
            &self.convert_args(collection, std::slice::from_ref(&gz_name)),
            "convert-heal",
            0,
        )?;
        let unsorted = parquet_dir.join(format!("{}.gz.parquet", stem));
        let empty = parquet_dir.join(format!("{}.gz.parquet.empty", stem));
        Ok(output.success && (unsorted.exists() || empty.exists()))
    }

    /// Run the index stage, routing corrupt-Parquet failures through the
    /// shard heal chain before retrying. Bounded at three attempts.
    fn stage_index_with_heal(&self, collection: &str, force: bool) -> Result<()> {
        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 0..MAX_ATTEMPTS {
            let output = self.run_stage(&self.index_args(collection, force), "index", 50)?;
            if output.success {
                // Slice index rides along with a successful index build.
                slices::build_rowgroup_slices(&self.config, collection)?;
                return Ok(());
            }

            if !tail_has_corrupt_signal(&output.tail) || attempt + 1 == MAX_ATTEMPTS {
                return Err(Error::Stage(format!(
                    "index build failed for {} (attempt {})",
                    collection,
                    attempt + 1
                )));
            }

            let Some(stem) = extract_indexing_shard_stem(&output.tail) else {
                return Err(Error::CorruptInput(format!(
                    "index build hit corrupt parquet for {} but no shard could be identified",
                    collection
                )));
            };
            warn!(collection, stem, "corrupt parquet during indexing, healing shard");

            let sorted = self
                .config
                .collection_parquet_dir(collection)
                .join(format!("{}.gz.sorted.parquet", stem));
            let _ = std::fs::remove_file(&sorted);

            let mut healed = false;
            for memory_gb in self.sort_memory_candidates() {
                if self.targeted_sort(collection, &stem, memory_gb)? {
                    healed = true;
                    break;
                }
            }
            if !healed && self.reconvert_shard(collection, &stem)? {
                for memory_gb in self.sort_memory_candidates() {
                    if self.targeted_sort(collection, &stem, memory_gb)? {
                        healed = true;
                        break;
                    }
                }
            }
            if !healed {
                return Err(Error::CorruptInput(format!(
                    "could not heal shard {} of {}",
                    stem, collection
                )));
            }
        }
        unreachable!("loop returns on success or error");
    }

    // ----- cleanup -----

    /// Compute a safe cleanup plan: (path, reason) pairs.
    pub fn plan_collection_cleanup(&self, collection: &str) -> Result<Vec<(PathBuf, String)>> {
        let mut plan: Vec<(PathBuf, String)> = Vec::new();
        let parquet_dir = self.config.collection_parquet_dir(collection);

        if parquet_dir.exists() {
            for entry in std::fs::read_dir(&parquet_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let path = entry.path();

                if name.ends_with(".tmp") {
                    plan.push((path, "leftover tmp".to_string()));
                    continue;
                }
                if name.ends_with(".parquet")
                    && entry.metadata().map(|m| m.is_file() && m.len() == 0).unwrap_or(false)
                {
                    plan.push((path, "zero-byte parquet".to_string()));
                    continue;
                }
                if name.ends_with(".gz.parquet") && !name.ends_with(".sorted.parquet") {
                    let sorted = parquet_dir.join(name.replace(".gz.parquet", ".gz.sorted.parquet"));
                    if sorted.exists() {
                        plan.push((path, "duplicate unsorted (sorted exists)".to_string()));
                        continue;
                    }
                }
                if name.starts_with("duckdb_sort_") && path.is_dir() {
                    let is_empty = std::fs::read_dir(&path)
                        .map(|mut it| it.next().is_none())
                        .unwrap_or(false);
                    if is_empty {
                        plan.push((path, "empty sort work dir".to_string()));
                    }
                }
            }
        }

        if self.config.cleanup_source_archives {
            let status = validator::validate_collection(&self.config, collection);
            if status.complete {
                let src_dir = self.config.collection_source_dir(collection);
                if src_dir.exists() {
                    for entry in std::fs::read_dir(&src_dir)? {
                        let entry = entry?;
                        let name = entry.file_name().to_string_lossy().to_string();
                        if name.ends_with(".tar.gz") {
                            plan.push((entry.path(), "source tar.gz (collection complete)".to_string()));
                        } else if name.ends_with(".gz") && shard_stem(&name).is_some() {
                            plan.push((entry.path(), "source shard gz (collection complete)".to_string()));
                        }
                    }
                    plan.push((src_dir, "empty source dir".to_string()));
                }
            }
        }

        Ok(plan)
    }

    /// Execute (or just log) a cleanup plan.
    fn execute_cleanup_plan(
        &self,
        collection: &str,
        plan: &[(PathBuf, String)],
        dry_run: bool,
    ) -> Result<()> {
        let mut bytes: u64 = 0;
        for (path, reason) in plan {
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            bytes += size;
            if dry_run {
                info!(collection, path = %path.display(), reason, size, "cleanup candidate");
            }
        }
        if dry_run {
            info!(
                collection,
                candidates = plan.len(),
                estimated_bytes = bytes,
                "cleanup dry-run complete, nothing removed"
            );
            return Ok(());
        }

        let mut removed = 0usize;
        for (path, reason) in plan {
            let result = if path.is_dir() {
                // Directories in the plan are only removed when empty.
                std::fs::remove_dir(path)
            } else {
                std::fs::remove_file(path)
            };
            match result {
                Ok(()) => {
                    removed += 1;
                    info!(collection, path = %path.display(), reason, "removed");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(collection, path = %path.display(), error = %e, "cleanup failed"),
            }
        }
        info!(collection, removed, reclaimed_bytes = bytes, "cleanup finished");
        Ok(())
    }

    /// Plan and run cleanup for one collection.
    pub fn cleanup_collection(&self, collection: &str, dry_run: bool) -> Result<()> {
        let plan = self.plan_collection_cleanup(collection)?;
        if plan.is_empty() {
            info!(collection, "nothing to clean up");
            return Ok(());
        }
        self.execute_cleanup_plan(collection, &plan, dry_run)
    }
}

/// Does a stage output tail contain a corrupt-Parquet signal?
fn tail_has_corrupt_signal(tail: &[String]) -> bool {
    tail.iter().any(|line| {
        let lowered = line.to_ascii_lowercase();
        lowered.contains("invalid utf-8")
            || lowered.contains("invalid unicode")
            || lowered.contains("corrupt")
            || lowered.contains("invalid input")
    })
}

/// Pull the most recent `cdx-NNNNN` stem out of a stage output tail.
fn extract_indexing_shard_stem(tail: &[String]) -> Option<String> {
    for line in tail.iter().rev() {
        if let Some(idx) = line.rfind("cdx-") {
            let digits: String = line[idx + 4..].chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.len() == 5 {
                return Some(format!("cdx-{}", digits));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &std::path::Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_state_of_progression() {
        let mut status = CollectionStatus {
            collection: "CC-MAIN-2024-10".to_string(),
            tar_gz_count: 0,
            tar_gz_expected: 2,
            parquet_count: 0,
            parquet_expected: 2,
            sorted_count: 0,
            duckdb_index_exists: false,
            duckdb_index_sorted: false,
            complete: false,
        };
        assert_eq!(state_of(&status), CollectionState::New);

        status.tar_gz_count = 2;
        assert_eq!(state_of(&status), CollectionState::Downloaded);

        status.parquet_count = 2;
        assert_eq!(state_of(&status), CollectionState::Converted);

        status.sorted_count = 2;
        assert_eq!(state_of(&status), CollectionState::Sorted);

        status.duckdb_index_exists = true;
        status.duckdb_index_sorted = true;
        assert_eq!(state_of(&status), CollectionState::Indexed);

        status.complete = true;
        assert_eq!(state_of(&status), CollectionState::Complete);
    }

    #[test]
    fn test_sort_memory_candidates_escalate_and_cap() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        config.sort_memory_per_worker_gb = 4.0;
        let orch = Orchestrator::new(config);
        assert_eq!(orch.sort_memory_candidates(), vec![4.0, 8.0, 16.0]);

        let mut config = Config::with_root(tmp.path());
        config.sort_memory_per_worker_gb = 16.0;
        let orch = Orchestrator::new(config);
        // 4x base would be 64 GB; capped at 32 and deduplicated.
        assert_eq!(orch.sort_memory_candidates(), vec![16.0, 32.0]);
    }

    #[test]
    fn test_tail_corrupt_signal_and_stem_extraction() {
        let tail = vec![
            "indexing shard cdx-00041".to_string(),
            "indexing shard cdx-00042".to_string(),
            "Error: Invalid Input Error: invalid UTF-8 in column url".to_string(),
        ];
        assert!(tail_has_corrupt_signal(&tail));
        assert_eq!(extract_indexing_shard_stem(&tail).as_deref(), Some("cdx-00042"));

        let clean = vec!["all good".to_string()];
        assert!(!tail_has_corrupt_signal(&clean));
        assert_eq!(extract_indexing_shard_stem(&clean), None);
    }

    #[test]
    fn test_cleanup_plan_and_dry_run() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        config.expected_shards = 1;
        let collection = "CC-MAIN-2024-10";
        let pq = config.collection_parquet_dir(collection);

        touch(&pq.join("cdx-00000.gz.sorted.parquet"), b"sorted");
        touch(&pq.join("cdx-00000.gz.parquet"), b"dup");
        touch(&pq.join("cdx-00001.gz.parquet"), b"");
        touch(&pq.join("cdx-00002.gz.parquet.tmp"), b"partial");

        let orch = Orchestrator::new(config);
        let plan = orch.plan_collection_cleanup(collection).unwrap();
        let reasons: Vec<&str> = plan.iter().map(|(_, r)| r.as_str()).collect();
        assert!(reasons.contains(&"duplicate unsorted (sorted exists)"));
        assert!(reasons.contains(&"zero-byte parquet"));
        assert!(reasons.contains(&"leftover tmp"));

        // Dry run removes nothing.
        orch.cleanup_collection(collection, true).unwrap();
        assert!(pq.join("cdx-00000.gz.parquet").exists());

        // Real run removes exactly the planned files.
        orch.cleanup_collection(collection, false).unwrap();
        assert!(!pq.join("cdx-00000.gz.parquet").exists());
        assert!(!pq.join("cdx-00001.gz.parquet").exists());
        assert!(!pq.join("cdx-00002.gz.parquet.tmp").exists());
        assert!(pq.join("cdx-00000.gz.sorted.parquet").exists());
    }

    #[test]
    fn test_cleanup_source_archives_requires_complete() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        config.expected_shards = 1;
        config.cleanup_source_archives = true;
        let collection = "CC-MAIN-2024-10";

        touch(&config.collection_source_dir(collection).join("cdx-00000.gz"), b"gz");

        // Incomplete: sources are never planned for deletion.
        let orch = Orchestrator::new(config.clone());
        let plan = orch.plan_collection_cleanup(collection).unwrap();
        assert!(plan.iter().all(|(_, r)| !r.contains("source")));

        // Complete: sources join the plan.
        touch(
            &config.collection_parquet_dir(collection).join("cdx-00000.gz.sorted.parquet"),
            b"sorted",
        );
        touch(&config.collection_db_path(collection), b"db");
        touch(&config.index_sorted_marker(collection), b"marker");
        let plan = orch.plan_collection_cleanup(collection).unwrap();
        assert!(plan.iter().any(|(_, r)| r.contains("source shard gz")));
    }

    #[test]
    fn test_contention_ignores_self_and_dead_pids() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        std::fs::create_dir_all(&config.log_dir).unwrap();
        std::fs::write(
            config.log_dir.join("orchestrator_self.pid"),
            std::process::id().to_string(),
        )
        .unwrap();
        std::fs::write(config.log_dir.join("orchestrator_dead.pid"), "4000000").unwrap();

        let orch = Orchestrator::new(config);
        assert!(orch.alive_orchestrators().unwrap().is_empty());
    }

    #[test]
    fn test_collections_for_filter_falls_back_to_disk() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        std::fs::create_dir_all(config.ccindex_root.join("CC-MAIN-2024-10")).unwrap();
        std::fs::create_dir_all(config.ccindex_root.join("CC-MAIN-2023-50")).unwrap();
        std::fs::create_dir_all(config.ccindex_root.join("not-a-collection")).unwrap();

        let orch = Orchestrator::new(config);
        assert_eq!(
            orch.collections_for_filter("all").unwrap(),
            vec!["CC-MAIN-2023-50", "CC-MAIN-2024-10"]
        );
        assert_eq!(
            orch.collections_for_filter("2024").unwrap(),
            vec!["CC-MAIN-2024-10"]
        );
        assert_eq!(
            orch.collections_for_filter("CC-MAIN-2022-05").unwrap(),
            vec!["CC-MAIN-2022-05"]
        );
    }
}
