//! CLI command implementations.

use std::path::{Path, PathBuf};

use ccindex::orchestrator::{Orchestrator, RunOptions};
use ccindex::sort::SortOptions;
use ccindex::warc::{FetchOptions, WarcFetcher};
use ccindex::{
    catalog, convert, indexer, jobs, meta, sort as sorter, validator, Config, Error, Lookup,
    ResolveOptions, Result, SearchOptions,
};

/// Path and tuning overrides accepted by `ccpipe run`.
#[derive(Debug, Default)]
pub struct RunOverrides {
    pub ccindex_root: Option<PathBuf>,
    pub parquet_root: Option<PathBuf>,
    pub duckdb_collection_root: Option<PathBuf>,
    pub duckdb_year_root: Option<PathBuf>,
    pub duckdb_master_root: Option<PathBuf>,
    pub workers: Option<usize>,
    pub sort_workers: Option<usize>,
    pub sort_memory_per_worker_gb: Option<f64>,
    pub sort_temp_dir: Option<PathBuf>,
    pub heartbeat_seconds: Option<u64>,
    pub index_mode: Option<String>,
    pub cleanup_source_archives: bool,
}

impl RunOverrides {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(dir) = self.ccindex_root {
            config.ccindex_root = dir;
        }
        if let Some(dir) = self.parquet_root {
            config.parquet_root = dir;
        }
        if let Some(dir) = self.duckdb_collection_root {
            config.duckdb_collection_root = dir;
        }
        if let Some(dir) = self.duckdb_year_root {
            config.duckdb_year_root = dir;
        }
        if let Some(dir) = self.duckdb_master_root {
            config.duckdb_master_root = dir;
        }
        if let Some(n) = self.workers {
            config.workers = n;
        }
        if self.sort_workers.is_some() {
            config.sort_workers = self.sort_workers;
        }
        if let Some(gb) = self.sort_memory_per_worker_gb {
            config.sort_memory_per_worker_gb = gb;
        }
        if self.sort_temp_dir.is_some() {
            config.sort_temp_dir = self.sort_temp_dir;
        }
        if let Some(s) = self.heartbeat_seconds {
            config.heartbeat_seconds = s;
        }
        if let Some(mode) = self.index_mode {
            config.index_mode = mode.parse()?;
        }
        if self.cleanup_source_archives {
            config.cleanup_source_archives = true;
        }
        Ok(())
    }
}

pub fn run(
    overrides: RunOverrides,
    filter: String,
    download_only: bool,
    cleanup_only: bool,
    cleanup_dry_run: bool,
    force_reindex: bool,
    yes: bool,
) -> Result<()> {
    let mut config = Config::load()?;
    overrides.apply(&mut config)?;

    let orchestrator = Orchestrator::new(config);
    let summary = orchestrator.run(&RunOptions {
        filter,
        resume: true,
        force_reindex,
        download_only,
        cleanup_only,
        cleanup_dry_run,
        assume_yes: yes,
    })?;

    if !summary.ok {
        std::process::exit(1);
    }
    Ok(())
}

pub fn convert(
    collection: &str,
    input_dir: &Path,
    output_dir: &Path,
    workers: usize,
    overwrite: bool,
    only: &[String],
) -> Result<()> {
    let config = Config::load()?;
    let stats = convert::convert_collection(
        &config, collection, input_dir, output_dir, workers, overwrite, only,
    )?;
    if stats.failed > 0 {
        return Err(Error::Stage(format!(
            "{} shard conversions failed",
            stats.failed
        )));
    }
    Ok(())
}

pub fn sort(
    parquet_root: &Path,
    workers: usize,
    sort_workers: Option<usize>,
    memory_per_sort: Option<f64>,
    temp_dir: Option<PathBuf>,
    only: &[String],
) -> Result<()> {
    let mut config = Config::load()?;
    config.workers = workers;
    let stats = sorter::sort_collection(
        &config,
        parquet_root,
        &SortOptions {
            sort_workers,
            memory_per_sort_gb: memory_per_sort,
            temp_dir,
            only: only.to_vec(),
        },
    )?;
    if stats.failed > 0 {
        return Err(Error::Stage(format!("{} sorts failed", stats.failed)));
    }
    Ok(())
}

pub fn index(collection: &str, force_reindex: bool, create_indexes: bool) -> Result<()> {
    let mut config = Config::load()?;
    if create_indexes {
        config.create_indexes = true;
    }
    indexer::build_collection_index(
        &config,
        collection,
        indexer::IndexOptions { force_reindex },
    )?;
    Ok(())
}

pub fn meta(year: Option<i32>) -> Result<()> {
    let config = Config::load()?;
    meta::build_meta_indexes(&config, year)
}

pub fn status(filter: &str) -> Result<()> {
    let config = Config::load()?;
    let collections = match catalog::load_cached(&config) {
        Ok(infos) => catalog::filter_collections(&infos, filter),
        Err(Error::NotFound(_)) if filter != "all" => vec![filter.to_string()],
        Err(Error::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e),
    };

    let mut statuses = Vec::new();
    for collection in &collections {
        let status = validator::validate_collection(&config, collection);
        let usage = validator::disk_usage(&config, collection);
        statuses.push(serde_json::json!({
            "status": status,
            "size_on_disk_bytes": usage.total(),
            "size_breakdown_bytes": usage,
        }));
    }
    println!("{}", serde_json::to_string_pretty(&statuses).map_err(json_err)?);
    Ok(())
}

pub fn search(
    domain: &str,
    year: Option<i32>,
    max_matches: usize,
    per_parquet_limit: usize,
) -> Result<()> {
    let config = Config::load()?;
    let lookup = Lookup::new(&config);
    let result = lookup.search_domain(
        domain,
        &SearchOptions {
            year,
            max_matches,
            per_parquet_limit,
        },
    )?;

    for record in &result.records {
        println!("{}", serde_json::to_string(record).map_err(json_err)?);
    }
    eprintln!(
        "{} record(s) from {} collection(s) via {} in {:.3}s",
        result.records.len(),
        result.collections_considered,
        result.meta_source,
        result.elapsed_s
    );
    Ok(())
}

pub fn resolve(urls: &[String], year: Option<i32>, per_url_limit: usize) -> Result<()> {
    if urls.is_empty() {
        return Err(Error::Config("no URLs given".to_string()));
    }
    let config = Config::load()?;
    let lookup = Lookup::new(&config);
    let resolved = lookup.resolve_urls(
        urls,
        &ResolveOptions {
            year,
            per_url_limit,
            workers: None,
        },
    )?;
    println!("{}", serde_json::to_string_pretty(&resolved).map_err(json_err)?);
    Ok(())
}

pub fn fetch(
    warc_filename: &str,
    offset: i64,
    length: i64,
    cache_mode: &str,
    prefix: &str,
    max_preview_chars: usize,
    include_body: bool,
) -> Result<()> {
    let config = Config::load()?;
    let fetcher = WarcFetcher::new(&config);
    let opts = FetchOptions {
        prefix: prefix.to_string(),
        cache_mode: cache_mode.parse()?,
        ..FetchOptions::default()
    };

    let (result, extract) = fetcher.fetch_and_extract(
        warc_filename,
        offset,
        length,
        &opts,
        max_preview_chars,
        include_body,
    );
    let out = serde_json::json!({
        "fetch": result,
        "http": extract,
    });
    println!("{}", serde_json::to_string_pretty(&out).map_err(json_err)?);
    Ok(())
}

pub fn jobs_start(label: &str, args: &[String]) -> Result<()> {
    let config = Config::load()?;
    let argv = jobs::plan_command(&config, args)?;
    let record = jobs::start_job(&config, &argv, label)?;
    println!("{}", serde_json::to_string_pretty(&record).map_err(json_err)?);
    Ok(())
}

pub fn jobs_stop(pid: u32, signal: &str) -> Result<()> {
    jobs::stop_job(pid, signal.parse()?)
}

pub fn jobs_tail(log_path: &Path, lines: usize) -> Result<()> {
    println!("{}", jobs::tail_file(log_path, lines)?);
    Ok(())
}

pub fn jobs_list(limit: usize) -> Result<()> {
    let config = Config::load()?;
    for record in jobs::list_jobs(&config, limit)? {
        println!("{}", serde_json::to_string(&record).map_err(json_err)?);
    }
    Ok(())
}

pub fn jobs_status(pid: Option<u32>, log_path: Option<&Path>, lines: usize) -> Result<()> {
    let config = Config::load()?;
    let status = jobs::job_status(&config, pid, log_path, lines)?;
    println!("{}", serde_json::to_string_pretty(&status).map_err(json_err)?);
    Ok(())
}

pub fn collections_list(filter: &str) -> Result<()> {
    let config = Config::load()?;
    let infos = catalog::load_cached(&config)?;
    for id in catalog::filter_collections(&infos, filter) {
        println!("{}", id);
    }
    Ok(())
}

pub fn collections_refresh(url: &str) -> Result<()> {
    let config = Config::load()?;
    let infos = catalog::refresh(&config, url, 15.0)?;
    eprintln!("cached {} collections", infos.len());
    Ok(())
}

fn json_err(e: serde_json::Error) -> Error {
    Error::Config(format!("serialize output: {}", e))
}
