//! ccpipe: CLI for the CCIndex pipeline - orchestrate, index and query
//! Common Crawl pointer stores.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "ccpipe")]
#[command(about = "Common Crawl index pipeline - build and query WARC pointer stores")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline orchestrator over a collection filter
    Run {
        #[arg(long = "ccindex-root")]
        ccindex_root: Option<PathBuf>,

        #[arg(long = "parquet-root")]
        parquet_root: Option<PathBuf>,

        #[arg(long = "duckdb-collection-root")]
        duckdb_collection_root: Option<PathBuf>,

        #[arg(long = "duckdb-year-root")]
        duckdb_year_root: Option<PathBuf>,

        #[arg(long = "duckdb-master-root")]
        duckdb_master_root: Option<PathBuf>,

        /// Worker count for download/convert stages
        #[arg(short = 'w', long = "workers")]
        workers: Option<usize>,

        /// Collection filter: "all", a 4-digit year, or an exact id
        #[arg(short = 'f', long = "filter", default_value = "all")]
        filter: String,

        /// Stop after the download stage
        #[arg(long = "download-only")]
        download_only: bool,

        /// Only run cleanup for the filtered collections
        #[arg(long = "cleanup-only")]
        cleanup_only: bool,

        /// Log the cleanup plan without deleting anything
        #[arg(long = "cleanup-dry-run")]
        cleanup_dry_run: bool,

        /// Re-ingest shards even when the index ledger says they are current
        #[arg(long = "force-reindex")]
        force_reindex: bool,

        /// Explicit sort parallelism (default: derived from available RAM)
        #[arg(long = "sort-workers")]
        sort_workers: Option<usize>,

        /// Memory budget per concurrent sort, in GB
        #[arg(long = "sort-memory-per-worker-gb")]
        sort_memory_per_worker_gb: Option<f64>,

        /// Spill directory for DuckDB sorts
        #[arg(long = "sort-temp-dir")]
        sort_temp_dir: Option<PathBuf>,

        /// Seconds of stage silence before a heartbeat line
        #[arg(long = "heartbeat-seconds")]
        heartbeat_seconds: Option<u64>,

        /// Index shape: domain (default) or url
        #[arg(long = "index-mode")]
        index_mode: Option<String>,

        /// Allow cleanup to delete source archives for complete collections
        #[arg(long = "cleanup-source-archives")]
        cleanup_source_archives: bool,

        /// Proceed without confirmation (overrides the contention check)
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },

    /// Convert one collection's cdx-*.gz shards to Parquet
    Convert {
        #[arg(long = "collection")]
        collection: String,

        #[arg(long = "input-dir")]
        input_dir: PathBuf,

        #[arg(long = "output-dir")]
        output_dir: PathBuf,

        #[arg(short = 'w', long = "workers", default_value = "4")]
        workers: usize,

        /// Rebuild outputs that already exist
        #[arg(long = "overwrite")]
        overwrite: bool,

        /// Restrict to these shard names (repeatable), e.g. cdx-00042.gz
        #[arg(long = "only")]
        only: Vec<String>,
    },

    /// Sort unsorted Parquet shards in a collection directory
    Sort {
        #[arg(long = "parquet-root")]
        parquet_root: PathBuf,

        /// Sort files that are not yet ordered (default behavior; kept as an
        /// explicit flag for scripting clarity)
        #[arg(long = "sort-unsorted")]
        sort_unsorted: bool,

        #[arg(short = 'w', long = "workers", default_value = "4")]
        workers: usize,

        #[arg(long = "sort-workers")]
        sort_workers: Option<usize>,

        /// Memory budget per sort, in GB
        #[arg(long = "memory-per-sort")]
        memory_per_sort: Option<f64>,

        /// Spill directory for DuckDB sorts
        #[arg(long = "temp-dir")]
        temp_dir: Option<PathBuf>,

        /// Restrict to these unsorted file names (repeatable)
        #[arg(long = "only")]
        only: Vec<String>,
    },

    /// Build the per-collection DuckDB index (and row-group slices)
    Index {
        #[arg(long = "collection")]
        collection: String,

        #[arg(long = "force-reindex")]
        force_reindex: bool,

        /// Build secondary indexes on the collection database
        #[arg(long = "create-indexes")]
        create_indexes: bool,
    },

    /// Rebuild per-year and master meta-indexes
    Meta {
        /// Restrict to one year
        #[arg(long = "year")]
        year: Option<i32>,
    },

    /// Report validator status for a collection filter
    Status {
        #[arg(short = 'f', long = "filter", default_value = "all")]
        filter: String,
    },

    /// Resolve a domain to ranked WARC pointers
    Search {
        domain: String,

        #[arg(long = "year")]
        year: Option<i32>,

        #[arg(short = 'n', long = "max-matches", default_value = "100")]
        max_matches: usize,

        #[arg(long = "per-parquet-limit", default_value = "50")]
        per_parquet_limit: usize,
    },

    /// Resolve a batch of URLs to WARC pointers
    Resolve {
        urls: Vec<String>,

        #[arg(long = "year")]
        year: Option<i32>,

        #[arg(long = "per-url-limit", default_value = "5")]
        per_url_limit: usize,
    },

    /// Fetch one WARC record by pointer and parse its HTTP envelope
    Fetch {
        #[arg(long = "warc-filename")]
        warc_filename: String,

        #[arg(long = "offset")]
        offset: i64,

        #[arg(long = "length")]
        length: i64,

        /// Cache mode: range (default), auto or full
        #[arg(long = "cache-mode", default_value = "range")]
        cache_mode: String,

        /// Base URL prefix for WARC downloads
        #[arg(long = "prefix", default_value = "https://data.commoncrawl.org/")]
        prefix: String,

        #[arg(long = "max-preview-chars", default_value = "40000")]
        max_preview_chars: usize,

        /// Include the parsed body as base64 in the output
        #[arg(long = "include-body")]
        include_body: bool,
    },

    /// Manage background orchestrator jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Manage the collection catalog
    Collections {
        #[command(subcommand)]
        action: CollectionsAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// Launch an orchestrator run in the background
    Start {
        #[arg(short = 'l', long = "label", default_value = "orchestrator")]
        label: String,

        /// Extra orchestrator flags, e.g. -- --filter 2024
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Signal a job
    Stop {
        pid: u32,

        /// TERM (default), KILL or INT
        #[arg(short = 's', long = "signal", default_value = "TERM")]
        signal: String,
    },
    /// Print the tail of a job log
    Tail {
        log_path: PathBuf,

        #[arg(short = 'n', long = "lines", default_value = "200")]
        lines: usize,
    },
    /// List launched jobs
    List {
        #[arg(short = 'n', long = "limit", default_value = "50")]
        limit: usize,
    },
    /// Show status for a job by pid or log path
    Status {
        #[arg(long = "pid")]
        pid: Option<u32>,

        #[arg(long = "log-path")]
        log_path: Option<PathBuf>,

        #[arg(short = 'n', long = "lines", default_value = "200")]
        lines: usize,
    },
}

#[derive(Subcommand)]
enum CollectionsAction {
    /// List collections from the cached manifest
    List {
        #[arg(short = 'f', long = "filter", default_value = "all")]
        filter: String,
    },
    /// Fetch the remote manifest and replace the cache
    Refresh {
        #[arg(long = "url", default_value = ccindex::catalog::DEFAULT_COLLINFO_URL)]
        url: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            ccindex_root,
            parquet_root,
            duckdb_collection_root,
            duckdb_year_root,
            duckdb_master_root,
            workers,
            filter,
            download_only,
            cleanup_only,
            cleanup_dry_run,
            force_reindex,
            sort_workers,
            sort_memory_per_worker_gb,
            sort_temp_dir,
            heartbeat_seconds,
            index_mode,
            cleanup_source_archives,
            yes,
        } => {
            let overrides = commands::RunOverrides {
                ccindex_root,
                parquet_root,
                duckdb_collection_root,
                duckdb_year_root,
                duckdb_master_root,
                workers,
                sort_workers,
                sort_memory_per_worker_gb,
                sort_temp_dir,
                heartbeat_seconds,
                index_mode,
                cleanup_source_archives,
            };
            commands::run(
                overrides,
                filter,
                download_only,
                cleanup_only,
                cleanup_dry_run,
                force_reindex,
                yes,
            )
        }
        Commands::Convert {
            collection,
            input_dir,
            output_dir,
            workers,
            overwrite,
            only,
        } => commands::convert(&collection, &input_dir, &output_dir, workers, overwrite, &only),
        Commands::Sort {
            parquet_root,
            sort_unsorted: _,
            workers,
            sort_workers,
            memory_per_sort,
            temp_dir,
            only,
        } => commands::sort(&parquet_root, workers, sort_workers, memory_per_sort, temp_dir, &only),
        Commands::Index {
            collection,
            force_reindex,
            create_indexes,
        } => commands::index(&collection, force_reindex, create_indexes),
        Commands::Meta { year } => commands::meta(year),
        Commands::Status { filter } => commands::status(&filter),
        Commands::Search {
            domain,
            year,
            max_matches,
            per_parquet_limit,
        } => commands::search(&domain, year, max_matches, per_parquet_limit),
        Commands::Resolve {
            urls,
            year,
            per_url_limit,
        } => commands::resolve(&urls, year, per_url_limit),
        Commands::Fetch {
            warc_filename,
            offset,
            length,
            cache_mode,
            prefix,
            max_preview_chars,
            include_body,
        } => commands::fetch(
            &warc_filename,
            offset,
            length,
            &cache_mode,
            &prefix,
            max_preview_chars,
            include_body,
        ),
        Commands::Jobs { action } => match action {
            JobsAction::Start { label, args } => commands::jobs_start(&label, &args),
            JobsAction::Stop { pid, signal } => commands::jobs_stop(pid, &signal),
            JobsAction::Tail { log_path, lines } => commands::jobs_tail(&log_path, lines),
            JobsAction::List { limit } => commands::jobs_list(limit),
            JobsAction::Status {
                pid,
                log_path,
                lines,
            } => commands::jobs_status(pid, log_path.as_deref(), lines),
        },
        Commands::Collections { action } => match action {
            CollectionsAction::List { filter } => commands::collections_list(&filter),
            CollectionsAction::Refresh { url } => commands::collections_refresh(&url),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
