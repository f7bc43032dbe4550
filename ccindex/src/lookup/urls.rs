//! URL-batch resolution: group by domain, resolve each domain in parallel,
//! join URL variants against the pointer stores by equality.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Instant;

use duckdb::Connection;
use rayon::prelude::*;
use tracing::debug;

use crate::cdxj::host_to_rev;
use crate::config::Config;
use crate::{db, Error, Result};

use super::domain::{candidate_collections, domain_parquets};
use super::{
    canonicalize_url, hit_from_row, normalize_domain, trace_event, url_variants, PointerHit,
    SearchOptions, HIT_COLUMNS,
};

/// Options for `resolve_urls`.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub year: Option<i32>,
    pub per_url_limit: usize,
    /// Thread count for per-domain fan-out. None = derive from the
    /// environment (`BRAVE_RESOLVE_WORKERS`) or CPU count.
    pub workers: Option<usize>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            year: None,
            per_url_limit: 5,
            workers: None,
        }
    }
}

/// Resolution strategy, selectable via `BRAVE_RESOLVE_STRATEGY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Equality join of URL variants against the Parquet `url` column.
    UrlJoin,
    /// Domain search first, then canonical-URL matching.
    Meta,
}

fn strategy_from_env() -> Strategy {
    match std::env::var("BRAVE_RESOLVE_STRATEGY")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "meta" => Strategy::Meta,
        _ => Strategy::UrlJoin,
    }
}

fn env_usize(var: &str) -> Option<usize> {
    std::env::var(var).ok()?.trim().parse().ok().filter(|n| *n > 0)
}

fn worker_count(opts: &ResolveOptions, domains: usize) -> usize {
    if let Some(n) = opts.workers {
        return n.max(1);
    }
    if let Some(n) = env_usize("BRAVE_RESOLVE_WORKERS") {
        return n;
    }
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    domains.clamp(1, cpus.max(2))
}

/// Resolve a batch of URLs. The result maps every input URL to its pointer
/// bucket (possibly empty); input URLs are preserved as keys verbatim.
pub(crate) fn resolve_urls(
    config: &Config,
    input_urls: &[String],
    opts: &ResolveOptions,
) -> Result<BTreeMap<String, Vec<PointerHit>>> {
    let started = Instant::now();

    // Group inputs by normalized domain.
    let mut by_domain: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for url in input_urls {
        let domain = normalize_domain(url);
        if domain.is_empty() {
            continue;
        }
        by_domain.entry(domain).or_default().push(url.clone());
    }

    let workers = worker_count(opts, by_domain.len());
    let strategy = strategy_from_env();
    debug!(
        urls = input_urls.len(),
        domains = by_domain.len(),
        workers,
        strategy = ?strategy,
        "resolving url batch"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| Error::Stage(format!("thread pool: {}", e)))?;

    let domain_jobs: Vec<(String, Vec<String>)> = by_domain.into_iter().collect();
    let resolved: Vec<Result<BTreeMap<String, Vec<PointerHit>>>> = pool.install(|| {
        domain_jobs
            .par_iter()
            .map(|(domain, urls)| resolve_one_domain(config, domain, urls, opts, strategy))
            .collect()
    });

    let mut out: BTreeMap<String, Vec<PointerHit>> = input_urls
        .iter()
        .map(|u| (u.clone(), Vec::new()))
        .collect();
    for bucket in resolved {
        for (url, hits) in bucket? {
            out.insert(url, hits);
        }
    }

    trace_event(
        config,
        serde_json::json!({
            "event": "resolve_urls",
            "urls": input_urls.len(),
            "resolved": out.values().filter(|v| !v.is_empty()).count(),
            "elapsed_s": started.elapsed().as_secs_f64(),
        }),
    );
    Ok(out)
}

/// Resolve all URLs of one domain inside a single SQL session.
fn resolve_one_domain(
    config: &Config,
    domain: &str,
    urls: &[String],
    opts: &ResolveOptions,
    strategy: Strategy,
) -> Result<BTreeMap<String, Vec<PointerHit>>> {
    let mut buckets: BTreeMap<String, Vec<PointerHit>> =
        urls.iter().map(|u| (u.clone(), Vec::new())).collect();

    // Every variant of every URL, and the reverse map variant -> inputs.
    let mut variant_owners: HashMap<String, Vec<&String>> = HashMap::new();
    for url in urls {
        for variant in url_variants(url) {
            variant_owners.entry(variant).or_default().push(url);
        }
    }
    let all_variants: Vec<String> = variant_owners.keys().cloned().collect();
    if all_variants.is_empty() {
        return Ok(buckets);
    }

    if strategy == Strategy::UrlJoin {
        let hits = url_join_hits(config, domain, &all_variants, opts)?;
        for hit in hits {
            let Some(url) = hit.url.as_deref() else {
                continue;
            };
            if let Some(owners) = variant_owners.get(url) {
                for owner in owners {
                    if let Some(bucket) = buckets.get_mut(*owner) {
                        if bucket.len() < opts.per_url_limit {
                            bucket.push(hit.clone());
                        }
                    }
                }
            }
        }
    }

    // Canonical-URL fallback for anything still empty (and the whole batch
    // in meta mode): search the domain and match canonicalized URLs.
    if buckets.values().any(Vec::is_empty) {
        let search = super::domain::search_domain(
            config,
            domain,
            &SearchOptions {
                year: opts.year,
                max_matches: (urls.len() * opts.per_url_limit).max(50),
                per_parquet_limit: 50,
            },
        )?;
        for (input, bucket) in buckets.iter_mut() {
            if !bucket.is_empty() {
                continue;
            }
            let canon = canonicalize_url(input);
            for hit in &search.records {
                if bucket.len() >= opts.per_url_limit {
                    break;
                }
                let matches = hit
                    .url
                    .as_deref()
                    .is_some_and(|u| canonicalize_url(u) == canon);
                if matches {
                    bucket.push(hit.clone());
                }
            }
        }
    }

    Ok(buckets)
}

/// Equality join of the variant set against every candidate pointer store
/// for a domain.
fn url_join_hits(
    config: &Config,
    domain: &str,
    variants: &[String],
    opts: &ResolveOptions,
) -> Result<Vec<PointerHit>> {
    let prefix = host_to_rev(domain).unwrap_or_default();
    let (collections, _source) = candidate_collections(config, opts.year)?;

    let batch_size = env_usize("BRAVE_RESOLVE_PARQUET_BATCH").unwrap_or(4);
    let mut hits = Vec::new();
    let scan_conn = Connection::open_in_memory()?;

    // Resolving which Parquet files hold a domain means opening one
    // database per collection; fan that out when asked to.
    let relpath_workers = env_usize("BRAVE_RESOLVE_RELPATH_WORKERS").unwrap_or(1);
    let per_collection: Vec<Result<CollectionHits>> = if relpath_workers > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(relpath_workers)
            .build()
            .map_err(|e| Error::Stage(format!("thread pool: {}", e)))?;
        pool.install(|| {
            collections
                .par_iter()
                .map(|cref| collection_hits(config, cref, &prefix, variants))
                .collect()
        })
    } else {
        collections
            .iter()
            .map(|cref| collection_hits(config, cref, &prefix, variants))
            .collect()
    };

    for outcome in per_collection {
        match outcome? {
            CollectionHits::Db(db_hits) => hits.extend(db_hits),
            CollectionHits::Parquets(parquets) => {
                for batch in parquets.chunks(batch_size.max(1)) {
                    hits.extend(url_join_parquets(&scan_conn, batch, &prefix, variants)?);
                }
            }
            CollectionHits::None => {}
        }
    }
    Ok(hits)
}

enum CollectionHits {
    /// Hits read directly from a URL-mode collection database.
    Db(Vec<PointerHit>),
    /// Parquet files still to be joined against the variant set.
    Parquets(Vec<PathBuf>),
    None,
}

fn collection_hits(
    config: &Config,
    cref: &crate::schema::CollectionRef,
    prefix: &str,
    variants: &[String],
) -> Result<CollectionHits> {
    if !cref.db_path.exists() {
        return Ok(CollectionHits::None);
    }
    let Ok(conn) = db::open_readonly(&cref.db_path) else {
        return Ok(CollectionHits::None);
    };

    if db::table_exists(&conn, "cc_pointers") && !db::table_exists(&conn, "cc_domain_shards") {
        return Ok(CollectionHits::Db(url_join_db(
            &conn,
            &cref.db_path,
            prefix,
            variants,
        )?));
    }
    if !db::table_exists(&conn, "cc_domain_shards") {
        return Ok(CollectionHits::None);
    }
    Ok(CollectionHits::Parquets(domain_parquets(
        config, &conn, prefix,
    )?))
}

fn url_join_parquets(
    conn: &Connection,
    parquets: &[PathBuf],
    prefix: &str,
    variants: &[String],
) -> Result<Vec<PointerHit>> {
    if parquets.is_empty() || variants.is_empty() {
        return Ok(Vec::new());
    }
    let file_list: Vec<String> = parquets
        .iter()
        .map(|p| format!("'{}'", db::sql_quote_str(p)))
        .collect();
    let url_params = vec!["?"; variants.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM read_parquet([{}]) \
         WHERE host_rev = ? AND url IN ({})",
        HIT_COLUMNS,
        file_list.join(", "),
        url_params
    );

    let mut params: Vec<&dyn duckdb::ToSql> = vec![&prefix as &dyn duckdb::ToSql];
    params.extend(variants.iter().map(|v| v as &dyn duckdb::ToSql));

    let source = parquets[0].to_string_lossy().to_string();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), |row| hit_from_row(row, Some(&source)))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

fn url_join_db(
    conn: &Connection,
    db_path: &std::path::Path,
    prefix: &str,
    variants: &[String],
) -> Result<Vec<PointerHit>> {
    let url_params = vec!["?"; variants.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM cc_pointers WHERE host_rev = ? AND url IN ({})",
        HIT_COLUMNS, url_params
    );
    let mut params: Vec<&dyn duckdb::ToSql> = vec![&prefix as &dyn duckdb::ToSql];
    params.extend(variants.iter().map(|v| v as &dyn duckdb::ToSql));

    let source = db_path.to_string_lossy().to_string();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), |row| hit_from_row(row, Some(&source)))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}
