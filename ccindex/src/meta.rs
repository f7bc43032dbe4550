//! Meta-index construction: per-year databases and the master database.
//!
//! Meta-indexes carry no pointer rows of their own; they tell the lookup
//! layer which per-collection database (and Parquet tree) to consult. They
//! are small and rebuilt from scratch, never updated incrementally. Each
//! rebuild lands in a temp file that is renamed over the previous database.

use std::path::PathBuf;

use duckdb::params;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::schema::{
    collection_year, CollectionRef, DDL_CC_DOMAIN_SHARDS, DDL_COLLECTION_REGISTRY,
    DDL_COLLECTION_SUMMARY,
};
use crate::{atomic, Result};

/// Scan the collection index root for `<collection>.duckdb` files.
pub fn scan_collection_dbs(config: &Config) -> Result<Vec<CollectionRef>> {
    let mut refs = Vec::new();
    let root = &config.duckdb_collection_root;
    if !root.exists() {
        return Ok(refs);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(collection) = name.strip_suffix(".duckdb") {
            refs.push(CollectionRef {
                year: collection_year(collection),
                collection: collection.to_string(),
                db_path: entry.path(),
            });
        }
    }
    refs.sort_by(|a, b| a.collection.cmp(&b.collection));
    Ok(refs)
}

/// Rebuild the meta-index for one year.
///
/// Registers each collection's database path and mirrors its
/// `cc_domain_shards` rows so domain queries can consult a single database
/// per year.
pub fn build_year_index(config: &Config, year: i32) -> Result<usize> {
    let refs: Vec<CollectionRef> = scan_collection_dbs(config)?
        .into_iter()
        .filter(|r| r.year == Some(year))
        .collect();

    let final_path = config.year_db_path(year);
    let staged = atomic::StagedWrite::begin(&final_path)?;

    {
        let conn = db::open_rw(staged.staging_path(), config.duckdb_threads, None)?;
        conn.execute_batch(DDL_COLLECTION_REGISTRY)?;
        conn.execute_batch(DDL_CC_DOMAIN_SHARDS)?;

        for cref in &refs {
            conn.execute(
                "INSERT INTO collection_registry(collection, db_path) VALUES (?, ?)",
                params![cref.collection, cref.db_path.to_string_lossy()],
            )?;

            conn.execute_batch(&format!(
                "ATTACH '{}' AS src (READ_ONLY);",
                db::sql_quote_str(&cref.db_path)
            ))?;
            if db::attached_table_exists(&conn, "src", "cc_domain_shards") {
                conn.execute_batch("INSERT INTO cc_domain_shards SELECT * FROM src.cc_domain_shards;")?;
            }
            conn.execute_batch("DETACH src;")?;
        }
    }

    staged.commit()?;
    info!(year, collections = refs.len(), db = %final_path.display(), "year meta-index built");
    Ok(refs.len())
}

/// Rebuild the master meta-index: one `collection_summary` row per
/// registered collection.
pub fn build_master_index(config: &Config) -> Result<usize> {
    let refs = scan_collection_dbs(config)?;

    let final_path = config.master_db_path();
    let staged = atomic::StagedWrite::begin(&final_path)?;

    {
        let conn = db::open_rw(staged.staging_path(), config.duckdb_threads, None)?;
        conn.execute_batch(DDL_COLLECTION_SUMMARY)?;
        for cref in &refs {
            conn.execute(
                "INSERT INTO collection_summary(year, collection, collection_db_path) VALUES (?, ?, ?)",
                params![cref.year, cref.collection, cref.db_path.to_string_lossy()],
            )?;
        }
    }

    staged.commit()?;
    info!(collections = refs.len(), db = %final_path.display(), "master meta-index built");
    Ok(refs.len())
}

/// Rebuild year meta-indexes (one year, or every year with a collection on
/// disk) and then the master index.
pub fn build_meta_indexes(config: &Config, year: Option<i32>) -> Result<()> {
    let years: Vec<i32> = match year {
        Some(y) => vec![y],
        None => {
            let mut years: Vec<i32> = scan_collection_dbs(config)?
                .iter()
                .filter_map(|r| r.year)
                .collect();
            years.sort_unstable();
            years.dedup();
            years
        }
    };

    for y in years {
        build_year_index(config, y)?;
    }
    build_master_index(config)?;
    Ok(())
}

/// Load the collections registered in the master database, optionally
/// filtered by year, newest collection first.
pub fn load_collections_from_master(
    config: &Config,
    year: Option<i32>,
) -> Result<Vec<CollectionRef>> {
    let master = config.master_db_path();
    if !master.exists() {
        return Ok(Vec::new());
    }
    let conn = db::open_readonly(&master)?;
    if !db::table_exists(&conn, "collection_summary") {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT year, collection, collection_db_path FROM collection_summary \
         ORDER BY collection DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CollectionRef {
            year: row.get(0)?,
            collection: row.get(1)?,
            db_path: PathBuf::from(row.get::<_, String>(2)?),
        })
    })?;

    let mut refs: Vec<CollectionRef> = rows.filter_map(|r| r.ok()).collect();
    if let Some(y) = year {
        refs.retain(|r| r.year == Some(y));
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DDL_CC_INGESTED_FILES;
    use tempfile::TempDir;

    fn make_collection_db(config: &Config, collection: &str, host_revs: &[&str]) {
        let path = config.collection_db_path(collection);
        let conn = db::open_rw(&path, 1, None).unwrap();
        conn.execute_batch(DDL_CC_DOMAIN_SHARDS).unwrap();
        conn.execute_batch(DDL_CC_INGESTED_FILES).unwrap();
        for hr in host_revs {
            conn.execute(
                "INSERT INTO cc_domain_shards VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    format!("/pq/{}/cdx-00000.gz.sorted.parquet", collection),
                    collection,
                    collection_year(collection),
                    "cdx-00000.gz",
                    format!("{}/cdx-00000.gz.sorted.parquet", collection),
                    hr.replace(',', "."),
                    hr,
                ],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_build_meta_indexes() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());

        make_collection_db(&config, "CC-MAIN-2024-10", &["gov,18f"]);
        make_collection_db(&config, "CC-MAIN-2024-18", &["gov,gsa"]);
        make_collection_db(&config, "CC-MAIN-2023-50", &["gov,nasa"]);

        build_meta_indexes(&config, None).unwrap();

        let year_db = db::open_readonly(&config.year_db_path(2024)).unwrap();
        let registered: i64 = year_db
            .query_row("SELECT count(*) FROM collection_registry", [], |r| r.get(0))
            .unwrap();
        assert_eq!(registered, 2);
        let mirrored: i64 = year_db
            .query_row("SELECT count(*) FROM cc_domain_shards", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mirrored, 2);

        let refs = load_collections_from_master(&config, None).unwrap();
        assert_eq!(refs.len(), 3);
        // Newest first.
        assert_eq!(refs[0].collection, "CC-MAIN-2024-18");

        let refs = load_collections_from_master(&config, Some(2023)).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].collection, "CC-MAIN-2023-50");
    }

    #[test]
    fn test_master_rebuild_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        make_collection_db(&config, "CC-MAIN-2024-10", &["gov,18f"]);

        build_master_index(&config).unwrap();
        let first = load_collections_from_master(&config, None).unwrap();
        build_master_index(&config).unwrap();
        let second = load_collections_from_master(&config, None).unwrap();
        assert_eq!(first, second);
    }
}
