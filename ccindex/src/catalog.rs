//! Collection catalog: a cached copy of the Common Crawl `collinfo.json`
//! manifest so the orchestrator and tools can enumerate collections offline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::schema::collection_year;
use crate::{atomic, Error, Result};

pub const DEFAULT_COLLINFO_URL: &str = "https://index.commoncrawl.org/collinfo.json";

/// One entry of the Common Crawl collection manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Collection id, e.g. `CC-MAIN-2024-10`.
    pub id: String,
    /// Human name, e.g. `March 2024 Index`.
    pub name: String,
    #[serde(default)]
    pub timegate: Option<String>,
    #[serde(rename = "cdx-api", default)]
    pub cdx_api: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

/// Load the cached manifest. Errors if no cache exists yet.
pub fn load_cached(config: &Config) -> Result<Vec<CollectionInfo>> {
    let path = config.collinfo_cache_path();
    if !path.exists() {
        return Err(Error::NotFound(format!(
            "no cached collection manifest at {} (run a catalog refresh first)",
            path.display()
        )));
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::CorruptInput(format!("collinfo cache: {}", e)))
}

/// Fetch the remote manifest and atomically replace the cache file.
pub fn refresh(config: &Config, url: &str, timeout_s: f64) -> Result<Vec<CollectionInfo>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs_f64(timeout_s))
        .build()?;
    let response = client.get(url).send()?.error_for_status()?;
    let collections: Vec<CollectionInfo> = response.json()?;

    let bytes = serde_json::to_vec_pretty(&collections)
        .map_err(|e| Error::Config(format!("serialize collinfo: {}", e)))?;
    atomic::write_file(&config.collinfo_cache_path(), &bytes)?;

    info!(url, collections = collections.len(), "collection manifest refreshed");
    Ok(collections)
}

/// Apply the orchestrator's collection filter to a manifest.
///
/// `"all"` keeps everything; a 4-digit year keeps that year's collections;
/// anything else is an exact collection id.
pub fn filter_collections(infos: &[CollectionInfo], filter: &str) -> Vec<String> {
    let filter = filter.trim();
    if filter.eq_ignore_ascii_case("all") {
        return infos.iter().map(|c| c.id.clone()).collect();
    }
    if filter.len() == 4 && filter.bytes().all(|b| b.is_ascii_digit()) {
        let year: i32 = filter.parse().unwrap_or(0);
        return infos
            .iter()
            .filter(|c| collection_year(&c.id) == Some(year))
            .map(|c| c.id.clone())
            .collect();
    }
    infos
        .iter()
        .filter(|c| c.id == filter)
        .map(|c| c.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> Vec<CollectionInfo> {
        ["CC-MAIN-2024-10", "CC-MAIN-2024-18", "CC-MAIN-2023-50"]
            .iter()
            .map(|id| CollectionInfo {
                id: id.to_string(),
                name: format!("{} Index", id),
                timegate: None,
                cdx_api: None,
                from: None,
                to: None,
            })
            .collect()
    }

    #[test]
    fn test_filter_collections() {
        let infos = manifest();
        assert_eq!(filter_collections(&infos, "all").len(), 3);
        assert_eq!(
            filter_collections(&infos, "2024"),
            vec!["CC-MAIN-2024-10", "CC-MAIN-2024-18"]
        );
        assert_eq!(
            filter_collections(&infos, "CC-MAIN-2023-50"),
            vec!["CC-MAIN-2023-50"]
        );
        assert!(filter_collections(&infos, "CC-MAIN-1999-01").is_empty());
    }

    #[test]
    fn test_cache_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());

        assert!(matches!(load_cached(&config), Err(Error::NotFound(_))));

        let bytes = serde_json::to_vec(&manifest()).unwrap();
        atomic::write_file(&config.collinfo_cache_path(), &bytes).unwrap();

        let loaded = load_cached(&config).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].id, "CC-MAIN-2024-10");
    }

    #[test]
    fn test_cache_tolerates_extra_fields() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());

        let raw = r#"[{"id": "CC-MAIN-2024-10", "name": "March 2024 Index",
                       "timegate": "https://index.commoncrawl.org/CC-MAIN-2024-10/",
                       "cdx-api": "https://index.commoncrawl.org/CC-MAIN-2024-10-index",
                       "from": "2024-02-26", "to": "2024-03-11"}]"#;
        atomic::write_file(&config.collinfo_cache_path(), raw.as_bytes()).unwrap();

        let loaded = load_cached(&config).unwrap();
        assert_eq!(loaded[0].cdx_api.as_deref().unwrap(), "https://index.commoncrawl.org/CC-MAIN-2024-10-index");
        assert_eq!(loaded[0].from.as_deref(), Some("2024-02-26"));
    }
}
