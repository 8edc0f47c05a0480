use anyhow::{Context, Result};
use regex::RegexBuilder;
use rocksdb::{Direction, IteratorMode, Options, DB};
use uuid::Uuid;

use crate::model::asset::{Asset, AssetSummary, NewAsset};

use std::{path::Path, str};

const ASSET_PREFIX: &str = "asset:";

pub struct AssetStore {
    db: DB,
}

impl AssetStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)
            .with_context(|| format!("failed to open asset store at {}", path.display()))?;
        Ok(Self { db })
    }

    fn asset_key(id: &str) -> String {
        format!("{ASSET_PREFIX}{id}")
    }

    pub async fn insert(&self, new: NewAsset) -> Result<Asset> {
        let asset = Asset {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            description: new.description,
            created_ts: chrono::Utc::now().timestamp(),
        };
        let val = serde_json::to_vec(&asset)?;
        self.db.put(Self::asset_key(&asset.id), val)?;
        Ok(asset)
    }

    /// `query` is a case-insensitive regular expression matched anywhere in
    /// the asset name. Invalid patterns are errors.
    pub async fn find_by_name_substring(&self, query: &str) -> Result<Vec<AssetSummary>> {
        let pattern = RegexBuilder::new(query)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("invalid search pattern `{query}`"))?;

        let mut hits = Vec::new();
        for asset in self.list_assets()? {
            if pattern.is_match(&asset.name) {
                hits.push(AssetSummary::from(asset));
            }
        }
        Ok(hits)
    }

    fn list_assets(&self) -> Result<Vec<Asset>> {
        let mut assets = Vec::new();

        let iter = self
            .db
            .iterator(IteratorMode::From(ASSET_PREFIX.as_bytes(), Direction::Forward));

        for item in iter {
            let (key, val) = item?;
            let k = str::from_utf8(&key)?;

            if !k.starts_with(ASSET_PREFIX) {
                break;
            }

            assets.push(serde_json::from_slice::<Asset>(&val)?);
        }

        // Keys are UUIDs, so restore listing order.
        assets.sort_by(|a, b| a.created_ts.cmp(&b.created_ts).then_with(|| a.id.cmp(&b.id)));
        Ok(assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct TempStore {
        store: Option<AssetStore>,
        path: PathBuf,
    }

    impl TempStore {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("assets-test-{}", Uuid::new_v4()));
            let store = AssetStore::open(&path).unwrap();
            Self {
                store: Some(store),
                path,
            }
        }

        fn store(&self) -> &AssetStore {
            self.store.as_ref().unwrap()
        }
    }

    impl Drop for TempStore {
        fn drop(&mut self) {
            self.store.take();
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn new_asset(name: &str, description: &str) -> NewAsset {
        NewAsset {
            name: name.into(),
            description: description.into(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_id_and_persists() {
        let tmp = TempStore::new();
        let asset = tmp
            .store()
            .insert(new_asset("Canon EOS R6", "Mirrorless camera"))
            .await
            .unwrap();

        assert!(Uuid::parse_str(&asset.id).is_ok());
        assert_eq!(asset.name, "Canon EOS R6");

        let stored = tmp.store().list_assets().unwrap();
        assert_eq!(stored, vec![asset]);
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_partial() {
        let tmp = TempStore::new();
        let store = tmp.store();
        store
            .insert(new_asset("2BHK Apartment", "Near the station"))
            .await
            .unwrap();
        store
            .insert(new_asset("Studio apartment", "Furnished"))
            .await
            .unwrap();
        store
            .insert(new_asset("Mountain bike", "21 gears"))
            .await
            .unwrap();

        let mut hits = store.find_by_name_substring("APART").await.unwrap();
        hits.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(
            hits,
            vec![
                AssetSummary {
                    name: "2BHK Apartment".into(),
                    description: "Near the station".into(),
                },
                AssetSummary {
                    name: "Studio apartment".into(),
                    description: "Furnished".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn search_supports_patterns_and_empty_query() {
        let tmp = TempStore::new();
        let store = tmp.store();
        store.insert(new_asset("Drill", "Cordless")).await.unwrap();
        store.insert(new_asset("Tent", "4 person")).await.unwrap();

        let hits = store.find_by_name_substring("^d").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Drill");

        assert_eq!(store.find_by_name_substring("").await.unwrap().len(), 2);
        assert!(store.find_by_name_substring("zzz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_pattern_is_an_error() {
        let tmp = TempStore::new();
        let err = tmp.store().find_by_name_substring("(").await.unwrap_err();
        assert!(err.to_string().contains("invalid search pattern"));
    }
}
