use serde::{Deserialize, Serialize};

/// Stored rental listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Asset {
    pub id: String, // UUID
    pub name: String,
    pub description: String,
    pub created_ts: i64,
}

/// Body of `POST /list`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAsset {
    pub name: String,
    pub description: String,
}

/// Search hit as returned by `POST /search`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AssetSummary {
    pub name: String,
    pub description: String,
}

impl From<Asset> for AssetSummary {
    fn from(asset: Asset) -> Self {
        Self {
            name: asset.name,
            description: asset.description,
        }
    }
}
