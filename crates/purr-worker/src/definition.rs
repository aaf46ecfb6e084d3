//! Asset definitions and the service that supplies them
//!
//! An asset definition describes how to pull one asset type (wells, formation
//! tests, production tests, ...) out of a project's source store: the
//! identifier and select query templates, which column prefixes become which
//! subdocuments, and how individual columns are decoded. Definitions are
//! fetched once per batch and copied into every chunk task, so they are
//! immutable for the lifetime of the batch.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::codec::TransformDirective;
use crate::error::{WorkerError, WorkerResult};

/// Column used for the recency window when a definition does not name one
pub const DEFAULT_RECENCY_COLUMN: &str = "w.chgdate";

fn default_recency_column() -> String {
    DEFAULT_RECENCY_COLUMN.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDefinition {
    /// Row query; contains the placeholder token
    pub select: String,
    /// Key listing query; contains the placeholder token
    pub identifier: String,
    /// Placeholder token substituted with the filter clause in both templates
    pub purr_where: String,
    /// Column prefix -> subdocument name
    pub prefixes: BTreeMap<String, String>,
    /// Columns forming the chunking key, in concatenation order
    pub identifier_keys: Vec<String>,
    /// Columns hashed into the document id
    pub asset_id_keys: Vec<String>,
    /// Columns joined into the well composite id
    pub well_id_keys: Vec<String>,
    #[serde(default)]
    pub xforms: BTreeMap<String, TransformDirective>,
    #[serde(default)]
    pub purr_delimiter: Option<String>,
    #[serde(default)]
    pub purr_null: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub post_process: Vec<String>,
    #[serde(default)]
    pub order: String,
    #[serde(default = "default_recency_column")]
    pub recency_column: String,
}

/// Accept `null`, a single name, or a list of names
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(name)) => vec![name],
        Some(OneOrMany::Many(names)) => names,
    })
}

/// Source of asset definitions, keyed by suite and asset type
#[async_trait]
pub trait DefinitionService: Send + Sync {
    async fn fetch(&self, suite: &str, asset: &str) -> WorkerResult<AssetDefinition>;
}

/// Definition service reached over HTTP.
///
/// Definitions are served by per-suite functions:
/// `POST {base_url}/functions/v1/{suite}` with body `{"asset": "<asset>"}`.
pub struct HttpDefinitionService {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpDefinitionService {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> WorkerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl DefinitionService for HttpDefinitionService {
    async fn fetch(&self, suite: &str, asset: &str) -> WorkerResult<AssetDefinition> {
        let url = format!("{}/functions/v1/{}", self.base_url, suite);
        debug!(url = %url, asset = %asset, "fetching asset definition");

        let mut request = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "asset": asset }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Definition(format!(
                "{} {} returned {}: {}",
                suite, asset, status, body
            )));
        }

        response
            .json::<AssetDefinition>()
            .await
            .map_err(|e| WorkerError::Definition(format!("malformed definition for {}: {}", asset, e)))
    }
}
