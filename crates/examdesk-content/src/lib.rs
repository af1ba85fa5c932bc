use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use examdesk_types::Collection;

/// Hard cap on rows requested from the content API in one call.
pub const MAX_ITEMS: u32 = 10;
/// Upper bound for one content API request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

/// Read parameters for one collection request.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemQuery {
    pub filter: Option<Value>,
    pub sort: Vec<String>,
    pub fields: Vec<String>,
    limit: u32,
}

impl Default for ItemQuery {
    fn default() -> Self {
        Self {
            filter: None,
            sort: Vec::new(),
            fields: Vec::new(),
            limit: MAX_ITEMS,
        }
    }
}

impl ItemQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Value) -> Self {
        let empty = filter.as_object().map(|m| m.is_empty()).unwrap_or(false);
        self.filter = if filter.is_null() || empty {
            None
        } else {
            Some(filter)
        };
        self
    }

    pub fn sort(mut self, sort: Vec<String>) -> Self {
        self.sort = sort;
        self
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    /// Applies a caller-requested limit, clamped to `1..=MAX_ITEMS`.
    pub fn limit(mut self, requested: Option<i64>) -> Self {
        self.limit = match requested {
            Some(n) if n < 1 => 1,
            Some(n) if n < MAX_ITEMS as i64 => n as u32,
            _ => MAX_ITEMS,
        };
        self
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit.min(MAX_ITEMS)
    }

    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(filter) = &self.filter {
            pairs.push(("filter".to_string(), filter.to_string()));
        }
        if !self.sort.is_empty() {
            pairs.push(("sort".to_string(), self.sort.join(",")));
        }
        if !self.fields.is_empty() {
            pairs.push(("fields".to_string(), self.fields.join(",")));
        }
        pairs.push(("limit".to_string(), self.effective_limit().to_string()));
        pairs
    }
}

/// Read access to the headless content store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn read_items(&self, collection: Collection, query: &ItemQuery)
        -> anyhow::Result<Vec<Value>>;
}

pub struct DirectusClient {
    base_url: String,
    token: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ItemsEnvelope {
    #[serde(default)]
    data: Vec<Value>,
}

impl DirectusClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build content api http client")?;
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    pub fn items_url(&self, collection: Collection) -> String {
        format!("{}/items/{}", self.base_url, collection.as_str())
    }
}

#[async_trait]
impl ContentStore for DirectusClient {
    async fn read_items(
        &self,
        collection: Collection,
        query: &ItemQuery,
    ) -> anyhow::Result<Vec<Value>> {
        let response = self
            .client
            .get(self.items_url(collection))
            .bearer_auth(&self.token)
            .query(&query.to_query_pairs())
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        tracing::debug!(
            collection = collection.as_str(),
            %status,
            bytes = text.len(),
            "content api response"
        );

        if !status.is_success() {
            let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let detail = extract_directus_error(&value)
                .unwrap_or_else(|| format!("content api request failed with status {status}"));
            anyhow::bail!("{}: {}", collection.as_str(), detail);
        }

        let envelope: ItemsEnvelope = serde_json::from_str(&text)?;
        Ok(envelope.data)
    }
}

fn extract_directus_error(value: &Value) -> Option<String> {
    let messages = value
        .get("errors")?
        .as_array()?
        .iter()
        .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
        .collect::<Vec<_>>();
    if messages.is_empty() {
        None
    } else {
        Some(messages.join("; "))
    }
}
