use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::SearchError;

/// Response to an `_update_by_query` submission. With
/// `wait_for_completion=false` the store hands back a task id; small
/// clusters may still answer synchronously with counts.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateByQueryResponse {
    pub task: Option<String>,
    pub updated: Option<u64>,
    pub noops: Option<u64>,
}

/// Distilled status of one async update task.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskStatus {
    pub completed: bool,
    pub updated: u64,
    pub noops: u64,
}

/// Hits from a search request; `hits` carries `{_index, _source}` pairs.
#[derive(Clone, Debug, Default)]
pub struct SearchHits {
    pub total: u64,
    pub hits: Vec<Value>,
}

/// The slice of the search store's HTTP surface this tool drives.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait SearchStore: Send + Sync {
    async fn index_exists(&self, index: &str) -> Result<bool, SearchError>;
    async fn update_by_query(
        &self,
        index: &str,
        body: &Value,
    ) -> Result<UpdateByQueryResponse, SearchError>;
    async fn task_status(&self, task_id: &str) -> Result<TaskStatus, SearchError>;
    async fn search(&self, index: &str, body: &Value) -> Result<SearchHits, SearchError>;
    /// Index names matching a `_cat` pattern, in store order.
    async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, SearchError>;
}

/// Production client: one pooled HTTP client, per-call timeout from config.
pub struct HttpSearchClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSearchClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, SearchError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()?,
        })
    }

    async fn json_response(resp: reqwest::Response) -> Result<Value, SearchError> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(SearchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl SearchStore for HttpSearchClient {
    async fn index_exists(&self, index: &str) -> Result<bool, SearchError> {
        let url = format!("{}/{index}", self.base_url);
        let resp = self.http.head(&url).send().await?;
        Ok(resp.status().is_success())
    }

    async fn update_by_query(
        &self,
        index: &str,
        body: &Value,
    ) -> Result<UpdateByQueryResponse, SearchError> {
        let url = format!(
            "{}/{index}/_update_by_query?wait_for_completion=false&slices=auto&conflicts=proceed",
            self.base_url
        );
        let resp = self.http.post(&url).json(body).send().await?;
        let value = Self::json_response(resp).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatus, SearchError> {
        let url = format!("{}/_tasks/{task_id}", self.base_url);
        let resp = self.http.get(&url).send().await?;
        let value = Self::json_response(resp).await?;

        let status = &value["task"]["status"];
        Ok(TaskStatus {
            completed: value["completed"].as_bool().unwrap_or(false),
            updated: status["updated"].as_u64().unwrap_or(0),
            noops: status["noops"].as_u64().unwrap_or(0),
        })
    }

    async fn search(&self, index: &str, body: &Value) -> Result<SearchHits, SearchError> {
        let url = format!("{}/{index}/_search", self.base_url);
        let resp = self.http.post(&url).json(body).send().await?;
        let value = Self::json_response(resp).await?;

        let total = value["hits"]["total"]["value"].as_u64().unwrap_or(0);
        let hits = value["hits"]["hits"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(SearchHits { total, hits })
    }

    async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, SearchError> {
        let url = format!("{}/_cat/indices/{pattern}?format=json", self.base_url);
        let resp = self.http.get(&url).send().await?;
        let value = Self::json_response(resp).await?;

        let names = value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row["index"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}
