pub mod adapter;
pub mod client;
pub mod discovery;
pub mod script;

pub use adapter::SearchAdapter;
pub use client::{HttpSearchClient, SearchHits, SearchStore, TaskStatus, UpdateByQueryResponse};
pub use discovery::discover_partitions;

/// Errors from the search store. All of these are handled at partition
/// granularity inside the adapter.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
}
