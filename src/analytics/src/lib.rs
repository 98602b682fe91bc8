pub mod adapter;
pub mod client;
pub mod tokens;

pub use adapter::{AnalyticsAdapter, MatchRule, TablePolicy, TABLE_POLICIES};
pub use client::{HttpAnalyticsClient, SqlClient};
pub use tokens::mask_token_list;

/// Transport-level errors from the analytics store. Statement rejections the
/// store reports in the response body are classified by the adapter, not
/// surfaced here.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
}
