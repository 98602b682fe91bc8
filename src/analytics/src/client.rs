use std::time::Duration;

use async_trait::async_trait;

use crate::AnalyticsError;

/// The analytics store speaks SQL over HTTP; this is the whole surface the
/// adapter needs. A rejected statement comes back as `Status` with the
/// store's error text in the body.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait SqlClient: Send + Sync {
    /// Runs a statement, returning the raw response body.
    async fn execute(&self, sql: &str) -> Result<String, AnalyticsError>;
}

pub struct HttpAnalyticsClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl HttpAnalyticsClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        request_timeout: Duration,
    ) -> Result<Self, AnalyticsError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()?,
        })
    }
}

#[async_trait]
impl SqlClient for HttpAnalyticsClient {
    async fn execute(&self, sql: &str) -> Result<String, AnalyticsError> {
        let resp = self
            .http
            .post(&self.base_url)
            .header("X-ClickHouse-User", &self.username)
            .header("X-ClickHouse-Key", &self.password)
            .body(sql.to_string())
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(AnalyticsError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

/// Quotes a value as a SQL string literal. Subject ids and emails come from
/// an operator-supplied CSV, so they are escaped, not trusted.
pub fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
