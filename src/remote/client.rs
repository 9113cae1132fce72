// ABOUTME: HTTP client for edge function batch processors and the jobs table
// ABOUTME: Maps transport failures into typed errors and reads job rows over PostgREST

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::models::{BackgroundJob, BatchResult, IndexStatus, JobStatus, ReindexJobResponse};
use crate::auth::SessionTokenProvider;
use crate::backfill::BatchEndpoint;
use crate::config::Config;
use crate::error::{InvokeError, ReindexError};
use crate::reindex::JobStore;
use crate::status::StatusSource;

pub struct RemoteClient {
    client: Client,
    api_base_url: String,
    anon_key: String,
    request_timeout: Duration,
    reindex_function: String,
    session: Arc<SessionTokenProvider>,
}

impl RemoteClient {
    pub fn new(config: &Config, session: Arc<SessionTokenProvider>) -> Result<Self> {
        // Batch calls carry their own per-kind timeout, so the client has none.
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base_url: config.remote.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.remote.anon_key.clone(),
            request_timeout: Duration::from_secs(config.remote.request_timeout_secs),
            reindex_function: config.reindex.function.clone(),
            session,
        })
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.api_base_url, path)
    }

    fn function_url(&self, function: &str) -> String {
        format!("{}/functions/v1/{}", self.api_base_url, function)
    }

    /// Table reads go out with the session token when one exists so row level
    /// security applies to the signed-in user.
    async fn rest(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .session
            .current_token()
            .await
            .unwrap_or_else(|| self.anon_key.clone());
        builder
            .timeout(self.request_timeout)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    async fn fetch_jobs(&self, query: &str) -> Result<Vec<BackgroundJob>> {
        let url = self.rest_url(&format!("background_jobs?select=*&{}", query));
        let response = self
            .rest(self.client.get(&url))
            .await
            .send()
            .await
            .context("Failed to query background jobs. The database may be unavailable")?;
        let response = ensure_success(response, "Background job query").await?;

        response
            .json()
            .await
            .context("Failed to parse background jobs")
    }
}

async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{} failed with status {}: {}", what, status, body);
    }
    Ok(response)
}

/// Pull the human readable message out of an error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["error", "message", "msg"]
                .iter()
                .find_map(|key| value.get(key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

fn transport_error(err: reqwest::Error) -> InvokeError {
    if err.is_timeout() {
        InvokeError::Network(format!("Request timed out: {}", err))
    } else {
        InvokeError::Network(format!("Failed to fetch: {}", err))
    }
}

fn parse_batch_result(status: StatusCode, body: &str) -> Result<BatchResult, InvokeError> {
    if !status.is_success() {
        return Err(InvokeError::from_status(status.as_u16(), error_message(body)));
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| InvokeError::InvalidResponse(format!("{}: {}", e, body)))?;
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Err(InvokeError::from_message(status.as_u16(), message));
    }

    serde_json::from_value(value).map_err(|e| InvokeError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl BatchEndpoint for RemoteClient {
    async fn invoke(
        &self,
        function: &str,
        body: &Value,
        token: &str,
    ) -> Result<BatchResult, InvokeError> {
        let url = self.function_url(function);
        debug!(function, "Invoking batch processor");

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        parse_batch_result(status, &text)
    }
}

#[async_trait]
impl JobStore for RemoteClient {
    async fn fetch_active_job(&self, job_type: &str) -> Result<Option<BackgroundJob>> {
        let jobs = self
            .fetch_jobs(&format!(
                "job_type=eq.{}&status=in.(pending,running)&order=created_at.desc&limit=1",
                job_type
            ))
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn fetch_background_job(&self, id: &str) -> Result<BackgroundJob> {
        self.fetch_jobs(&format!("id=eq.{}", id))
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("Background job {} not found", id))
    }

    async fn cancel_background_job(&self, id: &str) -> Result<()> {
        let url = self.rest_url(&format!("background_jobs?id=eq.{}", id));
        let response = self
            .rest(self.client.patch(&url))
            .await
            .json(&serde_json::json!({
                "status": JobStatus::Cancelled,
                "updated_at": chrono::Utc::now(),
            }))
            .send()
            .await
            .context("Failed to cancel background job")?;
        ensure_success(response, "Job cancellation").await?;
        Ok(())
    }

    async fn cancel_stalled_job(&self, id: &str) -> Result<bool> {
        let url = self.rest_url(&format!(
            "background_jobs?id=eq.{}&status=in.(pending,running)",
            id
        ));
        let response = self
            .rest(self.client.patch(&url))
            .await
            .header("Prefer", "return=representation")
            .json(&serde_json::json!({
                "status": JobStatus::Cancelled,
                "error": "Job stalled and was cancelled automatically",
                "updated_at": chrono::Utc::now(),
            }))
            .send()
            .await
            .context("Failed to cancel stalled job")?;
        let response = ensure_success(response, "Stalled job cancellation").await?;

        let rows: Vec<Value> = response
            .json()
            .await
            .context("Failed to parse cancellation response")?;
        Ok(!rows.is_empty())
    }

    async fn start_full_reindex_job(&self, token: &str) -> Result<String, ReindexError> {
        let url = self.function_url(&self.reindex_function);
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .json(&serde_json::json!({ "mode": "full_reindex", "background": true }))
            .send()
            .await
            .context("Failed to start full reindex")?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let job_id = body
                .get("job_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(ReindexError::AlreadyInProgress { job_id });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ReindexError::SessionExpired);
        }
        let response = ensure_success(response, "Full reindex start").await?;

        let started: ReindexJobResponse = response
            .json()
            .await
            .context("Failed to parse reindex job response")?;
        Ok(started.job_id)
    }
}

#[async_trait]
impl StatusSource for RemoteClient {
    async fn fetch_index_status(&self) -> Result<IndexStatus> {
        let url = self.rest_url("rpc/get_chunk_status");
        let response = self
            .rest(self.client.post(&url))
            .await
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("Failed to fetch index status")?;
        let response = ensure_success(response, "Index status query").await?;

        let value: Value = response
            .json()
            .await
            .context("Failed to parse index status")?;
        // Set-returning functions come back as a one-row array.
        let row = match value {
            Value::Array(rows) => rows.into_iter().next().unwrap_or(Value::Null),
            other => other,
        };
        if row.is_null() {
            return Ok(IndexStatus::default());
        }
        serde_json::from_value(row).context("Failed to parse index status row")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;

    fn client() -> RemoteClient {
        let mut config = Config::default();
        config.remote = RemoteConfig {
            supabase_url: "https://api.example.com/".to_string(),
            anon_key: "anon".to_string(),
            ..RemoteConfig::default()
        };
        let session = Arc::new(SessionTokenProvider::new(&config.remote).unwrap());
        RemoteClient::new(&config, session).unwrap()
    }

    #[test]
    fn test_client_urls() {
        let client = client();
        assert_eq!(
            client.function_url("chunk-transcripts"),
            "https://api.example.com/functions/v1/chunk-transcripts"
        );
        assert_eq!(
            client.rest_url("rpc/get_chunk_status"),
            "https://api.example.com/rest/v1/rpc/get_chunk_status"
        );
    }

    #[test]
    fn test_error_message_prefers_json_fields() {
        assert_eq!(error_message(r#"{"error":"JWT expired"}"#), "JWT expired");
        assert_eq!(error_message(r#"{"msg":"bad"}"#), "bad");
        assert_eq!(error_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn test_parse_batch_result_statuses() {
        let ok = parse_batch_result(
            StatusCode::OK,
            r#"{"success_count":10,"remaining":5,"complete":false,"total":25}"#,
        )
        .unwrap();
        assert_eq!(ok.success_count, 10);
        assert_eq!(ok.total, 25);

        let auth = parse_batch_result(StatusCode::UNAUTHORIZED, r#"{"message":"nope"}"#);
        assert!(auth.unwrap_err().is_auth());

        let server = parse_batch_result(StatusCode::BAD_GATEWAY, "upstream");
        assert!(matches!(server, Err(InvokeError::Server { status: 502, .. })));
    }

    #[test]
    fn test_error_field_in_ok_body_is_classified() {
        let err = parse_batch_result(StatusCode::OK, r#"{"error":"invalid JWT"}"#).unwrap_err();
        assert!(err.is_auth());

        let err = parse_batch_result(StatusCode::OK, "not json").unwrap_err();
        assert!(matches!(err, InvokeError::InvalidResponse(_)));
    }
}
