//! Shared HTTP plumbing for the REST-based providers.

use dirsync::{SyncError, SyncResult};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Builds a client with a bounded per-request timeout.
pub fn build_client(timeout: Duration) -> SyncResult<Client> {
    Client::builder()
        .user_agent("dirsync/1.0")
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::configuration(format!("failed to build HTTP client: {}", e)))
}

/// Maps a transport-level reqwest failure into the error taxonomy.
pub fn classify(provider: &str, err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::schema(format!("{} response could not be decoded: {}", provider, err))
    } else if err.is_builder() {
        SyncError::configuration(format!("{} request is invalid: {}", provider, err))
    } else {
        SyncError::network(format!("{} request failed: {}", provider, err))
    }
}

/// Check the response status and map known error codes to error kinds.
///
/// - 401/403 → configuration (credentials rejected)
/// - Other non-2xx → transient network error
pub async fn check_response(provider: &str, response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = body.chars().take(200).collect::<String>();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::configuration(format!(
            "{} rejected credentials ({}): {}",
            provider, status, detail
        ))),
        _ => Err(SyncError::network(format!(
            "{} API error ({}): {}",
            provider, status, detail
        ))),
    }
}

/// Checks the status, then decodes the body as `T`.
pub async fn read_json<T: DeserializeOwned>(provider: &str, response: Response) -> SyncResult<T> {
    let response = check_response(provider, response).await?;
    let body = response.text().await.map_err(|e| classify(provider, e))?;
    serde_json::from_str(&body).map_err(|e| {
        SyncError::schema(format!("{} returned an unexpected payload: {}", provider, e))
    })
}

/// Sends a prepared request and decodes the JSON answer.
pub async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> SyncResult<T> {
    let response = request.send().await.map_err(|e| classify(provider, e))?;
    read_json(provider, response).await
}
