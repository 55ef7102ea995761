//! Thin HTTP-JSON client for the external stream registry.
//!
//! The registry tracks live mountpoints (`create`/`delete`) and process
//! liveness (`keepalive`). Every request carries JSON `Accept` and
//! `Content-Type` headers; callers that must not share a connection pool
//! (the keepalive loop) construct their own client.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Registry response code flagging a duplicate stream id.
pub const DUPLICATE_ID_CODE: i64 = 11000;

/// Parsed response of a registry create.
#[derive(Debug, Clone, Default)]
pub struct CreateResponse {
    /// Opaque record id (`_id`) to pass to [`RegistryClient::delete`].
    pub id: Option<String>,
    /// Optional error code; [`DUPLICATE_ID_CODE`] means the stream id is
    /// already taken.
    pub code: Option<i64>,
}

impl CreateResponse {
    pub fn is_duplicate(&self) -> bool {
        self.code == Some(DUPLICATE_ID_CODE)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> RegistryClient {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .expect("reqwest client construction cannot fail with static headers");
        RegistryClient { http }
    }

    /// Registers a stream: `POST <base_url>` with the mount URL and id.
    pub async fn create(&self, base_url: &str, rtsp_url: &str, id: &str) -> Result<CreateResponse> {
        let body = json!({ "uri": rtsp_url, "id": id });
        let response: Value = self
            .http
            .post(base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::registry(format!("create request failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::registry(format!("create response is not JSON: {e}")))?;

        debug!(%id, ?response, "registry create response");
        Ok(CreateResponse {
            id: response
                .get("_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            code: response.get("code").and_then(Value::as_i64),
        })
    }

    /// Heartbeats this process: `POST <url>` with the process id and the
    /// interval in seconds. The response body is ignored.
    pub async fn keepalive(&self, url: &str, pid: &str, interval_secs: u64) -> Result<()> {
        let body = json!({ "pid": pid, "dly": interval_secs.to_string() });
        self.http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::registry(format!("keepalive request failed: {e}")))?;
        Ok(())
    }

    /// Removes a record: `DELETE <base_url>/<id>`. The response is ignored.
    pub async fn delete(&self, base_url: &str, id: &str) -> Result<()> {
        self.http
            .delete(format!("{base_url}/{id}"))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| Error::registry(format!("delete request failed: {e}")))?;
        Ok(())
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        RegistryClient::new()
    }
}
