//! HTTP transport for the ingest service.
//!
//! The span pipeline consumes remote I/O only through the [`Transport`]
//! trait: a JSON `post` and a multipart `upload_file`, both returning the
//! service's `{code, msg, data}` envelope or a typed error. [`HttpTransport`]
//! is the production implementation over reqwest, with auth header
//! injection, log-id capture, and a classification-driven retry loop
//! (transport faults and 5xx replies retry, auth errors and 4xx do not).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{LoopError, Result};

pub mod auth;
pub mod backoff;
pub mod sse;

pub use auth::{Auth, JwtAuth, TokenAuth};
pub use backoff::Backoff;

/// Response header carrying the server-side request id, echoed back in
/// [`LoopError::RemoteService`] for correlation.
pub const LOG_ID_HEADER: &str = "x-log-id";

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default timeout for JSON calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Default timeout for file uploads.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// The service's standard `{code, msg, data}` reply envelope. `code == 0`
/// means success at the application level.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Server request id, taken from the response headers.
    #[serde(skip)]
    pub log_id: String,
}

/// Remote calls the span pipeline depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON body and decode the reply envelope.
    async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse>;

    /// Upload one file as multipart form data. The file part is keyed by
    /// `tos_key`; `form` carries additional plain fields.
    async fn upload_file(
        &self,
        path: &str,
        tos_key: &str,
        data: Vec<u8>,
        form: HashMap<String, String>,
    ) -> Result<ApiResponse>;
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub upload_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

/// Production [`Transport`] over reqwest.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    upload_client: reqwest::Client,
    auth: Arc<dyn Auth>,
    backoff: Backoff,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        auth: Arc<dyn Auth>,
        options: TransportOptions,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| LoopError::internal(format!("failed to build http client: {}", e)))?;
        let upload_client = reqwest::Client::builder()
            .timeout(options.upload_timeout)
            .build()
            .map_err(|e| LoopError::internal(format!("failed to build upload client: {}", e)))?;
        Ok(Self {
            base_url,
            client,
            upload_client,
            auth,
            backoff: Backoff::default(),
        })
    }

    async fn do_post(&self, path: &str, body: &serde_json::Value) -> Result<ApiResponse> {
        let token = self.auth.token().await?;
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn do_upload(
        &self,
        path: &str,
        tos_key: &str,
        data: Vec<u8>,
        form_fields: &HashMap<String, String>,
    ) -> Result<ApiResponse> {
        let token = self.auth.token().await?;
        let mut form = reqwest::multipart::Form::new();
        for (key, value) in form_fields {
            form = form.text(key.clone(), value.clone());
        }
        let part = reqwest::multipart::Part::bytes(data).file_name(tos_key.to_string());
        form = form.part(tos_key.to_string(), part);

        let response = self
            .upload_client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        handle_response(response).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        debug!(path, "posting json request");
        self.backoff
            .retry(DEFAULT_RETRY_ATTEMPTS, || self.do_post(path, &body))
            .await
    }

    async fn upload_file(
        &self,
        path: &str,
        tos_key: &str,
        data: Vec<u8>,
        form: HashMap<String, String>,
    ) -> Result<ApiResponse> {
        debug!(path, tos_key, bytes = data.len(), "uploading file");
        self.backoff
            .retry(DEFAULT_RETRY_ATTEMPTS, || {
                self.do_upload(path, tos_key, data.clone(), &form)
            })
            .await
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

async fn handle_response(response: reqwest::Response) -> Result<ApiResponse> {
    let status = response.status();
    let log_id = response
        .headers()
        .get(LOG_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.text().await?;

    if status.as_u16() == 401 || status.as_u16() == 403 {
        let parsed: AuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let message = if parsed.error_message.is_empty() {
            body
        } else {
            parsed.error_message
        };
        return Err(LoopError::auth_error(parsed.error_code, message));
    }

    let mut envelope: ApiResponse = serde_json::from_str(&body).unwrap_or_default();
    envelope.log_id = log_id.clone();

    if !status.is_success() {
        let message = if envelope.msg.is_empty() {
            body
        } else {
            envelope.msg.clone()
        };
        return Err(LoopError::remote_service(
            status.as_u16(),
            envelope.code,
            log_id,
            message,
        ));
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_decoding() {
        let ok: ApiResponse = serde_json::from_str(r#"{"code":0,"msg":""}"#).unwrap();
        assert_eq!(ok.code, 0);

        let failed: ApiResponse =
            serde_json::from_str(r#"{"code":4000,"msg":"quota exceeded"}"#).unwrap();
        assert_eq!(failed.code, 4000);
        assert_eq!(failed.msg, "quota exceeded");

        // unknown fields and missing fields are tolerated
        let sparse: ApiResponse = serde_json::from_str(r#"{"extra":true}"#).unwrap();
        assert_eq!(sparse.code, 0);
    }
}
