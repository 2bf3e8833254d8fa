//! Vellum Meter HTTP client implementation.

use reqwest::Client;
use std::time::Duration;

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, ConsumeRequest, ConversationResponse, QuotaStatusResponse, RefundRequest,
    SessionResponse, TelemetryRequest, TelemetryResponse,
};

/// Vellum Meter API client.
///
/// Provides methods for consuming quota on behalf of a caller,
/// forwarding telemetry, issuing refunds, and reading session rollups.
#[derive(Debug, Clone)]
pub struct MeterClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    service_name: String,
}

impl MeterClient {
    /// Create a new metering client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the vellum-meter service (e.g., `"http://vellum-meter:8080"`)
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_options(base_url, ClientOptions::default())
    }

    /// Create a new metering client with custom options.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be built (should not happen with default settings).
    #[must_use]
    pub fn with_options(base_url: impl Into<String>, options: ClientOptions) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: options.api_key,
            service_name: options.service_name,
        }
    }

    /// Consume quota on behalf of an authenticated user, forwarding
    /// their bearer token.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::QuotaExceeded` when the allowance cannot
    /// cover `cost`, or another error if the request fails.
    pub async fn consume_as_user(
        &self,
        user_jwt: &str,
        cost: i64,
    ) -> Result<QuotaStatusResponse, ClientError> {
        let url = format!("{}/v1/quota/consume", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {user_jwt}"))
            .json(&ConsumeRequest { cost })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Consume quota on behalf of an anonymous visitor, forwarding
    /// their session cookie.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::QuotaExceeded` when the allowance cannot
    /// cover `cost`, or another error if the request fails.
    pub async fn consume_as_visitor(
        &self,
        session_id: &str,
        cost: i64,
    ) -> Result<QuotaStatusResponse, ClientError> {
        let url = format!("{}/v1/quota/consume", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("cookie", format!("vm_session={session_id}"))
            .json(&ConsumeRequest { cost })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Read a user's quota standing without consuming.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn quota_status(&self, user_jwt: &str) -> Result<QuotaStatusResponse, ClientError> {
        let url = format!("{}/v1/quota/status", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("authorization", format!("Bearer {user_jwt}"))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Return consumed units after a downstream failure (requires a
    /// service API key).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` when no API key is set, or
    /// another error if the request fails.
    pub async fn refund(&self, request: RefundRequest) -> Result<QuotaStatusResponse, ClientError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            ClientError::Configuration("refund requires a service API key".into())
        })?;

        let url = format!("{}/v1/quota/refund", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("x-service-name", &self.service_name)
            .json(&request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Record one interaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn record_telemetry(
        &self,
        request: TelemetryRequest,
    ) -> Result<TelemetryResponse, ClientError> {
        let url = format!("{}/v1/telemetry", self.base_url);
        let response = self.client.post(&url).json(&request).send().await?;
        Self::handle_response(response).await
    }

    /// Read a session's rollup snapshot.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::SessionNotFound` for unknown sessions, or
    /// another error if the request fails.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionResponse, ClientError> {
        let url = format!("{}/v1/sessions/{session_id}", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::handle_response(response).await
    }

    /// Close a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn end_session(&self, session_id: &str) -> Result<SessionResponse, ClientError> {
        let url = format!("{}/v1/sessions/{session_id}/end", self.base_url);
        let response = self.client.post(&url).send().await?;
        Self::handle_response(response).await
    }

    /// Read a conversation's chat aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationResponse, ClientError> {
        let url = format!("{}/v1/conversations/{conversation_id}", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::handle_response(response).await
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        tracing::debug!(status = %status, "metering API returned an error");

        // Try to parse error response
        let error_body: Result<ApiErrorResponse, _> = response.json().await;

        match error_body {
            Ok(api_error) => {
                let code = api_error.error.code.as_str();
                let message = api_error.error.message;

                // Map specific error codes to typed errors
                match code {
                    "quota_exceeded" => {
                        let detail = |field: &str| {
                            api_error
                                .error
                                .details
                                .as_ref()
                                .and_then(|d| d.get(field))
                                .cloned()
                        };
                        let limit = detail("limit").and_then(|v| v.as_i64()).unwrap_or(0);
                        let used = detail("used").and_then(|v| v.as_i64()).unwrap_or(0);
                        let reset_at = detail("reset_at")
                            .and_then(|v| serde_json::from_value(v).ok());

                        Err(ClientError::QuotaExceeded {
                            limit,
                            used,
                            reset_at,
                        })
                    }
                    "not_found" if message.contains("session") => {
                        Err(ClientError::SessionNotFound {
                            session_id: message.replace("not found: session ", ""),
                        })
                    }
                    _ => Err(ClientError::Api {
                        code: code.to_string(),
                        message,
                        status: status.as_u16(),
                    }),
                }
            }
            Err(_) => Err(ClientError::Api {
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
                status: status.as_u16(),
            }),
        }
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 30).
    pub timeout_seconds: u64,
    /// Service API key for refund calls.
    pub api_key: Option<String>,
    /// Service name to include in requests.
    pub service_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            api_key: None,
            service_name: "unknown".to_string(),
        }
    }
}

impl ClientOptions {
    /// Create options with a service API key and name.
    #[must_use]
    pub fn with_service_key(api_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            service_name: name.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_creation() {
        let client = MeterClient::new("http://localhost:8080");
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = MeterClient::new("http://localhost:8080/");
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn client_options() {
        let options = ClientOptions::with_service_key("key", "chat-backend");
        let client = MeterClient::with_options("http://localhost:8080", options);
        assert_eq!(client.service_name, "chat-backend");
        assert!(client.api_key.is_some());
    }
}
