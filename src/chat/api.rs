//! HTTP calls against the messaging backend.

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::error::ChatError;
use super::metadata::DeploymentMetadata;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenRequest<'a> {
    org_id: &'a str,
    deployment_id: &'a str,
    capabilities_version: &'a str,
    platform: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    last_event_id: Option<serde_json::Value>,
}

/// Credentials returned by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub access_token: String,
    pub last_event_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest<'a> {
    conversation_id: &'a str,
    deployment_id: &'a str,
    routing_attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub message: OutboundMessage,
    pub deployment_id: String,
    pub is_new_messaging_session: bool,
    pub language: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: String,
    pub message_type: &'static str,
    pub static_content: StaticContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticContent {
    pub format_type: &'static str,
    pub text: String,
}

impl SendMessageRequest {
    pub fn text(
        message_id: impl Into<String>,
        text: impl Into<String>,
        deployment_id: impl Into<String>,
        is_new_messaging_session: bool,
        language: impl Into<String>,
    ) -> Self {
        Self {
            message: OutboundMessage {
                id: message_id.into(),
                message_type: "StaticContentMessage",
                static_content: StaticContent {
                    format_type: "Text",
                    text: text.into(),
                },
            },
            deployment_id: deployment_id.into(),
            is_new_messaging_session,
            language: language.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MessagingApi {
    client: reqwest::Client,
    base_url: String,
}

impl MessagingApi {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange deployment metadata for a short-lived bearer token.
    pub async fn request_access_token(
        &self,
        metadata: &DeploymentMetadata,
    ) -> Result<AccessGrant, ChatError> {
        let endpoint = format!(
            "{}/authorization/unauthenticated/access-token",
            self.base_url
        );
        let body = AccessTokenRequest {
            org_id: &metadata.org_id,
            deployment_id: &metadata.deployment_id,
            capabilities_version: &metadata.capabilities_version,
            platform: &metadata.platform,
        };

        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;
        tracing::debug!("access token response: status={status}");

        if !status.is_success() {
            return Err(ChatError::Auth(upstream_message(status, &text)));
        }
        if text.trim().is_empty() {
            return Err(ChatError::Auth(
                "access token response was empty".to_string(),
            ));
        }

        let parsed: AccessTokenResponse = serde_json::from_str(&text)
            .map_err(|e| ChatError::Auth(format!("invalid access token response: {e}")))?;
        if parsed.access_token.trim().is_empty() {
            return Err(ChatError::Auth(
                "access token response did not include a token".to_string(),
            ));
        }

        let last_event_id = parsed.last_event_id.and_then(|value| match value {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        Ok(AccessGrant {
            access_token: parsed.access_token,
            last_event_id,
        })
    }

    /// Create a conversation under a client-chosen id. A 2xx response with an
    /// empty body is success.
    pub async fn create_conversation(
        &self,
        access_token: &str,
        conversation_id: &str,
        deployment_id: &str,
    ) -> Result<(), ChatError> {
        let endpoint = format!("{}/conversation", self.base_url);
        let body = CreateConversationRequest {
            conversation_id,
            deployment_id,
            routing_attributes: serde_json::Map::new(),
        };

        let response = self
            .client
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Bearer {access_token}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ChatError::Auth(upstream_message(status, &text)));
            }
            return Err(ChatError::Network(upstream_message(status, &text)));
        }
        tracing::debug!(conversation_id, "conversation created");
        Ok(())
    }

    pub async fn send_message(
        &self,
        access_token: &str,
        conversation_id: &str,
        request: &SendMessageRequest,
    ) -> Result<(), ChatError> {
        let endpoint = format!(
            "{}/conversation/{}/message",
            self.base_url,
            urlencoding::encode(conversation_id)
        );

        let response = self
            .client
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Bearer {access_token}"))
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::Send(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::Send(upstream_message(status, &text)));
        }
        Ok(())
    }

    /// Open the live event stream, resuming after `last_event_id` when given.
    pub async fn open_event_stream(
        &self,
        access_token: &str,
        org_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<Response, ChatError> {
        let endpoint = format!("{}/events", self.base_url);
        let mut request = self
            .client
            .get(&endpoint)
            .header(AUTHORIZATION, format!("Bearer {access_token}"))
            .header(ACCEPT, "text/event-stream")
            .header("X-Org-Id", org_id);
        if let Some(last) = last_event_id {
            request = request.header("Last-Event-ID", last);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChatError::Stream(format!("failed to open event stream: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::Stream(upstream_message(status, &text)));
        }
        tracing::info!("connected to event stream at {endpoint}");
        Ok(response)
    }
}

/// Error text to show the user: the backend's `message` field when the body
/// is JSON carrying one, otherwise the raw body, otherwise the status.
fn upstream_message(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("request failed with status {status}");
    }
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(message) = json.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    trimmed.to_string()
}
