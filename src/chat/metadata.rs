//! Deployment metadata: the routing/config lookup that precedes
//! authentication.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ChatError;
use crate::config::ChatSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMetadata {
    pub org_id: String,
    pub deployment_id: String,
    pub capabilities_version: String,
    pub platform: String,
    /// Base URL for the token, conversation, message and event endpoints.
    pub token_endpoint_base: String,
}

/// Trusted source of deployment metadata. Failures are configuration errors.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch_metadata(&self, deployment_id: &str) -> Result<DeploymentMetadata, ChatError>;
}

/// Resolves metadata from the local settings snapshot.
pub struct SettingsConfigSource {
    settings: ChatSettings,
}

impl SettingsConfigSource {
    pub fn new(settings: ChatSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ConfigSource for SettingsConfigSource {
    async fn fetch_metadata(&self, deployment_id: &str) -> Result<DeploymentMetadata, ChatError> {
        let org_id = self
            .settings
            .org_id()
            .ok_or_else(|| ChatError::Configuration("org id is not configured".to_string()))?;
        let base = self.settings.api_base_url().ok_or_else(|| {
            ChatError::Configuration("api base url is not configured".to_string())
        })?;

        Ok(DeploymentMetadata {
            org_id: org_id.to_string(),
            deployment_id: deployment_id.to_string(),
            capabilities_version: self.settings.capabilities_version().to_string(),
            platform: self.settings.platform().to_string(),
            token_endpoint_base: base.trim_end_matches('/').to_string(),
        })
    }
}

/// Fixed metadata, for hosts that resolve it out of band.
pub struct StaticConfigSource {
    metadata: DeploymentMetadata,
}

impl StaticConfigSource {
    pub fn new(metadata: DeploymentMetadata) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch_metadata(&self, _deployment_id: &str) -> Result<DeploymentMetadata, ChatError> {
        Ok(self.metadata.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_source_fills_defaults_and_trims_base() {
        let source = SettingsConfigSource::new(ChatSettings {
            org_id: Some("00D1".to_string()),
            api_base_url: Some("https://chat.example.com/api/".to_string()),
            ..Default::default()
        });

        let metadata = source.fetch_metadata("Support_Web").await.unwrap();
        assert_eq!(metadata.deployment_id, "Support_Web");
        assert_eq!(metadata.capabilities_version, "1");
        assert_eq!(metadata.platform, "Web");
        assert_eq!(metadata.token_endpoint_base, "https://chat.example.com/api");
    }

    #[tokio::test]
    async fn missing_org_or_base_is_a_configuration_error() {
        let source = SettingsConfigSource::new(ChatSettings {
            api_base_url: Some("https://chat.example.com".to_string()),
            ..Default::default()
        });
        let err = source.fetch_metadata("Support_Web").await.unwrap_err();
        assert!(matches!(err, ChatError::Configuration(_)));
        assert!(!err.is_retriable());
    }
}
