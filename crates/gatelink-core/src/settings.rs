//! Client settings and session key derivation
//!
//! Settings are one of the three records that survive restart. The CLI
//! layers its own configuration sources on top of these defaults; the
//! engine only ever sees the resolved struct.

use serde::{Deserialize, Serialize};

use crate::errors::{ClientError, Result};
use crate::storage::{load_json, save_json, StateStore, KEY_SETTINGS};

/// Client identifier sent in connect metadata and bound into auth payloads
pub const CLIENT_ID: &str = "gateway-client";

/// Fixed client-surface tag used in session key derivation
///
/// Stable across releases: changing it would silently detach every client
/// from its existing gateway session history.
pub const CLIENT_SURFACE: &str = "webchat";

// ----------------------------------------------------------------------------
// Client Settings
// ----------------------------------------------------------------------------

/// Resolved configuration the engine connects with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Gateway WebSocket endpoint (ws:// or wss://)
    pub gateway_url: String,

    /// Shared auth token, when the gateway requires one
    pub auth_token: Option<String>,

    /// Identifier of the agent this client talks to
    pub agent_id: String,

    /// Client mode reported in connect metadata and auth payloads
    pub client_mode: String,

    /// Requested role
    pub role: String,

    /// Requested scope set
    pub scopes: Vec<String>,

    /// Optional human-readable name shown by the gateway
    pub display_name: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            gateway_url: "ws://127.0.0.1:8800".to_string(),
            auth_token: None,
            agent_id: "main".to_string(),
            client_mode: "webchat".to_string(),
            role: "operator".to_string(),
            scopes: vec!["chat".to_string()],
            display_name: None,
        }
    }
}

impl ClientSettings {
    /// Deterministic session key for the configured agent
    ///
    /// Stable for the lifetime of a settings configuration; recomputed
    /// fresh on every queue flush so a settings change takes effect on the
    /// next connection, not mid-session.
    pub fn session_key(&self) -> String {
        format!("agent:{}:{}", self.agent_id, CLIENT_SURFACE)
    }

    /// Validate fields the engine cannot work without
    pub fn validate(&self) -> Result<()> {
        if !self.gateway_url.starts_with("ws://") && !self.gateway_url.starts_with("wss://") {
            return Err(ClientError::config_error(format!(
                "gateway_url must be a ws:// or wss:// endpoint, got {:?}",
                self.gateway_url
            )));
        }
        if self.agent_id.trim().is_empty() {
            return Err(ClientError::config_error("agent_id must not be empty"));
        }
        if self.client_mode.is_empty() {
            return Err(ClientError::config_error("client_mode must not be empty"));
        }
        Ok(())
    }

    /// Load persisted settings, falling back to defaults when absent
    pub fn load_or_default(store: &dyn StateStore) -> Result<Self> {
        Ok(load_json(store, KEY_SETTINGS)?.unwrap_or_default())
    }

    /// Persist these settings
    pub fn save(&self, store: &mut dyn StateStore) -> Result<()> {
        save_json(store, KEY_SETTINGS, self)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_session_key_is_deterministic() {
        let mut settings = ClientSettings::default();
        settings.agent_id = "atlas".to_string();

        assert_eq!(settings.session_key(), "agent:atlas:webchat");
        assert_eq!(settings.session_key(), settings.session_key());
    }

    #[test]
    fn test_validate_rejects_non_ws_url() {
        let mut settings = ClientSettings::default();
        settings.gateway_url = "http://example.com".to_string();
        assert!(settings.validate().is_err());

        settings.gateway_url = "wss://gw.example.com/ws".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_agent() {
        let mut settings = ClientSettings::default();
        settings.agent_id = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_persist_roundtrip() {
        let mut store = MemoryStore::new();

        let loaded = ClientSettings::load_or_default(&store).unwrap();
        assert_eq!(loaded, ClientSettings::default());

        let mut settings = ClientSettings::default();
        settings.agent_id = "atlas".to_string();
        settings.auth_token = Some("tok".to_string());
        settings.save(&mut store).unwrap();

        let reloaded = ClientSettings::load_or_default(&store).unwrap();
        assert_eq!(reloaded, settings);
    }
}
