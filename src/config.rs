//! Typed settings for the chat client and the activity tracker.
//!
//! Every field is optional; the accessor methods apply the defaults below.
//! Blank strings are treated as unset.
//!
//! | Setting                  | Default            |
//! |--------------------------|--------------------|
//! | capabilities version     | `1`                |
//! | platform                 | `Web`              |
//! | language                 | `en_US`            |
//! | display mode             | `Inline`           |
//! | session-active wait      | 15 s               |
//! | greeting wait            | 10 s               |
//! | connect wait policy      | `Proceed`          |
//! | stream reconnects        | 3                  |
//! | tracking flags           | all enabled        |
//! | flush count threshold    | 5 events           |
//! | flush interval           | 30 s               |
//! | tracker source           | `chatwire.tracker` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::SessionEventType;

pub const DEFAULT_CAPABILITIES_VERSION: &str = "1";
pub const DEFAULT_PLATFORM: &str = "Web";
pub const DEFAULT_LANGUAGE: &str = "en_US";
pub const DEFAULT_ACTIVE_WAIT: Duration = Duration::from_secs(15);
pub const DEFAULT_GREETING_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_STREAM_RECONNECTS: u32 = 3;
pub const DEFAULT_FLUSH_THRESHOLD: usize = 5;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TRACKER_SOURCE: &str = "chatwire.tracker";

const ENV_PREFIX: &str = "CHATWIRE_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// What to do when a bounded connect wait (session active, first greeting)
/// runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectWaitPolicy {
    /// Stop waiting and finish connecting.
    #[default]
    Proceed,
    /// Treat the timeout as a connection failure.
    Fail,
}

impl FromStr for ConnectWaitPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proceed" => Ok(Self::Proceed),
            "fail" => Ok(Self::Fail),
            _ => Err(format!("unsupported connect wait policy: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Inline,
    Floating,
}

impl FromStr for DisplayMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "floating" => Ok(Self::Floating),
            _ => Err(format!("unsupported display mode: {value}")),
        }
    }
}

/// Immutable settings snapshot handed to the client and tracker at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    pub org_id: Option<String>,
    pub deployment_id: Option<String>,
    pub api_base_url: Option<String>,
    pub capabilities_version: Option<String>,
    pub platform: Option<String>,
    pub language: Option<String>,
    pub display_mode: Option<DisplayMode>,
    pub active_wait_secs: Option<u64>,
    pub greeting_wait_secs: Option<u64>,
    pub connect_wait_policy: Option<ConnectWaitPolicy>,
    pub max_stream_reconnects: Option<u32>,
    pub tracking: TrackingSettings,
}

impl ChatSettings {
    pub fn org_id(&self) -> Option<&str> {
        non_empty(self.org_id.as_deref())
    }

    pub fn deployment_id(&self) -> Option<&str> {
        non_empty(self.deployment_id.as_deref())
    }

    pub fn api_base_url(&self) -> Option<&str> {
        non_empty(self.api_base_url.as_deref())
    }

    pub fn capabilities_version(&self) -> &str {
        non_empty(self.capabilities_version.as_deref()).unwrap_or(DEFAULT_CAPABILITIES_VERSION)
    }

    pub fn platform(&self) -> &str {
        non_empty(self.platform.as_deref()).unwrap_or(DEFAULT_PLATFORM)
    }

    pub fn language(&self) -> &str {
        non_empty(self.language.as_deref()).unwrap_or(DEFAULT_LANGUAGE)
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode.unwrap_or_default()
    }

    pub fn active_wait(&self) -> Duration {
        self.active_wait_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ACTIVE_WAIT)
    }

    pub fn greeting_wait(&self) -> Duration {
        self.greeting_wait_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_GREETING_WAIT)
    }

    pub fn connect_wait_policy(&self) -> ConnectWaitPolicy {
        self.connect_wait_policy.unwrap_or_default()
    }

    pub fn max_stream_reconnects(&self) -> u32 {
        self.max_stream_reconnects
            .unwrap_or(DEFAULT_STREAM_RECONNECTS)
    }

    pub fn tracking_options(&self) -> TrackingOptions {
        self.tracking.resolve()
    }

    /// Load settings from `CHATWIRE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup. Keys are the full
    /// variable names, e.g. `CHATWIRE_DEPLOYMENT_ID`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| -> Option<String> {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).and_then(|v| non_empty(Some(v.as_str())).map(str::to_string))
        };

        Ok(Self {
            org_id: get("ORG_ID"),
            deployment_id: get("DEPLOYMENT_ID"),
            api_base_url: get("API_BASE_URL"),
            capabilities_version: get("CAPABILITIES_VERSION"),
            platform: get("PLATFORM"),
            language: get("LANGUAGE"),
            display_mode: parse_opt(&get, "DISPLAY_MODE")?,
            active_wait_secs: parse_opt(&get, "ACTIVE_WAIT_SECS")?,
            greeting_wait_secs: parse_opt(&get, "GREETING_WAIT_SECS")?,
            connect_wait_policy: parse_opt(&get, "CONNECT_WAIT_POLICY")?,
            max_stream_reconnects: parse_opt(&get, "STREAM_RECONNECTS")?,
            tracking: TrackingSettings {
                track_lifecycle: parse_flag(&get, "TRACK_LIFECYCLE")?,
                track_messages: parse_flag(&get, "TRACK_MESSAGES")?,
                track_link_clicks: parse_flag(&get, "TRACK_LINK_CLICKS")?,
                track_form_submits: parse_flag(&get, "TRACK_FORM_SUBMITS")?,
                track_time_in_chat: parse_flag(&get, "TRACK_TIME_IN_CHAT")?,
                flush_threshold: parse_opt(&get, "FLUSH_THRESHOLD")?,
                flush_interval_secs: parse_opt(&get, "FLUSH_INTERVAL_SECS")?,
                source: get("TRACKER_SOURCE"),
            },
        })
    }
}

/// Tracker settings as configured; see [`TrackingOptions`] for resolved values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackingSettings {
    pub track_lifecycle: Option<bool>,
    pub track_messages: Option<bool>,
    pub track_link_clicks: Option<bool>,
    pub track_form_submits: Option<bool>,
    pub track_time_in_chat: Option<bool>,
    pub flush_threshold: Option<usize>,
    pub flush_interval_secs: Option<u64>,
    pub source: Option<String>,
}

impl TrackingSettings {
    pub fn resolve(&self) -> TrackingOptions {
        let defaults = TrackingOptions::default();
        TrackingOptions {
            track_lifecycle: self.track_lifecycle.unwrap_or(defaults.track_lifecycle),
            track_messages: self.track_messages.unwrap_or(defaults.track_messages),
            track_link_clicks: self.track_link_clicks.unwrap_or(defaults.track_link_clicks),
            track_form_submits: self.track_form_submits.unwrap_or(defaults.track_form_submits),
            track_time_in_chat: self.track_time_in_chat.unwrap_or(defaults.track_time_in_chat),
            flush_threshold: self
                .flush_threshold
                .filter(|n| *n > 0)
                .unwrap_or(defaults.flush_threshold),
            flush_interval: self
                .flush_interval_secs
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.flush_interval),
            source: non_empty(self.source.as_deref())
                .map(str::to_string)
                .unwrap_or(defaults.source),
        }
    }
}

/// Resolved tracker behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingOptions {
    pub track_lifecycle: bool,
    pub track_messages: bool,
    pub track_link_clicks: bool,
    pub track_form_submits: bool,
    pub track_time_in_chat: bool,
    pub flush_threshold: usize,
    pub flush_interval: Duration,
    pub source: String,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            track_lifecycle: true,
            track_messages: true,
            track_link_clicks: true,
            track_form_submits: true,
            track_time_in_chat: true,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            source: DEFAULT_TRACKER_SOURCE.to_string(),
        }
    }
}

impl TrackingOptions {
    /// Whether events of `kind` are appended to the activity log.
    pub fn tracks(&self, kind: SessionEventType) -> bool {
        match kind {
            k if k.is_lifecycle() => self.track_lifecycle,
            k if k.is_message() => self.track_messages,
            SessionEventType::LinkClick => self.track_link_clicks,
            _ => self.track_form_submits,
        }
    }
}

/// `None` for missing or whitespace-only values.
pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_opt<T, G>(get: &G, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: format!("{ENV_PREFIX}{name}"),
                value: raw,
            }),
        None => Ok(None),
    }
}

fn parse_flag<G>(get: &G, name: &str) -> Result<Option<bool>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid {
                key: format!("{ENV_PREFIX}{name}"),
                value: raw,
            }),
        },
        None => Ok(None),
    }
}
