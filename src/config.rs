//! Service configuration: a YAML file with `app`, `browser` and `render`
//! sections. Unknown keys are rejected so typos fail fast instead of
//! silently running with defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use snapdom_renderer::TriggerSpec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ServiceConfig {
    pub app: AppConfig,
    pub browser: BrowserConfigSection,
    pub render: RenderConfigSection,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AppConfig {
    pub port: u16,
    pub host: String,
    pub log_level: LogLevel,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
            log_level: LogLevel::Info,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Silent,
}

impl LogLevel {
    /// Directive for the tracing EnvFilter. `fatal` has no tracing
    /// equivalent and maps to `error`; `silent` turns logging off.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
            LogLevel::Silent => "off",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BrowserConfigSection {
    pub width: u32,
    pub height: u32,
    pub user_agent: Option<String>,
    pub provider: ProviderConfig,
}

impl Default for BrowserConfigSection {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            user_agent: None,
            provider: ProviderConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProviderConfig {
    #[serde(rename_all = "camelCase")]
    Internal {
        #[serde(default)]
        chrome_path: Option<PathBuf>,
        #[serde(default = "defaults::debug_port_base")]
        debug_port_base: u16,
        #[serde(default)]
        args_override: Option<Vec<String>>,
        #[serde(default)]
        extra_args: Vec<String>,
        #[serde(default = "defaults::auto_recycle")]
        auto_recycle: bool,
        #[serde(default = "defaults::auto_recycle_after_uptime_millis")]
        auto_recycle_after_uptime_millis: u64,
        #[serde(default = "defaults::auto_recycle_retry_after_millis")]
        auto_recycle_retry_after_millis: u64,
        #[serde(default = "defaults::recycle_drain_millis")]
        recycle_drain_millis: u64,
    },
    #[serde(rename_all = "camelCase")]
    ExternalStaticUrl {
        ws_url: String,
        #[serde(default)]
        reconnect_delay_millis: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    ExternalHostPort {
        host: String,
        port: u16,
        #[serde(default)]
        secure: bool,
        #[serde(default)]
        reconnect_delay_millis: Option<u64>,
    },
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Internal {
            chrome_path: None,
            debug_port_base: defaults::debug_port_base(),
            args_override: None,
            extra_args: Vec::new(),
            auto_recycle: defaults::auto_recycle(),
            auto_recycle_after_uptime_millis: defaults::auto_recycle_after_uptime_millis(),
            auto_recycle_retry_after_millis: defaults::auto_recycle_retry_after_millis(),
            recycle_drain_millis: defaults::recycle_drain_millis(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RenderConfigSection {
    pub page_load_timeout_millis: u64,
    pub allow_partial_load: bool,
    pub fresh_browser_context: bool,
    pub script_to_evaluate_on_new_document: Option<String>,
    pub expected_status_codes: Vec<u16>,
    pub completion_trigger: TriggerConfig,
}

impl Default for RenderConfigSection {
    fn default() -> Self {
        Self {
            page_load_timeout_millis: 20_000,
            allow_partial_load: false,
            fresh_browser_context: true,
            script_to_evaluate_on_new_document: None,
            expected_status_codes: Vec::new(),
            completion_trigger: TriggerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum TriggerConfig {
    #[serde(rename_all = "camelCase")]
    Requests {
        #[serde(default = "defaults::wait_after_last_request_millis")]
        wait_after_last_request_millis: u64,
    },
    #[serde(rename_all = "camelCase")]
    Event {
        #[serde(default = "defaults::event_target")]
        target: String,
        #[serde(default = "defaults::event_name")]
        event_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Variable { var_name: String },
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig::Requests {
            wait_after_last_request_millis: defaults::wait_after_last_request_millis(),
        }
    }
}

impl From<&TriggerConfig> for TriggerSpec {
    fn from(config: &TriggerConfig) -> Self {
        match config {
            TriggerConfig::Requests {
                wait_after_last_request_millis,
            } => TriggerSpec::Requests {
                wait_after_last_request_ms: *wait_after_last_request_millis,
            },
            TriggerConfig::Event { target, event_name } => TriggerSpec::Event {
                target: target.clone(),
                event_name: event_name.clone(),
            },
            TriggerConfig::Variable { var_name } => TriggerSpec::Variable {
                var_name: var_name.clone(),
            },
        }
    }
}

pub(crate) mod defaults {
    pub fn debug_port_base() -> u16 {
        9222
    }
    pub fn auto_recycle() -> bool {
        true
    }
    pub fn auto_recycle_after_uptime_millis() -> u64 {
        3_600_000
    }
    // Deliberately much shorter than the uptime budget.
    pub fn auto_recycle_retry_after_millis() -> u64 {
        60_000
    }
    pub fn recycle_drain_millis() -> u64 {
        10_000
    }
    pub fn wait_after_last_request_millis() -> u64 {
        500
    }
    pub fn event_target() -> String {
        "window".to_string()
    }
    pub fn event_name() -> String {
        "prerender_done".to_string()
    }
}
