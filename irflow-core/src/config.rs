//! Configuration system for irflow.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from the user config directory (`config.toml`) and/or
//! `.irflow/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::recovery::{ErrorClassification, RecoveryStrategy};

/// Name of the workspace-local configuration directory.
pub const WORKSPACE_CONFIG_DIR: &str = ".irflow";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrflowConfig {
    pub approval: ApprovalConfig,
    pub recovery: RecoveryConfig,
}

/// Auto-approval settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Global switch. When off, nothing is auto-approved.
    pub auto_remediation_enabled: bool,
    /// Number of approval decisions retained for inspection.
    pub decision_history_capacity: usize,
    /// YAML rule file. The built-in rules are used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<PathBuf>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            auto_remediation_enabled: true,
            decision_history_capacity: 1000,
            rules_path: None,
        }
    }
}

/// Recovery manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Seconds an open circuit breaker waits before allowing a trial.
    pub circuit_cooldown_secs: u64,
    /// Attempts allowed for the plain retry strategy.
    pub retry_limit: u32,
    /// Attempts allowed when retrying with backoff.
    pub backoff_retry_limit: u32,
    /// Upper bound on a single backoff delay.
    pub backoff_cap_secs: u64,
    pub error_history_capacity: usize,
    /// Per-classification replacements for the default strategy table.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub strategy_overrides: HashMap<ErrorClassification, RecoveryStrategy>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            circuit_cooldown_secs: 300,
            retry_limit: 3,
            backoff_retry_limit: 5,
            backoff_cap_secs: 60,
            error_history_capacity: 1000,
            strategy_overrides: HashMap::new(),
        }
    }
}

impl IrflowConfig {
    /// Validate the configuration and return warnings for suspicious values.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.approval.decision_history_capacity == 0 {
            warnings.push(
                "approval.decision_history_capacity is 0: no decisions will be retained"
                    .to_string(),
            );
        }
        if let Some(path) = &self.approval.rules_path {
            if !path.exists() {
                warnings.push(format!(
                    "approval.rules_path '{}' does not exist",
                    path.display()
                ));
            }
        }

        let recovery = &self.recovery;
        if recovery.circuit_cooldown_secs == 0 {
            warnings.push(
                "recovery.circuit_cooldown_secs is 0: open breakers will never fail fast"
                    .to_string(),
            );
        }
        if recovery.error_history_capacity == 0 {
            warnings.push(
                "recovery.error_history_capacity is 0: no errors will be retained".to_string(),
            );
        }
        if recovery.retry_limit == 0 {
            warnings.push("recovery.retry_limit is 0: every retry trips the breaker".to_string());
        }
        if recovery.backoff_retry_limit < recovery.retry_limit {
            warnings.push(format!(
                "recovery.backoff_retry_limit ({}) is below retry_limit ({})",
                recovery.backoff_retry_limit, recovery.retry_limit
            ));
        }

        warnings
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "irflow", "irflow")
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(WORKSPACE_CONFIG_DIR).join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `IRFLOW_`)
/// 3. Workspace-local config (`.irflow/config.toml`)
/// 4. User config (`config.toml` in the platform config directory)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&IrflowConfig>,
) -> crate::Result<IrflowConfig> {
    let mut figment = Figment::from(Serialized::defaults(IrflowConfig::default()));

    // User-level config
    if let Some(dirs) = project_dirs() {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (IRFLOW_RECOVERY__RETRY_LIMIT, IRFLOW_APPROVAL__RULES_PATH, etc.)
    figment = figment.merge(Env::prefixed("IRFLOW_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config = figment.extract().map_err(|e| ConfigError::Load {
        message: e.to_string(),
    })?;
    Ok(config)
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if project_dirs().is_some_and(|d| d.config_dir().join("config.toml").exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
