//! Runtime configuration
//!
//! Layered as defaults, then an optional TOML file, then `COMPLIANCE__*`
//! environment variables.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{ComplianceError, ComplianceResult};

const DEFAULT_CONFIG_FILE: &str = "compliance.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub store_timeout_ms: u64,
    pub server_host: String,
    pub server_port: u16,
    /// YAML snapshot backing the clinical-store interface when no live store is wired in.
    pub clinical_snapshot_path: Option<String>,
    pub health: HealthPolicy,
}

/// Policy constants for the compliance health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    pub interval_secs: u64,
    /// Open isolation alerts older than this escalate from warning to failed.
    pub alert_failed_after_hours: i64,
    pub consent_low_water: f64,
    pub consent_target: f64,
    pub sensitive_resource_types: Vec<String>,
    /// Resource type -> fields that must be encrypted at rest.
    pub sensitive_fields: BTreeMap<String, Vec<String>>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://compliance.db".to_string(),
            database_max_connections: 4,
            store_timeout_ms: 5_000,
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            clinical_snapshot_path: None,
            health: HealthPolicy::default(),
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        let mut sensitive_fields = BTreeMap::new();
        sensitive_fields.insert(
            "patient".to_string(),
            vec!["social_security_number".to_string(), "date_of_birth".to_string()],
        );
        sensitive_fields.insert("consultation".to_string(), vec!["notes".to_string()]);

        Self {
            interval_secs: 3_600,
            alert_failed_after_hours: 24,
            consent_low_water: 0.80,
            consent_target: 0.95,
            sensitive_resource_types: vec![
                "patient".to_string(),
                "consultation".to_string(),
                "document".to_string(),
            ],
            sensitive_fields,
        }
    }
}

impl ComplianceConfig {
    /// Load from `COMPLIANCE_CONFIG` (or `compliance.toml`) and the environment.
    pub fn load() -> ComplianceResult<Self> {
        let path = std::env::var("COMPLIANCE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> ComplianceResult<Self> {
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix("COMPLIANCE").separator("__"))
            .build()
            .map_err(|e| ComplianceError::ConfigError(format!("Failed to read configuration: {}", e)))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ComplianceError::ConfigError(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;

        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> ComplianceResult<Self> {
        let config: Self = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ComplianceError::ConfigError(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ComplianceResult<()> {
        if self.store_timeout_ms == 0 {
            return Err(ComplianceError::ConfigError(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.database_max_connections == 0 {
            return Err(ComplianceError::ConfigError(
                "database_max_connections must be greater than zero".to_string(),
            ));
        }
        self.health.validate()
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl HealthPolicy {
    pub fn validate(&self) -> ComplianceResult<()> {
        for (name, ratio) in [
            ("consent_low_water", self.consent_low_water),
            ("consent_target", self.consent_target),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ComplianceError::ConfigError(format!(
                    "{} must be within [0, 1], got {}",
                    name, ratio
                )));
            }
        }
        if self.consent_low_water > self.consent_target {
            return Err(ComplianceError::ConfigError(format!(
                "consent_low_water ({}) exceeds consent_target ({})",
                self.consent_low_water, self.consent_target
            )));
        }
        if self.alert_failed_after_hours < 0 {
            return Err(ComplianceError::ConfigError(
                "alert_failed_after_hours cannot be negative".to_string(),
            ));
        }
        if self.interval_secs == 0 {
            return Err(ComplianceError::ConfigError(
                "health.interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn alert_failed_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.alert_failed_after_hours)
    }

    pub fn is_sensitive(&self, resource_type: &str) -> bool {
        self.sensitive_resource_types.iter().any(|t| t == resource_type)
    }
}
