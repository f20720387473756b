//! Prescaler configuration

use anyhow::Result;
use prescaler_lib::fleet::{ProvisionerConfig, DEFAULT_GKE_ENDPOINT};
use prescaler_lib::planner::{PlannerConfig, DEFAULT_SAFETY_MARGIN};
use prescaler_lib::SchedulerConfig;
use serde::Deserialize;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "PRESCALER_CONFIG";

/// Prescaler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PrescalerConfig {
    /// Name reported in structured logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,

    /// How long after its end a prescaled event is still watched
    #[serde(default = "default_watch_grace")]
    pub watch_grace_secs: u64,

    /// How far ahead of its start a pending event is executed
    #[serde(default = "default_execute_lead")]
    pub execute_lead_secs: u64,

    #[serde(default = "default_safety_margin")]
    pub safety_margin_nodes: i32,

    #[serde(default = "default_provision_poll_interval")]
    pub provision_poll_interval_ms: u64,

    /// Upper bound for one node pool ceiling raise, 0 waits indefinitely
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,

    #[serde(default = "default_cache_ttl")]
    pub autoscaler_cache_ttl_secs: u64,

    /// Unset for no bound
    #[serde(default)]
    pub max_concurrent_events: Option<usize>,

    #[serde(default = "default_gke_endpoint")]
    pub gke_endpoint: String,

    /// Field manager recorded on autoscaler writes
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "event-prescaler".to_string())
}

fn default_database_url() -> String {
    "postgres://localhost:5432/event_prescaler".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_api_port() -> u16 {
    8080
}

fn default_tick_interval() -> u64 {
    60
}

fn default_watch_interval() -> u64 {
    30
}

fn default_watch_grace() -> u64 {
    300
}

fn default_execute_lead() -> u64 {
    60
}

fn default_safety_margin() -> i32 {
    DEFAULT_SAFETY_MARGIN
}

fn default_provision_poll_interval() -> u64 {
    100
}

fn default_provision_timeout() -> u64 {
    900
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_gke_endpoint() -> String {
    DEFAULT_GKE_ENDPOINT.to_string()
}

fn default_field_manager() -> String {
    "event-prescaler".to_string()
}

impl PrescalerConfig {
    /// Load configuration from the optional config file and `PRESCALER_*`
    /// environment variables, the latter taking precedence
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("PRESCALER").try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs.max(1)),
            execute_lead: Duration::from_secs(self.execute_lead_secs),
            watch_grace: Duration::from_secs(self.watch_grace_secs),
            max_concurrent_events: self.max_concurrent_events,
        }
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            safety_margin: self.safety_margin_nodes,
        }
    }

    pub fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            poll_interval: Duration::from_millis(self.provision_poll_interval_ms.max(1)),
            timeout: match self.provision_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }

    pub fn autoscaler_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.autoscaler_cache_ttl_secs)
    }
}
