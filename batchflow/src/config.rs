use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}={value}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Commands issued for the three pipeline steps
#[derive(Debug, Clone, PartialEq)]
pub struct StepPlan {
    /// Server that extracts the DAT file
    pub extract_server: String,
    /// Extraction script; customer numbers are appended comma-joined
    pub extract_script: String,
    /// Transfer profile name understood by the server's SCP task
    pub transfer_name: String,
    /// Server that loads the DAT file
    pub load_server: String,
    pub load_script: String,
    /// Output throttle forwarded with every ssh command
    pub throttle_interval: f64,
}

impl Default for StepPlan {
    fn default() -> Self {
        Self {
            extract_server: "mdwap1p".to_string(),
            extract_script: "/opt/scripts/vmyp_postgresql_dat_ddts.sh".to_string(),
            transfer_name: "stub_data_transfer".to_string(),
            load_server: "mypap1d".to_string(),
            load_script: "/opt/scripts/bmyp_postgresql_dat_odst.sh".to_string(),
            throttle_interval: 0.1,
        }
    }
}

/// Reconnection policy of a [`crate::connection::ConnectionManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the pipeline workflow
    pub ws_url: String,
    /// WebSocket endpoint of the task (fan-out) workflow
    pub task_ws_url: String,
    /// Base URL of the load-history REST API
    pub api_base_url: String,
    pub reconnect: ReconnectPolicy,
    /// Converts a step stuck in `running` into `error`; disabled when unset
    pub step_timeout: Option<Duration>,
    /// Maximum retained output log lines
    pub output_log_capacity: usize,
    pub http_timeout: Duration,
    pub steps: StepPlan,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8000/ws/stub".to_string(),
            task_ws_url: "ws://127.0.0.1:8000/ws/deud".to_string(),
            api_base_url: "http://localhost:8000".to_string(),
            reconnect: ReconnectPolicy::default(),
            step_timeout: None,
            output_log_capacity: 2000,
            http_timeout: Duration::from_secs(30),
            steps: StepPlan::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let env = Env { lookup: &lookup };

        let step_timeout = match env.parse::<u64>("BATCHFLOW_STEP_TIMEOUT_SECS")? {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        let output_log_capacity = env
            .parse::<usize>("BATCHFLOW_OUTPUT_LOG_CAPACITY")?
            .unwrap_or(defaults.output_log_capacity);
        if output_log_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "BATCHFLOW_OUTPUT_LOG_CAPACITY".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            ws_url: env.string("BATCHFLOW_WS_URL", &defaults.ws_url),
            task_ws_url: env.string("BATCHFLOW_TASK_WS_URL", &defaults.task_ws_url),
            api_base_url: env.string("BATCHFLOW_API_BASE_URL", &defaults.api_base_url),
            reconnect: ReconnectPolicy {
                max_attempts: env
                    .parse("BATCHFLOW_RECONNECT_MAX_ATTEMPTS")?
                    .unwrap_or(defaults.reconnect.max_attempts),
                delay: env
                    .parse::<u64>("BATCHFLOW_RECONNECT_DELAY_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect.delay),
            },
            step_timeout,
            output_log_capacity,
            http_timeout: env
                .parse::<u64>("BATCHFLOW_HTTP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            steps: StepPlan {
                extract_server: env
                    .string("BATCHFLOW_EXTRACT_SERVER", &defaults.steps.extract_server),
                extract_script: env
                    .string("BATCHFLOW_EXTRACT_SCRIPT", &defaults.steps.extract_script),
                transfer_name: env.string("BATCHFLOW_TRANSFER_NAME", &defaults.steps.transfer_name),
                load_server: env.string("BATCHFLOW_LOAD_SERVER", &defaults.steps.load_server),
                load_script: env.string("BATCHFLOW_LOAD_SCRIPT", &defaults.steps.load_script),
                throttle_interval: env
                    .parse("BATCHFLOW_THROTTLE_INTERVAL")?
                    .unwrap_or(defaults.steps.throttle_interval),
            },
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, default: &str) -> String {
        (self.lookup)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(val) => val
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    key: key.to_string(),
                    value: val.clone(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}
