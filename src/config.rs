//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// How to launch one classifier process.
#[derive(Debug, Clone)]
pub struct ClassifierCommand {
    /// Executable to run.
    pub program: String,
    /// Arguments passed before the worker flag.
    pub args: Vec<String>,
    /// Flag that puts the classifier into persistent worker mode.
    pub worker_flag: Option<String>,
    /// Extra environment, applied after the built-in worker environment.
    pub env: Vec<(String, String)>,
    /// Working directory for the process (inherits ours if None).
    pub current_dir: Option<PathBuf>,
    /// Run the process as this user (unix only).
    pub uid: Option<u32>,
    /// Run the process as this group (unix only).
    pub gid: Option<u32>,
}

impl ClassifierCommand {
    /// Create a command for the given program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            worker_flag: None,
            env: Vec::new(),
            current_dir: None,
            uid: None,
            gid: None,
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the worker-mode flag.
    pub fn with_worker_flag(mut self, flag: impl Into<String>) -> Self {
        self.worker_flag = Some(flag.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Render the full command line for logging.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.extend(self.worker_flag.iter().cloned());
        parts.join(" ")
    }
}

impl Default for ClassifierCommand {
    fn default() -> Self {
        Self::new("python3")
            .arg("ml/ml_classifier_bridge.py")
            .with_worker_flag("--worker-mode")
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time since the last failure before a submission may probe again.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Classifier process to launch for every worker.
    pub command: ClassifierCommand,
    /// Number of workers started at initialization.
    pub pool_size: usize,
    /// Maximum number of queued (unassigned) tasks.
    pub max_queue: usize,
    /// Per-task deadline, armed when the task is assigned to a worker.
    pub task_timeout: Duration,
    /// Deadline for a new worker to print READY.
    pub startup_timeout: Duration,
    /// Pause between sequential worker starts.
    pub startup_delay: Duration,
    /// Completed tasks after which a worker is recycled (0 disables).
    pub restart_threshold: u64,
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Matching loop tick.
    pub match_interval: Duration,
    /// How long a worker gets to exit after stdin closes before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            command: ClassifierCommand::default(),
            pool_size: 2,
            max_queue: 1000,
            task_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(30),
            startup_delay: Duration::from_secs(2),
            restart_threshold: 500,
            breaker: BreakerConfig::default(),
            match_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Build a configuration from `CLASSIFIER_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let program = std::env::var("CLASSIFIER_COMMAND").unwrap_or(defaults.command.program);
        let args: Vec<String> = match std::env::var("CLASSIFIER_ARGS") {
            Ok(raw) => raw.split_whitespace().map(String::from).collect(),
            Err(_) => defaults.command.args,
        };
        let worker_flag = match std::env::var("CLASSIFIER_WORKER_FLAG") {
            Ok(flag) if flag.trim().is_empty() => None,
            Ok(flag) => Some(flag),
            Err(_) => defaults.command.worker_flag,
        };

        let command = ClassifierCommand {
            program,
            args,
            worker_flag,
            env: Vec::new(),
            current_dir: std::env::var("CLASSIFIER_WORKDIR").ok().map(PathBuf::from),
            uid: parse_optional("CLASSIFIER_UID", std::env::var("CLASSIFIER_UID").ok())?,
            gid: parse_optional("CLASSIFIER_GID", std::env::var("CLASSIFIER_GID").ok())?,
        };

        Ok(Self {
            command,
            pool_size: env_or("CLASSIFIER_POOL_SIZE", defaults.pool_size)?,
            max_queue: env_or("CLASSIFIER_MAX_QUEUE", defaults.max_queue)?,
            task_timeout: Duration::from_secs(env_or(
                "CLASSIFIER_TASK_TIMEOUT_SECS",
                defaults.task_timeout.as_secs(),
            )?),
            startup_timeout: Duration::from_secs(env_or(
                "CLASSIFIER_STARTUP_TIMEOUT_SECS",
                defaults.startup_timeout.as_secs(),
            )?),
            startup_delay: Duration::from_millis(env_or(
                "CLASSIFIER_STARTUP_DELAY_MS",
                defaults.startup_delay.as_millis() as u64,
            )?),
            restart_threshold: env_or("CLASSIFIER_RESTART_THRESHOLD", defaults.restart_threshold)?,
            breaker: BreakerConfig {
                failure_threshold: env_or(
                    "CLASSIFIER_BREAKER_THRESHOLD",
                    defaults.breaker.failure_threshold,
                )?,
                cooldown: Duration::from_secs(env_or(
                    "CLASSIFIER_BREAKER_COOLDOWN_SECS",
                    defaults.breaker.cooldown.as_secs(),
                )?),
            },
            match_interval: Duration::from_millis(env_or(
                "CLASSIFIER_MATCH_INTERVAL_MS",
                defaults.match_interval.as_millis() as u64,
            )?),
            shutdown_grace: Duration::from_millis(env_or(
                "CLASSIFIER_SHUTDOWN_GRACE_MS",
                defaults.shutdown_grace.as_millis() as u64,
            )?),
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(key, std::env::var(key).ok())?.unwrap_or(default))
}

fn parse_optional<T>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
