//! Environment-driven pipeline configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use callpipe_core::Stage;

use crate::retry::RetryPolicy;
use crate::storage::LocalDirStorage;
use crate::worker::{PollSettings, WorkerSettings};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Knobs that differ per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub handler_timeout: Duration,
}

impl StageSettings {
    fn defaults_for(stage: Stage) -> Self {
        let handler_timeout = match stage {
            Stage::Stt => Duration::from_secs(600),
            Stage::Summary | Stage::Postprocess => Duration::from_secs(120),
        };
        Self {
            workers: 2,
            max_attempts: 3,
            handler_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Name attached to logs.
    pub service_name: String,
    /// Postgres job store; in-memory when unset.
    pub database_url: Option<String>,
    /// Redis broker; in-memory when unset.
    pub redis_url: Option<String>,
    /// Local audio directory; references are only checked for shape when unset.
    pub storage_dir: Option<PathBuf>,
    /// `host_prefix -> local_dir` rewrites for audio paths.
    pub audio_path_mappings: Vec<(String, PathBuf)>,
    pub poll: PollSettings,
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
    pub stages: BTreeMap<Stage, StageSettings>,
    pub job_list_limit: usize,
    pub reconcile_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            service_name: "callpipe".to_string(),
            database_url: None,
            redis_url: None,
            storage_dir: None,
            audio_path_mappings: Vec::new(),
            poll: PollSettings::default(),
            visibility_timeout: Duration::from_secs(900),
            retry: RetryPolicy::exponential(Duration::from_millis(500), Duration::from_secs(60)),
            stages: Stage::ALL
                .into_iter()
                .map(|s| (s, StageSettings::defaults_for(s)))
                .collect(),
            job_list_limit: 100,
            reconcile_grace: Duration::from_secs(600),
        }
    }
}

impl PipelineConfig {
    /// Load from the process environment, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let mut stages = BTreeMap::new();
        for stage in Stage::ALL {
            let base = defaults.stages[&stage];
            let upper = stage.as_str().to_ascii_uppercase();
            stages.insert(
                stage,
                StageSettings {
                    workers: env.parse(&format!("CALLPIPE_{upper}_WORKERS"), base.workers)?,
                    max_attempts: env.parse("CALLPIPE_MAX_ATTEMPTS", base.max_attempts)?,
                    handler_timeout: env
                        .millis(&format!("CALLPIPE_{upper}_TIMEOUT_MS"), base.handler_timeout)?,
                },
            );
        }

        let config = Self {
            service_name: env
                .string("CALLPIPE_SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            database_url: env.string("DATABASE_URL"),
            redis_url: env.string("REDIS_URL"),
            storage_dir: env.string("CALLPIPE_STORAGE_DIR").map(PathBuf::from),
            audio_path_mappings: match env.string("CALLPIPE_AUDIO_PATH_MAPPINGS") {
                Some(raw) => parse_mappings(&raw)?,
                None => Vec::new(),
            },
            poll: PollSettings {
                interval: env.millis("CALLPIPE_POLL_INTERVAL_MS", defaults.poll.interval)?,
                max_interval: env
                    .millis("CALLPIPE_MAX_POLL_INTERVAL_MS", defaults.poll.max_interval)?,
            },
            visibility_timeout: env
                .millis("CALLPIPE_VISIBILITY_TIMEOUT_MS", defaults.visibility_timeout)?,
            retry: RetryPolicy::exponential(
                env.millis("CALLPIPE_RETRY_BASE_MS", defaults.retry.base_delay)?,
                env.millis("CALLPIPE_RETRY_MAX_MS", defaults.retry.max_delay)?,
            ),
            stages,
            job_list_limit: env.parse("CALLPIPE_JOB_LIST_LIMIT", defaults.job_list_limit)?,
            reconcile_grace: env.millis("CALLPIPE_RECONCILE_GRACE_MS", defaults.reconcile_grace)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Validation("service name is empty".into()));
        }
        if self.poll.interval.is_zero() || self.poll.interval > self.poll.max_interval {
            return Err(ConfigError::Validation(format!(
                "poll interval {:?} must be non-zero and at most the max poll interval {:?}",
                self.poll.interval, self.poll.max_interval
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Validation(
                "retry base delay exceeds retry max delay".into(),
            ));
        }
        if self.job_list_limit == 0 {
            return Err(ConfigError::Validation("job list limit must be positive".into()));
        }
        for stage in Stage::ALL {
            let s = self.stage(stage);
            if s.workers == 0 {
                return Err(ConfigError::Validation(format!("{stage}: workers must be positive")));
            }
            if s.max_attempts == 0 {
                return Err(ConfigError::Validation(format!(
                    "{stage}: max attempts must be positive"
                )));
            }
            if s.handler_timeout.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "{stage}: handler timeout must be positive"
                )));
            }
            // A lease must outlive the handler or healthy work gets redelivered.
            if s.handler_timeout >= self.visibility_timeout {
                return Err(ConfigError::Validation(format!(
                    "{stage}: handler timeout {:?} must be shorter than the visibility timeout {:?}",
                    s.handler_timeout, self.visibility_timeout
                )));
            }
        }
        Ok(())
    }

    pub fn stage(&self, stage: Stage) -> StageSettings {
        self.stages
            .get(&stage)
            .copied()
            .unwrap_or_else(|| StageSettings::defaults_for(stage))
    }

    pub fn worker_settings(&self, stage: Stage) -> WorkerSettings {
        let s = self.stage(stage);
        WorkerSettings {
            max_attempts: s.max_attempts,
            handler_timeout: s.handler_timeout,
            visibility_timeout: self.visibility_timeout,
            retry: self.retry.clone(),
        }
    }

    /// Local storage for `storage_dir`, if one is configured.
    pub fn local_storage(&self) -> Option<LocalDirStorage> {
        let root = self.storage_dir.as_ref()?;
        Some(
            self.audio_path_mappings
                .iter()
                .fold(LocalDirStorage::new(root), |storage, (host, local)| {
                    storage.with_mapping(host.clone(), local.clone())
                }),
        )
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let ms = self.parse::<u64>(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }
}

/// `"/host/a=/mnt/a;/host/b=/mnt/b"`
fn parse_mappings(raw: &str) -> Result<Vec<(String, PathBuf)>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((host, local)) if !host.trim().is_empty() && !local.trim().is_empty() => {
                Ok((host.trim().to_string(), PathBuf::from(local.trim())))
            }
            _ => Err(ConfigError::Invalid {
                key: "CALLPIPE_AUDIO_PATH_MAPPINGS".to_string(),
                value: pair.to_string(),
                reason: "expected host_prefix=local_dir".to_string(),
            }),
        })
        .collect()
}
