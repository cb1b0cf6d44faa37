use crate::SmrError;
use crate::retry::{PollPolicy, RetryPolicy};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Complete, validated description of one job.
///
/// Loaded from a JSON file, then adjusted by command line overrides, then checked once
/// with [`JobConfig::validate`] before anything is provisioned.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    /// Input URIs (`file://dir`, `s3://bucket/prefix`) or literal item ids.
    pub input: Vec<String>,
    /// Remote worker processes started on every instance.
    pub workers_per_instance: usize,
    pub instances: usize,
    /// Command that starts one worker; it speaks the assignment/status protocol.
    pub map_command: String,
    /// Local command fed the merged result stream on stdin.
    pub reduce_command: String,
    /// Output path template; `{config_name}` and `{time}` are expanded.
    pub output: String,
    pub cluster: ClusterConfig,
    pub bootstrap: BootstrapConfig,
    pub retry: RetryPolicy,
    pub readiness: PollPolicy,
    pub timing: TimingConfig,
    pub logging: LoggingConfig,
    pub s3: S3Config,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            input: Vec::new(),
            workers_per_instance: 1,
            instances: 1,
            map_command: String::new(),
            reduce_command: String::new(),
            output: "results/{config_name}.{time}.out".to_string(),
            cluster: ClusterConfig::default(),
            bootstrap: BootstrapConfig::default(),
            retry: RetryPolicy::default(),
            readiness: PollPolicy::default(),
            timing: TimingConfig::default(),
            logging: LoggingConfig::default(),
            s3: S3Config::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClusterConfig {
    /// Workers run as local processes on this machine.
    #[default]
    Local,
    /// Workers run over ssh on pre-provisioned hosts.
    Hosts {
        hosts: Vec<String>,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        identity_file: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Commands run in order on every instance; the first failure aborts the job.
    pub commands: Vec<String>,
    pub uploads: Vec<UploadConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    pub local: PathBuf,
    pub remote: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Bounded wait of a pump on the task queue before re-checking for abort.
    pub take_timeout_ms: u64,
    /// Interval for polling a worker's exit status after end of input.
    pub exit_poll_ms: u64,
    /// Bounded wait of the collector on the result queue.
    pub collector_poll_ms: u64,
    /// How long sessions may finish their in-flight exchange after an abort before
    /// their transports are force-closed.
    pub abort_grace_ms: u64,
    pub progress_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            take_timeout_ms: 2000,
            exit_poll_ms: 1000,
            collector_poll_ms: 2000,
            abort_grace_ms: 5000,
            progress_interval_ms: 5000,
        }
    }
}

impl TimingConfig {
    pub fn take_timeout(&self) -> Duration {
        Duration::from_millis(self.take_timeout_ms)
    }

    pub fn exit_poll(&self) -> Duration {
        Duration::from_millis(self.exit_poll_ms)
    }

    pub fn collector_poll(&self) -> Duration {
        Duration::from_millis(self.collector_poll_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `smr=debug,warn`.
    pub level: String,
    pub format: LogFormat,
    /// Log to this file instead of stderr.
    pub file: Option<PathBuf>,
    /// OTLP/HTTP endpoint for span export (requires the `otel` feature).
    pub otlp_endpoint: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            otlp_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
        }
    }
}

impl S3Config {
    /// Fills unset values from `SMR_S3_REGION` / `SMR_S3_ENDPOINT`.
    pub fn apply_env(&mut self) {
        if let Ok(region) = std::env::var("SMR_S3_REGION") {
            if !region.is_empty() {
                self.region = region;
            }
        }
        if self.endpoint.is_none() {
            self.endpoint = std::env::var("SMR_S3_ENDPOINT").ok().filter(|e| !e.is_empty());
        }
    }
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self, SmrError> {
        let text = fs::read_to_string(path)
            .map_err(|e| SmrError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: JobConfig = serde_json::from_str(&text)
            .map_err(|e| SmrError::Config(format!("{}: {}", path.display(), e)))?;
        config.s3.apply_env();
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SmrError> {
        if self.workers_per_instance == 0 {
            return Err(SmrError::Config("workers_per_instance must be at least 1".into()));
        }
        if self.instances == 0 {
            return Err(SmrError::Config("instances must be at least 1".into()));
        }
        if self.map_command.trim().is_empty() {
            return Err(SmrError::Config("map_command is empty".into()));
        }
        if self.reduce_command.trim().is_empty() {
            return Err(SmrError::Config("reduce_command is empty".into()));
        }
        if self.output.trim().is_empty() {
            return Err(SmrError::Config("output is empty".into()));
        }
        if let ClusterConfig::Hosts { hosts, .. } = &self.cluster {
            if hosts.len() < self.instances {
                return Err(SmrError::Config(format!(
                    "{} instances requested but only {} hosts configured",
                    self.instances,
                    hosts.len()
                )));
            }
        }
        if self.retry.max_attempts == Some(0) {
            return Err(SmrError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.readiness.interval_ms == 0 {
            return Err(SmrError::Config("readiness.interval_ms must be positive".into()));
        }
        let timing = &self.timing;
        if timing.take_timeout_ms == 0
            || timing.exit_poll_ms == 0
            || timing.collector_poll_ms == 0
            || timing.progress_interval_ms == 0
        {
            return Err(SmrError::Config("timing intervals must be positive".into()));
        }
        for upload in &self.bootstrap.uploads {
            if upload.remote.trim().is_empty() {
                return Err(SmrError::Config(format!(
                    "upload of {} has no remote path",
                    upload.local.display()
                )));
            }
        }
        Ok(())
    }

    /// Expands the output template and creates its parent directory.
    pub fn resolve_output(&self, config_name: &str) -> Result<PathBuf, SmrError> {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = PathBuf::from(
            self.output
                .replace("{config_name}", config_name)
                .replace("{time}", &time.to_string()),
        );
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(path)
    }

    pub fn total_sessions(&self) -> usize {
        self.instances * self.workers_per_instance
    }
}

/// Name used in output templates: the config file's stem.
pub fn config_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "job".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;

    fn minimal() -> JobConfig {
        JobConfig {
            map_command: "smr-map --command ./map.sh".into(),
            reduce_command: "sort".into(),
            ..JobConfig::default()
        }
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "input": ["file:///data", "s3://bucket/logs/"],
            "workers_per_instance": 4,
            "instances": 2,
            "map_command": "smr-map --command ./count.sh",
            "reduce_command": "python reduce.py",
            "output": "out/{config_name}.txt",
            "cluster": {"mode": "hosts", "hosts": ["10.0.0.1", "10.0.0.2"], "user": "ubuntu"},
            "bootstrap": {
                "commands": ["sudo apt-get install -y jq"],
                "uploads": [{"local": "job.json", "remote": "/tmp/job.json"}]
            },
            "retry": {"max_attempts": 3, "backoff": {"kind": "exponential", "initial_ms": 100, "max_ms": 800}},
            "readiness": {"interval_ms": 500, "deadline_secs": 600},
            "timing": {"take_timeout_ms": 250},
            "logging": {"level": "debug", "format": "json"}
        }"#;
        let config: JobConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.total_sessions(), 8);
        assert_eq!(
            config.cluster,
            ClusterConfig::Hosts {
                hosts: vec!["10.0.0.1".into(), "10.0.0.2".into()],
                user: Some("ubuntu".into()),
                identity_file: None,
            }
        );
        assert_eq!(config.retry.backoff, Backoff::Exponential { initial_ms: 100, max_ms: 800 });
        assert_eq!(config.timing.take_timeout(), Duration::from_millis(250));
        assert_eq!(config.timing.exit_poll_ms, 1000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.readiness.deadline_secs, Some(600));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = serde_json::from_str::<JobConfig>(r#"{"workers": 3}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = minimal();
        config.validate().unwrap();

        config.workers_per_instance = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.map_command = "  ".into();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.instances = 3;
        config.cluster = ClusterConfig::Hosts {
            hosts: vec!["a".into()],
            user: None,
            identity_file: None,
        };
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.retry.max_attempts = Some(0);
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.timing.take_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_output_expands_template() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = minimal();
        config.output = format!("{}/nested/{{config_name}}.out", dir.path().display());
        let path = config.resolve_output("wordcount").unwrap();
        assert!(path.ends_with("nested/wordcount.out"));
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn test_config_name_is_file_stem() {
        assert_eq!(config_name(Path::new("/jobs/wordcount.json")), "wordcount");
    }
}
