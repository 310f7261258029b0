use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::errinput;

/// Region server configuration.
///
/// Built from defaults, optionally overlaid with a `key=value` properties
/// file, and finally with the override map the master hands back during the
/// startup handshake. After `init` the value is treated as read-only.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for all table, region and log data (`hbase.rootdir`).
    pub root_dir: PathBuf,

    /// Address the region service binds to.
    pub bind_address: String,

    /// Store size that triggers a split (`hbase.hregion.max.filesize`,
    /// default 256 MiB).
    pub max_filesize: u64,

    /// Memcache size that triggers a flush.
    pub flush_threshold: usize,

    /// Maximum time between flushes of a region with buffered edits.
    pub flush_interval: Duration,

    /// Store file count that triggers a compaction.
    pub compaction_threshold: usize,

    /// Heartbeat period (`hbase.regionserver.msginterval`).
    pub msg_interval: Duration,

    /// How long the server may go without a successful report before it
    /// aborts (`hbase.master.lease.period`).
    pub master_lease_period: Duration,

    /// Scanner lease TTL (`hbase.regionserver.lease.period`).
    pub lease_period: Duration,

    /// WAL entry count that triggers a roll (`hbase.regionserver.maxlogentries`).
    pub max_log_entries: u64,

    /// Retries for master instructions and reports (`hbase.client.retries.number`).
    pub num_retries: u32,

    /// RPC handler pool size (`hbase.regionserver.handler.count`).
    pub handler_count: usize,

    /// Wake period shared by the flush chore, log roller and lease checker.
    pub wake_frequency: Duration,

    /// Period of the split-or-compact checker.
    pub split_check_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./cinderdb"),
            bind_address: "127.0.0.1:60020".to_string(),
            max_filesize: 256 * 1024 * 1024,
            flush_threshold: 16 * 1024 * 1024,
            flush_interval: Duration::from_secs(600),
            compaction_threshold: 3,
            msg_interval: Duration::from_secs(3),
            master_lease_period: Duration::from_secs(30),
            lease_period: Duration::from_secs(180),
            max_log_entries: 30_000,
            num_retries: 2,
            handler_count: 10,
            wake_frequency: Duration::from_secs(10),
            split_check_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Create a new config rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    /// Load a `key=value` properties file. Blank lines and lines starting
    /// with `#` are skipped; unrecognized keys are ignored with a warning so
    /// site files can be shared across services.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        let contents = std::fs::read_to_string(path.as_ref())?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return errinput!("malformed config line: {line}");
            };
            config.set(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    /// Apply the master-provided override map. Called exactly once, from
    /// server init, before any component captures the config.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, String>) -> Result<()> {
        for (key, value) in overrides {
            tracing::debug!(key, value, "config override from master");
            self.set(key, value)?;
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "hbase.rootdir" => self.root_dir = PathBuf::from(value),
            "hbase.regionserver.address" => self.bind_address = value.to_string(),
            "hbase.hregion.max.filesize" => self.max_filesize = parse(key, value)?,
            "hbase.hregion.memcache.flush.size" => self.flush_threshold = parse(key, value)?,
            "hbase.hregion.memcache.flush.interval" => {
                self.flush_interval = Duration::from_millis(parse(key, value)?)
            }
            "hbase.hstore.compaction.threshold" => self.compaction_threshold = parse(key, value)?,
            "hbase.regionserver.msginterval" => {
                self.msg_interval = Duration::from_millis(parse(key, value)?)
            }
            "hbase.master.lease.period" => {
                self.master_lease_period = Duration::from_millis(parse(key, value)?)
            }
            "hbase.regionserver.lease.period" => {
                self.lease_period = Duration::from_millis(parse(key, value)?)
            }
            "hbase.regionserver.maxlogentries" => self.max_log_entries = parse(key, value)?,
            "hbase.client.retries.number" => self.num_retries = parse(key, value)?,
            "hbase.regionserver.handler.count" => self.handler_count = parse(key, value)?,
            "hbase.server.thread.wakefrequency" => {
                self.wake_frequency = Duration::from_millis(parse(key, value)?)
            }
            "hbase.regionserver.splitcheckfrequency" => {
                self.split_check_interval = Duration::from_millis(parse(key, value)?)
            }
            other => {
                tracing::warn!(key = other, "ignoring unrecognized config key");
            }
        }
        Ok(())
    }

    // Builder-style setters, mostly for tests.

    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = dir.into();
        self
    }

    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn max_filesize(mut self, bytes: u64) -> Self {
        self.max_filesize = bytes;
        self
    }

    pub fn flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes;
        self
    }

    pub fn compaction_threshold(mut self, files: usize) -> Self {
        self.compaction_threshold = files;
        self
    }

    pub fn msg_interval(mut self, interval: Duration) -> Self {
        self.msg_interval = interval;
        self
    }

    pub fn lease_period(mut self, period: Duration) -> Self {
        self.lease_period = period;
        self
    }

    pub fn max_log_entries(mut self, entries: u64) -> Self {
        self.max_log_entries = entries;
        self
    }

    pub fn wake_frequency(mut self, period: Duration) -> Self {
        self.wake_frequency = period;
        self
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| crate::error::Error::InvalidInput(format!("bad value for {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_filesize, 256 * 1024 * 1024);
        assert_eq!(config.compaction_threshold, 3);
        assert_eq!(config.msg_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("site.properties");
        std::fs::write(
            &path,
            "# site overrides\n\
             hbase.rootdir=/data/cinder\n\
             hbase.hregion.max.filesize=1048576\n\
             hbase.regionserver.msginterval=1000\n\
             some.unknown.key=whatever\n",
        )
        .expect("write config");

        let config = Config::from_file(&path).expect("load config");
        assert_eq!(config.root_dir, PathBuf::from("/data/cinder"));
        assert_eq!(config.max_filesize, 1048576);
        assert_eq!(config.msg_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_master_overrides() {
        let mut config = Config::default();
        let mut overrides = HashMap::new();
        overrides.insert("hbase.regionserver.maxlogentries".to_string(), "5".to_string());
        config.apply_overrides(&overrides).expect("apply");
        assert_eq!(config.max_log_entries, 5);
    }

    #[test]
    fn test_bad_value_rejected() {
        let mut config = Config::default();
        let mut overrides = HashMap::new();
        overrides.insert(
            "hbase.hregion.max.filesize".to_string(),
            "not-a-number".to_string(),
        );
        assert!(config.apply_overrides(&overrides).is_err());
    }
}
