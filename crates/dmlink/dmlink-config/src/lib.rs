//! Monitor configuration file.
//!
//! Everything the CLI can say can also live in a TOML file, so a bench
//! setup is one `--config bench.toml` instead of nine flags. CLI flags
//! override file values; the file overrides the defaults below.

use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug, Clone)]
pub struct MonitorConfig {
    /// Debug server host.
    #[serde(default = "defaults::host")]
    pub host: String,
    /// Debug server port.
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Absolute address of the shared region on the target.
    #[serde(default)]
    pub addr: u64,
    /// Polling interval between monitor ticks, in milliseconds.
    #[serde(default = "defaults::interval_ms")]
    pub interval_ms: u64,
    /// Hold the region lock across each tick.
    #[serde(default)]
    pub blocking: bool,
    /// Read the whole region once per tick instead of per-step reads.
    #[serde(default)]
    pub snapshot: bool,
    /// Prefix drained lines with a wall-clock timestamp.
    #[serde(default)]
    pub time: bool,
    /// Use the remote-serial-protocol backend instead of the telnet
    /// console.
    #[serde(default)]
    pub gdb: bool,
    /// Log verbosity: error, warn, info or verbose.
    #[serde(default = "defaults::trace_level")]
    pub trace_level: String,
    /// Lines fed to successive firmware input requests before stdin
    /// takes over.
    #[serde(default)]
    pub init_script: Option<String>,
    /// File whose raw bytes are queued as firmware input at startup.
    #[serde(default)]
    pub input_file: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn host() -> String {
        "localhost".into()
    }

    pub fn port() -> u16 {
        4444
    }

    pub fn interval_ms() -> u64 {
        100
    }

    pub fn trace_level() -> String {
        "info".into()
    }
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: MonitorConfig = toml::from_str(&text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let c = MonitorConfig::default();
        assert_eq!(c.host, "localhost");
        assert_eq!(c.port, 4444);
        assert_eq!(c.interval_ms, 100);
        assert_eq!(c.trace_level, "info");
        assert!(!c.blocking && !c.snapshot && !c.time && !c.gdb);
        assert!(c.init_script.is_none());
    }

    #[test]
    fn fields_parse_from_toml() {
        let c: MonitorConfig = toml::from_str(
            r#"
            host = "bench-rig"
            port = 3333
            addr = 0x20000000
            interval_ms = 25
            blocking = true
            time = true
            gdb = true
            trace_level = "verbose"
            init_script = "boot.cmds"
            "#,
        )
        .unwrap();
        assert_eq!(c.host, "bench-rig");
        assert_eq!(c.port, 3333);
        assert_eq!(c.addr, 0x2000_0000);
        assert_eq!(c.interval_ms, 25);
        assert!(c.blocking && c.time && c.gdb);
        assert_eq!(c.init_script.as_deref(), Some("boot.cmds"));
    }
}
