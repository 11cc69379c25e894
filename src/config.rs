//! Configuration file format: a two-section YAML document (`config`,
//! `debug`), loaded once at startup and re-read by the housekeeping loop
//! every reload tick.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

fn default_true() -> bool {
    true
}

fn default_cacheexpire() -> u64 {
    300
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_overlay_prefix() -> String {
    String::new()
}

/// The `config` section of the document — everything but verbosity knobs.
/// Per §4.5, only `DebugFlags` is hot-reloadable; every field here requires
/// a restart to take effect, so the housekeeping loop only ever diffs
/// `DebugFlags` between reloads.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    #[serde(default)]
    pub ssl: bool,
    pub upstream_ldap: SocketAddr,
    #[serde(default)]
    pub upstream_ssl: bool,

    /// TLS certificate chain for the listen side. Required iff `ssl`.
    #[serde(default)]
    pub tls_chain: Option<PathBuf>,
    /// TLS private key for the listen side. Required iff `ssl`.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    /// CA bundle used to validate the upstream's certificate. Required iff
    /// `upstream_ssl`.
    #[serde(default)]
    pub ldap_ca: Option<PathBuf>,

    /// Enable-list of statically registered in-filters, in apply order.
    #[serde(default)]
    pub infilter_dir: Vec<String>,
    /// Enable-list of statically registered out-filters, in apply order.
    #[serde(default)]
    pub outfilter_dir: Vec<String>,
    #[serde(default)]
    pub filtervalidate: bool,

    #[serde(default)]
    pub log_syslog: bool,
    #[serde(default = "default_true")]
    pub log_stderr: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub usecache: bool,
    #[serde(default = "default_cacheexpire")]
    pub cacheexpire: u64,

    /// Idle deadline for a single read on either side of a pair. Not in
    /// the original config surface; added per spec.md §5's explicit
    /// recommendation since the source proxy had no read deadlines at all.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default)]
    pub yaml_attributes: bool,
    #[serde(default)]
    pub yaml_dir: Option<PathBuf>,
    #[serde(default = "default_overlay_prefix")]
    pub overlay_prefix: String,
}

/// The `debug` section: per-subsystem verbosity booleans, each mapped to a
/// `tracing` target (`ldap_proxy::pkt`, `ldap_proxy::cache`, ...).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugFlags {
    #[serde(default)]
    pub info: bool,
    #[serde(default)]
    pub warn: bool,
    #[serde(default)]
    pub err: bool,
    #[serde(default)]
    pub pkt: bool,
    #[serde(default)]
    pub pktsecure: bool,
    #[serde(default)]
    pub net: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub cache2: bool,
    #[serde(default)]
    pub filter: bool,
}

impl DebugFlags {
    /// Builds an `EnvFilter` directive string reflecting which targets are
    /// currently enabled. Disabled subsystems are not silenced entirely --
    /// they stay at `warn` so operational problems are still visible.
    pub fn to_filter_directive(&self) -> String {
        let mut parts = vec!["ldap_proxy=warn".to_string()];
        let mut push = |target: &str, on: bool| {
            if on {
                parts.push(format!("ldap_proxy::{target}=trace"));
            }
        };
        push("pkt", self.pkt);
        push("pktsecure", self.pktsecure);
        push("net", self.net);
        push("cache", self.cache || self.cache2);
        push("filter", self.filter);
        if self.info {
            parts.push("ldap_proxy=info".to_string());
        }
        if self.err {
            parts.push("ldap_proxy=error".to_string());
        }
        parts.join(",")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub config: ProxyConfig,
    #[serde(default)]
    pub debug: DebugFlags,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("parsing {0}: {1}")]
    Parse(PathBuf, serde_yaml::Error),
}

impl ConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.yaml");
        std::fs::write(
            &path,
            r#"
config:
  listen: "127.0.0.1:1389"
  upstream_ldap: "127.0.0.1:389"
debug: {}
"#,
        )
        .unwrap();

        let cfg = ConfigFile::load(&path).unwrap();
        assert!(!cfg.config.ssl);
        assert_eq!(cfg.config.cacheexpire, 300);
        assert!(!cfg.debug.pkt);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = ConfigFile::load("/nonexistent/ldap-proxy.yaml");
        assert!(matches!(result, Err(ConfigError::Io(_, _))));
    }

    #[test]
    fn debug_filter_directive_reflects_enabled_targets() {
        let mut flags = DebugFlags::default();
        flags.cache = true;
        let directive = flags.to_filter_directive();
        assert!(directive.contains("ldap_proxy::cache=trace"));
        assert!(!directive.contains("ldap_proxy::pkt=trace"));
    }
}
