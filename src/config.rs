//! Configuration - defaults, optional `procdeck.yml`, environment overrides

use crate::error::ConfigError;
use crate::probe::{ProbeTarget, DEFAULT_PROBE_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the root when none is given explicitly
pub const CONFIG_FILE_NAME: &str = "procdeck.yml";

pub const ENV_ROOT: &str = "PROCDECK_ROOT";
pub const ENV_LOG_DIR: &str = "PROCDECK_LOG_DIR";

/// A preset long-running service, started as a named process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub command: String,
    /// Relative to the root when not absolute
    pub cwd: Option<PathBuf>,
    /// Ports the service listens on (probed by `status`)
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// On-disk shape of `procdeck.yml`; every field optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub root: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub console_log: Option<PathBuf>,
    pub registry: Option<PathBuf>,
    pub probe_timeout_ms: Option<u64>,
    pub probes: Option<Vec<ProbeTarget>>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

/// Fully resolved configuration, all paths absolute
#[derive(Debug, Clone)]
pub struct Config {
    /// Default working directory for started processes
    pub root: PathBuf,
    pub log_dir: PathBuf,
    pub console_log: PathBuf,
    pub registry: PathBuf,
    pub probe_timeout: Duration,
    pub probes: Vec<ProbeTarget>,
    pub services: BTreeMap<String, ServiceSpec>,
}

impl Config {
    /// Defaults for a given root
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let log_dir = root.join("logs");
        Self {
            console_log: log_dir.join("console.log"),
            registry: log_dir.join("process_registry.json"),
            log_dir,
            root,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probes: default_probes(),
            services: BTreeMap::new(),
        }
    }

    /// Resolve configuration.
    ///
    /// Precedence, lowest first: defaults, config file, environment, the
    /// explicit `root` argument.
    pub fn load(root: Option<&Path>, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let env_root = std::env::var_os(ENV_ROOT).map(PathBuf::from);

        // The root decides where procdeck.yml is looked up
        let lookup_root = root
            .map(Path::to_path_buf)
            .or_else(|| env_root.clone())
            .unwrap_or_else(|| cwd.clone());
        let lookup_root = absolutize(&cwd, &lookup_root);

        let file = match config_path {
            Some(path) => Some(ConfigFile::from_file(&absolutize(&cwd, path))?),
            None => {
                let default_path = lookup_root.join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Some(ConfigFile::from_file(&default_path)?)
                } else {
                    None
                }
            }
        };

        let mut config = match file {
            Some(file) => file.resolve(&lookup_root),
            None => Self::for_root(&lookup_root),
        };

        // A root given outside the file beats the file's own `root:`
        if root.is_some() || env_root.is_some() {
            config.root = lookup_root;
        }
        if let Some(log_dir) = std::env::var_os(ENV_LOG_DIR) {
            config.set_log_dir(absolutize(&config.root, Path::new(&log_dir)));
        }

        log::debug!("Resolved config: {:?}", config);
        Ok(config)
    }

    /// Move the log directory, keeping default file names inside it
    pub fn set_log_dir(&mut self, log_dir: PathBuf) {
        if self.console_log.parent() == Some(self.log_dir.as_path()) {
            self.console_log = log_dir.join(file_name_or(&self.console_log, "console.log"));
        }
        if self.registry.parent() == Some(self.log_dir.as_path()) {
            self.registry = log_dir.join(file_name_or(&self.registry, "process_registry.json"));
        }
        self.log_dir = log_dir;
    }

    /// Look up a service preset
    pub fn service(&self, name: &str) -> Result<&ServiceSpec, ConfigError> {
        self.services
            .get(name)
            .ok_or_else(|| ConfigError::UnknownService(name.to_string()))
    }

    /// Working directory for a service preset
    pub fn service_cwd(&self, spec: &ServiceSpec) -> PathBuf {
        spec.cwd
            .as_deref()
            .map(|cwd| absolutize(&self.root, cwd))
            .unwrap_or_else(|| self.root.clone())
    }

    /// Probe table plus every service port not already listed
    pub fn all_probes(&self) -> Vec<ProbeTarget> {
        let mut probes = self.probes.clone();
        for (name, spec) in &self.services {
            for &port in &spec.ports {
                if !probes.iter().any(|p| p.port == port) {
                    probes.push(ProbeTarget::local(name, port));
                }
            }
        }
        probes
    }
}

impl ConfigFile {
    /// Load a YAML config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply the file on top of defaults for `base`
    pub fn resolve(self, base: &Path) -> Config {
        let root = self
            .root
            .as_deref()
            .map(|root| absolutize(base, root))
            .unwrap_or_else(|| base.to_path_buf());

        let mut config = Config::for_root(&root);
        if let Some(log_dir) = self.log_dir {
            config.set_log_dir(absolutize(&root, &log_dir));
        }
        if let Some(console_log) = self.console_log {
            config.console_log = absolutize(&config.log_dir, &console_log);
        }
        if let Some(registry) = self.registry {
            config.registry = absolutize(&config.log_dir, &registry);
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(probes) = self.probes {
            config.probes = probes;
        }
        config.services = self.services;
        config
    }
}

/// Probe table of the stock dashboard layout
pub fn default_probes() -> Vec<ProbeTarget> {
    vec![
        ProbeTarget::local("dashboard", 8592),
        ProbeTarget::local("sportman-api", 8123),
        ProbeTarget::local("template-api", 8124),
        ProbeTarget::local("debugger", 3000),
        ProbeTarget::local("debugger-alt", 3001),
    ]
}

/// Expand `~` and resolve relative paths against `base`
pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    };

    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn file_name_or<'a>(path: &'a Path, fallback: &'a str) -> &'a std::ffi::OsStr {
    path.file_name().unwrap_or_else(|| std::ffi::OsStr::new(fallback))
}
