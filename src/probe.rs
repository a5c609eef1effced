//! Liveness probes - TCP connect-and-close reachability checks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// A labelled host/port to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub label: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl ProbeTarget {
    pub fn local(label: &str, port: u16) -> Self {
        Self {
            label: label.to_string(),
            host: default_host(),
            port,
        }
    }
}

/// Reachability of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Up,
    Down,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}

impl From<bool> for PortStatus {
    fn from(open: bool) -> Self {
        if open {
            Self::Up
        } else {
            Self::Down
        }
    }
}

/// Result of probing one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    #[serde(flatten)]
    pub target: ProbeTarget,
    pub status: PortStatus,
}

/// Whether something accepts TCP connections on `host:port`
pub fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            log::debug!("Cannot resolve {}:{}: {}", host, port, e);
            return false;
        }
    };

    // Stream is dropped (closed) immediately
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}

/// Probe every target in order
pub fn probe_all(targets: &[ProbeTarget], timeout: Duration) -> Vec<ProbeResult> {
    targets
        .iter()
        .map(|target| ProbeResult {
            target: target.clone(),
            status: port_open(&target.host, target.port, timeout).into(),
        })
        .collect()
}
