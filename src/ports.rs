//! Backend port pool: parsing, rotation metadata, and next-port selection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tracing::debug;

/// How long a liveness probe waits before declaring a port free.
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

struct PortEntry {
    port: String,
    /// Unix seconds of the last launch on this port, 0 = never.
    last_started: AtomicI64,
}

/// The declared set of backend ports available for rotation.
///
/// Membership is fixed after parsing; only the per-port `last_started`
/// timestamps mutate, and only on the supervisor's control paths.
pub struct PortPool {
    entries: Vec<PortEntry>,
}

impl PortPool {
    /// Parse a pool spec: a comma-separated list where each item is either
    /// a single port or an inclusive `lo-hi` range. Tokens that fail to
    /// parse as numbers are silently omitted; duplicates collapse while
    /// preserving first-seen order.
    pub fn parse(spec: &str) -> Self {
        let mut entries: Vec<PortEntry> = Vec::new();
        let mut push = |port: String| {
            if !entries.iter().any(|e| e.port == port) {
                entries.push(PortEntry {
                    port,
                    last_started: AtomicI64::new(0),
                });
            }
        };
        for item in spec.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.split_once('-') {
                Some((lo, hi)) => {
                    let (Ok(lo), Ok(hi)) = (lo.trim().parse::<u32>(), hi.trim().parse::<u32>())
                    else {
                        continue;
                    };
                    for p in lo..=hi {
                        push(p.to_string());
                    }
                }
                None => {
                    if item.parse::<u32>().is_ok() {
                        push(item.to_string());
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first(&self) -> Option<&str> {
        self.entries.first().map(|e| e.port.as_str())
    }

    pub fn ports(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.port.as_str())
    }

    /// True when the pool can rotate: more than one port, and a port flag
    /// name the child accepts (otherwise the app cannot be told where to
    /// bind).
    pub fn supports_multi(&self, port_param_name: &str) -> bool {
        self.entries.len() > 1 && !port_param_name.is_empty()
    }

    pub fn mark_started(&self, port: &str, now_unix: i64) {
        if let Some(entry) = self.entries.iter().find(|e| e.port == port) {
            entry.last_started.store(now_unix, Ordering::SeqCst);
        }
    }

    pub fn clear_started(&self, port: &str) {
        if let Some(entry) = self.entries.iter().find(|e| e.port == port) {
            entry.last_started.store(0, Ordering::SeqCst);
        }
    }

    /// Select the next port: prefer, in order, a never-started port, a port
    /// with no live registered process, or a port whose TCP listener is
    /// free. When every port is busy, fall back to the one started longest
    /// ago (ties broken by pool order).
    pub fn pick(
        &self,
        is_running: impl Fn(&str) -> bool,
        is_free: impl Fn(&str) -> bool,
    ) -> Option<String> {
        let mut oldest: Option<(i64, &str)> = None;
        for entry in &self.entries {
            let last = entry.last_started.load(Ordering::SeqCst);
            if last == 0 || !is_running(&entry.port) || is_free(&entry.port) {
                return Some(entry.port.clone());
            }
            if oldest.map(|(t, _)| last < t).unwrap_or(true) {
                oldest = Some((last, &entry.port));
            }
        }
        oldest.map(|(_, port)| port.to_string())
    }
}

/// Probe-connect to a local port; free iff the connection is refused.
pub fn tcp_port_free(port: &str) -> bool {
    let Ok(addr) = format!("127.0.0.1:{port}").parse::<SocketAddr>() else {
        return true;
    };
    match std::net::TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
        Ok(_) => false,
        Err(e) => {
            debug!(port, error = %e, "port probe failed, treating as free");
            true
        }
    }
}
