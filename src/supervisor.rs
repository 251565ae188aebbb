//! Application lifecycle control: spawning, supervising, replacing, and
//! tearing down child processes bound to ports from the rotation pool.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{error, info, warn};

use crate::build::{now_unix, Builder};
use crate::flight::SingleFlight;
use crate::ports::{self, PortPool};

/// Sentinel substring the stderr capturer scans for.
const HTTP_PANIC_MESSAGE: &str = "http: panic serving";

/// Readiness dial attempts, one second apart.
const READY_ATTEMPTS: u32 = 60;

/// File-removal retry attempts after a failed delete.
const REMOVE_ATTEMPTS: u64 = 10;

/// A spawned child bound to a port, together with the binary it was
/// launched from. At most one handle is registered per port.
struct ChildHandle {
    child: Mutex<Child>,
    bin: PathBuf,
}

impl ChildHandle {
    fn is_running(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    fn has_exited(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(Some(_)))
    }

    fn kill(&self) {
        if let Err(e) = self.child.lock().start_kill() {
            error!(error = %e, "failed to kill child process");
        }
    }
}

pub struct SupervisorConfig {
    pub name: String,
    pub pool: PortPool,
    pub builder: Builder,
    pub run_params: Vec<String>,
    pub port_param_name: String,
    pub offline_mode: bool,
    /// Exec mode only: the validated base name of the prebuilt binary.
    pub initial_bin: String,
}

/// Serializes lifecycle transitions over the port pool, the process
/// registry, and the builder. The proxy observes it only through the
/// published flags and snapshots; the watcher drives it through an
/// injected callback.
pub struct Supervisor {
    name: String,
    pool: PortPool,
    builder: Builder,
    registry: DashMap<String, ChildHandle>,
    active_port: RwLock<String>,
    app_bin: RwLock<String>,
    run_params: Vec<String>,
    port_param_name: String,
    offline_mode: bool,
    switch_to_new_port: AtomicBool,
    last_error: Arc<RwLock<String>>,
    start_gate: SingleFlight,
    restart_gate: SingleFlight,
    triggers_armed: AtomicBool,
}

impl Supervisor {
    /// Returns `Arc<Self>` because the supervisor is shared across the
    /// proxy, the watcher callback, and its own background tasks.
    pub fn new(cfg: SupervisorConfig) -> Arc<Self> {
        let active = cfg.pool.pick(|_| false, |_| true).unwrap_or_default();
        Arc::new(Self {
            name: cfg.name,
            pool: cfg.pool,
            builder: cfg.builder,
            registry: DashMap::new(),
            active_port: RwLock::new(active),
            app_bin: RwLock::new(cfg.initial_bin),
            run_params: cfg.run_params,
            port_param_name: cfg.port_param_name,
            offline_mode: cfg.offline_mode,
            switch_to_new_port: AtomicBool::new(false),
            last_error: Arc::new(RwLock::new(String::new())),
            start_gate: SingleFlight::new(),
            restart_gate: SingleFlight::new(),
            triggers_armed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_port(&self) -> String {
        self.active_port.read().clone()
    }

    pub fn app_bin(&self) -> String {
        self.app_bin.read().clone()
    }

    pub fn set_app_bin(&self, bin: String) {
        *self.app_bin.write() = bin;
    }

    pub fn supports_multi(&self) -> bool {
        self.pool.supports_multi(&self.port_param_name)
    }

    /// Whether the child can be told which port to bind. Without this the
    /// supervisor falls back to one-shot replacement instead of rotation.
    fn port_visible(&self) -> bool {
        !self.active_port.read().is_empty() && !self.port_param_name.is_empty()
    }

    pub fn is_running(&self, port: &str) -> bool {
        self.registry
            .get(port)
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    pub fn is_running_active(&self) -> bool {
        let active = self.active_port();
        self.is_running(&active)
    }

    /// True when the active child was spawned and has since exited.
    pub fn is_quit_active(&self) -> bool {
        let active = self.active_port();
        self.registry
            .get(&active)
            .map(|h| h.has_exited())
            .unwrap_or(false)
    }

    /// Consume the cutover signal; at most one caller observes `true` per
    /// cutover.
    pub fn take_switch(&self) -> bool {
        self.switch_to_new_port.swap(false, Ordering::SeqCst)
    }

    pub fn last_error(&self) -> String {
        self.last_error.read().clone()
    }

    pub fn clear_last_error(&self) {
        self.last_error.write().clear();
    }

    /// Next backend port by rotation priority; the current active port is
    /// the fallback of last resort.
    pub fn pick_port(&self) -> String {
        self.pool
            .pick(|p| self.is_running(p), ports::tcp_port_free)
            .unwrap_or_else(|| self.active_port())
    }

    /// Single-flight start: optionally build, then launch on `port` (or
    /// the current active port). The gate resets whether the operation
    /// succeeded or failed.
    pub async fn start(self: &Arc<Self>, build: bool, port: Option<String>) -> anyhow::Result<()> {
        let this = Arc::clone(self);
        self.start_gate
            .run(async move {
                if build {
                    match this.builder.build(&this.name).await {
                        Ok(Some(bin)) => *this.app_bin.write() = bin,
                        Ok(None) => {}
                        Err(e) => {
                            error!(app = %this.name, "build failed");
                            return Err(e.context(format!("failed to build {}", this.name)));
                        }
                    }
                }
                let port = port.unwrap_or_else(|| this.active_port());
                this.run(&port)
                    .await
                    .map_err(|e| e.context(format!("failed to run {}", this.name)))?;
                this.arm_triggers();
                Ok(())
            })
            .await
    }

    /// Single-flight restart: clean draining generations, stop the active
    /// one, rebuild and relaunch. Re-entrant callers collapse onto the
    /// in-flight execution and observe its outcome.
    pub async fn restart(self: &Arc<Self>) -> anyhow::Result<()> {
        let this = Arc::clone(self);
        self.restart_gate
            .run(async move {
                warn!(app = %this.name, "restarting the application");
                this.clean().await;
                let active = this.active_port();
                this.stop(&active).await;
                this.start(true, None).await
            })
            .await
    }

    /// Build and launch a new generation on `port`; once it dials ready
    /// the proxy observes the switch signal and performs the swap.
    pub async fn cutover(self: &Arc<Self>, port: String) -> anyhow::Result<()> {
        self.start(true, Some(port)).await
    }

    /// Launch the current binary on `port` and wait for TCP readiness.
    ///
    /// When the child cannot be told its port, readiness probing is
    /// skipped and the previous generation on the port is retired inline.
    pub async fn run(self: &Arc<Self>, port: &str) -> anyhow::Result<()> {
        let bin_name = self.app_bin.read().clone();
        let bin = self.builder.bin_path(&bin_name);
        if !bin.exists() {
            bail!("binary {} does not exist", bin.display());
        }

        let port_visible = self.port_visible();
        let mut able_switch = true;
        if port_visible {
            info!(port, app = %self.name, "running");
            able_switch = self.active_port.read().as_str() != port;
            *self.active_port.write() = port.to_string();
        } else {
            info!(app = %self.name, "running");
        }

        self.pool.mark_started(port, now_unix());

        let mut args: Vec<String> = Vec::new();
        if port_visible && self.supports_multi() {
            args.push(self.port_param_name.clone());
            args.push(port.to_string());
        }
        args.extend(self.run_params.iter().cloned());

        let mut cmd = Command::new(&bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("failed to spawn {}: {e}", bin.display()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stderr(stderr, Arc::clone(&self.last_error)));
        }

        let prev = self.registry.insert(
            port.to_string(),
            ChildHandle {
                child: Mutex::new(child),
                bin: bin.clone(),
            },
        );

        if port_visible {
            self.dial(port, READY_ATTEMPTS).await?;
        }
        if able_switch {
            self.switch_to_new_port.store(true, Ordering::SeqCst);
            if self.offline_mode {
                self.clean().await;
            }
        }
        if !port_visible {
            if let Some(prev) = prev {
                if prev.is_running() {
                    info!(bin = %prev.bin.display(), "stopping previous app");
                    prev.kill();
                    if prev.bin != bin {
                        self.remove_binary(None, prev.bin.clone(), true);
                    }
                }
            }
        }
        Ok(())
    }

    /// Kill the child on `port` and remove its binary. Removal failures
    /// retry asynchronously; the registry entry survives until both the
    /// kill and the removal have completed.
    pub async fn stop(self: &Arc<Self>, port: &str) {
        if !self.is_running(port) {
            return;
        }
        info!(app = %self.name, "stopping");
        if let Some(handle) = self.registry.get(port) {
            handle.kill();
        }
        if self.active_port.read().as_str() == port && self.builder.disabled() {
            // Exec mode never deletes the binary it was pointed at.
            return;
        }
        let bin = self.builder.bin_path(&self.app_bin.read());
        self.remove_binary(Some(port.to_string()), bin, false);
    }

    /// Retire every draining generation: every registered port other than
    /// the active one that still has a live child.
    pub async fn clean(self: &Arc<Self>) {
        let active = self.active_port();
        let ports: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        for port in ports {
            if port == active || !self.is_running(&port) {
                continue;
            }
            info!(port = %port, "stopping app");
            let bin = self.registry.get(&port).map(|h| {
                h.kill();
                h.bin.clone()
            });
            if let Some(bin) = bin {
                self.remove_binary(Some(port), bin, true);
            }
        }
    }

    /// Remove a binary from disk, retrying in the background when the OS
    /// still holds the file. Clears the port's rotation metadata and its
    /// registry entry once the file is gone.
    fn remove_binary(self: &Arc<Self>, port: Option<String>, bin: PathBuf, backoff: bool) {
        match std::fs::remove_file(&bin) {
            Ok(()) => self.finish_removal(port.as_deref(), &bin),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.finish_removal(port.as_deref(), &bin)
            }
            Err(e) => {
                error!(bin = %bin.display(), error = %e, "failed to remove binary, retrying");
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    for i in 0..REMOVE_ATTEMPTS {
                        let secs = if backoff { i + 1 } else { 1 };
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                        match std::fs::remove_file(&bin) {
                            Ok(()) => {
                                info!(bin = %bin.display(), "binary removed");
                                this.finish_removal(port.as_deref(), &bin);
                                return;
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                                this.finish_removal(port.as_deref(), &bin);
                                return;
                            }
                            Err(e) => {
                                error!(bin = %bin.display(), error = %e, "failed to remove binary")
                            }
                        }
                    }
                });
            }
        }
    }

    fn finish_removal(&self, port: Option<&str>, bin: &Path) {
        if let Some(port) = port {
            self.pool.clear_started(port);
            // The port may have been reused by a newer generation while the
            // retries slept; only drop the entry we actually retired.
            self.registry.remove_if(port, |_, h| h.bin == bin);
        }
    }

    /// Dial the child until it accepts a connection, aborting early when
    /// the spawn has already failed hard.
    async fn dial(&self, port: &str, attempts: u32) -> anyhow::Result<()> {
        let addr = format!("127.0.0.1:{port}");
        for attempt in 0..attempts {
            if self
                .registry
                .get(port)
                .map(|h| h.has_exited())
                .unwrap_or(false)
            {
                bail!("application on port {port} exited during startup");
            }
            if tokio::net::TcpStream::connect(&addr).await.is_ok() {
                return Ok(());
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        bail!("timed out waiting for {addr} to accept connections")
    }

    /// Attach the stdin and interrupt listeners, once per supervisor
    /// lifetime: an empty line restarts, ctrl-c stops and exits.
    fn arm_triggers(self: &Arc<Self>) {
        if self.triggers_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    if let Err(e) = this.restart().await {
                        error!(error = %e, "restart failed");
                    }
                }
            }
        });
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let active = this.active_port();
                this.stop(&active).await;
                std::process::exit(0);
            }
        });
    }
}

/// Pump the child's stderr to our stdout, scanning for the panic sentinel.
/// On a match the captured text is published for the proxy's error page
/// and reprinted between banners; all other bytes pass through unchanged.
async fn pump_stderr(mut stderr: ChildStderr, last_error: Arc<RwLock<String>>) {
    let mut out = tokio::io::stdout();
    let mut buf = [0u8; 8192];
    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &buf[..n];
        let text = String::from_utf8_lossy(chunk);
        if text.contains(HTTP_PANIC_MESSAGE) {
            *last_error.write() = text.into_owned();
            let _ = out
                .write_all(b"----------- Application Error -----------\n")
                .await;
            let _ = out.write_all(chunk).await;
            let _ = out
                .write_all(b"-----------------------------------------\n")
                .await;
        } else {
            let _ = out.write_all(chunk).await;
        }
        let _ = out.flush().await;
    }
}
