use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower_proxy::build::{is_emitted_binary, upgrade_candidate, Builder};
use tower_proxy::config::{self, Cli, Settings};
use tower_proxy::ports::{self, PortPool};
use tower_proxy::proxy::Proxy;
use tower_proxy::supervisor::{Supervisor, SupervisorConfig};
use tower_proxy::watcher::{ChangeHandler, Watcher};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "tower_proxy=debug"
    } else {
        "tower_proxy=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    if cli.command.as_deref() == Some("init") {
        config::write_example_config()?;
        println!("== Generated config file {}", config::CONFIG_NAME);
        return Ok(());
    }

    let settings = Settings::load(&cli)?;

    let pool = PortPool::parse(&settings.app_port);
    if pool.is_empty() {
        anyhow::bail!("no usable ports in pool spec {:?}", settings.app_port);
    }
    if let Some(port) = pool.first() {
        if !ports::tcp_port_free(port) {
            eprintln!("Error: port ({port}) already in used.");
            std::process::exit(1);
        }
    }

    if settings.verbose {
        info!(entry = %settings.main_file, "application info");
        info!(
            proxy_port = %settings.proxy_port,
            app_ports = %settings.app_port,
            "redirecting requests"
        );
    }

    let name = std::env::current_dir()
        .ok()
        .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "app".to_string());

    let builder = Builder::new(
        settings.main_file.clone(),
        settings.build_dir.clone(),
        settings.exec_mode,
    );

    let supervisor = Supervisor::new(SupervisorConfig {
        name,
        pool,
        builder,
        run_params: settings.run_params.clone(),
        port_param_name: settings.port_param_name.clone(),
        offline_mode: settings.offline_mode,
        initial_bin: settings.initial_bin.clone(),
    });

    let watch_roots = watch_roots(&settings);
    let handler = if settings.exec_mode {
        exec_mode_handler(Arc::clone(&supervisor))
    } else {
        build_mode_handler(Arc::clone(&supervisor))
    };
    let watcher = Arc::new(Watcher::new(
        &watch_roots,
        &settings.watch_pattern,
        &settings.ignored_path_pattern,
        settings.exec_mode,
        handler,
    )?);

    let watch_task = tokio::spawn(Arc::clone(&watcher).watch());

    if let Err(e) = supervisor.start(true, None).await {
        error!(error = %e, "failed to start the application");
    }

    let proxy = Proxy::new(
        settings.proxy_port.clone(),
        Arc::clone(&supervisor),
        Arc::clone(&watcher),
        settings.admin_pwd.clone(),
        settings.admin_ips.clone(),
        settings.log_requests,
    );

    tokio::select! {
        res = proxy.listen() => res?,
        res = watch_task => match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.context("watcher failed")),
            Err(e) => anyhow::bail!("watcher task panicked: {e}"),
        },
    }
    Ok(())
}

/// Extra watch roots: the configured ones plus the directory the entry
/// file (build mode) or binaries (exec mode) live in.
fn watch_roots(settings: &Settings) -> String {
    let mut roots = settings.watch_other_dir.clone();
    let extra = if settings.exec_mode {
        settings.build_dir.clone()
    } else {
        Path::new(&settings.main_file)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    };
    if !extra.is_empty() {
        if roots.is_empty() {
            roots = extra;
        } else {
            roots = format!("{roots}|{extra}");
        }
    }
    roots
}

/// Pick a port distinct from the active one, cleaning and re-picking up
/// to three times with one-second gaps. Returns `None` when the pool
/// cannot produce a different port.
async fn pick_next_port(sup: &Arc<Supervisor>) -> Option<String> {
    let mut port = sup.pick_port();
    for _ in 0..3 {
        if port != sup.active_port() {
            break;
        }
        sup.clean().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        port = sup.pick_port();
    }
    if port == sup.active_port() {
        info!("picked port equals the active port, skipping cutover");
        return None;
    }
    Some(port)
}

/// Build mode: a source change rebuilds and cuts over to a fresh port.
fn build_mode_handler(sup: Arc<Supervisor>) -> ChangeHandler {
    Box::new(move |watcher, path| {
        info!("build mode change");
        watcher.reset();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if is_emitted_binary(file_name) {
            // Our own build output landing in a watched directory.
            debug!(file = %file_name, "ignoring emitted binary");
            return;
        }
        let sup = Arc::clone(&sup);
        tokio::spawn(async move {
            if !sup.supports_multi() {
                info!("unspecified switchable other ports");
                return;
            }
            let Some(port) = pick_next_port(&sup).await else {
                return;
            };
            if let Err(e) = sup.cutover(port).await {
                error!(error = %e, "cutover failed");
            }
        });
    })
}

/// Exec (binary-swap) mode: only a strictly newer dropped binary wins.
fn exec_mode_handler(sup: Arc<Supervisor>) -> ChangeHandler {
    Box::new(move |watcher, path| {
        info!("switch mode change");
        watcher.reset();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let current = sup.app_bin();
        let Some(new_bin) = upgrade_candidate(&file_name, &current) else {
            info!(
                file = %file_name,
                active = %current,
                "not a newer emitted binary, ignoring"
            );
            return;
        };
        let sup = Arc::clone(&sup);
        tokio::spawn(async move {
            if !sup.supports_multi() {
                info!("unspecified switchable other ports");
                return;
            }
            let Some(port) = pick_next_port(&sup).await else {
                return;
            };
            sup.set_app_bin(new_bin);
            if let Err(e) = sup.cutover(port).await {
                error!(error = %e, "cutover failed");
            }
        });
    })
}
