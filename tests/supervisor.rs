//! Integration tests exercising the supervisor against real child
//! processes: launch, stop, and generation cleanup including binary
//! removal.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tower_proxy::build::Builder;
use tower_proxy::ports::PortPool;
use tower_proxy::supervisor::{Supervisor, SupervisorConfig};

/// Drop a long-running "binary" (a shell script) into the build dir.
fn write_sleeper(dir: &Path, name: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, "#!/bin/sh\nsleep 60\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A supervisor launching script binaries. The empty port param keeps
/// readiness dialing out of the picture; the scripts never bind a port.
fn sleeper_supervisor(
    dir: &Path,
    initial_bin: &str,
    pool: &str,
    exec_mode: bool,
) -> Arc<Supervisor> {
    Supervisor::new(SupervisorConfig {
        name: "it-app".to_string(),
        pool: PortPool::parse(pool),
        builder: Builder::new(String::new(), dir.display().to_string(), exec_mode),
        run_params: Vec::new(),
        port_param_name: String::new(),
        offline_mode: false,
        initial_bin: initial_bin.to_string(),
    })
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..40 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cond()
}

#[tokio::test]
async fn stop_kills_the_child_and_removes_the_binary() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write_sleeper(dir.path(), "tower-app-100");
    let sup = sleeper_supervisor(dir.path(), "tower-app-100", "7301", false);

    sup.run("7301").await.unwrap();
    assert!(sup.is_running("7301"));

    sup.stop("7301").await;
    assert!(eventually(|| !sup.is_running("7301")).await);
    assert!(eventually(|| !bin.exists()).await);
}

#[tokio::test]
async fn clean_retires_only_draining_generations() {
    let dir = tempfile::tempdir().unwrap();
    let active_bin = write_sleeper(dir.path(), "tower-app-100");
    let sup = sleeper_supervisor(dir.path(), "tower-app-100", "7401,7402", false);

    // Active generation on the first pool port.
    sup.run("7401").await.unwrap();
    assert!(sup.is_running("7401"));

    // A second generation that immediately becomes draining.
    let draining_bin = write_sleeper(dir.path(), "tower-app-200");
    sup.set_app_bin("tower-app-200".to_string());
    sup.run("7402").await.unwrap();
    assert!(sup.is_running("7402"));

    sup.clean().await;

    assert!(eventually(|| !sup.is_running("7402")).await);
    assert!(eventually(|| !draining_bin.exists()).await);
    // The active generation and its binary must survive a clean.
    assert!(sup.is_running("7401"));
    assert!(active_bin.exists());

    sup.stop("7401").await;
}

#[tokio::test]
async fn exec_mode_stop_keeps_the_active_binary() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write_sleeper(dir.path(), "tower-app-300");
    let sup = sleeper_supervisor(dir.path(), "tower-app-300", "7501", true);

    sup.run("7501").await.unwrap();
    assert!(sup.is_running("7501"));

    sup.stop("7501").await;
    assert!(eventually(|| !sup.is_running("7501")).await);
    // The prebuilt binary was handed to us; it is never deleted.
    assert!(bin.exists());
}

#[tokio::test]
async fn replacing_a_generation_retires_the_previous_binary() {
    let dir = tempfile::tempdir().unwrap();
    let old_bin = write_sleeper(dir.path(), "tower-app-100");
    let sup = sleeper_supervisor(dir.path(), "tower-app-100", "7601", false);

    sup.run("7601").await.unwrap();
    assert!(sup.is_running("7601"));

    // Drop a newer binary and relaunch on the same port: the one-shot
    // path kills the old child and removes its binary.
    let new_bin = write_sleeper(dir.path(), "tower-app-200");
    sup.set_app_bin("tower-app-200".to_string());
    sup.run("7601").await.unwrap();

    assert!(eventually(|| !old_bin.exists()).await);
    assert!(sup.is_running("7601"));
    assert!(new_bin.exists());

    sup.stop("7601").await;
}

#[tokio::test]
async fn quit_detection_reports_an_exited_child() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tower-app-100");
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    let sup = sleeper_supervisor(dir.path(), "tower-app-100", "7701", false);
    sup.run("7701").await.unwrap();

    assert!(eventually(|| sup.is_quit_active()).await);
    assert!(!sup.is_running_active());
}
