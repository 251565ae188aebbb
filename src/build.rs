//! Builder: invokes the toolchain to produce timestamped binaries.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::bail;
use tokio::process::Command;
use tracing::info;

/// Base-name prefix of every binary the builder emits. The numeric suffix
/// is the version ordering key in binary-swap mode.
pub const BIN_PREFIX: &str = "tower-app-";

/// Toolchain banner line stripped from captured build output.
const BUILD_BANNER: &str = "# command-line-arguments\n";

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Compiles the configured entry file into `{BIN_PREFIX}{unix}` under the
/// build directory. In exec mode (`disabled`) building is a no-op.
pub struct Builder {
    main_file: String,
    build_dir: String,
    disabled: bool,
}

impl Builder {
    pub fn new(main_file: String, build_dir: String, disabled: bool) -> Self {
        Self {
            main_file,
            build_dir,
            disabled,
        }
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Full on-disk path for a binary base name, with the platform suffix.
    pub fn bin_path(&self, bin_name: &str) -> PathBuf {
        let file = if cfg!(windows) {
            format!("{bin_name}.exe")
        } else {
            bin_name.to_string()
        };
        if self.build_dir.is_empty() {
            PathBuf::from(file)
        } else {
            PathBuf::from(&self.build_dir).join(file)
        }
    }

    /// Run the toolchain and return the new binary's base name, or `None`
    /// when building is disabled. Any captured output is treated as a
    /// build failure and surfaced verbatim.
    pub async fn build(&self, app_name: &str) -> anyhow::Result<Option<String>> {
        if self.disabled {
            return Ok(None);
        }
        info!(app = app_name, "building");
        let bin_name = format!("{BIN_PREFIX}{}", now_unix());
        let out_path = self.bin_path(&bin_name);

        let output = Command::new("go")
            .arg("build")
            .arg("-o")
            .arg(&out_path)
            .arg(&self.main_file)
            .output()
            .await?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if !combined.is_empty() {
            let msg = String::from_utf8_lossy(&combined).replacen(BUILD_BANNER, "", 1);
            bail!("{msg}");
        }
        info!("build completed");
        Ok(Some(bin_name))
    }
}

/// Parse the version timestamp out of a binary file name, tolerating the
/// platform suffix. Returns `None` when the name does not follow the
/// `{BIN_PREFIX}{integer}` convention.
pub fn bin_timestamp(file_name: &str) -> Option<i64> {
    let name = file_name.strip_suffix(".exe").unwrap_or(file_name);
    name.strip_prefix(BIN_PREFIX)?.parse::<i64>().ok()
}

/// True when a changed file is one of our own emitted binaries. Build
/// mode skips these so a fresh build landing in a watched directory does
/// not trigger another rebuild.
pub fn is_emitted_binary(file_name: &str) -> bool {
    file_name.starts_with(BIN_PREFIX)
}

/// Exec-mode upgrade gate: a dropped binary replaces the active one only
/// when it carries the emitted-binary prefix and a version timestamp
/// strictly greater than the active binary's. Returns the base name to
/// adopt, with the platform suffix stripped.
pub fn upgrade_candidate(file_name: &str, active_bin: &str) -> Option<String> {
    let new_ts = bin_timestamp(file_name)?;
    let old_ts = bin_timestamp(active_bin).unwrap_or(0);
    if new_ts <= old_ts {
        return None;
    }
    Some(
        file_name
            .strip_suffix(".exe")
            .unwrap_or(file_name)
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_timestamp_parses_plain_and_suffixed_names() {
        assert_eq!(bin_timestamp("tower-app-1700000000"), Some(1_700_000_000));
        assert_eq!(bin_timestamp("tower-app-42.exe"), Some(42));
    }

    #[test]
    fn bin_timestamp_rejects_foreign_names() {
        assert_eq!(bin_timestamp("main.go"), None);
        assert_eq!(bin_timestamp("tower-app-"), None);
        assert_eq!(bin_timestamp("tower-app-abc"), None);
        assert_eq!(bin_timestamp("other-app-100"), None);
    }

    #[test]
    fn emitted_binaries_are_recognized() {
        assert!(is_emitted_binary("tower-app-1700000000"));
        assert!(is_emitted_binary("tower-app-5.exe"));
        assert!(!is_emitted_binary("main.go"));
        assert!(!is_emitted_binary("other-app-100"));
    }

    #[test]
    fn upgrade_requires_strictly_newer_timestamp() {
        assert_eq!(
            upgrade_candidate("tower-app-200", "tower-app-100").as_deref(),
            Some("tower-app-200")
        );
        assert!(upgrade_candidate("tower-app-100", "tower-app-100").is_none());
        assert!(upgrade_candidate("tower-app-50", "tower-app-100").is_none());
    }

    #[test]
    fn upgrade_ignores_files_without_the_binary_prefix() {
        assert!(upgrade_candidate("main.go", "tower-app-100").is_none());
        assert!(upgrade_candidate("tower-app-", "tower-app-100").is_none());
        assert!(upgrade_candidate("other-app-200", "tower-app-100").is_none());
    }

    #[test]
    fn upgrade_strips_the_platform_suffix() {
        assert_eq!(
            upgrade_candidate("tower-app-200.exe", "tower-app-100").as_deref(),
            Some("tower-app-200")
        );
    }

    #[test]
    fn any_valid_binary_upgrades_an_unversioned_active_name() {
        assert_eq!(
            upgrade_candidate("tower-app-1", "").as_deref(),
            Some("tower-app-1")
        );
    }

    #[test]
    fn bin_path_honors_build_dir() {
        let builder = Builder::new("main.go".into(), "build".into(), false);
        let path = builder.bin_path("tower-app-1");
        assert!(path.starts_with("build"));

        let builder = Builder::new("main.go".into(), String::new(), false);
        let path = builder.bin_path("tower-app-1");
        assert_eq!(path.parent().map(|p| p.as_os_str().is_empty()), Some(true));
    }

    #[tokio::test]
    async fn disabled_builder_is_a_noop() {
        let builder = Builder::new(String::new(), String::new(), true);
        assert!(builder.build("demo").await.unwrap().is_none());
    }
}
