//! Configuration: command-line flags merged with the `.tower.yml` file.
//! File values win over flags; unknown keys are ignored.

use std::path::Path;

use anyhow::{bail, Context};
use clap::Parser;
use serde_yaml::Value;
use tracing::warn;

use crate::build::{bin_timestamp, BIN_PREFIX};

pub const CONFIG_NAME: &str = ".tower.yml";
pub const DEFAULT_APP_PORT: &str = "5000-5050";
pub const DEFAULT_PROXY_PORT: &str = "8080";
pub const DEFAULT_ADMIN_IPS: &str = "127.0.0.1,::1";

/// Bundled example configuration written by the `init` subcommand.
pub const EXAMPLE_CONFIG: &str = include_str!("../tower.yml");

#[derive(Debug, Parser)]
#[command(name = "tower", version, about = "Supervises and proxies a locally built HTTP app")]
pub struct Cli {
    /// Path to your app's main file
    #[arg(short = 'm', default_value = "")]
    pub main_file: String,

    /// Port range of your app
    #[arg(short = 'p', default_value = DEFAULT_APP_PORT)]
    pub app_port: String,

    /// Proxy port of your app
    #[arg(short = 'r', default_value = DEFAULT_PROXY_PORT)]
    pub proxy_port: String,

    /// Folder to save the executable file in
    #[arg(short = 'o', default_value = "")]
    pub build_dir: String,

    /// App's port param name
    #[arg(short = 'n', default_value = "")]
    pub port_param_name: String,

    /// App's run params
    #[arg(short = 's', default_value = "")]
    pub run_params: String,

    /// Show more stuff
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Yaml configuration file location
    #[arg(short = 'c', default_value = CONFIG_NAME)]
    pub config_file: String,

    /// Admin password
    #[arg(short = 'w', default_value = "")]
    pub admin_pwd: String,

    /// Admin allow IPs
    #[arg(short = 'i', default_value = DEFAULT_ADMIN_IPS)]
    pub admin_ips: String,

    /// Optional subcommand; `init` writes an example configuration
    pub command: Option<String>,
}

/// Truthy parsing used by config switches.
pub fn atob(s: &str) -> bool {
    matches!(s, "1" | "true" | "on" | "yes")
}

/// Flat view over the YAML mapping; scalar values of any YAML type are
/// read back as strings, the way the config keys are documented.
struct FileValues(Value);

impl FileValues {
    fn parse(text: &str) -> anyhow::Result<Self> {
        let value: Value = serde_yaml::from_str(text).context("invalid yaml")?;
        Ok(Self(value))
    }

    fn get(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn get_nonempty(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty())
    }
}

/// Fully merged runtime settings.
#[derive(Debug)]
pub struct Settings {
    pub main_file: String,
    pub app_port: String,
    pub proxy_port: String,
    pub build_dir: String,
    pub port_param_name: String,
    pub run_params: Vec<String>,
    pub watch_pattern: String,
    pub watch_other_dir: String,
    pub ignored_path_pattern: String,
    pub offline_mode: bool,
    pub log_requests: bool,
    pub admin_pwd: String,
    pub admin_ips: Vec<String>,
    pub verbose: bool,
    pub exec_mode: bool,
    /// Exec mode: validated base name of the prebuilt binary.
    pub initial_bin: String,
}

impl Settings {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut settings = Self::from_cli(cli);
        match std::fs::read_to_string(&cli.config_file) {
            Ok(text) => {
                let values = FileValues::parse(&text)
                    .with_context(|| format!("failed to parse {}", cli.config_file))?;
                settings.apply_file(&values);
            }
            Err(e) => {
                warn!(path = %cli.config_file, error = %e, "config file not read, using flags");
            }
        }
        settings.finalize()?;
        Ok(settings)
    }

    fn from_cli(cli: &Cli) -> Self {
        Self {
            main_file: cli.main_file.clone(),
            app_port: cli.app_port.clone(),
            proxy_port: cli.proxy_port.clone(),
            build_dir: cli.build_dir.clone(),
            port_param_name: cli.port_param_name.clone(),
            run_params: split_params(&cli.run_params),
            watch_pattern: String::new(),
            watch_other_dir: String::new(),
            ignored_path_pattern: String::new(),
            offline_mode: false,
            log_requests: true,
            admin_pwd: cli.admin_pwd.clone(),
            admin_ips: split_list(&cli.admin_ips),
            verbose: cli.verbose,
            exec_mode: false,
            initial_bin: String::new(),
        }
    }

    fn apply_file(&mut self, values: &FileValues) {
        if let Some(exec) = values.get_nonempty("exec") {
            self.exec_mode = true;
            self.main_file = exec;
        } else if let Some(main) = values.get_nonempty("main") {
            self.main_file = main;
        }
        if let Some(v) = values.get_nonempty("app_port") {
            self.app_port = v;
        }
        if let Some(v) = values.get_nonempty("pxy_port") {
            self.proxy_port = v;
        }
        if let Some(v) = values.get_nonempty("app_buildDir") {
            self.build_dir = v;
        }
        if let Some(v) = values.get_nonempty("app_portParamName") {
            self.port_param_name = v;
        }
        if let Some(v) = values.get_nonempty("app_runParams") {
            self.run_params = split_params(&v);
        }
        if let Some(v) = values.get_nonempty("watch") {
            self.watch_pattern = v;
        }
        if let Some(v) = values.get_nonempty("watch_otherDir") {
            self.watch_other_dir = v;
        }
        if let Some(v) = values.get_nonempty("watch_ignoredPath") {
            self.ignored_path_pattern = v;
        }
        if let Some(v) = values.get("offline_mode") {
            self.offline_mode = atob(&v);
        }
        if let Some(v) = values.get("log_request") {
            self.log_requests = atob(&v);
        }
        if let Some(v) = values.get_nonempty("admin_pwd") {
            self.admin_pwd = v;
        }
        if let Some(v) = values.get_nonempty("admin_ip") {
            self.admin_ips = split_list(&v);
        }
    }

    fn finalize(&mut self) -> anyhow::Result<()> {
        if self.exec_mode {
            let path = Path::new(&self.main_file);
            if !path.is_file() {
                bail!("executable {} not found", self.main_file);
            }
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if bin_timestamp(file_name).is_none() {
                bail!(
                    "executable name must be {BIN_PREFIX}<version>, e.g. {BIN_PREFIX}0; got {file_name}"
                );
            }
            self.initial_bin = file_name
                .strip_suffix(".exe")
                .unwrap_or(file_name)
                .to_string();
            // The binary lives next to where it was dropped; resolve it
            // from there unless an output directory was given explicitly.
            if self.build_dir.is_empty() {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        self.build_dir = parent.display().to_string();
                    }
                }
            }
        } else if self.main_file.is_empty() {
            bail!("no entry file configured; pass -m or set 'main' in {CONFIG_NAME}");
        }
        Ok(())
    }
}

fn split_params(s: &str) -> Vec<String> {
    s.split_whitespace().map(String::from).collect()
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

/// `tower init`: copy the bundled example config next to the project.
pub fn write_example_config() -> anyhow::Result<()> {
    std::fs::write(CONFIG_NAME, EXAMPLE_CONFIG)
        .with_context(|| format!("failed to write {CONFIG_NAME}"))?;
    Ok(())
}
