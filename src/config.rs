use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::paths::{config_path, ensure_parent_dir, expand_home};
use crate::retry::{Backoff, RetryPolicy};

/// Load the config at `path`, or the default location when `None`.
/// A missing file is created with the default settings.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };
    if !path.exists() {
        let config = OrchestratorConfig::default();
        save_config(&path, &config)?;
        log::info!("Wrote default config to {}", path.display());
        return Ok(config);
    }
    let content = fs::read_to_string(&path).map_err(|e| AppError::config(e.to_string()))?;
    let config: OrchestratorConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &OrchestratorConfig) -> Result<()> {
    ensure_parent_dir(path)?;
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content).map_err(|e| AppError::config(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub vehicle: VehicleConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ports.max_instances == 0 {
            return Err(AppError::config("ports.max_instances must be at least 1"));
        }
        let span = self.ports.max_instances - 1;
        for (name, base) in [
            ("udp_base", self.ports.udp_base),
            ("tcp_base", self.ports.tcp_base),
        ] {
            if usize::from(base) + span > usize::from(u16::MAX) {
                return Err(AppError::config(format!(
                    "ports.{} + max_instances exceeds the port range",
                    name
                )));
            }
        }
        let udp = usize::from(self.ports.udp_base);
        let tcp = usize::from(self.ports.tcp_base);
        if udp <= tcp + span && tcp <= udp + span {
            return Err(AppError::config("UDP and TCP port ranges overlap"));
        }
        if self.handshake.max_attempts == 0 {
            return Err(AppError::config("handshake.max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Vehicle working directory with `~` expanded.
    pub fn vehicle_workdir(&self) -> PathBuf {
        expand_home(&self.vehicle.workdir)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ports: PortConfig::default(),
            vehicle: VehicleConfig::default(),
            router: RouterConfig::default(),
            handshake: HandshakeConfig::default(),
            cleanup: CleanupConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// An external program invocation with `{placeholder}` templating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Substitute every `{key}` found in `vars` into program, args and env values.
    pub fn render(&self, vars: &[(&str, String)]) -> CommandLine {
        let fill = |template: &str| {
            vars.iter().fold(template.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        };
        CommandLine {
            program: fill(&self.program),
            args: self.args.iter().map(|a| fill(a)).collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), fill(v)))
                .collect(),
        }
    }
}

/// A fully rendered command, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_udp_base")]
    pub udp_base: u16,
    #[serde(default = "default_tcp_base")]
    pub tcp_base: u16,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
}

fn default_udp_base() -> u16 {
    14550
}

fn default_tcp_base() -> u16 {
    5760
}

fn default_max_instances() -> usize {
    10
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            udp_base: default_udp_base(),
            tcp_base: default_tcp_base(),
            max_instances: default_max_instances(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleConfig {
    #[serde(default = "default_vehicle_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "default_vehicle_command")]
    pub command: CommandSpec,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_boot_grace_ms")]
    pub boot_grace_ms: u64,
    #[serde(default = "default_boot_poll_ms")]
    pub boot_poll_ms: u64,
}

fn default_vehicle_workdir() -> PathBuf {
    PathBuf::from("~/PX4-Autopilot")
}

fn default_vehicle_command() -> CommandSpec {
    let mut spec = CommandSpec::new("make", &["px4_sitl", "{variant}"]);
    spec.env.insert("HEADLESS".to_string(), "1".to_string());
    spec
}

fn default_settle_ms() -> u64 {
    2_000
}

fn default_boot_grace_ms() -> u64 {
    20_000
}

fn default_boot_poll_ms() -> u64 {
    500
}

impl VehicleConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn boot_grace(&self) -> Duration {
        Duration::from_millis(self.boot_grace_ms)
    }

    pub fn boot_poll(&self) -> Duration {
        Duration::from_millis(self.boot_poll_ms.max(1))
    }
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            workdir: default_vehicle_workdir(),
            command: default_vehicle_command(),
            settle_ms: default_settle_ms(),
            boot_grace_ms: default_boot_grace_ms(),
            boot_poll_ms: default_boot_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterMode {
    /// One router process per instance.
    #[default]
    PerInstance,
    /// One router for the whole fleet; every change restarts it.
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub mode: RouterMode,
    #[serde(default = "default_per_instance_router")]
    pub per_instance: CommandSpec,
    #[serde(default = "default_shared_router")]
    pub shared: CommandSpec,
    #[serde(default = "default_shared_config_path")]
    pub shared_config_path: PathBuf,
    #[serde(default = "default_router_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_per_instance_router() -> CommandSpec {
    CommandSpec::new(
        "mavlink-routerd",
        &["0.0.0.0:{udp_port}", "-t", "{tcp_port}", "-v"],
    )
}

fn default_shared_router() -> CommandSpec {
    CommandSpec::new("mavlink-routerd", &["-c", "{config}", "-v"])
}

fn default_shared_config_path() -> PathBuf {
    PathBuf::from("/tmp/mavlink-router.conf")
}

fn default_router_log_path() -> PathBuf {
    PathBuf::from("/tmp/mavlink-router.log")
}

impl RouterConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: RouterMode::default(),
            per_instance: default_per_instance_router(),
            shared: default_shared_router(),
            shared_config_path: default_shared_config_path(),
            log_path: default_router_log_path(),
            settle_ms: default_settle_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default = "default_probe")]
    pub probe: CommandSpec,
    #[serde(default = "default_stream_rate")]
    pub stream_rate: u64,
    #[serde(default = "default_stabilize_ms")]
    pub stabilize_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub verify_timeout_ms: u64,
    #[serde(default = "default_alternate_timeout_ms")]
    pub alternate_timeout_ms: u64,
}

fn default_probe() -> CommandSpec {
    CommandSpec::new(
        "python3",
        &["{workdir}/Tools/mavlink_shell.py", "udp:{address}"],
    )
}

fn default_stream_rate() -> u64 {
    4_000_000
}

fn default_stabilize_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_attempt_timeout_ms() -> u64 {
    45_000
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_command_timeout_ms() -> u64 {
    20_000
}

fn default_verify_delay_ms() -> u64 {
    2_000
}

fn default_alternate_timeout_ms() -> u64 {
    15_000
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            probe: default_probe(),
            stream_rate: default_stream_rate(),
            stabilize_ms: default_stabilize_ms(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            verify_delay_ms: default_verify_delay_ms(),
            verify_timeout_ms: default_probe_timeout_ms(),
            alternate_timeout_ms: default_alternate_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_port_poll_attempts")]
    pub port_poll_attempts: u32,
    /// First delay between port checks; doubles up to `port_poll_max_ms`.
    #[serde(default = "default_port_poll_ms")]
    pub port_poll_ms: u64,
    #[serde(default = "default_port_poll_max_ms")]
    pub port_poll_max_ms: u64,
}

fn default_port_poll_attempts() -> u32 {
    4
}

fn default_port_poll_ms() -> u64 {
    500
}

fn default_port_poll_max_ms() -> u64 {
    2000
}

impl CleanupConfig {
    pub fn port_poll_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.port_poll_attempts,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(self.port_poll_ms),
                max: Duration::from_millis(self.port_poll_max_ms.max(self.port_poll_ms)),
            },
            attempt_timeout: None,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            port_poll_attempts: default_port_poll_attempts(),
            port_poll_ms: default_port_poll_ms(),
            port_poll_max_ms: default_port_poll_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Time between SIGTERM and SIGKILL.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_grace_ms() -> u64 {
    5_000
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            [ports]
            max_instances = 4

            [router]
            mode = "shared"
            "#,
        )
        .unwrap();
        assert_eq!(config.ports.max_instances, 4);
        assert_eq!(config.ports.udp_base, 14550);
        assert_eq!(config.router.mode, RouterMode::Shared);
        assert_eq!(config.handshake.max_attempts, 3);
        assert_eq!(config.vehicle.command.env.get("HEADLESS").map(String::as_str), Some("1"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn render_substitutes_placeholders() {
        let spec = default_per_instance_router();
        let line = spec.render(&[("udp_port", "14551".to_string()), ("tcp_port", "5761".to_string())]);
        assert_eq!(line.program, "mavlink-routerd");
        assert_eq!(line.args, vec!["0.0.0.0:14551", "-t", "5761", "-v"]);
        assert_eq!(line.to_string(), "mavlink-routerd 0.0.0.0:14551 -t 5761 -v");
    }

    #[test]
    fn render_leaves_unknown_placeholders() {
        let spec = CommandSpec::new("echo", &["{nope}", "{variant}"]);
        let line = spec.render(&[("variant", "gz_x500".to_string())]);
        assert_eq!(line.args, vec!["{nope}", "gz_x500"]);
    }

    #[test]
    fn port_polling_backs_off_exponentially() {
        let cleanup = CleanupConfig {
            port_poll_attempts: 5,
            port_poll_ms: 500,
            port_poll_max_ms: 1_500,
        };
        let policy = cleanup.port_poll_policy();
        assert_eq!(policy.max_attempts, 5);
        let delays: Vec<u64> = (1..=4)
            .map(|a| policy.backoff.delay(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1_000, 1_500, 1_500]);
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let mut config = OrchestratorConfig::default();
        config.ports.tcp_base = 14555;
        assert!(config.validate().is_err());
        config.ports.tcp_base = 5760;
        assert!(config.validate().is_ok());
        config.ports.max_instances = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = load_config(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.ports.tcp_base, 5760);

        let reloaded = load_config(Some(&path)).unwrap();
        assert_eq!(reloaded.router.mode, RouterMode::PerInstance);
        assert_eq!(reloaded.handshake.stream_rate, 4_000_000);
    }
}
