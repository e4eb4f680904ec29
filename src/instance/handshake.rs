//! Telemetry configuration handshake with the vehicle's control channel.
//!
//! The probe tool is launched once per command with the command line on its
//! stdin. Its exit status is the only signal: zero means the vehicle accepted
//! the command.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt as _;

use super::types::{HandshakeOutcome, InstanceId};
use crate::cancel::Cancellation;
use crate::config::{CommandLine, HandshakeConfig};
use crate::error::{AppError, ErrorKind, Result};
use crate::ports::PortPair;
use crate::retry::RetryPolicy;

const STATUS_PROBE: &str = "status";
const STREAM_STATUS: &str = "mavlink status";

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

pub struct Handshake<'a> {
    id: InstanceId,
    config: &'a HandshakeConfig,
    probe: CommandLine,
    udp_port: u16,
}

impl<'a> Handshake<'a> {
    pub fn new(id: InstanceId, config: &'a HandshakeConfig, pair: PortPair, workdir: &Path) -> Self {
        let probe = config.probe.render(&[
            ("workdir", workdir.display().to_string()),
            ("address", format!("127.0.0.1:{}", pair.udp_port)),
            ("udp_port", pair.udp_port.to_string()),
            ("tcp_port", pair.tcp_port.to_string()),
            ("rate", config.stream_rate.to_string()),
        ]);
        Self {
            id,
            config,
            probe,
            udp_port: pair.udp_port,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.config.max_attempts, ms(self.config.retry_delay_ms))
            .with_attempt_timeout(ms(self.config.attempt_timeout_ms))
    }

    fn stream_command(&self, exclusive: bool) -> String {
        let flags = if exclusive { "-x " } else { "" };
        format!(
            "mavlink start {}-u {} -r {}",
            flags, self.udp_port, self.config.stream_rate
        )
    }

    /// Run the full handshake.
    ///
    /// Exhausting every attempt yields `ConfigurationDegraded`; only
    /// cancellation is meant to abort the caller.
    pub async fn run(&self, cancel: &Cancellation) -> Result<HandshakeOutcome> {
        log::info!("Configuring telemetry for {}...", self.id);
        cancel.sleep(ms(self.config.stabilize_ms)).await?;

        let label = format!("Telemetry configuration for {}", self.id);
        match self
            .policy()
            .run(&label, cancel, |attempt| self.attempt(attempt, cancel))
            .await
        {
            Ok(()) => {
                log::info!("Telemetry configured and verified for {}", self.id);
                return Ok(HandshakeOutcome::Configured);
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
            Err(_) => {}
        }

        log::info!("Trying alternative telemetry configuration for {}...", self.id);
        let alternate = self.stream_command(false);
        match self
            .send(&alternate, ms(self.config.alternate_timeout_ms), cancel)
            .await
        {
            Ok(()) => {
                log::info!("Alternative telemetry configuration succeeded for {}", self.id);
                Ok(HandshakeOutcome::ConfiguredAlternate)
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => Err(e),
            Err(e) => {
                log::warn!(
                    "All telemetry configuration attempts failed for {}: {}",
                    self.id,
                    e
                );
                Err(AppError::configuration_degraded(self.config.max_attempts))
            }
        }
    }

    async fn attempt(&self, attempt: u32, cancel: &Cancellation) -> Result<()> {
        log::info!(
            "Telemetry configuration attempt {} for {}",
            attempt,
            self.id
        );
        self.send(STATUS_PROBE, ms(self.config.probe_timeout_ms), cancel)
            .await?;
        self.send(
            &self.stream_command(true),
            ms(self.config.command_timeout_ms),
            cancel,
        )
        .await?;
        cancel.sleep(ms(self.config.verify_delay_ms)).await?;
        self.send(STREAM_STATUS, ms(self.config.verify_timeout_ms), cancel)
            .await
    }

    async fn send(&self, input: &str, timeout: Duration, cancel: &Cancellation) -> Result<()> {
        run_control_command(&self.probe, input, timeout, cancel).await
    }
}

/// Run the probe tool once, feeding `input` on stdin.
pub async fn run_control_command(
    probe: &CommandLine,
    input: &str,
    timeout: Duration,
    cancel: &Cancellation,
) -> Result<()> {
    cancel.check()?;
    let mut cmd = probe.to_command();
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| AppError::process(format!("Failed to run {}: {}", probe.program, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        // The tool may exit before reading; its exit status still decides.
        if let Err(e) = stdin.write_all(format!("{}\n", input).as_bytes()).await {
            log::debug!("Could not write `{}` to {}: {}", input, probe.program, e);
        }
    }

    let output = tokio::select! {
        () = cancel.cancelled() => return Err(AppError::cancelled()),
        res = tokio::time::timeout(timeout, child.wait_with_output()) => match res {
            Ok(output) => output?,
            Err(_) => return Err(AppError::timeout(input, timeout.as_secs_f64())),
        },
    };

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(AppError::process(format!(
            "`{}` failed ({}): {}",
            input,
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation_pair;
    use crate::config::CommandSpec;

    fn fast_config(probe: CommandSpec) -> HandshakeConfig {
        HandshakeConfig {
            probe,
            stabilize_ms: 0,
            retry_delay_ms: 10,
            attempt_timeout_ms: 5_000,
            probe_timeout_ms: 2_000,
            command_timeout_ms: 2_000,
            verify_delay_ms: 0,
            verify_timeout_ms: 2_000,
            alternate_timeout_ms: 2_000,
            ..HandshakeConfig::default()
        }
    }

    /// Probe that appends each received command to `log` and exits with `script`'s status.
    fn recording_probe(log: &Path, script: &str) -> CommandSpec {
        CommandSpec::new(
            "sh",
            &[
                "-c",
                &format!("read line; echo \"$line\" >> '{}'; {}", log.display(), script),
            ],
        )
    }

    fn transcript(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn healthy_probe_configures_on_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("probe.log");
        let config = fast_config(recording_probe(&log, "exit 0"));
        let handshake = Handshake::new(InstanceId(1), &config, PortPair::new(14550, 5760), dir.path());

        let outcome = handshake.run(&Cancellation::never()).await.unwrap();
        assert_eq!(outcome, HandshakeOutcome::Configured);
        assert_eq!(
            transcript(&log),
            vec![
                "status".to_string(),
                "mavlink start -x -u 14550 -r 4000000".to_string(),
                "mavlink status".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_fall_back_then_degrade() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("probe.log");
        let config = fast_config(recording_probe(&log, "exit 1"));
        let handshake = Handshake::new(InstanceId(2), &config, PortPair::new(14551, 5761), dir.path());

        let err = handshake.run(&Cancellation::never()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationDegraded);
        assert_eq!(
            transcript(&log),
            vec![
                "status".to_string(),
                "status".to_string(),
                "status".to_string(),
                "mavlink start -u 14551 -r 4000000".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn alternate_form_rescues_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("probe.log");
        // Only the flag-less start command succeeds.
        let script = "case \"$line\" in 'mavlink start -u'*) exit 0;; *) exit 1;; esac";
        let config = fast_config(recording_probe(&log, script));
        let handshake = Handshake::new(InstanceId(3), &config, PortPair::new(14552, 5762), dir.path());

        let outcome = handshake.run(&Cancellation::never()).await.unwrap();
        assert_eq!(outcome, HandshakeOutcome::ConfiguredAlternate);
    }

    #[tokio::test]
    async fn hung_probe_times_out() {
        let probe = CommandSpec::new("sleep", &["30"]).render(&[]);
        let err = run_control_command(&probe, "status", Duration::from_millis(50), &Cancellation::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn cancellation_stops_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(CommandSpec::new("false", &[]));
        config.retry_delay_ms = 30_000;
        let handshake = Handshake::new(InstanceId(4), &config, PortPair::new(14553, 5763), dir.path());
        let (handle, cancel) = cancellation_pair();
        let _timer = handle.cancel_after(Duration::from_millis(50));

        let err = handshake.run(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn probe_targets_instance_address() {
        let config = HandshakeConfig::default();
        let handshake = Handshake::new(
            InstanceId(1),
            &config,
            PortPair::new(14555, 5765),
            Path::new("/opt/PX4-Autopilot"),
        );
        assert_eq!(handshake.probe.program, "python3");
        assert_eq!(
            handshake.probe.args,
            vec![
                "/opt/PX4-Autopilot/Tools/mavlink_shell.py".to_string(),
                "udp:127.0.0.1:14555".to_string(),
            ]
        );
        assert_eq!(handshake.policy().max_attempts, 3);
    }
}
