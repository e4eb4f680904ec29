//! Line-oriented console commands over the orchestrator.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{AppError, Result};
use crate::instance::InstanceId;
use crate::registry::Orchestrator;
use crate::validation::parse_instance_id;

pub const HELP: &str = "commands: create <variant> | start <id> [deadline_secs] | stop <id> | remove <id> | status <id> | list | variants | stop-all | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Create(String),
    Start {
        id: InstanceId,
        deadline: Option<Duration>,
    },
    Stop(InstanceId),
    Remove(InstanceId),
    Status(InstanceId),
    List,
    Variants,
    StopAll,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match (name, args.as_slice()) {
            ("create", [variant]) => Self::Create((*variant).to_string()),
            ("start", [id]) => Self::Start {
                id: parse_instance_id(id)?,
                deadline: None,
            },
            ("start", [id, secs]) => Self::Start {
                id: parse_instance_id(id)?,
                deadline: Some(parse_deadline(secs)?),
            },
            ("stop", [id]) => Self::Stop(parse_instance_id(id)?),
            ("remove", [id]) => Self::Remove(parse_instance_id(id)?),
            ("status", [id]) => Self::Status(parse_instance_id(id)?),
            ("list", []) => Self::List,
            ("variants", []) => Self::Variants,
            ("stop-all", []) => Self::StopAll,
            ("quit" | "exit", []) => Self::Quit,
            _ => {
                return Err(AppError::invalid_argument(format!(
                    "Unrecognized command `{}`; {}",
                    line.trim(),
                    HELP
                )))
            }
        };
        Ok(Some(command))
    }
}

fn parse_deadline(raw: &str) -> Result<Duration> {
    raw.parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| AppError::invalid_argument(format!("Invalid deadline: {}", raw)))
}

/// Execute a command and return the reply body (without the `ok` flag).
pub async fn execute(orchestrator: &Orchestrator, command: Command) -> Result<Value> {
    match command {
        Command::Create(variant) => {
            let id = orchestrator.create(&variant).await?;
            Ok(json!({ "id": id }))
        }
        Command::Start { id, deadline } => {
            let pair = orchestrator.start_with_deadline(id, deadline).await?;
            let status = orchestrator.status(id)?;
            Ok(json!({
                "id": id,
                "ports": pair,
                "configuration_degraded": status.configuration_degraded,
            }))
        }
        Command::Stop(id) => {
            orchestrator.stop(id).await?;
            Ok(json!({ "id": id }))
        }
        Command::Remove(id) => {
            orchestrator.remove(id).await?;
            Ok(json!({ "id": id }))
        }
        Command::Status(id) => Ok(json!({ "instance": orchestrator.status(id)? })),
        Command::List => Ok(serde_json::to_value(orchestrator.list())?),
        Command::Variants => Ok(json!({ "variants": orchestrator.variants() })),
        Command::StopAll | Command::Quit => {
            orchestrator.stop_all().await;
            Ok(json!({}))
        }
    }
}

/// Wrap a command result as a single JSON reply line.
pub fn reply(result: Result<Value>) -> Value {
    match result {
        Ok(Value::Object(mut body)) => {
            body.insert("ok".to_string(), Value::Bool(true));
            Value::Object(body)
        }
        Ok(other) => json!({ "ok": true, "result": other }),
        Err(e) => {
            log::debug!("Command failed: {}", e);
            json!({ "ok": false, "error": e })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::error::ErrorKind;

    #[test]
    fn parses_every_command_form() {
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(
            Command::parse("create gz_x500").unwrap(),
            Some(Command::Create("gz_x500".to_string()))
        );
        assert_eq!(
            Command::parse("start instance_2 1.5").unwrap(),
            Some(Command::Start {
                id: InstanceId(2),
                deadline: Some(Duration::from_millis(1500)),
            })
        );
        assert_eq!(
            Command::parse("stop 3").unwrap(),
            Some(Command::Stop(InstanceId(3)))
        );
        assert_eq!(Command::parse("stop-all").unwrap(), Some(Command::StopAll));
        assert_eq!(Command::parse("quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn rejects_malformed_commands() {
        for line in ["launch 1", "start", "start 1 -2", "start 1 abc", "list extra", "remove x"] {
            let err = Command::parse(line).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{}", line);
        }
    }

    #[tokio::test]
    async fn replies_carry_ok_flag_and_error_code() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());

        let created = reply(execute(&orchestrator, Command::Create("gz_x500".into())).await);
        assert_eq!(created, json!({ "ok": true, "id": "instance_1" }));

        let failed = reply(execute(&orchestrator, Command::Create("gz_blimp".into())).await);
        assert_eq!(failed["ok"], json!(false));
        assert_eq!(failed["error"]["code"], json!(1001));

        let listed = reply(execute(&orchestrator, Command::List).await);
        assert_eq!(listed["total"], json!(1));
        assert_eq!(listed["instances"][0]["state"], json!("stopped"));
        assert_eq!(listed["instances"][0]["udp_port"], json!(14550));
    }
}
