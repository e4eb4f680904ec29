#[cfg(not(unix))]
compile_error!("sitl-fleet supervises POSIX process groups and only builds on Unix targets");

pub mod cancel;
pub mod commands;
pub mod config;
mod error;
pub mod instance;
mod paths;
pub mod ports;
pub mod process;
pub mod registry;
pub mod retry;
pub mod router;
mod validation;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::mpsc;

use commands::Command;
pub use config::{load_config, save_config, CommandSpec, OrchestratorConfig};
pub use error::{AppError, ErrorKind, Result};
pub use instance::{FleetSnapshot, HandshakeOutcome, InstanceId, InstanceState, InstanceStatus, Variant};
pub use paths::config_path;
pub use ports::PortPair;
pub use registry::Orchestrator;
pub use validation::{parse_instance_id, parse_variant};

/// Run the line console until EOF, `quit` or Ctrl-C, then stop the fleet.
pub async fn run(config: OrchestratorConfig) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::new(config));

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<serde_json::Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = reply_rx.recv().await {
            let line = format!("{}\n", reply);
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                log::error!("Failed to write reply: {}", e);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    log::info!("{}", commands::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    log::error!("Failed to listen for Ctrl-C: {}", e);
                }
                log::info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    log::info!("Input closed");
                    break;
                };
                match Command::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        let orchestrator = Arc::clone(&orchestrator);
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let result = commands::execute(&orchestrator, command).await;
                            let _ = reply_tx.send(commands::reply(result));
                        });
                    }
                    Err(e) => {
                        let _ = reply_tx.send(commands::reply(Err(e)));
                    }
                }
            }
        }
    }

    orchestrator.stop_all().await;
    let _ = reply_tx.send(commands::reply(Ok(serde_json::json!({ "shutdown": true }))));
    drop(reply_tx);
    let _ = writer.await;
    Ok(())
}
