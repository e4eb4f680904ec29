//! Signal-level process control.
//!
//! Every child is spawned as the leader of its own process group, so the
//! group id equals the leader's PID and signals reach all descendants.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use crate::error::{AppError, Result};
use crate::ports::PortPair;

fn as_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| AppError::process(format!("PID {} out of range", pid)))
}

/// Check if a process is alive by PID.
pub fn is_process_alive(pid: u32) -> bool {
    as_pid(pid).is_ok_and(|pid| kill(pid, None).is_ok())
}

fn signal_group(pgid: u32, signal: Signal) -> Result<()> {
    match killpg(as_pid(pgid)?, signal) {
        // Group already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AppError::process(format!(
            "Failed to send {:?} to process group {}: {}",
            signal, pgid, e
        ))),
    }
}

/// Send a graceful shutdown signal to a process group.
pub fn graceful_signal(pgid: u32) -> Result<()> {
    signal_group(pgid, Signal::SIGTERM)
}

pub fn force_kill(pgid: u32) -> Result<()> {
    signal_group(pgid, Signal::SIGKILL)
}

/// Whether nothing on this host is bound to either port of the pair.
pub fn is_port_pair_free(pair: PortPair) -> bool {
    portpicker::is_free_udp(pair.udp_port) && portpicker::is_free_tcp(pair.tcp_port)
}

pub fn check_port_pair_available(pair: PortPair) -> Result<()> {
    if is_port_pair_free(pair) {
        Ok(())
    } else {
        Err(AppError::process(format!("Ports in use: {}", pair)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn signalling_a_missing_group_is_ok() {
        // PIDs near i32::MAX are never handed out on Linux.
        let ghost = i32::MAX as u32 - 7;
        assert!(!is_process_alive(ghost));
        assert!(graceful_signal(ghost).is_ok());
        assert!(force_kill(ghost).is_ok());
    }

    #[test]
    fn bound_tcp_port_is_reported_busy() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let tcp_port = listener.local_addr().unwrap().port();
        let Some(udp_port) = portpicker::pick_unused_port() else {
            return;
        };
        let pair = PortPair::new(udp_port, tcp_port);
        assert!(!is_port_pair_free(pair));
        assert!(check_port_pair_available(pair).is_err());
    }
}
