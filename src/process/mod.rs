//! Process management utilities.

mod control;
mod supervisor;

pub use control::{
    check_port_pair_available, force_kill, graceful_signal, is_port_pair_free, is_process_alive,
};
pub use supervisor::{ProcessHandle, Supervisor};
