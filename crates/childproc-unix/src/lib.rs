mod shell;
mod unix_pipes;
mod unix_signal;

pub use shell::{shell_command, sigchild_wrapper};
pub use unix_pipes::{UnixPipes, probe_pty, probe_tty};
pub use unix_signal::UnixSignalDispatcher;

use childproc_core::{Capabilities, PipeStrategy};

pub struct UnixPlatform;

impl UnixPlatform {
    /// Probe what this host offers to child processes
    pub fn capabilities() -> Capabilities {
        Capabilities::new(PipeStrategy::Posix, probe_pty(), probe_tty())
    }

    pub fn platform_name() -> &'static str {
        "Unix"
    }
}
