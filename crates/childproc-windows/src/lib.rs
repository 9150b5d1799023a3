mod shell;
mod windows_pipes;
mod windows_signal;

pub use shell::{CMD_FLAGS, shell_command};
pub use windows_pipes::WindowsPipes;
pub use windows_signal::WindowsSignalDispatcher;

use childproc_core::{Capabilities, PipeStrategy};

pub struct WindowsPlatform;

impl WindowsPlatform {
    /// Temp-file tailing, no pseudo-terminals and no tty passthrough
    pub fn capabilities() -> Capabilities {
        Capabilities::new(PipeStrategy::TempFiles, false, false)
    }

    pub fn platform_name() -> &'static str {
        "Windows"
    }
}
