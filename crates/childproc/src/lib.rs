//! Launch and supervise child processes
//!
//! A [`Process`] runs a shell command line, feeds its standard input, captures
//! its output without deadlocking, enforces a run and an idle timeout and
//! reconciles how the child ended. The pipe multiplexer and the signal
//! dispatcher are selected for the target OS at compile time.
//!
//! ```no_run
//! use childproc::{LaunchSpec, Process, probe_capabilities};
//!
//! let caps = probe_capabilities();
//! let mut process = Process::new(LaunchSpec::new("echo hello")?, caps)?;
//! process.run(None)?;
//! assert_eq!(process.output()?, b"hello\n");
//! # Ok::<(), childproc::ProcessError>(())
//! ```

mod platform;
mod process;

pub use platform::{
    PlatformPipes, PlatformSignalDispatcher, native_strategy, platform_name, probe_capabilities,
};
pub use process::Process;

// Re-export core functionality
pub use childproc_core::*;
