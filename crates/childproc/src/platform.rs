use childproc_core::{
    Capabilities, DeliveryResult, DescriptorPlan, Input, PipeMultiplexer, PipeStrategy, ProcessId,
    ReadBatch, SignalDispatcher, StreamId, Timings,
};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};
use tracing::debug;

/// Pipe multiplexer selected for the target OS
pub enum PlatformPipes {
    #[cfg(unix)]
    Unix(childproc_unix::UnixPipes),
    #[cfg(windows)]
    Windows(childproc_windows::WindowsPipes),
}

impl PlatformPipes {
    pub fn new(plan: DescriptorPlan, input: Input, timings: Timings) -> Self {
        #[cfg(unix)]
        {
            Self::Unix(childproc_unix::UnixPipes::new(plan, input, timings))
        }

        #[cfg(windows)]
        {
            Self::Windows(childproc_windows::WindowsPipes::new(plan, input, timings))
        }

        #[cfg(not(any(unix, windows)))]
        {
            compile_error!("Unsupported platform: only Unix and Windows are currently supported");
        }
    }
}

impl PipeMultiplexer for PlatformPipes {
    fn descriptor_plan(&self) -> &DescriptorPlan {
        match self {
            #[cfg(unix)]
            Self::Unix(pipes) => pipes.descriptor_plan(),
            #[cfg(windows)]
            Self::Windows(pipes) => pipes.descriptor_plan(),
        }
    }

    fn backing_files(&self) -> Vec<PathBuf> {
        match self {
            #[cfg(unix)]
            Self::Unix(pipes) => pipes.backing_files(),
            #[cfg(windows)]
            Self::Windows(pipes) => pipes.backing_files(),
        }
    }

    fn configure(&mut self, command: &mut Command) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(pipes) => pipes.configure(command),
            #[cfg(windows)]
            Self::Windows(pipes) => pipes.configure(command),
        }
    }

    fn bind(&mut self, child: &mut Child) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(pipes) => pipes.bind(child),
            #[cfg(windows)]
            Self::Windows(pipes) => pipes.bind(child),
        }
    }

    fn read_and_write(&mut self, blocking: bool, close: bool) -> io::Result<ReadBatch> {
        match self {
            #[cfg(unix)]
            Self::Unix(pipes) => pipes.read_and_write(blocking, close),
            #[cfg(windows)]
            Self::Windows(pipes) => pipes.read_and_write(blocking, close),
        }
    }

    fn are_open(&self) -> bool {
        match self {
            #[cfg(unix)]
            Self::Unix(pipes) => pipes.are_open(),
            #[cfg(windows)]
            Self::Windows(pipes) => pipes.are_open(),
        }
    }

    fn is_stream_open(&self, stream: StreamId) -> bool {
        match self {
            #[cfg(unix)]
            Self::Unix(pipes) => pipes.is_stream_open(stream),
            #[cfg(windows)]
            Self::Windows(pipes) => pipes.is_stream_open(stream),
        }
    }

    fn close(&mut self) {
        match self {
            #[cfg(unix)]
            Self::Unix(pipes) => pipes.close(),
            #[cfg(windows)]
            Self::Windows(pipes) => pipes.close(),
        }
    }
}

/// Signal dispatcher selected for the target OS
pub enum PlatformSignalDispatcher {
    #[cfg(unix)]
    Unix(childproc_unix::UnixSignalDispatcher),
    #[cfg(windows)]
    Windows(childproc_windows::WindowsSignalDispatcher),
}

impl PlatformSignalDispatcher {
    /// `via_utility` routes POSIX signals through the external `kill` program
    pub fn new(via_utility: bool) -> Self {
        #[cfg(unix)]
        {
            Self::Unix(childproc_unix::UnixSignalDispatcher::new(via_utility))
        }

        #[cfg(windows)]
        {
            let _ = via_utility;
            Self::Windows(childproc_windows::WindowsSignalDispatcher::new())
        }
    }
}

impl SignalDispatcher for PlatformSignalDispatcher {
    fn deliver(&self, pid: ProcessId, signal: i32) -> DeliveryResult {
        match self {
            #[cfg(unix)]
            Self::Unix(dispatcher) => dispatcher.deliver(pid, signal),
            #[cfg(windows)]
            Self::Windows(dispatcher) => dispatcher.deliver(pid, signal),
        }
    }

    fn terminate_tree(&self, pid: ProcessId) -> DeliveryResult {
        match self {
            #[cfg(unix)]
            Self::Unix(dispatcher) => dispatcher.terminate_tree(pid),
            #[cfg(windows)]
            Self::Windows(dispatcher) => dispatcher.terminate_tree(pid),
        }
    }
}

/// Probe what the host offers to children
///
/// Call once at startup and pass the result to every [`crate::Process`].
pub fn probe_capabilities() -> Capabilities {
    #[cfg(unix)]
    let caps = childproc_unix::UnixPlatform::capabilities();

    #[cfg(windows)]
    let caps = childproc_windows::WindowsPlatform::capabilities();

    debug!(
        platform = platform_name(),
        strategy = ?caps.strategy,
        pty = caps.pty_supported,
        tty = caps.tty_supported,
        "Probed host capabilities"
    );
    caps
}

/// Strategy the pipe multiplexer of this build uses
pub fn native_strategy() -> PipeStrategy {
    #[cfg(unix)]
    {
        PipeStrategy::Posix
    }

    #[cfg(windows)]
    {
        PipeStrategy::TempFiles
    }
}

pub fn platform_name() -> &'static str {
    #[cfg(unix)]
    {
        childproc_unix::UnixPlatform::platform_name()
    }

    #[cfg(windows)]
    {
        childproc_windows::WindowsPlatform::platform_name()
    }

    #[cfg(not(any(unix, windows)))]
    {
        "Unknown"
    }
}

/// Build the shell invocation for a command line
///
/// With `side_channel` the line is wrapped so the real pid and exit code
/// are reported on descriptor 3.
pub(crate) fn shell_command(command_line: &str, side_channel: bool) -> Command {
    #[cfg(unix)]
    {
        if side_channel {
            childproc_unix::shell_command(&childproc_unix::sigchild_wrapper(command_line))
        } else {
            childproc_unix::shell_command(command_line)
        }
    }

    #[cfg(windows)]
    {
        let _ = side_channel;
        childproc_windows::shell_command(command_line)
    }
}
