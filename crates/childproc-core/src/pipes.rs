use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};

use crate::config::LaunchSpec;
use crate::error::{ProcessError, Result};

/// How child output reaches the parent on the current platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStrategy {
    /// Non-blocking anonymous pipes multiplexed with a readiness wait
    Posix,
    /// Output redirected into temporary files that are tailed by offset
    TempFiles,
}

/// What the host can offer a launch
///
/// Probed once by the facade crate and passed explicitly to every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub strategy: PipeStrategy,
    pub pty_supported: bool,
    pub tty_supported: bool,
}

impl Capabilities {
    pub fn new(strategy: PipeStrategy, pty_supported: bool, tty_supported: bool) -> Self {
        Self {
            strategy,
            pty_supported,
            tty_supported,
        }
    }
}

/// Where one of the child's standard streams is connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    /// Anonymous pipe owned by the parent
    Pipe,
    /// The null device
    Null,
    /// The controlling terminal of the parent
    Tty,
    /// One side of a freshly allocated pseudo-terminal
    Pty,
    /// A temporary file the parent tails
    TempFile,
}

/// Wiring decided for one launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPlan {
    pub stdin: Descriptor,
    pub stdout: Descriptor,
    pub stderr: Descriptor,
    /// Extra pipe on descriptor 3 carrying the real pid and exit code
    pub side_channel: bool,
}

impl DescriptorPlan {
    /// Pick the descriptors for `spec` given what the host supports
    ///
    /// Precedence: disabled output, then tty, then pty (if supported), then
    /// the strategy's default.
    pub fn resolve(spec: &LaunchSpec, caps: &Capabilities) -> Result<Self> {
        if spec.tty && !caps.tty_supported {
            return Err(ProcessError::configuration(
                "TTY mode is not supported on this host.",
            ));
        }

        let side_channel = spec.sigchild_compat && caps.strategy == PipeStrategy::Posix;

        let (stdin, stdout, stderr) = if spec.output_disabled {
            (Descriptor::Pipe, Descriptor::Null, Descriptor::Null)
        } else if spec.tty {
            (Descriptor::Tty, Descriptor::Tty, Descriptor::Tty)
        } else if spec.pty && caps.pty_supported {
            (Descriptor::Pty, Descriptor::Pty, Descriptor::Pty)
        } else {
            match caps.strategy {
                PipeStrategy::Posix => (Descriptor::Pipe, Descriptor::Pipe, Descriptor::Pipe),
                PipeStrategy::TempFiles => {
                    (Descriptor::Pipe, Descriptor::TempFile, Descriptor::TempFile)
                }
            }
        };

        Ok(Self {
            stdin,
            stdout,
            stderr,
            side_channel,
        })
    }

    /// Whether any output stream is read back by the parent
    pub fn captures_output(&self) -> bool {
        self.stdout.is_captured() || self.stderr.is_captured()
    }
}

impl Descriptor {
    pub fn is_captured(&self) -> bool {
        matches!(self, Descriptor::Pipe | Descriptor::Pty | Descriptor::TempFile)
    }
}

/// Logical stream a chunk of data was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Stdout,
    Stderr,
    SideChannel,
}

/// Data gathered during one multiplexing pass, in read order
pub type ReadBatch = Vec<(StreamId, Vec<u8>)>;

/// Moves bytes between the parent and a running child
///
/// The controller drives an implementation through `configure` (before
/// spawn), `bind` (right after spawn) and repeated `read_and_write` passes.
pub trait PipeMultiplexer {
    fn descriptor_plan(&self) -> &DescriptorPlan;

    /// Files standing in for output pipes, empty for true streaming pipes
    fn backing_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Attach the child side of every descriptor to `command`
    fn configure(&mut self, command: &mut Command) -> io::Result<()>;

    /// Take ownership of the parent side of the pipes of a spawned child
    fn bind(&mut self, child: &mut Child) -> io::Result<()>;

    /// Push pending input and collect whatever output is available
    ///
    /// With `blocking` the pass may wait up to one poll quantum for
    /// readiness. With `close` streams that reached end-of-file are closed.
    fn read_and_write(&mut self, blocking: bool, close: bool) -> io::Result<ReadBatch>;

    /// True while at least one stream is still open
    fn are_open(&self) -> bool;

    fn is_stream_open(&self, stream: StreamId) -> bool;

    /// Close every remaining stream
    fn close(&mut self);
}
