use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A byte source shared between a spec and the handles launched from it
#[derive(Clone)]
pub struct SharedReader(Arc<Mutex<Box<dyn Read + Send>>>);

impl SharedReader {
    pub fn new(reader: Box<dyn Read + Send>) -> SharedReader {
        SharedReader(Arc::new(Mutex::new(reader)))
    }

    /// Read up to `buf.len()` bytes from the underlying source
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| io::Error::other("input reader lock poisoned"))?;
        guard.read(buf)
    }
}

/// What gets fed to the child's standard input
#[derive(Clone, Default)]
pub enum Input {
    #[default]
    None,
    Bytes(Vec<u8>),
    Reader(SharedReader),
}

impl Input {
    pub fn reader<R: Read + Send + 'static>(reader: R) -> Self {
        Input::Reader(SharedReader::new(Box::new(reader)))
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::None => write!(f, "None"),
            Input::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Input::Reader(_) => write!(f, "Reader"),
        }
    }
}

impl From<Vec<u8>> for Input {
    fn from(bytes: Vec<u8>) -> Self {
        Input::Bytes(bytes)
    }
}

impl From<&[u8]> for Input {
    fn from(bytes: &[u8]) -> Self {
        Input::Bytes(bytes.to_vec())
    }
}

impl From<String> for Input {
    fn from(text: String) -> Self {
        Input::Bytes(text.into_bytes())
    }
}

impl From<&str> for Input {
    fn from(text: &str) -> Self {
        Input::Bytes(text.as_bytes().to_vec())
    }
}

impl From<SharedReader> for Input {
    fn from(reader: SharedReader) -> Self {
        Input::Reader(reader)
    }
}

/// Result of one attempt to push pending input into the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Bytes are still queued or the source may yield more; keep stdin open
    Pending,
    /// Every byte has been written and the source is drained; stdin can be closed
    Exhausted,
}

/// Moves bytes from the configured input into a non-blocking stdin
///
/// Bytes that the pipe refuses stay queued in `pending` until the next pass,
/// so nothing read from the source is ever lost.
pub struct InputFeeder {
    pending: Vec<u8>,
    source: Option<SharedReader>,
    chunk_size: usize,
}

impl InputFeeder {
    pub fn new(input: Input, chunk_size: usize) -> Self {
        let (pending, source) = match input {
            Input::None => (Vec::new(), None),
            Input::Bytes(bytes) => (bytes, None),
            Input::Reader(reader) => (Vec::new(), Some(reader)),
        };

        Self {
            pending,
            source,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.source.is_some()
    }

    /// Queued bytes that have not reached the child yet
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Write as much input as the pipe accepts right now
    ///
    /// Stops at the first partial write. A child that closed its end of the
    /// pipe cannot receive anything more, so the remaining input is discarded
    /// and the feeder reports itself exhausted.
    pub fn feed<W: Write>(&mut self, stdin: &mut W) -> io::Result<FeedOutcome> {
        match self.feed_inner(stdin) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(
                    discarded = self.pending.len(),
                    "Child closed its standard input, dropping remaining input"
                );
                self.pending.clear();
                self.source = None;
                Ok(FeedOutcome::Exhausted)
            }
            other => other,
        }
    }

    fn feed_inner<W: Write>(&mut self, stdin: &mut W) -> io::Result<FeedOutcome> {
        if !self.pending.is_empty() {
            let written = write_some(stdin, &self.pending)?;
            self.pending.drain(..written);
            if !self.pending.is_empty() {
                return Ok(FeedOutcome::Pending);
            }
        }

        if let Some(source) = self.source.clone() {
            let mut chunk = vec![0u8; self.chunk_size];
            loop {
                let read = match source.read(&mut chunk) {
                    Ok(0) => {
                        self.source = None;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                };

                let written = write_some(stdin, &chunk[..read])?;
                if written < read {
                    self.pending.extend_from_slice(&chunk[written..read]);
                    return Ok(FeedOutcome::Pending);
                }
            }
        }

        if self.has_pending() {
            Ok(FeedOutcome::Pending)
        } else {
            Ok(FeedOutcome::Exhausted)
        }
    }
}

/// One write attempt; a full pipe counts as zero bytes written
fn write_some<W: Write>(stdin: &mut W, data: &[u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < data.len() {
        match stdin.write(&data[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
