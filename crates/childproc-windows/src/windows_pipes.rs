use childproc_core::{
    Descriptor, DescriptorPlan, FeedOutcome, Input, InputFeeder, PipeMultiplexer, ReadBatch,
    StreamId, Timings,
};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Two hex digits worth of name suffixes
const MAX_NAME_ATTEMPTS: u32 = 256;

/// Retry interval for a non-blocking stdin that had no room
const STDIN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// One redirected output stream, read back by offset
struct TailedFile {
    stream: StreamId,
    path: PathBuf,
    reader: Option<File>,
    offset: u64,
}

/// Pipe multiplexer that redirects child output into temporary files
///
/// Anonymous pipes cannot be polled without blocking on Windows, so output
/// goes to files the parent tails by offset; only stdin stays a pipe.
pub struct WindowsPipes {
    plan: DescriptorPlan,
    timings: Timings,
    feeder: InputFeeder,
    temp_dir: PathBuf,
    stdin: Option<ChildStdin>,
    files: Vec<TailedFile>,
    /// Every file created, kept for removal on drop
    created: Vec<PathBuf>,
}

impl WindowsPipes {
    pub fn new(plan: DescriptorPlan, input: Input, timings: Timings) -> Self {
        Self::in_dir(plan, input, timings, std::env::temp_dir())
    }

    /// Same as [`WindowsPipes::new`] with temporary files placed in `temp_dir`
    pub fn in_dir(
        plan: DescriptorPlan,
        input: Input,
        timings: Timings,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        let feeder = InputFeeder::new(input, timings.chunk_size);
        Self {
            plan,
            timings,
            feeder,
            temp_dir: temp_dir.into(),
            stdin: None,
            files: Vec::new(),
            created: Vec::new(),
        }
    }

    /// Exclusively create the `.out`/`.err` pair, moving to the next suffix on collision
    fn create_temp_files(&mut self) -> io::Result<(File, File)> {
        let parent = std::process::id();

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let out_path = temp_file_path(&self.temp_dir, parent, attempt, "out");
            let out = match create_exclusive(&out_path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            };

            let err_path = temp_file_path(&self.temp_dir, parent, attempt, "err");
            let err = match create_exclusive(&err_path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    drop(out);
                    let _ = fs::remove_file(&out_path);
                    continue;
                }
                Err(e) => {
                    drop(out);
                    let _ = fs::remove_file(&out_path);
                    return Err(e);
                }
            };

            debug!(
                stdout = %out_path.display(),
                stderr = %err_path.display(),
                "Created temporary output files"
            );
            self.created.push(out_path);
            self.created.push(err_path);
            return Ok((out, err));
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "A temporary file could not be opened to write the process output in {}",
                self.temp_dir.display()
            ),
        ))
    }

    fn output_stdio(&mut self, descriptor: &Descriptor, stream: StreamId) -> io::Result<Stdio> {
        match descriptor {
            Descriptor::Null => Ok(Stdio::null()),
            Descriptor::TempFile => {
                if self.created.is_empty() {
                    let (out, err) = self.create_temp_files()?;
                    self.files.push(TailedFile {
                        stream: StreamId::Stdout,
                        path: self.created[0].clone(),
                        reader: Some(File::open(&self.created[0])?),
                        offset: 0,
                    });
                    self.files.push(TailedFile {
                        stream: StreamId::Stderr,
                        path: self.created[1].clone(),
                        reader: Some(File::open(&self.created[1])?),
                        offset: 0,
                    });
                    return Ok(Stdio::from(if stream == StreamId::Stdout { out } else { err }));
                }
                let index = if stream == StreamId::Stdout { 0 } else { 1 };
                let writer = OpenOptions::new().append(true).open(&self.created[index])?;
                Ok(Stdio::from(writer))
            }
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{other:?} descriptors are not supported on Windows"),
            )),
        }
    }

    fn wants_write(&self) -> bool {
        self.stdin.is_some() && self.feeder.has_pending()
    }

    /// Keep retrying pending input for at most one quantum
    ///
    /// A `PIPE_NOWAIT` pipe cannot be waited on, so writability is polled by
    /// writing again. Returns as soon as stdin has nothing left to take.
    fn wait_for_stdin(&mut self) {
        let deadline = Instant::now() + self.timings.poll_quantum();
        while self.wants_write() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(STDIN_RETRY_INTERVAL.min(deadline - now));
            self.write();
        }
    }

    fn write(&mut self) {
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };

        match self.feeder.feed(stdin) {
            Ok(FeedOutcome::Pending) => {}
            Ok(FeedOutcome::Exhausted) => {
                trace!("Input exhausted, closing child stdin");
                self.stdin = None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to write to child stdin, closing it");
                self.stdin = None;
            }
        }
    }
}

impl PipeMultiplexer for WindowsPipes {
    fn descriptor_plan(&self) -> &DescriptorPlan {
        &self.plan
    }

    fn backing_files(&self) -> Vec<PathBuf> {
        self.created.clone()
    }

    fn configure(&mut self, command: &mut Command) -> io::Result<()> {
        let plan = self.plan.clone();
        let stdin = match plan.stdin {
            Descriptor::Pipe => Stdio::piped(),
            Descriptor::Null => Stdio::null(),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("{other:?} stdin is not supported on Windows"),
                ));
            }
        };
        let stdout = self.output_stdio(&plan.stdout, StreamId::Stdout)?;
        let stderr = self.output_stdio(&plan.stderr, StreamId::Stderr)?;
        command.stdin(stdin).stdout(stdout).stderr(stderr);
        Ok(())
    }

    fn bind(&mut self, child: &mut Child) -> io::Result<()> {
        if let Some(stdin) = child.stdin.take() {
            set_no_wait(&stdin)?;
            self.stdin = Some(stdin);
        }
        Ok(())
    }

    fn read_and_write(&mut self, blocking: bool, close: bool) -> io::Result<ReadBatch> {
        self.write();

        if blocking {
            if self.wants_write() {
                self.wait_for_stdin();
            } else if !self.files.is_empty() {
                std::thread::sleep(self.timings.poll_quantum());
            }
        }

        let mut batch = ReadBatch::new();
        for file in &mut self.files {
            let Some(reader) = file.reader.as_mut() else {
                continue;
            };

            reader.seek(SeekFrom::Start(file.offset))?;
            let mut data = Vec::new();
            let read = reader.read_to_end(&mut data)?;
            file.offset += read as u64;

            if !data.is_empty() {
                trace!(
                    stream = ?file.stream,
                    path = %file.path.display(),
                    bytes = read,
                    "Read from temporary file"
                );
                batch.push((file.stream, data));
            }
        }

        if close {
            for file in &mut self.files {
                file.reader = None;
            }
            self.files.clear();
        }

        Ok(batch)
    }

    fn are_open(&self) -> bool {
        self.stdin.is_some() || !self.files.is_empty()
    }

    fn is_stream_open(&self, stream: StreamId) -> bool {
        self.files
            .iter()
            .any(|file| file.stream == stream && file.reader.is_some())
    }

    fn close(&mut self) {
        self.stdin = None;
        self.files.clear();
    }
}

impl Drop for WindowsPipes {
    fn drop(&mut self) {
        self.close();
        for path in self.created.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove temporary output file");
            }
        }
    }
}

fn temp_file_path(dir: &Path, parent: u32, attempt: u32, extension: &str) -> PathBuf {
    dir.join(format!("childproc_{parent}_{attempt:02X}.{extension}"))
}

fn create_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Put the parent end of an anonymous pipe in non-blocking mode
#[cfg(windows)]
fn set_no_wait(stdin: &ChildStdin) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Pipes::{PIPE_NOWAIT, SetNamedPipeHandleState};

    let mode = PIPE_NOWAIT;
    // SAFETY: the handle is owned by `stdin` and stays open for the call
    unsafe {
        SetNamedPipeHandleState(
            HANDLE(stdin.as_raw_handle()),
            Some(&mode as *const _),
            None,
            None,
        )
    }
    .map_err(|e| io::Error::other(format!("Failed to make stdin non-blocking: {e}")))
}

#[cfg(not(windows))]
fn set_no_wait(_stdin: &ChildStdin) -> io::Result<()> {
    Ok(())
}
