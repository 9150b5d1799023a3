use childproc_core::{
    DescriptorPlan, Input, InputFeeder, PipeMultiplexer, ReadBatch, StreamId, Timings,
};
use std::io;
use std::process::{Child, Command};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use childproc_core::{Descriptor, FeedOutcome};
    use nix::errno::Errno;
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
    use nix::pty::{Winsize, openpty};
    use nix::sys::termios::Termios;
    use std::fs::{File, OpenOptions};
    use std::io::Read;
    use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
    use std::os::unix::process::CommandExt;
    use std::process::Stdio;
    use tracing::{debug, trace, warn};

    /// Descriptor number the side channel is exposed on inside the child
    const SIDE_CHANNEL_FD: RawFd = 3;

    /// Pipe multiplexer backed by non-blocking descriptors and `poll(2)`
    pub struct UnixPipes {
        plan: DescriptorPlan,
        timings: Timings,
        feeder: InputFeeder,
        stdin: Option<File>,
        readers: Vec<(StreamId, File)>,
        pty: Option<PtyPair>,
        side_channel: Option<SideChannel>,
        unblocked: bool,
    }

    struct PtyPair {
        master: OwnedFd,
        slave: Option<OwnedFd>,
    }

    struct SideChannel {
        read: OwnedFd,
        write: Option<OwnedFd>,
    }

    impl UnixPipes {
        pub fn new(plan: DescriptorPlan, input: Input, timings: Timings) -> Self {
            let feeder = InputFeeder::new(input, timings.chunk_size);
            Self {
                plan,
                timings,
                feeder,
                stdin: None,
                readers: Vec::new(),
                pty: None,
                side_channel: None,
                unblocked: false,
            }
        }

        fn stdio_for(&mut self, descriptor: &Descriptor, writable: bool) -> io::Result<Stdio> {
            Ok(match descriptor {
                Descriptor::Pipe => Stdio::piped(),
                Descriptor::Null => Stdio::null(),
                Descriptor::Tty => {
                    let tty = OpenOptions::new()
                        .read(!writable)
                        .write(writable)
                        .open("/dev/tty")?;
                    Stdio::from(tty)
                }
                Descriptor::Pty => {
                    if self.pty.is_none() {
                        let pty = openpty(None::<&Winsize>, None::<&Termios>)
                            .map_err(io::Error::from)?;
                        set_cloexec(pty.master.as_raw_fd(), true)?;
                        set_cloexec(pty.slave.as_raw_fd(), true)?;
                        self.pty = Some(PtyPair {
                            master: pty.master,
                            slave: Some(pty.slave),
                        });
                    }
                    let slave = self
                        .pty
                        .as_ref()
                        .and_then(|pair| pair.slave.as_ref())
                        .ok_or_else(|| io::Error::other("pty slave already released"))?;
                    Stdio::from(slave.try_clone()?)
                }
                Descriptor::TempFile => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "temporary file redirection is not used on Unix",
                    ));
                }
            })
        }

        fn unblock(&mut self) -> io::Result<()> {
            if self.unblocked {
                return Ok(());
            }
            if let Some(stdin) = &self.stdin {
                set_nonblocking(stdin.as_raw_fd())?;
            }
            for (_, reader) in &self.readers {
                set_nonblocking(reader.as_raw_fd())?;
            }
            self.unblocked = true;
            Ok(())
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

        /// Read every ready stream; returns the ordered chunks and the streams at EOF
        fn drain(&mut self, ready: &[bool], close: bool) -> (ReadBatch, Vec<usize>) {
            let chunk_size = self.timings.chunk_size;
            let mut batch = ReadBatch::new();
            let mut finished = Vec::new();
            let mut chunk = vec![0u8; chunk_size];

            for (index, (stream, reader)) in self.readers.iter_mut().enumerate() {
                if !ready.get(index).copied().unwrap_or(false) {
                    continue;
                }

                let mut data = Vec::new();
                let mut eof = false;
                loop {
                    match reader.read(&mut chunk) {
                        Ok(0) => {
                            eof = true;
                            break;
                        }
                        Ok(n) => {
                            data.extend_from_slice(&chunk[..n]);
                            if !close && n < chunk_size {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        // A pty master reports EIO once the slave side is gone
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                            eof = true;
                            break;
                        }
                        Err(e) => {
                            warn!(stream = ?stream, error = %e, "Read from child stream failed");
                            eof = true;
                            break;
                        }
                    }
                }

                if !data.is_empty() {
                    batch.push((*stream, data));
                }
                if eof && close {
                    finished.push(index);
                }
            }

            (batch, finished)
        }
    }

    impl PipeMultiplexer for UnixPipes {
        fn descriptor_plan(&self) -> &DescriptorPlan {
            &self.plan
        }

        fn configure(&mut self, command: &mut Command) -> io::Result<()> {
            let plan = self.plan.clone();
            let stdin = self.stdio_for(&plan.stdin, false)?;
            let stdout = self.stdio_for(&plan.stdout, true)?;
            let stderr = self.stdio_for(&plan.stderr, true)?;
            command.stdin(stdin).stdout(stdout).stderr(stderr);

            if plan.side_channel {
                let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
                set_cloexec(read.as_raw_fd(), true)?;
                set_cloexec(write.as_raw_fd(), true)?;

                let write_fd = write.as_raw_fd();
                // SAFETY: only async-signal-safe libc calls run between fork and exec
                unsafe {
                    command.pre_exec(move || {
                        if write_fd == SIDE_CHANNEL_FD {
                            let flags = libc::fcntl(write_fd, libc::F_GETFD);
                            if flags < 0
                                || libc::fcntl(write_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC)
                                    < 0
                            {
                                return Err(io::Error::last_os_error());
                            }
                        } else if libc::dup2(write_fd, SIDE_CHANNEL_FD) < 0 {
                            return Err(io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }

                self.side_channel = Some(SideChannel {
                    read,
                    write: Some(write),
                });
            }

            Ok(())
        }

        fn bind(&mut self, child: &mut Child) -> io::Result<()> {
            if let Some(stdin) = child.stdin.take() {
                self.stdin = Some(File::from(OwnedFd::from(stdin)));
            }
            if let Some(stdout) = child.stdout.take() {
                self.readers
                    .push((StreamId::Stdout, File::from(OwnedFd::from(stdout))));
            }
            if let Some(stderr) = child.stderr.take() {
                self.readers
                    .push((StreamId::Stderr, File::from(OwnedFd::from(stderr))));
            }

            if let Some(mut pair) = self.pty.take() {
                // The parent must not hold the slave or EOF never arrives
                pair.slave = None;
                if self.plan.stdin == Descriptor::Pty {
                    self.stdin = Some(File::from(pair.master.try_clone()?));
                }
                self.readers.push((StreamId::Stdout, File::from(pair.master)));
            }

            if let Some(mut side_channel) = self.side_channel.take() {
                side_channel.write = None;
                self.readers
                    .push((StreamId::SideChannel, File::from(side_channel.read)));
            }

            debug!(
                readers = self.readers.len(),
                stdin = self.stdin.is_some(),
                "Bound child pipes"
            );
            Ok(())
        }

        fn read_and_write(&mut self, blocking: bool, close: bool) -> io::Result<ReadBatch> {
            self.unblock()?;
            self.write();

            let wants_write = self.stdin.is_some() && self.feeder.has_pending();
            if self.readers.is_empty() && !wants_write {
                return Ok(ReadBatch::new());
            }

            let timeout = if blocking {
                let millis = self.timings.poll_quantum().as_millis().min(u16::MAX as u128);
                PollTimeout::from(millis as u16)
            } else {
                PollTimeout::ZERO
            };

            let (ready, stdin_ready) = {
                let mut fds: Vec<PollFd<'_>> = self
                    .readers
                    .iter()
                    .map(|(_, reader)| PollFd::new(reader.as_fd(), PollFlags::POLLIN))
                    .collect();
                if wants_write {
                    if let Some(stdin) = &self.stdin {
                        fds.push(PollFd::new(stdin.as_fd(), PollFlags::POLLOUT));
                    }
                }

                match poll(&mut fds, timeout) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => return Ok(ReadBatch::new()),
                    Err(e) => {
                        warn!(error = %e, "poll() on child pipes failed, closing them");
                        drop(fds);
                        self.close();
                        return Ok(ReadBatch::new());
                    }
                }

                let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                let ready: Vec<bool> = fds
                    .iter()
                    .take(self.readers.len())
                    .map(|fd| fd.revents().is_some_and(|events| events.intersects(readable)))
                    .collect();
                let stdin_ready = wants_write
                    && fds.last().and_then(|fd| fd.revents()).is_some_and(|events| {
                        events.intersects(PollFlags::POLLOUT | PollFlags::POLLERR)
                    });
                (ready, stdin_ready)
            };

            if stdin_ready {
                self.write();
            }

            let (batch, finished) = self.drain(&ready, close);
            for index in finished.into_iter().rev() {
                let (stream, _) = self.readers.remove(index);
                trace!(stream = ?stream, "Child stream reached end of file");
            }

            Ok(batch)
        }

        fn are_open(&self) -> bool {
            self.stdin.is_some() || !self.readers.is_empty()
        }

        fn is_stream_open(&self, stream: StreamId) -> bool {
            self.readers.iter().any(|(id, _)| *id == stream)
        }

        fn close(&mut self) {
            self.stdin = None;
            self.readers.clear();
            self.pty = None;
            self.side_channel = None;
        }
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if enabled {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Whether a pseudo-terminal can be allocated on this host
    pub fn probe_pty() -> bool {
        openpty(None::<&Winsize>, None::<&Termios>).is_ok()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use childproc_core::{Capabilities, LaunchSpec, PipeStrategy};

        fn is_cloexec(fd: RawFd) -> bool {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            flags >= 0 && flags & libc::FD_CLOEXEC != 0
        }

        #[test]
        fn test_parent_pty_descriptors_are_not_inherited() {
            if !probe_pty() {
                return;
            }
            let spec = LaunchSpec::builder().command("unused").pty(true).build().unwrap();
            let caps = Capabilities::new(PipeStrategy::Posix, true, false);
            let plan = DescriptorPlan::resolve(&spec, &caps).unwrap();
            let mut pipes = UnixPipes::new(plan, Input::None, Timings::default());
            pipes.configure(&mut Command::new("unused")).unwrap();

            let pair = pipes.pty.as_ref().unwrap();
            assert!(is_cloexec(pair.master.as_raw_fd()));
            assert!(is_cloexec(pair.slave.as_ref().unwrap().as_raw_fd()));
        }

        #[test]
        fn test_side_channel_ends_are_not_inherited() {
            let spec = LaunchSpec::builder()
                .command("unused")
                .sigchild_compat(true)
                .build()
                .unwrap();
            let caps = Capabilities::new(PipeStrategy::Posix, false, false);
            let plan = DescriptorPlan::resolve(&spec, &caps).unwrap();
            let mut pipes = UnixPipes::new(plan, Input::None, Timings::default());
            pipes.configure(&mut Command::new("unused")).unwrap();

            let channel = pipes.side_channel.as_ref().unwrap();
            assert!(is_cloexec(channel.read.as_raw_fd()));
            assert!(is_cloexec(channel.write.as_ref().unwrap().as_raw_fd()));
        }
    }

    /// Whether the process has a controlling terminal to hand to children
    pub fn probe_tty() -> bool {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/tty")
            .is_ok()
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixPipes, probe_pty, probe_tty};

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixPipes {
    plan: DescriptorPlan,
}

#[cfg(not(unix))]
impl UnixPipes {
    pub fn new(plan: DescriptorPlan, _input: Input, _timings: Timings) -> Self {
        Self { plan }
    }
}

#[cfg(not(unix))]
impl PipeMultiplexer for UnixPipes {
    fn descriptor_plan(&self) -> &DescriptorPlan {
        &self.plan
    }

    fn configure(&mut self, _command: &mut Command) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Unix pipes are not available on this platform",
        ))
    }

    fn bind(&mut self, _child: &mut Child) -> io::Result<()> {
        Ok(())
    }

    fn read_and_write(&mut self, _blocking: bool, _close: bool) -> io::Result<ReadBatch> {
        Ok(ReadBatch::new())
    }

    fn are_open(&self) -> bool {
        false
    }

    fn is_stream_open(&self, _stream: StreamId) -> bool {
        false
    }

    fn close(&mut self) {}
}

#[cfg(not(unix))]
pub fn probe_pty() -> bool {
    false
}

#[cfg(not(unix))]
pub fn probe_tty() -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use childproc_core::{Capabilities, LaunchSpec, PipeStrategy};
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    fn plan_for(spec: &LaunchSpec) -> DescriptorPlan {
        let caps = Capabilities::new(PipeStrategy::Posix, true, false);
        DescriptorPlan::resolve(spec, &caps).unwrap()
    }

    /// Spawn `script` through the pipes and collect everything until all streams close
    fn collect(spec: &LaunchSpec, script: &str) -> HashMap<StreamId, Vec<u8>> {
        let mut pipes = UnixPipes::new(plan_for(spec), spec.input.clone(), spec.timings.clone());
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        pipes.configure(&mut command).unwrap();
        let mut child = command.spawn().unwrap();
        drop(command);
        pipes.bind(&mut child).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut collected: HashMap<StreamId, Vec<u8>> = HashMap::new();
        while pipes.are_open() && Instant::now() < deadline {
            for (stream, data) in pipes.read_and_write(true, true).unwrap() {
                collected.entry(stream).or_default().extend(data);
            }
        }
        child.wait().unwrap();
        assert!(!pipes.are_open());
        collected
    }

    #[test]
    fn test_stdout_and_stderr_are_separated() {
        let spec = LaunchSpec::new("unused").unwrap();
        let out = collect(&spec, "echo out; echo err >&2");
        assert_eq!(out[&StreamId::Stdout], b"out\n");
        assert_eq!(out[&StreamId::Stderr], b"err\n");
    }

    #[test]
    fn test_large_input_round_trips_through_cat() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(256 * 1024).collect();
        let spec = LaunchSpec::builder()
            .command("cat")
            .input(payload.clone())
            .build()
            .unwrap();
        let out = collect(&spec, "cat");
        assert_eq!(out[&StreamId::Stdout], payload);
    }

    #[test]
    fn test_side_channel_receives_fd3_writes() {
        let spec = LaunchSpec::builder()
            .command("unused")
            .sigchild_compat(true)
            .build()
            .unwrap();
        let out = collect(&spec, "echo 1234 >&3; echo visible");
        assert_eq!(out[&StreamId::SideChannel], b"1234\n");
        assert_eq!(out[&StreamId::Stdout], b"visible\n");
    }

    #[test]
    fn test_disabled_output_reads_nothing() {
        let spec = LaunchSpec::builder()
            .command("unused")
            .output_disabled(true)
            .build()
            .unwrap();
        let out = collect(&spec, "echo ignored");
        assert!(out.is_empty());
    }

    #[test]
    fn test_pty_merges_streams() {
        if !probe_pty() {
            return;
        }
        let spec = LaunchSpec::builder()
            .command("unused")
            .pty(true)
            .build()
            .unwrap();
        let out = collect(&spec, "echo from-pty");
        let stdout = String::from_utf8_lossy(&out[&StreamId::Stdout]).to_string();
        assert!(stdout.contains("from-pty"));
        assert!(!out.contains_key(&StreamId::Stderr));
    }

    #[test]
    fn test_non_blocking_pass_returns_immediately() {
        let spec = LaunchSpec::new("unused").unwrap();
        let mut pipes = UnixPipes::new(plan_for(&spec), Input::None, Timings::default());
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("sleep 1");
        pipes.configure(&mut command).unwrap();
        let mut child = command.spawn().unwrap();
        drop(command);
        pipes.bind(&mut child).unwrap();

        let started = Instant::now();
        let batch = pipes.read_and_write(false, false).unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(pipes.is_stream_open(StreamId::Stdout));

        pipes.close();
        assert!(!pipes.are_open());
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
