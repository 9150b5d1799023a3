use childproc_core::{
    Capabilities, DescriptorPlan, ExitStatus, FallbackStatus, OutputBuffer, OutputKind,
    OutputSink, PipeMultiplexer, PipeStrategy, ProcessError, ProcessId, ProcessInfo, ProcessState,
    Result, SIGKILL, SIGTERM, SignalDispatcher, StreamId, TimeoutGuard, exit_code_text,
};
use std::path::PathBuf;
use std::process::Child;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::platform::{self, PlatformPipes, PlatformSignalDispatcher};
use crate::LaunchSpec;

/// One supervised launch of a shell command
///
/// A handle moves `Ready -> Started -> Terminated` exactly once. Use
/// [`Process::restart`] to launch the same [`LaunchSpec`] again.
pub struct Process {
    spec: LaunchSpec,
    caps: Capabilities,
    plan: DescriptorPlan,
    state: ProcessState,
    child: Option<Child>,
    pipes: Option<PlatformPipes>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    sinks: Vec<Box<dyn OutputSink>>,
    guard: Option<TimeoutGuard>,
    info: Option<ProcessInfo>,
    fallback: FallbackStatus,
    /// Side-channel bytes not yet terminated by a newline
    side_channel: Vec<u8>,
    side_channel_lines: usize,
    exit_code: Option<i32>,
    latest_signal: Option<i32>,
    dispatcher: PlatformSignalDispatcher,
}

impl Process {
    /// Create a handle in the `Ready` state
    ///
    /// Fails with a configuration error when `spec` asks for something the
    /// host described by `caps` cannot provide.
    pub fn new(spec: LaunchSpec, caps: Capabilities) -> Result<Self> {
        if caps.strategy != platform::native_strategy() {
            return Err(ProcessError::configuration(format!(
                "The {:?} pipe strategy is not available on {}.",
                caps.strategy,
                platform::platform_name()
            )));
        }

        spec.validate()?;
        let plan = DescriptorPlan::resolve(&spec, &caps)?;
        let dispatcher = PlatformSignalDispatcher::new(plan.side_channel);

        Ok(Self {
            spec,
            caps,
            plan,
            state: ProcessState::Ready,
            child: None,
            pipes: None,
            stdout: OutputBuffer::new(),
            stderr: OutputBuffer::new(),
            sinks: Vec::new(),
            guard: None,
            info: None,
            fallback: FallbackStatus::default(),
            side_channel: Vec::new(),
            side_channel_lines: 0,
            exit_code: None,
            latest_signal: None,
            dispatcher,
        })
    }

    /// Start and wait for the process, returning its exit code
    pub fn run(&mut self, sink: Option<Box<dyn OutputSink>>) -> Result<i32> {
        self.start(sink)?;
        self.wait(None)
    }

    /// Like [`Process::run`], but a non-zero exit code is an error
    pub fn must_run(&mut self, sink: Option<Box<dyn OutputSink>>) -> Result<&mut Self> {
        let code = self.run(sink)?;
        if code != 0 {
            return Err(ProcessError::Failed {
                code,
                text: exit_code_text(code),
            });
        }
        Ok(self)
    }

    /// Launch the process without waiting for it
    pub fn start(&mut self, sink: Option<Box<dyn OutputSink>>) -> Result<()> {
        if self.is_running() {
            return Err(ProcessError::lifecycle("Process is already running"));
        }

        if self.state != ProcessState::Ready {
            return Err(ProcessError::lifecycle(
                "A process handle can only be started once; use restart() to launch it again",
            ));
        }

        if self.spec.output_disabled && sink.is_some() {
            return Err(ProcessError::lifecycle(
                "Output has been disabled, enable it to allow the use of a callback.",
            ));
        }

        self.reset();
        self.sinks.extend(sink);

        let mut pipes = PlatformPipes::new(
            self.plan.clone(),
            self.spec.input.clone(),
            self.spec.timings.clone(),
        );
        let mut command = platform::shell_command(&self.spec.command, self.plan.side_channel);
        if let Some(dir) = &self.spec.working_directory {
            command.current_dir(dir);
        }
        if !self.spec.inherit_env {
            command.env_clear();
        }
        command.envs(&self.spec.env);

        pipes.configure(&mut command).map_err(ProcessError::Launch)?;
        let now = Instant::now();
        let mut child = command.spawn().map_err(ProcessError::Launch)?;
        // Release the parent's copies of the child-side descriptors
        drop(command);

        if let Err(e) = pipes.bind(&mut child) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::Launch(e));
        }

        let pid = child.id();
        info!("Started process {} for `{}`", pid, self.spec.command);

        self.guard = Some(TimeoutGuard::new(
            now,
            self.spec.timeout,
            self.spec.idle_timeout,
        ));
        self.child = Some(child);
        self.pipes = Some(pipes);
        self.info = Some(ProcessInfo::running(pid));
        self.state = ProcessState::Started;

        if self.plan.side_channel {
            self.await_side_channel_pid()?;
        }

        if self.spec.tty {
            return Ok(());
        }

        self.update_status(false)?;
        self.check_timeout()
    }

    /// Build a fresh handle from the same spec and start it
    pub fn restart(&mut self, sink: Option<Box<dyn OutputSink>>) -> Result<Process> {
        if self.is_running() {
            return Err(ProcessError::lifecycle("Process is already running"));
        }

        let mut process = Process::new(self.spec.clone(), self.caps)?;
        process.start(sink)?;
        Ok(process)
    }

    /// Block until the process and all its streams are done
    ///
    /// A supplied sink replaces the one given to `start`.
    pub fn wait(&mut self, sink: Option<Box<dyn OutputSink>>) -> Result<i32> {
        self.require_started("wait")?;
        self.update_status(false)?;

        if let Some(sink) = sink {
            if self.spec.output_disabled {
                return Err(ProcessError::lifecycle(
                    "Output has been disabled, enable it to allow the use of a callback.",
                ));
            }
            self.sinks = vec![sink];
        }

        let posix = self.caps.strategy == PipeStrategy::Posix;
        loop {
            self.check_timeout()?;
            let running = if posix {
                self.pipes_open()
            } else {
                self.is_running()
            };
            self.read_pipes(running, posix || !running)?;
            if !running {
                break;
            }
        }

        while self.is_running() {
            self.check_timeout()?;
            std::thread::sleep(self.spec.timings.reap_poll_interval());
        }

        if let Some(info) = self.info {
            if info.signaled && Some(info.termsig) != self.latest_signal {
                warn!(
                    "Process {} was terminated by unexpected signal {}",
                    info.pid, info.termsig
                );
                return Err(ProcessError::UnexpectedSignal(info.termsig));
            }
        }

        Ok(self.exit_code.unwrap_or(-1))
    }

    /// Terminate the process, escalating after `grace`
    ///
    /// Sends `SIGTERM`, waits up to `grace` and then sends `signal` (default
    /// `SIGKILL`). Returns the exit code; a no-op on a terminated handle.
    /// A grace too large to be represented waits for the process to exit.
    pub fn stop(&mut self, grace: Duration, signal: Option<i32>) -> Result<Option<i32>> {
        let deadline = Instant::now().checked_add(grace);

        if self.is_running() {
            self.send_signal(SIGTERM, false)?;

            loop {
                std::thread::sleep(self.spec.timings.stop_poll_interval());
                let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
                if !self.is_running() || expired {
                    break;
                }
            }

            if self.is_running() {
                self.send_signal(signal.unwrap_or(SIGKILL), false)?;
            }
        }

        if self.is_running() {
            if let Some(pid) = self.fallback.pid.take() {
                debug!("Side-channel pid {} still running, retrying on the shell", pid);
                return self.stop(Duration::ZERO, signal);
            }

            self.force_close();
        }

        Ok(self.exit_code)
    }

    /// Send `signal` to the running process
    pub fn signal(&mut self, signal: i32) -> Result<&mut Self> {
        self.send_signal(signal, true)?;
        Ok(self)
    }

    pub fn output(&mut self) -> Result<Vec<u8>> {
        self.read_pipes_for_output("output")?;
        Ok(self.stdout.contents().to_vec())
    }

    /// Standard output produced since the previous call
    pub fn incremental_output(&mut self) -> Result<Vec<u8>> {
        self.read_pipes_for_output("incremental_output")?;
        Ok(self.stdout.read_incremental())
    }

    pub fn clear_output(&mut self) -> &mut Self {
        self.stdout.clear();
        self
    }

    pub fn error_output(&mut self) -> Result<Vec<u8>> {
        self.read_pipes_for_output("error_output")?;
        Ok(self.stderr.contents().to_vec())
    }

    /// Standard error produced since the previous call
    pub fn incremental_error_output(&mut self) -> Result<Vec<u8>> {
        self.read_pipes_for_output("incremental_error_output")?;
        Ok(self.stderr.read_incremental())
    }

    pub fn clear_error_output(&mut self) -> &mut Self {
        self.stderr.clear();
        self
    }

    /// Exit code, or `None` while the process has not terminated
    pub fn exit_code(&mut self) -> Result<Option<i32>> {
        self.update_status(false)?;
        Ok(self.exit_code)
    }

    pub fn exit_code_text(&mut self) -> Result<Option<&'static str>> {
        Ok(self.exit_code()?.map(exit_code_text))
    }

    pub fn is_successful(&mut self) -> Result<bool> {
        Ok(self.exit_code()? == Some(0))
    }

    pub fn has_been_signaled(&mut self) -> Result<bool> {
        Ok(self.terminated_info("has_been_signaled")?.signaled)
    }

    /// Signal that terminated the process
    ///
    /// Fails when the side channel could not tell which signal it was.
    pub fn term_signal(&mut self) -> Result<i32> {
        let info = self.terminated_info("term_signal")?;
        if self.plan.side_channel && info.termsig == -1 {
            return Err(ProcessError::lifecycle(
                "The term signal could not be retrieved for this process.",
            ));
        }
        Ok(info.termsig)
    }

    pub fn has_been_stopped(&mut self) -> Result<bool> {
        Ok(self.terminated_info("has_been_stopped")?.stopped)
    }

    pub fn stop_signal(&mut self) -> Result<i32> {
        Ok(self.terminated_info("stop_signal")?.stopsig)
    }

    /// Final status snapshot; only available once terminated
    pub fn exit_status(&mut self) -> Result<ExitStatus> {
        let info = self.terminated_info("exit_status")?;
        Ok(ExitStatus {
            code: self.exit_code.unwrap_or(-1),
            signaled: info.signaled,
            termsig: info.termsig,
            stopped: info.stopped,
            stopsig: info.stopsig,
        })
    }

    /// Pid of the running process (the real command in sigchild mode)
    pub fn pid(&mut self) -> Option<ProcessId> {
        if self.is_running() {
            self.info.map(|info| info.pid)
        } else {
            None
        }
    }

    pub fn is_running(&mut self) -> bool {
        if self.state != ProcessState::Started {
            return false;
        }
        self.refresh();
        self.info.is_some_and(|info| info.running)
    }

    pub fn is_started(&self) -> bool {
        self.state != ProcessState::Ready
    }

    pub fn is_terminated(&mut self) -> bool {
        self.refresh();
        self.state == ProcessState::Terminated
    }

    pub fn status(&mut self) -> ProcessState {
        self.refresh();
        self.state
    }

    pub fn command_line(&self) -> &str {
        &self.spec.command
    }

    pub fn working_directory(&self) -> Option<&PathBuf> {
        self.spec.working_directory.as_ref()
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Files standing in for output pipes while the process runs
    pub fn backing_files(&self) -> Vec<PathBuf> {
        self.pipes
            .as_ref()
            .map(|pipes| pipes.backing_files())
            .unwrap_or_default()
    }

    fn reset(&mut self) {
        self.stdout = OutputBuffer::new();
        self.stderr = OutputBuffer::new();
        self.sinks.clear();
        self.guard = None;
        self.info = None;
        self.fallback = FallbackStatus::default();
        self.side_channel.clear();
        self.side_channel_lines = 0;
        self.exit_code = None;
        self.latest_signal = None;
    }

    /// Status refresh for accessors that cannot report errors
    fn refresh(&mut self) {
        if let Err(e) = self.update_status(false) {
            warn!("Failed to refresh process status, closing its pipes: {}", e);
            if let Some(pipes) = self.pipes.as_mut() {
                pipes.close();
            }
        }
    }

    fn update_status(&mut self, blocking: bool) -> Result<()> {
        if self.state != ProcessState::Started {
            return Ok(());
        }

        let info = self.poll_child()?;
        let running = info.running;
        self.info = Some(info);

        let posix = self.caps.strategy == PipeStrategy::Posix;
        self.read_pipes(running && blocking, posix || !running)?;

        if self.plan.side_channel {
            self.info = Some(self.overlay_fallback(info));
        }

        if !running {
            self.close();
        }

        Ok(())
    }

    fn poll_child(&mut self) -> Result<ProcessInfo> {
        let Some(child) = self.child.as_mut() else {
            return Ok(self.info.unwrap_or_else(|| ProcessInfo::running(0)));
        };

        let pid = child.id();
        Ok(match child.try_wait()? {
            Some(status) => ProcessInfo::exited(pid, status),
            None => ProcessInfo::running(pid),
        })
    }

    fn pipes_open(&self) -> bool {
        self.pipes.as_ref().is_some_and(|pipes| pipes.are_open())
    }

    fn read_pipes(&mut self, blocking: bool, close: bool) -> Result<()> {
        let Some(pipes) = self.pipes.as_mut() else {
            return Ok(());
        };

        for (stream, data) in pipes.read_and_write(blocking, close)? {
            match stream {
                StreamId::Stdout => self.add_output(OutputKind::Out, &data),
                StreamId::Stderr => self.add_output(OutputKind::Err, &data),
                StreamId::SideChannel => self.consume_side_channel(&data),
            }
        }
        Ok(())
    }

    fn add_output(&mut self, kind: OutputKind, data: &[u8]) {
        if let Some(guard) = self.guard.as_mut() {
            guard.touch(Instant::now());
        }

        match kind {
            OutputKind::Out => self.stdout.append(data),
            OutputKind::Err => self.stderr.append(data),
        }

        for sink in &mut self.sinks {
            sink.on_output(kind, data);
        }
    }

    /// Status of a sigchild-wrapped launch
    ///
    /// The reaped status belongs to the wrapper shell, so once it is gone only
    /// what the side channel or a delivered signal reported is kept.
    fn overlay_fallback(&self, mut info: ProcessInfo) -> ProcessInfo {
        if !info.running {
            info.exitcode = -1;
            info.signaled = false;
            info.termsig = 0;
        }
        self.fallback.apply(info)
    }

    /// First line is the real pid, second line the real exit code
    fn consume_side_channel(&mut self, data: &[u8]) {
        self.side_channel.extend_from_slice(data);

        while let Some(newline) = self.side_channel.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.side_channel.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();

            match self.side_channel_lines {
                0 => match text.parse::<ProcessId>() {
                    Ok(pid) => self.fallback.pid = Some(pid),
                    Err(e) => warn!(line = %text, error = %e, "Invalid pid on side channel"),
                },
                1 => match text.parse::<i32>() {
                    Ok(_) if self.fallback.signaled.is_some() => {}
                    Ok(code) => self.fallback.exitcode = Some(code),
                    Err(e) => warn!(line = %text, error = %e, "Invalid exit code on side channel"),
                },
                _ => debug!(line = %text, "Ignoring extra side-channel output"),
            }
            self.side_channel_lines += 1;
        }
    }

    /// Read until the wrapper reports the real pid or gives up
    fn await_side_channel_pid(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.spec.timings.side_channel_wait();

        while self.fallback.pid.is_none() && Instant::now() < deadline {
            let open = self
                .pipes
                .as_ref()
                .is_some_and(|pipes| pipes.is_stream_open(StreamId::SideChannel));
            if !open {
                break;
            }
            self.read_pipes(true, true)?;
        }

        match self.fallback.pid {
            Some(pid) => {
                debug!("Side channel reported real pid {}", pid);
                if let Some(info) = self.info.as_mut() {
                    info.pid = pid;
                }
            }
            None => warn!("Side channel did not report a pid"),
        }
        Ok(())
    }

    fn check_timeout(&mut self) -> Result<()> {
        if self.state != ProcessState::Started {
            return Ok(());
        }

        let Some(expired) = self.guard.and_then(|guard| guard.check(Instant::now())) else {
            return Ok(());
        };

        let (kind, limit) = expired;
        warn!(
            command = %self.spec.command,
            kind = %kind,
            limit = ?limit,
            "Process exceeded its timeout, stopping it"
        );
        self.stop(Duration::ZERO, None)?;
        Err(ProcessError::Timeout { kind, limit })
    }

    fn send_signal(&mut self, signal: i32, fail_loudly: bool) -> Result<bool> {
        let Some(pid) = self.pid() else {
            if fail_loudly {
                return Err(ProcessError::lifecycle(
                    "Can not send signal on a non running process.",
                ));
            }
            return Ok(false);
        };

        let result = self.dispatcher.deliver(pid, signal);
        // Forced tree kills only fail if the process survived them
        let delivered = result.is_delivered()
            || (self.caps.strategy == PipeStrategy::TempFiles && !self.is_running());

        if !delivered {
            let reason = result.reason().unwrap_or_default();
            if fail_loudly {
                return Err(ProcessError::SignalDelivery { signal, reason });
            }
            debug!("Signal {} was not delivered to process {}: {}", signal, pid, reason);
            return Ok(false);
        }

        self.latest_signal = Some(signal);
        self.fallback.record_signal(signal);
        Ok(true)
    }

    /// Kill whatever is left and reap it
    fn force_close(&mut self) {
        if let Some(pipes) = self.pipes.as_mut() {
            pipes.close();
        }

        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            let result = self.dispatcher.terminate_tree(pid);
            debug!("Forced termination of process tree {}: {:?}", pid, result);

            if let Err(e) = child.kill() {
                debug!("Kill after tree termination of {} failed: {}", pid, e);
            }
            let info = match child.wait() {
                Ok(status) => ProcessInfo::exited(pid, status),
                Err(e) => {
                    warn!("Failed to reap process {}: {}", pid, e);
                    let mut info = ProcessInfo::running(pid);
                    info.running = false;
                    info
                }
            };
            self.info = Some(if self.plan.side_channel {
                self.overlay_fallback(info)
            } else {
                info
            });
        }

        self.close();
    }

    fn close(&mut self) {
        self.pipes = None;

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.wait() {
                warn!("Failed to reap process {}: {}", child.id(), e);
            }
        }

        let mut info = self.info.unwrap_or_else(|| {
            let mut info = ProcessInfo::running(0);
            info.running = false;
            info
        });
        info.running = false;

        let mut exit_code = info.exitcode;
        if exit_code == -1 {
            if info.signaled && info.termsig > 0 {
                exit_code = 128 + info.termsig;
            } else if self.plan.side_channel {
                info.signaled = true;
                info.termsig = -1;
            }
        }

        self.info = Some(info);
        self.exit_code = Some(exit_code);
        self.state = ProcessState::Terminated;
        self.sinks.clear();

        info!(
            pid = %info.pid,
            exit_code,
            signaled = info.signaled,
            "Process terminated"
        );
    }

    fn read_pipes_for_output(&mut self, caller: &str) -> Result<()> {
        if self.spec.output_disabled {
            return Err(ProcessError::lifecycle("Output has been disabled."));
        }
        self.require_started(caller)?;
        self.update_status(false)
    }

    fn require_started(&self, caller: &str) -> Result<()> {
        if !self.is_started() {
            return Err(ProcessError::lifecycle(format!(
                "Process must be started before calling {caller}."
            )));
        }
        Ok(())
    }

    fn terminated_info(&mut self, caller: &str) -> Result<ProcessInfo> {
        if !self.is_terminated() {
            return Err(ProcessError::lifecycle(format!(
                "Process must be terminated before calling {caller}."
            )));
        }
        self.info
            .ok_or_else(|| ProcessError::lifecycle("Process status is not available"))
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.state == ProcessState::Started {
            if let Err(e) = self.stop(Duration::ZERO, None) {
                warn!("Failed to stop process on drop: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("command", &self.spec.command)
            .field("state", &self.state)
            .field("info", &self.info)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}
