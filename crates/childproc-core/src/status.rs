use std::fmt;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Lifecycle of one handle; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessState {
    Ready,
    Started,
    Terminated,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Started => write!(f, "started"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Snapshot of what the OS reports about the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub running: bool,
    pub signaled: bool,
    pub termsig: i32,
    pub stopped: bool,
    pub stopsig: i32,
    /// `-1` while running or when the OS could not report a code
    pub exitcode: i32,
}

impl ProcessInfo {
    pub fn running(pid: ProcessId) -> Self {
        Self {
            pid,
            running: true,
            signaled: false,
            termsig: 0,
            stopped: false,
            stopsig: 0,
            exitcode: -1,
        }
    }

    /// Build a snapshot from a reaped child's status
    pub fn exited(pid: ProcessId, status: std::process::ExitStatus) -> Self {
        let mut info = Self::running(pid);
        info.running = false;
        info.exitcode = status.code().unwrap_or(-1);

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;

            if let Some(signal) = status.signal() {
                info.signaled = true;
                info.termsig = signal;
            }
            if let Some(signal) = status.stopped_signal() {
                info.stopped = true;
                info.stopsig = signal;
            }
        }

        info
    }
}

/// Status fields recovered out-of-band (side channel or signal bookkeeping)
///
/// When sigchild compensation is active these override the OS snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackStatus {
    pub pid: Option<ProcessId>,
    pub exitcode: Option<i32>,
    pub signaled: Option<bool>,
    pub termsig: Option<i32>,
}

impl FallbackStatus {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Record a successfully delivered signal
    pub fn record_signal(&mut self, signal: i32) {
        self.signaled = Some(true);
        self.exitcode = Some(-1);
        self.termsig = Some(signal);
    }

    /// Overlay the known fields on top of an OS snapshot
    pub fn apply(&self, mut info: ProcessInfo) -> ProcessInfo {
        if let Some(pid) = self.pid {
            info.pid = pid;
        }
        if let Some(exitcode) = self.exitcode {
            info.exitcode = exitcode;
        }
        if let Some(signaled) = self.signaled {
            info.signaled = signaled;
        }
        if let Some(termsig) = self.termsig {
            info.termsig = termsig;
        }
        info
    }
}

/// Final status of a terminated handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// `-1` when the code could not be determined
    pub code: i32,
    pub signaled: bool,
    pub termsig: i32,
    pub stopped: bool,
    pub stopsig: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn text(&self) -> &'static str {
        exit_code_text(self.code)
    }
}

/// Human readable meaning of common shell and signal-derived exit codes
pub const EXIT_CODES: &[(i32, &str)] = &[
    (0, "OK"),
    (1, "General error"),
    (2, "Misuse of shell builtins"),
    (126, "Invoked command cannot execute"),
    (127, "Command not found"),
    (128, "Invalid exit argument"),
    (129, "Hangup"),
    (130, "Interrupt"),
    (131, "Quit and dump core"),
    (132, "Illegal instruction"),
    (133, "Trace/breakpoint trap"),
    (134, "Process aborted"),
    (135, "Bus error: \"access to undefined portion of memory object\""),
    (136, "Floating point exception: \"erroneous arithmetic operation\""),
    (137, "Kill (terminate immediately)"),
    (138, "User-defined 1"),
    (139, "Segmentation violation"),
    (140, "User-defined 2"),
    (141, "Write to pipe with no one reading"),
    (142, "Signal raised by alarm"),
    (143, "Termination (request to terminate)"),
    (145, "Child process terminated, stopped (or continued*)"),
    (146, "Continue if stopped"),
    (147, "Stop executing temporarily"),
    (148, "Terminal stop signal"),
    (149, "Background process attempting to read from tty (\"in\")"),
    (150, "Background process attempting to write to tty (\"out\")"),
    (151, "Urgent data available on socket"),
    (152, "CPU time limit exceeded"),
    (153, "File size limit exceeded"),
    (154, "Signal raised by timer counting virtual time: \"virtual timer expired\""),
    (155, "Profiling timer expired"),
    (157, "Pollable event"),
    (159, "Bad syscall"),
];

pub fn exit_code_text(code: i32) -> &'static str {
    EXIT_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, text)| *text)
        .unwrap_or("Unknown error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_text() {
        assert_eq!(exit_code_text(0), "OK");
        assert_eq!(exit_code_text(127), "Command not found");
        assert_eq!(exit_code_text(128 + 9), "Kill (terminate immediately)");
        assert_eq!(exit_code_text(130), "Interrupt");
        assert_eq!(exit_code_text(42), "Unknown error");
        assert_eq!(exit_code_text(-1), "Unknown error");
    }

    #[test]
    fn test_state_ordering_and_display() {
        assert!(ProcessState::Ready < ProcessState::Started);
        assert!(ProcessState::Started < ProcessState::Terminated);
        assert_eq!(ProcessState::Terminated.to_string(), "terminated");
    }

    #[test]
    fn test_fallback_overrides_snapshot() {
        let mut info = ProcessInfo::running(100);
        info.running = false;

        let mut fallback = FallbackStatus {
            pid: Some(101),
            exitcode: Some(3),
            ..Default::default()
        };
        let merged = fallback.apply(info);
        assert_eq!(merged.pid, 101);
        assert_eq!(merged.exitcode, 3);
        assert!(!merged.signaled);

        fallback.record_signal(15);
        let merged = fallback.apply(info);
        assert!(merged.signaled);
        assert_eq!(merged.termsig, 15);
        assert_eq!(merged.exitcode, -1);
        assert!(!merged.running);
    }

    #[test]
    fn test_empty_fallback() {
        let fallback = FallbackStatus::default();
        assert!(fallback.is_empty());
        let info = ProcessInfo::running(7);
        assert_eq!(fallback.apply(info), info);
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_from_exit_status() {
        use std::os::unix::process::ExitStatusExt;

        let info = ProcessInfo::exited(5, std::process::ExitStatus::from_raw(3 << 8));
        assert_eq!(info.exitcode, 3);
        assert!(!info.signaled);

        let info = ProcessInfo::exited(5, std::process::ExitStatus::from_raw(9));
        assert_eq!(info.exitcode, -1);
        assert!(info.signaled);
        assert_eq!(info.termsig, 9);
    }
}
