use childproc_core::{DeliveryResult, ProcessId, SignalDispatcher};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use sysinfo::{Pid, System};
use tracing::{info, warn};

/// Signal delivery for Windows children
///
/// Windows has no POSIX signals: every request terminates the whole tree
/// with `taskkill /F /T`.
pub struct WindowsSignalDispatcher {
    system: Mutex<System>,
}

impl Default for WindowsSignalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsSignalDispatcher {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn is_alive(&self, pid: ProcessId) -> bool {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            sysinfo::ProcessRefreshKind::default(),
        );
        system.process(Pid::from_u32(pid)).is_some()
    }

    /// Use taskkill with /T to terminate a process tree
    fn taskkill_tree(&self, pid: ProcessId) -> std::io::Result<std::process::Output> {
        let mut command = Command::new("taskkill");
        command
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdin(Stdio::null());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        command.output()
    }

    fn kill_with_sysinfo(&self, pid: ProcessId) -> bool {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );
        system
            .process(Pid::from_u32(pid))
            .map(|process| process.kill())
            .unwrap_or(false)
    }
}

impl SignalDispatcher for WindowsSignalDispatcher {
    fn deliver(&self, pid: ProcessId, _signal: i32) -> DeliveryResult {
        match self.taskkill_tree(pid) {
            Ok(output) if output.status.success() => {
                info!("Successfully terminated process tree for PID {}", pid);
                DeliveryResult::Delivered
            }
            // A failure only counts while the process is still around
            Ok(_) | Err(_) if !self.is_alive(pid) => DeliveryResult::ProcessNotFound,
            Ok(output) => {
                let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!("taskkill failed for process {}: {}", pid, reason);
                DeliveryResult::Failed(reason)
            }
            Err(e) => {
                warn!("Failed to execute taskkill for process {}: {}", pid, e);
                DeliveryResult::Failed(format!("Unable to run taskkill: {e}"))
            }
        }
    }

    fn terminate_tree(&self, pid: ProcessId) -> DeliveryResult {
        match self.deliver(pid, childproc_core::SIGKILL) {
            DeliveryResult::Failed(reason) => {
                if self.kill_with_sysinfo(pid) {
                    info!("Killed process {} after taskkill failure", pid);
                    DeliveryResult::Delivered
                } else {
                    DeliveryResult::Failed(reason)
                }
            }
            result => result,
        }
    }
}

#[cfg(all(test, windows))]
mod tests {
    use super::*;

    #[test]
    fn test_taskkill_terminates_child() {
        let dispatcher = WindowsSignalDispatcher::new();
        let mut child = Command::new("cmd")
            .args(["/C", "ping -n 30 127.0.0.1 > NUL"])
            .spawn()
            .unwrap();

        assert!(dispatcher.deliver(child.id(), 15).is_delivered());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
