use childproc_core::{DeliveryResult, ProcessId, SignalDispatcher};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use childproc_core::SIGKILL;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::process::{Command, Stdio};
    use std::sync::Mutex;
    use sysinfo::System;
    use tracing::{debug, info, warn};

    /// Signal delivery for Unix children
    ///
    /// With `via_utility` the external `kill` program is used instead of the
    /// `kill(2)` call, mirroring how a shell would signal a process it does
    /// not own as a direct child.
    pub struct UnixSignalDispatcher {
        via_utility: bool,
        system: Mutex<System>,
    }

    impl UnixSignalDispatcher {
        pub fn new(via_utility: bool) -> Self {
            Self {
                via_utility,
                system: Mutex::new(System::new()),
            }
        }

        pub fn via_utility(&self) -> bool {
            self.via_utility
        }

        fn deliver_direct(&self, pid: ProcessId, signal: i32) -> DeliveryResult {
            let signal = match Signal::try_from(signal) {
                Ok(signal) => signal,
                Err(e) => return DeliveryResult::Failed(format!("Invalid signal {signal}: {e}")),
            };
            let nix_pid = NixPid::from_raw(pid as i32);

            match signal::kill(nix_pid, signal) {
                Ok(()) => {
                    info!("Sent {} to process {}", signal, pid);
                    DeliveryResult::Delivered
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!("Process {} not found (already terminated)", pid);
                    DeliveryResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to signal process {}", pid);
                    DeliveryResult::PermissionDenied
                }
                Err(e) => {
                    warn!("Failed to send {} to process {}: {}", signal, pid, e);
                    DeliveryResult::Failed(format!("{signal} failed: {e}"))
                }
            }
        }

        /// Run `kill -N pid`; success means the utility printed nothing on stderr
        fn deliver_via_utility(&self, pid: ProcessId, signal: i32) -> DeliveryResult {
            let output = Command::new("kill")
                .arg(format!("-{signal}"))
                .arg(pid.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output();

            match output {
                Ok(output) if output.stderr.is_empty() => {
                    info!("Sent signal {} to process {} via kill utility", signal, pid);
                    DeliveryResult::Delivered
                }
                Ok(output) => {
                    let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    warn!("kill -{} {} reported an error: {}", signal, pid, reason);
                    DeliveryResult::Failed(reason)
                }
                Err(e) => {
                    warn!("Failed to run kill utility for process {}: {}", pid, e);
                    DeliveryResult::Failed(format!("Unable to run kill: {e}"))
                }
            }
        }

        /// Recursively find all child processes
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                    let child_pid = pid.as_u32();
                    // Grandchildren first so the list is bottom-up
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }

        pub(crate) fn find_child_processes(&self, parent_pid: ProcessId) -> Vec<ProcessId> {
            let mut system = match self.system.lock() {
                Ok(system) => system,
                Err(poisoned) => poisoned.into_inner(),
            };
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid, &mut children);
            children
        }
    }

    impl Default for UnixSignalDispatcher {
        fn default() -> Self {
            Self::new(false)
        }
    }

    impl SignalDispatcher for UnixSignalDispatcher {
        fn deliver(&self, pid: ProcessId, signal: i32) -> DeliveryResult {
            if self.via_utility {
                self.deliver_via_utility(pid, signal)
            } else {
                self.deliver_direct(pid, signal)
            }
        }

        fn terminate_tree(&self, root_pid: ProcessId) -> DeliveryResult {
            info!("Terminating process tree for root PID {}", root_pid);

            // Freeze the root so it can neither reap nor spawn while the tree is listed
            if let DeliveryResult::ProcessNotFound =
                self.deliver_direct(root_pid, Signal::SIGSTOP as i32)
            {
                return DeliveryResult::ProcessNotFound;
            }

            let children = self.find_child_processes(root_pid);
            for &child_pid in &children {
                let _ = self.deliver_direct(child_pid, Signal::SIGSTOP as i32);
            }

            let result = self.deliver_direct(root_pid, SIGKILL);

            if children.is_empty() {
                debug!("No child processes found for PID {}", root_pid);
            } else {
                info!("Found {} child processes to terminate", children.len());
            }
            for child_pid in children {
                match self.deliver_direct(child_pid, SIGKILL) {
                    DeliveryResult::Delivered | DeliveryResult::ProcessNotFound => {}
                    other => warn!("Failed to kill descendant {}: {:?}", child_pid, other),
                }
            }

            result
        }
    }
}

#[cfg(unix)]
pub use unix_impl::UnixSignalDispatcher;

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
#[derive(Default)]
pub struct UnixSignalDispatcher;

#[cfg(not(unix))]
impl UnixSignalDispatcher {
    pub fn new(_via_utility: bool) -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl SignalDispatcher for UnixSignalDispatcher {
    fn deliver(&self, _pid: ProcessId, _signal: i32) -> DeliveryResult {
        DeliveryResult::Failed("Unix signals are not available on this platform".to_string())
    }

    fn terminate_tree(&self, pid: ProcessId) -> DeliveryResult {
        self.deliver(pid, 9)
    }
}
