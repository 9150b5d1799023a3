use crate::status::ProcessId;

pub const SIGKILL: i32 = 9;
pub const SIGTERM: i32 = 15;

/// Result of a signal delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The signal reached the process
    Delivered,
    /// The process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    PermissionDenied,
    /// Delivery failed for another reason
    Failed(String),
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered)
    }

    /// Human readable reason for a failed delivery
    pub fn reason(&self) -> Option<String> {
        match self {
            DeliveryResult::Delivered => None,
            DeliveryResult::ProcessNotFound => Some("No such process".to_string()),
            DeliveryResult::PermissionDenied => Some("Operation not permitted".to_string()),
            DeliveryResult::Failed(reason) => Some(reason.clone()),
        }
    }
}

/// Sends signals to a child identified by pid
pub trait SignalDispatcher: Send + Sync {
    /// Deliver `signal` to `pid`
    ///
    /// Strategies that cannot represent arbitrary signals (Windows) treat
    /// every request as a forced tree termination.
    fn deliver(&self, pid: ProcessId, signal: i32) -> DeliveryResult;

    /// Forcefully terminate `pid` and every process it spawned
    fn terminate_tree(&self, pid: ProcessId) -> DeliveryResult;
}
