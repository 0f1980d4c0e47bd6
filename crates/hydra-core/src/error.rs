//! Error types reported by the external collaborators.
//!
//! Device workers, the physical model and output sinks are plugged in
//! by the embedding application. Their failures surface through these
//! enums and are folded into the run error by the simulation loop.

use thiserror::Error;

use crate::command::CommandKind;
use crate::id::DeviceIndex;

/// A device worker failed while executing a command.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    /// The worker does not implement the posted command.
    #[error("device {device}: command {command} is not supported")]
    Unsupported {
        /// The failing device.
        device: DeviceIndex,
        /// The unsupported command.
        command: CommandKind,
    },
    /// The command ran and failed.
    #[error("device {device}: {command} failed: {reason}")]
    Execution {
        /// The failing device.
        device: DeviceIndex,
        /// The command that failed.
        command: CommandKind,
        /// Human-readable cause.
        reason: String,
    },
    /// Device setup or teardown failed.
    #[error("device {device}: {reason}")]
    Lifecycle {
        /// The failing device.
        device: DeviceIndex,
        /// Human-readable cause.
        reason: String,
    },
}

impl WorkerError {
    /// Creates an execution error.
    pub fn execution(device: DeviceIndex, command: CommandKind, reason: impl Into<String>) -> Self {
        Self::Execution {
            device,
            command,
            reason: reason.into(),
        }
    }
}

/// The physical model rejected a callback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// Setup failed.
    #[error("model initialization failed: {0}")]
    Initialization(String),
    /// A per-iteration callback failed.
    #[error("model callback failed: {0}")]
    Callback(String),
}

/// An output sink failed to write.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SinkError {
    /// I/O failure while writing.
    #[error("sink {sink}: {reason}")]
    Write {
        /// Name of the failing sink.
        sink: String,
        /// Human-readable cause.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_error_messages_name_device_and_command() {
        let err = WorkerError::execution(DeviceIndex(1), CommandKind::Euler, "nan in velocity");
        assert_eq!(err.to_string(), "device 1: EULER failed: nan in velocity");
    }

    #[test]
    fn sink_error_message() {
        let err = SinkError::Write {
            sink: "vtk".into(),
            reason: "disk full".into(),
        };
        assert_eq!(err.to_string(), "sink vtk: disk full");
    }
}
