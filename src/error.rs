//! Error types for the array volume driver
//!
//! Provides structured error types for all driver components including
//! command execution, device allocation, pair management, and mapping
//! reconciliation.

use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("A parameter is invalid: {0}")]
    InvalidParameter(String),

    #[error("A parameter value is invalid: {0}")]
    InvalidMetadata(String),

    // =========================================================================
    // Command Execution Errors
    // =========================================================================
    #[error("Command failed: {cmd} (exit: {exit}, stdout: {stdout}, stderr: {stderr})")]
    CommandFailed {
        cmd: String,
        exit: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Failed to shut down the control process (instance: {instance})")]
    ControlProcessShutdown { instance: u16 },

    #[error("Failed to restart the control process (instance: {instance})")]
    ControlProcessRestart { instance: u16 },

    #[error("Failed to write the control process configuration: {file} (exit: {exit})")]
    ControlProcessConfig { file: String, exit: i32 },

    // =========================================================================
    // Device Errors
    // =========================================================================
    #[error("The creation of logical device {ldev} could not be completed")]
    DeviceCreationIncomplete { ldev: u32 },

    #[error("The deletion of logical device {ldev} could not be completed")]
    DeviceDeletionIncomplete { ldev: u32 },

    #[error("The replication source device does not exist or is not ready (LDEV: {ldev})")]
    SourceUnavailable { ldev: u32 },

    #[error("The volume {location} could not be extended; its type must be Normal")]
    ExtendNotSupported { location: String },

    #[error("Copy-on-storage is not supported for this source volume type")]
    NotSupported,

    // =========================================================================
    // Pair Errors
    // =========================================================================
    #[error(
        "A pair could not be created; the maximum number of {copy_method} pairs \
         is exceeded (P-VOL: {pvol})"
    )]
    MaxPairsExceeded { copy_method: String, pvol: u32 },

    #[error("A pair cannot be deleted (P-VOL: {pvol}, S-VOL: {svols})")]
    PairBusy { pvol: u32, svols: String },

    #[error("The status change of a {copy_method} pair could not be completed (S-VOL: {svol})")]
    PairStatusTimeout { copy_method: String, svol: u32 },

    #[error("The volume {location} is busy")]
    VolumeBusy { location: String },

    // =========================================================================
    // Target/Mapping Errors
    // =========================================================================
    #[error("The host group or iSCSI target was not found")]
    TargetNotFound,

    #[error("Failed to add the pair target")]
    NoPairTarget,

    #[error("Failed to map logical device {ldev} to any pair target")]
    PairMappingFailed { ldev: u32 },

    #[error("No host identity could be registered (port: {port}, gid: {gid})")]
    HostIdRegistrationFailed { port: String, gid: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("There are no resources available for use: {resource}")]
    ResourceExhausted { resource: String },

    #[error("The resource {resource} was not found")]
    ResourceNotFound { resource: String },

    #[error("A pool could not be found: {pool}")]
    PoolNotFound { pool: String },

    // =========================================================================
    // Reference Errors
    // =========================================================================
    #[error("Invalid existing-volume reference: {reason}")]
    InvalidReference { reason: String },

    #[error("The volume {location} was not found")]
    VolumeNotFound { location: String },

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Caller-facing classification of an error
///
/// The orchestration layer maps these to user-visible retry semantics:
/// `Busy` means "in use, retry later", `InvalidInput` is a permanent client
/// error, `ResourceExhausted` is a capacity problem, and `Fault` is a system
/// error surfaced after compensating actions were attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Busy,
    ResourceExhausted,
    InvalidInput,
    Fault,
}

impl Error {
    /// Classify this error for the orchestration layer
    pub fn condition(&self) -> Condition {
        match self {
            Error::PairBusy { .. } | Error::VolumeBusy { .. } => Condition::Busy,

            Error::ResourceExhausted { .. } | Error::MaxPairsExceeded { .. } => {
                Condition::ResourceExhausted
            }

            Error::InvalidParameter(_)
            | Error::InvalidMetadata(_)
            | Error::InvalidReference { .. }
            | Error::VolumeNotFound { .. }
            | Error::ExtendNotSupported { .. }
            | Error::NotSupported => Condition::InvalidInput,

            _ => Condition::Fault,
        }
    }

    /// Check if this error means the resource is temporarily in use
    pub fn is_busy(&self) -> bool {
        self.condition() == Condition::Busy
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conditions() {
        let err = Error::PairBusy {
            pvol: 7,
            svols: "8, 9".into(),
        };
        assert_eq!(err.condition(), Condition::Busy);
        assert!(err.is_busy());

        let err = Error::MaxPairsExceeded {
            copy_method: "Full copy".into(),
            pvol: 7,
        };
        assert_eq!(err.condition(), Condition::ResourceExhausted);

        let err = Error::InvalidReference {
            reason: "no source id".into(),
        };
        assert_eq!(err.condition(), Condition::InvalidInput);

        let err = Error::DeviceCreationIncomplete { ldev: 3 };
        assert_eq!(err.condition(), Condition::Fault);
        assert!(!err.is_busy());
    }
}
