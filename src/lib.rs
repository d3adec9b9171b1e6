//! arraymgr - Array Volume Driver
//!
//! A volume lifecycle driver for external disk arrays controlled through a
//! vendor storage CLI. The array's textual command output is the source of
//! truth for device state; the driver layers a resilient command protocol,
//! a typed response parser and a replication state machine beneath a thin
//! volume façade.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Volume Façade                            │
//! │   create / delete / snapshot / clone / extend / manage /        │
//! │   connections / capacity                                        │
//! ├──────────────────┬───────────────────────┬──────────────────────┤
//! │ Device Allocator │  Pair State Machine   │  Mapping Reconciler  │
//! │  (LDEV lifecycle)│  (full/thin mirrors)  │  (targets, LUN paths)│
//! ├──────────────────┴───────────┬───────────┴──────────────────────┤
//! │                     Resilient Invoker                           │
//! │   retry / re-login / control-process restart / lock hold-off    │
//! ├──────────────────────────────┼──────────────────────────────────┤
//! │        Command Runner        │       Response Parser            │
//! │   (one process per call)     │   (fixed-format text fields)     │
//! └──────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`volume`]: volume façade and setup orchestration
//! - [`device`]: logical device allocation and lifecycle
//! - [`pair`]: replication pair state machine
//! - [`target`]: host target and LUN mapping reconciliation
//! - [`protocol`]: transport-specific operations (FC / iSCSI)
//! - [`horcm`]: control-process session management
//! - [`cli`]: command execution, retry protocol and response parsing
//! - [`config`]: driver configuration
//! - [`error`]: error types and condition classification

pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod horcm;
pub mod lock;
pub mod pair;
pub mod protocol;
pub mod target;
pub mod volume;

// Re-export commonly used types
pub use cli::invoker::{ExecOptions, HorcmShell, SuccessCodes};
pub use cli::parser::{find_int, find_list, find_text, find_value, Field, FieldValue};
pub use cli::runner::{CommandResult, CommandRunner, CommandRunnerRef, SystemRunner};
pub use config::{CopyMethod, Dialect, DriverConfig, LdevRange, Protocol};
pub use device::DeviceManager;
pub use error::{Condition, Error, Result};
pub use pair::{PairInfo, PairManager, PairStatus, SecondaryInfo};
pub use protocol::{
    ConnectionProperties, HostDescriptor, ProtocolFactory, ProtocolOps, StorageState,
};
pub use target::{MappingReconciler, TargetSet};
pub use volume::{Capacity, PoolCapacity, ProvisionedVolume, VolumeDriver, VolumeMetadata};

/// Prefix stamped on every object this driver creates on the array
pub const DRIVER_PREFIX: &str = "AMG";

/// Prefix of host groups / iSCSI targets owned by the driver
pub const TARGET_PREFIX: &str = "AMG-";

/// Reserved host group name used for pair-dedicated attachments
pub const PAIR_TARGET_NAME: &str = "AMG-pair00";

/// Suffix appended to the initiator IQN to form a target IQN
pub const TARGET_IQN_SUFFIX: &str = ".amg-target";

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
