//! Logical device allocation and lifecycle
//!
//! Finds unused LDEV ids (by chunked range scan or by asking the array for
//! any undefined id), drives creation and deletion through the resilient
//! invoker, and polls the device until it reaches the expected status.
//! Creation and deletion are serialized process-wide: two callers scanning
//! the same range concurrently could pick the same free id.

use crate::cli::invoker::{ExecOptions, HorcmShell, SuccessCodes, INVALID_RANGE};
use crate::cli::parser::{find_int, find_list, find_text, Field};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Device status reported for a usable device
pub const NORMAL_STATUS: &str = "NML";

/// Attribute marking a full-copy pair member
pub const FULL_ATTR: &str = "MRCF";
/// Attribute marking a thin-copy pair member
pub const THIN_ATTR: &str = "QS";
/// Attribute marking a thin-provisioned virtual volume
pub const VVOL_ATTR: &str = "VVOL";

/// The array sizes volumes in 512-byte blocks
pub const BLOCKS_PER_GB: u64 = 1024 * 1024 * 1024 / 512;

/// Attribute kinds a manageable unpaired device may carry
const PERMITTED_ATTRS: [&str; 3] = ["CVS", "HDP", "HDT"];

/// Ids fetched per range-scan query
const SCAN_BATCH: u32 = 1000;

const STATUS_WAIT: Duration = Duration::from_secs(120);
const STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const EXTEND_WAIT: Duration = Duration::from_secs(10 * 60);

// =============================================================================
// Device Snapshot
// =============================================================================

/// One device's state as reported by the array
///
/// Every field is optional because absence from the response is
/// meaningful; in particular a missing status is not "not normal", it is
/// "not reported".
#[derive(Debug, Clone, Default)]
pub struct LdevSnapshot {
    pub status: Option<String>,
    pub attributes: Vec<String>,
    pub vol_type: Option<String>,
    pub size_blocks: Option<u64>,
    pub num_ports: Option<u64>,
    pub ports: Vec<String>,
}

impl LdevSnapshot {
    fn parse(stdout: &str) -> Self {
        Self {
            status: find_text(stdout, Field::Sts),
            attributes: find_list(stdout, Field::VolAttr).unwrap_or_default(),
            vol_type: find_text(stdout, Field::VolType),
            size_blocks: find_int(stdout, Field::VolSize),
            num_ports: find_int(stdout, Field::NumPort),
            ports: find_list(stdout, Field::Ports).unwrap_or_default(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.status.as_deref() == Some(NORMAL_STATUS)
    }

    pub fn has_attr(&self, attr: &str) -> bool {
        self.attributes.iter().any(|a| a == attr)
    }
}

enum StatusCheck {
    Created,
    Deleted,
}

// =============================================================================
// Device Manager
// =============================================================================

/// Allocates, deletes and resizes logical devices
pub struct DeviceManager {
    shell: Arc<HorcmShell>,
    status_wait: Duration,
    check_interval: Duration,
}

impl DeviceManager {
    pub fn new(shell: Arc<HorcmShell>) -> Arc<Self> {
        Arc::new(Self {
            shell,
            status_wait: STATUS_WAIT,
            check_interval: STATUS_CHECK_INTERVAL,
        })
    }

    #[cfg(test)]
    fn with_timing(shell: Arc<HorcmShell>, wait: Duration, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            shell,
            status_wait: wait,
            check_interval: interval,
        })
    }

    /// Query one device's state
    pub async fn query(&self, ldev: u32) -> Result<LdevSnapshot> {
        let result = self
            .shell
            .run_raidcom(
                &["get", "ldev", "-ldev_id", &ldev.to_string()],
                ExecOptions::default(),
            )
            .await?;
        Ok(LdevSnapshot::parse(&result.stdout))
    }

    /// Query one device's state, tolerating a failed query
    pub async fn try_query(&self, ldev: u32) -> Result<LdevSnapshot> {
        let result = self
            .shell
            .run_raidcom(
                &["get", "ldev", "-ldev_id", &ldev.to_string()],
                ExecOptions::default().no_raise(),
            )
            .await?;
        Ok(LdevSnapshot::parse(&result.stdout))
    }

    /// Create a device of `size_gb` and wait until it is usable
    pub async fn create(&self, size_gb: u64, is_vvol: bool) -> Result<u32> {
        let _guard = self
            .shell
            .locks
            .acquire(&self.shell.lock_names.create_ldev)
            .await;
        let ldev = self.unused_ldev().await?;
        self.create_on_storage(ldev, size_gb, is_vvol).await?;
        self.wait_status(ldev, StatusCheck::Created).await?;
        debug!(ldev, size_gb, "created logical device");
        Ok(ldev)
    }

    async fn create_on_storage(&self, ldev: u32, size_gb: u64, is_vvol: bool) -> Result<()> {
        let ldev_arg = ldev.to_string();
        let capacity = format!("{}G", size_gb);
        let mut args = vec![
            "add",
            "ldev",
            "-ldev_id",
            &ldev_arg,
            "-capacity",
            &capacity,
            "-emulation",
            "OPEN-V",
            "-pool",
        ];
        if is_vvol {
            args.push("snap");
        } else {
            args.push(&self.shell.config.pool);
        }
        self.shell.run_raidcom(&args, ExecOptions::default()).await?;
        Ok(())
    }

    /// Delete a device and wait until the array reports it undefined.
    /// Deleting an already-undefined device is a logged no-op.
    pub async fn delete(&self, ldev: u32) -> Result<()> {
        let _guard = self
            .shell
            .locks
            .acquire(&self.shell.lock_names.create_ldev)
            .await;
        let ldev_arg = ldev.to_string();
        let gone = self
            .shell
            .run_raidcom(
                &[
                    "get",
                    "ldev",
                    "-ldev_id",
                    &ldev_arg,
                    "-check_status",
                    "NOT",
                    "DEFINED",
                ],
                ExecOptions::default().no_raise(),
            )
            .await?;
        if gone.exit == 0 {
            info!(ldev, "logical device does not exist in the storage system");
            return Ok(());
        }
        self.shell
            .run_raidcom(
                &["delete", "ldev", "-ldev_id", &ldev_arg],
                ExecOptions::default(),
            )
            .await?;
        self.wait_status(ldev, StatusCheck::Deleted).await
    }

    /// Grow a device by `new_gb - old_gb`
    ///
    /// The caller is responsible for tearing down pairs first; the array
    /// rejects extending a paired or virtual device.
    pub async fn extend(&self, ldev: u32, old_gb: u64, new_gb: u64) -> Result<()> {
        let delta = format!("{}G", new_gb - old_gb);
        self.shell
            .run_raidcom(
                &["extend", "ldev", "-ldev_id", &ldev.to_string(), "-capacity", &delta],
                ExecOptions::default().timeout(EXTEND_WAIT),
            )
            .await?;
        Ok(())
    }

    /// Whether the device is a thin-provisioned virtual volume
    pub async fn is_vvol(&self, ldev: u32) -> Result<bool> {
        let snapshot = self.query(ldev).await?;
        Ok(snapshot.is_normal() && snapshot.has_attr(VVOL_ATTR))
    }

    /// Reclaim zeroed pages after a host-side copy; best effort
    pub async fn discard_zero_page(&self, ldev: u32) {
        let result = self
            .shell
            .run_raidcom(
                &[
                    "modify",
                    "ldev",
                    "-ldev_id",
                    &ldev.to_string(),
                    "-status",
                    "discard_zero_page",
                ],
                ExecOptions::default(),
            )
            .await;
        if result.is_err() {
            warn!(ldev, "failed to perform a zero-page reclamation");
        }
    }

    /// Validate an externally-created device and report its size in GB
    pub async fn manageable_size_gb(&self, ldev: u32) -> Result<u64> {
        let snapshot = self.try_query(ldev).await?;
        if !snapshot.is_normal() {
            return Err(Error::InvalidReference {
                reason: format!("LDEV {} is not in a normal state", ldev),
            });
        }
        let attrs: std::collections::HashSet<&str> =
            snapshot.attributes.iter().map(String::as_str).collect();
        let type_ok = snapshot
            .vol_type
            .as_deref()
            .map(|t| t.starts_with("OPEN-V"))
            .unwrap_or(false);
        if !type_ok
            || attrs.len() < 2
            || !attrs.iter().all(|a| PERMITTED_ATTRS.contains(a))
        {
            return Err(Error::InvalidReference {
                reason: format!("LDEV {} must be an unpaired pool volume", ldev),
            });
        }
        let size_blocks = snapshot.size_blocks.ok_or_else(|| Error::InvalidReference {
            reason: format!("LDEV {} reports no capacity", ldev),
        })?;
        if size_blocks % BLOCKS_PER_GB != 0 {
            return Err(Error::InvalidReference {
                reason: format!("LDEV {} size must be expressed in gigabytes", ldev),
            });
        }
        if snapshot.num_ports.unwrap_or(0) != 0 {
            return Err(Error::InvalidReference {
                reason: format!("LDEV {} must not be mapped", ldev),
            });
        }
        Ok(size_blocks / BLOCKS_PER_GB)
    }

    // =========================================================================
    // Unused-id selection
    // =========================================================================

    async fn unused_ldev(&self) -> Result<u32> {
        let ldev = match self.shell.config.ldev_range {
            None => {
                let result = self
                    .shell
                    .run_raidcom(
                        &["get", "ldev", "-ldev_list", "undefined", "-cnt", "1"],
                        ExecOptions::default(),
                    )
                    .await?;
                find_int(&result.stdout, Field::Ldev)
            }
            Some(range) => self.scan_range(range.begin, range.end).await?,
        };
        // Id 0 is a valid device, so only true absence is exhaustion.
        ldev.map(|v| v as u32).ok_or_else(|| Error::ResourceExhausted {
            resource: "LDEV".to_string(),
        })
    }

    async fn scan_range(&self, begin: u32, end: u32) -> Result<Option<u64>> {
        // Ids beyond the array's defined range answer with an invalid-range
        // code; that just means "keep scanning".
        let opts = ExecOptions::default().success(SuccessCodes::HorcmPlus(&INVALID_RANGE));
        let mut start = begin;
        while start <= end {
            let count = SCAN_BATCH.min(end - start + 1);
            let result = self
                .shell
                .run_raidcom(
                    &[
                        "get",
                        "ldev",
                        "-ldev_id",
                        &start.to_string(),
                        "-cnt",
                        &count.to_string(),
                        "-key",
                        "front_end",
                    ],
                    opts.clone(),
                )
                .await?;
            if let Some(ldev) = find_int(&result.stdout, Field::UndefinedLdev) {
                return Ok(Some(ldev));
            }
            start = match start.checked_add(SCAN_BATCH) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(None)
    }

    // =========================================================================
    // Status polling
    // =========================================================================

    async fn wait_status(&self, ldev: u32, check: StatusCheck) -> Result<()> {
        let ldev_arg = ldev.to_string();
        let args: Vec<&str> = match check {
            StatusCheck::Created => vec![
                "get",
                "ldev",
                "-ldev_id",
                &ldev_arg,
                "-check_status",
                NORMAL_STATUS,
            ],
            StatusCheck::Deleted => vec![
                "get",
                "ldev",
                "-ldev_id",
                &ldev_arg,
                "-check_status",
                "NOT",
                "DEFINED",
            ],
        };
        let deadline = Instant::now() + self.status_wait;
        loop {
            let result = self
                .shell
                .run_raidcom(&args, ExecOptions::default().no_raise())
                .await?;
            if result.exit == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(match check {
                    StatusCheck::Created => Error::DeviceCreationIncomplete { ldev },
                    StatusCheck::Deleted => Error::DeviceDeletionIncomplete { ldev },
                });
            }
            sleep(self.check_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::runner::{CommandResult, ScriptedRunner};
    use crate::config::{DriverConfig, LdevRange};
    use crate::lock::LockRegistry;
    use assert_matches::assert_matches;

    fn shell_with(
        runner: Arc<ScriptedRunner>,
        ldev_range: Option<LdevRange>,
    ) -> Arc<HorcmShell> {
        let config = Arc::new(DriverConfig {
            serial: "492015".into(),
            pool: "30".into(),
            ldev_range,
            target_ports: vec!["CL1-A".into()],
            pair_target_ports: vec!["CL1-A".into()],
            user: "user".into(),
            password: "secret".into(),
            ..DriverConfig::default()
        });
        HorcmShell::new(runner, config, LockRegistry::new())
    }

    fn manager(runner: Arc<ScriptedRunner>, range: Option<LdevRange>) -> Arc<DeviceManager> {
        DeviceManager::with_timing(
            shell_with(runner, range),
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
    }

    const UNDEFINED_1: &str = " 492015 1 - - NOT DEFINED - - - -\n";

    #[tokio::test]
    async fn test_create_without_range_uses_undefined_query() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom get ldev -ldev_list undefined -cnt 1",
            CommandResult::ok("LDEV : 1\nVOL_TYPE : NOT DEFINED\n"),
        );
        let devices = manager(runner.clone(), None);

        let ldev = devices.create(256, false).await.unwrap();
        assert_eq!(ldev, 1);
        assert_eq!(
            runner.calls_matching(
                "raidcom add ldev -ldev_id 1 -capacity 256G -emulation OPEN-V -pool 30"
            ),
            1
        );
        assert_eq!(
            runner.calls_matching("raidcom get ldev -ldev_id 1 -check_status NML"),
            1
        );
    }

    #[tokio::test]
    async fn test_create_vvol_targets_snapshot_pool() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom get ldev -ldev_list undefined -cnt 1",
            CommandResult::ok("LDEV : 9\n"),
        );
        let devices = manager(runner.clone(), None);

        devices.create(10, true).await.unwrap();
        assert_eq!(
            runner.calls_matching(
                "raidcom add ldev -ldev_id 9 -capacity 10G -emulation OPEN-V -pool snap"
            ),
            1
        );
    }

    #[tokio::test]
    async fn test_round_trip_allocation_in_range() {
        // Range [0, 1]: two allocations yield the two ids, a third exhausts.
        let runner = ScriptedRunner::new();
        runner.on_seq(
            "raidcom get ldev -ldev_id 0 -cnt 2 -key front_end",
            vec![
                CommandResult::ok(
                    " 492015 0 - - NOT DEFINED - - - -\n 492015 1 - - NOT DEFINED - - - -\n",
                ),
                CommandResult::ok(
                    " 492015 0 0 0 OPEN-V-CVS 2097152 - CVS 0\n 492015 1 - - NOT DEFINED - - - -\n",
                ),
                CommandResult::ok(
                    " 492015 0 0 0 OPEN-V-CVS 2097152 - CVS 0\n 492015 1 0 0 OPEN-V-CVS 2097152 - CVS 0\n",
                ),
            ],
        );
        let devices = manager(runner, Some(LdevRange { begin: 0, end: 1 }));

        let first = devices.create(1, false).await.unwrap();
        let second = devices.create(1, false).await.unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_ne!(first, second);

        assert_matches!(
            devices.create(1, false).await,
            Err(Error::ResourceExhausted { .. })
        );
    }

    #[tokio::test]
    async fn test_range_scan_advances_in_batches() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom get ldev -ldev_id 0 -cnt 1000 -key front_end",
            CommandResult::failed(INVALID_RANGE[0], ""),
        );
        runner.on(
            "raidcom get ldev -ldev_id 1000 -cnt 500 -key front_end",
            CommandResult::ok(" 492015 1200 - - NOT DEFINED - - - -\n"),
        );
        let devices = manager(runner, Some(LdevRange { begin: 0, end: 1499 }));

        let ldev = devices.create(1, false).await.unwrap();
        assert_eq!(ldev, 1200);
    }

    #[tokio::test]
    async fn test_creation_status_timeout_is_distinct() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom get ldev -ldev_list undefined -cnt 1",
            CommandResult::ok("LDEV : 1\n"),
        );
        runner.on(
            "raidcom get ldev -ldev_id 1 -check_status NML",
            CommandResult::failed(233, ""),
        );
        let devices = manager(runner, None);

        assert_matches!(
            devices.create(1, false).await,
            Err(Error::DeviceCreationIncomplete { ldev: 1 })
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let runner = ScriptedRunner::new();
        // Already undefined: the status check passes immediately.
        runner.on(
            "raidcom get ldev -ldev_id 5 -check_status NOT DEFINED",
            CommandResult::ok(""),
        );
        let devices = manager(runner.clone(), None);

        devices.delete(5).await.unwrap();
        devices.delete(5).await.unwrap();
        assert_eq!(runner.calls_matching("raidcom delete ldev"), 0);
    }

    #[tokio::test]
    async fn test_delete_polls_until_undefined() {
        let runner = ScriptedRunner::new();
        runner.on_seq(
            "raidcom get ldev -ldev_id 5 -check_status NOT DEFINED",
            vec![
                CommandResult::failed(1, "raidcom: testing condition has failed with exit(1).\n"),
                CommandResult::failed(1, ""),
                CommandResult::ok(""),
            ],
        );
        let devices = manager(runner.clone(), None);

        devices.delete(5).await.unwrap();
        assert_eq!(runner.calls_matching("raidcom delete ldev -ldev_id 5"), 1);
    }

    #[tokio::test]
    async fn test_extend_issues_capacity_delta() {
        let runner = ScriptedRunner::new();
        let devices = manager(runner.clone(), None);

        devices.extend(3, 128, 256).await.unwrap();
        assert_eq!(
            runner.calls_matching("raidcom extend ldev -ldev_id 3 -capacity 128G"),
            1
        );
    }

    #[tokio::test]
    async fn test_manageable_size_checks() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom get ldev -ldev_id 0",
            CommandResult::ok(
                "LDEV : 0\nVOL_TYPE : OPEN-V-CVS\nVOL_ATTR : CVS : HDP\n\
                 VOL_Capacity(BLK) : 2097152\nNUM_PORT : 0\nSTS : NML\n",
            ),
        );
        // Paired device: MRCF attribute is not manageable.
        runner.on(
            "raidcom get ldev -ldev_id 10",
            CommandResult::ok(
                "LDEV : 10\nVOL_TYPE : OPEN-V-CVS\nVOL_ATTR : CVS : MRCF : HDP\n\
                 VOL_Capacity(BLK) : 2097152\nNUM_PORT : 0\nSTS : NML\n",
            ),
        );
        // Mapped device.
        runner.on(
            "raidcom get ldev -ldev_id 6",
            CommandResult::ok(
                "LDEV : 6\nVOL_TYPE : OPEN-V-CVS\nVOL_ATTR : CVS : HDP\n\
                 VOL_Capacity(BLK) : 2097152\nNUM_PORT : 1\nSTS : NML\n",
            ),
        );
        // Size not on a GB boundary.
        runner.on(
            "raidcom get ldev -ldev_id 8",
            CommandResult::ok(
                "LDEV : 8\nVOL_TYPE : OPEN-V-CVS\nVOL_ATTR : CVS : HDP\n\
                 VOL_Capacity(BLK) : 2097153\nNUM_PORT : 0\nSTS : NML\n",
            ),
        );
        let devices = manager(runner, None);

        assert_eq!(devices.manageable_size_gb(0).await.unwrap(), 1);
        assert_matches!(
            devices.manageable_size_gb(10).await,
            Err(Error::InvalidReference { .. })
        );
        assert_matches!(
            devices.manageable_size_gb(6).await,
            Err(Error::InvalidReference { .. })
        );
        assert_matches!(
            devices.manageable_size_gb(8).await,
            Err(Error::InvalidReference { .. })
        );
    }

    #[tokio::test]
    async fn test_is_vvol() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom get ldev -ldev_id 5",
            CommandResult::ok(
                "LDEV : 5\nVOL_TYPE : OPEN-V-CVS\nVOL_ATTR : CVS : HDP : VVOL\nSTS : NML\n",
            ),
        );
        runner.on(
            "raidcom get ldev -ldev_id 0",
            CommandResult::ok("LDEV : 0\nVOL_ATTR : CVS : HDP\nSTS : NML\n"),
        );
        let devices = manager(runner, None);

        assert!(devices.is_vvol(5).await.unwrap());
        assert!(!devices.is_vvol(0).await.unwrap());
    }
}
