//! Replication pair state machine
//!
//! Classifies devices as unpaired, primary or secondary from their
//! attributes plus pair queries, creates full-copy and thin-copy mirrors,
//! waits for convergence, and tears pairs down in order with compensating
//! actions when a step fails. A device supports a fixed number of
//! concurrent full-copy mirrors; when all are taken, a split secondary is
//! reclaimed before the request is refused as a capacity error.
//!
//! Full-copy and thin-copy relationships coexist on one device and are
//! tracked independently; classification merges both.

use crate::cli::invoker::{
    ExecOptions, HorcmShell, SuccessCodes, DEFAULT_PROCESS_WAIT, NO_SUCH_DEVICE,
};
use crate::config::{CopyMethod, INSTANCE_PAIR};
use crate::device::{DeviceManager, FULL_ATTR, THIN_ATTR, VVOL_ATTR};
use crate::error::{Error, Result};
use crate::protocol::StorageState;
use crate::target::MappingReconciler;
use crate::DRIVER_PREFIX;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Concurrent full-copy mirrors supported per device
pub const MAX_MIRROR_UNITS: usize = 3;

/// Snapshot slots are shared modulo this bound to cap parallel slots
const SNAP_SLOT_MODULUS: u32 = 8;

// =============================================================================
// Pair Status
// =============================================================================

/// Pair status, as reported by status words and event-wait exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStatus {
    Simple,
    Copying,
    Paired,
    SplitSuspended,
    Error,
    Unknown,
}

impl PairStatus {
    /// Map a reported status word
    pub fn from_word(word: &str) -> Self {
        match word {
            "SMPL" => PairStatus::Simple,
            "COPY" | "RCPY" => PairStatus::Copying,
            "PAIR" | "PFUL" => PairStatus::Paired,
            "PSUS" | "PFUS" | "SSUS" => PairStatus::SplitSuspended,
            "PSUE" => PairStatus::Error,
            _ => PairStatus::Unknown,
        }
    }

    /// Map a `pairevtwait -nowaits` exit code
    pub fn from_exit(code: i32) -> Self {
        match code {
            1 => PairStatus::Simple,
            2 => PairStatus::Copying,
            3 => PairStatus::Paired,
            4 => PairStatus::SplitSuspended,
            5 => PairStatus::Error,
            _ => PairStatus::Unknown,
        }
    }
}

// =============================================================================
// Pair Info
// =============================================================================

/// One secondary of a pair relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryInfo {
    pub ldev: u32,
    /// The secondary is split/suspended: consistent and detachable
    pub is_split: bool,
    pub is_thin: bool,
}

/// Merged pair information for a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairInfo {
    pub pvol: u32,
    pub secondaries: Vec<SecondaryInfo>,
}

/// One full-copy relationship as seen from a pairdisplay row
#[derive(Debug, Clone)]
struct FullPairView {
    pvol: u32,
    secondary: SecondaryInfo,
}

/// Role a device plays in full-copy relationships
enum VolRole {
    Simple,
    Primary,
    Secondary(FullPairView),
}

fn pair_ldev_name(pvol: u32, svol: u32) -> String {
    format!("{}-LDEV-{}-{}", DRIVER_PREFIX, pvol, svol)
}

/// Both copy kinds contribute to one merged record, tracked per method
fn merge_pair_info(info: &mut Option<PairInfo>, pvol: u32, secondaries: Vec<SecondaryInfo>) {
    match info.take() {
        Some(mut existing) => {
            existing.secondaries.extend(secondaries);
            *info = Some(existing);
        }
        None => *info = Some(PairInfo { pvol, secondaries }),
    }
}

/// Parse the partner row of a `pairdisplay -CLI` listing
fn parse_pairdisplay(stdout: &str) -> Option<FullPairView> {
    let tokens: Vec<&str> = stdout.lines().nth(2)?.split_whitespace().collect();
    if tokens.len() < 13 {
        return None;
    }
    let svol: u32 = tokens[8].parse().ok()?;
    let pvol: u32 = tokens[12].parse().ok()?;
    Some(FullPairView {
        pvol,
        secondary: SecondaryInfo {
            ldev: svol,
            is_split: tokens[10] == "SSUS",
            is_thin: false,
        },
    })
}

// =============================================================================
// Pair Manager
// =============================================================================

/// Creates, classifies and tears down replication pairs
pub struct PairManager {
    shell: Arc<HorcmShell>,
    devices: Arc<DeviceManager>,
    reconciler: Arc<MappingReconciler>,
    state: Arc<StorageState>,
    status_wait: Duration,
}

impl PairManager {
    pub fn new(
        shell: Arc<HorcmShell>,
        devices: Arc<DeviceManager>,
        reconciler: Arc<MappingReconciler>,
        state: Arc<StorageState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shell,
            devices,
            reconciler,
            state,
            status_wait: DEFAULT_PROCESS_WAIT,
        })
    }

    #[cfg(test)]
    fn with_status_wait(
        shell: Arc<HorcmShell>,
        devices: Arc<DeviceManager>,
        reconciler: Arc<MappingReconciler>,
        state: Arc<StorageState>,
        wait: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            shell,
            devices,
            reconciler,
            state,
            status_wait: wait,
        })
    }

    // =========================================================================
    // Classification
    // =========================================================================

    /// Merged full/thin pair information; `None` for an unpaired device
    pub async fn pair_info(&self, ldev: u32) -> Result<Option<PairInfo>> {
        let snapshot = self.devices.query(ldev).await?;
        if !snapshot.is_normal()
            || (!snapshot.has_attr(FULL_ATTR) && !snapshot.has_attr(THIN_ATTR))
        {
            return Ok(None);
        }

        let mut info: Option<PairInfo> = None;
        if snapshot.has_attr(FULL_ATTR) {
            if let Some((pvol, secondaries)) = self.full_copy_info(ldev).await? {
                merge_pair_info(&mut info, pvol, secondaries);
            }
        }
        if snapshot.has_attr(THIN_ATTR) {
            if let Some((pvol, secondaries)) = self.thin_copy_info(ldev).await? {
                merge_pair_info(&mut info, pvol, secondaries);
            }
        }
        Ok(info)
    }

    /// The replication source must be usable and not a virtual volume
    pub async fn check_copy_source(&self, pvol: u32) -> Result<()> {
        let snapshot = self.devices.query(pvol).await?;
        if !snapshot.is_normal() {
            return Err(Error::SourceUnavailable { ldev: pvol });
        }
        if snapshot.has_attr(VVOL_ATTR) {
            return Err(Error::NotSupported);
        }
        Ok(())
    }

    async fn vol_role(&self, ldev: u32) -> Result<VolRole> {
        let snapshot = self.devices.query(ldev).await?;
        if !snapshot.is_normal() {
            return Ok(VolRole::Simple);
        }
        if snapshot.has_attr(THIN_ATTR) {
            return Ok(VolRole::Primary);
        }
        if snapshot.has_attr(FULL_ATTR) {
            return Ok(match self.full_pair_view(ldev, 0).await? {
                Some(view) if view.pvol != ldev => VolRole::Secondary(view),
                _ => VolRole::Primary,
            });
        }
        Ok(VolRole::Simple)
    }

    async fn full_copy_info(&self, ldev: u32) -> Result<Option<(u32, Vec<SecondaryInfo>)>> {
        match self.vol_role(ldev).await? {
            VolRole::Simple => Ok(None),
            VolRole::Secondary(view) => Ok(Some((view.pvol, vec![view.secondary]))),
            VolRole::Primary => {
                let mut secondaries = Vec::new();
                for mun in 0..MAX_MIRROR_UNITS {
                    if let Some(view) = self.full_pair_view(ldev, mun).await? {
                        secondaries.push(view.secondary);
                    }
                }
                Ok(Some((ldev, secondaries)))
            }
        }
    }

    async fn thin_copy_info(&self, ldev: u32) -> Result<Option<(u32, Vec<SecondaryInfo>)>> {
        let result = self
            .shell
            .run_raidcom(
                &["get", "snapshot", "-ldev_id", &ldev.to_string()],
                ExecOptions::default(),
            )
            .await?;
        if result.stdout.trim().is_empty() {
            return Ok(None);
        }
        let tokens: Vec<String> = result
            .stdout
            .lines()
            .nth(1)
            .map(|line| line.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        if tokens.len() < 7 {
            return Ok(None);
        }
        let partner: u32 = match tokens[6].parse() {
            Ok(partner) => partner,
            Err(_) => return Ok(None),
        };
        let is_split = PairStatus::from_word(&tokens[2]) == PairStatus::SplitSuspended;
        let (pvol, svol) = if tokens[1] == "P-VOL" {
            (ldev, partner)
        } else {
            (partner, ldev)
        };
        debug!(pvol, svol, status = %tokens[2], "thin copy pair status");
        Ok(Some((
            pvol,
            vec![SecondaryInfo {
                ldev: svol,
                is_split,
                is_thin: true,
            }],
        )))
    }

    async fn full_pair_view(&self, ldev: u32, mun: usize) -> Result<Option<FullPairView>> {
        let stdout = self.pairdisplay(ldev, mun).await?;
        Ok(parse_pairdisplay(&stdout))
    }

    async fn pairdisplay(&self, ldev: u32, mun: usize) -> Result<String> {
        let serial = self.shell.config.serial.clone();
        let result = self
            .shell
            .run_pair_cmd(
                "pairdisplay",
                &["-CLI", "-d", &serial, &ldev.to_string(), &mun.to_string()],
                ExecOptions::default()
                    .success(SuccessCodes::HorcmPlus(&NO_SUCH_DEVICE))
                    .no_raise(),
            )
            .await?;
        Ok(result.stdout)
    }

    /// Whether the device carries no full-copy relationship any more
    async fn is_smpl(&self, ldev: u32) -> Result<bool> {
        let stdout = self.pairdisplay(ldev, 0).await?;
        if stdout.trim().is_empty() {
            return Ok(true);
        }
        let role = stdout
            .lines()
            .nth(2)
            .and_then(|line| line.split_whitespace().nth(9));
        Ok(matches!(role, None | Some("-") | Some("SMPL")))
    }

    async fn pairevtwait(&self, ldev: u32) -> Result<PairStatus> {
        let serial = self.shell.config.serial.clone();
        let result = self
            .shell
            .run_pair_cmd(
                "pairevtwait",
                &["-d", &serial, &ldev.to_string(), "-nowaits"],
                ExecOptions::default(),
            )
            .await?;
        Ok(PairStatus::from_exit(result.exit))
    }

    async fn thin_svol_status(&self, ldev: u32) -> Result<PairStatus> {
        let result = self
            .shell
            .run_raidcom(
                &["get", "snapshot", "-ldev_id", &ldev.to_string()],
                ExecOptions::default(),
            )
            .await?;
        if result.stdout.trim().is_empty() {
            return Ok(PairStatus::Simple);
        }
        Ok(result
            .stdout
            .lines()
            .nth(1)
            .and_then(|line| line.split_whitespace().nth(2))
            .map(PairStatus::from_word)
            .unwrap_or(PairStatus::Unknown))
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a mirror from `pvol` to `svol`
    ///
    /// A device still playing secondary in another relationship is freed
    /// first; both devices get a pair-dedicated path before the copy
    /// starts, and those paths are released again if anything fails.
    pub async fn create(&self, pvol: u32, svol: u32, is_thin: bool) -> Result<()> {
        let _guard = self
            .shell
            .locks
            .acquire(&self.shell.lock_names.create_pair)
            .await;

        let role = self.vol_role(pvol).await?;
        if let VolRole::Secondary(view) = &role {
            self.delete_based_on_svol(view.pvol, &view.secondary, true)
                .await?;
        }
        let primary_role = matches!(role, VolRole::Primary);

        let mut mapped: Vec<u32> = Vec::new();
        if !primary_role {
            self.init_pair_connection(pvol).await?;
            mapped.push(pvol);
        }

        let outcome = async {
            self.init_pair_connection(svol).await?;
            mapped.push(svol);
            if is_thin {
                self.create_thin(pvol, svol).await
            } else {
                self.create_full(pvol, svol, primary_role).await
            }
        }
        .await;

        if let Err(err) = outcome {
            for ldev in &mapped {
                if self.terminate_pair_connection(*ldev).await.is_err() {
                    warn!(ldev, "failed to unmap a logical device");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn create_full(&self, pvol: u32, svol: u32, primary_role: bool) -> Result<()> {
        let mun = if primary_role {
            self.unused_mirror_unit(pvol).await?
        } else {
            0
        };
        let copy_group = self.state.copy_groups[mun].clone();
        let ldev_name = pair_ldev_name(pvol, svol);
        let mut restarted = false;
        let mut created = false;

        let outcome = async {
            self.add_pair_config(pvol, svol, &copy_group, &ldev_name, mun)
                .await?;
            self.shell.restart_instance(INSTANCE_PAIR).await?;
            restarted = true;
            let speed = self.shell.config.copy_speed.to_string();
            self.shell
                .run_pair_cmd(
                    "paircreate",
                    &[
                        "-g", &copy_group, "-d", &ldev_name, "-c", &speed, "-vl", "-split",
                        "-fq", "quick",
                    ],
                    ExecOptions::default(),
                )
                .await?;
            created = true;
            self.wait_full_copy(
                svol,
                &[PairStatus::SplitSuspended, PairStatus::Copying],
                self.shell.config.copy_check_interval,
            )
            .await
        }
        .await;

        if let Err(err) = outcome {
            // Best-effort teardown; the original failure is what callers see.
            if created {
                let settled = self
                    .wait_full_copy(
                        svol,
                        &[
                            PairStatus::Paired,
                            PairStatus::SplitSuspended,
                            PairStatus::Error,
                        ],
                        self.shell.config.copy_check_interval,
                    )
                    .await;
                if settled.is_err() {
                    warn!(pvol, svol, "failed to change the status of a full copy pair");
                }
                let interval = self.shell.config.async_copy_check_interval;
                if self.delete_full(pvol, svol, interval).await.is_err() {
                    warn!(pvol, svol, "failed to delete a full copy pair");
                }
            }
            match self.is_smpl(svol).await {
                Ok(true) => {
                    if self
                        .delete_pair_config(pvol, svol, &copy_group, &ldev_name)
                        .await
                        .is_err()
                    {
                        warn!(pvol, svol, "failed to delete full copy pair configuration");
                    }
                }
                Ok(false) => {}
                Err(_) => {
                    warn!(pvol, svol, "failed to delete full copy pair configuration")
                }
            }
            if restarted && self.shell.restart_instance(INSTANCE_PAIR).await.is_err() {
                warn!("failed to reload the pair configuration");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn create_thin(&self, pvol: u32, svol: u32) -> Result<()> {
        let thin_pool = self
            .shell
            .config
            .thin_pool
            .clone()
            .ok_or_else(|| Error::InvalidParameter("thin_pool".into()))?;
        let snapshot_name = format!("{}-SNAP{}", DRIVER_PREFIX, svol % SNAP_SLOT_MODULUS);
        let speed = self.shell.config.copy_speed.to_string();
        self.shell
            .run_raidcom(
                &[
                    "add",
                    "snapshot",
                    "-ldev_id",
                    &pvol.to_string(),
                    &svol.to_string(),
                    "-pool",
                    &thin_pool,
                    "-snapshot_name",
                    &snapshot_name,
                    "-copy_size",
                    &speed,
                ],
                ExecOptions::default(),
            )
            .await?;

        let interval = self.shell.config.copy_check_interval;
        let outcome = async {
            self.wait_thin_copy(svol, PairStatus::Paired, interval).await?;
            // The secondary only becomes addressable once materialized.
            self.shell
                .run_raidcom(
                    &[
                        "modify",
                        "snapshot",
                        "-ldev_id",
                        &svol.to_string(),
                        "-snapshot_data",
                        "create",
                    ],
                    ExecOptions::default(),
                )
                .await?;
            self.wait_thin_copy(svol, PairStatus::SplitSuspended, interval)
                .await
        }
        .await;

        if let Err(err) = outcome {
            let interval = self.shell.config.async_copy_check_interval;
            if self.delete_thin(pvol, svol, interval).await.is_err() {
                warn!(pvol, svol, "failed to delete a thin copy pair");
            }
            return Err(err);
        }
        Ok(())
    }

    /// First mirror unit with no pair; reclaims a split secondary when all
    /// units are taken. Exhaustion is a capacity error, not transient.
    async fn unused_mirror_unit(&self, ldev: u32) -> Result<usize> {
        let mut existing: Vec<(SecondaryInfo, usize)> = Vec::new();
        for mun in 0..MAX_MIRROR_UNITS {
            match self.full_pair_view(ldev, mun).await? {
                None => return Ok(mun),
                Some(view) => existing.push((view.secondary, mun)),
            }
        }
        for (secondary, mun) in existing {
            if secondary.is_split {
                self.delete_based_on_svol(ldev, &secondary, true).await?;
                return Ok(mun);
            }
        }
        Err(Error::MaxPairsExceeded {
            copy_method: CopyMethod::Full.to_string(),
            pvol: ldev,
        })
    }

    async fn add_pair_config(
        &self,
        pvol: u32,
        svol: u32,
        copy_group: &str,
        ldev_name: &str,
        mun: usize,
    ) -> Result<()> {
        let pvol_group = format!("{}P", copy_group);
        let svol_group = format!("{}S", copy_group);
        self.shell
            .run_raidcom(
                &[
                    "add",
                    "device_grp",
                    "-device_grp_name",
                    &pvol_group,
                    ldev_name,
                    "-ldev_id",
                    &pvol.to_string(),
                ],
                ExecOptions::default(),
            )
            .await?;
        self.shell
            .run_raidcom(
                &[
                    "add",
                    "device_grp",
                    "-device_grp_name",
                    &svol_group,
                    ldev_name,
                    "-ldev_id",
                    &svol.to_string(),
                ],
                ExecOptions::default(),
            )
            .await?;

        let entries = self.copy_group_entries(copy_group).await?;
        if entries == 1 {
            // A half-registered group from an earlier crash; re-register it.
            self.shell
                .run_raidcom(
                    &["delete", "copy_grp", "-copy_grp_name", copy_group],
                    ExecOptions::default(),
                )
                .await?;
        }
        if entries != 2 {
            self.shell
                .run_raidcom_im(
                    &[
                        "add",
                        "copy_grp",
                        "-copy_grp_name",
                        copy_group,
                        &pvol_group,
                        &svol_group,
                        "-mirror_id",
                        &mun.to_string(),
                    ],
                    ExecOptions::default(),
                )
                .await?;
        }
        Ok(())
    }

    async fn copy_group_entries(&self, copy_group: &str) -> Result<usize> {
        let result = self
            .shell
            .run_raidcom(&["get", "copy_grp"], ExecOptions::default())
            .await?;
        let mut count = 0;
        for line in result.stdout.lines().skip(1) {
            if line.split_whitespace().next() == Some(copy_group) {
                count += 1;
                if count == 2 {
                    break;
                }
            }
        }
        Ok(count)
    }

    async fn delete_pair_config(
        &self,
        pvol: u32,
        svol: u32,
        copy_group: &str,
        ldev_name: &str,
    ) -> Result<()> {
        let pvol_group = format!("{}P", copy_group);
        let svol_group = format!("{}S", copy_group);
        if self.device_grp_has(&pvol_group, pvol, ldev_name).await? {
            self.shell
                .run_raidcom(
                    &[
                        "delete",
                        "device_grp",
                        "-device_grp_name",
                        &pvol_group,
                        "-ldev_id",
                        &pvol.to_string(),
                    ],
                    ExecOptions::default(),
                )
                .await?;
        }
        if self.device_grp_has(&svol_group, svol, ldev_name).await? {
            self.shell
                .run_raidcom(
                    &[
                        "delete",
                        "device_grp",
                        "-device_grp_name",
                        &svol_group,
                        "-ldev_id",
                        &svol.to_string(),
                    ],
                    ExecOptions::default(),
                )
                .await?;
        }
        Ok(())
    }

    async fn device_grp_has(&self, group: &str, ldev: u32, ldev_name: &str) -> Result<bool> {
        let result = self
            .shell
            .run_raidcom(
                &["get", "device_grp", "-device_grp_name", group],
                ExecOptions::default(),
            )
            .await?;
        for line in result.stdout.lines().skip(1) {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() >= 3 && tokens[2].parse::<u32>().ok() == Some(ldev) {
                return Ok(tokens[1] == ldev_name);
            }
        }
        Ok(false)
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Tear down the pairs a device participates in
    ///
    /// For a primary, every split non-thin secondary is deleted; thin and
    /// busy secondaries are collected instead, and with `require_all_split`
    /// a non-empty busy list fails the call after the partial cleanup.
    pub async fn delete(&self, ldev: u32, require_all_split: bool) -> Result<()> {
        let _guard = self
            .shell
            .locks
            .acquire(&self.shell.lock_names.create_pair)
            .await;
        let info = match self.pair_info(ldev).await? {
            None => return Ok(()),
            Some(info) => info,
        };
        if info.pvol == ldev {
            self.delete_based_on_pvol(&info, require_all_split).await
        } else {
            self.delete_based_on_svol(info.pvol, &info.secondaries[0], false)
                .await
        }
    }

    async fn delete_based_on_pvol(&self, info: &PairInfo, require_all_split: bool) -> Result<()> {
        let mut busy: Vec<String> = Vec::new();
        let mut restart_needed = false;

        let outcome: Result<()> = async {
            for secondary in &info.secondaries {
                if secondary.is_thin || !secondary.is_split {
                    busy.push(secondary.ldev.to_string());
                    continue;
                }
                self.delete_pair_from_storage(info.pvol, secondary).await?;
                restart_needed = true;
                self.terminate_pair_connection(secondary.ldev).await?;
            }
            if busy.is_empty() {
                self.terminate_pair_connection(info.pvol).await?;
            }
            Ok(())
        }
        .await;

        if restart_needed && self.shell.restart_instance(INSTANCE_PAIR).await.is_err() {
            warn!("failed to reload the pair configuration");
        }
        outcome?;

        if require_all_split && !busy.is_empty() {
            return Err(Error::PairBusy {
                pvol: info.pvol,
                svols: busy.join(", "),
            });
        }
        Ok(())
    }

    async fn delete_based_on_svol(
        &self,
        pvol: u32,
        secondary: &SecondaryInfo,
        no_restart: bool,
    ) -> Result<()> {
        if !secondary.is_split {
            return Err(Error::PairBusy {
                pvol,
                svols: secondary.ldev.to_string(),
            });
        }
        let mut restart_needed = false;
        let outcome = async {
            self.delete_pair_from_storage(pvol, secondary).await?;
            restart_needed = true;
            self.terminate_pair_connection(secondary.ldev).await?;
            self.terminate_pair_connection(pvol).await
        }
        .await;
        if !no_restart
            && restart_needed
            && self.shell.restart_instance(INSTANCE_PAIR).await.is_err()
        {
            warn!("failed to reload the pair configuration");
        }
        outcome
    }

    async fn delete_pair_from_storage(&self, pvol: u32, secondary: &SecondaryInfo) -> Result<()> {
        let interval = self.shell.config.async_copy_check_interval;
        if secondary.is_thin {
            self.delete_thin(pvol, secondary.ldev, interval).await
        } else {
            self.delete_full(pvol, secondary.ldev, interval).await
        }
    }

    async fn delete_full(&self, pvol: u32, svol: u32, interval: Duration) -> Result<()> {
        let stdout = self.pairdisplay(svol, 0).await?;
        if stdout.trim().is_empty() {
            return Ok(());
        }
        let copy_group = stdout
            .lines()
            .nth(2)
            .and_then(|line| line.split_whitespace().next())
            .ok_or_else(|| Error::ResourceNotFound {
                resource: "copy group".into(),
            })?
            .to_string();
        let ldev_name = pair_ldev_name(pvol, svol);

        // The pair instance only sees the relationship from the primary
        // side once its configuration is reloaded.
        let local_role = stdout
            .lines()
            .nth(1)
            .and_then(|line| line.split_whitespace().nth(9));
        if local_role != Some("P-VOL") {
            self.shell.restart_instance(INSTANCE_PAIR).await?;
        }

        let outcome = async {
            self.shell
                .run_pair_cmd(
                    "pairsplit",
                    &["-g", &copy_group, "-d", &ldev_name, "-S"],
                    ExecOptions::default(),
                )
                .await?;
            self.wait_full_copy(svol, &[PairStatus::Simple], interval)
                .await
        }
        .await;

        if self.is_smpl(svol).await.unwrap_or(false) {
            let config_result = self
                .delete_pair_config(pvol, svol, &copy_group, &ldev_name)
                .await;
            if let Err(config_err) = config_result {
                if outcome.is_ok() {
                    return Err(config_err);
                }
                warn!(pvol, svol, "failed to delete full copy pair configuration");
            }
        }
        outcome
    }

    async fn delete_thin(&self, pvol: u32, svol: u32, interval: Duration) -> Result<()> {
        let result = self
            .shell
            .run_raidcom(
                &["get", "snapshot", "-ldev_id", &svol.to_string()],
                ExecOptions::default(),
            )
            .await?;
        if result.stdout.trim().is_empty() {
            return Ok(());
        }
        let mun = result
            .stdout
            .lines()
            .nth(1)
            .and_then(|line| line.split_whitespace().nth(5))
            .ok_or_else(|| Error::ResourceNotFound {
                resource: "snapshot mirror unit".into(),
            })?
            .to_string();

        self.shell
            .run_raidcom(
                &["unmap", "snapshot", "-ldev_id", &svol.to_string()],
                ExecOptions::default().success(SuccessCodes::All),
            )
            .await?;
        self.shell
            .run_raidcom(
                &[
                    "delete",
                    "snapshot",
                    "-ldev_id",
                    &pvol.to_string(),
                    "-mirror_id",
                    &mun,
                ],
                ExecOptions::default(),
            )
            .await?;

        let deadline = Instant::now() + self.status_wait;
        loop {
            let snapshot = self.devices.query(svol).await?;
            if !snapshot.is_normal() || !snapshot.has_attr(THIN_ATTR) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::PairStatusTimeout {
                    copy_method: CopyMethod::Thin.to_string(),
                    svol,
                });
            }
            sleep(interval).await;
        }
    }

    // =========================================================================
    // Pair-dedicated paths
    // =========================================================================

    /// Map a device to the first pair target that accepts it
    async fn init_pair_connection(&self, ldev: u32) -> Result<()> {
        for (port, gid) in &self.state.pair_targets {
            let target = [(port.clone(), gid.clone())];
            match self.reconciler.map_ldev(&target, ldev).await {
                Ok(_) => return Ok(()),
                Err(_) => {
                    warn!(ldev, port = %port, gid = %gid, "failed to map a logical device");
                }
            }
        }
        Err(Error::PairMappingFailed { ldev })
    }

    /// Release a device's pair-dedicated paths once no pair needs them
    async fn terminate_pair_connection(&self, ldev: u32) -> Result<()> {
        let snapshot = self.devices.query(ldev).await?;
        let thin_status = self.thin_svol_status(ldev).await?;
        if (snapshot.is_normal() && snapshot.has_attr(FULL_ATTR))
            || thin_status != PairStatus::Simple
        {
            debug!(ldev, "device still paired, skipping unmap");
            return Ok(());
        }
        let mapped = self
            .reconciler
            .find_mapped_targets(ldev, self.state.pair_attach_ports(), true)
            .await?;
        self.reconciler.unmap_ldev(&mapped, ldev).await
    }

    // =========================================================================
    // Status waits
    // =========================================================================

    async fn wait_full_copy(
        &self,
        svol: u32,
        statuses: &[PairStatus],
        interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + self.status_wait;
        loop {
            let status = self.pairevtwait(svol).await?;
            if statuses.contains(&status) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::PairStatusTimeout {
                    copy_method: CopyMethod::Full.to_string(),
                    svol,
                });
            }
            sleep(interval).await;
        }
    }

    async fn wait_thin_copy(
        &self,
        svol: u32,
        status: PairStatus,
        interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + self.status_wait;
        loop {
            if self.thin_svol_status(svol).await? == status {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::PairStatusTimeout {
                    copy_method: CopyMethod::Thin.to_string(),
                    svol,
                });
            }
            sleep(interval).await;
        }
    }
}
