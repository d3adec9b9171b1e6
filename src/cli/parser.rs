//! Typed extraction from fixed-format command output
//!
//! The array reports state as fixed-format text: keyed blocks
//! (`LDEV : 1`), tabular listings, and acknowledgement lines. Each field
//! the driver reads has one fixed pattern and one target type. Extraction
//! is total: a pattern that does not match yields `None`, which callers
//! must treat as "field absent" - distinct from an empty or zero value.

use crate::PAIR_TARGET_NAME;
use once_cell::sync::Lazy;
use regex::Regex;

// =============================================================================
// Fields
// =============================================================================

/// Fields the driver extracts from command output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Group id from a host-group creation acknowledgement
    Gid,
    /// Device id from a keyed `get ldev` block
    Ldev,
    /// LUN from a path creation acknowledgement
    Lun,
    /// Mapped path count from a keyed `get ldev` block
    NumPort,
    /// Group id of the reserved pair target in a host-group listing
    PairGid,
    /// Mapped path list from a keyed `get ldev` block
    Ports,
    /// Attribute list from a keyed `get ldev` block
    VolAttr,
    /// Capacity in blocks from a keyed `get ldev` block
    VolSize,
    /// Volume type from a keyed `get ldev` block
    VolType,
    /// Device status from a keyed `get ldev` block
    Sts,
    /// First undefined id in a tabular front-end listing
    UndefinedLdev,
}

/// A typed field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::List(v) => Some(v),
            _ => None,
        }
    }
}

// =============================================================================
// Patterns
// =============================================================================

enum Kind {
    Int,
    Text,
    List,
}

static GID: Lazy<Regex> = Lazy::new(|| Regex::new(r"ID +(\d+)\(0x\w+\)").unwrap());
static LDEV: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^LDEV +: +(\d+)").unwrap());
static LUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"LUN +(\d+)\(0x\w+\)").unwrap());
static NUM_PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^NUM_PORT +: +(\d+)").unwrap());
static PAIR_GID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?m)^CL\w-\w+ +(\d+) +{} ", PAIR_TARGET_NAME)).unwrap()
});
static PORTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^PORTs +: +(.+)$").unwrap());
static VOL_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^VOL_ATTR +: +(.+)$").unwrap());
static VOL_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^VOL_Capacity\(BLK\) +: +(\d+)").unwrap());
static VOL_TYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^VOL_TYPE +: +(.+)$").unwrap());
static STS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^STS +: +(.+)").unwrap());
static UNDEFINED_LDEV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^ +\d+ +(\d+) +- +- +NOT +DEFINED").unwrap());

/// Separator between elements of a list field
static LIST_SEP: Lazy<Regex> = Lazy::new(|| Regex::new(r" +: +").unwrap());

impl Field {
    fn spec(&self) -> (&'static Regex, Kind) {
        match self {
            Field::Gid => (&GID, Kind::Text),
            Field::Ldev => (&LDEV, Kind::Int),
            Field::Lun => (&LUN, Kind::Int),
            Field::NumPort => (&NUM_PORT, Kind::Int),
            Field::PairGid => (&PAIR_GID, Kind::Text),
            Field::Ports => (&PORTS, Kind::List),
            Field::VolAttr => (&VOL_ATTR, Kind::List),
            Field::VolSize => (&VOL_SIZE, Kind::Int),
            Field::VolType => (&VOL_TYPE, Kind::Text),
            Field::Sts => (&STS, Kind::Text),
            Field::UndefinedLdev => (&UNDEFINED_LDEV, Kind::Int),
        }
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Extract a typed field from command output; `None` when absent
pub fn find_value(stdout: &str, field: Field) -> Option<FieldValue> {
    let (pattern, kind) = field.spec();
    let capture = pattern.captures(stdout)?.get(1)?.as_str();
    match kind {
        // The patterns only capture digits, so the parse cannot fail.
        Kind::Int => capture.parse().ok().map(FieldValue::Int),
        Kind::Text => Some(FieldValue::Text(capture.to_string())),
        Kind::List => Some(FieldValue::List(
            LIST_SEP
                .split(capture)
                .map(|item| item.trim().to_string())
                .collect(),
        )),
    }
}

/// Extract an integer field
pub fn find_int(stdout: &str, field: Field) -> Option<u64> {
    find_value(stdout, field)?.as_int()
}

/// Extract a text field
pub fn find_text(stdout: &str, field: Field) -> Option<String> {
    find_value(stdout, field)?.as_text().map(str::to_string)
}

/// Extract a list field
pub fn find_list(stdout: &str, field: Field) -> Option<Vec<String>> {
    find_value(stdout, field)?.as_list().map(<[String]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LDEV_BLOCK: &str = "\
LDEV : 4
VOL_TYPE : OPEN-V-CVS
VOL_ATTR : CVS : QS : HDP : HDT
VOL_Capacity(BLK) : 2097152
NUM_PORT : 0
STS : NML
";

    #[test]
    fn test_keyed_block_fields() {
        assert_eq!(find_int(LDEV_BLOCK, Field::Ldev), Some(4));
        assert_eq!(find_text(LDEV_BLOCK, Field::VolType).as_deref(), Some("OPEN-V-CVS"));
        assert_eq!(find_int(LDEV_BLOCK, Field::VolSize), Some(2_097_152));
        assert_eq!(find_int(LDEV_BLOCK, Field::NumPort), Some(0));
        assert_eq!(find_text(LDEV_BLOCK, Field::Sts).as_deref(), Some("NML"));
        assert_eq!(
            find_list(LDEV_BLOCK, Field::VolAttr),
            Some(vec![
                "CVS".to_string(),
                "QS".to_string(),
                "HDP".to_string(),
                "HDT".to_string()
            ])
        );
    }

    #[test]
    fn test_ldev_zero_is_present() {
        // Id 0 is a valid device; absence must stay distinguishable from 0.
        let stdout = "LDEV : 0\nVOL_TYPE : NOT DEFINED\n";
        assert_eq!(find_int(stdout, Field::Ldev), Some(0));
        assert_eq!(find_int("VOL_TYPE : NOT DEFINED\n", Field::Ldev), None);
    }

    #[test]
    fn test_absence_is_none_not_error() {
        // A bare "STS :" line carries no value.
        let stdout = "LDEV : 3\nSTS :\n";
        assert_eq!(find_text(stdout, Field::Sts), None);
        assert_eq!(find_value("", Field::VolAttr), None);
        assert_eq!(find_value("complete garbage \u{0}\u{1}", Field::Ldev), None);
    }

    #[test]
    fn test_acknowledgement_lines() {
        let stdout = "raidcom: Host group ID 2(0x2) will be used for adding.\n";
        assert_eq!(find_text(stdout, Field::Gid).as_deref(), Some("2"));

        let stdout = "raidcom: LUN 0(0x0) will be used for adding.\n";
        assert_eq!(find_int(stdout, Field::Lun), Some(0));
    }

    #[test]
    fn test_ports_list() {
        let stdout = "PORTs : CL1-A-0 0 AMG-172.0.0.1\nNUM_PORT : 1\n";
        assert_eq!(
            find_list(stdout, Field::Ports),
            Some(vec!["CL1-A-0 0 AMG-172.0.0.1".to_string()])
        );
    }

    #[test]
    fn test_pair_gid() {
        let stdout = "\
CL1-A 0 AMG-127.0.0.1 iqn-initiator.target B S 492015 L 8
CL1-A 2 AMG-pair00 iqn-pair.target B S 492015 L 8
";
        assert_eq!(find_text(stdout, Field::PairGid).as_deref(), Some("2"));
        // Host groups with other names never match.
        let stdout = "CL1-A 0 AMG-127.0.0.1 iqn B S 492015 L 8\n";
        assert_eq!(find_text(stdout, Field::PairGid), None);
    }

    #[test]
    fn test_undefined_ldev_row() {
        let stdout = "\
 492015 0 0 0 OPEN-V-CVS 2097152 - CVS 0
 492015 1 - - NOT DEFINED - - - -
";
        assert_eq!(find_int(stdout, Field::UndefinedLdev), Some(1));
        let all_defined = " 492015 0 0 0 OPEN-V-CVS 2097152 - CVS 0\n";
        assert_eq!(find_int(all_defined, Field::UndefinedLdev), None);
    }
}
