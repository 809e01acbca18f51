//! Per-object, per-branch validity flags.
//!
//! Two related pieces of state live here:
//!
//! - [`BranchFlag`]: the 8-bit word persisted in an xattr on each branch's
//!   copy of an object. It records whether that copy is the primary, known
//!   bad, or mid-recovery, plus the replication pattern chosen at create.
//! - [`ValidFlags`]: the in-memory per-category validity the dispatcher
//!   consults when choosing which branches to read from.
//!
//! On disk the flag is four little-endian bytes with a 24-bit symbol in the
//! high bits so torn or foreign values are rejected on load.

use std::path::Path;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::branch::Branch;
use crate::branch_fs::BranchError;
use crate::error::{ReplicaError, ReplicaResult};

/// Replication pattern stored in the low bits of a flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum RaidType {
    /// Reserved sentinel; never a valid rule policy.
    #[default]
    None,
    /// Single copy on the primary branch.
    #[strum(serialize = "raid0", serialize = "single")]
    Raid0,
    /// Full copy on every branch.
    #[strum(serialize = "raid1", serialize = "mirror", serialize = "replicate")]
    Raid1,
}

impl RaidType {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RaidType::None => "none",
            RaidType::Raid0 => "raid0",
            RaidType::Raid1 => "raid1",
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            RaidType::None => 0,
            RaidType::Raid0 => 1,
            RaidType::Raid1 => 2,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(RaidType::None),
            1 => Some(RaidType::Raid0),
            2 => Some(RaidType::Raid1),
            _ => None,
        }
    }

    /// Whether a non-primary branch is expected to hold a copy.
    pub fn replicates(&self) -> bool {
        !matches!(self, RaidType::Raid0)
    }
}

impl std::fmt::Display for RaidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

bitflags! {
    /// Data categories a branch copy can be authoritative for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ValidFlags: u32 {
        const DATA = 0x1;
        const ATTR = 0x2;
        const XATTR = 0x4;
        const BRANCH = 0x8;

        /// Everything a failed operation invalidates.
        const CONTENT = Self::DATA.bits() | Self::ATTR.bits() | Self::XATTR.bits();
    }
}

/// Persisted flag word of one branch copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BranchFlag(u32);

impl BranchFlag {
    pub const RAID_MASK: u32 = 0x0f;
    pub const PRIMARY: u32 = 0x10;
    pub const DATABAD: u32 = 0x20;
    pub const RECOVERING: u32 = 0x40;
    /// Set on every flag that was written deliberately.
    pub const SETED: u32 = 0x80;
    pub const DISK_MASK: u32 = 0xff;
    pub const SYMBOL: u32 = 0xc0ff_ee00;
    pub const SYMBOL_MASK: u32 = !Self::DISK_MASK;

    /// Never written: a proper, non-recovering copy.
    pub const UNSET: BranchFlag = BranchFlag(0);

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// A healthy copy written with the given pattern.
    pub fn proper(primary: bool, raid: RaidType) -> Self {
        let mut raw = Self::SETED | raid.bits();
        if primary {
            raw |= Self::PRIMARY;
        }
        Self(raw)
    }

    /// A copy known to hold bad data.
    pub fn databad(self) -> Self {
        Self(self.0 | Self::SETED | Self::DATABAD)
    }

    /// A copy a heal is rewriting.
    pub fn recovering(self) -> Self {
        Self(self.0 | Self::SETED | Self::DATABAD | Self::RECOVERING)
    }

    pub fn is_valid(&self) -> bool {
        is_valid(self.0)
    }

    pub fn is_set(&self) -> bool {
        self.0 & Self::SETED != 0
    }

    pub fn is_primary(&self) -> bool {
        self.0 & Self::PRIMARY != 0
    }

    pub fn is_databad(&self) -> bool {
        self.0 & Self::DATABAD != 0
    }

    pub fn is_recovering(&self) -> bool {
        self.0 & Self::RECOVERING != 0
    }

    pub fn raid(&self) -> Option<RaidType> {
        RaidType::from_bits(self.0 & Self::RAID_MASK)
    }

    pub fn encode(&self) -> [u8; 4] {
        (self.0 | Self::SYMBOL).to_le_bytes()
    }

    /// Decode a persisted value; the raw word is returned on rejection.
    pub fn decode(bytes: &[u8]) -> Result<Self, u32> {
        let mut word = [0u8; 4];
        let n = bytes.len().min(4);
        word[..n].copy_from_slice(&bytes[..n]);
        let raw = u32::from_le_bytes(word);

        if bytes.len() != 4 || raw & Self::SYMBOL_MASK != Self::SYMBOL {
            return Err(raw);
        }
        let flag = Self(raw & Self::DISK_MASK);
        if flag.is_valid() { Ok(flag) } else { Err(raw) }
    }
}

impl std::fmt::Display for BranchFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Flag invariants: zero is always valid; anything else must carry
/// `SETED`, stay within the disk mask, and never be recovering without
/// also being data-bad.
pub fn is_valid(raw: u32) -> bool {
    if raw == 0 {
        return true;
    }
    if raw & !BranchFlag::DISK_MASK != 0 || raw & BranchFlag::SETED == 0 {
        return false;
    }
    !(raw & BranchFlag::RECOVERING != 0 && raw & BranchFlag::DATABAD == 0)
}

/// Load the flag of `path` on `branch`. An absent xattr reads as unset.
pub async fn get_flag(branch: &Branch, path: &Path) -> ReplicaResult<BranchFlag> {
    match branch.ops().getxattr(path, branch.flag_xattr()).await {
        Ok(bytes) => BranchFlag::decode(&bytes).map_err(|raw| ReplicaError::InconsistentFlag {
            bindex: branch.bindex(),
            raw,
        }),
        Err(BranchError::NoData(_)) => Ok(BranchFlag::UNSET),
        Err(e) => Err(ReplicaError::branch(branch.bindex(), e)),
    }
}

/// Persist `flag` for `path` on `branch`.
pub async fn set_flag(branch: &Branch, path: &Path, flag: BranchFlag) -> ReplicaResult<()> {
    if !flag.is_valid() {
        return Err(ReplicaError::InconsistentFlag {
            bindex: branch.bindex(),
            raw: flag.raw(),
        });
    }
    tracing::trace!(bindex = branch.bindex(), path = %path.display(), %flag, "set flag");
    branch
        .ops()
        .setxattr(path, branch.flag_xattr(), &flag.encode())
        .await
        .map_err(|e| ReplicaError::branch(branch.bindex(), e))
}
