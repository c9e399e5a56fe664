use crate::{artifact::Role, partition::PartitionRecord, Error};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_TARGETS: &str = include_str!("cfg/targets.toml");
pub const DEFAULT_TARGET: &str = "esp32-s3";
/// Erased NOR flash reads back as all ones.
pub const ERASED_BYTE: u8 = 0xff;

#[derive(Debug, Clone, Deserialize)]
pub struct TargetTable {
    targets: BTreeMap<String, TargetProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetProfile {
    pub flash_mode: String,
    pub flash_freq: String,
    pub flash_size: String,
    #[serde(default = "erased_byte")]
    pub fill_byte: u8,
    pub companion_app: Option<PathBuf>,
    #[serde(default)]
    pub slots: Vec<FixedSlot>,
}

/// Where a role goes when the partition table has no row for it.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FixedSlot {
    pub role: Role,
    pub offset: u32,
    pub size: u32,
}

impl FixedSlot {
    fn check(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err("zero size".to_string());
        }
        if self.offset.checked_add(self.size).is_none() {
            return Err(format!(
                "{:#x} + {:#x} extends past the 32-bit address space",
                self.offset, self.size
            ));
        }
        Ok(())
    }
}

fn erased_byte() -> u8 {
    ERASED_BYTE
}

impl TargetTable {
    pub fn builtin() -> Result<Self, Error> {
        Self::parse(DEFAULT_TARGETS)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(Error::artifact(path))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let table: TargetTable = toml::from_str(text)?;
        for (name, profile) in &table.targets {
            for slot in &profile.slots {
                slot.check().map_err(|reason| Error::InvalidSlot {
                    target: name.clone(),
                    role: slot.role,
                    reason,
                })?;
            }
        }
        Ok(table)
    }

    pub fn get(&self, target: &str) -> Result<&TargetProfile, Error> {
        self.targets
            .get(target)
            .ok_or_else(|| Error::UnknownTarget(target.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }
}

impl TargetProfile {
    /// The fixed slot for `role`, as a record named after the role's partition.
    pub fn slot(&self, role: Role) -> Option<PartitionRecord> {
        self.slots
            .iter()
            .find(|slot| slot.role == role)
            .map(|slot| PartitionRecord::new(role.partition_name(), slot.offset, slot.size))
    }

    /// Flash size in bytes, or `None` for sizes esptool resolves itself (`detect`, `keep`).
    pub fn flash_size_bytes(&self) -> Option<u64> {
        let size = self.flash_size.trim();
        let (digits, scale) = if let Some(digits) = size.strip_suffix("MB") {
            (digits, 1024 * 1024)
        } else if let Some(digits) = size.strip_suffix("KB") {
            (digits, 1024)
        } else {
            return None;
        };
        digits.trim().parse::<u64>().ok().map(|n| n * scale)
    }

    pub fn flash_args(&self) -> String {
        format!(
            "--flash_mode {} --flash_freq {} --flash_size {}",
            self.flash_mode, self.flash_freq, self.flash_size
        )
    }
}
