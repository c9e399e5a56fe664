use crate::{
    partition::{overlap_error, PartitionRecord, PartitionTable},
    target::TargetProfile,
    Error,
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Bootloader,
    PartitionTable,
    OtaData,
    UserConfig,
    MainApp,
    CompanionApp,
    Assets,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Bootloader,
        Role::PartitionTable,
        Role::OtaData,
        Role::UserConfig,
        Role::MainApp,
        Role::CompanionApp,
        Role::Assets,
    ];

    pub fn is_required(self) -> bool {
        matches!(
            self,
            Role::Bootloader | Role::PartitionTable | Role::OtaData | Role::MainApp
        )
    }

    /// Name of the partition the role's artifact is written to.
    pub fn partition_name(self) -> &'static str {
        match self {
            Role::Bootloader => "bootloader",
            Role::PartitionTable => "partition_table",
            Role::OtaData => "otadata",
            Role::UserConfig => "custom",
            Role::MainApp => "ota_0",
            Role::CompanionApp => "blufi",
            Role::Assets => "assets",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Bootloader => "bootloader",
            Role::PartitionTable => "partition-table",
            Role::OtaData => "ota-data",
            Role::UserConfig => "user-config",
            Role::MainApp => "main-app",
            Role::CompanionApp => "companion-app",
            Role::Assets => "assets",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Candidate files for each role. The first candidate that exists is used.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    candidates: BTreeMap<Role, Vec<PathBuf>>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default locations inside an ESP-IDF project and its build directory.
    pub fn for_build(
        project_dir: &Path,
        build_dir: &Path,
        app_name: &str,
        profile: &TargetProfile,
    ) -> Self {
        let mut set = ArtifactSet::new();
        set.set(
            Role::Bootloader,
            build_dir.join("bootloader").join("bootloader.bin"),
        )
        .set(
            Role::PartitionTable,
            build_dir.join("partition_table").join("partition-table.bin"),
        )
        .set(Role::OtaData, build_dir.join("ota_data_initial.bin"))
        .set(Role::UserConfig, project_dir.join("config.bin"))
        .set(Role::MainApp, build_dir.join(format!("{}.bin", app_name)))
        .add_candidate(
            Role::Assets,
            build_dir.join("..").join("main").join("assets.bin"),
        )
        .add_candidate(Role::Assets, build_dir.join("assets.bin"));
        if let Some(companion_app) = &profile.companion_app {
            set.set(Role::CompanionApp, project_dir.join(companion_app));
        }
        set
    }

    /// Replaces every candidate of `role` with `path`.
    pub fn set(&mut self, role: Role, path: impl Into<PathBuf>) -> &mut Self {
        self.candidates.insert(role, vec![path.into()]);
        self
    }

    pub fn add_candidate(&mut self, role: Role, path: impl Into<PathBuf>) -> &mut Self {
        self.candidates.entry(role).or_default().push(path.into());
        self
    }

    pub fn candidates(&self, role: Role) -> &[PathBuf] {
        self.candidates.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// An artifact checked to fit the partition it is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactBinding {
    pub role: Role,
    pub partition: PartitionRecord,
    pub path: PathBuf,
    pub len: u64,
}

pub struct Resolver<'a> {
    table: &'a PartitionTable,
    profile: &'a TargetProfile,
}

impl<'a> Resolver<'a> {
    pub fn new(table: &'a PartitionTable, profile: &'a TargetProfile) -> Self {
        Resolver { table, profile }
    }

    /// The partition a role is written to: its table row, else the target's fixed slot.
    ///
    /// A fixed slot must not intersect any row of the table, bound or not.
    pub fn partition(&self, role: Role) -> Result<Option<PartitionRecord>, Error> {
        if let Some(record) = self.table.find(role.partition_name()) {
            return Ok(Some(record.clone()));
        }
        let slot = match self.profile.slot(role) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        if let Some(record) = self.table.records().iter().find(|r| r.overlaps(&slot)) {
            return Err(overlap_error(&slot, record));
        }
        log::debug!("{} uses fixed slot {}", role, slot);
        Ok(Some(slot))
    }

    pub fn resolve(&self, artifacts: &ArtifactSet) -> Result<Vec<ArtifactBinding>, Error> {
        let mut bindings = Vec::new();
        for &role in Role::ALL.iter() {
            if let Some(binding) = self.resolve_role(role, artifacts.candidates(role))? {
                bindings.push(binding);
            }
        }
        Ok(bindings)
    }

    fn resolve_role(
        &self,
        role: Role,
        candidates: &[PathBuf],
    ) -> Result<Option<ArtifactBinding>, Error> {
        let partition = match self.partition(role)? {
            Some(partition) => partition,
            None if role.is_required() => {
                return Err(Error::MissingPartition {
                    role,
                    partition: role.partition_name().to_string(),
                })
            }
            None => {
                log::warn!(
                    "No `{}` partition in the partition table, skipping {}",
                    role.partition_name(),
                    role
                );
                return Ok(None);
            }
        };

        let path = match candidates.iter().find(|path| path.is_file()) {
            Some(path) => path,
            None if role.is_required() => {
                return Err(match candidates.first() {
                    Some(path) => Error::MissingRequiredArtifact {
                        role,
                        path: path.clone(),
                    },
                    None => Error::UnsetArtifact(role),
                })
            }
            None => {
                match candidates.first() {
                    Some(path) => log::warn!("{} not found: {}, skipping", role, path.display()),
                    None => log::warn!("No file configured for {}, skipping", role),
                }
                return Ok(None);
            }
        };

        let len = fs::metadata(path).map_err(Error::artifact(path))?.len();
        if len > u64::from(partition.size) {
            return Err(Error::ArtifactTooLarge {
                role,
                partition: partition.name,
                size: len,
                capacity: partition.size,
            });
        }
        log::debug!(
            "{} -> {} ({:#x} of {:#x} bytes)",
            role,
            path.display(),
            len,
            partition.size
        );

        Ok(Some(ArtifactBinding {
            role,
            partition,
            path: path.clone(),
            len,
        }))
    }
}
