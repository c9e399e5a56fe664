pub mod artifact;
pub mod compose;
mod error;
pub mod layout;
pub mod partition;
pub mod target;

pub use artifact::{ArtifactBinding, ArtifactSet, Resolver, Role};
pub use compose::{compose, Image};
pub use error::Error;
pub use layout::{Layout, Segment, SegmentSource};
pub use partition::{PartitionRecord, PartitionTable};
pub use target::{TargetProfile, TargetTable};

use std::{
    fs,
    path::{Path, PathBuf},
};
use structopt::StructOpt;

/// Written to the build directory alongside the image.
pub const FLASH_ARGS_FILE: &str = "package_flash_args";

#[derive(StructOpt, Debug)]
pub struct Project {
    /// Project root, relative paths are resolved against it
    #[structopt(long, parse(from_os_str), default_value = ".")]
    pub project_dir: PathBuf,
    /// Build directory
    #[structopt(long, parse(from_os_str), default_value = "build")]
    pub build_dir: PathBuf,
    /// Partition table csv
    #[structopt(long, parse(from_os_str), default_value = "partitions/v2/16m.csv")]
    pub partition_table: PathBuf,
    /// Target chip
    #[structopt(long, default_value = target::DEFAULT_TARGET)]
    pub target: String,
    /// Target profiles to use instead of the built-in ones
    #[structopt(long, parse(from_os_str))]
    pub target_table: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
pub struct ArtifactOpt {
    /// Bootloader [default: <build-dir>/bootloader/bootloader.bin]
    #[structopt(long, parse(from_os_str))]
    pub bootloader: Option<PathBuf>,
    /// Partition table binary [default: <build-dir>/partition_table/partition-table.bin]
    #[structopt(long, parse(from_os_str))]
    pub partition_table_bin: Option<PathBuf>,
    /// OTA data [default: <build-dir>/ota_data_initial.bin]
    #[structopt(long, parse(from_os_str))]
    pub ota_data: Option<PathBuf>,
    /// User config for the `custom` partition [default: config.bin]
    #[structopt(long, parse(from_os_str))]
    pub config: Option<PathBuf>,
    /// Main application [default: <build-dir>/<app-name>.bin]
    #[structopt(long, parse(from_os_str))]
    pub app: Option<PathBuf>,
    /// Main application name in the build directory
    #[structopt(long, default_value = "xiaozhi")]
    pub app_name: String,
    /// Companion application for the `blufi` partition [default: depends on target]
    #[structopt(long, alias = "blufi", parse(from_os_str))]
    pub companion: Option<PathBuf>,
    /// Asset bundle for the `assets` partition [default: main/assets.bin or <build-dir>/assets.bin]
    #[structopt(long, parse(from_os_str))]
    pub assets: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
pub struct PackOpt {
    #[structopt(flatten)]
    pub project: Project,
    #[structopt(flatten)]
    pub artifacts: ArtifactOpt,
    /// Output file
    #[structopt(short, long, parse(from_os_str), default_value = "firmware_combined.bin")]
    pub output: PathBuf,
    /// Byte written to unused flash [default: depends on target, 0xff]
    #[structopt(long, parse(try_from_str = parse_int::parse))]
    pub fill_byte: Option<u8>,
    /// Keep the generated flash_args file
    #[structopt(long)]
    pub keep_flash_args: bool,
}

impl Project {
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        self.project_dir.join(path)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.resolve_path(&self.build_dir)
    }

    pub fn target_profile(&self) -> Result<TargetProfile, Error> {
        let targets = match &self.target_table {
            Some(path) => TargetTable::load(self.resolve_path(path))?,
            None => TargetTable::builtin()?,
        };
        Ok(targets.get(&self.target)?.clone())
    }

    pub fn load_partition_table(&self) -> Result<PartitionTable, Error> {
        PartitionTable::load(self.resolve_path(&self.partition_table))
    }
}

impl ArtifactOpt {
    pub fn artifact_set(&self, project: &Project, profile: &TargetProfile) -> ArtifactSet {
        let mut set = ArtifactSet::for_build(
            &project.project_dir,
            &project.build_dir(),
            &self.app_name,
            profile,
        );
        let overrides = [
            (Role::Bootloader, &self.bootloader),
            (Role::PartitionTable, &self.partition_table_bin),
            (Role::OtaData, &self.ota_data),
            (Role::UserConfig, &self.config),
            (Role::MainApp, &self.app),
            (Role::CompanionApp, &self.companion),
            (Role::Assets, &self.assets),
        ];
        for (role, path) in overrides.iter() {
            if let Some(path) = path {
                set.set(*role, project.resolve_path(path));
            }
        }
        set
    }
}

pub struct Plan {
    pub profile: TargetProfile,
    pub layout: Layout,
}

/// Parses the partition table and places every artifact, without writing anything.
pub fn plan(opt: &PackOpt) -> Result<Plan, Error> {
    let profile = opt.project.target_profile()?;
    log::info!("Target: {}", opt.project.target);

    let table = opt.project.load_partition_table()?;
    log::info!("Found {} partitions", table.len());
    for record in table.records() {
        log::info!("  {}", record);
    }

    let artifacts = opt.artifacts.artifact_set(&opt.project, &profile);
    let bindings = Resolver::new(&table, &profile).resolve(&artifacts)?;
    for binding in &bindings {
        log::info!(
            "{:#x} {} ({} bytes)",
            binding.partition.offset,
            binding.path.display(),
            binding.len
        );
    }

    let fill_byte = opt.fill_byte.unwrap_or(profile.fill_byte);
    let layout = Layout::plan(bindings, fill_byte)?;
    if let Some(flash_size) = profile.flash_size_bytes() {
        layout.check_flash_size(flash_size)?;
    }

    Ok(Plan { profile, layout })
}

pub fn pack(opt: &PackOpt) -> Result<Image, Error> {
    let Plan { profile, layout } = plan(opt)?;

    let flash_args = opt.project.build_dir().join(FLASH_ARGS_FILE);
    fs::write(&flash_args, layout.flash_args(&profile.flash_args()))
        .map_err(Error::artifact(&flash_args))?;
    log::debug!("Created {}", flash_args.display());

    let result = compose(&layout, opt.project.resolve_path(&opt.output));

    if !opt.keep_flash_args {
        match fs::remove_file(&flash_args) {
            Ok(()) => log::debug!("Removed {}", flash_args.display()),
            Err(e) => log::warn!("Failed to remove {}: {}", flash_args.display(), e),
        }
    }

    let image = result?;
    log::info!("sha256: {}", image.sha256_hex());
    Ok(image)
}
