use crate::artifact::Role;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("IO error on {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed partition table at line {line}: {reason}")]
    MalformedTable { line: usize, reason: String },
    #[error("partition `{0}` is defined more than once")]
    DuplicatePartition(String),
    #[error(
        "partition `{first}` [{first_start:#x}..{first_end:#x}) overlaps `{second}` [{second_start:#x}..{second_end:#x})"
    )]
    Overlap {
        first: String,
        first_start: u32,
        first_end: u32,
        second: String,
        second_start: u32,
        second_end: u32,
    },
    #[error("partitions `{first}` and `{second}` both start at {offset:#x}")]
    DuplicateOffset {
        first: String,
        second: String,
        offset: u32,
    },
    #[error("{role} not found: {}", path.display())]
    MissingRequiredArtifact { role: Role, path: PathBuf },
    #[error("no file configured for {0}")]
    UnsetArtifact(Role),
    #[error("partition `{partition}` required by {role} is not in the partition table")]
    MissingPartition { role: Role, partition: String },
    #[error(
        "{role} is {size:#x} bytes but partition `{partition}` only holds {capacity:#x} bytes"
    )]
    ArtifactTooLarge {
        role: Role,
        partition: String,
        size: u64,
        capacity: u32,
    },
    #[error("image ends at {end:#x}, beyond the {flash_size:#x} byte flash")]
    ExceedsFlash { end: u64, flash_size: u64 },
    #[error("wrote {written:#x} bytes of {}, expected {expected:#x}", path.display())]
    LengthMismatch {
        path: PathBuf,
        expected: u64,
        written: u64,
    },
    #[error("unknown target `{0}`")]
    UnknownTarget(String),
    #[error("target `{target}` has an invalid {role} slot: {reason}")]
    InvalidSlot {
        target: String,
        role: Role,
        reason: String,
    },
    #[error("Parse toml error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn artifact(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |source| Error::Artifact { path, source }
    }
}
