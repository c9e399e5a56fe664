use crate::{
    artifact::{ArtifactBinding, Role},
    partition::check_disjoint,
    Error,
};
use std::{fmt, fs, path::PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentSource {
    Artifact { role: Role, path: PathBuf },
    Fill,
}

/// A byte range of the output image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: u32,
    pub len: u32,
    pub source: SegmentSource,
}

impl Segment {
    fn fill(offset: u32, len: u32) -> Self {
        Segment {
            offset,
            len,
            source: SegmentSource::Fill,
        }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.len
    }

    pub fn is_fill(&self) -> bool {
        self.source == SegmentSource::Fill
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}..{:#010x} ", self.offset, self.end())?;
        match &self.source {
            SegmentSource::Artifact { role, path } => write!(f, "{} {}", role, path.display()),
            SegmentSource::Fill => f.write_str("fill"),
        }
    }
}

/// Ordered, gap-free segments covering `0..len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    segments: Vec<Segment>,
    fill_byte: u8,
}

impl Layout {
    pub fn plan(mut bindings: Vec<ArtifactBinding>, fill_byte: u8) -> Result<Self, Error> {
        bindings.sort_by_key(|b| b.partition.offset);

        for pair in bindings.windows(2) {
            if pair[0].partition.offset == pair[1].partition.offset {
                return Err(Error::DuplicateOffset {
                    first: pair[0].partition.name.clone(),
                    second: pair[1].partition.name.clone(),
                    offset: pair[0].partition.offset,
                });
            }
        }
        check_disjoint(bindings.iter().map(|b| &b.partition))?;

        let mut segments = Vec::new();
        let mut cursor = 0u32;
        for binding in bindings {
            let partition = binding.partition;
            if binding.len > u64::from(partition.size) {
                return Err(Error::ArtifactTooLarge {
                    role: binding.role,
                    partition: partition.name,
                    size: binding.len,
                    capacity: partition.size,
                });
            }
            let len = binding.len as u32;

            if partition.offset > cursor {
                segments.push(Segment::fill(cursor, partition.offset - cursor));
            }
            if len > 0 {
                segments.push(Segment {
                    offset: partition.offset,
                    len,
                    source: SegmentSource::Artifact {
                        role: binding.role,
                        path: binding.path,
                    },
                });
            }
            if len < partition.size {
                segments.push(Segment::fill(partition.offset + len, partition.size - len));
            }
            cursor = partition.end();
        }

        Ok(Layout {
            segments,
            fill_byte,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn fill_byte(&self) -> u8 {
        self.fill_byte
    }

    pub fn len(&self) -> u64 {
        self.segments
            .last()
            .map(|s| u64::from(s.end()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn check_flash_size(&self, flash_size: u64) -> Result<(), Error> {
        if self.len() > flash_size {
            return Err(Error::ExceedsFlash {
                end: self.len(),
                flash_size,
            });
        }
        Ok(())
    }

    /// esptool `flash_args` listing of the data segments, after a header of flash options.
    pub fn flash_args(&self, header: &str) -> String {
        let mut lines = vec![header.to_string()];
        for segment in &self.segments {
            if let SegmentSource::Artifact { path, .. } = &segment.source {
                let path = fs::canonicalize(path).unwrap_or_else(|_| path.clone());
                lines.push(format!("{:#x} {}", segment.offset, path.display()));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionRecord;

    fn binding(role: Role, name: &str, offset: u32, size: u32, len: u64) -> ArtifactBinding {
        ArtifactBinding {
            role,
            partition: PartitionRecord::new(name, offset, size),
            path: PathBuf::from(format!("{}.bin", name)),
            len,
        }
    }

    fn data(role: Role, name: &str, offset: u32, len: u32) -> Segment {
        Segment {
            offset,
            len,
            source: SegmentSource::Artifact {
                role,
                path: PathBuf::from(format!("{}.bin", name)),
            },
        }
    }

    #[test]
    fn plans_gaps_and_padding() {
        let layout = Layout::plan(
            vec![
                binding(Role::MainApp, "ota_0", 0x10000, 0x100000, 0x50000),
                binding(Role::Bootloader, "bootloader", 0x0, 0x8000, 0x7000),
            ],
            0xff,
        )
        .unwrap();

        assert_eq!(
            layout.segments(),
            [
                data(Role::Bootloader, "bootloader", 0x0, 0x7000),
                Segment::fill(0x7000, 0x1000),
                Segment::fill(0x8000, 0x8000),
                data(Role::MainApp, "ota_0", 0x10000, 0x50000),
                Segment::fill(0x60000, 0xb0000),
            ]
        );
        assert_eq!(layout.len(), 0x110000);
        assert_eq!(layout.fill_byte(), 0xff);
    }

    #[test]
    fn segments_are_contiguous() {
        let layout = Layout::plan(
            vec![
                binding(Role::OtaData, "otadata", 0xd000, 0x2000, 0x2000),
                binding(Role::PartitionTable, "partition_table", 0x8000, 0x1000, 0xc00),
                binding(Role::Bootloader, "bootloader", 0x1000, 0x7000, 0x4321),
                binding(Role::MainApp, "ota_0", 0x20000, 0x10000, 0x10000),
            ],
            0x00,
        )
        .unwrap();

        let mut cursor = 0;
        for segment in layout.segments() {
            assert_eq!(segment.offset, cursor);
            assert!(segment.len > 0);
            cursor = segment.end();
        }
        assert_eq!(u64::from(cursor), layout.len());
        assert_eq!(layout.len(), 0x30000);
        // leading gap before a bootloader at 0x1000
        assert_eq!(layout.segments()[0], Segment::fill(0, 0x1000));
    }

    #[test]
    fn empty_artifact_is_all_fill() {
        let layout = Layout::plan(
            vec![binding(Role::UserConfig, "custom", 0x0, 0x1000, 0)],
            0xff,
        )
        .unwrap();
        assert_eq!(layout.segments(), [Segment::fill(0, 0x1000)]);
    }

    #[test]
    fn empty_layout() {
        let layout = Layout::plan(Vec::new(), 0xff).unwrap();
        assert!(layout.is_empty());
        assert_eq!(layout.len(), 0);
    }

    #[test]
    fn duplicate_offset_is_fatal() {
        let err = Layout::plan(
            vec![
                binding(Role::MainApp, "ota_0", 0x10000, 0x1000, 0x10),
                binding(Role::Assets, "assets", 0x10000, 0x1000, 0x10),
            ],
            0xff,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateOffset { offset: 0x10000, .. }));
    }

    #[test]
    fn overlap_is_fatal() {
        let err = Layout::plan(
            vec![
                binding(Role::Bootloader, "bootloader", 0x0, 0x9000, 0x10),
                binding(Role::PartitionTable, "partition_table", 0x8000, 0x1000, 0x10),
            ],
            0xff,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Overlap { .. }));
    }

    #[test]
    fn oversized_binding_is_fatal() {
        let err = Layout::plan(
            vec![binding(Role::MainApp, "ota_0", 0x10000, 0x1000, 0x1001)],
            0xff,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ArtifactTooLarge { size: 0x1001, .. }));
    }

    #[test]
    fn flash_size_limit() {
        let layout = Layout::plan(
            vec![binding(Role::MainApp, "ota_0", 0x10000, 0x100000, 0x10)],
            0xff,
        )
        .unwrap();
        assert!(layout.check_flash_size(0x110000).is_ok());
        assert!(matches!(
            layout.check_flash_size(0x100000),
            Err(Error::ExceedsFlash { end: 0x110000, .. })
        ));
    }

    #[test]
    fn flash_args_lists_data_segments() {
        let layout = Layout::plan(
            vec![
                binding(Role::Bootloader, "bootloader", 0x0, 0x8000, 0x10),
                binding(Role::MainApp, "ota_0", 0x10000, 0x1000, 0x10),
            ],
            0xff,
        )
        .unwrap();
        let args = layout.flash_args("--flash_mode dio");
        let lines: Vec<_> = args.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "--flash_mode dio");
        assert!(lines[1].starts_with("0x0 "));
        assert!(lines[1].ends_with("bootloader.bin"));
        assert!(lines[2].starts_with("0x10000 "));
    }
}
