use crate::{
    layout::{Layout, SegmentSource},
    Error,
};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::Instant,
};
use tempfile::NamedTempFile;

const BLOCK_SIZE: usize = 64 * 1024;

fn get_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {wide_bar} {bytes}/{total_bytes} {bytes_per_sec} {eta}  ")
            .progress_chars("#>-"),
    );
    bar
}

/// A composed image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub path: PathBuf,
    pub len: u64,
    pub sha256: Vec<u8>,
}

impl Image {
    pub fn sha256_hex(&self) -> String {
        hex::encode(&self.sha256)
    }
}

struct ImageWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
    bar: ProgressBar,
}

impl<W: Write> ImageWriter<W> {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.inner.write_all(data)?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        self.bar.inc(data.len() as u64);
        Ok(())
    }

    fn finish(self) -> Result<(Sha256, u64), Error> {
        let ImageWriter {
            mut inner,
            hasher,
            written,
            bar,
        } = self;
        inner.flush()?;
        bar.finish_and_clear();
        Ok((hasher, written))
    }
}

/// Writes `layout` to `output`.
///
/// The image is assembled in a temporary file next to `output` and only
/// renamed over it once its length matches the layout. On error nothing is
/// left at `output`, and a file already there is not touched.
pub fn compose<P: AsRef<Path>>(layout: &Layout, output: P) -> Result<Image, Error> {
    let output = output.as_ref();
    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir).map_err(Error::artifact(dir))?;
    let expected = layout.len();

    let start = Instant::now();
    let (hasher, written) = {
        let mut writer = ImageWriter {
            inner: BufWriter::new(temp.as_file_mut()),
            hasher: Sha256::new(),
            written: 0,
            bar: get_bar(expected),
        };
        write_segments(layout, &mut writer)?;
        writer.finish()?
    };

    temp.as_file().sync_all()?;
    let on_disk = temp.as_file().metadata()?.len();
    if written != expected || on_disk != expected {
        return Err(Error::LengthMismatch {
            path: output.to_path_buf(),
            expected,
            written: on_disk,
        });
    }

    temp.persist(output).map_err(|e| Error::Artifact {
        path: output.to_path_buf(),
        source: e.error,
    })?;

    let elapsed = start.elapsed();
    log::info!(
        "Wrote {} ({}) in {:?}",
        output.display(),
        HumanBytes(expected),
        elapsed
    );

    Ok(Image {
        path: output.to_path_buf(),
        len: expected,
        sha256: hasher.finalize().to_vec(),
    })
}

fn write_segments<W: Write>(layout: &Layout, writer: &mut ImageWriter<W>) -> Result<(), Error> {
    let fill = vec![layout.fill_byte(); BLOCK_SIZE];
    let mut buf = vec![0u8; BLOCK_SIZE];

    for segment in layout.segments() {
        log::trace!("{}", segment);
        match &segment.source {
            SegmentSource::Artifact { path, .. } => {
                let io_error = |source| Error::Artifact {
                    path: path.clone(),
                    source,
                };
                let expected = u64::from(segment.len);
                let file = File::open(path).map_err(io_error)?;
                let mut reader = file.take(expected);
                let mut copied = 0u64;
                loop {
                    let size = reader.read(&mut buf).map_err(io_error)?;
                    if size == 0 {
                        break;
                    }
                    writer.write_all(&buf[..size])?;
                    copied += size as u64;
                }

                // the artifact changed size after it was resolved
                let mut file = reader.into_inner();
                let grown = file.read(&mut buf[..1]).map_err(io_error)? != 0;
                if copied != expected || grown {
                    let actual = file.metadata().map_err(io_error)?.len();
                    return Err(Error::LengthMismatch {
                        path: path.clone(),
                        expected,
                        written: if grown { actual } else { copied },
                    });
                }
            }
            SegmentSource::Fill => {
                let mut remaining = segment.len as usize;
                while remaining > 0 {
                    let size = remaining.min(BLOCK_SIZE);
                    writer.write_all(&fill[..size])?;
                    remaining -= size;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::{ArtifactBinding, Role},
        partition::PartitionRecord,
    };
    use std::fs;
    use tempfile::TempDir;

    fn artifact(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, data).unwrap();
        path
    }

    fn binding(role: Role, name: &str, offset: u32, size: u32, path: PathBuf) -> ArtifactBinding {
        let len = fs::metadata(&path).unwrap().len();
        ArtifactBinding {
            role,
            partition: PartitionRecord::new(name, offset, size),
            path,
            len,
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn temp_files(dir: &TempDir) -> Vec<PathBuf> {
        fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(".tmp"))
            .collect()
    }

    fn two_part_layout(dir: &TempDir, fill: u8) -> (Layout, Vec<u8>, Vec<u8>) {
        let boot = pattern(0x1800, 1);
        let app = pattern(0x3000, 7);
        let layout = Layout::plan(
            vec![
                binding(Role::Bootloader, "bootloader", 0x1000, 0x2000, artifact(dir, "boot.bin", &boot)),
                binding(Role::MainApp, "ota_0", 0x4000, 0x4000, artifact(dir, "app.bin", &app)),
            ],
            fill,
        )
        .unwrap();
        (layout, boot, app)
    }

    #[test]
    fn composes_byte_exact_image() {
        let dir = TempDir::new().unwrap();
        let (layout, boot, app) = two_part_layout(&dir, 0xff);
        let output = dir.path().join("out.bin");

        let image = compose(&layout, &output).unwrap();
        let bytes = fs::read(&output).unwrap();

        assert_eq!(image.len, 0x8000);
        assert_eq!(bytes.len(), 0x8000);
        assert!(bytes[..0x1000].iter().all(|&b| b == 0xff));
        assert_eq!(&bytes[0x1000..0x2800], &boot[..]);
        assert!(bytes[0x2800..0x4000].iter().all(|&b| b == 0xff));
        assert_eq!(&bytes[0x4000..0x7000], &app[..]);
        assert!(bytes[0x7000..].iter().all(|&b| b == 0xff));

        assert_eq!(image.sha256, Sha256::digest(&bytes).to_vec());
        assert_eq!(image.sha256_hex().len(), 64);
        assert!(temp_files(&dir).is_empty());
    }

    #[test]
    fn uses_configured_fill_byte() {
        let dir = TempDir::new().unwrap();
        let (layout, _, _) = two_part_layout(&dir, 0x00);
        let output = dir.path().join("out.bin");

        compose(&layout, &output).unwrap();
        let bytes = fs::read(&output).unwrap();
        assert!(bytes[..0x1000].iter().all(|&b| b == 0x00));
        assert!(bytes[0x7000..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn fill_spans_several_blocks() {
        let dir = TempDir::new().unwrap();
        let app = pattern(0x10, 3);
        let layout = Layout::plan(
            vec![binding(Role::MainApp, "ota_0", 0x30000, 0x20000, artifact(&dir, "app.bin", &app))],
            0xff,
        )
        .unwrap();
        let output = dir.path().join("out.bin");

        compose(&layout, &output).unwrap();
        let bytes = fs::read(&output).unwrap();
        assert_eq!(bytes.len(), 0x50000);
        assert!(bytes[..0x30000].iter().all(|&b| b == 0xff));
        assert_eq!(&bytes[0x30000..0x30010], &app[..]);
        assert!(bytes[0x30010..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn composing_twice_is_identical() {
        let dir = TempDir::new().unwrap();
        let (layout, _, _) = two_part_layout(&dir, 0xff);
        let first = dir.path().join("first.bin");
        let second = dir.path().join("second.bin");

        let a = compose(&layout, &first).unwrap();
        let b = compose(&layout, &second).unwrap();
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
        assert_eq!(a.sha256, b.sha256);
    }

    #[test]
    fn overwrites_existing_output() {
        let dir = TempDir::new().unwrap();
        let (layout, _, _) = two_part_layout(&dir, 0xff);
        let output = artifact(&dir, "out.bin", &[0u8; 0x10000]);

        compose(&layout, &output).unwrap();
        assert_eq!(fs::metadata(&output).unwrap().len(), 0x8000);
    }

    #[test]
    fn unreadable_artifact_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let (layout, _, _) = two_part_layout(&dir, 0xff);
        fs::remove_file(dir.path().join("app.bin")).unwrap();
        let output = dir.path().join("out.bin");

        let err = compose(&layout, &output).unwrap_err();
        assert!(matches!(err, Error::Artifact { .. }));
        assert!(!output.exists());
        assert!(temp_files(&dir).is_empty());
    }

    #[test]
    fn shrunken_artifact_keeps_previous_output() {
        let dir = TempDir::new().unwrap();
        let (layout, _, _) = two_part_layout(&dir, 0xff);
        artifact(&dir, "app.bin", &pattern(0x100, 7));
        let output = artifact(&dir, "out.bin", b"previous image");

        let err = compose(&layout, &output).unwrap_err();
        match err {
            Error::LengthMismatch {
                expected, written, ..
            } => {
                assert_eq!(expected, 0x3000);
                assert_eq!(written, 0x100);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(fs::read(&output).unwrap(), b"previous image");
        assert!(temp_files(&dir).is_empty());
    }

    #[test]
    fn grown_artifact_is_not_truncated() {
        let dir = TempDir::new().unwrap();
        let (layout, _, _) = two_part_layout(&dir, 0xff);
        artifact(&dir, "app.bin", &pattern(0x3001, 7));
        let output = dir.path().join("out.bin");

        let err = compose(&layout, &output).unwrap_err();
        match err {
            Error::LengthMismatch {
                path,
                expected,
                written,
            } => {
                assert_eq!(path, dir.path().join("app.bin"));
                assert_eq!(expected, 0x3000);
                assert_eq!(written, 0x3001);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!output.exists());
        assert!(temp_files(&dir).is_empty());
    }

    #[test]
    fn missing_output_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (layout, _, _) = two_part_layout(&dir, 0xff);
        let output = dir.path().join("nope").join("out.bin");

        assert!(compose(&layout, &output).is_err());
        assert!(!output.exists());
    }
}
