// Staging (spec §4.7): after a winning path's files are downloaded and
// verified, sweep stale cache-partition contents, move the new files into
// place, and write the recovery command file the on-device updater reads
// at the next mount/apply step.  The atomic-write idiom (temp name,
// fsync, rename) is the same one `settings::atomic_write` uses, itself
// grounded on the teacher's own tempfile-heavy I/O in `download.rs`.

use crate::keyring::KeyringName;
use crate::model::Image;
use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Format version of the recovery command file this engine writes.
/// Decided here (an Open Question in the source spec) as a fixed
/// constant: nothing in this engine needs more than one on-disk command
/// format, so there is no version-negotiation surface to design.
pub const FORMAT_VERSION: u32 = 2;

const PRESERVED_FILES: &[&str] = &["log", "last_log"];

/// Delete everything in `cache_dir` except the preserved log files (spec
/// §4.7 step 1).
pub fn sweep_cache_partition(cache_dir: &Path) -> Result<()> {
    if !cache_dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(cache_dir).with_context(|| format!("reading {}", cache_dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if PRESERVED_FILES.iter().any(|p| name == *p) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).with_context(|| format!("removing {}", path.display()))?;
        } else {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
    }
    Ok(())
}

/// Move a single downloaded file from its temporary download location
/// into `dest_dir`, preserving its basename.
pub fn move_into(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir)?;
    let filename = src
        .file_name()
        .with_context(|| format!("{} has no file name", src.display()))?;
    let dest = dest_dir.join(filename);
    fs::rename(src, &dest).with_context(|| format!("moving {} to {}", src.display(), dest.display()))?;
    Ok(dest)
}

/// One step's resolved on-disk filenames, in download/staging order.
pub struct StagedImage {
    /// `(zip filename, signature filename)` for every file in the image,
    /// already sorted by `File::order`.
    pub files: Vec<(String, String)>,
}

pub fn staged_image(image: &Image, basename: impl Fn(&str) -> String) -> StagedImage {
    let mut files: Vec<_> = image.files.iter().collect();
    files.sort_by_key(|f| f.order);
    StagedImage {
        files: files
            .into_iter()
            .map(|f| (basename(&f.path), basename(&f.signature)))
            .collect(),
    }
}

/// Write the recovery command file atomically: temp name in the same
/// directory, `sync_all`, then rename over `path` (spec §4.7 step 3).
///
/// `keyrings` lists every keyring that must be (re)loaded before the
/// update runs, in trust order; `path_steps` is the winning path's
/// images, in application order. Every file referenced must have a
/// sibling signature entry -- callers are expected to have resolved
/// `(zip, sig)` pairs via [`staged_image`] already, so a missing pair
/// here means a structural bug upstream, not a recoverable condition.
pub fn write_recovery_command_file(
    path: &Path,
    keyrings: &[(KeyringName, String)],
    staged_images: &[StagedImage],
) -> Result<()> {
    let mut body = Vec::new();
    writeln!(body, "format_version {FORMAT_VERSION}")?;
    for (name, signature) in keyrings {
        writeln!(body, "load_keyring {} {signature}", name.as_str())?;
    }
    writeln!(body, "mount system")?;
    for image in staged_images {
        for (zip, sig) in &image.files {
            if sig.is_empty() {
                bail!("file {zip} in recovery command file has no signature");
            }
            writeln!(body, "update {zip} {sig}")?;
        }
    }
    writeln!(body, "unmount system")?;

    crate::settings::atomic_write(path, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{File as ImageFile, ImageKind};
    use tempfile::TempDir;

    fn image(order_pairs: &[(i64, &str)]) -> Image {
        Image {
            kind: ImageKind::Full,
            version: 1,
            base: None,
            description: String::new(),
            phased_percentage: 100,
            minversion: None,
            files: order_pairs
                .iter()
                .map(|(order, path)| ImageFile {
                    path: path.to_string(),
                    signature: format!("{path}.asc"),
                    checksum: "x".repeat(64),
                    size: 10,
                    order: *order,
                })
                .collect(),
        }
    }

    #[test]
    fn test_sweep_preserves_log_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("log"), "keep").unwrap();
        std::fs::write(dir.path().join("last_log"), "keep").unwrap();
        std::fs::write(dir.path().join("stale.zip"), "drop").unwrap();

        sweep_cache_partition(dir.path()).unwrap();

        assert!(dir.path().join("log").exists());
        assert!(dir.path().join("last_log").exists());
        assert!(!dir.path().join("stale.zip").exists());
    }

    #[test]
    fn test_staged_image_respects_order() {
        let img = image(&[(2, "/b.zip"), (0, "/a.zip"), (1, "/c.zip")]);
        let staged = staged_image(&img, |p| p.trim_start_matches('/').to_string());
        let names: Vec<&str> = staged.files.iter().map(|(z, _)| z.as_str()).collect();
        assert_eq!(names, vec!["a.zip", "c.zip", "b.zip"]);
    }

    #[test]
    fn test_write_recovery_command_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ubuntu_command");
        let img = image(&[(0, "/a.zip")]);
        let staged = staged_image(&img, |p| p.trim_start_matches('/').to_string());

        write_recovery_command_file(
            &path,
            &[(KeyringName::ImageSigning, "image-signing.tar.asc".into())],
            &[staged],
        )
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("format_version 2\n"));
        assert!(text.contains("load_keyring image-signing image-signing.tar.asc\n"));
        assert!(text.contains("mount system\n"));
        assert!(text.contains("update a.zip a.zip.asc\n"));
        assert!(text.trim_end().ends_with("unmount system"));
    }

    #[test]
    fn test_missing_signature_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ubuntu_command");
        let staged = StagedImage {
            files: vec![("a.zip".into(), String::new())],
        };
        write_recovery_command_file(&path, &[], &[staged]).unwrap_err();
    }
}
