// Keyring store (spec §4.2).  Manages the four named keyrings
// (archive-master, image-master, image-signing, device-signing), each
// persisted on disk as a compressed tarball containing one OpenPGP
// certificate and a small JSON manifest.  Decompression reuses
// `io::DecompressReader`; trust-chain and data-file verification both
// reuse `verify::VerifyReader` -- the same plumbing, just invoked with a
// different parent keyring's certs.

use crate::errors::SignatureError;
use crate::io::DecompressReader;
use crate::verify::VerifyReader;
use anyhow::{Context, Result};
use sequoia_openpgp::cert::CertParser;
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::Cert;
use serde::Deserialize;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyringName {
    ArchiveMaster,
    ImageMaster,
    ImageSigning,
    DeviceSigning,
}

impl KeyringName {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyringName::ArchiveMaster => "archive-master",
            KeyringName::ImageMaster => "image-master",
            KeyringName::ImageSigning => "image-signing",
            KeyringName::DeviceSigning => "device-signing",
        }
    }

    /// The keyring that must have signed this one when it was fetched, or
    /// `None` for the self-trusted root.
    pub fn parent(&self) -> Option<KeyringName> {
        match self {
            KeyringName::ArchiveMaster => None,
            KeyringName::ImageMaster => Some(KeyringName::ArchiveMaster),
            KeyringName::ImageSigning => Some(KeyringName::ImageMaster),
            KeyringName::DeviceSigning => Some(KeyringName::ImageSigning),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
    expiry: Option<String>,
    #[allow(dead_code)]
    model: Option<String>,
}

/// A loaded keyring: its parsed certificates plus expiry metadata.
#[derive(Debug, Clone)]
pub struct Keyring {
    pub name: KeyringName,
    pub certs: Vec<Cert>,
    pub expiry: Option<SystemTime>,
}

impl Keyring {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiry.map(|e| now > e).unwrap_or(false)
    }
}

/// Loads and caches keyring archives on disk (spec "pulled lazily and
/// cached on disk" lifecycle).
#[derive(Clone)]
pub struct KeyringStore {
    dir: PathBuf,
}

impl KeyringStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn archive_path(&self, name: KeyringName) -> PathBuf {
        self.dir.join(format!("{}.tar", name.as_str()))
    }

    fn signature_path(&self, name: KeyringName) -> PathBuf {
        self.dir.join(format!("{}.tar.asc", name.as_str()))
    }

    /// Load a keyring from disk, verifying it against `parent` (the
    /// already-loaded, already-trusted keyring that is supposed to have
    /// signed it).  `archive-master` is the trust root and is loaded with
    /// `parent = None`; every other keyring requires one.
    pub fn load(&self, name: KeyringName, parent: Option<&Keyring>) -> Result<Option<Keyring>> {
        let archive_path = self.archive_path(name);
        if !archive_path.exists() {
            if name == KeyringName::DeviceSigning {
                return Ok(None);
            }
            anyhow::bail!("keyring archive missing: {}", archive_path.display());
        }

        let raw = std::fs::read(&archive_path)
            .with_context(|| format!("reading {}", archive_path.display()))?;

        if let Some(parent) = parent {
            let sig_path = self.signature_path(name);
            let signature = std::fs::read(&sig_path)
                .with_context(|| format!("reading {}", sig_path.display()))?;
            let mut reader = VerifyReader::new(&raw[..], &signature, parent.certs.clone())
                .context("starting keyring trust-chain verification")?;
            let mut sink = std::io::sink();
            std::io::copy(&mut reader, &mut sink).context("streaming keyring archive")?;
            reader.verify().map_err(|_| SignatureError::UntrustedKeyring {
                keyring: name.as_str().into(),
            })?;
        }

        let (cert_bytes, manifest) = extract_tarball(&raw)?;
        let certs = CertParser::from_bytes(&cert_bytes)
            .context("decoding keyring certificate")?
            .collect::<Result<Vec<Cert>>>()
            .context("parsing keyring certificate")?;

        let expiry = manifest
            .expiry
            .as_deref()
            .map(parse_rfc3339)
            .transpose()?;

        let keyring = Keyring { name, certs, expiry };

        if let Some(expiry) = keyring.expiry {
            if keyring.is_expired(SystemTime::now()) {
                return Err(SignatureError::KeyringExpired {
                    keyring: name.as_str().into(),
                    expiry: format!("{:?}", expiry),
                }
                .into());
            }
        }

        Ok(Some(keyring))
    }

    /// Load all four keyrings in trust order, stopping at the first
    /// missing non-optional one.  `device-signing`'s absence is not an
    /// error (spec §4.2).
    pub fn load_all(&self) -> Result<Vec<Keyring>> {
        let mut loaded = Vec::new();
        let archive_master = self
            .load(KeyringName::ArchiveMaster, None)?
            .context("archive-master keyring is required")?;
        loaded.push(archive_master);

        let image_master = self
            .load(KeyringName::ImageMaster, loaded.last())?
            .context("image-master keyring is required")?;
        loaded.push(image_master);

        let image_signing = self
            .load(KeyringName::ImageSigning, loaded.last())?
            .context("image-signing keyring is required")?;
        loaded.push(image_signing);

        if let Some(device_signing) = self.load(KeyringName::DeviceSigning, loaded.last())? {
            loaded.push(device_signing);
        }

        Ok(loaded)
    }

    /// Replace a keyring archive+signature pair on disk (used by the
    /// recovery path after a signature failure forces a re-pull).
    pub fn store(&self, name: KeyringName, archive: &[u8], signature: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        crate::settings::atomic_write(&self.archive_path(name), archive)?;
        crate::settings::atomic_write(&self.signature_path(name), signature)?;
        Ok(())
    }
}

/// Pull the single certificate file and `<name>.json` manifest out of a
/// (possibly compressed) tar archive.
fn extract_tarball(raw: &[u8]) -> Result<(Vec<u8>, Manifest)> {
    let decompressed = DecompressReader::new(BufReader::new(raw))
        .context("decompressing keyring archive")?;
    let mut archive = tar::Archive::new(decompressed);

    let mut cert_bytes = None;
    let mut manifest = None;
    for entry in archive.entries().context("reading keyring tar entries")? {
        let mut entry = entry.context("reading keyring tar entry")?;
        let path = entry.path().context("reading entry path")?.to_path_buf();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            manifest = Some(serde_json::from_slice(&buf).context("parsing keyring manifest")?);
        } else {
            cert_bytes = Some(buf);
        }
    }

    let cert_bytes = cert_bytes.context("keyring archive has no certificate file")?;
    let manifest = manifest.context("keyring archive has no manifest file")?;
    Ok((cert_bytes, manifest))
}

fn parse_rfc3339(s: &str) -> Result<SystemTime> {
    // A minimal RFC3339 parser sufficient for "YYYY-MM-DDTHH:MM:SSZ"
    // manifests; avoids pulling in a dedicated date/time crate the
    // teacher never depends on.
    let bytes = s.as_bytes();
    anyhow::ensure!(bytes.len() >= 19, "expiry '{s}' too short");
    let year: i64 = s[0..4].parse().context("expiry year")?;
    let month: i64 = s[5..7].parse().context("expiry month")?;
    let day: i64 = s[8..10].parse().context("expiry day")?;
    let hour: i64 = s[11..13].parse().context("expiry hour")?;
    let min: i64 = s[14..16].parse().context("expiry minute")?;
    let sec: i64 = s[17..19].parse().context("expiry second")?;

    let days_from_epoch = days_from_civil(year, month, day);
    let secs = days_from_epoch * 86_400 + hour * 3600 + min * 60 + sec;
    anyhow::ensure!(secs >= 0, "expiry '{s}' predates the Unix epoch");
    Ok(UNIX_EPOCH + std::time::Duration::from_secs(secs as u64))
}

/// Howard Hinnant's days-from-civil algorithm.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rfc3339() {
        let t = parse_rfc3339("1970-01-01T00:00:00Z").unwrap();
        assert_eq!(t, UNIX_EPOCH);
        let t = parse_rfc3339("1970-01-02T00:00:00Z").unwrap();
        assert_eq!(t, UNIX_EPOCH + std::time::Duration::from_secs(86400));
        let t = parse_rfc3339("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(
            t,
            UNIX_EPOCH + std::time::Duration::from_secs(1704067200)
        );
    }

    #[test]
    fn test_keyring_parent_chain() {
        assert_eq!(KeyringName::ArchiveMaster.parent(), None);
        assert_eq!(
            KeyringName::ImageMaster.parent(),
            Some(KeyringName::ArchiveMaster)
        );
        assert_eq!(
            KeyringName::ImageSigning.parent(),
            Some(KeyringName::ImageMaster)
        );
        assert_eq!(
            KeyringName::DeviceSigning.parent(),
            Some(KeyringName::ImageSigning)
        );
    }

    #[test]
    fn test_missing_device_signing_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = KeyringStore::new(dir.path());
        let result = store.load(KeyringName::DeviceSigning, None).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_missing_archive_master_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = KeyringStore::new(dir.path());
        store.load(KeyringName::ArchiveMaster, None).unwrap_err();
    }
}
