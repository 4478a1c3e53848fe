// Data model for channels, images, files and indices (spec §3), decoded
// from `channels.json`/`index.json` with `serde_json` exactly the way the
// teacher decodes Fedora CoreOS stream metadata in `source.rs`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelsDoc(pub HashMap<String, Channel>);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Channel {
    pub alias: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    pub devices: HashMap<String, DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub index: String,
    pub keyring: Option<KeyringRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyringRef {
    pub path: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Index {
    pub global: IndexGlobal,
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexGlobal {
    pub generated_at: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Full,
    Delta,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Image {
    #[serde(rename = "type")]
    pub kind: ImageKind,
    pub version: u64,
    pub base: Option<u64>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "phased-percentage", default = "default_phased_percentage")]
    pub phased_percentage: u8,
    pub minversion: Option<u64>,
    pub files: Vec<File>,
}

fn default_phased_percentage() -> u8 {
    100
}

impl Image {
    /// The base version this image steps from, for path-resolution
    /// purposes.  A full image has no prior step requirement.
    pub fn base_version(&self) -> Option<u64> {
        match self.kind {
            ImageKind::Full => None,
            ImageKind::Delta => self.base,
        }
    }

    /// Total size, in megabytes rounded up, of all files in this image.
    /// Used by the default scorer (spec §3).
    pub fn size_mb_rounded(&self) -> u64 {
        let bytes: u64 = self.files.iter().map(|f| f.size).sum();
        bytes.div_ceil(1024 * 1024)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    pub path: String,
    pub signature: String,
    pub checksum: String,
    pub size: u64,
    #[serde(default)]
    pub order: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channels_doc() {
        let json = r#"{
            "stable": {
                "devices": {
                    "mako": { "index": "/stable/mako/index.json" }
                }
            },
            "rc": {
                "alias": "stable",
                "hidden": true,
                "devices": {
                    "mako": {
                        "index": "/rc/mako/index.json",
                        "keyring": { "path": "/rc/mako/keyring.gpg", "signature": "/rc/mako/keyring.gpg.asc" }
                    }
                }
            }
        }"#;
        let doc: ChannelsDoc = serde_json::from_str(json).unwrap();
        assert_eq!(doc.0.len(), 2);
        assert!(!doc.0["stable"].hidden);
        assert_eq!(doc.0["rc"].alias.as_deref(), Some("stable"));
        assert!(doc.0["rc"].devices["mako"].keyring.is_some());
    }

    #[test]
    fn test_parse_index() {
        let json = r#"{
            "global": { "generated_at": "2024-01-01T00:00:00Z" },
            "images": [
                { "type": "full", "version": 100, "description": "base",
                  "files": [
                    { "path": "/a.zip", "signature": "/a.zip.asc", "checksum": "ab", "size": 1024, "order": 0 }
                  ] },
                { "type": "delta", "version": 150, "base": 100, "description": "delta",
                  "phased-percentage": 30,
                  "files": [] }
            ]
        }"#;
        let index: Index = serde_json::from_str(json).unwrap();
        assert_eq!(index.images.len(), 2);
        assert_eq!(index.images[0].kind, ImageKind::Full);
        assert_eq!(index.images[0].base_version(), None);
        assert_eq!(index.images[1].base_version(), Some(100));
        assert_eq!(index.images[1].phased_percentage, 30);
        assert_eq!(index.images[0].phased_percentage, 100);
    }

    #[test]
    fn test_size_mb_rounded() {
        let image = Image {
            kind: ImageKind::Full,
            version: 1,
            base: None,
            description: String::new(),
            phased_percentage: 100,
            minversion: None,
            files: vec![File {
                path: "/a".into(),
                signature: "/a.asc".into(),
                checksum: "x".into(),
                size: 1024 * 1024 + 1,
                order: 0,
            }],
        };
        assert_eq!(image.size_mb_rounded(), 2);
    }
}
