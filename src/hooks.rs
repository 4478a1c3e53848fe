// Capability hook registry (spec §9): `hooks.device`, `hooks.scorer`,
// `hooks.apply` each select one of a fixed set of named implementations.
// No dynamic module loading, mirroring how the teacher resolves its own
// named choices (e.g. `--format`, `--platform`) against fixed match arms
// in `cmdline.rs` rather than a plugin loader.

use crate::resolver::{Scorer, WeightedScorer};
use anyhow::{anyhow, bail, Context, Result};
use std::process::Command;

/// Reports the device identifier used in phasing and staging, plus the
/// link/battery facts the downloader gates on before starting a transfer
/// (spec §4.6/§4.9). The default reads the first existing well-known
/// machine-id file and reports a wired, unmetered link with no battery;
/// a `static:<value>` hook is provided for tests and for devices that
/// inject the id via config instead.
pub trait DeviceHook: Send + Sync {
    fn machine_id(&self) -> Result<String>;

    /// True if the device's current network link is metered (cellular).
    /// Downloads stay queued rather than failing while this holds and
    /// `auto_download` forbids it (spec §4.6).
    fn is_cellular_link(&self) -> bool {
        false
    }

    /// Battery charge percentage, or `None` on devices with no battery
    /// (e.g. mains-powered).
    fn battery_percent(&self) -> Option<u8> {
        None
    }
}

pub struct DefaultDeviceHook;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

impl DeviceHook for DefaultDeviceHook {
    fn machine_id(&self) -> Result<String> {
        for path in MACHINE_ID_PATHS {
            if let Ok(contents) = std::fs::read_to_string(path) {
                let id = contents.trim();
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
        }
        bail!("no machine-id file found among {:?}", MACHINE_ID_PATHS);
    }
}

pub struct StaticDeviceHook(pub String);

impl DeviceHook for StaticDeviceHook {
    fn machine_id(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// What `apply` does once a path is staged.
pub trait ApplyHook: Send + Sync {
    /// Returns `true` if this hook reboots the device, so the caller
    /// knows to also emit `Rebooting`.
    fn apply(&self, command_file: &std::path::Path) -> Result<bool>;
}

pub struct RebootApplyHook;

impl ApplyHook for RebootApplyHook {
    fn apply(&self, command_file: &std::path::Path) -> Result<bool> {
        if !command_file.exists() {
            bail!("recovery command file {} is missing", command_file.display());
        }
        eprintln!("staged update ready; rebooting to apply {}", command_file.display());
        crate::runcmd!("reboot")?;
        Ok(true)
    }
}

pub struct NoopApplyHook;

impl ApplyHook for NoopApplyHook {
    fn apply(&self, _command_file: &std::path::Path) -> Result<bool> {
        Ok(false)
    }
}

/// Resolves `[hooks]` config strings to a fixed implementation. Unknown
/// names are a config-time error, not a silent fallback.
pub struct HookRegistry {
    pub device: Box<dyn DeviceHook>,
    pub scorer: Box<dyn Scorer>,
    pub apply: Box<dyn ApplyHook>,
}

impl HookRegistry {
    pub fn resolve(device: &str, scorer: &str, apply: &str) -> Result<Self> {
        let device: Box<dyn DeviceHook> = match device {
            "default" => Box::new(DefaultDeviceHook),
            other => bail!("unknown hooks.device '{other}'"),
        };
        let scorer: Box<dyn Scorer> = match scorer {
            "weighted" => Box::new(WeightedScorer),
            other => bail!("unknown hooks.scorer '{other}'"),
        };
        let apply: Box<dyn ApplyHook> = match apply {
            "reboot" => Box::new(RebootApplyHook),
            "noop" => Box::new(NoopApplyHook),
            other => bail!("unknown hooks.apply '{other}'"),
        };
        Ok(Self { device, scorer, apply })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_hooks() {
        HookRegistry::resolve("default", "weighted", "reboot").unwrap();
        HookRegistry::resolve("default", "weighted", "noop").unwrap();
    }

    #[test]
    fn test_resolve_rejects_unknown_hook() {
        HookRegistry::resolve("magic", "weighted", "reboot").unwrap_err();
        HookRegistry::resolve("default", "magic", "reboot").unwrap_err();
        HookRegistry::resolve("default", "weighted", "magic").unwrap_err();
    }

    #[test]
    fn test_static_device_hook() {
        let hook = StaticDeviceHook("abc123".into());
        assert_eq!(hook.machine_id().unwrap(), "abc123");
    }

    #[test]
    fn test_noop_apply_hook_does_not_reboot() {
        let hook = NoopApplyHook;
        let dir = tempfile::TempDir::new().unwrap();
        assert!(!hook.apply(dir.path()).unwrap());
    }
}
