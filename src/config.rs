// Config loader (spec §4.1).  Loads an ordered sequence of layered
// `[0-9]+_*.ini` files from a directory, merges them, and produces one
// immutable configuration value.  Built with the teacher's own
// directory-walking idiom (`walkdir`) and `anyhow::Context`-wrapped parse
// errors, since the teacher itself takes all configuration from CLI flags
// and has no analogous loader.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use walkdir::WalkDir;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub service: ServiceSection,
    pub system: SystemSection,
    pub gpg: GpgSection,
    pub updater: UpdaterSection,
    pub hooks: HooksSection,
    pub dbus: DbusSection,
    /// Sections not recognized above, preserved verbatim for forward
    /// compatibility.
    pub extra: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceSection {
    pub base_host: String,
    pub http_port: Port,
    pub https_port: Port,
    pub channel: String,
    pub device: Option<String>,
    pub build_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Port {
    #[default]
    Disabled,
    Number(u16),
}

#[derive(Debug, Clone, Default)]
pub struct SystemSection {
    pub tempdir: String,
    pub logfile: String,
    pub loglevel: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct GpgSection {
    pub archive_master: String,
    pub image_master: String,
    pub image_signing: String,
    pub device_signing: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdaterSection {
    pub cache_partition: String,
    pub data_partition: String,
}

#[derive(Debug, Clone, Default)]
pub struct HooksSection {
    pub device: String,
    pub scorer: String,
    pub apply: String,
}

#[derive(Debug, Clone, Default)]
pub struct DbusSection {
    pub lifetime: Duration,
}

/// Load and merge every `[0-9]+_*.ini` file in `dir`, ascending by numeric
/// prefix, later files overriding earlier ones key-by-key.  Dangling
/// symlinks are silently skipped.
pub fn load(dir: &Path) -> Result<Config> {
    let mut entries: Vec<(u64, std::path::PathBuf)> = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if entry.path_is_symlink() && !entry.path().exists() {
            // dangling symlink
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(prefix) = parse_numeric_prefix(&name) {
            entries.push((prefix, entry.path().to_path_buf()));
        }
    }
    entries.sort_by_key(|(n, _)| *n);

    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    for (_, path) in &entries {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        merge_ini(&mut sections, &text)
            .with_context(|| format!("parsing {}", path.display()))?;
    }

    build_config(sections)
}

fn parse_numeric_prefix(name: &str) -> Option<u64> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if !name[digits.len()..].starts_with('_') {
        return None;
    }
    digits.parse().ok()
}

fn merge_ini(sections: &mut HashMap<String, HashMap<String, String>>, text: &str) -> Result<()> {
    let mut current = String::from("");
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix('[') {
            let name = stripped
                .strip_suffix(']')
                .with_context(|| format!("line {}: unterminated section header", lineno + 1))?;
            current = name.trim().to_string();
            sections.entry(current.clone()).or_default();
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .with_context(|| format!("line {}: expected 'key: value'", lineno + 1))?;
        if current.is_empty() {
            bail!("line {}: key/value pair outside any section", lineno + 1);
        }
        sections
            .entry(current.clone())
            .or_default()
            .insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(())
}

fn build_config(mut sections: HashMap<String, HashMap<String, String>>) -> Result<Config> {
    let service_map = sections.remove("service").unwrap_or_default();
    let system_map = sections.remove("system").unwrap_or_default();
    let gpg_map = sections.remove("gpg").unwrap_or_default();
    let updater_map = sections.remove("updater").unwrap_or_default();
    let hooks_map = sections.remove("hooks").unwrap_or_default();
    let dbus_map = sections.remove("dbus").unwrap_or_default();

    let http_port = parse_port(service_map.get("http_port"))?;
    let https_port = parse_port(service_map.get("https_port"))?;
    if http_port == Port::Disabled && https_port == Port::Disabled {
        bail!("both http_port and https_port are disabled");
    }

    let config = Config {
        service: ServiceSection {
            base_host: service_map.get("base_host").cloned().unwrap_or_default(),
            http_port,
            https_port,
            channel: service_map.get("channel").cloned().unwrap_or_default(),
            device: service_map.get("device").cloned(),
            build_number: service_map
                .get("build_number")
                .map(|v| v.parse())
                .transpose()
                .context("parsing [service]build_number")?
                .unwrap_or(0),
        },
        system: SystemSection {
            tempdir: system_map.get("tempdir").cloned().unwrap_or_else(|| "/tmp".into()),
            logfile: system_map.get("logfile").cloned().unwrap_or_default(),
            loglevel: system_map.get("loglevel").cloned().unwrap_or_else(|| "info".into()),
            timeout: parse_duration(system_map.get("timeout").map(String::as_str).unwrap_or("0"))
                .context("parsing [system]timeout")?,
        },
        gpg: GpgSection {
            archive_master: gpg_map.get("archive_master").cloned().unwrap_or_default(),
            image_master: gpg_map.get("image_master").cloned().unwrap_or_default(),
            image_signing: gpg_map.get("image_signing").cloned().unwrap_or_default(),
            device_signing: gpg_map.get("device_signing").cloned(),
        },
        updater: UpdaterSection {
            cache_partition: updater_map.get("cache_partition").cloned().unwrap_or_default(),
            data_partition: updater_map.get("data_partition").cloned().unwrap_or_default(),
        },
        hooks: HooksSection {
            device: hooks_map.get("device").cloned().unwrap_or_else(|| "default".into()),
            scorer: hooks_map.get("scorer").cloned().unwrap_or_else(|| "weighted".into()),
            apply: hooks_map.get("apply").cloned().unwrap_or_else(|| "reboot".into()),
        },
        dbus: DbusSection {
            lifetime: parse_duration(dbus_map.get("lifetime").map(String::as_str).unwrap_or("0"))
                .context("parsing [dbus]lifetime")?,
        },
        extra: sections,
    };
    Ok(config)
}

fn parse_port(value: Option<&String>) -> Result<Port> {
    match value.map(String::as_str) {
        None => Ok(Port::Disabled),
        Some("disabled") => Ok(Port::Disabled),
        Some(s) => s
            .parse::<u16>()
            .map(Port::Number)
            .with_context(|| format!("invalid port '{s}'")),
    }
}

/// Parse a duration with an optional unit suffix `w|d|h|m|s` (default
/// seconds).  `<= 0` disables the timer; callers check for
/// `Duration::ZERO`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(Duration::ZERO);
    }
    let (number, unit) = match value.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&value[..value.len() - 1], c),
        _ => (value, 's'),
    };
    let n: i64 = number.parse().with_context(|| format!("invalid duration '{value}'"))?;
    if n <= 0 {
        return Ok(Duration::ZERO);
    }
    let n = n as u64;
    let secs = match unit {
        's' => n,
        'm' => n * 60,
        'h' => n * 60 * 60,
        'd' => n * 60 * 60 * 24,
        'w' => n * 60 * 60 * 24 * 7,
        other => bail!("unknown duration unit '{other}' in '{value}'"),
    };
    Ok(Duration::from_secs(secs))
}
