// Thin CLI front end (spec §6), in the teacher's own clap-derive style
// (`cmdline/mod.rs`'s `#[derive(Parser)]` subcommand enum). The CLI is
// explicitly out of scope per the source spec's §1 Non-goals; this is
// just enough of a binary to exercise the façade end to end.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "Client-side device update engine")]
pub struct Cli {
    /// Directory of [0-9]+_*.ini configuration files.
    #[arg(long, default_value = "/etc/update-engine.d")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check for an available update and print the result.
    Check,
    /// Begin or resume downloading the previously checked update.
    Download,
    /// Pause an in-progress download.
    Pause,
    /// Cancel an in-progress download.
    Cancel,
    /// Stage and apply a completed download.
    Apply {
        /// Don't actually invoke the apply hook once staged.
        #[arg(long)]
        no_apply: bool,
    },
    /// Wipe the data partition and reboot into a clean state.
    FactoryReset,
    /// Like factory-reset, but also marks the device as production.
    ProductionReset,
    /// Print current/target build information.
    Info,
    /// List the channels visible in channels.json.
    ListChannels,
    /// Print a stored setting.
    GetSetting { key: String },
    /// Store a setting.
    SetSetting { key: String, value: String },
    /// Remove a stored setting.
    DelSetting { key: String },
    /// Print every stored setting.
    ShowSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_check() {
        let cli = Cli::parse_from(["update-engine", "check"]);
        assert!(matches!(cli.command, Command::Check));
    }

    #[test]
    fn test_parses_set_setting() {
        let cli = Cli::parse_from(["update-engine", "set-setting", "min_battery", "40"]);
        match cli.command {
            Command::SetSetting { key, value } => {
                assert_eq!(key, "min_battery");
                assert_eq!(value, "40");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_config_dir_default() {
        let cli = Cli::parse_from(["update-engine", "info"]);
        assert_eq!(cli.config_dir, PathBuf::from("/etc/update-engine.d"));
    }
}
