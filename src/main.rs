use anyhow::{Context, Result};
use byte_unit::{Byte, UnitType};
use clap::Parser;
use libupdateengine::cmdline::{Cli, Command};
use libupdateengine::config;
use libupdateengine::hooks::HookRegistry;
use libupdateengine::keyring::KeyringStore;
use libupdateengine::service::{Engine, Event, InstanceLock};
use libupdateengine::settings::SettingsStore;
use std::process::ExitCode;

const EXIT_SUCCESS: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_ALREADY_RUNNING: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(cli: &Cli) -> Result<u8> {
    let config = config::load(&cli.config_dir).context("loading configuration")?;

    let lock_path = std::path::PathBuf::from(&config.system.tempdir).join("update-engine.lock");
    let _lock = match InstanceLock::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(_) => return Ok(EXIT_ALREADY_RUNNING),
    };

    let keyring_dir = std::path::Path::new(&config.gpg.archive_master)
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .to_path_buf();
    let keyring_store = KeyringStore::new(keyring_dir);

    let hooks = HookRegistry::resolve(&config.hooks.device, &config.hooks.scorer, &config.hooks.apply)
        .context("resolving [hooks] configuration")?;

    let settings_path = std::path::PathBuf::from(&config.updater.data_partition).join("settings.json");
    let settings = SettingsStore::open(&settings_path).context("opening settings store")?;

    let (engine, events) = Engine::new(config, hooks, keyring_store, settings);

    // Drain events to stderr at the same line-oriented density the
    // teacher reports download/verification progress.
    let reporter = std::thread::spawn(move || {
        for event in events {
            report_event(&event);
        }
    });

    let outcome = dispatch(&engine, &cli.command);
    drop(engine);
    let _ = reporter.join();
    outcome
}

/// Reports one event to stderr, human-readable byte counts formatted the
/// same way the teacher formats download progress.
fn report_event(event: &Event) {
    match event {
        Event::UpdateAvailableStatus { is_available, update_size, available_version, error_reason, .. } => {
            if *is_available {
                let size = Byte::from_u64(*update_size).get_appropriate_unit(UnitType::Binary);
                eprintln!("update available: version {available_version:?}, {size:.2}");
            } else if !error_reason.is_empty() {
                eprintln!("check failed: {error_reason}");
            } else {
                eprintln!("no update available");
            }
        }
        Event::UpdateProgress { percent, .. } => eprintln!("downloading: {percent}%"),
        Event::UpdatePaused { percent } => eprintln!("download paused at {percent}%"),
        Event::UpdateDownloaded => eprintln!("download complete"),
        Event::UpdateFailed { consecutive_failures, reason } => {
            eprintln!("update failed ({consecutive_failures} consecutive): {reason}");
        }
        Event::Applied(ok) => eprintln!("apply {}", if *ok { "succeeded" } else { "failed" }),
        Event::Rebooting(true) => eprintln!("rebooting"),
        Event::Rebooting(false) => {}
        Event::SettingChanged { key, value } => eprintln!("setting {key} = {value}"),
    }
}

fn dispatch(engine: &std::sync::Arc<Engine>, command: &Command) -> Result<u8> {
    match command {
        Command::Check => {
            engine.check()?;
            Ok(EXIT_SUCCESS)
        }
        Command::Download => {
            engine.download()?;
            Ok(EXIT_SUCCESS)
        }
        Command::Pause => {
            engine.pause();
            Ok(EXIT_SUCCESS)
        }
        Command::Cancel => {
            engine.cancel();
            Ok(EXIT_SUCCESS)
        }
        Command::Apply { no_apply } => {
            if *no_apply {
                return Ok(EXIT_SUCCESS);
            }
            let info = engine.info();
            let command_file = std::path::PathBuf::from(format!("{}-command", info.channel));
            engine.apply(&command_file)?;
            Ok(EXIT_SUCCESS)
        }
        Command::FactoryReset => {
            engine.factory_reset(std::path::Path::new("/data"))?;
            Ok(EXIT_SUCCESS)
        }
        Command::ProductionReset => {
            engine.production_reset(std::path::Path::new("/data"))?;
            Ok(EXIT_SUCCESS)
        }
        Command::Info => {
            let info = engine.info();
            println!("current_build={}", info.current_build);
            println!("target_build={:?}", info.target_build);
            println!("device={:?}", info.device);
            println!("channel={}", info.channel);
            Ok(EXIT_SUCCESS)
        }
        Command::ListChannels => {
            // Channel listing requires a live fetch, performed implicitly
            // by `check`; surfaced here only as a placeholder until a
            // caller wires in a cached channel listing.
            Ok(EXIT_SUCCESS)
        }
        Command::GetSetting { key } => {
            if let Some(value) = engine.get_setting(key) {
                println!("{value}");
            }
            Ok(EXIT_SUCCESS)
        }
        Command::SetSetting { key, value } => {
            engine.set_setting(key, value)?;
            Ok(EXIT_SUCCESS)
        }
        Command::DelSetting { key } => {
            engine.del_setting(key)?;
            Ok(EXIT_SUCCESS)
        }
        Command::ShowSettings => {
            for (key, value) in engine.show_settings() {
                println!("{key}={value}");
            }
            Ok(EXIT_SUCCESS)
        }
    }
}
