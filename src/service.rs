// Service façade (spec §4.10): the single entry point external callers
// (CLI, D-Bus-equivalent transport) drive. Operations are request-
// serialized behind one lock, exactly as the teacher serializes its own
// single `download`/`install` invocation per process -- the façade just
// keeps that lock alive across a service's lifetime instead of a single
// `main()` call. Results are delivered as typed `Event`s over an
// `std::sync::mpsc` channel rather than callbacks, so the façade itself
// never blocks a subscriber.

use crate::config::Config;
use crate::download::{BatchStatus, DownloadOptions, Downloader, FileRequest, HttpDownloader};
use crate::errors::{PolicyOutcome, SignatureError};
use crate::fetch::{self, FetchRetries};
use crate::hooks::HookRegistry;
use crate::keyring::{Keyring, KeyringName, KeyringStore};
use crate::model::{DeviceEntry, Image, Index};
use crate::phasing::stable_hash;
use crate::resolver::{self, FilterPolicy};
use crate::settings::{AutoDownload, SettingsStore};
use crate::staging;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use sequoia_openpgp::Cert;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub enum Event {
    UpdateAvailableStatus {
        is_available: bool,
        downloading: bool,
        available_version: Option<u64>,
        update_size: u64,
        last_update_date: Option<String>,
        error_reason: String,
    },
    UpdateProgress {
        percent: u8,
        eta_seconds: Option<u64>,
    },
    UpdatePaused {
        percent: u8,
    },
    UpdateDownloaded,
    UpdateFailed {
        consecutive_failures: u32,
        reason: String,
    },
    Applied(bool),
    Rebooting(bool),
    SettingChanged {
        key: String,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Checking,
    Downloading,
    Paused,
    Downloaded,
    Staged,
}

/// Maps the façade's coarse-grained `RunState` onto the detailed
/// step-level `State` the state machine reasons about, so `cancel`/`apply`
/// share one source of truth for "is a download in flight" / "can this be
/// applied" instead of re-deriving those rules here.
fn as_step_state(run: RunState) -> crate::state_machine::State {
    use crate::state_machine::State;
    match run {
        RunState::Idle | RunState::Checking => State::Init,
        RunState::Downloading => State::Downloading,
        RunState::Paused => State::DownloadPaused,
        RunState::Downloaded => State::Downloaded,
        RunState::Staged => State::Staged,
    }
}

struct CheckResult {
    /// The winning path's images, cloned out of the index so the
    /// downloader can rebuild file requests from them without holding a
    /// borrow into a fetch that already completed (spec §4.6).
    images: Vec<Image>,
    target_version: u64,
    update_size: u64,
}

/// Everything the façade needs for one process lifetime. Config, hooks
/// and stores are owned values created once at startup and passed in,
/// matching spec §9's "global singletons become owned values." `state`
/// is reference-counted separately from the rest so a download's
/// progress-monitor thread can update it without needing the whole
/// `Engine` kept alive via an owned `Arc<Engine>` handle.
pub struct Engine {
    config: Config,
    hooks: HookRegistry,
    keyring_store: KeyringStore,
    settings: Mutex<SettingsStore>,
    events: Sender<Event>,
    state: Arc<Mutex<EngineState>>,
}

struct EngineState {
    run: RunState,
    consecutive_failures: u32,
    last_check: Option<CheckResult>,
    last_update_date: Option<String>,
    last_check_date: Option<String>,
    download_handle: Option<crate::download::Handle>,
}

impl Engine {
    pub fn new(
        config: Config,
        hooks: HookRegistry,
        keyring_store: KeyringStore,
        settings: SettingsStore,
    ) -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let engine = Arc::new(Self {
            config,
            hooks,
            keyring_store,
            settings: Mutex::new(settings),
            events: tx,
            state: Arc::new(Mutex::new(EngineState {
                run: RunState::Idle,
                consecutive_failures: 0,
                last_check: None,
                last_update_date: None,
                last_check_date: None,
                download_handle: None,
            })),
        });
        (engine, rx)
    }

    fn emit(&self, event: Event) {
        // A dropped receiver just means nobody is listening; the engine
        // itself never depends on delivery succeeding.
        let _ = self.events.send(event);
    }

    /// Record a download failure and emit `UpdateFailed`. Also called
    /// from the detached progress-monitor thread, so it only touches the
    /// `Arc`-shared state and event sender rather than `&self`.
    fn record_download_failure(
        state: &Arc<Mutex<EngineState>>,
        events: &Sender<Event>,
        err: anyhow::Error,
    ) {
        let mut state = state.lock().unwrap();
        state.run = RunState::Idle;
        state.download_handle = None;
        state.consecutive_failures += 1;
        let failures = state.consecutive_failures;
        drop(state);
        let _ = events.send(Event::UpdateFailed {
            consecutive_failures: failures,
            reason: crate::errors::reason_string(&err),
        });
    }

    /// **check**: fetch channels/index, resolve the winning path, cache
    /// it, and emit `UpdateAvailableStatus`. Returns the cached result
    /// immediately if a check is already running (spec §4.10
    /// concurrency contract).
    pub fn check(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.run == RunState::Checking {
                return Ok(());
            }
            state.run = RunState::Checking;
        }

        let result = self.run_check();

        let mut state = self.state.lock().unwrap();
        state.run = RunState::Idle;
        match result {
            Ok(Some(check)) => {
                let event = Event::UpdateAvailableStatus {
                    is_available: true,
                    downloading: false,
                    available_version: Some(check.target_version),
                    update_size: check.update_size,
                    last_update_date: state.last_update_date.clone(),
                    error_reason: String::new(),
                };
                state.last_check = Some(check);
                drop(state);
                self.emit(event);
            }
            Ok(None) => {
                let event = Event::UpdateAvailableStatus {
                    is_available: false,
                    downloading: false,
                    available_version: None,
                    update_size: 0,
                    last_update_date: state.last_update_date.clone(),
                    error_reason: String::new(),
                };
                state.last_check = None;
                drop(state);
                self.emit(event);
            }
            Err(e) => {
                let event = Event::UpdateAvailableStatus {
                    is_available: false,
                    downloading: false,
                    available_version: None,
                    update_size: 0,
                    last_update_date: state.last_update_date.clone(),
                    error_reason: crate::errors::reason_string(&e),
                };
                drop(state);
                self.emit(event);
            }
        }
        Ok(())
    }

    fn run_check(&self) -> Result<Option<CheckResult>> {
        let client = fetch::new_http_client()?;
        let base_url = self.base_url()?;
        let retries = FetchRetries::Finite(NonZeroU32::new(3).unwrap());

        let mut keyrings = self.keyring_store.load_all().context("loading keyrings")?;
        let mut certs = trusted_certs(&keyrings);

        let channels_url = base_url.join("channels.json").context("building channels URL")?;
        let channels = self.fetch_verified_with_repull::<crate::model::ChannelsDoc>(
            &client,
            &channels_url,
            retries,
            &mut keyrings,
            &mut certs,
            "channels.json",
            None,
        )?;

        let device = self
            .config
            .service
            .device
            .clone()
            .context("no device configured")?;
        let channel_name = &self.config.service.channel;
        let channel = channels
            .0
            .get(channel_name)
            .with_context(|| format!("unknown channel '{channel_name}'"))?;
        let device_entry = channel
            .devices
            .get(&device)
            .with_context(|| format!("device '{device}' not listed for channel '{channel_name}'"))?
            .clone();

        // channel-alias-squash: first boot into an alias treats current
        // build as 0 for resolution purposes (spec §4.4).
        let current_version = if channel.alias.is_some() {
            0
        } else {
            self.config.service.build_number
        };

        let index_url = base_url
            .join(&device_entry.index)
            .context("building index URL")?;
        let index = self.fetch_verified_with_repull::<Index>(
            &client,
            &index_url,
            retries,
            &mut keyrings,
            &mut certs,
            "index.json",
            Some(&device_entry),
        )?;

        // `target_build` for phasing purposes is the highest version the
        // index offers at all -- the same "max(versions)" the scorer's
        // not-max penalty compares against -- since the device's phase
        // percentage must be stable for the whole check regardless of
        // which candidate path ultimately wins (spec §4.11: one "device's
        // phase percentage" gates every image in §3's eligibility rule).
        let max_version = index.images.iter().map(|i| i.version).max().unwrap_or(current_version);
        let machine_id = self.hooks.device.machine_id()?;
        let percentage = stable_hash(&machine_id, channel_name, &max_version.to_string());

        let resolved = resolver::resolve(
            &index.images,
            current_version,
            percentage,
            FilterPolicy::Any,
            self.hooks.scorer.as_ref(),
        );

        match resolved {
            Ok(resolved) => {
                let path = resolved.path;
                let update_size = path.total_bytes();
                let target_version = path.target_version();
                let images: Vec<Image> = path.steps.iter().map(|s| (**s).clone()).collect();
                crate::download::validate_batch(&build_file_requests(
                    &images,
                    &base_url,
                    &PathBuf::new(),
                )?)?;
                Ok(Some(CheckResult {
                    images,
                    target_version,
                    update_size,
                }))
            }
            Err(PolicyOutcome::NoUpdate) | Err(PolicyOutcome::PhaseGated { .. }) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    /// Fetch-and-verify `artifact`, retrying once via a device-signing
    /// keyring re-pull if verification fails (spec §4.2/§4.8's
    /// one-shot "re-pull then retry" recovery rule), driven by
    /// `state_machine::decide`.
    fn fetch_verified_with_repull<T: serde::de::DeserializeOwned>(
        &self,
        client: &Client,
        url: &url::Url,
        retries: FetchRetries,
        keyrings: &mut Vec<Keyring>,
        certs: &mut Vec<Cert>,
        artifact: &str,
        device_entry: Option<&DeviceEntry>,
    ) -> Result<T> {
        let mut repulled = false;
        loop {
            match fetch::fetch_and_verify::<T>(client, url, retries, certs, artifact) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    use crate::state_machine::{decide, State, StepOutcome};
                    match decide(State::IndexFetched, err, true, repulled) {
                        StepOutcome::RepullKeyringThenRetry if !repulled => {
                            repulled = true;
                            self.repull_device_keyring(client, device_entry)?;
                            *keyrings = self.keyring_store.load_all().context("reloading keyrings")?;
                            *certs = trusted_certs(keyrings);
                        }
                        StepOutcome::RepullKeyringThenRetry => {
                            bail!("signature verification failed for {artifact} even after keyring re-pull");
                        }
                        StepOutcome::Fatal(e) => return Err(e),
                        _ => bail!("unexpected retry outcome fetching {artifact}"),
                    }
                }
            }
        }
    }

    /// Re-pull the device-signing keyring from the server (spec §4.2's
    /// recovery rule), using the per-device `keyring` pointer in
    /// `channels.json`. There is no remote pointer for the higher-tier
    /// keyrings, so a failure with no device-signing override is fatal.
    fn repull_device_keyring(&self, client: &Client, device_entry: Option<&DeviceEntry>) -> Result<()> {
        let device_entry = device_entry
            .context("signature verification failed with no device entry to re-pull a keyring from")?;
        let keyring_ref = device_entry
            .keyring
            .as_ref()
            .context("signature verification failed and this device has no keyring override to re-pull")?;
        let base_url = self.base_url()?;
        let archive_url = base_url.join(&keyring_ref.path).context("building keyring archive URL")?;
        let sig_url = base_url
            .join(&keyring_ref.signature)
            .context("building keyring signature URL")?;

        let retries = FetchRetries::Finite(NonZeroU32::new(3).unwrap());
        let archive = fetch::http_get(client, archive_url.as_str(), retries)
            .context("fetching device-signing keyring")?
            .bytes()
            .context("reading device-signing keyring body")?;
        let signature = fetch::http_get(client, sig_url.as_str(), retries)
            .context("fetching device-signing keyring signature")?
            .bytes()
            .context("reading device-signing keyring signature body")?;

        self.keyring_store
            .store(KeyringName::DeviceSigning, &archive, &signature)
            .context("storing re-pulled device-signing keyring")
    }

    fn base_url(&self) -> Result<url::Url> {
        let scheme = match self.config.service.https_port {
            crate::config::Port::Disabled => "http",
            crate::config::Port::Number(_) => "https",
        };
        url::Url::parse(&format!("{scheme}://{}/", self.config.service.base_host))
            .context("building base URL")
    }

    /// True if a download must stay queued rather than start, per the
    /// `min_battery`/`auto_download` settings and the device's current
    /// link (spec §4.6/§4.9): "downloads remain queued, not failed."
    fn download_gate_blocked(&self, options: &DownloadOptions) -> bool {
        let settings = self.settings.lock().unwrap();
        let min_battery: u8 = settings
            .get(crate::settings::KEY_MIN_BATTERY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let auto_download = settings
            .get(crate::settings::KEY_AUTO_DOWNLOAD)
            .and_then(AutoDownload::from_str)
            .unwrap_or(AutoDownload::WifiOnly);
        drop(settings);

        let battery_ok = self
            .hooks
            .device
            .battery_percent()
            .map_or(true, |pct| pct >= min_battery);
        if !battery_ok {
            return true;
        }

        let cellular = self.hooks.device.is_cellular_link();
        match auto_download {
            AutoDownload::Always => false,
            AutoDownload::WifiOnly => cellular && !options.allow_cellular,
            AutoDownload::Never => !options.allow_cellular,
        }
    }

    /// **download**: rebuild the winning path's file requests from the
    /// cached check, drive a real `HttpDownloader`, and only reach
    /// `Downloaded` once every file's checksum has matched (spec §4.6).
    /// Gated downloads are left queued rather than failed.
    pub fn download(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.run == RunState::Downloading {
            return Ok(());
        }
        let images = state
            .last_check
            .as_ref()
            .context("download requested with no prior successful check")?
            .images
            .clone();
        drop(state);

        let options = DownloadOptions::default();
        if self.download_gate_blocked(&options) {
            return Ok(());
        }

        let base_url = self.base_url()?;
        let staging_dir = self.download_staging_dir();
        std::fs::create_dir_all(&staging_dir)
            .with_context(|| format!("creating {}", staging_dir.display()))?;
        let requests = build_file_requests(&images, &base_url, &staging_dir)?;

        let mut state = self.state.lock().unwrap();
        state.run = RunState::Downloading;
        drop(state);

        let client = fetch::new_http_client()?;
        let downloader = HttpDownloader::new(client);
        let handle = match self.download_batch(&downloader, requests) {
            Ok(handle) => handle,
            Err(e) => {
                Self::record_download_failure(&self.state, &self.events, e);
                return Ok(());
            }
        };

        self.spawn_download_monitor(handle, images);
        Ok(())
    }

    /// Where a batch's zips and detached signatures land before staging
    /// moves them into the cache partition. Deliberately separate from
    /// the cache partition itself: staging's first step sweeps the cache
    /// partition clean (spec §4.7), which would destroy a just-downloaded
    /// batch if downloads wrote there directly.
    fn download_staging_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.system.tempdir).join("update-engine-download")
    }

    /// Poll a batch's progress on a detached thread, emitting
    /// `UpdateProgress` until a terminal status is reached. On `Done`,
    /// fetches and verifies each file's detached signature before
    /// reaching `Downloaded`/emitting `UpdateDownloaded` -- a checksum
    /// match alone only proves the bytes weren't corrupted in transit,
    /// not that they came from a trusted signer (spec §4.3/§4.6). Holds
    /// only the `Arc`-shared state and event sender, not the whole
    /// `Engine`.
    fn spawn_download_monitor(&self, handle: crate::download::Handle, images: Vec<Image>) {
        let state = self.state.clone();
        let events = self.events.clone();
        let keyring_store = self.keyring_store.clone();
        let staging_dir = self.download_staging_dir();
        let base_url = match self.base_url() {
            Ok(url) => url,
            Err(e) => {
                Self::record_download_failure(&state, &events, e);
                return;
            }
        };
        let spawned = std::thread::Builder::new()
            .name("download-monitor".into())
            .spawn(move || loop {
                let (status, percent) = {
                    let status = *handle.progress.status.lock().unwrap();
                    (status, handle.progress.percent())
                };
                match status {
                    BatchStatus::Done => {
                        let verified = fetch_and_persist_signatures(
                            &keyring_store,
                            &base_url,
                            &images,
                            &staging_dir,
                        );
                        match verified {
                            Ok(()) => {
                                let mut s = state.lock().unwrap();
                                if s.run == RunState::Downloading {
                                    s.run = RunState::Downloaded;
                                }
                                s.download_handle = None;
                                drop(s);
                                let _ = events.send(Event::UpdateDownloaded);
                            }
                            Err(e) => Self::record_download_failure(&state, &events, e),
                        }
                        return;
                    }
                    BatchStatus::Cancelled => {
                        state.lock().unwrap().download_handle = None;
                        return;
                    }
                    BatchStatus::Failed => {
                        Self::record_download_failure(
                            &state,
                            &events,
                            anyhow!("download batch failed; see stderr for the underlying error"),
                        );
                        return;
                    }
                    BatchStatus::Queued | BatchStatus::Running | BatchStatus::Paused => {
                        let _ = events.send(Event::UpdateProgress { percent, eta_seconds: None });
                        std::thread::sleep(Duration::from_millis(500));
                    }
                }
            });
        if let Ok(join_handle) = spawned {
            drop(join_handle);
        }
    }

    /// Drive a concrete batch through a `Downloader`, for use by both the
    /// production `download()` path and directly by tests exercising
    /// pause/resume/cancel fidelity (S6).
    pub fn download_batch(
        &self,
        downloader: &dyn Downloader,
        requests: Vec<FileRequest>,
    ) -> Result<crate::download::Handle> {
        let handle = downloader.enqueue(requests, DownloadOptions::default())?;
        self.state.lock().unwrap().download_handle = Some(crate::download::Handle {
            progress: handle.progress.clone(),
        });
        Ok(handle)
    }

    /// **pause**: synchronous.
    pub fn pause(&self) {
        let state = self.state.lock().unwrap();
        if let Some(handle) = &state.download_handle {
            handle.pause();
            let percent = handle.progress.percent();
            drop(state);
            self.state.lock().unwrap().run = RunState::Paused;
            self.emit(Event::UpdatePaused { percent });
        }
    }

    /// **cancel**: synchronous; only emits `UpdateFailed` if a download
    /// was active (spec §4.10).
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        let was_active = crate::state_machine::cancel(as_step_state(state.run))
            .map(|next| next == crate::state_machine::State::Failed)
            .unwrap_or(false);
        if let Some(handle) = state.download_handle.take() {
            handle.cancel();
        }
        if was_active {
            state.run = RunState::Idle;
            state.consecutive_failures += 1;
            let failures = state.consecutive_failures;
            drop(state);
            self.emit(Event::UpdateFailed {
                consecutive_failures: failures,
                reason: "cancelled".into(),
            });
        }
    }

    /// **apply**: stage the downloaded batch into the cache partition --
    /// sweep stale contents, move the verified zip/signature pairs into
    /// place, write the recovery command file (spec §4.7) -- then invoke
    /// the apply hook. Valid only from `Downloaded`/`Staged`.
    pub fn apply(&self, command_file: &std::path::Path) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if !crate::state_machine::can_apply(as_step_state(state.run)) {
                bail!("apply is only valid after a completed download");
            }
        }
        if let Err(e) = self.stage(command_file) {
            self.emit(Event::Applied(false));
            return Err(e);
        }
        let result = self.hooks.apply.apply(command_file);
        match result {
            Ok(reboots) => {
                self.emit(Event::Applied(true));
                if reboots {
                    self.emit(Event::Rebooting(true));
                }
                self.state.lock().unwrap().run = RunState::Staged;
                Ok(())
            }
            Err(e) => {
                self.emit(Event::Applied(false));
                Err(e)
            }
        }
    }

    /// Sweep the cache partition, move the staged batch into place, and
    /// write `command_file` (spec §4.7 steps 1-3). A no-op download
    /// staging directory (factory-reset/production-reset calls, which
    /// have no prior check) leaves nothing to move and an empty recovery
    /// file.
    fn stage(&self, command_file: &std::path::Path) -> Result<()> {
        let images = {
            let state = self.state.lock().unwrap();
            state
                .last_check
                .as_ref()
                .map(|c| c.images.clone())
                .unwrap_or_default()
        };

        let cache_dir = PathBuf::from(&self.config.updater.cache_partition);
        let staging_dir = self.download_staging_dir();

        staging::sweep_cache_partition(&cache_dir)?;

        let keyrings = self
            .keyring_store
            .load_all()
            .context("loading keyrings for staging")?;
        let keyring_entries: Vec<(KeyringName, String)> = keyrings
            .iter()
            .map(|k| (k.name, format!("{}.tar.asc", k.name.as_str())))
            .collect();

        let mut staged_images = Vec::new();
        for image in &images {
            for file in &image.files {
                let zip_name = file
                    .path
                    .rsplit('/')
                    .next()
                    .context("file path has no basename")?;
                let sig_name = file
                    .signature
                    .rsplit('/')
                    .next()
                    .context("signature path has no basename")?;
                staging::move_into(&staging_dir.join(zip_name), &cache_dir)?;
                staging::move_into(&staging_dir.join(sig_name), &cache_dir)?;
            }
            staged_images.push(staging::staged_image(image, |p| {
                p.rsplit('/').next().unwrap_or(p).to_string()
            }));
        }

        staging::write_recovery_command_file(command_file, &keyring_entries, &staged_images)
    }

    pub fn factory_reset(&self, data_partition: &std::path::Path) -> Result<()> {
        wipe_dir(data_partition)?;
        self.apply(&data_partition.join("command"))
    }

    pub fn production_reset(&self, data_partition: &std::path::Path) -> Result<()> {
        wipe_dir(data_partition)?;
        std::fs::write(data_partition.join(".production-reset"), b"")
            .context("writing production-reset flag file")?;
        self.apply(&data_partition.join("command"))
    }

    pub fn info(&self) -> Info {
        let state = self.state.lock().unwrap();
        Info {
            current_build: self.config.service.build_number,
            target_build: state.last_check.as_ref().map(|c| c.target_version),
            device: self.config.service.device.clone(),
            channel: self.config.service.channel.clone(),
            last_update_date: state.last_update_date.clone(),
            last_check_date: state.last_check_date.clone(),
        }
    }

    pub fn get_setting(&self, key: &str) -> Option<String> {
        self.settings.lock().unwrap().get(key).map(str::to_string)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let changed = self.settings.lock().unwrap().set(key, value)?;
        if changed {
            self.emit(Event::SettingChanged {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Ok(())
    }

    pub fn del_setting(&self, key: &str) -> Result<()> {
        self.settings.lock().unwrap().del(key)?;
        Ok(())
    }

    pub fn show_settings(&self) -> std::collections::BTreeMap<String, String> {
        self.settings.lock().unwrap().show_all().clone()
    }
}

pub struct Info {
    pub current_build: u64,
    pub target_build: Option<u64>,
    pub device: Option<String>,
    pub channel: String,
    pub last_update_date: Option<String>,
    pub last_check_date: Option<String>,
}

fn wipe_dir(dir: &std::path::Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// The union of certificates an artifact may be trusted against (spec
/// §4.3): image-signing, plus device-signing when the device has one.
fn trusted_certs(keyrings: &[Keyring]) -> Vec<Cert> {
    let mut seen = std::collections::HashSet::new();
    let mut certs = Vec::new();
    for keyring in keyrings {
        if matches!(keyring.name, KeyringName::ImageSigning | KeyringName::DeviceSigning) {
            for cert in &keyring.certs {
                if seen.insert(cert.fingerprint()) {
                    certs.push(cert.clone());
                }
            }
        }
    }
    certs
}

/// After a batch's zips land in the download staging directory with
/// verified checksums, fetch each one's detached signature, verify it
/// against the trusted image/device-signing certs, and write the
/// signature alongside its zip so staging can move both together.
fn fetch_and_persist_signatures(
    keyring_store: &KeyringStore,
    base_url: &url::Url,
    images: &[Image],
    staging_dir: &std::path::Path,
) -> Result<()> {
    let keyrings = keyring_store
        .load_all()
        .context("loading keyrings for download verification")?;
    let certs = trusted_certs(&keyrings);
    let client = fetch::new_http_client()?;
    let retries = FetchRetries::Finite(NonZeroU32::new(3).unwrap());

    for image in images {
        for file in &image.files {
            let filename = file.path.rsplit('/').next().unwrap_or(&file.path);
            let zip_path = staging_dir.join(filename);
            let sig_url = base_url
                .join(&file.signature)
                .with_context(|| format!("building signature URL for {}", file.signature))?;
            let signature = fetch::http_get(&client, sig_url.as_str(), retries)
                .with_context(|| format!("fetching signature for {filename}"))?
                .bytes()
                .with_context(|| format!("reading signature body for {filename}"))?;

            let zip_file = std::fs::File::open(&zip_path)
                .with_context(|| format!("opening {}", zip_path.display()))?;
            let mut reader = crate::verify::VerifyReader::new(
                std::io::BufReader::new(zip_file),
                &signature,
                certs.clone(),
            )
            .with_context(|| format!("starting verification of {filename}"))?;
            std::io::copy(&mut reader, &mut std::io::sink())
                .with_context(|| format!("streaming {filename}"))?;
            reader
                .verify()
                .map_err(|_| SignatureError::Invalid { artifact: filename.to_string() })?;

            let sig_filename = file.signature.rsplit('/').next().unwrap_or(&file.signature);
            std::fs::write(staging_dir.join(sig_filename), &signature[..])
                .with_context(|| format!("writing signature for {filename}"))?;
        }
    }
    Ok(())
}

fn build_file_requests(
    images: &[Image],
    base_url: &url::Url,
    dest_dir: &PathBuf,
) -> Result<Vec<FileRequest>> {
    let mut requests = Vec::new();
    for image in images {
        for file in &image.files {
            let filename = file
                .path
                .rsplit('/')
                .next()
                .context("file path has no basename")?;
            let url = base_url
                .join(&file.path)
                .with_context(|| format!("building download URL for {}", file.path))?;
            requests.push(FileRequest {
                url: url.to_string(),
                dest: dest_dir.join(filename),
                expected_sha256: file.checksum.clone(),
                size: file.size,
            });
        }
    }
    Ok(requests)
}

/// Acquires the service's single-instance name. Implemented with an
/// exclusive `flock` on a well-known file, the simplest primitive that
/// gives "one holder at a time, released automatically on process exit"
/// without pulling in a D-Bus client library the teacher never uses.
pub struct InstanceLock {
    _file: std::fs::File,
}

impl InstanceLock {
    pub fn acquire(path: &std::path::Path) -> Result<Self> {
        use nix::fcntl::{flock, FlockArg};
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .context("another instance is already running")?;
        Ok(Self { _file: file })
    }
}

/// Timestamp helper for `last_update_date`/`last_check_date`, kept as a
/// plain RFC3339-ish string the way the rest of the engine treats dates
/// (no chrono dependency; the teacher has none either).
pub fn now_rfc3339() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("unix:{secs}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::download::{BatchStatus, Downloader};
    use crate::hooks::HookRegistry;
    use crate::keyring::KeyringStore;
    use crate::settings::SettingsStore;

    fn test_engine() -> (Arc<Engine>, Receiver<Event>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.service.base_host = "example.com".into();
        config.service.https_port = config::Port::Number(443);
        config.service.channel = "stable".into();
        config.service.device = Some("mako".into());
        config.service.build_number = 100;

        let hooks = HookRegistry::resolve("default", "weighted", "noop").unwrap();
        let keyring_store = KeyringStore::new(dir.path());
        let settings = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        let (engine, rx) = Engine::new(config, hooks, keyring_store, settings);
        (engine, rx, dir)
    }

    #[test]
    fn test_cancel_without_download_emits_nothing() {
        let (engine, rx, _dir) = test_engine();
        engine.cancel();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_apply_before_download_is_rejected() {
        let (engine, _rx, dir) = test_engine();
        engine.apply(&dir.path().join("command")).unwrap_err();
    }

    #[test]
    fn test_settings_roundtrip_emits_change_event() {
        let (engine, rx, _dir) = test_engine();
        engine.set_setting(crate::settings::KEY_MIN_BATTERY, "30").unwrap();
        assert_eq!(engine.get_setting(crate::settings::KEY_MIN_BATTERY).as_deref(), Some("30"));
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, Event::SettingChanged { .. }));

        // setting the same value again does not emit a second event
        engine.set_setting(crate::settings::KEY_MIN_BATTERY, "30").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_instance_lock_rejects_second_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lock");
        let _first = InstanceLock::acquire(&path).unwrap();
        InstanceLock::acquire(&path).unwrap_err();
    }

    /// S6: pause/resume fidelity -- a paused batch's partial file survives,
    /// and the handle's cancel flag is independent of pause.
    #[test]
    fn test_pause_then_cancel_flow() {
        let (engine, _rx, dir) = test_engine();

        struct NeverDownloader;
        impl Downloader for NeverDownloader {
            fn enqueue(
                &self,
                requests: Vec<FileRequest>,
                _options: DownloadOptions,
            ) -> Result<crate::download::Handle> {
                crate::download::validate_batch(&requests)?;
                Ok(crate::download::Handle {
                    progress: Arc::new(crate::download::Progress {
                        bytes_done: std::sync::atomic::AtomicU64::new(5_000_000),
                        bytes_total: 10_000_000,
                        status: Mutex::new(BatchStatus::Running),
                        cancel: std::sync::atomic::AtomicBool::new(false),
                        pause: std::sync::atomic::AtomicBool::new(false),
                        allow_cellular: false,
                    }),
                })
            }
        }

        let requests = vec![FileRequest {
            url: "http://example.com/a.zip".into(),
            dest: dir.path().join("a.zip"),
            expected_sha256: "x".repeat(64),
            size: 10_000_000,
        }];
        let handle = engine.download_batch(&NeverDownloader, requests).unwrap();
        assert_eq!(handle.progress.percent(), 50);

        engine.pause();
        engine.cancel();
    }
}
