use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::adb::{self, Transport};
use crate::detector::{Detector, DetectorConfig};
use crate::device::DeviceHandle;
use crate::error::{FlickError, Result};
use crate::events::EventBus;
use crate::hunter::{Hunter, HunterConfig};
use crate::logger;
use crate::platform::Platform;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::settings::{Profile, ProfileStore, Settings, DEFAULT_PROFILE};
use crate::types::{Command, Device, Event};

const WIFI_SUFFIX: &str = " (WIFI)";

/// A connected device as offered to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub serial: String,
    /// Also the title of the device's mirror window.
    pub name: String,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wires the device, detector, scheduler and hunter together and owns the
/// settings and profiles they are configured from.
pub struct Controller {
    transport: Arc<dyn Transport>,
    device: Arc<DeviceHandle>,
    events: Arc<EventBus>,
    detector: Detector,
    scheduler: Arc<Scheduler>,
    hunter: Hunter,
    settings: Mutex<Settings>,
    settings_path: PathBuf,
    profiles: Mutex<ProfileStore>,
    active: Mutex<String>,
    devices: Mutex<Vec<DeviceEntry>>,
    /// `ip:port` -> display name of the USB device it came from.
    wifi_aliases: Mutex<HashMap<String, String>>,
}

impl Controller {
    pub fn new(
        transport: Arc<dyn Transport>,
        platform: Arc<dyn Platform>,
        settings: Settings,
        settings_path: PathBuf,
        profiles: ProfileStore,
    ) -> Self {
        let device = Arc::new(DeviceHandle::new(Arc::clone(&transport)));
        let events = Arc::new(EventBus::new());

        let detector = Detector::new(
            Arc::clone(&platform),
            Arc::clone(&events),
            DetectorConfig::new(&settings.assets_dir),
        );
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&device),
            Arc::clone(&platform),
            Arc::clone(&events),
            detector.latch(),
            SchedulerConfig::new(settings.gate_dir()),
        ));
        let weak: Weak<Scheduler> = Arc::downgrade(&scheduler);
        detector.on_interrupt(Box::new(move || {
            if let Some(s) = weak.upgrade() {
                s.interrupt();
            }
        }));
        let hunter = Hunter::new(
            platform,
            Arc::clone(&device),
            Arc::clone(&events),
            HunterConfig::new(&settings.assets_dir),
        );
        detector.start();

        let active = settings
            .last_profile
            .clone()
            .filter(|p| profiles.get(p).is_some())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

        Self {
            transport,
            device,
            events,
            detector,
            scheduler,
            hunter,
            settings: Mutex::new(settings),
            settings_path,
            profiles: Mutex::new(profiles),
            active: Mutex::new(active),
            devices: Mutex::new(Vec::new()),
            wifi_aliases: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn device(&self) -> Option<Device> {
        self.device.current()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn hunter(&self) -> &Hunter {
        &self.hunter
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn active_profile_name(&self) -> String {
        lock(&self.active).clone()
    }

    pub fn active_profile(&self) -> Profile {
        let name = self.active_profile_name();
        lock(&self.profiles).get(&name).cloned().unwrap_or_default()
    }

    /// Re-list devices. Keeps the current target if it is still connected,
    /// otherwise falls back to the first device (or none).
    pub fn refresh_devices(&self) -> Vec<DeviceEntry> {
        let serials = adb::list_devices(self.transport.as_ref());
        logger::info(&format!("{} device(s) connected", serials.len()));

        let entries: Vec<DeviceEntry> = {
            let mut aliases = lock(&self.wifi_aliases);
            aliases.retain(|ip, _| serials.contains(ip));
            let settings = lock(&self.settings);
            serials
                .iter()
                .map(|s| {
                    let name = match aliases.get(s) {
                        Some(alias) => format!("{}{}", alias, WIFI_SUFFIX),
                        None => settings.display_name(s),
                    };
                    DeviceEntry { serial: s.clone(), name }
                })
                .collect()
        };
        *lock(&self.devices) = entries.clone();

        let current = self.device.current().map(|d| d.id);
        let still_there = current.as_ref().map_or(false, |c| entries.iter().any(|e| &e.serial == c));
        if !still_there {
            match entries.first() {
                Some(first) => {
                    if let Err(e) = self.switch_device(&first.serial) {
                        logger::error(&format!("device switch failed: {}", e));
                    }
                }
                None => self.clear_device(),
            }
        }
        entries
    }

    /// Target `serial`. Both loops are stopped first.
    pub fn switch_device(&self, serial: &str) -> Result<Device> {
        self.scheduler.stop();
        self.hunter.stop();
        let name = lock(&self.devices)
            .iter()
            .find(|e| e.serial == serial)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| lock(&self.settings).display_name(serial));
        let dev = self.device.select(serial, &name);
        self.apply_detection();
        Ok(dev)
    }

    pub fn clear_device(&self) {
        self.scheduler.stop();
        self.hunter.stop();
        self.device.clear();
        self.detector.disable();
        logger::info("no device selected");
    }

    /// Make `name` the active profile. Running loops are stopped.
    pub fn select_profile(&self, name: &str) -> Result<()> {
        if lock(&self.profiles).get(name).is_none() {
            return Err(FlickError::Profile(format!("unknown profile '{name}'")));
        }
        self.scheduler.stop();
        self.hunter.stop();
        *lock(&self.active) = name.to_string();
        lock(&self.settings).last_profile = Some(name.to_string());
        self.apply_detection();
        Ok(())
    }

    pub fn update_profile(&self, profile: Profile) {
        let name = self.active_profile_name();
        lock(&self.profiles).upsert(&name, profile);
        self.apply_detection();
    }

    fn window_title(&self) -> Result<String> {
        self.device.current().map(|d| d.name).ok_or(FlickError::NoDevice)
    }

    pub fn start_swiper(&self) -> Result<()> {
        let title = self.window_title()?;
        self.scheduler.start(self.active_profile().swiper, &title)
    }

    pub fn stop_swiper(&self) {
        self.scheduler.stop();
    }

    pub fn start_hunter(&self) -> Result<()> {
        let title = self.window_title()?;
        self.hunter.start(self.active_profile().hunter, &title)
    }

    pub fn stop_hunter(&self) {
        self.hunter.stop();
    }

    /// Persist the flag in the active profile and arm or disarm the detector.
    pub fn toggle_detection(&self, enabled: bool) {
        let mut profile = self.active_profile();
        profile.swiper.detection_enabled = enabled;
        self.update_profile(profile);
    }

    fn apply_detection(&self) {
        let enabled = self.active_profile().swiper.detection_enabled;
        match self.device.current() {
            Some(dev) if enabled => {
                self.detector.enable(&dev.name);
                logger::info_p("detector", "enabled");
            }
            _ => {
                self.detector.disable();
                logger::info_p("detector", "disabled");
            }
        }
    }

    pub fn kill_server(&self) -> bool {
        self.scheduler.stop();
        self.hunter.stop();
        adb::kill_server(self.transport.as_ref())
    }

    /// Move the current USB device to adb-over-TCP and switch to it.
    pub fn wifi_connect(&self) -> Result<String> {
        let dev = self.device.current().ok_or(FlickError::NoDevice)?;
        let target = adb::wifi_connect(self.transport.as_ref(), &dev.id)?;
        let clean = dev.name.trim_end_matches(WIFI_SUFFIX).to_string();
        lock(&self.wifi_aliases).insert(target.clone(), clean);
        self.refresh_devices();
        Ok(target)
    }

    /// Run one driver command. Returns false on `Quit`.
    pub fn handle(&self, cmd: Command) -> bool {
        let result = match cmd {
            Command::Quit => {
                self.shutdown();
                return false;
            }
            Command::RefreshDevices => {
                self.refresh_devices();
                Ok(())
            }
            Command::SwitchDevice(serial) => self.switch_device(&serial).map(|_| ()),
            Command::SelectProfile(name) => self.select_profile(&name),
            Command::StartSwiper => self.start_swiper(),
            Command::StopSwiper => {
                self.stop_swiper();
                Ok(())
            }
            Command::StartHunter => self.start_hunter(),
            Command::StopHunter => {
                self.stop_hunter();
                Ok(())
            }
            Command::Detection(on) => {
                self.toggle_detection(on);
                Ok(())
            }
            Command::WifiConnect => self.wifi_connect().map(|_| ()),
            Command::KillServer => {
                self.kill_server();
                Ok(())
            }
        };
        if let Err(e) = result {
            logger::error(&e.to_string());
        }
        true
    }

    /// Stop both loops, persist profiles and settings, stop the detector.
    pub fn shutdown(&self) {
        logger::info("shutting down");
        self.scheduler.stop();
        self.hunter.stop();
        if let Err(e) = lock(&self.profiles).save() {
            logger::error(&format!("saving profiles failed: {}", e));
        }
        if let Err(e) = lock(&self.settings).save(&self.settings_path) {
            logger::error(&format!("saving settings failed: {}", e));
        }
        self.detector.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::testing::RecordingTransport;
    use crate::adb::CommandOutput;
    use crate::platform::stub::StubPlatform;
    use crate::scheduler::Phase;

    struct Fixture {
        dir: tempfile::TempDir,
        transport: RecordingTransport,
        ctl: Controller,
    }

    fn fixture() -> Fixture {
        fixture_with("List of devices attached\nAAA111\tdevice\nBBB222\tdevice\n")
    }

    fn fixture_with(devices: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let transport = RecordingTransport::new();
        transport.respond("devices", CommandOutput::ok(devices));
        transport.respond("wm size", CommandOutput::ok("Physical size: 720x1600"));
        let mut settings = Settings { assets_dir: dir.path().join("assets"), ..Settings::default() };
        settings.device_names.insert("AAA111".into(), "Phone A".into());
        let profiles = ProfileStore::load(&dir.path().join("profiles.json"));
        let ctl = Controller::new(
            Arc::new(transport.clone()),
            Arc::new(StubPlatform::new()),
            settings,
            dir.path().join("settings.json"),
            profiles,
        );
        Fixture { dir, transport, ctl }
    }

    #[test]
    fn test_refresh_picks_first_device_with_display_name() {
        let f = fixture();
        let list = f.ctl.refresh_devices();
        assert_eq!(list[0], DeviceEntry { serial: "AAA111".into(), name: "Phone A".into() });
        assert_eq!(list[1].name, "BBB222");
        let dev = f.ctl.device().unwrap();
        assert_eq!((dev.id.as_str(), dev.width, dev.height), ("AAA111", 720, 1600));
    }

    #[test]
    fn test_start_without_device_is_a_configuration_error() {
        let f = fixture();
        assert!(matches!(f.ctl.start_swiper(), Err(FlickError::NoDevice)));
        assert!(matches!(f.ctl.start_hunter(), Err(FlickError::NoDevice)));
        assert!(matches!(f.ctl.wifi_connect(), Err(FlickError::NoDevice)));
    }

    #[test]
    fn test_switch_device_stops_swiper() {
        let f = fixture();
        f.ctl.refresh_devices();
        f.ctl.start_swiper().unwrap();
        assert!(f.ctl.scheduler().is_running());
        f.ctl.switch_device("BBB222").unwrap();
        assert!(!f.ctl.scheduler().is_running());
        assert_eq!(f.ctl.scheduler().phase(), Phase::Stopped);
        assert_eq!(f.ctl.device().unwrap().id, "BBB222");
    }

    #[test]
    fn test_detection_toggle_follows_profile() {
        let f = fixture();
        f.ctl.refresh_devices();
        assert!(!f.ctl.detector().is_enabled());
        f.ctl.toggle_detection(true);
        assert!(f.ctl.detector().is_enabled());
        assert!(f.ctl.active_profile().swiper.detection_enabled);
        f.ctl.clear_device();
        assert!(!f.ctl.detector().is_enabled());
    }

    #[test]
    fn test_wifi_connect_labels_network_serial() {
        let f = fixture_with("List of devices attached\nAAA111\tdevice\n10.0.0.7:5555\tdevice\n");
        f.ctl.refresh_devices();
        f.transport.respond("tcpip", CommandOutput::ok("restarting in TCP mode port: 5555"));
        f.transport.respond("wlan0", CommandOutput::ok("inet 10.0.0.7/24 brd 10.0.0.255"));
        f.transport.respond("connect", CommandOutput::ok("connected to 10.0.0.7:5555"));
        assert_eq!(f.ctl.wifi_connect().unwrap(), "10.0.0.7:5555");
        let list = f.ctl.refresh_devices();
        assert_eq!(list[1].name, "Phone A (WIFI)");
    }

    #[test]
    fn test_select_unknown_profile_fails() {
        let f = fixture();
        assert!(matches!(f.ctl.select_profile("nope"), Err(FlickError::Profile(_))));
        assert_eq!(f.ctl.active_profile_name(), DEFAULT_PROFILE);
    }

    #[test]
    fn test_quit_persists_and_reports_false() {
        let f = fixture();
        assert!(f.ctl.handle(Command::StopHunter));
        assert!(!f.ctl.handle(Command::Quit));
        assert!(f.dir.path().join("profiles.json").is_file());
        assert!(f.dir.path().join("settings.json").is_file());
    }
}
