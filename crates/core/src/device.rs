use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use regex::Regex;

use crate::adb::{device_args, CommandOutput, EventStream, Transport};
use crate::error::{FlickError, Result};
use crate::logger;
use crate::types::{Device, FALLBACK_SIZE};

const SIZE_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Extract `WxH` from `wm size` output. The first (physical) size wins.
pub fn parse_wm_size(stdout: &str) -> Option<(u32, u32)> {
    let re = Regex::new(r"(\d+)\s*x\s*(\d+)").ok()?;
    let caps = re.captures(stdout)?;
    let w = caps[1].parse().ok()?;
    let h = caps[2].parse().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}

/// The device every controller is currently pointed at.
pub struct DeviceHandle {
    transport: Arc<dyn Transport>,
    current: RwLock<Option<Device>>,
}

impl DeviceHandle {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        logger::register_prefix("device", logger::COLOR_GRAY);
        Self { transport, current: RwLock::new(None) }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Target a new device and resolve its screen size right away.
    pub fn select(&self, id: &str, name: &str) -> Device {
        let mut dev = Device::new(id, name);
        self.resolve_size(&mut dev);
        if let Ok(mut cur) = self.current.write() {
            *cur = Some(dev.clone());
        }
        logger::info_p("device", &format!("target {} ({}x{})", dev.name, dev.width, dev.height));
        dev
    }

    pub fn clear(&self) {
        if let Ok(mut cur) = self.current.write() {
            *cur = None;
        }
    }

    pub fn current(&self) -> Option<Device> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    pub fn serial(&self) -> Result<String> {
        self.current().map(|d| d.id).ok_or(FlickError::NoDevice)
    }

    /// Screen size in pixels, queried once per device and cached.
    pub fn size(&self) -> Result<(u32, u32)> {
        let mut dev = self.current().ok_or(FlickError::NoDevice)?;
        if dev.size_resolved {
            return Ok((dev.width, dev.height));
        }
        self.resolve_size(&mut dev);
        if let Ok(mut cur) = self.current.write() {
            // Only cache if nobody switched devices meanwhile.
            if let Some(c) = cur.as_mut().filter(|c| c.id == dev.id) {
                *c = dev.clone();
            }
        }
        Ok((dev.width, dev.height))
    }

    fn resolve_size(&self, dev: &mut Device) {
        let out = self
            .transport
            .run(&device_args(&dev.id, &["shell", "wm", "size"]), Some(SIZE_QUERY_TIMEOUT));
        match parse_wm_size(&out.stdout) {
            Some((w, h)) => {
                dev.width = w;
                dev.height = h;
            }
            None => {
                logger::warn_p(
                    "device",
                    &format!("could not read screen size of {}, assuming {}x{}", dev.id, FALLBACK_SIZE.0, FALLBACK_SIZE.1),
                );
                dev.width = FALLBACK_SIZE.0;
                dev.height = FALLBACK_SIZE.1;
            }
        }
        dev.size_resolved = true;
    }

    /// A short zero-length swipe; reads as a finger tap.
    pub fn tap(&self, x: u32, y: u32) -> Result<CommandOutput> {
        let serial = self.serial()?;
        let hold = rand::thread_rng().gen_range(40..=90).to_string();
        let (x, y) = (x.to_string(), y.to_string());
        let out = self.transport.run(
            &device_args(&serial, &["shell", "input", "swipe", &x, &y, &x, &y, &hold]),
            Some(COMMAND_TIMEOUT),
        );
        if !out.success() {
            logger::warn_p("device", &format!("tap failed ({}): {}", out.code, out.stderr.trim()));
        }
        Ok(out)
    }

    pub fn back(&self) -> Result<CommandOutput> {
        let serial = self.serial()?;
        let out = self
            .transport
            .run(&device_args(&serial, &["shell", "input", "keyevent", "4"]), Some(COMMAND_TIMEOUT));
        if !out.success() {
            logger::warn_p("device", &format!("back failed ({}): {}", out.code, out.stderr.trim()));
        }
        Ok(out)
    }

    pub fn open_stream(&self) -> Result<Box<dyn EventStream>> {
        let serial = self.serial()?;
        self.transport.open_stream(&serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::testing::RecordingTransport;

    fn handle_with(t: &RecordingTransport) -> DeviceHandle {
        DeviceHandle::new(Arc::new(t.clone()))
    }

    #[test]
    fn test_parse_wm_size() {
        assert_eq!(parse_wm_size("Physical size: 1080x2400"), Some((1080, 2400)));
        assert_eq!(parse_wm_size("Physical size: 1440 x 3200\nOverride size: 720x1600"), Some((1440, 3200)));
        assert_eq!(parse_wm_size("error: no devices"), None);
    }

    #[test]
    fn test_primitives_fail_fast_without_device() {
        let t = RecordingTransport::new();
        let dev = handle_with(&t);
        assert!(matches!(dev.size(), Err(FlickError::NoDevice)));
        assert!(matches!(dev.tap(1, 2), Err(FlickError::NoDevice)));
        assert!(matches!(dev.back(), Err(FlickError::NoDevice)));
        assert!(dev.open_stream().is_err());
        assert!(t.commands().is_empty());
    }

    #[test]
    fn test_select_resolves_and_caches_size() {
        let t = RecordingTransport::new();
        t.respond("wm size", CommandOutput::ok("Physical size: 720x1600"));
        let dev = handle_with(&t);
        let d = dev.select("serial1", "Phone");
        assert_eq!((d.width, d.height), (720, 1600));
        assert_eq!(dev.size().unwrap(), (720, 1600));
        assert_eq!(t.commands().len(), 1);
    }

    #[test]
    fn test_unreadable_size_falls_back() {
        let t = RecordingTransport::new();
        t.respond("wm size", CommandOutput::failed(crate::adb::EXIT_TIMEOUT, "Timeout"));
        let dev = handle_with(&t);
        dev.select("serial1", "Phone");
        assert_eq!(dev.size().unwrap(), FALLBACK_SIZE);
    }

    #[test]
    fn test_tap_and_back_commands() {
        let t = RecordingTransport::new();
        let dev = handle_with(&t);
        dev.select("s", "Phone");
        dev.tap(100, 200).unwrap();
        dev.back().unwrap();
        let cmds = t.commands();
        let tap = &cmds[1];
        assert_eq!(&tap[..8], &crate::adb::args(&["-s", "s", "shell", "input", "swipe", "100", "200", "100"]));
        let hold: u32 = tap[9].parse().unwrap();
        assert!((40..=90).contains(&hold));
        assert_eq!(cmds[2], crate::adb::args(&["-s", "s", "shell", "input", "keyevent", "4"]));
    }
}
