use image::{imageops, RgbaImage};
use xcap::{Monitor, Window};

use super::Platform;
use crate::logger;
use crate::types::Region;

/// Capture through the OS compositor (xcap).
pub struct DesktopPlatform;

impl DesktopPlatform {
    pub fn new() -> Self {
        Self
    }

    fn monitor_for(region: Option<Region>) -> Option<Monitor> {
        if let Some(r) = region {
            if let Ok(m) = Monitor::from_point(r.l + r.w / 2, r.t + r.h / 2) {
                return Some(m);
            }
        }
        let monitors = Monitor::all().ok()?;
        let primary = monitors.iter().position(|m| m.is_primary()).unwrap_or(0);
        monitors.into_iter().nth(primary)
    }
}

impl Default for DesktopPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for DesktopPlatform {
    fn window_region(&self, title: &str) -> Option<Region> {
        let windows = match Window::all() {
            Ok(w) => w,
            Err(e) => {
                logger::warn_p("capture", &format!("window list failed: {}", e));
                return None;
            }
        };
        windows
            .iter()
            .filter(|w| !w.is_minimized() && w.title().contains(title))
            .map(|w| Region::new(w.x(), w.y(), w.width() as i32, w.height() as i32))
            .find(|r| !r.is_empty())
    }

    fn capture(&self, region: Option<Region>) -> Option<RgbaImage> {
        let monitor = Self::monitor_for(region)?;
        let shot = monitor.capture_image().ok()?;
        let Some(r) = region else { return Some(shot) };

        // Clip the requested rectangle to the monitor.
        let x0 = (r.l - monitor.x()).max(0) as u32;
        let y0 = (r.t - monitor.y()).max(0) as u32;
        if x0 >= shot.width() || y0 >= shot.height() {
            return None;
        }
        let w = (r.w.max(0) as u32).min(shot.width() - x0);
        let h = (r.h.max(0) as u32).min(shot.height() - y0);
        if w == 0 || h == 0 {
            return None;
        }
        Some(imageops::crop_imm(&shot, x0, y0, w, h).to_image())
    }
}
