pub mod stub;

#[cfg(feature = "desktop-capture")]
pub mod desktop;

use std::sync::Arc;

use image::{DynamicImage, RgbaImage};

use crate::logger;
use crate::matcher::{self, Template};
use crate::types::{MatchBox, Region};

/// Window lookup and screen capture for the perception side.
pub trait Platform: Send + Sync {
    /// Screen rectangle of the first visible window whose title contains
    /// `title`. Minimised windows count as absent.
    fn window_region(&self, title: &str) -> Option<Region>;

    /// Grab `region` of the screen, or the whole primary display.
    fn capture(&self, region: Option<Region>) -> Option<RgbaImage>;

    /// Locate `template` inside `region`. The box is in absolute screen
    /// coordinates. Every failure is a plain `None`.
    fn find_template(&self, template: &Template, confidence: f64, region: Option<Region>) -> Option<MatchBox> {
        let shot = self.capture(region)?;
        let rgb = DynamicImage::ImageRgba8(shot).into_rgb8();
        let (x, y) = matcher::locate(&rgb, template, confidence)?;
        let (ox, oy) = region.map_or((0, 0), |r| (r.l, r.t));
        Some(MatchBox {
            left: ox + x as i32,
            top: oy + y as i32,
            width: template.width(),
            height: template.height(),
        })
    }
}

/// Pick the capture backend. Without the `desktop-capture` feature only the
/// stub exists, which never finds a window.
pub fn create_platform(force_stub: bool) -> Arc<dyn Platform> {
    if force_stub {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        return Arc::new(stub::StubPlatform::new());
    }
    #[cfg(feature = "desktop-capture")]
    {
        logger::register_prefix("capture", logger::COLOR_GRAY);
        Arc::new(desktop::DesktopPlatform::new())
    }
    #[cfg(not(feature = "desktop-capture"))]
    {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        logger::warn_p("stub", "built without desktop-capture, screen matching is disabled");
        Arc::new(stub::StubPlatform::new())
    }
}
