use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::device::DeviceHandle;
use crate::error::{FlickError, Result};
use crate::events::EventBus;
use crate::logger;
use crate::matcher::{self, Template};
use crate::platform::Platform;
use crate::settings::HunterParams;
use crate::sleep::{self, StopSignal};
use crate::types::{ActionKind, Event, Hit, MatchBox, Region};
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct HunterConfig {
    /// Parent of the `a/ b/ c/ d/` bucket folders.
    pub root: PathBuf,
    pub tick: Duration,
    pub window_wait: Duration,
}

impl HunterConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tick: Duration::from_millis(500),
            window_wait: Duration::from_secs(2),
        }
    }
}

/// Templates grouped by action, in priority order.
pub struct Buckets {
    buckets: Vec<(ActionKind, Vec<Template>)>,
}

impl Buckets {
    pub fn load(root: &Path) -> Self {
        let buckets = ActionKind::ALL
            .iter()
            .map(|&kind| {
                let templates = matcher::load_dir(&root.join(kind.folder()));
                logger::info_p("hunter", &format!("{} templates for {}", templates.len(), kind.label()));
                (kind, templates)
            })
            .collect();
        Self { buckets }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|(_, t)| t.is_empty())
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.buckets.iter().find(|(k, _)| *k == kind).map_or(0, |(_, t)| t.len())
    }

    /// Pick this frame's target. Every click template is tried and the
    /// smallest file name among the matches wins; otherwise the first hit of
    /// the remaining buckets, in order.
    pub fn choose(&self, platform: &dyn Platform, conf: f64, region: Region) -> Option<(Hit, &Template)> {
        for (kind, templates) in &self.buckets {
            let hit = |t: &Template| platform.find_template(t, conf, Some(region));
            let chosen = if *kind == ActionKind::Click {
                templates
                    .iter()
                    .filter_map(|t| hit(t).map(|b| (t, b)))
                    .min_by(|a, b| a.0.name().cmp(&b.0.name()))
            } else {
                templates.iter().find_map(|t| hit(t).map(|b| (t, b)))
            };
            if let Some((t, found)) = chosen {
                return Some((Hit { kind: *kind, template: t.path().to_path_buf(), found }, t));
            }
        }
        None
    }
}

/// Random point inside the configured sub-rectangle of `found`, mapped from
/// window pixels to device pixels.
pub fn click_point<R: Rng + ?Sized>(
    rng: &mut R,
    found: &MatchBox,
    window: Region,
    params: &HunterParams,
    device_size: (u32, u32),
) -> (u32, u32) {
    let fx = sleep::uniform_secs(rng, params.x_min, params.x_max);
    let fy = sleep::uniform_secs(rng, params.y_min, params.y_max);
    let px = found.left + (f64::from(found.width) * fx) as i32;
    let py = found.top + (f64::from(found.height) * fy) as i32;

    let rel_x = f64::from(px - window.l) / f64::from(window.w.max(1));
    let rel_y = f64::from(py - window.t) / f64::from(window.h.max(1));
    (
        (rel_x.clamp(0.0, 1.0) * f64::from(device_size.0)) as u32,
        (rel_y.clamp(0.0, 1.0) * f64::from(device_size.1)) as u32,
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NoWindow,
    Nothing,
    Cancelled,
    /// Target or window vanished during the pre-action delay.
    Abandoned,
    Acted(ActionKind),
}

/// One armed hunter run against a window.
pub struct Session {
    platform: Arc<dyn Platform>,
    device: Arc<DeviceHandle>,
    buckets: Buckets,
    params: HunterParams,
    title: String,
}

impl Session {
    pub fn new(
        platform: Arc<dyn Platform>,
        device: Arc<DeviceHandle>,
        buckets: Buckets,
        params: HunterParams,
        title: &str,
    ) -> Self {
        Self { platform, device, buckets, params: params.validate(), title: title.to_string() }
    }

    pub fn tick<R: Rng + ?Sized>(&self, rng: &mut R, stop: &StopSignal) -> TickOutcome {
        let Some(region) = self.platform.window_region(&self.title) else {
            return TickOutcome::NoWindow;
        };
        match self.buckets.choose(self.platform.as_ref(), self.params.conf, region) {
            Some((hit, template)) => self.act(rng, stop, &hit, template),
            None => TickOutcome::Nothing,
        }
    }

    fn act<R: Rng + ?Sized>(&self, rng: &mut R, stop: &StopSignal, hit: &Hit, template: &Template) -> TickOutcome {
        let name = template.name();
        let delay = sleep::uniform_secs(rng, self.params.min_s, self.params.max_s);
        logger::info_p("hunter", &format!("{} target {} found, acting in {:.1}s", hit.kind.label(), name, delay));
        if stop.wait_secs(delay) {
            return TickOutcome::Cancelled;
        }

        let Some(region) = self.platform.window_region(&self.title) else {
            logger::info_p("hunter", &format!("skipped: window '{}' is gone", self.title));
            return TickOutcome::Abandoned;
        };
        if self.platform.find_template(template, self.params.conf, Some(region)).is_none() {
            logger::info_p("hunter", &format!("skipped: {} disappeared while waiting", name));
            return TickOutcome::Abandoned;
        }

        let result = match hit.kind {
            ActionKind::Click => self.device.size().and_then(|size| {
                let (x, y) = click_point(rng, &hit.found, region, &self.params, size);
                self.device.tap(x, y)?;
                logger::info_p("hunter", &format!("tapped {} at ({}, {})", name, x, y));
                Ok(())
            }),
            ActionKind::Back => self.device.back().map(|_| {
                logger::info_p("hunter", &format!("back (triggered by {})", name));
            }),
            other => {
                logger::info_p("hunter", &format!("{} action noted for {}", other.label(), name));
                Ok(())
            }
        };
        if let Err(e) = result {
            // Each tick stands alone; the loop keeps going.
            logger::error_p("hunter", &format!("action failed: {}", e));
        }
        TickOutcome::Acted(hit.kind)
    }

    fn run(&self, cfg: &HunterConfig, stop: &StopSignal) {
        let mut rng = rand::thread_rng();
        logger::info_p("hunter", &format!("hunting in '{}'", self.title));
        while !stop.is_stopped() {
            let wait = match self.tick(&mut rng, stop) {
                TickOutcome::NoWindow => {
                    logger::info_p("hunter", &format!("waiting for window '{}'", self.title));
                    cfg.window_wait
                }
                TickOutcome::Cancelled => break,
                _ => cfg.tick,
            };
            if stop.wait(wait) {
                break;
            }
        }
    }
}

pub struct Hunter {
    platform: Arc<dyn Platform>,
    device: Arc<DeviceHandle>,
    events: Arc<EventBus>,
    cfg: HunterConfig,
    worker: Mutex<Option<Worker>>,
}

impl Hunter {
    pub fn new(platform: Arc<dyn Platform>, device: Arc<DeviceHandle>, events: Arc<EventBus>, cfg: HunterConfig) -> Self {
        logger::register_prefix("hunter", logger::COLOR_YELLOW);
        Self { platform, device, events, cfg, worker: Mutex::new(None) }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().map(|w| w.as_ref().map_or(false, |w| !w.is_finished())).unwrap_or(false)
    }

    /// Reload the buckets and start hunting in `title`. A running hunter is
    /// left alone.
    pub fn start(&self, params: HunterParams, title: &str) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.device.serial()?;
        let buckets = Buckets::load(&self.cfg.root);
        if buckets.is_empty() {
            return Err(FlickError::NoTemplates(self.cfg.root.clone()));
        }
        let session = Session::new(Arc::clone(&self.platform), Arc::clone(&self.device), buckets, params, title);
        let cfg = self.cfg.clone();
        let worker = Worker::spawn("hunter", move |stop| session.run(&cfg, stop))?;
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(worker);
        }
        self.events.emit(Event::HunterStarted);
        Ok(())
    }

    pub fn stop(&self) {
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(w) = worker {
            if !w.stop() {
                logger::warn_p("hunter", "hunt loop did not exit in time");
            }
            logger::info_p("hunter", "stopped");
            self.events.emit(Event::HunterStopped);
        }
    }
}

impl Drop for Hunter {
    fn drop(&mut self) {
        self.stop();
    }
}
