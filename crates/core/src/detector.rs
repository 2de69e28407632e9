use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::events::EventBus;
use crate::logger;
use crate::matcher::{self, Template};
use crate::platform::Platform;
use crate::types::Event;
use crate::worker::Worker;

pub type InterruptFn = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Folder of `*.png` templates; any hit means "found".
    pub folder: PathBuf,
    pub confidence: f64,
    pub poll: Duration,
    pub idle: Duration,
}

impl DetectorConfig {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            confidence: 0.8,
            poll: Duration::from_millis(1500),
            idle: Duration::from_millis(200),
        }
    }
}

struct Armed {
    title: String,
    templates: Arc<[Template]>,
}

struct Inner {
    platform: Arc<dyn Platform>,
    events: Arc<EventBus>,
    cfg: DetectorConfig,
    armed: Mutex<Option<Armed>>,
    latch: Arc<AtomicBool>,
    interrupt: Mutex<Option<InterruptFn>>,
}

/// Watches a window for any of a set of templates and reports edges.
///
/// The found-latch is written only by the poll path; everyone else reads it
/// through [`Detector::latch`].
pub struct Detector {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl Detector {
    pub fn new(platform: Arc<dyn Platform>, events: Arc<EventBus>, cfg: DetectorConfig) -> Self {
        logger::register_prefix("detector", logger::COLOR_BLUE);
        Self {
            inner: Arc::new(Inner {
                platform,
                events,
                cfg,
                armed: Mutex::new(None),
                latch: Arc::new(AtomicBool::new(false)),
                interrupt: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Read-only view of the found-latch.
    pub fn latch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.latch)
    }

    pub fn is_found(&self) -> bool {
        self.inner.latch.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.armed.lock().map(|a| a.is_some()).unwrap_or(false)
    }

    /// Called once per false→true edge.
    pub fn on_interrupt(&self, f: InterruptFn) {
        if let Ok(mut slot) = self.inner.interrupt.lock() {
            *slot = Some(f);
        }
    }

    /// Arm against `title`. Templates are (re)read from disk here.
    pub fn enable(&self, title: &str) {
        let templates: Arc<[Template]> = matcher::load_dir(&self.inner.cfg.folder).into();
        if templates.is_empty() {
            logger::warn_p("detector", &format!("no templates in {}", self.inner.cfg.folder.display()));
        }
        logger::info_p("detector", &format!("watching '{}' with {} templates", title, templates.len()));
        if let Ok(mut armed) = self.inner.armed.lock() {
            *armed = Some(Armed { title: title.to_string(), templates });
        }
        self.inner.clear_latch();
    }

    pub fn disable(&self) {
        if let Ok(mut armed) = self.inner.armed.lock() {
            *armed = None;
        }
        self.inner.clear_latch();
    }

    /// One poll. Returns the frame's found-state, or `None` when disarmed.
    pub fn poll_once(&self) -> Option<bool> {
        self.inner.poll_once()
    }

    /// Start the background loop. No-op if it is already running.
    pub fn start(&self) {
        let Ok(mut slot) = self.worker.lock() else { return };
        if slot.as_ref().map_or(false, |w| !w.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        match Worker::spawn("detector", move |stop| loop {
            let wait = match inner.poll_once() {
                Some(_) => inner.cfg.poll,
                None => {
                    // A poll racing with disable() may have set the latch.
                    inner.clear_latch();
                    inner.cfg.idle
                }
            };
            if stop.wait(wait) {
                break;
            }
        }) {
            Ok(w) => *slot = Some(w),
            Err(e) => logger::error_p("detector", &format!("failed to start: {}", e)),
        }
    }

    pub fn stop(&self) {
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(w) = worker {
            if !w.stop() {
                logger::warn_p("detector", "poll loop did not exit in time");
            }
        }
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn poll_once(&self) -> Option<bool> {
        let (title, templates) = {
            let armed = self.armed.lock().ok()?;
            let a = armed.as_ref()?;
            (a.title.clone(), Arc::clone(&a.templates))
        };
        let Some(region) = self.platform.window_region(&title) else {
            self.clear_latch();
            return Some(false);
        };
        let found = templates
            .iter()
            .any(|t| self.platform.find_template(t, self.cfg.confidence, Some(region)).is_some());
        if found {
            self.set_latch();
        } else {
            self.clear_latch();
        }
        Some(found)
    }

    fn set_latch(&self) {
        if self.latch.swap(true, Ordering::AcqRel) {
            return;
        }
        logger::info_p("detector", "target visible");
        self.events.emit(Event::Detection(true));
        if let Ok(cb) = self.interrupt.lock() {
            if let Some(f) = cb.as_ref() {
                f();
            }
        }
    }

    fn clear_latch(&self) {
        if self.latch.swap(false, Ordering::AcqRel) {
            logger::info_p("detector", "target gone");
            self.events.emit(Event::Detection(false));
        }
    }
}
