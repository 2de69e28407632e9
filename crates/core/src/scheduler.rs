//! The swipe loop: swipe, count down a randomised interval, swipe again.
//!
//! A dedicated thread owns the state machine and is driven by messages
//! (swipe finished, interrupt, stop) plus a one-second tick. Swipes run on
//! their own short-lived thread so the countdown never blocks on a gesture.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::device::DeviceHandle;
use crate::error::Result;
use crate::events::EventBus;
use crate::gesture::{self, SwipeShape};
use crate::logger;
use crate::matcher::{self, Template};
use crate::platform::Platform;
use crate::settings::SwiperParams;
use crate::sleep::{self, StopSignal};
use crate::types::{Event, SwipeReport};
use crate::worker::Worker;

/// Interval range used while the detector sees its target.
pub const ACCEL_RANGE: (f64, f64) = (2.0, 4.0);
const GATE_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Start-gate templates (`assets/e`).
    pub gate_dir: PathBuf,
    pub gate_retry: Duration,
    /// Length of one countdown second.
    pub tick: Duration,
}

impl SchedulerConfig {
    pub fn new(gate_dir: impl Into<PathBuf>) -> Self {
        Self {
            gate_dir: gate_dir.into(),
            gate_retry: Duration::from_millis(1500),
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Swiping,
    Scheduling(u32),
    /// Start condition not met yet; re-checked after `gate_retry`.
    GateWait,
}

/// Seconds until the next swipe, never below 1.
pub fn next_interval<R: Rng + ?Sized>(rng: &mut R, params: &SwiperParams, accelerated: bool) -> u32 {
    let secs = if accelerated {
        rng.gen_range(ACCEL_RANGE.0..=ACCEL_RANGE.1)
    } else {
        sleep::uniform_secs(rng, params.interval_min, params.interval_max)
    };
    (secs.floor() as u32).max(1)
}

/// Jitter the endpoints by up to `coord_offset` percent and draw a duration.
pub fn draw_swipe<R: Rng + ?Sized>(rng: &mut R, params: &SwiperParams) -> ((f64, f64), (f64, f64), SwipeShape) {
    let off = params.coord_offset / 100.0;
    let mut wobble = |v: f64| {
        let d = if off > 0.0 { rng.gen_range(-off..=off) } else { 0.0 };
        (v + d).clamp(0.0, 1.0)
    };
    let start = (wobble(params.start_x), wobble(params.start_y));
    let end = (wobble(params.end_x), wobble(params.end_y));
    let (lo, hi) = if params.duration_min <= params.duration_max {
        (params.duration_min, params.duration_max)
    } else {
        (params.duration_max, params.duration_min)
    };
    let shape = SwipeShape {
        duration_ms: u64::from(rng.gen_range(lo..=hi)),
        jitter: params.jitter,
        steps_min: params.steps_min,
        steps_max: params.steps_max,
    };
    (start, end, shape)
}

enum Msg {
    SwipeDone(Result<SwipeReport>),
    Interrupt,
    Stop,
}

struct Shared {
    device: Arc<DeviceHandle>,
    platform: Arc<dyn Platform>,
    events: Arc<EventBus>,
    latch: Arc<AtomicBool>,
    cfg: SchedulerConfig,
    running: AtomicBool,
    swipes: AtomicU64,
    phase: Mutex<Phase>,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    tx: Mutex<Option<mpsc::Sender<Msg>>>,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    /// `latch` is the detector's found flag; only read here.
    pub fn new(
        device: Arc<DeviceHandle>,
        platform: Arc<dyn Platform>,
        events: Arc<EventBus>,
        latch: Arc<AtomicBool>,
        cfg: SchedulerConfig,
    ) -> Self {
        logger::register_prefix("swiper", logger::COLOR_GREEN);
        Self {
            shared: Arc::new(Shared {
                device,
                platform,
                events,
                latch,
                cfg,
                running: AtomicBool::new(false),
                swipes: AtomicU64::new(0),
                phase: Mutex::new(Phase::Stopped),
            }),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase.lock().map(|p| *p).unwrap_or(Phase::Stopped)
    }

    pub fn swipes(&self) -> u64 {
        self.shared.swipes.load(Ordering::Acquire)
    }

    /// Start swiping right away. `title` is the window the start gate is
    /// checked in.
    pub fn start(&self, params: SwiperParams, title: &str) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let serial = self.shared.device.serial()?;
        // Reap a loop that ended on its own (swipe error).
        if let Some(w) = self.worker.lock().ok().and_then(|mut w| w.take()) {
            w.stop();
        }

        let params = params.validate();
        let gate: Vec<Template> = if params.p1_start_condition_enabled {
            matcher::load_dir(&self.shared.cfg.gate_dir)
        } else {
            Vec::new()
        };
        let (tx, rx) = mpsc::channel();
        self.shared.swipes.store(0, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let run = Run {
            shared: Arc::clone(&self.shared),
            tx: tx.clone(),
            params,
            title: title.to_string(),
            gate,
        };
        let name = self.shared.device.current().map(|d| d.name).unwrap_or(serial);
        logger::info_p("swiper", &format!("started on {}", name));
        self.shared.events.emit(Event::SwiperStarted);

        let worker = match Worker::spawn("swiper", move |stop| run.run(rx, stop)) {
            Ok(w) => w,
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.finish();
                return Err(e.into());
            }
        };
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(worker);
        }
        if let Ok(mut slot) = self.tx.lock() {
            *slot = Some(tx);
        }
        Ok(())
    }

    /// Cut the current countdown short if the detector still sees its target.
    pub fn interrupt(&self) {
        if let Some(tx) = self.tx.lock().ok().and_then(|t| t.clone()) {
            tx.send(Msg::Interrupt).ok();
        }
    }

    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        if let Some(tx) = self.tx.lock().ok().and_then(|mut t| t.take()) {
            tx.send(Msg::Stop).ok();
        }
        if let Some(w) = self.worker.lock().ok().and_then(|mut w| w.take()) {
            if !w.stop() {
                logger::warn_p("swiper", "loop did not exit in time");
            }
        }
        if was_running {
            self.shared.finish();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn set_phase(&self, phase: Phase) {
        if let Ok(mut p) = self.phase.lock() {
            *p = phase;
        }
    }

    fn finish(&self) {
        let swipes = self.swipes.load(Ordering::Acquire);
        self.set_phase(Phase::Stopped);
        logger::info_p("swiper", &format!("stopped after {} swipes", swipes));
        self.events.emit(Event::Countdown(None));
        self.events.emit(Event::SwiperStatus(format!("stopped ({} swipes)", swipes)));
        self.events.emit(Event::SwiperStopped { swipes });
    }
}

/// State owned by the loop thread for one start..stop cycle.
struct Run {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Msg>,
    params: SwiperParams,
    title: String,
    gate: Vec<Template>,
}

impl Run {
    fn run(self, rx: mpsc::Receiver<Msg>, stop: &StopSignal) {
        let mut rng = rand::thread_rng();
        let mut phase = self.dispatch(&mut rng);
        let mut deadline = Instant::now() + self.shared.cfg.tick;

        while !stop.is_stopped() {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(timeout) {
                Ok(Msg::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Ok(Msg::SwipeDone(Ok(report))) => {
                    if !self.shared.running.load(Ordering::Acquire) {
                        break;
                    }
                    let n = self.shared.swipes.fetch_add(1, Ordering::AcqRel) + 1;
                    self.shared.events.emit(Event::SwipeFinished(report));
                    self.shared.events.emit(Event::SwiperStatus(format!("running, {} swipes", n)));
                    phase = self.schedule(&mut rng);
                    deadline = self.deadline_for(phase);
                }
                Ok(Msg::SwipeDone(Err(e))) => {
                    logger::error_p("swiper", &format!("swipe failed: {}", e));
                    if self.shared.running.swap(false, Ordering::AcqRel) {
                        self.shared.finish();
                    }
                    return;
                }
                Ok(Msg::Interrupt) => match phase {
                    Phase::Scheduling(_) if !self.accelerated() => {
                        logger::info_p("swiper", "interrupt ignored, target no longer visible");
                    }
                    Phase::Scheduling(_) | Phase::GateWait => {
                        phase = self.schedule(&mut rng);
                        deadline = self.deadline_for(phase);
                    }
                    _ => {}
                },
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    phase = match phase {
                        Phase::Scheduling(n) if n > 1 => {
                            self.shared.events.emit(Event::Countdown(Some(n - 1)));
                            Phase::Scheduling(n - 1)
                        }
                        Phase::Scheduling(_) => {
                            self.shared.events.emit(Event::Countdown(None));
                            self.dispatch(&mut rng)
                        }
                        Phase::GateWait => self.schedule(&mut rng),
                        other => other,
                    };
                    deadline = self.deadline_for(phase);
                }
            }
            self.shared.set_phase(phase);
        }
    }

    fn deadline_for(&self, phase: Phase) -> Instant {
        let wait = match phase {
            Phase::GateWait => self.shared.cfg.gate_retry,
            _ => self.shared.cfg.tick,
        };
        Instant::now() + wait
    }

    fn accelerated(&self) -> bool {
        self.params.detection_enabled && self.shared.latch.load(Ordering::Acquire)
    }

    /// Gate check, then pick the next interval.
    fn schedule<R: Rng + ?Sized>(&self, rng: &mut R) -> Phase {
        if !self.gate_open() {
            self.shared.events.emit(Event::SwiperStatus("waiting for start condition".into()));
            self.shared.events.emit(Event::Countdown(None));
            return Phase::GateWait;
        }
        let accelerated = self.accelerated();
        let n = next_interval(rng, &self.params, accelerated);
        if accelerated {
            logger::info_p("swiper", &format!("target visible, next swipe in {}s", n));
        }
        self.shared.events.emit(Event::Countdown(Some(n)));
        Phase::Scheduling(n)
    }

    /// No gate configured, no templates, or no window title: open.
    /// A configured gate with a missing window is closed.
    fn gate_open(&self) -> bool {
        if !self.params.p1_start_condition_enabled || self.gate.is_empty() || self.title.is_empty() {
            return true;
        }
        let Some(region) = self.shared.platform.window_region(&self.title) else {
            return false;
        };
        self.gate
            .iter()
            .any(|t| self.shared.platform.find_template(t, GATE_CONFIDENCE, Some(region)).is_some())
    }

    /// Fire one swipe on its own thread; the result comes back as a message.
    fn dispatch<R: Rng + ?Sized>(&self, rng: &mut R) -> Phase {
        let (start, end, shape) = draw_swipe(rng, &self.params);
        let device = Arc::clone(&self.shared.device);
        let tx = self.tx.clone();
        let spawned = thread::Builder::new().name("swipe".into()).spawn(move || {
            let result = gesture::swipe_pct(&device, start, end, &shape);
            tx.send(Msg::SwipeDone(result)).ok();
        });
        if let Err(e) = spawned {
            self.tx.send(Msg::SwipeDone(Err(e.into()))).ok();
        }
        self.shared.set_phase(Phase::Swiping);
        Phase::Swiping
    }
}
