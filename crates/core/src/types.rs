use std::path::PathBuf;

/// Screen-coordinate rectangle of a desktop window (left, top, width, height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub l: i32,
    pub t: i32,
    pub w: i32,
    pub h: i32,
}

impl Region {
    pub fn new(l: i32, t: i32, w: i32, h: i32) -> Self {
        Self { l, t, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }
}

/// Where a template matched, in absolute screen pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchBox {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// The Android device currently targeted by the controllers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub size_resolved: bool,
}

pub const FALLBACK_SIZE: (u32, u32) = (1080, 2400);

impl Device {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            width: FALLBACK_SIZE.0,
            height: FALLBACK_SIZE.1,
            size_resolved: false,
        }
    }

    /// Last 8 chars of the serial, used when no alias is known.
    pub fn short_id(&self) -> &str {
        let start = self.id.len().saturating_sub(8);
        self.id.get(start..).unwrap_or(&self.id)
    }
}

/// Hunter template buckets, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    Click,
    Back,
    ReservedC,
    ReservedD,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Click,
        ActionKind::Back,
        ActionKind::ReservedC,
        ActionKind::ReservedD,
    ];

    /// Sub-folder of the assets dir holding this bucket's templates.
    pub fn folder(&self) -> &'static str {
        match self {
            ActionKind::Click => "a",
            ActionKind::Back => "b",
            ActionKind::ReservedC => "c",
            ActionKind::ReservedD => "d",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Back => "back",
            ActionKind::ReservedC => "reserved-1",
            ActionKind::ReservedD => "reserved-2",
        }
    }
}

/// A hunter detection: which template matched, where, and what to do about it
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub kind: ActionKind,
    pub template: PathBuf,
    pub found: MatchBox,
}

/// Summary of one executed swipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwipeReport {
    pub segments: usize,
    pub duration_ms: u64,
}

/// Notifications published to whatever drives the core (UI, CLI, tests)
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SwiperStarted,
    SwiperStopped { swipes: u64 },
    SwiperStatus(String),
    /// Seconds until the next swipe; `None` when nothing is scheduled.
    Countdown(Option<u32>),
    SwipeFinished(SwipeReport),
    Detection(bool),
    HunterStarted,
    HunterStopped,
}

/// Request from the driver to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RefreshDevices,
    SwitchDevice(String),
    SelectProfile(String),
    StartSwiper,
    StopSwiper,
    StartHunter,
    StopHunter,
    Detection(bool),
    WifiConnect,
    KillServer,
    Quit,
}
