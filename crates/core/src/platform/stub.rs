use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use image::RgbaImage;

use super::Platform;
use crate::matcher::Template;
use crate::types::{MatchBox, Region};

/// Scripted platform for tests and for builds without a capture backend.
///
/// Windows are registered by title. Match results are keyed by template
/// file name: queued results are consumed one per lookup, after which the
/// steady result (default `None`) is returned.
#[derive(Default)]
pub struct StubPlatform {
    windows: Mutex<HashMap<String, Region>>,
    queued: Mutex<HashMap<String, VecDeque<Option<MatchBox>>>>,
    steady: Mutex<HashMap<String, Option<MatchBox>>>,
    lookups: Mutex<HashMap<String, usize>>,
}

impl StubPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_window(&self, title: &str, region: Option<Region>) {
        if let Ok(mut w) = self.windows.lock() {
            match region {
                Some(r) => w.insert(title.to_string(), r),
                None => w.remove(title),
            };
        }
    }

    pub fn push_results(&self, template: &str, results: impl IntoIterator<Item = Option<MatchBox>>) {
        if let Ok(mut q) = self.queued.lock() {
            q.entry(template.to_string()).or_default().extend(results);
        }
    }

    pub fn set_steady(&self, template: &str, result: Option<MatchBox>) {
        if let Ok(mut s) = self.steady.lock() {
            s.insert(template.to_string(), result);
        }
    }

    /// How many times `template` has been looked up.
    pub fn lookups(&self, template: &str) -> usize {
        self.lookups.lock().ok().and_then(|l| l.get(template).copied()).unwrap_or(0)
    }
}

impl Platform for StubPlatform {
    fn window_region(&self, title: &str) -> Option<Region> {
        let windows = self.windows.lock().ok()?;
        windows.iter().find(|(t, _)| t.contains(title)).map(|(_, r)| *r)
    }

    fn capture(&self, _region: Option<Region>) -> Option<RgbaImage> {
        None
    }

    fn find_template(&self, template: &Template, _confidence: f64, _region: Option<Region>) -> Option<MatchBox> {
        let name = template.name();
        if let Ok(mut l) = self.lookups.lock() {
            *l.entry(name.clone()).or_default() += 1;
        }
        if let Some(next) = self.queued.lock().ok()?.get_mut(&name).and_then(|q| q.pop_front()) {
            return next;
        }
        self.steady.lock().ok()?.get(&name).copied().flatten()
    }
}
