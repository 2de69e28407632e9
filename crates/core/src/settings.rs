use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlickError, Result};

pub const DEFAULT_PROFILE: &str = "default";

/// App-level settings, independent of the active profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub adb_path: Option<String>,
    /// Root of the template folders (`*.png`, `e/`, `a/`..`d/`).
    pub assets_dir: PathBuf,
    /// Serial -> display name. The display name doubles as the mirror window title.
    pub device_names: HashMap<String, String>,
    pub last_profile: Option<String>,
    pub suppress_console: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adb_path: None,
            assets_dir: PathBuf::from("assets"),
            device_names: HashMap::new(),
            last_profile: None,
            suppress_console: true,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn display_name(&self, serial: &str) -> String {
        self.device_names
            .get(serial)
            .cloned()
            .unwrap_or_else(|| serial.to_string())
    }

    pub fn gate_dir(&self) -> PathBuf {
        self.assets_dir.join("e")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwiperParams {
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
    pub duration_min: u32,
    pub duration_max: u32,
    pub jitter: u32,
    pub steps_min: u32,
    pub steps_max: u32,
    /// Percent of the screen dimension.
    pub coord_offset: f64,
    pub interval_min: f64,
    pub interval_max: f64,
    pub detection_enabled: bool,
    pub p1_start_condition_enabled: bool,
}

impl Default for SwiperParams {
    fn default() -> Self {
        Self {
            start_x: 0.5,
            start_y: 0.85,
            end_x: 0.5,
            end_y: 0.45,
            duration_min: 400,
            duration_max: 500,
            jitter: 2,
            steps_min: 25,
            steps_max: 35,
            coord_offset: 1.0,
            interval_min: 4.0,
            interval_max: 10.0,
            detection_enabled: false,
            p1_start_condition_enabled: false,
        }
    }
}

impl SwiperParams {
    /// Clamp fractions, order every min/max pair and enforce the step floor.
    pub fn validate(mut self) -> Self {
        for v in [&mut self.start_x, &mut self.start_y, &mut self.end_x, &mut self.end_y] {
            *v = v.clamp(0.0, 1.0);
        }
        order(&mut self.duration_min, &mut self.duration_max);
        self.duration_min = self.duration_min.max(1);
        self.duration_max = self.duration_max.max(1);
        self.jitter = self.jitter.min(100);
        self.steps_min = self.steps_min.max(5);
        self.steps_max = self.steps_max.max(5);
        order(&mut self.steps_min, &mut self.steps_max);
        self.coord_offset = self.coord_offset.clamp(0.0, 100.0);
        self.interval_min = self.interval_min.max(0.0);
        self.interval_max = self.interval_max.max(0.0);
        order(&mut self.interval_min, &mut self.interval_max);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HunterParams {
    pub min_s: f64,
    pub max_s: f64,
    pub conf: f64,
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Default for HunterParams {
    fn default() -> Self {
        Self {
            min_s: 5.0,
            max_s: 10.0,
            conf: 0.8,
            x_min: 0.3,
            x_max: 0.7,
            y_min: 0.3,
            y_max: 0.7,
        }
    }
}

impl HunterParams {
    pub fn validate(mut self) -> Self {
        self.min_s = self.min_s.max(0.0);
        self.max_s = self.max_s.max(0.0);
        order(&mut self.min_s, &mut self.max_s);
        self.conf = self.conf.clamp(0.1, 1.0);
        for v in [&mut self.x_min, &mut self.x_max, &mut self.y_min, &mut self.y_max] {
            *v = v.clamp(0.0, 1.0);
        }
        order(&mut self.x_min, &mut self.x_max);
        order(&mut self.y_min, &mut self.y_max);
        self
    }
}

fn order<T: PartialOrd>(a: &mut T, b: &mut T) {
    if *a > *b {
        std::mem::swap(a, b);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub swiper: SwiperParams,
    #[serde(default)]
    pub hunter: HunterParams,
}

/// Named profiles persisted as one JSON object.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
    profiles: BTreeMap<String, Profile>,
}

impl ProfileStore {
    /// Unreadable or malformed files fall back to a store holding only the default profile.
    pub fn load(path: &Path) -> Self {
        let profiles = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str::<BTreeMap<String, Profile>>(&s).ok())
            .unwrap_or_default();
        let mut store = Self { path: path.to_path_buf(), profiles };
        store.ensure_default();
        store
    }

    fn ensure_default(&mut self) {
        self.profiles.entry(DEFAULT_PROFILE.to_string()).or_default();
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.profiles)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn upsert(&mut self, name: &str, profile: Profile) {
        self.profiles.insert(name.to_string(), profile);
    }

    /// Copy `from` under a new name. Fails if `to` exists or `from` does not.
    pub fn duplicate(&mut self, from: &str, to: &str) -> Result<()> {
        if to.trim().is_empty() || self.profiles.contains_key(to) {
            return Err(FlickError::Profile(format!("profile '{to}' already exists")));
        }
        let src = self
            .profiles
            .get(from)
            .cloned()
            .ok_or_else(|| FlickError::Profile(format!("unknown profile '{from}'")))?;
        self.profiles.insert(to.to_string(), src);
        Ok(())
    }

    /// The default profile can never be removed.
    pub fn remove(&mut self, name: &str) -> bool {
        if name == DEFAULT_PROFILE {
            return false;
        }
        self.profiles.remove(name).is_some()
    }

    /// Replace every profile with the contents of another file. Each entry
    /// must carry both a `swiper` and a `hunter` section.
    pub fn import(&mut self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let raw: serde_json::Value = serde_json::from_str(&text)?;
        let obj = raw
            .as_object()
            .ok_or_else(|| FlickError::Profile("top level must be an object".into()))?;
        for (name, v) in obj {
            if v.get("swiper").is_none() || v.get("hunter").is_none() {
                return Err(FlickError::Profile(format!(
                    "profile '{name}' needs both swiper and hunter sections"
                )));
            }
        }
        let profiles: BTreeMap<String, Profile> = serde_json::from_value(raw)?;
        let count = profiles.len();
        self.profiles = profiles;
        self.ensure_default();
        Ok(count)
    }
}
