//! Humanised swipe trajectories.
//!
//! A swipe is a cubic Bézier between the two endpoints whose control points
//! wander off the straight line, sampled through an easing curve that is
//! still moving at t = 1 so the finger appears to leave the glass mid-flick.

use std::time::Duration;

use rand::Rng;

use crate::adb::EventStream;
use crate::device::DeviceHandle;
use crate::error::Result;
use crate::logger;
use crate::sleep;
use crate::types::SwipeReport;

type Point = (f64, f64);

/// Pause between DOWN and the first MOVE. Long enough to register, short
/// enough not to turn into a long-press.
const TOUCH_DOWN_PAUSE_MS: (u64, u64) = (5, 40);

/// `f(t) = t + 0.5·t·(1−t)`: f(0)=0, f(1)=1, f'(1)=0.5.
pub fn ease_flick(t: f64) -> f64 {
    t + 0.5 * t * (1.0 - t)
}

pub fn cubic_bezier(p0: Point, p1: Point, p2: Point, p3: Point, t: f64) -> Point {
    let u = 1.0 - t;
    let (a, b, c, d) = (u * u * u, 3.0 * u * u * t, 3.0 * u * t * t, t * t * t);
    (
        a * p0.0 + b * p1.0 + c * p2.0 + d * p3.0,
        a * p0.1 + b * p1.1 + c * p2.1 + d * p3.1,
    )
}

/// Pixel points plus the pause after each one. `durations.len() == points.len() - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub points: Vec<(i32, i32)>,
    pub durations: Vec<u64>,
}

impl Trajectory {
    pub fn total_ms(&self) -> u64 {
        self.durations.iter().sum()
    }

    pub fn segments(&self) -> usize {
        self.durations.len()
    }
}

/// Shape parameters for one swipe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwipeShape {
    pub duration_ms: u64,
    pub jitter: u32,
    pub steps_min: u32,
    pub steps_max: u32,
}

/// Place the two control points. X wobble is symmetric; Y is pushed along
/// the direction of travel, p1 mostly ahead and p2 mostly behind, which
/// reads as overshoot-then-settle.
fn control_points<R: Rng + ?Sized>(rng: &mut R, p0: Point, p3: Point, jitter: u32) -> (Point, Point) {
    let mid = ((p0.0 + p3.0) / 2.0, (p0.1 + p3.1) / 2.0);
    let scale = 60.0 + f64::from(jitter) * 10.0;
    let dir = if p3.1 >= p0.1 { 1.0 } else { -1.0 };
    let y_scale = 0.5 * scale;

    let p1 = (
        (p0.0 + mid.0) / 2.0 + rng.gen_range(-scale..=scale),
        (p0.1 + mid.1) / 2.0 + dir * rng.gen_range(-0.25..=1.0) * y_scale,
    );
    let p2 = (
        (mid.0 + p3.0) / 2.0 + rng.gen_range(-scale..=scale),
        (mid.1 + p3.1) / 2.0 + dir * rng.gen_range(-1.0..=0.25) * y_scale,
    );
    (p1, p2)
}

/// Build the trajectory between two pixel endpoints.
pub fn synthesize<R: Rng + ?Sized>(rng: &mut R, p0: (i32, i32), p3: (i32, i32), shape: &SwipeShape) -> Trajectory {
    let (lo, hi) = if shape.steps_min <= shape.steps_max {
        (shape.steps_min, shape.steps_max)
    } else {
        (shape.steps_max, shape.steps_min)
    };
    let steps = rng.gen_range(lo.max(1)..=hi.max(1));
    let total = shape.duration_ms as f64;

    let a = (f64::from(p0.0), f64::from(p0.1));
    let d = (f64::from(p3.0), f64::from(p3.1));
    let (b, c) = control_points(rng, a, d, shape.jitter);

    let mut points = vec![p0];
    let mut durations: Vec<u64> = Vec::with_capacity(steps as usize);
    let mut pending = 0u64;
    let mut last_eased = 0.0;

    for i in 1..=steps {
        let eased = ease_flick(f64::from(i) / f64::from(steps));
        let dur = (((eased - last_eased) * total).round() as u64).max(1);
        last_eased = eased;

        let pt = if i == steps { d } else { cubic_bezier(a, b, c, d, eased) };
        let px = (pt.0.round() as i32, pt.1.round() as i32);

        // A repeated pixel would be a zero-motion MOVE; fold its time forward.
        if points.last() == Some(&px) {
            pending += dur;
            continue;
        }
        durations.push(pending + dur);
        pending = 0;
        points.push(px);
    }

    if points.len() == 1 {
        points.push(p3);
        durations.push(shape.duration_ms.max(1));
    } else if let Some(last) = durations.last_mut() {
        *last += pending;
    }

    Trajectory { points, durations }
}

/// Stream the trajectory as raw motion events and close the session.
pub fn play<R: Rng + ?Sized>(rng: &mut R, mut stream: Box<dyn EventStream>, traj: &Trajectory) -> Result<()> {
    let Some(&(x0, y0)) = traj.points.first() else {
        return stream.finish();
    };
    stream.send_line(&format!("input touchscreen motionevent DOWN {} {}", x0, y0))?;
    sleep::sleep_ms(rng.gen_range(TOUCH_DOWN_PAUSE_MS.0..=TOUCH_DOWN_PAUSE_MS.1));

    let (mut x, mut y) = (x0, y0);
    for (&(px, py), &dur) in traj.points[1..].iter().zip(&traj.durations) {
        stream.send_line(&format!("input touchscreen motionevent MOVE {} {}", px, py))?;
        std::thread::sleep(Duration::from_millis(dur));
        (x, y) = (px, py);
    }
    stream.send_line(&format!("input touchscreen motionevent UP {} {}", x, y))?;
    stream.finish()
}

/// Swipe between two points given as fractions of the screen.
pub fn swipe_pct(device: &DeviceHandle, start: (f64, f64), end: (f64, f64), shape: &SwipeShape) -> Result<SwipeReport> {
    // Fails with NoDevice before any I/O.
    device.serial()?;
    let size = device.size()?;
    let p0 = pct_to_px(start, size);
    let p3 = pct_to_px(end, size);

    let mut rng = rand::thread_rng();
    let traj = synthesize(&mut rng, p0, p3, shape);
    let report = SwipeReport { segments: traj.segments(), duration_ms: traj.total_ms() };

    let stream = device.open_stream()?;
    play(&mut rng, stream, &traj)?;
    logger::info_p(
        "swiper",
        &format!("swipe {:?} -> {:?}, {} segments, {}ms", p0, p3, report.segments, report.duration_ms),
    );
    Ok(report)
}

/// Fractions are clamped to [0,1] and truncated to whole pixels.
pub fn pct_to_px(pct: (f64, f64), size: (u32, u32)) -> (i32, i32) {
    (
        (pct.0.clamp(0.0, 1.0) * f64::from(size.0)) as i32,
        (pct.1.clamp(0.0, 1.0) * f64::from(size.1)) as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn shape(duration_ms: u64, steps_min: u32, steps_max: u32) -> SwipeShape {
        SwipeShape { duration_ms, jitter: 2, steps_min, steps_max }
    }

    #[test]
    fn test_ease_flick_endpoints_and_slope() {
        assert_eq!(ease_flick(0.0), 0.0);
        assert_eq!(ease_flick(1.0), 1.0);
        let h = 1e-6;
        let slope_end = (ease_flick(1.0) - ease_flick(1.0 - h)) / h;
        assert!((slope_end - 0.5).abs() < 1e-4);
        let mut prev = 0.0;
        for i in 1..=100 {
            let v = ease_flick(i as f64 / 100.0);
            assert!(v > prev);
            prev = v;
        }
    }

    #[test]
    fn test_bezier_hits_endpoints() {
        let (a, b, c, d) = ((0.0, 0.0), (10.0, 50.0), (90.0, -20.0), (100.0, 100.0));
        assert_eq!(cubic_bezier(a, b, c, d, 0.0), a);
        assert_eq!(cubic_bezier(a, b, c, d, 1.0), d);
    }

    #[test]
    fn test_trajectory_invariants_hold_across_seeds() {
        for seed in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let steps_min = 5 + (seed % 10) as u32;
            let steps_max = steps_min + (seed % 25) as u32;
            let s = shape(200 + seed * 3, steps_min, steps_max);
            let t = synthesize(&mut rng, (540, 2040), (540, 1080), &s);

            assert!(t.points.len() >= 2 && t.points.len() <= steps_max as usize + 1);
            assert_eq!(t.durations.len(), t.points.len() - 1);
            assert!(t.durations.iter().all(|&d| d >= 1));
            let drift = (t.total_ms() as i64 - s.duration_ms as i64).unsigned_abs();
            assert!(drift <= steps_max as u64, "seed {seed}: drift {drift}");
            assert!(t.points.windows(2).all(|w| w[0] != w[1]));
            assert_eq!(t.points[0], (540, 2040));
            assert_eq!(*t.points.last().unwrap(), (540, 1080));
        }
    }

    #[test]
    fn test_short_swipe_suppresses_duplicates() {
        let mut rng = StdRng::seed_from_u64(7);
        let s = SwipeShape { duration_ms: 300, jitter: 0, steps_min: 40, steps_max: 40 };
        // 40 samples over a short curve: rounding repeats pixels.
        let t = synthesize(&mut rng, (100, 100), (100, 103), &s);
        assert!(t.points.windows(2).all(|w| w[0] != w[1]));
        assert_eq!(t.durations.len(), t.points.len() - 1);
        assert!((t.total_ms() as i64 - 300).abs() <= 40);
    }

    #[test]
    fn test_degenerate_swipe_keeps_both_endpoints() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = SwipeShape { duration_ms: 120, jitter: 0, steps_min: 5, steps_max: 5 };
        // Zero-length swipe: only the curve's wobble moves, which can still
        // return to the start. Either way the endpoints are intact.
        let t = synthesize(&mut rng, (10, 10), (10, 10), &s);
        assert_eq!(t.points[0], (10, 10));
        assert_eq!(*t.points.last().unwrap(), (10, 10));
        assert_eq!(t.durations.len(), t.points.len() - 1);
    }

    #[test]
    fn test_touch_down_pause_before_first_move() {
        use crate::adb::Transport;
        let transport = crate::adb::testing::RecordingTransport::new();
        let traj = Trajectory { points: vec![(0, 0), (5, 5)], durations: vec![1] };
        let mut rng = StdRng::seed_from_u64(21);
        for _ in 0..10 {
            let stream = transport.open_stream("s").unwrap();
            play(&mut rng, stream, &traj).unwrap();
        }
        for lines in transport.streams() {
            let gap = lines[1].at - lines[0].at;
            assert!(gap >= Duration::from_millis(TOUCH_DOWN_PAUSE_MS.0), "{gap:?}");
            assert!(gap < Duration::from_millis(TOUCH_DOWN_PAUSE_MS.1 + 100), "{gap:?}");
        }
    }

    #[test]
    fn test_pct_to_px_clamps() {
        assert_eq!(pct_to_px((0.5, 0.85), (1080, 2400)), (540, 2040));
        assert_eq!(pct_to_px((-0.2, 1.7), (1080, 2400)), (0, 2400));
    }
}
