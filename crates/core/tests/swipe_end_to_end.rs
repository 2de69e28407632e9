use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flick_core::adb::testing::{RecordingTransport, StreamedLine};
use flick_core::adb::CommandOutput;
use flick_core::device::DeviceHandle;
use flick_core::events::EventBus;
use flick_core::gesture::{self, SwipeShape};
use flick_core::platform::stub::StubPlatform;
use flick_core::scheduler::{Scheduler, SchedulerConfig};
use flick_core::settings::SwiperParams;
use flick_core::types::Event;

fn phone() -> (RecordingTransport, Arc<DeviceHandle>) {
    let transport = RecordingTransport::new();
    transport.respond("wm size", CommandOutput::ok("Physical size: 1080x2400\n"));
    let device = Arc::new(DeviceHandle::new(Arc::new(transport.clone())));
    device.select("emulator-5554", "Phone");
    (transport, device)
}

fn coords(line: &str) -> (&str, i32, i32) {
    let parts: Vec<&str> = line.split_whitespace().collect();
    assert_eq!(&parts[..3], &["input", "touchscreen", "motionevent"]);
    (parts[3], parts[4].parse().unwrap(), parts[5].parse().unwrap())
}

fn check_session(lines: &[StreamedLine]) -> usize {
    assert_eq!(coords(&lines[0].line).0, "DOWN");
    assert_eq!(coords(&lines[lines.len() - 1].line).0, "UP");
    let moves = &lines[1..lines.len() - 1];
    assert!(moves.iter().all(|l| coords(&l.line).0 == "MOVE"));
    assert!(lines.windows(2).all(|w| w[0].at <= w[1].at));
    // UP is sent where the last MOVE went.
    let last = coords(&moves[moves.len() - 1].line);
    let up = coords(&lines[lines.len() - 1].line);
    assert_eq!((last.1, last.2), (up.1, up.2));
    moves.len()
}

#[test]
fn flick_from_85_to_45_percent() {
    let (transport, device) = phone();
    let shape = SwipeShape { duration_ms: 450, jitter: 2, steps_min: 25, steps_max: 35 };
    let report = gesture::swipe_pct(&device, (0.5, 0.85), (0.5, 0.45), &shape).unwrap();

    let streams = transport.streams();
    assert_eq!(streams.len(), 1);
    let lines = &streams[0];
    assert_eq!(lines[0].line, "input touchscreen motionevent DOWN 540 2040");

    let moves = check_session(lines);
    assert!((24..=35).contains(&moves), "{} moves", moves);
    assert_eq!(moves, report.segments);
    assert!((415..=485).contains(&report.duration_ms), "{}ms", report.duration_ms);
    assert_eq!(coords(&lines[lines.len() - 1].line), ("UP", 540, 1080));

    let elapsed = lines[lines.len() - 1].at - lines[1].at;
    assert!(elapsed >= Duration::from_millis(report.duration_ms));
    assert!(elapsed < Duration::from_millis(report.duration_ms + 1000));
}

#[test]
fn swipe_without_device_touches_nothing() {
    let transport = RecordingTransport::new();
    let device = DeviceHandle::new(Arc::new(transport.clone()));
    let shape = SwipeShape { duration_ms: 450, jitter: 2, steps_min: 25, steps_max: 35 };
    assert!(gesture::swipe_pct(&device, (0.5, 0.85), (0.5, 0.45), &shape).is_err());
    assert!(transport.commands().is_empty());
    assert!(transport.streams().is_empty());
}

#[test]
fn scheduler_runs_jittered_swipes_then_stops_cleanly() {
    let (transport, device) = phone();
    let bus = Arc::new(EventBus::new());
    let rx = bus.subscribe();
    let mut cfg = SchedulerConfig::new("assets/e");
    cfg.tick = Duration::from_millis(30);
    let sched = Scheduler::new(
        device,
        Arc::new(StubPlatform::new()),
        bus,
        Arc::new(AtomicBool::new(false)),
        cfg,
    );
    let params = SwiperParams {
        duration_min: 120,
        duration_max: 150,
        interval_min: 1.0,
        interval_max: 1.5,
        ..SwiperParams::default()
    };
    sched.start(params, "Phone").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while sched.swipes() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    sched.stop();
    sched.stop();
    assert!(sched.swipes() >= 3);
    // a gesture already on the wire plays out after stop
    thread::sleep(Duration::from_millis(400));

    for lines in transport.streams().iter().filter(|s| !s.is_empty()) {
        let (_, x, y) = coords(&lines[0].line);
        // coord_offset 1% of 1080x2400
        assert!((528..=552).contains(&x), "x {x}");
        assert!((2015..=2065).contains(&y), "y {y}");
        check_session(lines);
    }

    let events: Vec<Event> = rx.try_iter().collect();
    assert_eq!(events[0], Event::SwiperStarted);
    let finished = events.iter().filter(|e| matches!(e, Event::SwipeFinished(_))).count();
    let stopped: Vec<_> = events.iter().filter(|e| matches!(e, Event::SwiperStopped { .. })).collect();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0], &Event::SwiperStopped { swipes: finished as u64 });
}
