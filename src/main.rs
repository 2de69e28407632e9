use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use flick_core::adb::{self, AdbTransport};
use flick_core::controller::Controller;
use flick_core::logger;
use flick_core::platform::create_platform;
use flick_core::settings::{ProfileStore, Settings};
use flick_core::types::{Command, Event};

const HELP: &str = "commands: refresh | device <serial> | profile <name> | swipe start|stop \
                    | hunt start|stop | detect on|off | wifi | kill | q";

fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let head = words.next()?;
    let arg = words.next();
    let cmd = match (head, arg) {
        ("q" | "quit", _) => Command::Quit,
        ("r" | "refresh", _) => Command::RefreshDevices,
        ("device", Some(serial)) => Command::SwitchDevice(serial.to_string()),
        ("profile", Some(name)) => Command::SelectProfile(name.to_string()),
        ("swipe", Some("start")) => Command::StartSwiper,
        ("swipe", Some("stop")) => Command::StopSwiper,
        ("hunt", Some("start")) => Command::StartHunter,
        ("hunt", Some("stop")) => Command::StopHunter,
        ("detect", Some("on")) => Command::Detection(true),
        ("detect", Some("off")) => Command::Detection(false),
        ("wifi", _) => Command::WifiConnect,
        ("kill", _) => Command::KillServer,
        _ => return None,
    };
    Some(cmd)
}

fn print_log_line(line: &str) {
    if let Some((level, prefix, ts, msg)) = logger::parse_ui_line(line) {
        if prefix.is_empty() {
            println!("{} {:<5} {}", ts, level, msg);
        } else {
            println!("{} {:<5} [{}] {}", ts, level, prefix, msg);
        }
    }
}

fn print_event(event: &Event) {
    match event {
        Event::Countdown(Some(n)) => println!("next swipe in {}s", n),
        Event::SwiperStatus(s) => println!("swiper: {}", s),
        Event::Detection(found) => println!("detector: {}", if *found { "target visible" } else { "target gone" }),
        _ => {}
    }
}

fn main() -> Result<()> {
    let force_stub = std::env::args().any(|a| a == "--stub");
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    logger::init(&cwd.join("logs")).context("cannot open log file")?;
    let (log_tx, log_rx) = mpsc::channel::<String>();
    logger::set_ui_sender(log_tx);

    let settings_path = cwd.join("settings.json");
    let settings = Settings::load(&settings_path);
    let profiles = ProfileStore::load(&cwd.join("profiles.json"));

    let adb_path = adb::find_adb(settings.adb_path.as_deref());
    logger::info(&format!("using adb at {}", adb_path.display()));
    let transport = Arc::new(AdbTransport::new(adb_path, settings.suppress_console));
    let platform = create_platform(force_stub);

    let controller = Controller::new(transport, platform, settings, settings_path, profiles);
    let events = controller.subscribe();
    controller.refresh_devices();
    logger::info(&format!("profile '{}'", controller.active_profile_name()));

    // stdin on its own thread so log output keeps flowing
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
    thread::spawn(move || {
        println!("{}", HELP);
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Some(cmd) => {
                    if cmd_tx.send(cmd).is_err() {
                        return;
                    }
                }
                None => println!("{}", HELP),
            }
        }
        // EOF
        cmd_tx.send(Command::Quit).ok();
    });

    loop {
        log_rx.try_iter().for_each(|l| print_log_line(&l));
        events.try_iter().for_each(|e| print_event(&e));
        match cmd_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(cmd) => {
                if !controller.handle(cmd) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                controller.shutdown();
                break;
            }
        }
    }
    log_rx.try_iter().for_each(|l| print_log_line(&l));
    Ok(())
}
