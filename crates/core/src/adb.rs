use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use regex::Regex;
use wait_timeout::ChildExt;

use crate::error::{FlickError, Result};
use crate::logger;
use crate::sleep;

/// Exit code reported when a one-shot command overruns its timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported when the adb binary could not be spawned.
pub const EXIT_SPAWN_FAILED: i32 = 127;

const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const WIFI_PORT: u16 = 5555;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self { stdout: stdout.to_string(), stderr: String::new(), code: 0 }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self { stdout: String::new(), stderr: stderr.to_string(), code }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.code == EXIT_TIMEOUT
    }
}

/// A live `adb shell` that accepts one command per line.
pub trait EventStream: Send {
    /// Write one line and flush it before returning.
    fn send_line(&mut self, line: &str) -> Result<()>;
    /// Close stdin and wait (bounded) for the remote shell to exit.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Request/response commands plus long-lived shell sessions against adb.
pub trait Transport: Send + Sync {
    /// Run `adb <args>`. Never fails: timeouts and spawn errors come back as
    /// sentinel exit codes.
    fn run(&self, args: &[String], timeout: Option<Duration>) -> CommandOutput;
    fn open_stream(&self, serial: &str) -> Result<Box<dyn EventStream>>;
}

pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn device_args(serial: &str, rest: &[&str]) -> Vec<String> {
    let mut v = vec!["-s".to_string(), serial.to_string()];
    v.extend(rest.iter().map(|s| s.to_string()));
    v
}

pub struct AdbTransport {
    adb: PathBuf,
    suppress_console: bool,
}

impl AdbTransport {
    pub fn new(adb: impl Into<PathBuf>, suppress_console: bool) -> Self {
        logger::register_prefix("adb", logger::COLOR_GRAY);
        Self { adb: adb.into(), suppress_console }
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.adb);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            if self.suppress_console {
                cmd.creation_flags(CREATE_NO_WINDOW);
            }
        }
        #[cfg(not(windows))]
        let _ = self.suppress_console;
        cmd
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            p.read_to_end(&mut buf).ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl Transport for AdbTransport {
    fn run(&self, args: &[String], timeout: Option<Duration>) -> CommandOutput {
        let spawned = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                logger::error_p("adb", &format!("failed to spawn {}: {}", self.adb.display(), e));
                return CommandOutput::failed(EXIT_SPAWN_FAILED, &e.to_string());
            }
        };

        let out = drain(child.stdout.take());
        let err = drain(child.stderr.take());

        let status = match timeout {
            Some(t) => match child.wait_timeout(t) {
                Ok(Some(status)) => Some(status),
                Ok(None) | Err(_) => {
                    child.kill().ok();
                    child.wait().ok();
                    None
                }
            },
            None => child.wait().ok(),
        };

        let stdout = out.join().unwrap_or_default();
        let stderr = err.join().unwrap_or_default();
        match status {
            Some(s) => CommandOutput { stdout, stderr, code: s.code().unwrap_or(-1) },
            None => {
                logger::warn_p("adb", &format!("timed out: adb {}", args.join(" ")));
                CommandOutput { stdout, stderr: "Timeout".to_string(), code: EXIT_TIMEOUT }
            }
        }
    }

    fn open_stream(&self, serial: &str) -> Result<Box<dyn EventStream>> {
        let mut child = self
            .command()
            .args(["-s", serial, "shell"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FlickError::transport("shell", e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FlickError::transport("shell", "stdin unavailable"))?;
        Ok(Box::new(ShellStream { child, stdin: Some(stdin) }))
    }
}

struct ShellStream {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl EventStream for ShellStream {
    fn send_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| FlickError::transport("motionevent", "session already closed"))?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush())
            .map_err(|e| FlickError::transport("motionevent", e))
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        match self.child.wait_timeout(STREAM_CLOSE_TIMEOUT) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                self.child.kill().ok();
                self.child.wait().ok();
                Err(FlickError::transport("motionevent", "shell did not exit in time"))
            }
            Err(e) => Err(FlickError::transport("motionevent", e)),
        }
    }
}

impl Drop for ShellStream {
    fn drop(&mut self) {
        // Abandoned mid-gesture.
        if self.stdin.take().is_some() {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

/// Locate an adb binary: explicit override, then PATH, then well-known SDK dirs.
pub fn find_adb(override_path: Option<&str>) -> PathBuf {
    if let Some(p) = override_path.map(PathBuf::from).filter(|p| p.is_file()) {
        return p;
    }
    let exe = if cfg!(windows) { "adb.exe" } else { "adb" };
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(exe);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    let mut known: Vec<PathBuf> = vec![
        PathBuf::from(r"C:\Program Files (x86)\Android\android-sdk\platform-tools\adb.exe"),
        PathBuf::from(r"C:\Program Files\Android\android-sdk\platform-tools\adb.exe"),
        PathBuf::from("/usr/local/bin/adb"),
        PathBuf::from("/opt/homebrew/bin/adb"),
    ];
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        let home = PathBuf::from(home);
        known.push(home.join("Android/Sdk/platform-tools").join(exe));
        known.push(home.join("Library/Android/sdk/platform-tools").join(exe));
    }
    known.into_iter().find(|p| p.is_file()).unwrap_or_else(|| PathBuf::from(exe))
}

/// Serials from `adb devices` output that are in the `device` state.
pub fn parse_devices(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let serial = cols.next()?;
            (cols.next()? == "device").then(|| serial.to_string())
        })
        .collect()
}

pub fn list_devices(transport: &dyn Transport) -> Vec<String> {
    let out = transport.run(&args(&["devices"]), Some(Duration::from_secs(5)));
    if !out.success() {
        logger::warn_p("adb", &format!("device listing failed: {}", out.stderr.trim()));
        return Vec::new();
    }
    parse_devices(&out.stdout)
}

/// Serials of the form `ip:port` are adb-over-TCP connections.
pub fn is_network_serial(serial: &str) -> bool {
    serial.contains(':')
}

pub fn parse_wlan_ip(stdout: &str) -> Option<String> {
    let re = Regex::new(r"inet (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").ok()?;
    re.captures(stdout).map(|c| c[1].to_string())
}

/// Switch a USB-attached device to adb-over-TCP and connect to it.
/// Returns the new `ip:port` serial.
pub fn wifi_connect(transport: &dyn Transport, serial: &str) -> Result<String> {
    if is_network_serial(serial) {
        return Err(FlickError::transport("tcpip", "device is already a network connection"));
    }
    logger::info_p("adb", &format!("enabling TCP/IP mode on {}", serial));
    let port = WIFI_PORT.to_string();
    let out = transport.run(&device_args(serial, &["tcpip", &port]), Some(Duration::from_secs(5)));
    if !out.stdout.contains("restarting in TCP mode") {
        return Err(FlickError::transport("tcpip", out.stderr.trim()));
    }

    let mut ip = None;
    for attempt in 1..=10 {
        let out = transport.run(
            &device_args(serial, &["shell", "ip", "addr", "show", "wlan0"]),
            Some(Duration::from_secs(2)),
        );
        if let Some(found) = parse_wlan_ip(&out.stdout) {
            logger::info_p("adb", &format!("device ip {} (attempt {})", found, attempt));
            ip = Some(found);
            break;
        }
        sleep::sleep_ms(500);
    }
    let ip = ip.ok_or_else(|| FlickError::transport("ip addr", "no wlan0 address; is Wi-Fi on?"))?;

    let target = format!("{}:{}", ip, WIFI_PORT);
    let out = transport.run(&args(&["connect", &target]), Some(Duration::from_secs(5)));
    if out.stdout.contains("connected to") || out.stdout.contains("already connected") {
        logger::info_p("adb", &format!("connected over Wi-Fi: {}", target));
        Ok(target)
    } else {
        Err(FlickError::transport("connect", out.stdout.trim()))
    }
}

pub fn kill_server(transport: &dyn Transport) -> bool {
    let out = transport.run(&args(&["kill-server"]), Some(Duration::from_secs(5)));
    if out.success() {
        logger::info_p("adb", "adb server killed");
    } else {
        logger::warn_p("adb", &format!("kill-server failed: {}", out.stderr.trim()));
    }
    out.success()
}

/// In-memory transport that records everything sent to it.
pub mod testing {
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::{Duration, Instant};

    use super::{CommandOutput, EventStream, Transport};
    use crate::error::{FlickError, Result};

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[derive(Debug, Clone)]
    pub struct StreamedLine {
        pub at: Instant,
        pub line: String,
    }

    #[derive(Default)]
    struct Recorded {
        commands: Vec<Vec<String>>,
        streams: Vec<Vec<StreamedLine>>,
    }

    /// Responses are picked by the first registered needle contained in the
    /// space-joined argument list; anything else answers with empty success.
    #[derive(Clone, Default)]
    pub struct RecordingTransport {
        responses: Arc<Mutex<Vec<(String, CommandOutput)>>>,
        recorded: Arc<Mutex<Recorded>>,
        fail_streams: bool,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_streams() -> Self {
            Self { fail_streams: true, ..Self::default() }
        }

        pub fn respond(&self, needle: &str, out: CommandOutput) {
            lock(&self.responses).push((needle.to_string(), out));
        }

        pub fn commands(&self) -> Vec<Vec<String>> {
            lock(&self.recorded).commands.clone()
        }

        pub fn streams(&self) -> Vec<Vec<StreamedLine>> {
            lock(&self.recorded).streams.clone()
        }
    }

    impl Transport for RecordingTransport {
        fn run(&self, args: &[String], _timeout: Option<Duration>) -> CommandOutput {
            lock(&self.recorded).commands.push(args.to_vec());
            let joined = args.join(" ");
            lock(&self.responses)
                .iter()
                .find(|(needle, _)| joined.contains(needle.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or_default()
        }

        fn open_stream(&self, _serial: &str) -> Result<Box<dyn EventStream>> {
            if self.fail_streams {
                return Err(FlickError::transport("shell", "scripted failure"));
            }
            let index = {
                let mut rec = lock(&self.recorded);
                rec.streams.push(Vec::new());
                rec.streams.len() - 1
            };
            Ok(Box::new(RecordingStream { recorded: Arc::clone(&self.recorded), index }))
        }
    }

    struct RecordingStream {
        recorded: Arc<Mutex<Recorded>>,
        index: usize,
    }

    impl EventStream for RecordingStream {
        fn send_line(&mut self, line: &str) -> Result<()> {
            let mut rec = lock(&self.recorded);
            rec.streams[self.index].push(StreamedLine { at: Instant::now(), line: line.to_string() });
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }
}
