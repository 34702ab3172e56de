//! The periodic settings snapshotter.
//!
//! While a session is open a separate process dumps every snapshot key to the
//! volume on a fixed interval, so a crash of the foreground loses at most one
//! interval of settings changes. The process is found through a pid marker in
//! the runtime directory and controlled with signals:
//!
//! - `SIGTERM`/`SIGINT`: one final dump, then exit.
//! - `SIGHUP`: exit without dumping.
//! - `SIGUSR1`: dump now and keep running.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use std::{fmt, thread};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Layout;
use crate::settings::{SettingsBridge, SettingsKey};

const START_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SnapshotError {
	#[error("snapshotter already running with pid {pid}")]
	AlreadyRunning { pid: u32 },

	#[error("snapshot target {0} is not a directory")]
	NotADirectory(PathBuf),

	#[error("failed to spawn snapshotter: {0}")]
	Spawn(#[source] io::Error),

	#[error("snapshotter did not come up within {waited:?}; see {log}")]
	StartTimeout { waited: Duration, log: PathBuf },

	#[error("snapshotter {pid} did not stop within {waited:?}")]
	StopTimeout { pid: u32, waited: Duration },

	#[error("failed to signal snapshotter {pid}: {source}")]
	Signal {
		pid: u32,
		#[source]
		source: io::Error,
	},

	#[error("pid marker {path}: {source}")]
	Marker {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("snapshot loop failed: {0}")]
	Loop(String),
}

/// What the pid marker currently says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
	Absent,
	Live(u32),
	/// Present but naming a process that is gone, was replaced, or is not
	/// ours; or unparseable.
	Stale(Option<u32>),
}

/// The snapshotter's liveness marker.
///
/// Holds `<pid> <starttime>`, the start time being field 22 of
/// `/proc/<pid>/stat`. A recycled pid has a different start time, so the
/// marker never vouches for an unrelated process.
#[derive(Debug, Clone)]
pub struct PidMarker {
	path: PathBuf,
}

impl PidMarker {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn err(&self) -> impl FnOnce(io::Error) -> SnapshotError + '_ {
		move |source| SnapshotError::Marker {
			path: self.path.clone(),
			source,
		}
	}

	pub fn state(&self) -> Result<MarkerState, SnapshotError> {
		let content = match fs::read_to_string(&self.path) {
			Ok(content) => content,
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(MarkerState::Absent),
			Err(err) => return Err(self.err()(err)),
		};
		let mut fields = content.split_whitespace();
		let pid = fields.next().and_then(|f| f.parse::<u32>().ok());
		let start = fields.next().and_then(|f| f.parse::<u64>().ok());
		Ok(match (pid, start) {
			(Some(pid), Some(start)) if own_process_start(pid) == Some(start) => MarkerState::Live(pid),
			(pid, _) => MarkerState::Stale(pid),
		})
	}

	/// Records `pid` as the running snapshotter, replacing a stale marker.
	pub fn claim(&self, pid: u32) -> Result<(), SnapshotError> {
		let start = own_process_start(pid).ok_or_else(|| {
			self.err()(io::Error::new(
				io::ErrorKind::NotFound,
				format!("process {pid} is not a live process of this user"),
			))
		})?;
		for _ in 0..2 {
			match OpenOptions::new().write(true).create_new(true).open(&self.path) {
				Ok(mut file) => {
					file.write_all(format!("{pid} {start}\n").as_bytes()).map_err(self.err())?;
					debug!(target: "extvol.snapshot", pid, start, marker = %self.path.display(), "pid marker claimed");
					return Ok(());
				}
				Err(err) if err.kind() == io::ErrorKind::AlreadyExists => match self.state()? {
					MarkerState::Live(owner) if owner != pid => return Err(SnapshotError::AlreadyRunning { pid: owner }),
					MarkerState::Live(_) => return Ok(()),
					MarkerState::Stale(_) => {
						self.clear_stale()?;
					}
					MarkerState::Absent => {}
				},
				Err(err) => return Err(self.err()(err)),
			}
		}
		Err(self.err()(io::Error::new(io::ErrorKind::AlreadyExists, "marker keeps reappearing")))
	}

	/// Removes the marker if it names `pid`. Returns whether it did.
	pub fn release(&self, pid: u32) -> Result<bool, SnapshotError> {
		let content = match fs::read_to_string(&self.path) {
			Ok(content) => content,
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
			Err(err) => return Err(self.err()(err)),
		};
		let owner = content.split_whitespace().next().and_then(|f| f.parse::<u32>().ok());
		if owner != Some(pid) {
			warn!(target: "extvol.snapshot", pid, marker = %self.path.display(), "marker owned by another process");
			return Ok(false);
		}
		self.remove()?;
		Ok(true)
	}

	/// Removes the marker if it is stale. Returns whether it did.
	pub fn clear_stale(&self) -> Result<bool, SnapshotError> {
		match self.state()? {
			MarkerState::Stale(pid) => {
				warn!(target: "extvol.snapshot", pid = ?pid, marker = %self.path.display(), "clearing stale marker");
				self.remove()?;
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	/// Sends `signal` to the process the marker vouches for, re-reading the
	/// marker right before. Returns the pid if the signal was delivered.
	pub fn signal(&self, signal: libc::c_int) -> Result<Option<u32>, SnapshotError> {
		match self.state()? {
			MarkerState::Live(pid) => Ok(send_signal(pid, signal)?.then_some(pid)),
			_ => Ok(None),
		}
	}

	fn remove(&self) -> Result<(), SnapshotError> {
		match fs::remove_file(&self.path) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(self.err()(err)),
		}
	}
}

/// Start time of `pid` when it is a running, non-zombie process owned by the
/// current user.
pub fn own_process_start(pid: u32) -> Option<u64> {
	if pid == 0 {
		return None;
	}
	let proc_dir = PathBuf::from(format!("/proc/{pid}"));
	let owner = fs::metadata(&proc_dir).ok()?.uid();
	if owner != unsafe { libc::getuid() } {
		return None;
	}
	parse_stat(&fs::read_to_string(proc_dir.join("stat")).ok()?)
}

/// Start time from a `/proc/<pid>/stat` line, or `None` for dead and zombie
/// processes. The command name may itself contain `)` and spaces.
fn parse_stat(stat: &str) -> Option<u64> {
	let rest = &stat[stat.rfind(')')? + 1..];
	let mut fields = rest.split_whitespace();
	if matches!(fields.next()?, "Z" | "X" | "x") {
		return None;
	}
	// state is field 3, starttime field 22
	fields.nth(18)?.parse().ok()
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<bool, SnapshotError> {
	let raw = libc::pid_t::try_from(pid).map_err(|_| SnapshotError::Signal {
		pid,
		source: io::Error::from(io::ErrorKind::InvalidInput),
	})?;
	if unsafe { libc::kill(raw, signal) } == 0 {
		return Ok(true);
	}
	let err = io::Error::last_os_error();
	if err.raw_os_error() == Some(libc::ESRCH) {
		return Ok(false);
	}
	Err(SnapshotError::Signal { pid, source: err })
}

/// Input to the snapshot loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
	/// Dump now, keep running.
	Dump,
	/// Dump once more, then exit.
	Terminate,
	/// Exit without dumping.
	Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpReason {
	Periodic,
	OutOfBand,
	Final,
}

impl fmt::Display for DumpReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DumpReason::Periodic => write!(f, "periodic"),
			DumpReason::OutOfBand => write!(f, "out-of-band"),
			DumpReason::Final => write!(f, "final"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
	Terminated,
	Stopped,
	/// Every event sender went away.
	Disconnected,
}

/// Dumps immediately and then every `interval` until told to stop.
/// Out-of-band dumps do not shift the periodic schedule.
pub fn run_loop(events: &Receiver<Event>, interval: Duration, mut dump: impl FnMut(DumpReason)) -> LoopExit {
	dump(DumpReason::Periodic);
	let mut next = Instant::now() + interval;
	loop {
		match events.recv_timeout(next.saturating_duration_since(Instant::now())) {
			Err(RecvTimeoutError::Timeout) => {
				dump(DumpReason::Periodic);
				next += interval;
				let now = Instant::now();
				if next < now {
					next = now + interval;
				}
			}
			Ok(Event::Dump) => dump(DumpReason::OutOfBand),
			Ok(Event::Terminate) => {
				dump(DumpReason::Final);
				return LoopExit::Terminated;
			}
			Ok(Event::Stop) => return LoopExit::Stopped,
			Err(RecvTimeoutError::Disconnected) => return LoopExit::Disconnected,
		}
	}
}

struct Signals {
	terminate: tokio::signal::unix::Signal,
	interrupt: tokio::signal::unix::Signal,
	hangup: tokio::signal::unix::Signal,
	user1: tokio::signal::unix::Signal,
}

impl Signals {
	fn install() -> io::Result<Self> {
		use tokio::signal::unix::{SignalKind, signal};
		Ok(Self {
			terminate: signal(SignalKind::terminate())?,
			interrupt: signal(SignalKind::interrupt())?,
			hangup: signal(SignalKind::hangup())?,
			user1: signal(SignalKind::user_defined1())?,
		})
	}

	async fn forward(mut self, tx: Sender<Event>) {
		loop {
			let event = tokio::select! {
				_ = self.terminate.recv() => Event::Terminate,
				_ = self.interrupt.recv() => Event::Terminate,
				_ = self.hangup.recv() => Event::Stop,
				_ = self.user1.recv() => Event::Dump,
			};
			info!(target: "extvol.snapshot", event = ?event, "signal received");
			if tx.send(event).is_err() {
				break;
			}
		}
	}
}

/// Runs the snapshotter in this process until a signal ends it.
///
/// Claims `marker` for the current pid first and releases it on the way out.
pub async fn run_daemon(
	target: PathBuf,
	interval: Duration,
	marker: PidMarker,
	bridge: SettingsBridge,
	keys: &'static [SettingsKey],
) -> Result<LoopExit, SnapshotError> {
	if !target.is_dir() {
		return Err(SnapshotError::NotADirectory(target));
	}
	let signals = Signals::install().map_err(|err| SnapshotError::Loop(format!("signal setup: {err}")))?;
	let pid = std::process::id();
	marker.claim(pid)?;
	info!(target: "extvol.snapshot", pid, target_dir = %target.display(), interval_secs = interval.as_secs(), "snapshotter running");

	let (tx, rx) = mpsc::channel();
	let forwarder = tokio::spawn(signals.forward(tx));
	let looped = tokio::task::spawn_blocking(move || {
		run_loop(&rx, interval, |reason| {
			let failed = bridge.dump_all(&target, keys);
			info!(
				target: "extvol.snapshot",
				reason = %reason,
				keys = keys.len(),
				failed = failed.len(),
				"settings dumped"
			);
		})
	})
	.await;
	forwarder.abort();

	let released = marker.release(pid);
	let exit = looped.map_err(|err| SnapshotError::Loop(err.to_string()))?;
	released?;
	info!(target: "extvol.snapshot", pid, exit = ?exit, "snapshotter exited");
	Ok(exit)
}

/// Starting and stopping the background snapshotter.
pub trait SnapshotControl {
	/// Starts a snapshotter dumping into `target` and returns its pid.
	fn start(&self, target: &Path) -> Result<u32, SnapshotError>;
	/// Stops the running snapshotter. Returns whether one was running.
	fn stop(&self) -> Result<bool, SnapshotError>;
	/// Pid of the live snapshotter, if any.
	fn running(&self) -> Result<Option<u32>, SnapshotError>;
}

/// Runs the snapshotter as a detached child of `program`, which must accept
/// `[--config FILE] -v snapshot -r --foreground -t DIR`.
#[derive(Debug, Clone)]
pub struct DetachedSnapshotter {
	program: PathBuf,
	config_file: Option<PathBuf>,
	runtime_dir: PathBuf,
	log: PathBuf,
	marker: PidMarker,
	stop_timeout: Duration,
}

impl DetachedSnapshotter {
	pub fn new(program: impl Into<PathBuf>, layout: &Layout) -> Self {
		Self {
			program: program.into(),
			config_file: None,
			runtime_dir: layout.runtime_dir.clone(),
			log: layout.snapshot_log.clone(),
			marker: PidMarker::new(&layout.snapshot_pid),
			stop_timeout: Duration::from_millis(crate::config::DEFAULT_SNAPSHOT_STOP_TIMEOUT_MS),
		}
	}

	pub fn config_file(mut self, path: Option<PathBuf>) -> Self {
		self.config_file = path;
		self
	}

	pub fn stop_timeout(mut self, timeout: Duration) -> Self {
		self.stop_timeout = timeout;
		self
	}

	pub fn marker(&self) -> &PidMarker {
		&self.marker
	}

	/// Asks the running snapshotter for an immediate dump. Returns its pid if one was signalled.
	pub fn force_dump(&self) -> Result<Option<u32>, SnapshotError> {
		self.marker.signal(libc::SIGUSR1)
	}
}

impl SnapshotControl for DetachedSnapshotter {
	fn start(&self, target: &Path) -> Result<u32, SnapshotError> {
		match self.marker.state()? {
			MarkerState::Live(pid) => return Err(SnapshotError::AlreadyRunning { pid }),
			MarkerState::Stale(_) => {
				self.marker.clear_stale()?;
			}
			MarkerState::Absent => {}
		}

		DirBuilder::new()
			.recursive(true)
			.mode(0o700)
			.create(&self.runtime_dir)
			.map_err(SnapshotError::Spawn)?;
		let log = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.log)
			.map_err(SnapshotError::Spawn)?;

		let mut cmd = Command::new(&self.program);
		if let Some(config) = &self.config_file {
			cmd.arg("--config").arg(config);
		}
		cmd.args(["-v", "snapshot", "-r", "--foreground", "-t"])
			.arg(target)
			.current_dir(&self.runtime_dir)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(log)
			.process_group(0);
		let mut child = cmd.spawn().map_err(SnapshotError::Spawn)?;
		debug!(target: "extvol.snapshot", child = child.id(), "snapshotter spawned");

		let deadline = Instant::now() + START_TIMEOUT;
		while Instant::now() < deadline {
			if let MarkerState::Live(pid) = self.marker.state()? {
				info!(target: "extvol.snapshot", pid, target_dir = %target.display(), "snapshotter started");
				return Ok(pid);
			}
			if let Ok(Some(status)) = child.try_wait() {
				warn!(target: "extvol.snapshot", status = %status, log = %self.log.display(), "snapshotter exited during startup");
				break;
			}
			thread::sleep(POLL_INTERVAL);
		}
		Err(SnapshotError::StartTimeout {
			waited: START_TIMEOUT,
			log: self.log.clone(),
		})
	}

	fn stop(&self) -> Result<bool, SnapshotError> {
		let Some(pid) = self.marker.signal(libc::SIGTERM)? else {
			self.marker.clear_stale()?;
			return Ok(false);
		};
		debug!(target: "extvol.snapshot", pid, "sent terminate");

		let deadline = Instant::now() + self.stop_timeout;
		loop {
			match self.marker.state()? {
				MarkerState::Absent => break,
				MarkerState::Stale(_) => {
					self.marker.clear_stale()?;
					break;
				}
				MarkerState::Live(current) if current != pid => break,
				MarkerState::Live(_) => {}
			}
			if Instant::now() >= deadline {
				return Err(SnapshotError::StopTimeout {
					pid,
					waited: self.stop_timeout,
				});
			}
			thread::sleep(POLL_INTERVAL);
		}
		info!(target: "extvol.snapshot", pid, "snapshotter stopped");
		Ok(true)
	}

	fn running(&self) -> Result<Option<u32>, SnapshotError> {
		Ok(match self.marker.state()? {
			MarkerState::Live(pid) => Some(pid),
			_ => None,
		})
	}
}
