//! The session state machine.
//!
//! `Closed -> Opening -> Open -> Closing -> Closed`. Preconditions are checked
//! before anything is mutated; once the lock is held every handler runs, and
//! handler failures are collected into the report instead of aborting.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ExtvolConfig, Layout};
use crate::error::{Precondition, Result};
use crate::handlers::{HANDLERS, Handler, HandlerFailure, Phase, SessionContext};
use crate::host::{Concern, Gate, HostError, VolumeHost};
use crate::lock::{Session, SessionLock, normalize_mountpoint};
use crate::redirect::PathRedirector;
use crate::settings::{self, SettingsBridge};
use crate::snapshot::{SnapshotControl, SnapshotError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
	Closed,
	Opening,
	Open,
	Closing,
}

#[derive(Debug)]
pub struct OpenReport {
	pub session: Session,
	pub failures: Vec<HandlerFailure>,
	/// Pid of the snapshotter started for this session.
	pub snapshotter: Option<u32>,
	pub snapshot_error: Option<SnapshotError>,
}

#[derive(Debug)]
pub struct CloseReport {
	pub volume: PathBuf,
	pub failures: Vec<HandlerFailure>,
	pub snapshotter_stopped: bool,
	pub snapshot_error: Option<SnapshotError>,
	/// The session is closed either way; only the unmount itself failed.
	pub unmount_error: Option<HostError>,
}

/// Who holds the session right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
	pub owner: Option<PathBuf>,
	pub snapshotter: Option<u32>,
}

/// Releases the lock on drop unless disarmed, so a panic between acquiring
/// the lock and reaching `Open` cannot leave the marker behind.
struct LockGuard<'a> {
	lock: &'a SessionLock,
	session: Option<&'a Session>,
}

impl LockGuard<'_> {
	fn disarm(mut self) {
		self.session = None;
	}
}

impl Drop for LockGuard<'_> {
	fn drop(&mut self) {
		if let Some(session) = self.session.take() {
			warn!(target: "extvol.session", volume = %session.volume.display(), "open did not complete, releasing lock");
			if let Err(err) = self.lock.release(session) {
				warn!(target: "extvol.session", error = %err, "lock release failed, manual cleanup needed");
			}
		}
	}
}

pub struct Orchestrator {
	config: ExtvolConfig,
	layout: Layout,
	lock: SessionLock,
	redirector: PathRedirector,
	bridge: SettingsBridge,
	host: Box<dyn VolumeHost>,
	gate: Box<dyn Gate>,
	snapshots: Box<dyn SnapshotControl>,
	handlers: &'static [Handler],
	state: Cell<SessionState>,
}

impl Orchestrator {
	pub fn new(
		config: ExtvolConfig,
		layout: Layout,
		host: Box<dyn VolumeHost>,
		gate: Box<dyn Gate>,
		snapshots: Box<dyn SnapshotControl>,
	) -> Self {
		Self {
			lock: SessionLock::new(&layout.lock_marker),
			redirector: PathRedirector::new(&layout.home),
			bridge: SettingsBridge::new(&config.tools),
			config,
			layout,
			host,
			gate,
			snapshots,
			handlers: HANDLERS,
			state: Cell::new(SessionState::Closed),
		}
	}

	/// Replaces the handler catalogue.
	pub fn with_handlers(mut self, handlers: &'static [Handler]) -> Self {
		self.handlers = handlers;
		self
	}

	pub fn state(&self) -> SessionState {
		self.state.get()
	}

	pub fn layout(&self) -> &Layout {
		&self.layout
	}

	pub fn lock(&self) -> &SessionLock {
		&self.lock
	}

	pub fn status(&self) -> Result<Status> {
		Ok(Status {
			owner: self.lock.is_active()?,
			snapshotter: self.snapshots.running()?,
		})
	}

	/// Opens a session on `mountpoint`.
	///
	/// Refuses with [`Precondition`] errors before touching anything. Once the
	/// lock is acquired the call always reaches `Open`; handler and snapshotter
	/// problems are returned in the report.
	pub fn open(&self, mountpoint: &Path) -> Result<OpenReport> {
		let mountpoint = normalize_mountpoint(mountpoint);
		info!(target: "extvol.session", volume = %mountpoint.display(), "opening");

		if let Some(owner) = self.lock.is_active()? {
			return Err(Precondition::AlreadyActive { owner: Some(owner) }.into());
		}
		if !self.host.is_mounted(&mountpoint)? {
			return Err(Precondition::NotMounted(mountpoint).into());
		}

		let free = self.host.free_bytes(&mountpoint)?;
		let floor = self.config.min_free_bytes;
		if free < floor {
			let concern = Concern::LowFreeSpace {
				volume: mountpoint.clone(),
				free,
				floor,
			};
			if !self.gate.proceed(&concern) {
				return Err(Precondition::LowFreeSpace {
					volume: mountpoint,
					free,
					floor,
				}
				.into());
			}
			warn!(target: "extvol.session", free, floor, "opening despite low free space");
		}

		if first_open_with_version(&mountpoint) {
			let concern = Concern::FirstOpenWithVersion {
				volume: mountpoint.clone(),
			};
			if !self.gate.proceed(&concern) {
				return Err(Precondition::Declined(mountpoint).into());
			}
		}

		self.state.set(SessionState::Opening);
		let session = match self.lock.acquire(&mountpoint) {
			Ok(session) => session,
			Err(err) => {
				self.state.set(SessionState::Closed);
				return Err(err.into());
			}
		};
		let guard = LockGuard {
			lock: &self.lock,
			session: Some(&session),
		};

		let failures = self.run_handlers(Phase::Open, &mountpoint);

		let (snapshotter, snapshot_error) = match self.snapshots.start(&mountpoint) {
			Ok(pid) => (Some(pid), None),
			Err(err) => {
				warn!(target: "extvol.session", error = %err, "snapshotter did not start");
				(None, Some(err))
			}
		};

		guard.disarm();
		self.state.set(SessionState::Open);
		info!(
			target: "extvol.session",
			volume = %mountpoint.display(),
			failed_handlers = failures.len(),
			"session open"
		);
		Ok(OpenReport {
			session,
			failures,
			snapshotter,
			snapshot_error,
		})
	}

	/// Closes the session owned by `mountpoint` and unmounts it.
	///
	/// Not-mounted, wrong-volume and no-session refusals are
	/// [`Precondition::is_close_skip`]; open files block the close with the
	/// offending paths. Nothing is mutated in any of those cases.
	pub fn close(&self, mountpoint: &Path) -> Result<CloseReport> {
		let mountpoint = normalize_mountpoint(mountpoint);
		info!(target: "extvol.session", volume = %mountpoint.display(), "closing");

		let report = self.lock.verify_and_release(&mountpoint, |session| -> Result<CloseReport> {
			if !self.host.is_mounted(&mountpoint)? {
				return Err(Precondition::NotMounted(mountpoint.clone()).into());
			}

			let blocking = self.blocking_open_files(&mountpoint)?;
			if !blocking.is_empty() {
				return Err(Precondition::OpenFiles {
					mountpoint: mountpoint.clone(),
					paths: blocking,
				}
				.into());
			}

			self.state.set(SessionState::Closing);
			let (snapshotter_stopped, snapshot_error) = match self.snapshots.stop() {
				Ok(stopped) => (stopped, None),
				Err(err) => {
					warn!(target: "extvol.session", error = %err, "snapshotter did not stop cleanly");
					(false, Some(err))
				}
			};

			let failures = self.run_handlers(Phase::Close, &mountpoint);

			debug!(target: "extvol.session", "syncing filesystems");
			unsafe { libc::sync() };

			Ok(CloseReport {
				volume: session.volume.clone(),
				failures,
				snapshotter_stopped,
				snapshot_error,
				unmount_error: None,
			})
		});

		let mut report = match report {
			Ok(report) => report,
			Err(err) => {
				if self.state.get() == SessionState::Closing {
					self.state.set(SessionState::Open);
				}
				return Err(err);
			}
		};
		self.state.set(SessionState::Closed);

		if let Err(err) = self.host.unmount(&mountpoint) {
			warn!(target: "extvol.session", volume = %mountpoint.display(), error = %err, "unmount failed");
			report.unmount_error = Some(err);
		}
		info!(
			target: "extvol.session",
			volume = %mountpoint.display(),
			failed_handlers = report.failures.len(),
			"session closed"
		);
		Ok(report)
	}

	fn blocking_open_files(&self, mountpoint: &Path) -> Result<Vec<PathBuf>> {
		let open = self.host.open_files(mountpoint)?;
		let blocking: Vec<PathBuf> = open
			.into_iter()
			.filter(|path| !settings::is_partial_dump(path))
			.filter(|path| {
				let rel = path.strip_prefix(mountpoint).unwrap_or(path);
				!self.config.open_file_allowlist.iter().any(|allowed| rel.starts_with(allowed))
			})
			.collect();
		if !blocking.is_empty() {
			warn!(target: "extvol.session", count = blocking.len(), "open files block close");
		}
		Ok(blocking)
	}

	fn run_handlers(&self, phase: Phase, mountpoint: &Path) -> Vec<HandlerFailure> {
		let ctx = SessionContext {
			mountpoint,
			redirector: &self.redirector,
			bridge: &self.bridge,
			skel_dir: &self.config.skel_dir,
			run_hooks: self.config.run_hooks,
		};
		let mut failures = Vec::new();
		for handler in self.handlers {
			if !self.config.handler_enabled(handler.name) {
				debug!(target: "extvol.handler", handler = handler.name, "disabled");
				continue;
			}
			debug!(target: "extvol.handler", handler = handler.name, phase = %phase, "running");
			if let Err(err) = (handler.action(phase))(&ctx) {
				warn!(target: "extvol.handler", handler = handler.name, phase = %phase, error = %err, "handler failed");
				failures.push(HandlerFailure {
					handler: handler.name,
					phase,
					errors: err.errors,
				});
			}
		}
		failures
	}
}

/// A volume written by an older release has `.gnupg` but no `.icedove` yet.
fn first_open_with_version(mountpoint: &Path) -> bool {
	mountpoint.join(".gnupg").exists() && !mountpoint.join(".icedove").exists()
}
