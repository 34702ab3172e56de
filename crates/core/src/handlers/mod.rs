//! Subsystem handlers.
//!
//! A handler is a named pair of plain functions, one run when a session opens
//! and one when it closes. [`HANDLERS`] lists them in the order they run; the
//! order is part of the contract because later handlers rely on paths earlier
//! ones have redirected.
//!
//! Every step inside a handler is best-effort: a failed step is recorded and
//! the handler moves on to its next step, so one broken application cannot
//! strand the rest of the profile on the volume.

mod catalogue;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::redirect::{self, LinkOutcome, PathRedirector, RedirectError};
use crate::settings::{LoadOutcome, SettingsBridge, SettingsKey, ToolError};

pub use catalogue::{HANDLERS, SNAPSHOT_KEYS};

/// An open or close action.
pub type Action = fn(&SessionContext<'_>) -> Result<(), HandlerError>;

#[derive(Clone, Copy)]
pub struct Handler {
	pub name: &'static str,
	pub open: Action,
	pub close: Action,
}

impl Handler {
	pub fn action(&self, phase: Phase) -> Action {
		match phase {
			Phase::Open => self.open,
			Phase::Close => self.close,
		}
	}
}

impl fmt::Debug for Handler {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Handler").field("name", &self.name).finish_non_exhaustive()
	}
}

/// Looks up a handler in [`HANDLERS`] by name.
pub fn find(name: &str) -> Option<&'static Handler> {
	HANDLERS.iter().find(|h| h.name == name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
	Open,
	Close,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Phase::Open => write!(f, "open"),
			Phase::Close => write!(f, "close"),
		}
	}
}

/// One failed step inside a handler.
#[derive(Debug, Error)]
pub enum StepError {
	#[error(transparent)]
	Redirect(#[from] RedirectError),

	#[error(transparent)]
	Tool(#[from] ToolError),

	#[error("{path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

/// Every step that failed while running one handler action.
#[derive(Debug, Error)]
#[error("{}", join_errors(.errors))]
pub struct HandlerError {
	pub errors: Vec<StepError>,
}

fn join_errors(errors: &[StepError]) -> String {
	errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl From<StepError> for HandlerError {
	fn from(err: StepError) -> Self {
		Self { errors: vec![err] }
	}
}

impl From<RedirectError> for HandlerError {
	fn from(err: RedirectError) -> Self {
		StepError::from(err).into()
	}
}

impl From<ToolError> for HandlerError {
	fn from(err: ToolError) -> Self {
		StepError::from(err).into()
	}
}

/// A handler whose action reported failures, as collected by the orchestrator.
#[derive(Debug)]
pub struct HandlerFailure {
	pub handler: &'static str,
	pub phase: Phase,
	pub errors: Vec<StepError>,
}

impl HandlerFailure {
	pub fn messages(&self) -> Vec<String> {
		self.errors.iter().map(ToString::to_string).collect()
	}
}

impl fmt::Display for HandlerFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}: {}", self.handler, self.phase, join_errors(&self.errors))
	}
}

/// Collects step failures so a handler can keep going after one.
#[derive(Debug, Default)]
pub struct Steps {
	errors: Vec<StepError>,
}

impl Steps {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records a failure and returns `None`, or passes the value through.
	pub fn step<T, E: Into<StepError>>(&mut self, result: Result<T, E>) -> Option<T> {
		match result {
			Ok(value) => Some(value),
			Err(err) => {
				let err = err.into();
				warn!(target: "extvol.handler", error = %err, "step failed");
				self.errors.push(err);
				None
			}
		}
	}

	pub fn finish(self) -> Result<(), HandlerError> {
		if self.errors.is_empty() {
			Ok(())
		} else {
			Err(HandlerError { errors: self.errors })
		}
	}
}

/// Everything a handler action may touch. Built once per open or close.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext<'a> {
	pub mountpoint: &'a Path,
	pub redirector: &'a PathRedirector,
	pub bridge: &'a SettingsBridge,
	pub skel_dir: &'a Path,
	/// When false, service restarts and kills are logged and skipped.
	pub run_hooks: bool,
}

impl SessionContext<'_> {
	pub fn home(&self) -> &Path {
		self.redirector.home()
	}

	pub fn link_dir(&self, rel: &str) -> Result<(), StepError> {
		let outcome = self.redirector.link_dir(self.mountpoint, rel)?;
		log_link(rel, &outcome);
		Ok(())
	}

	pub fn link_file(&self, rel: &str) -> Result<(), StepError> {
		let outcome = self.redirector.link_file(self.mountpoint, rel)?;
		log_link(rel, &outcome);
		Ok(())
	}

	pub fn unlink_dir(&self, rel: &str) -> Result<(), StepError> {
		self.redirector.unlink_dir(self.mountpoint, rel)?;
		Ok(())
	}

	pub fn unlink_file(&self, rel: &str) -> Result<(), StepError> {
		self.redirector.unlink_file(self.mountpoint, rel)?;
		Ok(())
	}

	pub fn load(&self, key: &SettingsKey) -> Result<(), StepError> {
		if self.bridge.load(self.mountpoint, key)? == LoadOutcome::Loaded {
			debug!(target: "extvol.handler", key = %key, "settings loaded");
		}
		Ok(())
	}

	pub fn dump(&self, key: &SettingsKey) -> Result<(), StepError> {
		self.bridge.dump(self.mountpoint, key)?;
		Ok(())
	}

	pub fn reset(&self, key: &SettingsKey) -> Result<(), StepError> {
		Ok(self.bridge.reset(key)?)
	}

	pub fn migrate(&self, old: &str, new: &str) -> Result<(), StepError> {
		redirect::migrate_dir(self.mountpoint, old, new)?;
		Ok(())
	}

	/// Copies `rel` from the skeleton directory onto the volume unless the volume already has it.
	pub fn seed_from_skel(&self, rel: &str) -> Result<(), StepError> {
		let source = self.skel_dir.join(rel);
		let dest = self.mountpoint.join(rel);
		if fs::symlink_metadata(&dest).is_ok() || !source.exists() {
			return Ok(());
		}
		info!(target: "extvol.handler", path = rel, "seeding from skeleton");
		if source.is_dir() {
			redirect::copy_tree(&source, &dest)?;
		} else {
			if let Some(parent) = dest.parent() {
				fs::create_dir_all(parent).map_err(io_step(parent))?;
			}
			fs::copy(&source, &dest).map_err(io_step(&source))?;
		}
		Ok(())
	}

	/// Restricts a volume tree to its owner: `0700` directories, `0600` files.
	pub fn restrict_permissions(&self, rel: &str) -> Result<(), StepError> {
		let root = self.mountpoint.join(rel);
		if !root.is_dir() {
			return Ok(());
		}
		chmod_tree(&root)
	}

	/// Runs a service hook. `tolerated` lists exit codes that still count as
	/// success (pkill exits 1 when nothing matched). A program that is not
	/// installed is skipped.
	pub fn hook(&self, argv: &[&str], tolerated: &[i32]) -> Result<(), StepError> {
		let Some((program, args)) = argv.split_first() else {
			return Ok(());
		};
		if !self.run_hooks {
			debug!(target: "extvol.handler", command = %argv.join(" "), "hooks disabled, skipping");
			return Ok(());
		}
		debug!(target: "extvol.handler", command = %argv.join(" "), "running hook");
		let output = Command::new(program)
			.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.output();
		match output {
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				debug!(target: "extvol.handler", program = *program, "not installed, skipping hook");
				Ok(())
			}
			Err(source) => Err(ToolError::Spawn {
				program: program.to_string(),
				source,
			}
			.into()),
			Ok(out) if out.status.success() || out.status.code().is_some_and(|c| tolerated.contains(&c)) => Ok(()),
			Ok(out) => Err(ToolError::Status {
				program: program.to_string(),
				status: out.status,
				stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
			}
			.into()),
		}
	}
}

fn log_link(rel: &str, outcome: &LinkOutcome) {
	match outcome {
		LinkOutcome::Linked { backup: Some(backup) } => {
			info!(target: "extvol.handler", path = rel, backup = %backup.display(), "redirected, original kept")
		}
		LinkOutcome::Linked { backup: None } => debug!(target: "extvol.handler", path = rel, "redirected"),
		LinkOutcome::AlreadyLinked => debug!(target: "extvol.handler", path = rel, "already redirected"),
	}
}

fn io_step(path: &Path) -> impl FnOnce(io::Error) -> StepError + '_ {
	move |source| StepError::Io {
		path: path.to_path_buf(),
		source,
	}
}

fn chmod_tree(dir: &Path) -> Result<(), StepError> {
	use std::os::unix::fs::PermissionsExt;

	fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(io_step(dir))?;
	for entry in fs::read_dir(dir).map_err(io_step(dir))? {
		let entry = entry.map_err(io_step(dir))?;
		let path = entry.path();
		let file_type = entry.file_type().map_err(io_step(&path))?;
		if file_type.is_dir() {
			chmod_tree(&path)?;
		} else if file_type.is_file() {
			fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(io_step(&path))?;
		}
	}
	Ok(())
}

/// Copies the regular files of `from` into `to`, skipping names ending in `runtime`.
pub(crate) fn mirror_files(from: &Path, to: &Path) -> Result<usize, StepError> {
	if !from.is_dir() {
		return Ok(0);
	}
	fs::create_dir_all(to).map_err(io_step(to))?;
	let mut copied = 0;
	for entry in fs::read_dir(from).map_err(io_step(from))? {
		let entry = entry.map_err(io_step(from))?;
		let name = entry.file_name();
		if name.to_string_lossy().ends_with("runtime") {
			continue;
		}
		let path = entry.path();
		if entry.file_type().map_err(io_step(&path))?.is_file() {
			fs::copy(&path, to.join(&name)).map_err(io_step(&path))?;
			copied += 1;
		}
	}
	Ok(copied)
}

#[cfg(test)]
mod tests {
	use std::os::unix::fs::PermissionsExt;

	use tempfile::TempDir;

	use super::*;
	use crate::config::Tools;

	struct Fixture {
		_tmp: TempDir,
		mnt: PathBuf,
		skel: PathBuf,
		redirector: PathRedirector,
		bridge: SettingsBridge,
	}

	impl Fixture {
		fn new() -> Self {
			let tmp = TempDir::new().unwrap();
			let mnt = tmp.path().join("vol");
			let skel = tmp.path().join("skel");
			fs::create_dir_all(&mnt).unwrap();
			fs::create_dir_all(&skel).unwrap();
			let redirector = PathRedirector::new(tmp.path().join("home"));
			let bridge = SettingsBridge::new(&Tools {
				gconftool: vec![],
				dconf: vec![],
				unmount: vec![],
			});
			Self {
				_tmp: tmp,
				mnt,
				skel,
				redirector,
				bridge,
			}
		}

		fn ctx(&self, run_hooks: bool) -> SessionContext<'_> {
			SessionContext {
				mountpoint: &self.mnt,
				redirector: &self.redirector,
				bridge: &self.bridge,
				skel_dir: &self.skel,
				run_hooks,
			}
		}
	}

	#[test]
	fn handler_names_are_unique() {
		let mut names: Vec<_> = HANDLERS.iter().map(|h| h.name).collect();
		names.sort_unstable();
		names.dedup();
		assert_eq!(names.len(), HANDLERS.len());
		assert!(find("gnupg").is_some());
		assert!(find("printers").is_none());
	}

	#[test]
	fn declared_order_is_preserved() {
		let position = |name: &str| HANDLERS.iter().position(|h| h.name == name).unwrap();
		assert!(position("gnupg") < position("evolution"));
		assert!(position("tracker") < position("gconfd"));
		assert!(position("gconfd") < position("backintime"));
		assert_eq!(HANDLERS.last().map(|h| h.name), Some("okular"));
	}

	#[test]
	fn steps_collect_failures_and_continue() {
		let mut steps = Steps::new();
		assert_eq!(steps.step(Ok::<_, StepError>(1)), Some(1));
		assert_eq!(
			steps.step(Err::<(), _>(ToolError::NotConfigured { tool: "dconf" })),
			None
		);
		assert_eq!(steps.step(Ok::<_, ToolError>("after")), Some("after"));
		let err = steps.finish().unwrap_err();
		assert_eq!(err.errors.len(), 1);
		assert!(err.to_string().contains("dconf is not configured"));
	}

	#[test]
	fn hooks_tolerate_listed_exit_codes_and_missing_programs() {
		let fx = Fixture::new();
		let ctx = fx.ctx(true);
		assert!(ctx.hook(&["true"], &[]).is_ok());
		assert!(ctx.hook(&["false"], &[1]).is_ok());
		assert!(matches!(ctx.hook(&["false"], &[]), Err(StepError::Tool(ToolError::Status { .. }))));
		assert!(ctx.hook(&["extvol-no-such-program"], &[]).is_ok());

		assert!(fx.ctx(false).hook(&["false"], &[]).is_ok());
	}

	#[test]
	fn skeleton_seeding_never_overwrites_volume_data() {
		let fx = Fixture::new();
		fs::create_dir_all(fx.skel.join(".gimp-2.8")).unwrap();
		fs::write(fx.skel.join(".gimp-2.8/sessionrc"), "skel").unwrap();
		let ctx = fx.ctx(false);

		ctx.seed_from_skel(".gimp-2.8/sessionrc").unwrap();
		assert_eq!(fs::read_to_string(fx.mnt.join(".gimp-2.8/sessionrc")).unwrap(), "skel");

		fs::write(fx.mnt.join(".gimp-2.8/sessionrc"), "mine").unwrap();
		ctx.seed_from_skel(".gimp-2.8/sessionrc").unwrap();
		assert_eq!(fs::read_to_string(fx.mnt.join(".gimp-2.8/sessionrc")).unwrap(), "mine");

		ctx.seed_from_skel(".icedove").unwrap();
		assert!(!fx.mnt.join(".icedove").exists());
	}

	#[test]
	fn permissions_are_restricted_to_owner() {
		let fx = Fixture::new();
		let gnupg = fx.mnt.join(".gnupg");
		fs::create_dir_all(gnupg.join("private-keys-v1.d")).unwrap();
		fs::write(gnupg.join("pubring.kbx"), "").unwrap();
		fs::set_permissions(gnupg.join("pubring.kbx"), fs::Permissions::from_mode(0o644)).unwrap();

		fx.ctx(false).restrict_permissions(".gnupg").unwrap();
		let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
		assert_eq!(mode(&gnupg), 0o700);
		assert_eq!(mode(&gnupg.join("private-keys-v1.d")), 0o700);
		assert_eq!(mode(&gnupg.join("pubring.kbx")), 0o600);
	}

	#[test]
	fn mirror_skips_runtime_entries() {
		let tmp = TempDir::new().unwrap();
		let from = tmp.path().join("from");
		fs::create_dir_all(&from).unwrap();
		fs::write(from.join("default.pa"), "load-module").unwrap();
		fs::write(from.join("abc-runtime"), "").unwrap();

		let to = tmp.path().join("to");
		assert_eq!(mirror_files(&from, &to).unwrap(), 1);
		assert!(to.join("default.pa").exists());
		assert!(!to.join("abc-runtime").exists());
		assert_eq!(mirror_files(&tmp.path().join("missing"), &to).unwrap(), 0);
	}

	#[test]
	fn every_handler_round_trips_on_an_empty_home() {
		let fx = Fixture::new();
		let ctx = fx.ctx(false);
		for handler in HANDLERS {
			// Settings tools are unconfigured here, so only filesystem steps can succeed.
			let _ = (handler.open)(&ctx);
		}
		for handler in HANDLERS {
			let _ = (handler.close)(&ctx);
		}
		let leftovers: Vec<_> = walk_symlinks(fx.redirector.home());
		assert!(leftovers.is_empty(), "symlinks left in home: {leftovers:?}");
	}

	fn walk_symlinks(dir: &Path) -> Vec<PathBuf> {
		let mut found = Vec::new();
		let Ok(entries) = fs::read_dir(dir) else { return found };
		for entry in entries.flatten() {
			let ft = entry.file_type().unwrap();
			if ft.is_symlink() {
				found.push(entry.path());
			} else if ft.is_dir() {
				found.extend(walk_symlinks(&entry.path()));
			}
		}
		found
	}
}
