//! Reversible redirection of home-directory paths onto the volume.
//!
//! A redirection is active iff the local path is a symlink pointing at its
//! volume path; nothing else is persisted. Whatever occupied the local path
//! before is rotated to `<path>.old`, `<path>.old-2`, `<path>.old-3`, ... and
//! the highest-numbered backup is the one restored on unlink. New backups
//! always take the slot after the highest existing one, so a rename never
//! lands on an occupied name.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
#[error("{op} {path}: {source}")]
pub struct RedirectError {
	pub op: &'static str,
	pub path: PathBuf,
	#[source]
	pub source: io::Error,
}

fn fs_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> RedirectError + 'a {
	move |source| RedirectError {
		op,
		path: path.to_path_buf(),
		source,
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
	Directory,
	File,
}

/// One home path and the volume path it is redirected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectionRecord {
	pub local: PathBuf,
	pub volume: PathBuf,
	pub kind: RedirectKind,
}

impl RedirectionRecord {
	pub fn is_active(&self) -> bool {
		points_at(&self.local, &self.volume)
	}
}

/// What `link_*` did to the local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
	Linked { backup: Option<PathBuf> },
	AlreadyLinked,
}

/// What `unlink_*` did to the local path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlinkOutcome {
	pub removed_link: bool,
	pub restored: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PathRedirector {
	home: PathBuf,
}

impl PathRedirector {
	pub fn new(home: impl Into<PathBuf>) -> Self {
		Self { home: home.into() }
	}

	pub fn home(&self) -> &Path {
		&self.home
	}

	/// Record for a directory redirection; the volume side mirrors `rel`.
	pub fn dir_record(&self, mountpoint: &Path, rel: &str) -> Result<RedirectionRecord, RedirectError> {
		let rel = checked_rel(rel)?;
		Ok(RedirectionRecord {
			local: self.home.join(rel),
			volume: mountpoint.join(rel),
			kind: RedirectKind::Directory,
		})
	}

	/// Record for a file redirection; the volume side is the dotted basename at the volume root.
	pub fn file_record(&self, mountpoint: &Path, rel: &str) -> Result<RedirectionRecord, RedirectError> {
		let rel = checked_rel(rel)?;
		let name = rel
			.file_name()
			.ok_or_else(|| invalid_rel(rel))?
			.to_string_lossy()
			.into_owned();
		let volume_name = if name.starts_with('.') { name } else { format!(".{name}") };
		Ok(RedirectionRecord {
			local: self.home.join(rel),
			volume: mountpoint.join(volume_name),
			kind: RedirectKind::File,
		})
	}

	pub fn link_dir(&self, mountpoint: &Path, rel: &str) -> Result<LinkOutcome, RedirectError> {
		let record = self.dir_record(mountpoint, rel)?;
		debug!(target: "extvol.redirect", path = rel, "configuration directory");
		fs::create_dir_all(&record.volume).map_err(fs_err("create", &record.volume))?;
		link(&record)
	}

	pub fn link_file(&self, mountpoint: &Path, rel: &str) -> Result<LinkOutcome, RedirectError> {
		let record = self.file_record(mountpoint, rel)?;
		debug!(target: "extvol.redirect", path = rel, "configuration file");
		OpenOptions::new()
			.append(true)
			.create(true)
			.open(&record.volume)
			.map_err(fs_err("create", &record.volume))?;
		link(&record)
	}

	pub fn unlink_dir(&self, mountpoint: &Path, rel: &str) -> Result<UnlinkOutcome, RedirectError> {
		let record = self.dir_record(mountpoint, rel)?;
		debug!(target: "extvol.redirect", path = rel, "configuration directory");
		unlink(&record)
	}

	pub fn unlink_file(&self, mountpoint: &Path, rel: &str) -> Result<UnlinkOutcome, RedirectError> {
		let record = self.file_record(mountpoint, rel)?;
		debug!(target: "extvol.redirect", path = rel, "configuration file");
		unlink(&record)
	}
}

fn link(record: &RedirectionRecord) -> Result<LinkOutcome, RedirectError> {
	let local = &record.local;
	if let Some(parent) = local.parent() {
		fs::create_dir_all(parent).map_err(fs_err("create", parent))?;
	}

	if points_at(local, &record.volume) {
		debug!(target: "extvol.redirect", path = %local.display(), "already redirected");
		return Ok(LinkOutcome::AlreadyLinked);
	}

	let backup = if lexists(local) {
		let slot = next_backup_slot(local).map_err(fs_err("scan", local))?;
		fs::rename(local, &slot).map_err(fs_err("rename", local))?;
		debug!(target: "extvol.redirect", from = %local.display(), to = %slot.display(), "rotated existing content");
		Some(slot)
	} else {
		None
	};

	std::os::unix::fs::symlink(&record.volume, local).map_err(fs_err("symlink", local))?;
	Ok(LinkOutcome::Linked { backup })
}

fn unlink(record: &RedirectionRecord) -> Result<UnlinkOutcome, RedirectError> {
	let local = &record.local;
	let mut outcome = UnlinkOutcome::default();

	match fs::symlink_metadata(local) {
		Ok(meta) if meta.file_type().is_symlink() && points_at(local, &record.volume) => {
			fs::remove_file(local).map_err(fs_err("remove", local))?;
			outcome.removed_link = true;
		}
		Ok(_) => {
			warn!(
				target: "extvol.redirect",
				path = %local.display(),
				"path is not our redirection, leaving it and its backups alone"
			);
			return Ok(outcome);
		}
		Err(err) if err.kind() == io::ErrorKind::NotFound => {}
		Err(err) => return Err(fs_err("stat", local)(err)),
	}

	let backups = backup_slots(local).map_err(fs_err("scan", local))?;
	if let Some((_, latest)) = backups.into_iter().max_by_key(|(index, _)| *index) {
		fs::rename(&latest, local).map_err(fs_err("rename", &latest))?;
		info!(target: "extvol.redirect", from = %latest.display(), to = %local.display(), "restored original");
		outcome.restored = Some(latest);
	}
	Ok(outcome)
}

/// Copies `old` to `new` on the volume when the legacy directory exists and the new one does not.
pub fn migrate_dir(mountpoint: &Path, old: &str, new: &str) -> Result<bool, RedirectError> {
	let from = mountpoint.join(checked_rel(old)?);
	let to = mountpoint.join(checked_rel(new)?);
	if !from.exists() || lexists(&to) {
		return Ok(false);
	}
	info!(target: "extvol.redirect", from = old, to = new, "migrating legacy directory");
	copy_tree(&from, &to)?;
	Ok(true)
}

/// Recursively copies a tree, recreating symlinks rather than following them.
pub fn copy_tree(from: &Path, to: &Path) -> Result<(), RedirectError> {
	fs::create_dir_all(to).map_err(fs_err("create", to))?;
	for entry in fs::read_dir(from).map_err(fs_err("read", from))? {
		let entry = entry.map_err(fs_err("read", from))?;
		let src = entry.path();
		let dst = to.join(entry.file_name());
		let file_type = entry.file_type().map_err(fs_err("stat", &src))?;
		if file_type.is_dir() {
			copy_tree(&src, &dst)?;
		} else if file_type.is_symlink() {
			let target = fs::read_link(&src).map_err(fs_err("readlink", &src))?;
			std::os::unix::fs::symlink(target, &dst).map_err(fs_err("symlink", &dst))?;
		} else {
			fs::copy(&src, &dst).map_err(fs_err("copy", &src))?;
		}
	}
	Ok(())
}

fn points_at(local: &Path, volume: &Path) -> bool {
	fs::read_link(local).is_ok_and(|target| target == volume)
}

fn lexists(path: &Path) -> bool {
	fs::symlink_metadata(path).is_ok()
}

fn checked_rel(rel: &str) -> Result<&Path, RedirectError> {
	let path = Path::new(rel);
	let ok = !rel.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
	if ok { Ok(path) } else { Err(invalid_rel(path)) }
}

fn invalid_rel(path: &Path) -> RedirectError {
	RedirectError {
		op: "validate",
		path: path.to_path_buf(),
		source: io::Error::new(io::ErrorKind::InvalidInput, "expected a relative path inside home"),
	}
}

fn backup_name(local: &Path, index: u32) -> OsString {
	let mut name = local.file_name().map(OsString::from).unwrap_or_default();
	if index <= 1 {
		name.push(".old");
	} else {
		name.push(format!(".old-{index}"));
	}
	name
}

/// Existing backups of `local` with their slot index (`.old` is slot 1).
fn backup_slots(local: &Path) -> io::Result<Vec<(u32, PathBuf)>> {
	let (Some(parent), Some(name)) = (local.parent(), local.file_name()) else {
		return Ok(Vec::new());
	};
	let prefix = format!("{}.old", name.to_string_lossy());
	let entries = match fs::read_dir(parent) {
		Ok(entries) => entries,
		Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(err) => return Err(err),
	};

	let mut slots = Vec::new();
	for entry in entries {
		let entry = entry?;
		let file_name = entry.file_name();
		let Some(rest) = file_name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
			continue;
		};
		let index = if rest.is_empty() {
			1
		} else if let Some(n) = rest.strip_prefix('-').and_then(|n| n.parse::<u32>().ok()) {
			n
		} else {
			continue;
		};
		slots.push((index, entry.path()));
	}
	Ok(slots)
}

fn next_backup_slot(local: &Path) -> io::Result<PathBuf> {
	let highest = backup_slots(local)?.into_iter().map(|(index, _)| index).max().unwrap_or(0);
	let mut index = highest + 1;
	loop {
		let candidate = local.with_file_name(backup_name(local, index));
		if !lexists(&candidate) {
			return Ok(candidate);
		}
		index += 1;
	}
}
