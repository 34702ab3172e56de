//! The system-wide session lock.
//!
//! A single marker file under the home directory holds the mountpoint of the
//! volume that owns the session. It is created with `O_EXCL`, so two racing
//! opens cannot both succeed, and it outlives crashes of the process that
//! wrote it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LockError {
	#[error("a session is already active")]
	AlreadyActive { owner: Option<PathBuf> },

	#[error("session belongs to {owner}, not {requested}")]
	WrongVolume { owner: PathBuf, requested: PathBuf },

	#[error("no session is active")]
	NotActive,

	#[error("lock marker {path} is inconsistent: {reason}")]
	Inconsistent { path: PathBuf, reason: String },

	#[error(transparent)]
	Io(#[from] io::Error),
}

/// Proof of ownership of the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
	pub volume: PathBuf,
	/// Raw marker content, compared again on release.
	pub token: String,
	pub started_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct SessionLock {
	marker: PathBuf,
}

impl SessionLock {
	pub fn new(marker: impl Into<PathBuf>) -> Self {
		Self { marker: marker.into() }
	}

	pub fn marker(&self) -> &Path {
		&self.marker
	}

	/// Creates the marker for `volume`. Fails if any session exists, whichever volume it names.
	pub fn acquire(&self, volume: &Path) -> Result<Session, LockError> {
		let volume = normalize_mountpoint(volume);
		let token = format!("{}\n", volume.display());

		let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.marker) {
			Ok(file) => file,
			Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
				let owner = self.is_active().ok().flatten();
				return Err(LockError::AlreadyActive { owner });
			}
			Err(err) => return Err(err.into()),
		};

		if let Err(err) = file.write_all(token.as_bytes()).and_then(|()| file.sync_all()) {
			drop(file);
			if let Err(remove_err) = fs::remove_file(&self.marker) {
				return Err(LockError::Inconsistent {
					path: self.marker.clone(),
					reason: format!("write failed ({err}) and removal failed ({remove_err})"),
				});
			}
			return Err(err.into());
		}

		info!(target: "extvol.lock", volume = %volume.display(), "session lock acquired");
		Ok(Session {
			volume,
			token,
			started_at: SystemTime::now(),
		})
	}

	/// Volume owning the active session, if any.
	pub fn is_active(&self) -> Result<Option<PathBuf>, LockError> {
		Ok(self.read()?.map(|session| session.volume))
	}

	/// Returns the session if `volume` owns it.
	pub fn verify(&self, volume: &Path) -> Result<Session, LockError> {
		let requested = normalize_mountpoint(volume);
		let session = self.read()?.ok_or(LockError::NotActive)?;
		if session.volume != requested {
			return Err(LockError::WrongVolume {
				owner: session.volume,
				requested,
			});
		}
		Ok(session)
	}

	/// Verifies ownership, runs `close`, and removes the marker only if `close` succeeded.
	pub fn verify_and_release<T, E>(&self, volume: &Path, close: impl FnOnce(&Session) -> Result<T, E>) -> Result<T, E>
	where
		E: From<LockError>,
	{
		let session = self.verify(volume)?;
		let value = close(&session)?;
		self.release(&session)?;
		Ok(value)
	}

	/// Removes the marker if it still holds `session`'s token.
	pub fn release(&self, session: &Session) -> Result<(), LockError> {
		let current = match fs::read_to_string(&self.marker) {
			Ok(content) => content,
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				warn!(target: "extvol.lock", marker = %self.marker.display(), "marker already gone");
				return Ok(());
			}
			Err(err) => {
				return Err(LockError::Inconsistent {
					path: self.marker.clone(),
					reason: format!("unreadable: {err}"),
				});
			}
		};
		if current != session.token {
			return Err(LockError::Inconsistent {
				path: self.marker.clone(),
				reason: format!("marker changed during session to {:?}", current.trim_end()),
			});
		}
		fs::remove_file(&self.marker).map_err(|err| LockError::Inconsistent {
			path: self.marker.clone(),
			reason: format!("removal failed: {err}"),
		})?;
		info!(target: "extvol.lock", volume = %session.volume.display(), "session lock released");
		Ok(())
	}

	fn read(&self) -> Result<Option<Session>, LockError> {
		let content = match fs::read(&self.marker) {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};
		let inconsistent = |reason: &str| LockError::Inconsistent {
			path: self.marker.clone(),
			reason: reason.to_string(),
		};

		let token = String::from_utf8(content).map_err(|_| inconsistent("not UTF-8"))?;
		let line = token.lines().next().unwrap_or("").trim();
		if line.is_empty() {
			return Err(inconsistent("empty"));
		}
		let volume = PathBuf::from(line);
		if !volume.is_absolute() {
			return Err(inconsistent("volume is not an absolute path"));
		}
		let started_at = fs::metadata(&self.marker)
			.and_then(|m| m.modified())
			.unwrap_or(SystemTime::UNIX_EPOCH);
		debug!(target: "extvol.lock", volume = %volume.display(), "read session marker");
		Ok(Some(Session {
			volume: normalize_mountpoint(&volume),
			token,
			started_at,
		}))
	}
}

/// Anchors relative paths at the working directory and folds `.`, `..` and
/// trailing slashes so `vol/`, `/media/vol/` and `/media/x/../vol` compare equal
/// when run from `/media`.
pub fn normalize_mountpoint(path: &Path) -> PathBuf {
	let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
	let mut out = PathBuf::new();
	for component in path.components() {
		match component {
			Component::CurDir => {}
			Component::ParentDir => {
				out.pop();
			}
			other => out.push(other),
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	fn lock() -> (TempDir, SessionLock) {
		let tmp = TempDir::new().unwrap();
		let lock = SessionLock::new(tmp.path().join(".mounted_as_extended_volume"));
		(tmp, lock)
	}

	#[test]
	fn acquire_writes_single_line_marker() {
		let (_tmp, lock) = lock();
		let session = lock.acquire(Path::new("/media/vol/")).unwrap();
		assert_eq!(session.volume, PathBuf::from("/media/vol"));
		assert_eq!(fs::read_to_string(lock.marker()).unwrap(), "/media/vol\n");
		assert_eq!(lock.is_active().unwrap(), Some(PathBuf::from("/media/vol")));
	}

	#[test]
	fn relative_volumes_are_recorded_absolute() {
		let (_tmp, lock) = lock();
		let cwd = std::env::current_dir().unwrap();
		let session = lock.acquire(Path::new("media/./vol/")).unwrap();
		assert_eq!(session.volume, cwd.join("media/vol"));
		assert_eq!(
			fs::read_to_string(lock.marker()).unwrap(),
			format!("{}\n", cwd.join("media/vol").display())
		);
		assert_eq!(normalize_mountpoint(Path::new("/media/x/../vol")), PathBuf::from("/media/vol"));
	}

	#[test]
	fn events_carry_the_lock_target() {
		use std::sync::{Arc, Mutex};

		use tracing_subscriber::Layer;
		use tracing_subscriber::layer::{Context, SubscriberExt};

		#[derive(Clone, Default)]
		struct Targets(Arc<Mutex<Vec<String>>>);

		impl<S: tracing::Subscriber> Layer<S> for Targets {
			fn on_event(&self, event: &tracing::Event<'_>, _: Context<'_, S>) {
				self.0.lock().unwrap().push(event.metadata().target().to_string());
			}
		}

		let (_tmp, lock) = lock();
		let targets = Targets::default();
		let subscriber = tracing_subscriber::registry().with(targets.clone());
		tracing::subscriber::with_default(subscriber, || {
			lock.acquire(Path::new("/media/vol")).unwrap();
			lock.is_active().unwrap();
		});

		let seen = targets.0.lock().unwrap().clone();
		assert!(!seen.is_empty());
		assert!(seen.iter().all(|t| t == "extvol.lock"), "{seen:?}");
	}

	#[test]
	fn second_acquire_fails_regardless_of_volume() {
		let (_tmp, lock) = lock();
		lock.acquire(Path::new("/media/a")).unwrap();

		for volume in ["/media/a", "/media/b"] {
			match lock.acquire(Path::new(volume)) {
				Err(LockError::AlreadyActive { owner }) => assert_eq!(owner, Some(PathBuf::from("/media/a"))),
				other => panic!("expected AlreadyActive, got {other:?}"),
			}
		}
	}

	#[test]
	fn verify_rejects_other_volume() {
		let (_tmp, lock) = lock();
		lock.acquire(Path::new("/media/a")).unwrap();
		assert!(matches!(
			lock.verify(Path::new("/media/b")),
			Err(LockError::WrongVolume { .. })
		));
		assert!(lock.verify(Path::new("/media/a/")).is_ok());
	}

	#[test]
	fn verify_without_session_is_not_active() {
		let (_tmp, lock) = lock();
		assert!(matches!(lock.verify(Path::new("/media/a")), Err(LockError::NotActive)));
		assert_eq!(lock.is_active().unwrap(), None);
	}

	#[test]
	fn verify_and_release_keeps_marker_when_close_fails() {
		let (_tmp, lock) = lock();
		lock.acquire(Path::new("/media/a")).unwrap();

		let result: Result<(), LockError> = lock.verify_and_release(Path::new("/media/a"), |_| Err(LockError::NotActive));
		assert!(result.is_err());
		assert!(lock.marker().exists());

		let volume = lock
			.verify_and_release(Path::new("/media/a"), |session| Ok::<_, LockError>(session.volume.clone()))
			.unwrap();
		assert_eq!(volume, PathBuf::from("/media/a"));
		assert!(!lock.marker().exists());
		lock.acquire(Path::new("/media/b")).unwrap();
	}

	#[test]
	fn garbage_marker_is_inconsistent() {
		let (_tmp, lock) = lock();
		fs::write(lock.marker(), "\n").unwrap();
		assert!(matches!(lock.is_active(), Err(LockError::Inconsistent { .. })));

		fs::write(lock.marker(), "relative/path\n").unwrap();
		assert!(matches!(lock.is_active(), Err(LockError::Inconsistent { .. })));

		match lock.acquire(Path::new("/media/a")) {
			Err(LockError::AlreadyActive { owner }) => assert_eq!(owner, None),
			other => panic!("expected AlreadyActive, got {other:?}"),
		}
	}

	#[test]
	fn release_refuses_replaced_marker() {
		let (_tmp, lock) = lock();
		let session = lock.acquire(Path::new("/media/a")).unwrap();
		fs::write(lock.marker(), "/media/other\n").unwrap();
		assert!(matches!(lock.release(&session), Err(LockError::Inconsistent { .. })));
		assert!(lock.marker().exists());
	}
}
