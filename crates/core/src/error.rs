use std::path::PathBuf;

use thiserror::Error;

use crate::host::HostError;
use crate::lock::LockError;
use crate::snapshot::SnapshotError;

pub type Result<T> = std::result::Result<T, Error>;

/// A gate that refused a session transition before anything was mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Precondition {
	#[error("a session is already active{}", owner_suffix(.owner))]
	AlreadyActive { owner: Option<PathBuf> },

	#[error("session belongs to {owner}, not {requested}")]
	WrongVolume { owner: PathBuf, requested: PathBuf },

	#[error("no session is active")]
	NoSession,

	#[error("{0} is not a mountpoint")]
	NotMounted(PathBuf),

	#[error("only {free} bytes free on {volume} (floor is {floor})")]
	LowFreeSpace { volume: PathBuf, free: u64, floor: u64 },

	#[error("opening {0} was declined")]
	Declined(PathBuf),

	#[error("{} open file(s) under {mountpoint}", paths.len())]
	OpenFiles { mountpoint: PathBuf, paths: Vec<PathBuf> },
}

fn owner_suffix(owner: &Option<PathBuf>) -> String {
	match owner {
		Some(path) => format!(" for {}", path.display()),
		None => String::new(),
	}
}

impl Precondition {
	/// Close requests that target nothing to close are reported, not escalated.
	pub fn is_close_skip(&self) -> bool {
		matches!(
			self,
			Precondition::WrongVolume { .. } | Precondition::NoSession | Precondition::NotMounted(_)
		)
	}
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("precondition failed: {0}")]
	PreconditionFailed(#[from] Precondition),

	/// The lock marker is unreadable or could not be removed. Needs a human.
	#[error("lock marker {path} is inconsistent: {reason}")]
	LockInconsistent { path: PathBuf, reason: String },

	#[error(transparent)]
	Snapshot(#[from] SnapshotError),

	#[error(transparent)]
	Host(#[from] HostError),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl From<LockError> for Error {
	fn from(err: LockError) -> Self {
		match err {
			LockError::AlreadyActive { owner } => Precondition::AlreadyActive { owner }.into(),
			LockError::WrongVolume { owner, requested } => Precondition::WrongVolume { owner, requested }.into(),
			LockError::NotActive => Precondition::NoSession.into(),
			LockError::Inconsistent { path, reason } => Error::LockInconsistent { path, reason },
			LockError::Io(err) => Error::Io(err),
		}
	}
}

impl Error {
	pub fn precondition(&self) -> Option<&Precondition> {
		match self {
			Error::PreconditionFailed(p) => Some(p),
			_ => None,
		}
	}
}
