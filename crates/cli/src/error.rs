use std::path::PathBuf;

use extvol::snapshot::SnapshotError;
use extvol::{Error as SessionError, Precondition};
use serde_json::json;
use thiserror::Error;

use crate::output::{CommandError, ErrorCode};

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	#[error(transparent)]
	Session(#[from] SessionError),

	#[error(transparent)]
	Snapshot(#[from] SnapshotError),

	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("invalid configuration: {source}")]
	Config {
		path: PathBuf,
		#[source]
		source: SessionError,
	},

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

impl CliError {
	/// The precondition behind this error, if it is one.
	pub fn precondition(&self) -> Option<&Precondition> {
		match self {
			CliError::Session(err) => err.precondition(),
			_ => None,
		}
	}

	/// Whether a close request should report this and still succeed.
	pub fn is_close_skip(&self) -> bool {
		self.precondition().is_some_and(Precondition::is_close_skip)
	}

	pub fn to_command_error(&self) -> CommandError {
		let (code, details) = match self {
			CliError::Session(err) => session_code(err),
			CliError::Snapshot(err) => (ErrorCode::SnapshotFailed, snapshot_details(err)),
			CliError::InvalidInput(_) => (ErrorCode::InvalidInput, None),
			CliError::Config { path, .. } => (ErrorCode::InvalidInput, Some(json!({ "path": path }))),
			CliError::Io(_) => (ErrorCode::IoError, None),
			CliError::Anyhow(_) => (ErrorCode::InternalError, None),
		};
		CommandError {
			code,
			message: self.to_string(),
			details,
		}
	}
}

fn session_code(err: &SessionError) -> (ErrorCode, Option<serde_json::Value>) {
	match err {
		SessionError::PreconditionFailed(p) => precondition_code(p),
		SessionError::LockInconsistent { path, reason } => (
			ErrorCode::LockInconsistent,
			Some(json!({ "path": path, "reason": reason })),
		),
		SessionError::Snapshot(err) => (ErrorCode::SnapshotFailed, snapshot_details(err)),
		SessionError::Host(_) | SessionError::Io(_) => (ErrorCode::IoError, None),
	}
}

fn precondition_code(p: &Precondition) -> (ErrorCode, Option<serde_json::Value>) {
	match p {
		Precondition::AlreadyActive { owner } => (ErrorCode::SessionActive, owner.as_ref().map(|o| json!({ "owner": o }))),
		Precondition::WrongVolume { owner, requested } => (
			ErrorCode::WrongVolume,
			Some(json!({ "owner": owner, "requested": requested })),
		),
		Precondition::NoSession => (ErrorCode::NoSession, None),
		Precondition::NotMounted(path) => (ErrorCode::NotMounted, Some(json!({ "path": path }))),
		Precondition::LowFreeSpace { volume, free, floor } => (
			ErrorCode::LowFreeSpace,
			Some(json!({ "volume": volume, "freeBytes": free, "floorBytes": floor })),
		),
		Precondition::Declined(_) => (ErrorCode::Declined, None),
		Precondition::OpenFiles { mountpoint, paths } => (
			ErrorCode::OpenFiles,
			Some(json!({ "mountpoint": mountpoint, "paths": paths })),
		),
	}
}

fn snapshot_details(err: &SnapshotError) -> Option<serde_json::Value> {
	match err {
		SnapshotError::AlreadyRunning { pid } => Some(json!({ "pid": pid })),
		SnapshotError::StartTimeout { log, .. } => Some(json!({ "log": log })),
		SnapshotError::StopTimeout { pid, .. } => Some(json!({ "pid": pid })),
		_ => None,
	}
}
