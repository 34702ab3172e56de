//! Result envelope shared by every command.
//!
//! On success:
//!
//! ```json
//! {
//!   "schemaVersion": 1,
//!   "ok": true,
//!   "command": "open",
//!   "data": { ... },
//!   "diagnostics": [{ "level": "warning", "message": "..." }]
//! }
//! ```
//!
//! On failure `data` is replaced by
//! `"error": { "code": "SESSION_ACTIVE", "message": "...", "details": { ... } }`.


use std::io::{self, Write};
use std::path::PathBuf;

use colored::Colorize;
use serde::{Deserialize, Serialize};

/// Bumped on breaking changes to the envelope.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
	/// Human-readable text
	#[default]
	Text,
	/// Pretty-printed JSON envelope
	Json,
}

impl std::str::FromStr for OutputFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"text" => Ok(OutputFormat::Text),
			"json" => Ok(OutputFormat::Json),
			_ => Err(format!("unknown format: {s}")),
		}
	}
}

impl std::fmt::Display for OutputFormat {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			OutputFormat::Text => write!(f, "text"),
			OutputFormat::Json => write!(f, "json"),
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult<T: Serialize> {
	pub schema_version: u32,

	pub ok: bool,

	pub command: String,

	/// Present on success only.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<T>,

	/// Present on failure only.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<CommandError>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
	pub code: ErrorCode,

	pub message: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<serde_json::Value>,
}

/// Stable error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	/// Another volume holds the session lock
	SessionActive,
	/// The session belongs to a different volume
	WrongVolume,
	/// The path is not a mountpoint
	NotMounted,
	/// No session is active
	NoSession,
	/// Free space on the volume is below the floor and opening was not confirmed
	LowFreeSpace,
	/// The user declined a confirmation
	Declined,
	/// Processes still hold files on the volume
	OpenFiles,
	/// The lock marker needs manual attention
	LockInconsistent,
	/// The snapshotter could not be started, stopped or signalled
	SnapshotFailed,
	/// File or process I/O failed
	IoError,
	/// Invalid input provided
	InvalidInput,
	/// Unknown/internal error
	InternalError,
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let code = match self {
			ErrorCode::SessionActive => "SESSION_ACTIVE",
			ErrorCode::WrongVolume => "WRONG_VOLUME",
			ErrorCode::NotMounted => "NOT_MOUNTED",
			ErrorCode::NoSession => "NO_SESSION",
			ErrorCode::LowFreeSpace => "LOW_FREE_SPACE",
			ErrorCode::Declined => "DECLINED",
			ErrorCode::OpenFiles => "OPEN_FILES",
			ErrorCode::LockInconsistent => "LOCK_INCONSISTENT",
			ErrorCode::SnapshotFailed => "SNAPSHOT_FAILED",
			ErrorCode::IoError => "IO_ERROR",
			ErrorCode::InvalidInput => "INVALID_INPUT",
			ErrorCode::InternalError => "INTERNAL_ERROR",
		};
		f.write_str(code)
	}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
	pub level: DiagnosticLevel,

	pub message: String,

	/// Handler or component the diagnostic came from.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
	Info,
	Warning,
	Error,
}

pub struct ResultBuilder<T: Serialize> {
	command: String,
	data: Option<T>,
	error: Option<CommandError>,
	diagnostics: Vec<Diagnostic>,
}

impl<T: Serialize> ResultBuilder<T> {
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			data: None,
			error: None,
			diagnostics: Vec::new(),
		}
	}

	pub fn data(mut self, data: T) -> Self {
		self.data = Some(data);
		self
	}

	pub fn error(mut self, code: ErrorCode, message: impl Into<String>) -> Self {
		self.error = Some(CommandError {
			code,
			message: message.into(),
			details: None,
		});
		self
	}

	/// Sets an already converted error, details included.
	pub fn failure(mut self, error: CommandError) -> Self {
		self.error = Some(error);
		self
	}

	pub fn diagnostic(mut self, level: DiagnosticLevel, message: impl Into<String>) -> Self {
		self.diagnostics.push(Diagnostic {
			level,
			message: message.into(),
			source: None,
		});
		self
	}

	pub fn diagnostic_with_source(
		mut self,
		level: DiagnosticLevel,
		message: impl Into<String>,
		source: impl Into<String>,
	) -> Self {
		self.diagnostics.push(Diagnostic {
			level,
			message: message.into(),
			source: Some(source.into()),
		});
		self
	}

	pub fn build(self) -> CommandResult<T> {
		let ok = self.error.is_none() && self.data.is_some();
		CommandResult {
			schema_version: SCHEMA_VERSION,
			ok,
			command: self.command,
			data: self.data,
			error: self.error,
			diagnostics: self.diagnostics,
		}
	}
}

/// Prints a command result to stdout in the requested format.
pub fn print_result<T: Serialize>(result: &CommandResult<T>, format: OutputFormat) {
	match format {
		OutputFormat::Json => {
			if let Ok(json) = serde_json::to_string_pretty(result) {
				println!("{json}");
			}
		}
		OutputFormat::Text => print_result_text(result),
	}
}

fn print_result_text<T: Serialize>(result: &CommandResult<T>) {
	let mut stdout = io::stdout().lock();

	if result.ok {
		if let Some(ref data) = result.data {
			if let Ok(value) = serde_json::to_value(data) {
				write_text_value(&mut stdout, &value, 0);
			}
		}
	} else if let Some(ref error) = result.error {
		let _ = writeln!(stdout, "Error [{}]: {}", error.code, error.message);
	}

	for diag in &result.diagnostics {
		let prefix = match diag.level {
			DiagnosticLevel::Info => "info".normal(),
			DiagnosticLevel::Warning => "warning".yellow(),
			DiagnosticLevel::Error => "error".red(),
		};
		match diag.source {
			Some(ref source) => {
				let _ = writeln!(stdout, "[{prefix}:{source}] {}", diag.message);
			}
			None => {
				let _ = writeln!(stdout, "[{prefix}] {}", diag.message);
			}
		}
	}
}

/// Writes `value` as indented `key: value` lines.
fn write_text_value(out: &mut impl Write, value: &serde_json::Value, depth: usize) {
	use serde_json::Value;

	let indent = "  ".repeat(depth);
	match value {
		Value::Object(map) => {
			for (key, value) in map {
				match value {
					Value::Null => {}
					Value::Object(_) | Value::Array(_) => {
						let _ = writeln!(out, "{indent}{}:", key.bold());
						write_text_value(out, value, depth + 1);
					}
					scalar => {
						let _ = writeln!(out, "{indent}{}: {}", key.bold(), scalar_text(scalar));
					}
				}
			}
		}
		Value::Array(items) => {
			for item in items {
				match item {
					Value::Object(_) | Value::Array(_) => {
						let _ = writeln!(out, "{indent}-");
						write_text_value(out, item, depth + 1);
					}
					scalar => {
						let _ = writeln!(out, "{indent}- {}", scalar_text(scalar));
					}
				}
			}
		}
		scalar => {
			let _ = writeln!(out, "{indent}{}", scalar_text(scalar));
		}
	}
}

fn scalar_text(value: &serde_json::Value) -> String {
	match value {
		serde_json::Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

/// Prints an error to stderr in human-readable form.
pub fn print_error_stderr(error: &CommandError) {
	eprintln!("{} [{}]: {}", "Error".red().bold(), error.code, error.message);
	if let Some(paths) = error.details.as_ref().and_then(|d| d.get("paths")).and_then(|p| p.as_array()) {
		for path in paths.iter().filter_map(|p| p.as_str()) {
			eprintln!("  {path}");
		}
	}
}

/// One handler that reported failures during open or close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerFailureData {
	pub handler: String,
	pub phase: String,
	pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenData {
	pub volume: PathBuf,
	pub lock_marker: PathBuf,
	pub started_at: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub snapshotter_pid: Option<u32>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub failures: Vec<HandlerFailureData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseData {
	pub volume: PathBuf,
	/// False when the close was skipped because the request targeted nothing to close.
	pub closed: bool,
	pub snapshotter_stopped: bool,
	pub unmounted: bool,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub failures: Vec<HandlerFailureData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
	pub active: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub volume: Option<PathBuf>,
	pub lock_marker: PathBuf,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub snapshotter_pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerEntry {
	pub order: usize,
	pub name: String,
	pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlersData {
	pub handlers: Vec<HandlerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotAction {
	Start,
	Run,
	Stop,
	Dump,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
	pub action: SnapshotAction,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pid: Option<u32>,
	/// Whether a snapshotter was running to act on.
	pub running: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub target: Option<PathBuf>,
}
