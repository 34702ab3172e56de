use std::path::PathBuf;
use std::time::Duration;

use extvol::handlers::SNAPSHOT_KEYS;
use extvol::settings::SettingsBridge;
use extvol::snapshot::{self, PidMarker, SnapshotControl};
use tracing::warn;

use super::{Context, blocking};
use crate::cli::{SnapshotArgs, SnapshotMode};
use crate::error::Result;
use crate::output::{DiagnosticLevel, OutputFormat, ResultBuilder, SnapshotAction, SnapshotData, print_result};

pub(super) async fn run(ctx: Context, args: SnapshotArgs, format: OutputFormat) -> Result<()> {
	if !args.extra.is_empty() {
		warn!(target: "extvol.snapshot", ignored = ?args.extra, "ignoring unrecognised options");
	}

	let data = match args.mode() {
		SnapshotMode::Stop => {
			let control = ctx.snapshotter()?;
			let stopped = blocking(move || Ok(control.stop()?)).await?;
			SnapshotData {
				action: SnapshotAction::Stop,
				pid: None,
				running: stopped,
				target: None,
			}
		}
		SnapshotMode::Dump => {
			let pid = ctx.snapshotter()?.force_dump()?;
			SnapshotData {
				action: SnapshotAction::Dump,
				pid,
				running: pid.is_some(),
				target: None,
			}
		}
		SnapshotMode::Start => {
			let target = resolve_target(args.target)?;
			let control = ctx.snapshotter()?;
			let dir = target.clone();
			let pid = blocking(move || Ok(control.start(&dir)?)).await?;
			SnapshotData {
				action: SnapshotAction::Start,
				pid: Some(pid),
				running: true,
				target: Some(target),
			}
		}
		SnapshotMode::Foreground => {
			let target = resolve_target(args.target)?;
			snapshot::run_daemon(
				target.clone(),
				Duration::from_secs(ctx.config.snapshot_interval_secs.max(1)),
				PidMarker::new(&ctx.layout.snapshot_pid),
				SettingsBridge::new(&ctx.config.tools),
				SNAPSHOT_KEYS,
			)
			.await?;
			SnapshotData {
				action: SnapshotAction::Run,
				pid: Some(std::process::id()),
				running: false,
				target: Some(target),
			}
		}
	};

	let mut builder = ResultBuilder::new("snapshot");
	if !data.running && matches!(data.action, SnapshotAction::Stop | SnapshotAction::Dump) {
		builder = builder.diagnostic(DiagnosticLevel::Info, "no snapshotter is running");
	}
	print_result(&builder.data(data).build(), format);
	Ok(())
}

/// Absolute dump directory; the detached child runs from the runtime directory.
fn resolve_target(target: Option<PathBuf>) -> Result<PathBuf> {
	let cwd = std::env::current_dir()?;
	Ok(match target {
		Some(dir) if dir.is_absolute() => dir,
		Some(dir) => cwd.join(dir),
		None => cwd,
	})
}
