use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use extvol::handlers::{HANDLERS, HandlerFailure};
use tracing::info;

use super::{Context, blocking};
use crate::error::Result;
use crate::output::{
	CloseData, DiagnosticLevel, HandlerEntry, HandlerFailureData, HandlersData, OpenData, OutputFormat,
	ResultBuilder, StatusData, print_result,
};

pub(super) async fn open(ctx: Context, mountpoint: PathBuf, format: OutputFormat) -> Result<()> {
	let lock_marker = ctx.layout.lock_marker.clone();
	let report = blocking(move || Ok(ctx.orchestrator()?.open(&mountpoint)?)).await?;

	let started_at = report
		.session
		.started_at
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default();
	let mut builder = ResultBuilder::new("open");
	builder = with_failures(builder, &report.failures);
	if let Some(err) = &report.snapshot_error {
		builder = builder.diagnostic_with_source(
			DiagnosticLevel::Warning,
			format!("settings will only be saved at close: {err}"),
			"snapshot",
		);
	}

	let result = builder
		.data(OpenData {
			volume: report.session.volume.clone(),
			lock_marker,
			started_at,
			snapshotter_pid: report.snapshotter,
			failures: report.failures.iter().map(failure_data).collect(),
		})
		.build();
	print_result(&result, format);
	Ok(())
}

pub(super) async fn close(ctx: Context, mountpoint: PathBuf, format: OutputFormat) -> Result<()> {
	let requested = mountpoint.clone();
	let report = match blocking(move || Ok(ctx.orchestrator()?.close(&mountpoint)?)).await {
		Ok(report) => report,
		Err(err) if err.is_close_skip() => {
			info!(target: "extvol.session", volume = %requested.display(), reason = %err, "close skipped");
			let result = ResultBuilder::new("close")
				.data(CloseData {
					volume: requested,
					closed: false,
					snapshotter_stopped: false,
					unmounted: false,
					failures: Vec::new(),
				})
				.diagnostic(DiagnosticLevel::Warning, format!("nothing to close: {err}"))
				.build();
			print_result(&result, format);
			return Ok(());
		}
		Err(err) => return Err(err),
	};

	let mut builder = with_failures(ResultBuilder::new("close"), &report.failures);
	if let Some(err) = &report.snapshot_error {
		builder = builder.diagnostic_with_source(DiagnosticLevel::Warning, err.to_string(), "snapshot");
	}
	if let Some(err) = &report.unmount_error {
		builder = builder.diagnostic_with_source(
			DiagnosticLevel::Error,
			format!("session closed but the volume is still mounted: {err}"),
			"unmount",
		);
	}

	let result = builder
		.data(CloseData {
			volume: report.volume.clone(),
			closed: true,
			snapshotter_stopped: report.snapshotter_stopped,
			unmounted: report.unmount_error.is_none(),
			failures: report.failures.iter().map(failure_data).collect(),
		})
		.build();
	print_result(&result, format);
	Ok(())
}

pub(super) fn status(ctx: &Context, format: OutputFormat) -> Result<()> {
	let status = ctx.orchestrator()?.status()?;
	let result = ResultBuilder::new("status")
		.data(StatusData {
			active: status.owner.is_some(),
			volume: status.owner,
			lock_marker: ctx.layout.lock_marker.clone(),
			snapshotter_pid: status.snapshotter,
		})
		.build();
	print_result(&result, format);
	Ok(())
}

pub(super) fn handlers(ctx: &Context, format: OutputFormat) -> Result<()> {
	let handlers = HANDLERS
		.iter()
		.enumerate()
		.map(|(i, h)| HandlerEntry {
			order: i + 1,
			name: h.name.to_string(),
			enabled: ctx.config.handler_enabled(h.name),
		})
		.collect();
	let result = ResultBuilder::new("handlers").data(HandlersData { handlers }).build();
	print_result(&result, format);
	Ok(())
}

fn failure_data(failure: &HandlerFailure) -> HandlerFailureData {
	HandlerFailureData {
		handler: failure.handler.to_string(),
		phase: failure.phase.to_string(),
		errors: failure.messages(),
	}
}

fn with_failures<T: serde::Serialize>(mut builder: ResultBuilder<T>, failures: &[HandlerFailure]) -> ResultBuilder<T> {
	for failure in failures {
		builder = builder.diagnostic_with_source(DiagnosticLevel::Warning, failure.messages().join("; "), failure.handler);
	}
	builder
}
