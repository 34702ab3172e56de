//! Command dispatch and the shared per-invocation context.

mod session;
mod snapshot;

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use extvol::host::SystemHost;
use extvol::snapshot::DetachedSnapshotter;
use extvol::{ExtvolConfig, Layout, Orchestrator};
use tracing::debug;

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};
use crate::prompt::TerminalGate;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "EXTVOL_CONFIG";

pub async fn dispatch(cli: Cli) -> Result<()> {
	let format = cli.format;
	let ctx = Context::load(cli.config, cli.yes)?;

	match cli.command {
		Commands::Open(args) => session::open(ctx, args.mountpoint, format).await,
		Commands::Close(args) => session::close(ctx, args.mountpoint, format).await,
		Commands::Status => session::status(&ctx, format),
		Commands::Handlers => session::handlers(&ctx, format),
		Commands::Snapshot(args) => snapshot::run(ctx, args, format).await,
	}
}

/// Configuration and resolved paths for one invocation.
#[derive(Debug, Clone)]
pub struct Context {
	pub config: ExtvolConfig,
	pub config_path: PathBuf,
	pub layout: Layout,
	pub assume_yes: bool,
}

impl Context {
	pub fn load(explicit: Option<PathBuf>, assume_yes: bool) -> Result<Self> {
		let config_path = config_path(explicit, std::env::var_os(CONFIG_ENV), dirs::config_dir())
			.ok_or_else(|| CliError::InvalidInput(format!("no configuration directory; pass --config or set {CONFIG_ENV}")))?;
		let config = ExtvolConfig::load(&config_path).map_err(|source| CliError::Config {
			path: config_path.clone(),
			source,
		})?;

		let home = match (&config.home, dirs::home_dir()) {
			(Some(home), _) => home.clone(),
			(None, Some(home)) => home,
			(None, None) => {
				return Err(CliError::InvalidInput(
					"cannot determine the home directory; set `home` in the configuration".into(),
				));
			}
		};
		let layout = config.layout(home, extvol::config::default_runtime_dir());
		debug!(
			target: "extvol.config",
			config = %config_path.display(),
			home = %layout.home.display(),
			runtime = %layout.runtime_dir.display(),
			"configuration loaded"
		);

		Ok(Self {
			config,
			config_path,
			layout,
			assume_yes,
		})
	}

	/// Snapshot control that re-executes this binary as the detached snapshotter.
	pub fn snapshotter(&self) -> Result<DetachedSnapshotter> {
		let exe = std::env::current_exe()?;
		Ok(DetachedSnapshotter::new(exe, &self.layout)
			.config_file(Some(self.config_path.clone()))
			.stop_timeout(Duration::from_millis(self.config.snapshot_stop_timeout_ms)))
	}

	pub fn orchestrator(&self) -> Result<Orchestrator> {
		let host = SystemHost::new(self.config.tools.unmount.clone(), self.config.require_mountpoint);
		Ok(Orchestrator::new(
			self.config.clone(),
			self.layout.clone(),
			Box::new(host),
			Box::new(TerminalGate::new(self.assume_yes)),
			Box::new(self.snapshotter()?),
		))
	}
}

/// `--config`, then the environment, then `<config dir>/extvol/config.json`.
fn config_path(explicit: Option<PathBuf>, env: Option<OsString>, config_dir: Option<PathBuf>) -> Option<PathBuf> {
	explicit
		.or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
		.or_else(|| config_dir.map(|dir| dir.join("extvol").join("config.json")))
}

/// Runs blocking session work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
	T: Send + 'static,
	F: FnOnce() -> Result<T> + Send + 'static,
{
	tokio::task::spawn_blocking(work)
		.await
		.map_err(|err| anyhow::anyhow!("worker task failed: {err}"))?
}
