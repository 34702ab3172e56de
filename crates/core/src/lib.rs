//! Session orchestration for portable configuration volumes.
//!
//! While a volume is attached, a fixed catalogue of configuration paths under
//! the user's home directory is redirected onto it and external settings trees
//! are loaded from dumps stored on it. Closing the session reverses every
//! redirection, writes the settings back, and releases the system-wide lock.
//!
//! The pieces, leaf first:
//!
//! - [`redirect::PathRedirector`] swaps a home path for a symlink into the volume.
//! - [`settings::SettingsBridge`] dumps and loads settings trees through external tools.
//! - [`lock::SessionLock`] guards the single system-wide session.
//! - [`handlers::HANDLERS`] is the ordered catalogue of subsystem open/close actions.
//! - [`snapshot`] runs the periodic settings snapshotter as a separate process.
//! - [`orchestrator::Orchestrator`] drives the whole open/close sequence.

pub mod config;
pub mod error;
pub mod handlers;
pub mod host;
pub mod lock;
pub mod orchestrator;
pub mod redirect;
pub mod settings;
pub mod snapshot;

pub use config::{ExtvolConfig, Layout};
pub use error::{Error, Precondition, Result};
pub use lock::{Session, SessionLock};
pub use orchestrator::{CloseReport, OpenReport, Orchestrator, SessionState, Status};
