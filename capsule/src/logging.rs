//! Control-plane logging setup.

use std::sync::OnceLock;

use capsule_shared::CapsuleResult;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::runtime::FilesystemLayout;

/// Keeps the non-blocking writer flushing for the lifetime of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install a daily-rolling file logger under `<home>/logs`.
///
/// Filtering follows `RUST_LOG` (default `info`). If the embedding application
/// already installed a global subscriber, that subscriber is left in place.
pub fn init_logging_for(layout: &FilesystemLayout) -> CapsuleResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    std::fs::create_dir_all(layout.logs_dir())?;

    let appender = tracing_appender::rolling::daily(layout.logs_dir(), "capsule.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()
        .is_ok();

    if installed {
        let _ = LOG_GUARD.set(guard);
        tracing::debug!(logs_dir = %layout.logs_dir().display(), "Logging initialized");
    }

    Ok(())
}
