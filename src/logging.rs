//! `tracing`/`tracing-subscriber` setup (`spec.md` §6, "Persisted state":
//! `<conf_dir>/endpoint.log`), grounded on `vcontrol::server_main`'s
//! `tracing_subscriber::fmt::init()`.

use std::path::Path;

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber that writes to stderr and, best-effort,
/// appends to `<conf_dir>/endpoint.log`. A failure to open the log file is
/// a warning, not fatal — the manager still runs with stderr-only logging.
pub fn init(conf_dir: &Path, log_level: &str) {
    let filter = || EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_path = conf_dir.join("endpoint.log");
    match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            // Leaked deliberately: the guard must outlive the process, and
            // this is a one-time startup call for the life of `main`.
            std::mem::forget(guard);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(writer.and(std::io::stderr))
                .init();
        }
        Err(e) => {
            tracing_subscriber::fmt().with_env_filter(filter()).init();
            tracing::warn!(error = %e, path = %log_path.display(), "could not open endpoint.log; logging to stderr only");
        }
    }
}
