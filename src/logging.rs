use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Global crash log directory, set during init.
static CRASH_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize tracing with stdout, a daily rolling file, and Sentry layers.
///
/// - Stdout: compact, human-readable
/// - File: `<data_dir>/logs/buildloop.log.YYYY-MM-DD`, non-blocking
/// - Sentry: ERROR events become issues, WARN become breadcrumbs
/// - Default level: INFO, override via RUST_LOG
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init(data_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,buildloop=debug"));

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "buildloop.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer).json();

    // No-op when Sentry DSN is not configured.
    let sentry_layer = sentry_tracing::layer().event_filter(|meta| match *meta.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(sentry_layer)
        .init();

    tracing::debug!(data_dir = %data_dir.display(), "Tracing initialized");
    guard
}

/// Install a panic hook that writes crash details to a file before
/// delegating to the previous hook.
pub fn install_crash_hook(data_dir: &Path) {
    if std::env::var("RUST_BACKTRACE").is_err() {
        std::env::set_var("RUST_BACKTRACE", "full");
    }

    let crash_dir = data_dir.join("crash_logs");
    if let Err(e) = std::fs::create_dir_all(&crash_dir) {
        tracing::warn!(error = %e, "Could not create crash log directory");
    }
    CRASH_LOG_DIR.set(crash_dir).ok();

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(dir) = CRASH_LOG_DIR.get() {
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let path = dir.join(format!("crash_{}.log", timestamp));

            let mut report = format!(
                "=== BUILDLOOP CRASH REPORT ===\nTime: {}\nVersion: {}\n\n",
                chrono::Local::now().to_rfc3339(),
                env!("CARGO_PKG_VERSION"),
            );

            if let Some(msg) = info.payload().downcast_ref::<&str>() {
                report.push_str(&format!("Panic: {}\n", msg));
            } else if let Some(msg) = info.payload().downcast_ref::<String>() {
                report.push_str(&format!("Panic: {}\n", msg));
            } else {
                report.push_str("Panic: <unknown payload>\n");
            }

            if let Some(loc) = info.location() {
                report.push_str(&format!("Location: {}:{}:{}\n", loc.file(), loc.line(), loc.column()));
            }

            report.push_str(&format!("\nBacktrace:\n{}\n", std::backtrace::Backtrace::force_capture()));

            let thread = std::thread::current();
            report.push_str(&format!("\nThread: {:?} (id: {:?})\n", thread.name(), thread.id()));

            let _ = std::fs::write(&path, &report);
            eprintln!("[CRASH] Report written to: {}", path.display());
        }

        prev_hook(info);
    }));

    tracing::info!("Crash hook installed");
}

/// Crash reports on disk, most recent first, at most `limit`.
pub fn read_crash_logs(data_dir: &Path, limit: usize) -> Vec<CrashLogEntry> {
    let crash_dir = data_dir.join("crash_logs");
    let mut entries = Vec::new();

    if let Ok(dir) = std::fs::read_dir(&crash_dir) {
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "log").unwrap_or(false) {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    entries.push(CrashLogEntry {
                        filename: path.file_name().unwrap_or_default().to_string_lossy().into(),
                        content,
                    });
                }
            }
        }
    }

    // Filenames carry timestamps.
    entries.sort_by(|a, b| b.filename.cmp(&a.filename));
    entries.truncate(limit);
    entries
}

#[derive(serde::Serialize, Clone)]
pub struct CrashLogEntry {
    pub filename: String,
    pub content: String,
}
