use std::path::Path;

use anyhow::Result;
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

/// Target of the per-pipeline lifecycle events written to the JSON event log.
pub const PIPELINE_TARGET: &str = "pipeline";

/// Initialize logging.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"`) for the text log
///   and stdout.
/// - `log_file` is the daily-rolled text log under `log_dir`.
/// - `event_file` receives one JSON line per pipeline lifecycle event
///   (target = `pipeline`), whatever `log_level` says.
pub fn init_tracing(log_dir: &Path, log_file: &str, event_file: &str, log_level: &str) -> Result<()> {
    subscriber(log_dir, log_file, event_file, log_level)?.try_init()?;
    Ok(())
}

/// The subscriber behind [`init_tracing`], without installing it.
pub fn subscriber(
    log_dir: &Path,
    log_file: &str,
    event_file: &str,
    log_level: &str,
) -> Result<impl Subscriber + Send + Sync + 'static> {
    std::fs::create_dir_all(log_dir)?;

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, log_file);
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    let json_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, event_file);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{PIPELINE_TARGET}=info")));

    let stdout_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(log_level));

    Ok(Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .with(stdout_layer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing::{Level, event, info, warn};

    fn read_logs(dir: &Path, prefix: &str) -> String {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(prefix))
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect()
    }

    #[test]
    fn test_pipeline_events_survive_quiet_log_level() {
        let dir = tempdir().unwrap();
        let sub = subscriber(dir.path(), "bot.log", "events.log", "warn").unwrap();
        tracing::subscriber::with_default(sub, || {
            event!(target: PIPELINE_TARGET, Level::INFO, pipeline = "q1", event = "started");
            info!("chatter");
            warn!("trouble");
        });

        let events = read_logs(dir.path(), "events.log");
        assert!(events.contains("\"pipeline\":\"q1\""));
        assert!(!events.contains("chatter"));

        let text = read_logs(dir.path(), "bot.log");
        assert!(text.contains("trouble"));
        assert!(!text.contains("chatter"));
        assert!(!text.contains("q1"));
    }
}
