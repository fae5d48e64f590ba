// Logging for taskpool
//
// Built on the `tracing` ecosystem. The pool logs lifecycle edges (start,
// destroy, worker node creation and removal, kill handshakes) at INFO/DEBUG,
// anomalies (task failures, back pressure, timeouts) at WARN and worker
// crashes at ERROR. Nothing is printed until a subscriber is installed,
// either by the application or by one of the `init*` helpers below.
//
// ```rust
// use taskpool::logging;
//
// // INFO level, human readable console output
// logging::init_default();
//
// // Or pick the settings
// logging::init(logging::LogConfig {
//     level: tracing::Level::DEBUG,
//     target_filters: Some("taskpool::pool=trace".to_string()),
//     ..Default::default()
// });
// ```
//
// Worker threads run their own tokio runtime. They inherit the dispatcher
// that was current when the pool spawned them, see `current_subscriber`.

use std::io;
use std::sync::Once;
use tracing::{Level, Subscriber};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub use tracing;

/// Logging configuration.
///
/// # Examples
///
/// ```rust
/// use taskpool::logging::LogConfig;
/// use tracing::Level;
///
/// let config = LogConfig {
///     level: Level::DEBUG,
///     json_format: true,
///     target_filters: Some("taskpool::worker=trace".to_string()),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id, worker threads are named `taskpool-worker-<id>`
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            show_time: true,
            target_filters: None,
        }
    }
}

static INIT: Once = Once::new();

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());
    if let Some(filters) = &config.target_filters {
        for filter in filters.split(',') {
            if let Ok(directive) = filter.trim().parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }
    env_filter
}

/// Installs the global subscriber described by `config`.
///
/// Only the first call of any `init*` function takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(env_filter(&config));

        let subscriber: Box<dyn Subscriber + Send + Sync> = match (config.json_format, config.show_time) {
            (true, _) => Box::new(registry.with(fmt::layer().json().flatten_event(true))),
            (false, true) => Box::new(registry.with(console_layer(&config))),
            (false, false) => Box::new(registry.with(console_layer(&config).without_time())),
        };

        set_global_subscriber(subscriber);
    });
}

fn console_layer<S>(config: &LogConfig) -> fmt::Layer<S>
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(atty::is(atty::Stream::Stdout))
        .with_file(config.show_file_line)
        .with_line_number(config.show_file_line)
        .with_thread_names(config.show_thread_info)
        .with_thread_ids(config.show_thread_info)
}

fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {}", err);
    }
}

/// Opens `path` in append mode, creating it if needed.
pub fn file_writer(path: &str) -> io::Result<Box<dyn io::Write + Send + Sync + 'static>> {
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(file))
}

/// Logs to the console and to `log_file`.
///
/// The file is opened once, up front, so an unwritable path is reported to the caller.
/// File output is always plain text with file, line and thread information.
pub fn init_with_file(config: LogConfig, log_file: &str) -> Result<(), io::Error> {
    // Check the path before installing anything.
    drop(file_writer(log_file)?);

    INIT.call_once(|| {
        let log_file_path = log_file.to_string();
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(move || match file_writer(&log_file_path) {
                Ok(writer) => writer,
                Err(_) => Box::new(io::stderr()),
            })
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_thread_ids(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer(&config))
            .with(file_layer);

        set_global_subscriber(subscriber);
    });

    Ok(())
}

/// INFO level, human readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// DEBUG level for the pool, TRACE for worker threads, file/line information.
pub fn init_development() {
    init(development_config());
}

/// JSON output at INFO level without file/line information.
pub fn init_production() {
    init(production_config());
}

/// WARN level without thread information or timestamps to keep test output readable.
///
/// ```ignore
/// #[tokio::test]
/// async fn test_pool() {
///     taskpool::logging::init_test();
///     // ...
/// }
/// ```
pub fn init_test() {
    init(test_config());
}

pub fn init_development_with_file(path: &str) -> Result<(), io::Error> {
    init_with_file(development_config(), path)
}

pub fn init_production_with_file(path: &str) -> Result<(), io::Error> {
    init_with_file(production_config(), path)
}

fn development_config() -> LogConfig {
    LogConfig {
        level: Level::DEBUG,
        target_filters: Some("taskpool=debug,taskpool::worker=trace".to_string()),
        ..Default::default()
    }
}

fn production_config() -> LogConfig {
    LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        ..Default::default()
    }
}

fn test_config() -> LogConfig {
    LogConfig {
        level: Level::WARN,
        show_thread_info: false,
        show_time: false,
        ..Default::default()
    }
}

/// Span covering a pool-level operation.
///
/// ```rust
/// let span = taskpool::pool_span!("destroy", workers = 4);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! pool_span {
    ($operation:expr) => {
        $crate::logging::tracing::info_span!("pool", operation = $operation)
    };
    ($operation:expr, $($fields:tt)*) => {
        $crate::logging::tracing::info_span!("pool", operation = $operation, $($fields)*)
    };
}

/// Pool lifecycle and scaling events.
#[macro_export]
macro_rules! log_pool {
    ($operation:expr, $status:expr) => {
        $crate::logging::tracing::info!(operation = $operation, status = $status)
    };
    ($operation:expr, $status:expr, $($fields:tt)*) => {
        $crate::logging::tracing::info!(operation = $operation, status = $status, $($fields)*)
    };
}

/// Worker node events, keyed by worker id.
#[macro_export]
macro_rules! log_worker {
    ($worker_id:expr, $event:expr) => {
        $crate::logging::tracing::debug!(worker_id = $worker_id, event = $event)
    };
    ($worker_id:expr, $event:expr, $($fields:tt)*) => {
        $crate::logging::tracing::debug!(worker_id = $worker_id, event = $event, $($fields)*)
    };
}

/// Task routing events, keyed by task function name.
#[macro_export]
macro_rules! log_task {
    ($task_name:expr, $status:expr) => {
        $crate::logging::tracing::trace!(task = $task_name, status = $status)
    };
    ($task_name:expr, $status:expr, $($fields:tt)*) => {
        $crate::logging::tracing::trace!(task = $task_name, status = $status, $($fields)*)
    };
}

/// Error conditions, the error is recorded with its `Display` form.
#[macro_export]
macro_rules! log_error {
    ($error:expr) => {
        $crate::logging::tracing::error!(error = %$error)
    };
    ($error:expr, $($fields:tt)*) => {
        $crate::logging::tracing::error!(error = %$error, $($fields)*)
    };
}

/// Dispatcher current on the calling thread.
///
/// Worker threads install it as their default so their events reach the
/// same subscriber as the pool's.
#[inline]
pub fn current_subscriber() -> tracing::Dispatch {
    tracing::dispatcher::get_default(|dispatch| dispatch.clone())
}
