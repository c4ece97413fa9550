use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target carrying one record per HTTP request.
pub const ACCESS_TARGET: &str = "http.access";

static ACCESS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

/// Rolling file sink for the access log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessLogFile {
    pub dir: String,
    pub prefix: String,
    pub rotation: Rotation,
}

impl AccessLogFile {
    /// `None` unless `LOOPGATE_ACCESS_LOG_ROLL=1`.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Option<Self> {
        if get("LOOPGATE_ACCESS_LOG_ROLL").as_deref() != Some("1") {
            return None;
        }
        let dir = get("LOOPGATE_ACCESS_LOG_DIR")
            .or_else(|| get("LOOPGATE_LOGS_DIR"))
            .unwrap_or_else(|| "logs".to_string());
        let prefix = get("LOOPGATE_ACCESS_LOG_PREFIX").unwrap_or_else(|| "http-access".into());
        let rotation = match get("LOOPGATE_ACCESS_LOG_ROTATION")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        };
        Some(Self {
            dir,
            prefix,
            rotation,
        })
    }

    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Install the global subscriber: console output filtered by `RUST_LOG`
/// (default `info`), plus the rolling access log when enabled.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));

    let Some(file) = AccessLogFile::from_env() else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&file.dir).is_err() {
        eprintln!("failed to create access log directory {}", file.dir);
    }
    let writer = match file.rotation {
        Rotation::Hourly => tracing_appender::rolling::hourly(&file.dir, &file.prefix),
        Rotation::Minutely => tracing_appender::rolling::minutely(&file.dir, &file.prefix),
        Rotation::Daily => tracing_appender::rolling::daily(&file.dir, &file.prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = ACCESS_GUARD.set(guard);
    let access_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(nb)
        .with_filter(Targets::new().with_target(ACCESS_TARGET, tracing::Level::INFO));
    let _ = registry.with(access_layer).try_init();
    tracing::debug!(dir = %file.dir, "access log file enabled");
}
