//! Structured logging and the per-instance log sink.
//!
//! `tracing` is the only logging API used in the crate. Events carrying an
//! `instance_id` field are additionally captured into a [`LogBuffer`] by
//! [`LogCaptureLayer`], which is what the administrative log endpoints read.
//! The buffer is process-scoped state installed with [`register_sink`] and
//! removed when the returned guard drops.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Layer, Registry};

use crate::error::{HubError, Result};

/// Entries kept per instance before the oldest are dropped.
pub const LOG_CAPACITY: usize = 1000;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// Output format of the process log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    /// Pretty on a terminal, JSON otherwise.
    #[default]
    Auto,
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Bounded per-instance log rings.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    rings: Mutex<HashMap<String, VecDeque<LogEntry>>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<LogEntry>>> {
        self.rings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Entries without an instance id are not kept.
    pub fn push(&self, entry: LogEntry) {
        let Some(instance_id) = entry.instance_id.clone().filter(|id| !id.is_empty()) else {
            return;
        };
        let mut rings = self.lock();
        let ring = rings.entry(instance_id).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Oldest first, optionally only entries at or above `min_level`.
    pub fn query(&self, instance_id: &str, min_level: Option<LogLevel>) -> Vec<LogEntry> {
        self.lock()
            .get(instance_id)
            .map(|ring| {
                ring.iter()
                    .filter(|entry| min_level.map_or(true, |min| entry.level >= min))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns how many entries were dropped.
    pub fn clear(&self, instance_id: &str) -> usize {
        self.lock()
            .remove(instance_id)
            .map(|ring| ring.len())
            .unwrap_or_default()
    }
}

static SINK: RwLock<Option<Arc<LogBuffer>>> = RwLock::new(None);

/// Keeps a sink registered; dropping it deregisters the sink unless another
/// one has replaced it in the meantime.
#[must_use = "the sink is deregistered when the guard drops"]
pub struct SinkGuard {
    buffer: Arc<LogBuffer>,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        let mut sink = SINK.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if sink
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.buffer))
        {
            *sink = None;
        }
    }
}

pub fn register_sink(buffer: Arc<LogBuffer>) -> SinkGuard {
    *SINK.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&buffer));
    SinkGuard { buffer }
}

pub fn current_sink() -> Option<Arc<LogBuffer>> {
    SINK.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Record a log line for an instance. Never blocks on I/O and never fails.
pub fn emit(level: LogLevel, category: &str, message: impl Into<String>, instance_id: Option<&str>) {
    let message = message.into();
    // Mirrored under `instance` so the capture layer does not store it twice.
    match level {
        LogLevel::Trace => tracing::trace!(category, instance = ?instance_id, "{message}"),
        LogLevel::Debug => tracing::debug!(category, instance = ?instance_id, "{message}"),
        LogLevel::Info => tracing::info!(category, instance = ?instance_id, "{message}"),
        LogLevel::Warn => tracing::warn!(category, instance = ?instance_id, "{message}"),
        LogLevel::Error => tracing::error!(category, instance = ?instance_id, "{message}"),
    }
    if let Some(sink) = current_sink() {
        sink.push(LogEntry {
            timestamp: Utc::now(),
            level,
            category: category.to_string(),
            message,
            instance_id: instance_id.map(str::to_string),
        });
    }
}

/// `tracing` layer that copies instance-scoped events into a [`LogBuffer`].
#[derive(Debug, Clone, Default)]
pub struct LogCaptureLayer {
    buffer: Option<Arc<LogBuffer>>,
}

impl LogCaptureLayer {
    /// Capture into whichever sink is registered at event time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture into a fixed buffer regardless of the registered sink.
    pub fn with_buffer(buffer: Arc<LogBuffer>) -> Self {
        Self {
            buffer: Some(buffer),
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);
        let Some(instance_id) = visitor.instance_id.filter(|id| !id.is_empty()) else {
            return;
        };
        let Some(buffer) = self.buffer.clone().or_else(current_sink) else {
            return;
        };

        let metadata = event.metadata();
        let category = visitor.category.unwrap_or_else(|| {
            metadata
                .target()
                .rsplit("::")
                .next()
                .unwrap_or("system")
                .to_string()
        });
        let mut message = visitor.message;
        for (name, value) in visitor.fields {
            if !message.is_empty() {
                message.push(' ');
            }
            let _ = write!(message, "{name}={value}");
        }

        buffer.push(LogEntry {
            timestamp: Utc::now(),
            level: metadata.level().into(),
            category,
            message,
            instance_id: Some(instance_id),
        });
    }
}

#[derive(Default)]
struct EntryVisitor {
    message: String,
    instance_id: Option<String>,
    category: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl EntryVisitor {
    fn store(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "instance_id" => self.instance_id = Some(value),
            "category" => self.category = Some(value),
            name => self.fields.push((name, value)),
        }
    }
}

impl Visit for EntryVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.store(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.store(field, format!("{value:?}"));
    }
}

/// Install the global subscriber: env filter, fmt output, log capture.
///
/// `RUST_LOG` wins over `level` when set. Stdio mode must pass `to_stderr` so
/// stdout carries only protocol frames.
pub fn init_tracing(level: &str, format: LogFormat, to_stderr: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = match format {
        LogFormat::Json => true,
        LogFormat::Pretty => false,
        LogFormat::Auto if to_stderr => !std::io::stderr().is_terminal(),
        LogFormat::Auto => !std::io::stdout().is_terminal(),
    };
    let output: Box<dyn Layer<Registry> + Send + Sync> = match (json, to_stderr) {
        (true, true) => tracing_fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (true, false) => tracing_fmt::layer().json().boxed(),
        (false, true) => tracing_fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        (false, false) => tracing_fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(env_filter)
        .with(LogCaptureLayer::new())
        .try_init()
        .map_err(|error| HubError::Configuration(format!("failed to install tracing: {error}")))
}
