/*!
Observability setup for ESave.

- Structured logging through `tracing-subscriber`, filtered by `RUST_LOG`
  with `esave=info` as the baseline
- Prometheus counters and histograms for save/load operations (behind the
  `metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

#[cfg(feature = "metrics")]
use crate::operation::{OperationKind, OperationState};
use crate::{Result, SaveError};

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<SaveMetrics>> = OnceLock::new();

/// Metrics collected for save file operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct SaveMetrics {
    pub saves_total: Counter,
    pub loads_total: Counter,
    pub failures_total: Counter,
    pub cancellations_total: Counter,
    pub save_latency_seconds: Histogram,
    pub load_latency_seconds: Histogram,
    pub file_size_bytes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| SaveError::storage(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| SaveError::storage(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn histogram(registry: &Registry, opts: HistogramOpts) -> Result<Histogram> {
    let name = opts.common_opts.name.clone();
    let histogram = Histogram::with_opts(opts)
        .map_err(|e| SaveError::storage(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| SaveError::storage(format!("Failed to register {name}: {e}")))?;
    Ok(histogram)
}

#[cfg(feature = "metrics")]
impl SaveMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let saves_total = counter(
            &registry,
            "esave_saves_total",
            "Total save operations finished, in any terminal state",
        )?;
        let loads_total = counter(
            &registry,
            "esave_loads_total",
            "Total load operations finished, in any terminal state",
        )?;
        let failures_total = counter(
            &registry,
            "esave_failures_total",
            "Save and load operations that ended in failure",
        )?;
        let cancellations_total = counter(
            &registry,
            "esave_cancellations_total",
            "Save and load operations that were canceled",
        )?;

        let save_latency_seconds = histogram(
            &registry,
            HistogramOpts::new(
                "esave_save_latency_seconds",
                "Duration of save operations in seconds",
            ),
        )?;
        let load_latency_seconds = histogram(
            &registry,
            HistogramOpts::new(
                "esave_load_latency_seconds",
                "Duration of load operations in seconds",
            ),
        )?;
        let file_size_bytes = histogram(
            &registry,
            HistogramOpts::new("esave_file_size_bytes", "Size of written save files in bytes")
                .buckets(prometheus::exponential_buckets(256.0, 4.0, 8).unwrap_or_default()),
        )?;

        Ok(Self {
            saves_total,
            loads_total,
            failures_total,
            cancellations_total,
            save_latency_seconds,
            load_latency_seconds,
            file_size_bytes,
            registry,
        })
    }

    /// Global metrics instance, `None` if registration failed
    pub fn global() -> Option<&'static SaveMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to initialize ESave metrics");
                    None
                }
            })
            .as_ref()
    }

    /// Record a finished operation
    pub fn record_operation(&self, kind: OperationKind, state: OperationState, elapsed: Duration) {
        match kind {
            OperationKind::Save => {
                self.saves_total.inc();
                self.save_latency_seconds.observe(elapsed.as_secs_f64());
            }
            OperationKind::Load => {
                self.loads_total.inc();
                self.load_latency_seconds.observe(elapsed.as_secs_f64());
            }
        }

        match state {
            OperationState::Failed => self.failures_total.inc(),
            OperationState::Canceled => self.cancellations_total.inc(),
            _ => {}
        }
    }

    /// Record the size of a written save file
    pub fn record_file_size(&self, size_bytes: usize) {
        self.file_size_bytes.observe(size_bytes as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| SaveError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| SaveError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Gather the global metrics in Prometheus text format
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    SaveMetrics::global()
        .ok_or_else(|| SaveError::storage("Metrics are not available"))?
        .gather_metrics()
}

/// Install the global tracing subscriber
///
/// # Arguments
/// * `json` - Emit JSON lines instead of human-readable output
///
/// Fails if a global subscriber was already installed.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    SaveMetrics::global();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("esave=info"));

    let result = if json {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false),
        );
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));
        set_global_default(subscriber)
    };

    result.map_err(|e| {
        SaveError::storage(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("ESave observability initialized");
    Ok(())
}

/// Initialize observability with human-readable output
pub fn init_default_observability() -> Result<()> {
    init_observability(false)
}
