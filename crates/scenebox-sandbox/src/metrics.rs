//! Prometheus metrics for scene conversions.
//!
//! Only compiled with the `metrics` feature.

use std::sync::atomic::AtomicI64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConversionLabels {
    /// `success`, `violation`, `error` or `timeout`.
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Wire error code, e.g. `network-blocked`.
    pub code: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExportLabels {
    /// Which trigger won the completion latch.
    pub reason: String,
}

pub struct SceneboxMetrics {
    pub conversions_total: Family<ConversionLabels, Counter>,
    pub conversion_duration_seconds: Family<ConversionLabels, Histogram>,
    pub errors_total: Family<ErrorLabels, Counter>,
    pub exports_total: Family<ExportLabels, Counter>,
    /// Conversions currently holding a concurrency permit.
    pub conversions_in_flight: Gauge<i64, AtomicI64>,
}

impl SceneboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let conversions_total = Family::default();
        registry.register(
            "scenebox_conversions_total",
            "Total scene conversions by outcome",
            conversions_total.clone(),
        );

        let conversion_duration_seconds =
            Family::<ConversionLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0].into_iter())
            });
        registry.register(
            "scenebox_conversion_duration_seconds",
            "Scene conversion duration",
            conversion_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "scenebox_errors_total",
            "Failed conversions by error code",
            errors_total.clone(),
        );

        let exports_total = Family::default();
        registry.register(
            "scenebox_exports_total",
            "Successful exports by trigger",
            exports_total.clone(),
        );

        let conversions_in_flight = Gauge::default();
        registry.register(
            "scenebox_conversions_in_flight",
            "Conversions currently running",
            conversions_in_flight.clone(),
        );

        Self {
            conversions_total,
            conversion_duration_seconds,
            errors_total,
            exports_total,
            conversions_in_flight,
        }
    }

    pub fn record_conversion(&self, outcome: &str, duration_secs: f64) {
        let labels = ConversionLabels {
            outcome: outcome.to_string(),
        };
        self.conversions_total.get_or_create(&labels).inc();
        self.conversion_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, code: &str) {
        self.errors_total
            .get_or_create(&ErrorLabels {
                code: code.to_string(),
            })
            .inc();
    }

    pub fn record_export(&self, reason: &str) {
        self.exports_total
            .get_or_create(&ExportLabels {
                reason: reason.to_string(),
            })
            .inc();
    }
}
