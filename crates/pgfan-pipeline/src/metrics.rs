//! Pipeline metrics.
//!
//! Counters are registered on an injected [`Registry`] at construction;
//! there is no global registry. All updates are lock-free.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};

use crate::error::PipelineError;

/// The metric set exported by a running pipeline manager.
#[derive(Clone)]
pub struct Metrics {
    pub events_processed: IntCounterVec,
    pub publish_errors: IntCounterVec,
    pub transformation_errors: IntCounterVec,
    pub processing_duration: HistogramVec,
    pub dropped_events: IntCounterVec,
}

impl Metrics {
    pub fn register(registry: &Registry) -> Result<Self, PipelineError> {
        let events_processed = IntCounterVec::new(
            Opts::new("events_processed_total", "CDC events delivered to sinks"),
            &["pipeline", "source", "sink"],
        )
        .map_err(into_config_error)?;

        let publish_errors = IntCounterVec::new(
            Opts::new("publish_errors_total", "Failed sink publishes"),
            &["sink"],
        )
        .map_err(into_config_error)?;

        let transformation_errors = IntCounterVec::new(
            Opts::new(
                "transformation_errors_total",
                "Events dropped by failing transformations",
            ),
            &["error_type", "pipeline", "source", "sink"],
        )
        .map_err(into_config_error)?;

        let processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "event_processing_duration_seconds",
                "Per-event transform-and-publish latency",
            ),
            &["pipeline", "source", "sink"],
        )
        .map_err(into_config_error)?;

        let dropped_events = IntCounterVec::new(
            Opts::new(
                "dropped_events_total",
                "Events shed by drop-oldest sink queues",
            ),
            &["sink"],
        )
        .map_err(into_config_error)?;

        registry
            .register(Box::new(events_processed.clone()))
            .map_err(into_config_error)?;
        registry
            .register(Box::new(publish_errors.clone()))
            .map_err(into_config_error)?;
        registry
            .register(Box::new(transformation_errors.clone()))
            .map_err(into_config_error)?;
        registry
            .register(Box::new(processing_duration.clone()))
            .map_err(into_config_error)?;
        registry
            .register(Box::new(dropped_events.clone()))
            .map_err(into_config_error)?;

        Ok(Self {
            events_processed,
            publish_errors,
            transformation_errors,
            processing_duration,
            dropped_events,
        })
    }
}

fn into_config_error(e: prometheus::Error) -> PipelineError {
    PipelineError::Config(format!("metrics registration failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_scrape() {
        let registry = Registry::new();
        let metrics = Metrics::register(&registry).unwrap();

        metrics
            .events_processed
            .with_label_values(&["p1", "pg", "debug"])
            .inc();
        metrics.publish_errors.with_label_values(&["debug"]).inc();

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.name()).collect();
        assert!(names.contains(&"events_processed_total"));
        assert!(names.contains(&"publish_errors_total"));
        assert!(names.contains(&"transformation_errors_total"));
        assert!(names.contains(&"event_processing_duration_seconds"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        Metrics::register(&registry).unwrap();
        assert!(Metrics::register(&registry).is_err());
    }
}
