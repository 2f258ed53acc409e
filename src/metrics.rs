// src/metrics.rs
//
// Metric names and recorders. Recorder bodies only exist with the
// `observability` feature.

#![cfg_attr(not(feature = "observability"), allow(unused_variables))]

#[cfg(feature = "observability")]
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};
#[cfg(feature = "observability")]
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

macro_rules! observed {
    ($($body:tt)*) => {
        #[cfg(feature = "observability")]
        {
            $($body)*
        };
    };
}

/// Initializes the descriptions for all the metrics in the application.
/// This should be called once at startup.
pub fn describe_metrics() {
    observed! {
        describe_counter!(
            "farm_refresh_total",
            Unit::Count,
            "Refresh loop iterations, labeled by source and outcome (ok, error)."
        );
        describe_histogram!(
            "farm_refresh_duration_ms",
            "Duration of one refresh loop iteration in milliseconds, labeled by source."
        );
        describe_counter!(
            "farm_valuation_passes_total",
            Unit::Count,
            "Per-farm valuation passes, labeled by result (applied, skipped, stale)."
        );
        describe_counter!(
            "farm_classification_failures_total",
            Unit::Count,
            "Pool classifications that failed and left a farm errant."
        );
        describe_counter!(
            "farm_metadata_fallbacks_total",
            Unit::Count,
            "Token metadata lookups that fell back to the placeholder record."
        );
        describe_gauge!("farm_total_tvl_tez", "Aggregate TVL in tez over non-errant farms.");
        describe_gauge!("farm_count", "Farm records currently tracked.");
        describe_gauge!("farm_visible_count", "Farms visible under the active filters.");
        describe_gauge!(
            "farm_snapshot_size",
            "Entries in each upstream snapshot, labeled by snapshot."
        );
    }
}

// --- Helper functions to update metrics ---

pub fn record_refresh(source: &'static str, ok: bool, duration: std::time::Duration) {
    observed! {
        let outcome = if ok { "ok" } else { "error" };
        counter!("farm_refresh_total", 1, "source" => source, "outcome" => outcome);
        histogram!(
            "farm_refresh_duration_ms",
            duration.as_millis() as f64,
            "source" => source
        );
    }
}

pub fn increment_valuation_pass(result: &'static str) {
    observed! {
        counter!("farm_valuation_passes_total", 1, "result" => result);
    }
}

pub fn increment_classification_failures() {
    observed! {
        increment_counter!("farm_classification_failures_total");
    }
}

pub fn increment_metadata_fallbacks() {
    observed! {
        increment_counter!("farm_metadata_fallbacks_total");
    }
}

pub fn set_total_tvl(tvl: Decimal) {
    observed! {
        gauge!("farm_total_tvl_tez", tvl.to_f64().unwrap_or(0.0));
    }
}

pub fn set_farm_counts(total: usize, visible: usize) {
    observed! {
        gauge!("farm_count", total as f64);
        gauge!("farm_visible_count", visible as f64);
    }
}

pub fn set_snapshot_size(snapshot: &'static str, size: usize) {
    observed! {
        gauge!("farm_snapshot_size", size as f64, "snapshot" => snapshot);
    }
}

/// Install the Prometheus exporter on `listen`.
#[cfg(feature = "observability")]
pub fn install_prometheus(listen: &str) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = listen.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}
