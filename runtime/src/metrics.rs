//! Prometheus metrics for observability and monitoring.
//!
//! The lifecycle engine and the guard rails record through the `metrics`
//! facade. Nothing is exported until a recorder is installed; the
//! [`MetricsServer`] installs the Prometheus exporter:
//! - Invocation counts per outcome, labelled by `type_prefix`
//! - Invocation duration, from invoke to settlement
//! - Guard rail violations, labelled by `auditor`
//!
//! # Example
//!
//! ```rust,no_run
//! use composable_ops_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Prometheus text format for the current values
//! let _page = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Invocations that emitted `Started`
pub const OPERATION_STARTED_TOTAL: &str = "operation_started_total";
/// Invocations that settled with `Succeeded`
pub const OPERATION_FULFILLED_TOTAL: &str = "operation_fulfilled_total";
/// Invocations that settled with `RejectedWithValue` or a thrown error
pub const OPERATION_REJECTED_TOTAL: &str = "operation_rejected_total";
/// Invocations that settled as aborted
pub const OPERATION_ABORTED_TOTAL: &str = "operation_aborted_total";
/// Invocations vetoed by their gating predicate
pub const OPERATION_CONDITION_REJECTED_TOTAL: &str = "operation_condition_rejected_total";
/// Time from invoke to settlement
pub const OPERATION_DURATION_SECONDS: &str = "operation_duration_seconds";
/// Violations reported by guard rail auditors
pub const GUARD_RAIL_VIOLATIONS_TOTAL: &str = "guard_rail_violations_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the Prometheus recorder and renders the scrape page. Binding an
/// HTTP listener is left to the host, which serves [`render`](Self::render)
/// output at [`addr`](Self::addr).
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the host serves the rendered page on (e.g., `0.0.0.0:9090`).
    ///   Nothing is bound here.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the lifecycle metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the call
    /// succeeds without a handle and [`render`](Self::render) returns `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                    5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed, serve render() output from the host"
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Address the host is expected to serve [`render`](Self::render) output on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        OPERATION_STARTED_TOTAL,
        "Total number of invocations that passed their condition and started"
    );
    describe_counter!(
        OPERATION_FULFILLED_TOTAL,
        "Total number of invocations that settled with a value"
    );
    describe_counter!(
        OPERATION_REJECTED_TOTAL,
        "Total number of invocations rejected with a value or a thrown error"
    );
    describe_counter!(
        OPERATION_ABORTED_TOTAL,
        "Total number of invocations settled as aborted"
    );
    describe_counter!(
        OPERATION_CONDITION_REJECTED_TOTAL,
        "Total number of invocations vetoed by their condition"
    );
    describe_histogram!(
        OPERATION_DURATION_SECONDS,
        "Time from invoke to settlement"
    );
    describe_counter!(
        GUARD_RAIL_VIOLATIONS_TOTAL,
        "Total number of guard rail violations"
    );
}

/// Lifecycle metrics recorder.
pub struct OperationMetrics;

impl OperationMetrics {
    /// Record an invocation that started its work function.
    pub fn record_started(type_prefix: &str) {
        counter!(OPERATION_STARTED_TOTAL, "type_prefix" => type_prefix.to_string()).increment(1);
    }

    /// Record a settled invocation under the given outcome counter.
    pub fn record_settled(outcome: &'static str, type_prefix: &str, duration: Duration) {
        counter!(outcome, "type_prefix" => type_prefix.to_string()).increment(1);
        histogram!(OPERATION_DURATION_SECONDS, "type_prefix" => type_prefix.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Guard rail metrics recorder.
pub struct GuardRailMetrics;

impl GuardRailMetrics {
    /// Record one violation.
    pub fn record_violation(auditor: &str) {
        counter!(GUARD_RAIL_VIOLATIONS_TOTAL, "auditor" => auditor.to_string()).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);

        server.start().unwrap();

        OperationMetrics::record_started("users/fetch");
        OperationMetrics::record_settled(
            OPERATION_FULFILLED_TOTAL,
            "users/fetch",
            Duration::from_millis(12),
        );
        GuardRailMetrics::record_violation("serializability");

        // Another test may have installed the recorder first; values are still recorded.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains(OPERATION_STARTED_TOTAL));
            assert!(rendered.contains(OPERATION_FULFILLED_TOTAL));
            assert!(rendered.contains(GUARD_RAIL_VIOLATIONS_TOTAL));
        }
    }
}
