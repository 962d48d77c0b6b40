//! Rendering of a matrix execution as Prometheus metrics.
//!
//! Every call builds its own registry, so concurrent scrapes never observe each
//! other's values and no series outlives the request that produced it.

use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::executor::ProbeResultSet;

/// Content type of the rendered body.
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TargetLabels {
    target: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    target: String,
    reason: String,
}

/// Render a result set in the OpenMetrics text format.
pub fn render(result: ProbeResultSet) -> Result<String, std::fmt::Error> {
    let mut registry = Registry::default();

    let success: Gauge = Gauge::default();
    registry.register(
        "probe_success",
        "Displays whether or not the probe was a success",
        success.clone(),
    );

    let duration: Gauge<f64, AtomicU64> = Gauge::default();
    registry.register(
        "probe_duration_seconds",
        "Returns how long the probe took to complete in seconds",
        duration.clone(),
    );

    let target_success = Family::<TargetLabels, Gauge>::default();
    registry.register(
        "probe_target_success",
        "Whether the probe of a single target succeeded",
        target_success.clone(),
    );

    let target_duration = Family::<TargetLabels, Gauge<f64, AtomicU64>>::default();
    registry.register(
        "probe_target_duration_seconds",
        "How long the probe of a single target took in seconds",
        target_duration.clone(),
    );

    let target_failure = Family::<FailureLabels, Gauge>::default();
    registry.register(
        "probe_target_failure",
        "Set to 1 for each failed target, labelled with the failure reason",
        target_failure.clone(),
    );

    success.set(i64::from(result.success()));
    duration.set(result.duration_seconds);

    for outcome in result.outcomes {
        let labels = TargetLabels {
            target: outcome.target.clone(),
        };
        target_success
            .get_or_create(&labels)
            .set(i64::from(outcome.success));
        target_duration
            .get_or_create(&labels)
            .set(outcome.duration_seconds);

        if let Some(reason) = outcome.failure_reason {
            target_failure
                .get_or_create(&FailureLabels {
                    target: outcome.target,
                    reason,
                })
                .set(1);
        }
    }

    let mut body = String::new();
    encode(&mut body, &registry)?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::ProbeOutcome;
    use std::time::Duration;

    fn value(body: &str, series: &str) -> Option<f64> {
        body.lines()
            .find_map(|line| line.strip_prefix(series)?.strip_prefix(' '))
            .and_then(|v| v.trim().parse().ok())
    }

    fn result_set(outcomes: Vec<ProbeOutcome>, duration_seconds: f64) -> ProbeResultSet {
        ProbeResultSet {
            matrix: "web".to_string(),
            outcomes,
            duration_seconds,
        }
    }

    #[test]
    fn test_render_all_successful() {
        let body = render(result_set(
            vec![
                ProbeOutcome::success("a", Duration::from_millis(20)),
                ProbeOutcome::success("b", Duration::from_millis(40)),
            ],
            0.05,
        ))
        .unwrap();

        assert!(body.contains("# TYPE probe_success gauge"));
        assert!(body.contains("# TYPE probe_duration_seconds gauge"));
        assert_eq!(value(&body, "probe_success"), Some(1.0));
        assert_eq!(value(&body, "probe_duration_seconds"), Some(0.05));
        assert_eq!(
            value(&body, "probe_target_success{target=\"b\"}"),
            Some(1.0)
        );
        assert_eq!(
            value(&body, "probe_target_duration_seconds{target=\"a\"}"),
            Some(0.02)
        );
        assert!(!body.contains("probe_target_failure{"));
        assert!(body.ends_with("# EOF\n"));
    }

    #[test]
    fn test_render_failed_target_is_attributable() {
        let body = render(result_set(
            vec![
                ProbeOutcome::success("good", Duration::from_millis(5)),
                ProbeOutcome::failure("bad", Duration::from_millis(7), "connection_failed"),
            ],
            0.01,
        ))
        .unwrap();

        assert_eq!(value(&body, "probe_success"), Some(0.0));
        assert_eq!(
            value(&body, "probe_target_success{target=\"good\"}"),
            Some(1.0)
        );
        assert_eq!(
            value(&body, "probe_target_success{target=\"bad\"}"),
            Some(0.0)
        );
        assert_eq!(
            value(
                &body,
                "probe_target_failure{target=\"bad\",reason=\"connection_failed\"}"
            ),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_concurrent_renders_are_isolated() {
        let mut handles = Vec::new();
        for i in 0..16u32 {
            handles.push(tokio::spawn(async move {
                let target = format!("target-{}", i);
                let outcome = if i % 2 == 0 {
                    ProbeOutcome::success(&target, Duration::ZERO)
                } else {
                    ProbeOutcome::failure(&target, Duration::ZERO, "timeout")
                };
                (i, render(result_set(vec![outcome], f64::from(i))).unwrap())
            }));
        }

        for handle in handles {
            let (i, body) = handle.await.unwrap();
            assert_eq!(value(&body, "probe_duration_seconds"), Some(f64::from(i)));
            assert_eq!(
                value(&body, "probe_success"),
                Some(if i % 2 == 0 { 1.0 } else { 0.0 })
            );
            assert_eq!(body.matches("probe_target_success{").count(), 1);
            assert!(body.contains(&format!("target=\"target-{}\"", i)));
        }
    }
}
