use std::sync::LazyLock;

use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};

/* ============================= REGISTRY ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RECONCILES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("weft_reconciles_total", "Reconcile callbacks dispatched per kind"),
        &["kind"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RECONCILE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("weft_reconcile_errors_total", "Reconcile callback errors per kind"),
        &["kind"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RECONCILE_EXHAUSTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "weft_reconcile_exhausted_total",
            "Reconciles abandoned after exhausting retries, per kind",
        ),
        &["kind"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static INGRESS_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("weft_ingress_requests_total", "Ingress requests by outcome"),
        &["outcome"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static INGRESS_PROXY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "weft_ingress_proxy_duration_seconds",
        "Duration of proxied ingress requests in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/// Plaintext exposition of every registered metric.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        LazyLock::force(&RECONCILES_TOTAL);
        LazyLock::force(&RECONCILE_ERRORS);
        LazyLock::force(&RECONCILE_EXHAUSTED);
        LazyLock::force(&INGRESS_REQUESTS);
        LazyLock::force(&INGRESS_PROXY_DURATION);

        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"weft_reconciles_total".to_string()));
        assert!(names.contains(&"weft_ingress_requests_total".to_string()));
    }

    #[test]
    fn test_gather_text_is_exposition_format() {
        RECONCILES_TOTAL.with_label_values(&["test-kind"]).inc();
        let text = gather_text();
        assert!(text.contains("weft_reconciles_total"));
    }
}
