use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub events_total: IntCounterVec,
    pub assignments_total: IntCounterVec,
    pub requests_expired_total: IntCounter,
    pub invariant_violations_total: IntCounter,
    pub estimator_fallbacks_total: IntCounter,
    pub match_pass_latency_seconds: HistogramVec,
    pub pending_requests: IntGaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_total = IntCounterVec::new(
            Opts::new("events_total", "Ingested events by kind and outcome"),
            &["kind", "outcome"],
        )
        .expect("valid events_total metric");

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Assignment transitions by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let requests_expired_total = IntCounter::new(
            "requests_expired_total",
            "Requests that reached Expired without a match",
        )
        .expect("valid requests_expired_total metric");

        let invariant_violations_total = IntCounter::new(
            "invariant_violations_total",
            "Events rejected because they would break a state invariant",
        )
        .expect("valid invariant_violations_total metric");

        let estimator_fallbacks_total = IntCounter::new(
            "estimator_fallbacks_total",
            "Estimates served by the straight-line fallback",
        )
        .expect("valid estimator_fallbacks_total metric");

        let match_pass_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "match_pass_latency_seconds",
                "Latency of the snapshot-and-solve step in seconds",
            ),
            &["solver"],
        )
        .expect("valid match_pass_latency_seconds metric");

        let pending_requests = IntGaugeVec::new(
            Opts::new("pending_requests", "Requests waiting for a driver"),
            &["shard"],
        )
        .expect("valid pending_requests metric");

        registry
            .register(Box::new(events_total.clone()))
            .expect("register events_total");
        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(requests_expired_total.clone()))
            .expect("register requests_expired_total");
        registry
            .register(Box::new(invariant_violations_total.clone()))
            .expect("register invariant_violations_total");
        registry
            .register(Box::new(estimator_fallbacks_total.clone()))
            .expect("register estimator_fallbacks_total");
        registry
            .register(Box::new(match_pass_latency_seconds.clone()))
            .expect("register match_pass_latency_seconds");
        registry
            .register(Box::new(pending_requests.clone()))
            .expect("register pending_requests");

        Self {
            registry,
            events_total,
            assignments_total,
            requests_expired_total,
            invariant_violations_total,
            estimator_fallbacks_total,
            match_pass_latency_seconds,
            pending_requests,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
