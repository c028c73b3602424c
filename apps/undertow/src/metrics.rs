use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Metric names and labels are static; construction only fails on invalid names.
fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("static counter definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("static counter definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static FRAMES_IN: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "undertow_frames_in_total",
        "Frames decoded from the peer",
        &["type"],
    )
});

pub static FRAMES_OUT: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "undertow_frames_out_total",
        "Frames encoded for the peer",
        &["type"],
    )
});

pub static DECODE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "undertow_decode_failures_total",
        "Inbound frames dropped as malformed",
    )
});

pub static RESYNC_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "undertow_resync_requests_total",
        "Resync requests issued after a sequence gap",
    )
});

pub static DUPLICATE_BATCHES: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "undertow_duplicate_batches_total",
        "Patch batches discarded as already applied",
    )
});

pub static SELF_HEALS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "undertow_self_heals_total",
        "Reloads or forced navigations after registry inconsistencies",
    )
});

pub static RECONNECT_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "undertow_reconnect_attempts_total",
        "Reconnect attempts scheduled after unclean closes",
    )
});

pub static OPTIMISTIC_ROLLBACKS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "undertow_optimistic_rollbacks_total",
        "Optimistic update sets reverted after a server error",
    )
});

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("undertow_active_sessions", "Sessions held by the server")
        .expect("static gauge definition");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Text exposition of every registered metric.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn exposition_includes_touched_metrics() {
        FRAMES_IN.with_label_values(&["patches"]).inc();
        SELF_HEALS.inc();
        let text = gather_text().expect("encode");
        assert!(text.contains("undertow_frames_in_total"));
        assert!(text.contains("undertow_self_heals_total"));
    }
}
