use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    // Receiver
    pub requests_total: AtomicU64,
    pub alias_not_found_total: AtomicU64,
    pub credential_missing_total: AtomicU64,
    pub dispatched_total: AtomicU64,

    // Worker
    pub connect_attempts_total: AtomicU64,
    pub connect_retries_total: AtomicU64,
    pub executions_succeeded_total: AtomicU64,
    pub executions_failed_total: AtomicU64,

    // Publisher
    pub publish_failures_total: AtomicU64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

fn inc(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

pub fn record_request() {
    inc(&metrics().requests_total, 1);
}

pub fn record_alias_not_found() {
    inc(&metrics().alias_not_found_total, 1);
}

pub fn record_credential_missing() {
    inc(&metrics().credential_missing_total, 1);
}

pub fn record_dispatched() {
    inc(&metrics().dispatched_total, 1);
}

pub fn record_connect_attempts(attempts: u32) {
    let m = metrics();
    inc(&m.connect_attempts_total, u64::from(attempts));
    inc(&m.connect_retries_total, u64::from(attempts.saturating_sub(1)));
}

pub fn record_execution(succeeded: bool) {
    let m = metrics();
    if succeeded {
        inc(&m.executions_succeeded_total, 1);
    } else {
        inc(&m.executions_failed_total, 1);
    }
}

pub fn record_publish_failure() {
    inc(&metrics().publish_failures_total, 1);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let counters = [
        ("sqlbot_requests_total", &m.requests_total),
        ("sqlbot_alias_not_found_total", &m.alias_not_found_total),
        ("sqlbot_credential_missing_total", &m.credential_missing_total),
        ("sqlbot_dispatched_total", &m.dispatched_total),
        ("sqlbot_connect_attempts_total", &m.connect_attempts_total),
        ("sqlbot_connect_retries_total", &m.connect_retries_total),
        (
            "sqlbot_executions_succeeded_total",
            &m.executions_succeeded_total,
        ),
        ("sqlbot_executions_failed_total", &m.executions_failed_total),
        ("sqlbot_publish_failures_total", &m.publish_failures_total),
    ];
    let mut s = String::new();
    for (name, counter) in counters {
        let _ = writeln!(
            s,
            "# TYPE {name} counter\n{name} {}",
            counter.load(Ordering::Relaxed)
        );
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_counter() {
        record_connect_attempts(3);
        let text = render_prometheus();
        assert!(text.contains("# TYPE sqlbot_requests_total counter"));
        assert!(text.contains("sqlbot_publish_failures_total "));
        assert!(metrics().connect_retries_total.load(Ordering::Relaxed) >= 2);
    }
}
