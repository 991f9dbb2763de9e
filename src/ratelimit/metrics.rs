use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// How the pipeline disposed of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Admitted,
    Limited,
    Bypassed,
    Blocked,
    FailedOpen,
    Unavailable,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    admitted_total: AtomicU64,
    limited_total: AtomicU64,
    bypassed_total: AtomicU64,
    blocked_total: AtomicU64,
    failed_open_total: AtomicU64,
    unavailable_total: AtomicU64,
    store_errors_total: AtomicU64,
    alerts_sent_total: AtomicU64,
    alerts_failed_total: AtomicU64,
    events_dropped_total: AtomicU64,
    login_throttled_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub limited: u64,
    pub bypassed: u64,
    pub blocked: u64,
    pub failed_open: u64,
    pub unavailable: u64,
    pub store_errors: u64,
    pub alerts_sent: u64,
    pub alerts_failed: u64,
    pub events_dropped: u64,
    pub login_throttled: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Admitted => &self.admitted_total,
            Outcome::Limited => &self.limited_total,
            Outcome::Bypassed => &self.bypassed_total,
            Outcome::Blocked => &self.blocked_total,
            Outcome::FailedOpen => &self.failed_open_total,
            Outcome::Unavailable => &self.unavailable_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_error(&self) {
        self.store_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_sent(&self) {
        self.alerts_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_failed(&self) {
        self.alerts_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn login_throttled(&self) {
        self.login_throttled_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted_total.load(Ordering::Relaxed),
            limited: self.limited_total.load(Ordering::Relaxed),
            bypassed: self.bypassed_total.load(Ordering::Relaxed),
            blocked: self.blocked_total.load(Ordering::Relaxed),
            failed_open: self.failed_open_total.load(Ordering::Relaxed),
            unavailable: self.unavailable_total.load(Ordering::Relaxed),
            store_errors: self.store_errors_total.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent_total.load(Ordering::Relaxed),
            alerts_failed: self.alerts_failed_total.load(Ordering::Relaxed),
            events_dropped: self.events_dropped_total.load(Ordering::Relaxed),
            login_throttled: self.login_throttled_total.load(Ordering::Relaxed),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            concat!(
                "# TYPE ratelimit_decisions_total counter\n",
                "ratelimit_decisions_total{{outcome=\"admitted\"}} {}\n",
                "ratelimit_decisions_total{{outcome=\"limited\"}} {}\n",
                "ratelimit_decisions_total{{outcome=\"bypassed\"}} {}\n",
                "ratelimit_decisions_total{{outcome=\"blocked\"}} {}\n",
                "ratelimit_decisions_total{{outcome=\"failed_open\"}} {}\n",
                "ratelimit_decisions_total{{outcome=\"unavailable\"}} {}\n",
                "# TYPE ratelimit_store_errors_total counter\n",
                "ratelimit_store_errors_total {}\n",
                "# TYPE ratelimit_alerts_sent_total counter\n",
                "ratelimit_alerts_sent_total {}\n",
                "# TYPE ratelimit_alerts_failed_total counter\n",
                "ratelimit_alerts_failed_total {}\n",
                "# TYPE ratelimit_events_dropped_total counter\n",
                "ratelimit_events_dropped_total {}\n",
                "# TYPE ratelimit_login_throttled_total counter\n",
                "ratelimit_login_throttled_total {}\n"
            ),
            s.admitted,
            s.limited,
            s.bypassed,
            s.blocked,
            s.failed_open,
            s.unavailable,
            s.store_errors,
            s.alerts_sent,
            s.alerts_failed,
            s.events_dropped,
            s.login_throttled,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_series_per_outcome() {
        let metrics = MetricsRegistry::new();
        metrics.outcome(Outcome::Admitted);
        metrics.outcome(Outcome::Admitted);
        metrics.outcome(Outcome::Limited);
        metrics.store_error();

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("ratelimit_decisions_total{outcome=\"admitted\"} 2\n"));
        assert!(rendered.contains("ratelimit_decisions_total{outcome=\"limited\"} 1\n"));
        assert!(rendered.contains("ratelimit_decisions_total{outcome=\"blocked\"} 0\n"));
        assert!(rendered.contains("ratelimit_store_errors_total 1\n"));
    }

    #[test]
    fn snapshot_tracks_side_counters() {
        let metrics = MetricsRegistry::new();
        metrics.alert_sent();
        metrics.alert_failed();
        metrics.event_dropped();
        metrics.login_throttled();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.alerts_sent, 1);
        assert_eq!(snapshot.alerts_failed, 1);
        assert_eq!(snapshot.events_dropped, 1);
        assert_eq!(snapshot.login_throttled, 1);
        assert_eq!(snapshot.admitted, 0);
    }
}
