//! Observability hooks run after a decision is final.
//!
//! The request path only bumps atomic counters and `try_send`s an event;
//! warnings and alert delivery happen on a background task. A full queue
//! drops the event, and sink failures are logged and counted, never
//! returned to the caller.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};

use crate::{
    ratelimit::{
        metrics::{MetricsRegistry, Outcome},
        policy::Algorithm,
    },
    store::duration_to_millis,
};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const ALERT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Alert gate size that triggers the first prune of stale windows.
const GATE_PRUNE_AT: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitEvent {
    pub bucket_key: String,
    pub policy_id: String,
    pub algorithm: Algorithm,
    pub admitted: bool,
    pub utilization: f64,
    pub alert_threshold: Option<f64>,
    pub window: Duration,
    pub timestamp: DateTime<Utc>,
}

impl RateLimitEvent {
    fn crosses_threshold(&self) -> bool {
        self.alert_threshold
            .is_some_and(|threshold| self.utilization >= threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
    pub data: AlertData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertData {
    pub usage: f64,
    pub threshold: f64,
    pub bucket_key: String,
    pub policy: String,
}

impl Alert {
    fn for_event(event: &RateLimitEvent, threshold: f64) -> Self {
        Self {
            kind: "rate_limit_warning",
            message: format!(
                "Rate limit {:.0}% used for {}",
                event.utilization * 100.0,
                event.bucket_key
            ),
            data: AlertData {
                usage: event.utilization,
                threshold,
                bucket_key: event.bucket_key.clone(),
                policy: event.policy_id.clone(),
            },
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        tracing::warn!(
            bucket_key = %alert.data.bucket_key,
            policy = %alert.data.policy,
            utilization = alert.data.usage,
            threshold = alert.data.threshold,
            "{}",
            alert.message
        );
        Ok(())
    }
}

/// Posts each alert as JSON to a fixed URL.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ALERT_DELIVERY_TIMEOUT)
            .build()
            .context("building alert webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .with_context(|| format!("posting alert to {}", self.url))?
            .error_for_status()
            .context("alert webhook rejected the alert")?;
        Ok(())
    }
}

/// Tracks which window each key last alerted in.
///
/// Pruning only drops entries from finished windows, so after each prune
/// the next one waits until the map has doubled. A burst of distinct keys
/// within one window costs amortized constant time per event.
struct AlertGate {
    last_fired: HashMap<String, (i64, i64)>,
    prune_at: usize,
}

impl Default for AlertGate {
    fn default() -> Self {
        Self {
            last_fired: HashMap::new(),
            prune_at: GATE_PRUNE_AT,
        }
    }
}

impl AlertGate {
    fn should_fire(&mut self, event: &RateLimitEvent) -> bool {
        let window_ms = duration_to_millis(event.window);
        let window_index = event.timestamp.timestamp_millis().div_euclid(window_ms);

        if self.last_fired.len() >= self.prune_at {
            let now_ms = event.timestamp.timestamp_millis();
            self.last_fired
                .retain(|_, (index, window_ms)| now_ms.div_euclid(*window_ms) <= *index);
            self.prune_at = (self.last_fired.len() * 2).max(GATE_PRUNE_AT);
        }

        match self.last_fired.get(&event.bucket_key) {
            Some((index, _)) if *index == window_index => false,
            _ => {
                self.last_fired
                    .insert(event.bucket_key.clone(), (window_index, window_ms));
                true
            }
        }
    }
}

#[derive(Clone)]
pub struct Observer {
    sender: Sender<RateLimitEvent>,
    metrics: Arc<MetricsRegistry>,
}

impl Observer {
    /// Starts the background worker on the current runtime.
    pub fn spawn(sink: Arc<dyn AlertSink>, metrics: Arc<MetricsRegistry>) -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY, sink, metrics)
    }

    pub fn with_capacity(
        capacity: usize,
        sink: Arc<dyn AlertSink>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (observer, receiver) = Self::channel(capacity, metrics.clone());
        tokio::spawn(run_worker(receiver, sink, metrics));
        observer
    }

    fn channel(capacity: usize, metrics: Arc<MetricsRegistry>) -> (Self, Receiver<RateLimitEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, metrics }, receiver)
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn record(&self, outcome: Outcome) {
        self.metrics.outcome(outcome);
    }

    pub fn store_error(&self) {
        self.metrics.store_error();
    }

    /// Counts the decision and hands denials and threshold crossings to the
    /// worker without waiting.
    pub fn observe(&self, event: RateLimitEvent) {
        self.record(if event.admitted {
            Outcome::Admitted
        } else {
            Outcome::Limited
        });

        if event.admitted && !event.crosses_threshold() {
            return;
        }

        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                self.metrics.event_dropped();
                tracing::debug!(bucket_key = %event.bucket_key, "observability queue unavailable, event dropped");
            }
        }
    }
}

async fn run_worker(
    mut receiver: Receiver<RateLimitEvent>,
    sink: Arc<dyn AlertSink>,
    metrics: Arc<MetricsRegistry>,
) {
    let mut gate = AlertGate::default();

    while let Some(event) = receiver.recv().await {
        if !event.admitted {
            tracing::warn!(
                bucket_key = %event.bucket_key,
                policy = %event.policy_id,
                algorithm = %event.algorithm,
                utilization = event.utilization,
                "rate limit exceeded"
            );
        }

        let Some(threshold) = event.alert_threshold else {
            continue;
        };
        if !event.crosses_threshold() || !gate.should_fire(&event) {
            continue;
        }

        let alert = Alert::for_event(&event, threshold);
        match tokio::time::timeout(ALERT_DELIVERY_TIMEOUT, sink.send(&alert)).await {
            Ok(Ok(())) => metrics.alert_sent(),
            Ok(Err(err)) => {
                metrics.alert_failed();
                tracing::warn!(bucket_key = %event.bucket_key, error = %err, "alert delivery failed");
            }
            Err(_) => {
                metrics.alert_failed();
                tracing::warn!(bucket_key = %event.bucket_key, "alert delivery timed out");
            }
        }
    }

    tracing::debug!("observability queue closed, worker exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        async fn send(&self, _alert: &Alert) -> anyhow::Result<()> {
            anyhow::bail!("webhook returned 500")
        }
    }

    fn event(key: &str, admitted: bool, utilization: f64, offset_secs: i64) -> RateLimitEvent {
        RateLimitEvent {
            bucket_key: key.to_string(),
            policy_id: "default".to_string(),
            algorithm: Algorithm::FixedWindow,
            admitted,
            utilization,
            alert_threshold: Some(0.8),
            window: Duration::from_secs(60),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
                + chrono::Duration::seconds(offset_secs),
        }
    }

    #[tokio::test]
    async fn alerts_at_most_once_per_window_per_key() {
        let metrics = Arc::new(MetricsRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let (observer, receiver) = Observer::channel(64, metrics.clone());

        observer.observe(event("default:ip:a", true, 0.5, 0));
        observer.observe(event("default:ip:a", true, 0.8, 1));
        observer.observe(event("default:ip:a", true, 0.9, 2));
        observer.observe(event("default:ip:a", false, 1.0, 3));
        observer.observe(event("default:ip:b", true, 0.85, 4));
        observer.observe(event("default:ip:a", true, 0.8, 61));
        drop(observer);

        run_worker(receiver, sink.clone(), metrics.clone()).await;

        let alerts = sink.alerts.lock().unwrap();
        let keys: Vec<_> = alerts.iter().map(|a| a.data.bucket_key.as_str()).collect();
        assert_eq!(keys, vec!["default:ip:a", "default:ip:b", "default:ip:a"]);
        assert_eq!(alerts[0].kind, "rate_limit_warning");
        assert_eq!(alerts[0].data.threshold, 0.8);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.admitted, 5);
        assert_eq!(snapshot.limited, 1);
        assert_eq!(snapshot.alerts_sent, 3);
    }

    #[tokio::test]
    async fn sink_failures_are_counted_not_raised() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (observer, receiver) = Observer::channel(8, metrics.clone());

        observer.observe(event("k", false, 1.0, 0));
        drop(observer);
        run_worker(receiver, Arc::new(FailingSink), metrics.clone()).await;

        assert_eq!(metrics.snapshot().alerts_failed, 1);
        assert_eq!(metrics.snapshot().alerts_sent, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_waiting() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (observer, _receiver) = Observer::channel(1, metrics.clone());

        for i in 0..3 {
            observer.observe(event("k", false, 1.0, i));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.limited, 3);
        assert_eq!(snapshot.events_dropped, 2);
    }

    #[test]
    fn alert_serializes_with_wire_field_names() {
        let alert = Alert::for_event(&event("api:user:7", true, 0.9, 0), 0.8);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "rate_limit_warning");
        assert_eq!(json["data"]["bucketKey"], "api:user:7");
        assert_eq!(json["data"]["policy"], "default");
        assert_eq!(json["message"], "Rate limit 90% used for api:user:7");
    }

    #[test]
    fn gate_prunes_stale_windows() {
        let mut gate = AlertGate::default();
        for i in 0..GATE_PRUNE_AT {
            assert!(gate.should_fire(&event(&format!("k{i}"), true, 0.9, 0)));
        }

        assert!(gate.should_fire(&event("fresh", true, 0.9, 120)));
        assert_eq!(gate.last_fired.len(), 1);
        assert_eq!(gate.prune_at, GATE_PRUNE_AT);
    }

    #[test]
    fn gate_backs_off_when_one_window_holds_many_keys() {
        let mut gate = AlertGate::default();
        for i in 0..GATE_PRUNE_AT {
            gate.should_fire(&event(&format!("k{i}"), true, 0.9, 0));
        }

        // Nothing is stale yet: the prune keeps every entry and moves the
        // next one out to twice the current size.
        assert!(gate.should_fire(&event("extra-0", true, 0.9, 0)));
        assert_eq!(gate.prune_at, 2 * GATE_PRUNE_AT);

        for i in 1..100 {
            assert!(gate.should_fire(&event(&format!("extra-{i}"), true, 0.9, 0)));
        }
        assert_eq!(gate.prune_at, 2 * GATE_PRUNE_AT);
        assert_eq!(gate.last_fired.len(), GATE_PRUNE_AT + 100);
    }
}
