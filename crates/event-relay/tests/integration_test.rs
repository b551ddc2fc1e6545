// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::mock_collector::MockCollector;
use event_relay::config::RelayConfig;
use event_relay::delivery::DeliveryClient;
use event_relay::flusher::{FlushSummary, Flusher, FlusherConfig};
use event_relay::http_utils::build_client;
use event_relay::intake::IntakeServer;
use event_relay::queue_store::{MemoryQueueStore, QueueStore};
use event_relay::scheduler::FlushScheduler;
use event_relay::tenant::TenantRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::task::TaskTracker;

const PREFIX: &str = "relay-test";

struct Relay {
    store: Arc<MemoryQueueStore>,
    registry: Arc<TenantRegistry>,
    flusher: Arc<Flusher>,
    intake: IntakeServer,
}

impl Relay {
    fn new(upstream_url: Option<String>, flusher_config: FlusherConfig) -> Self {
        Self::with_store(Arc::new(MemoryQueueStore::new()), upstream_url, flusher_config)
    }

    fn with_store(
        store: Arc<MemoryQueueStore>,
        upstream_url: Option<String>,
        flusher_config: FlusherConfig,
    ) -> Self {
        let registry = Arc::new(TenantRegistry::new(PREFIX));
        let client = build_client(None, Duration::from_secs(5)).expect("failed to build client");
        let flusher = Arc::new(Flusher::new(
            store.clone(),
            registry.clone(),
            DeliveryClient::new(client, upstream_url),
            flusher_config,
        ));
        let config = RelayConfig {
            queue_prefix: PREFIX.to_string(),
            ..RelayConfig::default()
        };
        let intake = IntakeServer::new(store.clone(), registry.clone(), &config);
        Self {
            store,
            registry,
            flusher,
            intake,
        }
    }

    async fn send(&self, api_key: &str, event_types: &[&str]) {
        let events: Vec<_> = event_types
            .iter()
            .map(|event_type| json!({"type": event_type, "data": {"source": "test"}}))
            .collect();
        let body = json!({"api_key": api_key, "events": events}).to_string();
        let accepted = self
            .intake
            .ingest(body.as_bytes())
            .await
            .expect("failed to ingest events");
        assert_eq!(accepted, event_types.len());
    }

    fn pending(&self, api_key: &str) -> Vec<String> {
        self.store.contents(&format!("{PREFIX}:pending:{api_key}"))
    }

    fn dead_letters(&self, api_key: &str) -> Vec<String> {
        self.store.contents(&format!("{PREFIX}:dead-letter:{api_key}"))
    }
}

fn types(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

#[tokio::test]
async fn test_events_delivered_in_order_with_basic_auth() {
    let collector = MockCollector::start().await;
    let relay = Relay::new(Some(collector.url()), FlusherConfig::default());

    relay.send("tenant-x-key", &["first", "second"]).await;
    relay.send("tenant-x-key", &["third"]).await;

    let summary = relay.flusher.flush_all().await;

    assert_eq!(summary.delivered_events, 3);
    let batches = collector.batches_for("tenant-x-key");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].event_types, types(&["first", "second", "third"]));
    assert_eq!(
        batches[0].authorization.as_deref(),
        Some("Basic dGVuYW50LXgta2V5Og==")
    );
    assert!(relay.pending("tenant-x-key").is_empty());
}

#[tokio::test]
async fn test_failed_delivery_restores_batch_at_head() {
    let collector = MockCollector::start().await;
    collector.respond_with("tenant-a", 500);
    let relay = Relay::new(Some(collector.url()), FlusherConfig::default());

    relay.send("tenant-a", &["a", "b"]).await;
    let before = relay.pending("tenant-a");

    let summary = relay.flusher.flush_all().await;

    assert_eq!(summary.requeued_events, 2);
    assert_eq!(relay.pending("tenant-a"), before);

    relay.send("tenant-a", &["c"]).await;
    assert_eq!(relay.pending("tenant-a")[..2], before[..]);

    collector.respond_with("tenant-a", 200);
    relay.flusher.flush_all().await;

    let batches = collector.batches_for("tenant-a");
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].event_types, types(&["a", "b"]));
    assert_eq!(batches[1].event_types, types(&["a", "b", "c"]));
    assert!(relay.pending("tenant-a").is_empty());
}

#[tokio::test]
async fn test_successful_delivery_is_not_repeated() {
    let collector = MockCollector::start().await;
    let relay = Relay::new(Some(collector.url()), FlusherConfig::default());

    relay.send("tenant-a", &["a"]).await;
    relay.flusher.flush_all().await;
    relay.flusher.flush_all().await;

    assert_eq!(collector.batches().len(), 1);
}

#[tokio::test]
async fn test_failing_tenant_does_not_affect_others() {
    let collector = MockCollector::start().await;
    collector.respond_with("tenant-bad", 503);
    let relay = Relay::new(Some(collector.url()), FlusherConfig::default());

    relay.send("tenant-bad", &["x"]).await;
    relay.send("tenant-good", &["y"]).await;

    let summary = relay.flusher.flush_all().await;

    assert_eq!(summary.delivered_events, 1);
    assert_eq!(summary.requeued_events, 1);
    assert!(relay.pending("tenant-good").is_empty());
    assert_eq!(relay.pending("tenant-bad").len(), 1);
}

#[tokio::test]
async fn test_slow_tenant_does_not_delay_others() {
    let collector = MockCollector::start().await;
    collector.delay("tenant-slow", Duration::from_secs(2));
    let relay = Relay::new(Some(collector.url()), FlusherConfig::default());

    relay.send("tenant-slow", &["slow"]).await;
    relay.send("tenant-fast", &["fast"]).await;

    let tracker = TaskTracker::new();
    relay.flusher.dispatch(&tracker);

    let fast_delivered = async {
        while collector.batches_for("tenant-fast").is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_millis(1_500), fast_delivered)
        .await
        .expect("fast tenant was held up by the slow one");
    assert!(collector.batches_for("tenant-slow").is_empty());

    tracker.close();
    tracker.wait().await;
    assert_eq!(collector.batches_for("tenant-slow").len(), 1);
}

#[tokio::test]
async fn test_upstream_rate_limit_spans_tenants() {
    let collector = MockCollector::start().await;
    let relay = Relay::new(
        Some(collector.url()),
        FlusherConfig {
            rate_window: Duration::from_secs(60),
            max_requests_per_window: 100,
            ..FlusherConfig::default()
        },
    );

    let tenants: Vec<String> = (0..101).map(|i| format!("tenant-{i:03}")).collect();
    for tenant in &tenants {
        relay.send(tenant, &["e"]).await;
    }
    let before: Vec<Vec<String>> = tenants.iter().map(|t| relay.pending(t)).collect();

    let summary = relay.flusher.flush_all().await;

    assert_eq!(summary.tenants, 101);
    assert_eq!(summary.delivered_events, 100);
    assert_eq!(summary.deferred, 1);
    assert_eq!(collector.batches().len(), 100);

    let deferred: Vec<usize> = tenants
        .iter()
        .enumerate()
        .filter(|(_, t)| !relay.pending(t).is_empty())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(deferred.len(), 1);
    assert_eq!(relay.pending(&tenants[deferred[0]]), before[deferred[0]]);
}

#[tokio::test]
async fn test_sustained_load_rotates_upstream_deferrals() {
    let collector = MockCollector::start().await;
    let window = Duration::from_millis(100);
    let relay = Relay::new(
        Some(collector.url()),
        FlusherConfig {
            rate_window: window,
            max_requests_per_window: 100,
            ..FlusherConfig::default()
        },
    );
    let tenants: Vec<String> = (0..101).map(|i| format!("tenant-{i:03}")).collect();

    for round in 0..5 {
        for tenant in &tenants {
            relay.send(tenant, &["e"]).await;
        }
        sleep(window + Duration::from_millis(50)).await;

        let summary = relay.flusher.flush_all().await;
        assert_eq!(summary.deferred, 1, "round {round}");

        let backlog: Vec<(&String, usize)> = tenants
            .iter()
            .map(|t| (t, relay.pending(t).len()))
            .filter(|(_, pending)| *pending > 0)
            .collect();
        assert_eq!(backlog.len(), 1, "round {round}: {backlog:?}");
        assert_eq!(backlog[0].1, 1, "round {round}: {backlog:?}");
    }

    let never_delivered: Vec<&String> = tenants
        .iter()
        .filter(|t| collector.batches_for(t).is_empty())
        .collect();
    assert!(never_delivered.is_empty(), "{never_delivered:?}");
}

#[tokio::test]
async fn test_batches_respect_max_body_size() {
    let collector = MockCollector::start().await;
    let max_body_size = 400;
    let relay = Relay::new(
        Some(collector.url()),
        FlusherConfig {
            max_body_size,
            ..FlusherConfig::default()
        },
    );

    let sent: Vec<String> = (0..12).map(|i| format!("event-{i:02}")).collect();
    let sent_refs: Vec<&str> = sent.iter().map(String::as_str).collect();
    relay.send("tenant-a", &sent_refs).await;

    for _ in 0..sent.len() {
        if relay.pending("tenant-a").is_empty() {
            break;
        }
        relay.flusher.flush_all().await;
    }

    let batches = collector.batches_for("tenant-a");
    assert!(batches.len() > 1);
    for batch in &batches {
        assert!(batch.body_len <= max_body_size, "body of {} bytes", batch.body_len);
    }
    let delivered: Vec<String> = batches
        .into_iter()
        .flat_map(|batch| batch.event_types)
        .collect();
    assert_eq!(delivered, sent);
}

#[tokio::test]
async fn test_retry_ceiling_moves_batch_to_dead_letter() {
    let collector = MockCollector::start().await;
    collector.respond_with("tenant-a", 500);
    let relay = Relay::new(
        Some(collector.url()),
        FlusherConfig {
            max_consecutive_failures: 3,
            ..FlusherConfig::default()
        },
    );

    relay.send("tenant-a", &["a", "b"]).await;
    let before = relay.pending("tenant-a");

    for _ in 0..2 {
        assert_eq!(relay.flusher.flush_all().await.requeued_events, 2);
    }
    assert_eq!(relay.flusher.flush_all().await.dead_lettered_events, 2);

    assert!(relay.pending("tenant-a").is_empty());
    assert_eq!(relay.dead_letters("tenant-a"), before);
    assert_eq!(collector.batches_for("tenant-a").len(), 3);
}

#[tokio::test]
async fn test_missing_upstream_url_skips_flush() {
    let relay = Relay::new(None, FlusherConfig::default());
    relay.send("tenant-a", &["a", "b"]).await;
    let before = relay.pending("tenant-a");

    let summary = relay.flusher.flush_all().await;

    assert_eq!(summary, FlushSummary::default());
    assert_eq!(relay.pending("tenant-a"), before);
}

#[tokio::test]
async fn test_backlog_is_restored_after_restart() {
    let collector = MockCollector::start().await;
    let store = Arc::new(MemoryQueueStore::new());

    let previous = Relay::with_store(store.clone(), None, FlusherConfig::default());
    previous.send("tenant-a", &["left-behind"]).await;
    drop(previous);

    let relay = Relay::with_store(store, Some(collector.url()), FlusherConfig::default());
    assert_eq!(relay.registry.restore(relay.store.as_ref()).await.unwrap(), 1);

    relay.flusher.flush_all().await;

    let batches = collector.batches_for("tenant-a");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].event_types, types(&["left-behind"]));
}

#[tokio::test]
async fn test_scheduler_flushes_and_shuts_down() {
    let collector = MockCollector::start().await;
    let period = Duration::from_millis(20);
    let relay = Relay::new(
        Some(collector.url()),
        FlusherConfig {
            rate_window: period,
            ..FlusherConfig::default()
        },
    );
    let scheduler = FlushScheduler::new(relay.flusher.clone(), period);
    scheduler.start();

    relay.send("tenant-a", &["ticked"]).await;
    let delivered = async {
        while collector.batches_for("tenant-a").is_empty() {
            sleep(period).await;
        }
    };
    timeout(Duration::from_secs(5), delivered)
        .await
        .expect("scheduler never flushed");

    relay.send("tenant-a", &["final"]).await;
    let summary = scheduler.shutdown().await;

    assert!(!scheduler.is_running());
    assert!(relay.pending("tenant-a").is_empty());
    let delivered: Vec<String> = collector
        .batches_for("tenant-a")
        .into_iter()
        .flat_map(|batch| batch.event_types)
        .collect();
    assert_eq!(delivered, types(&["ticked", "final"]));
    assert!(summary.delivered_events <= 1);
    assert_eq!(
        relay.store.len(&format!("{PREFIX}:pending:tenant-a")).await.unwrap(),
        0
    );
}
