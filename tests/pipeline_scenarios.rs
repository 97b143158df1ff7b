//! End-to-end detection scenarios over the in-memory event store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use metricwatch::config::{Config, DetectorsConfig, StorageBackend};
use metricwatch::detect::registry::{Category, Scored};
use metricwatch::detect::sensitivity::{default_table, ParameterKind};
use metricwatch::detect::{
    Detector, DetectorMeta, DetectorRegistry, Hyperparameters, MetricPoint, MetricSeries, Sensitivity,
    SensitivityResolver,
};
use metricwatch::events::{EventStore, MemoryEventStore, StreamKey};
use metricwatch::pipeline::{DetectionRequest, Pipeline, SeriesInput, SeriesOutcome};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 12, 28, 22, 0, 0).unwrap()
}

fn minutes(offset: i64, values: &[f64]) -> Vec<MetricPoint> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| MetricPoint::new(t0() + chrono::Duration::minutes(offset + i as i64), v))
        .collect()
}

fn series(resource: &str, offset: i64, values: &[f64]) -> SeriesInput {
    SeriesInput::new(resource, "cpu", minutes(offset, values))
}

/// Baseline around 50-54 with 200.0 spikes at `spikes`.
fn baseline_with_spikes(len: usize, spikes: &[usize]) -> Vec<f64> {
    let mut values: Vec<f64> = (0..len).map(|i| 50.0 + (i % 5) as f64).collect();
    for &i in spikes {
        values[i] = 200.0;
    }
    values
}

const DOCUMENTED: [f64; 10] = [10.1, 10.5, 10.8, 45.2, 11.2, 10.4, 10.9, 10.2, 11.0, 10.6];

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.storage.backend = StorageBackend::Memory;
    cfg.pipeline.workers = 4;
    cfg
}

fn pipeline_with(cfg: Config, registry: DetectorRegistry, store: Arc<MemoryEventStore>) -> Pipeline {
    Pipeline::new(Arc::new(cfg), Arc::new(registry), store).unwrap()
}

fn pipeline(store: Arc<MemoryEventStore>) -> Pipeline {
    pipeline_with(config(), DetectorRegistry::from_config(&DetectorsConfig::default()), store)
}

fn fresh() -> Pipeline {
    pipeline(Arc::new(MemoryEventStore::new()))
}

async fn run_one(p: &Pipeline, input: SeriesInput, method: &str, s: Sensitivity) -> SeriesOutcome {
    let resp = p
        .run(DetectionRequest::new(vec![input], method, s))
        .await
        .unwrap();
    resp.results[0].as_ok().cloned().expect("series should succeed")
}

#[tokio::test]
async fn constant_series_has_no_anomalies() {
    for s in Sensitivity::ALL {
        let out = run_one(&fresh(), series("pod-web-001", 0, &[10.0; 10]), "z-score", s).await;
        assert_eq!(out.anomaly_count, 0);
        assert!(out.events.is_empty());
        assert!(out.points.iter().all(|p| p.score == 0.0 && !p.is_anomaly));
    }
}

#[tokio::test]
async fn short_series_fails_alone() {
    let req = DetectionRequest::new(
        vec![
            series("pod-web-002", 0, &DOCUMENTED[..9]),
            series("pod-web-001", 0, &DOCUMENTED),
        ],
        "isolation-forest",
        Sensitivity::Medium,
    );
    let resp = fresh().run(req).await.unwrap();
    assert_eq!(resp.total_series, 2);
    assert_eq!(resp.results[0].resource_id(), "pod-web-002");
    assert_eq!(resp.results[0].error_kind(), Some("insufficient_data"));
    let ok = resp.results[1].as_ok().unwrap();
    assert_eq!(ok.resource_id, "pod-web-001");
    assert_eq!(resp.total_anomalies, ok.anomaly_count);
}

#[tokio::test]
async fn documented_spike_is_one_event() {
    let out = run_one(
        &fresh(),
        series("pod-web-001", 0, &DOCUMENTED),
        "isolation-forest",
        Sensitivity::Medium,
    )
    .await;
    assert_eq!(out.anomaly_count, 1);
    assert!(out.points[3].is_anomaly);
    assert_eq!(out.events.len(), 1);
    let ev = &out.events[0];
    assert_eq!(ev.peak_time, t0() + chrono::Duration::minutes(3));
    assert_eq!(ev.peak_value, 45.2);
    assert_eq!(ev.point_count, 1);
}

#[tokio::test]
async fn gap_splits_and_adjacency_merges() {
    let values = baseline_with_spikes(60, &[10, 11, 40]);
    let out = run_one(&fresh(), series("pod-web-001", 0, &values), "z-score", Sensitivity::Medium).await;
    assert_eq!(out.anomaly_count, 3);
    assert_eq!(out.events.len(), 2);

    let pair = out.events.iter().find(|e| e.point_count == 2).unwrap();
    assert_eq!(pair.start, t0() + chrono::Duration::minutes(10));
    assert_eq!(pair.end, t0() + chrono::Duration::minutes(11));
    let single = out.events.iter().find(|e| e.point_count == 1).unwrap();
    assert_eq!(single.start, t0() + chrono::Duration::minutes(40));

    // Longer, supported event ranks first.
    assert_eq!(out.events[0].id, pair.id);
    assert!(pair.priority_score > single.priority_score);
    for ev in &out.events {
        assert!((0.0..=1.0).contains(&ev.priority_score));
    }
}

#[tokio::test]
async fn every_flag_in_exactly_one_event() {
    let values = baseline_with_spikes(120, &[5, 7, 30, 31, 32, 70, 100, 104]);
    let out = run_one(&fresh(), series("pod-web-001", 0, &values), "z-score", Sensitivity::High).await;
    assert_eq!(out.anomaly_count, 8);
    assert_eq!(out.events.len(), 4);

    for p in out.points.iter().filter(|p| p.is_anomaly) {
        let owners = out
            .events
            .iter()
            .filter(|e| e.start <= p.timestamp && p.timestamp <= e.end)
            .count();
        assert_eq!(owners, 1, "point at {} owned by {owners} events", p.timestamp);
    }

    let mut events = out.events.clone();
    events.sort_by_key(|e| e.start);
    for pair in events.windows(2) {
        assert!(pair[0].end < pair[1].start);
    }
    let total: u32 = events.iter().map(|e| e.point_count).sum();
    assert_eq!(total as usize, out.anomaly_count);
}

#[tokio::test]
async fn repeated_requests_are_deterministic() {
    let req = || {
        DetectionRequest::new(
            vec![
                series("pod-web-001", 0, &DOCUMENTED),
                series("pod-web-002", 0, &baseline_with_spikes(40, &[12, 30])),
            ],
            "isolation-forest",
            Sensitivity::High,
        )
    };
    let a = fresh().run(req()).await.unwrap();
    let b = fresh().run(req()).await.unwrap();
    for (x, y) in a.results.iter().zip(&b.results) {
        let (x, y) = (x.as_ok().unwrap(), y.as_ok().unwrap());
        assert_eq!(x.points, y.points);
        assert_eq!(x.events, y.events);
    }
}

#[tokio::test]
async fn results_keep_submission_order() {
    let names: Vec<String> = (0..12).map(|i| format!("node-{i:02}")).collect();
    let inputs = names
        .iter()
        .map(|n| series(n, 0, &baseline_with_spikes(30, &[20])))
        .collect();
    let resp = fresh()
        .run(DetectionRequest::new(inputs, "moving-average", Sensitivity::Medium))
        .await
        .unwrap();
    let got: Vec<&str> = resp.results.iter().map(|r| r.resource_id()).collect();
    assert_eq!(got, names.iter().map(String::as_str).collect::<Vec<_>>());
}

#[tokio::test]
async fn later_request_extends_stored_event() {
    let store = Arc::new(MemoryEventStore::new());
    let p = pipeline(Arc::clone(&store));
    let key = StreamKey::new("pod-web-001", "cpu");

    let first = run_one(
        &p,
        series("pod-web-001", 0, &baseline_with_spikes(60, &[58])),
        "z-score",
        Sensitivity::Medium,
    )
    .await;
    assert_eq!(first.events.len(), 1);
    let id = first.events[0].id;

    // Next window starts at minute 59; its spike lands at minute 60.
    let second = run_one(
        &p,
        series("pod-web-001", 59, &baseline_with_spikes(60, &[1])),
        "z-score",
        Sensitivity::Medium,
    )
    .await;
    assert_eq!(second.events.len(), 1);
    assert_eq!(second.events[0].id, id);
    assert_eq!(second.events[0].point_count, 2);
    assert_eq!(second.events[0].start, t0() + chrono::Duration::minutes(58));
    assert_eq!(second.events[0].end, t0() + chrono::Duration::minutes(60));

    let stored = store.recent(Some(&key), 10).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].point_count, 2);
}

#[tokio::test]
async fn sliding_window_backfills_older_flag() {
    let store = Arc::new(MemoryEventStore::new());
    let p = pipeline(Arc::clone(&store));
    let key = StreamKey::new("pod-web-001", "cpu");

    let first = run_one(
        &p,
        series("pod-web-001", 0, &baseline_with_spikes(60, &[58])),
        "z-score",
        Sensitivity::Medium,
    )
    .await;
    assert_eq!(first.events.len(), 1);

    // Shifted by one minute: spikes at minutes 21 and 58. Minute 21 lies
    // before the stored tail and no stored event covers it.
    let second = run_one(
        &p,
        series("pod-web-001", 1, &baseline_with_spikes(60, &[20, 57])),
        "z-score",
        Sensitivity::Medium,
    )
    .await;
    assert_eq!(second.anomaly_count, 2);
    assert_eq!(second.late_points, 1);
    assert_eq!(second.events.len(), 2);
    for p in second.points.iter().filter(|p| p.is_anomaly) {
        let owners = second
            .events
            .iter()
            .filter(|e| e.start <= p.timestamp && p.timestamp <= e.end)
            .count();
        assert_eq!(owners, 1, "point at {} owned by {owners} events", p.timestamp);
    }
    let tail = second.events.iter().find(|e| e.id == first.events[0].id).unwrap();
    assert_eq!(tail.point_count, 1);

    let mut stored = store.recent(Some(&key), 10).unwrap();
    stored.sort_by_key(|e| e.start_time);
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].start_time, t0() + chrono::Duration::minutes(21));
    assert!(stored[0].end_time < stored[1].start_time);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_replays_do_not_duplicate() {
    let store = Arc::new(MemoryEventStore::new());
    let p = pipeline(Arc::clone(&store));
    let values = baseline_with_spikes(60, &[10, 11, 40]);

    let runs = (0..6).map(|_| {
        let p = p.clone();
        let req = DetectionRequest::new(
            vec![series("pod-web-001", 0, &values)],
            "z-score",
            Sensitivity::Medium,
        );
        tokio::spawn(async move { p.run(req).await })
    });
    for handle in runs.collect::<Vec<_>>() {
        let resp = handle.await.unwrap().unwrap();
        assert!(resp.results[0].as_ok().is_some());
    }

    let stored = store.recent(Some(&StreamKey::new("pod-web-001", "cpu")), 10).unwrap();
    assert_eq!(stored.len(), 2);
    let mut counts: Vec<u32> = stored.iter().map(|e| e.point_count).collect();
    counts.sort();
    assert_eq!(counts, vec![1, 2]);
}

/// Stand-in for the z-score method that misbehaves on purpose.
struct Misbehaving {
    delay: Duration,
    panics: bool,
}

impl Detector for Misbehaving {
    fn meta(&self) -> DetectorMeta {
        DetectorMeta {
            id: "z-score",
            display_name: "Misbehaving",
            category: Category::Statistical,
            description: "test double",
            best_for: &[],
            parameter: ParameterKind::Deviation,
        }
    }

    fn min_points(&self) -> usize {
        3
    }

    fn score(&self, series: &MetricSeries, _params: &Hyperparameters) -> Result<Scored, metricwatch::detect::DetectError> {
        std::thread::sleep(self.delay);
        if self.panics {
            panic!("detector blew up");
        }
        Ok(Scored {
            scores: vec![0.0; series.len()],
            threshold: 0.5,
        })
    }
}

fn registry_with(d: Misbehaving) -> DetectorRegistry {
    let mut registry = DetectorRegistry::from_config(&DetectorsConfig::default());
    registry.register(d);
    registry
}

#[tokio::test]
async fn deadline_marks_series_timed_out() {
    let mut cfg = config();
    cfg.pipeline.request_timeout_ms = 100;
    let store = Arc::new(MemoryEventStore::new());
    let p = pipeline_with(
        cfg,
        registry_with(Misbehaving {
            delay: Duration::from_millis(600),
            panics: false,
        }),
        Arc::clone(&store),
    );

    let req = DetectionRequest::new(
        vec![series("pod-web-001", 0, &DOCUMENTED), series("pod-web-002", 0, &DOCUMENTED)],
        "z-score",
        Sensitivity::Medium,
    );
    let resp = p.run(req).await.unwrap();
    assert_eq!(resp.results.len(), 2);
    assert!(resp.results.iter().all(|r| r.is_timeout()));
    assert_eq!(resp.results[1].resource_id(), "pod-web-002");
    assert_eq!(resp.total_anomalies, 0);

    // Cancelled workers never reach the store.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(store.recent(None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn panicking_detector_is_a_computation_error() {
    let p = pipeline_with(
        config(),
        registry_with(Misbehaving {
            delay: Duration::ZERO,
            panics: true,
        }),
        Arc::new(MemoryEventStore::new()),
    );
    let resp = p
        .run(DetectionRequest::new(
            vec![series("pod-web-001", 0, &DOCUMENTED)],
            "z-score",
            Sensitivity::Low,
        ))
        .await
        .unwrap();
    assert_eq!(resp.results[0].error_kind(), Some("computation"));
}

/// Slow detector that records how many copies of it run at once.
struct Counting {
    delay: Duration,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Detector for Counting {
    fn meta(&self) -> DetectorMeta {
        DetectorMeta {
            id: "z-score",
            display_name: "Counting",
            category: Category::Statistical,
            description: "test double",
            best_for: &[],
            parameter: ParameterKind::Deviation,
        }
    }

    fn min_points(&self) -> usize {
        3
    }

    fn score(&self, series: &MetricSeries, _params: &Hyperparameters) -> Result<Scored, metricwatch::detect::DetectError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Scored {
            scores: vec![0.0; series.len()],
            threshold: 0.5,
        })
    }
}

#[tokio::test]
async fn timed_out_work_keeps_its_worker_slot() {
    let mut cfg = config();
    cfg.pipeline.workers = 1;
    cfg.pipeline.request_timeout_ms = 100;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = DetectorRegistry::from_config(&DetectorsConfig::default());
    registry.register(Counting {
        delay: Duration::from_millis(400),
        running: Arc::clone(&running),
        peak: Arc::clone(&peak),
    });
    let p = pipeline_with(cfg, registry, Arc::new(MemoryEventStore::new()));

    for i in 0..3 {
        let resp = p
            .run(DetectionRequest::new(
                vec![series(&format!("pod-web-00{i}"), 0, &DOCUMENTED)],
                "z-score",
                Sensitivity::Medium,
            ))
            .await
            .unwrap();
        assert!(resp.results[0].is_timeout());
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(running.load(Ordering::SeqCst), 0);
}

fn flagged(registry: &DetectorRegistry, method: &str, values: &[f64], s: Sensitivity) -> usize {
    let resolver = SensitivityResolver::new(&default_table(), registry).unwrap();
    let detector = registry.get(method).unwrap();
    let params = resolver.resolve(method, s).unwrap();
    let series = MetricSeries::new("pod-web-001", "cpu", minutes(0, values));
    detector.detect(&series, s, &params).unwrap().anomaly_count()
}

proptest! {
    #[test]
    fn higher_sensitivity_never_flags_fewer(values in prop::collection::vec(0.0f64..1000.0, 12..80)) {
        let registry = DetectorRegistry::from_config(&DetectorsConfig::default());
        for info in registry.list().into_iter().filter(|m| m.available) {
            let method = info.meta.id;
            if values.len() < info.min_points {
                continue;
            }
            let low = flagged(&registry, method, &values, Sensitivity::Low);
            let medium = flagged(&registry, method, &values, Sensitivity::Medium);
            let high = flagged(&registry, method, &values, Sensitivity::High);
            prop_assert!(low <= medium, "{method}: low {low} > medium {medium}");
            prop_assert!(medium <= high, "{method}: medium {medium} > high {high}");
        }
    }
}

#[tokio::test]
async fn stored_events_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = || {
        let mut cfg = config();
        cfg.storage.backend = StorageBackend::Sqlite;
        cfg.storage.path = dir.path().join("metricwatch.db");
        metricwatch::build_pipeline(cfg).unwrap()
    };

    let first = run_one(
        &sqlite(),
        series("db-primary", 0, &baseline_with_spikes(60, &[58])),
        "z-score",
        Sensitivity::Medium,
    )
    .await;
    let id = first.events[0].id;

    let restarted = sqlite();
    let second = run_one(
        &restarted,
        series("db-primary", 59, &baseline_with_spikes(60, &[1])),
        "z-score",
        Sensitivity::Medium,
    )
    .await;
    assert_eq!(second.events[0].id, id);
    assert_eq!(second.events[0].point_count, 2);

    let stored = restarted
        .store()
        .recent(Some(&StreamKey::new("db-primary", "cpu")), 10)
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].end_time, t0() + chrono::Duration::minutes(60));
}
