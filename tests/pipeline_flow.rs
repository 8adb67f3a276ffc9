use coin_pipeline::alert::{AlertContext, AlertSink};
use coin_pipeline::config::{ClientConfig, PipelineConfig};
use coin_pipeline::data::model::{Interval, Metric};
use coin_pipeline::data::retry::RetryPolicy;
use coin_pipeline::data::{MarketDataClient, ScriptedTransport};
use coin_pipeline::pipeline::{CycleOutcome, Pipeline};
use coin_pipeline::snapshot::SnapshotManager;
use coin_pipeline::storage::MarketStore;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CollectedAlerts(Mutex<Vec<String>>);

impl AlertSink for CollectedAlerts {
    fn notify_failure(&self, reason: &str, _context: &AlertContext) {
        self.0.lock().unwrap().push(reason.to_string());
    }
}

fn client(transport: &Arc<ScriptedTransport>) -> MarketDataClient {
    let config = ClientConfig {
        base_url: "http://api.test/v3".to_string(),
        retry: RetryPolicy::fixed(Duration::ZERO, 2),
        history_requests_per_minute: 1_000,
        ..ClientConfig::default()
    };
    MarketDataClient::with_transport(config, transport.clone())
}

fn markets(price: f64, last_updated: &str) -> String {
    json!([
        {
            "id": "bitcoin",
            "symbol": "btc",
            "name": "Bitcoin",
            "current_price": price,
            "market_cap": 800_000_000_000.0,
            "total_volume": 40_000_000_000.0,
            "market_cap_rank": 1,
            "high_24h": price + 500.0,
            "low_24h": price - 500.0,
            "price_change_24h": 120.0,
            "price_change_percentage_24h": 0.3,
            "circulating_supply": 19_600_000.0,
            "total_supply": 21_000_000.0,
            "max_supply": 21_000_000.0,
            "ath": 69_000.0,
            "atl": 67.81,
            "last_updated": last_updated
        },
        {
            "id": "tether",
            "symbol": "usdt",
            "name": "Tether",
            "current_price": "1.0",
            "market_cap": 0,
            "total_volume": 30_000_000_000.0,
            "market_cap_rank": 3,
            "high_24h": null,
            "low_24h": null,
            "price_change_percentage_24h": null,
            "ath": null,
            "atl": null,
            "last_updated": last_updated
        }
    ])
    .to_string()
}

#[tokio::test]
async fn collection_cycles_accumulate_history_in_the_store() {
    // Given a fresh store and an API that rate limits once per cycle
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MarketStore::open(dir.path().join("market.duckdb")).unwrap());
    let alerts = Arc::new(CollectedAlerts::default());
    let transport = Arc::new(ScriptedTransport::new());
    let config = PipelineConfig {
        sma_short_window: 2,
        sma_long_window: 3,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::from_config(client(&transport), &config, store.clone(), alerts.clone());

    // When three cycles run, the last one repeating an already stored observation
    for (price, at) in [
        (34_000.0, "2024-01-30T12:00:00.000Z"),
        (34_500.0, "2024-01-31T12:00:00.000Z"),
        (34_500.0, "2024-01-31T12:00:00.000Z"),
    ] {
        transport
            .push_response(429, "rate limited")
            .push_response(200, markets(price, at));
        let outcome = pipeline.run_snapshot_cycle(2, "usd").await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Persisted(_)));
    }

    // Then each (asset, observation) pair is stored once
    let stats = store.statistics().unwrap();
    assert_eq!(stats.snapshot_rows, 4);
    assert_eq!(stats.distinct_assets, 2);
    assert_eq!(transport.call_count(), 6);
    assert!(alerts.0.lock().unwrap().is_empty());

    // And derived metrics and moving averages come back from storage
    let top = store.top_by_market_cap(2).unwrap();
    let bitcoin = &top[0];
    assert_eq!(bitcoin.snapshot.asset_id, "bitcoin");
    assert_eq!(bitcoin.distance_from_ath, Metric::Value(0.5));
    assert_eq!(bitcoin.sma_short, Some(34_250.0));
    assert_eq!(bitcoin.sma_long, None);

    let tether = &top[1];
    assert_eq!(tether.snapshot.symbol, "USDT");
    assert_eq!(tether.volume_to_market_cap, Metric::Undefined);
    assert_eq!(tether.volatility_24h, Metric::Undefined);
    assert_eq!(tether.distance_from_ath, Metric::Undefined);
}

#[tokio::test]
async fn rejected_batches_never_reach_the_store() {
    // Given an API returning one record with a negative market cap
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MarketStore::open(dir.path().join("market.duckdb")).unwrap());
    let alerts = Arc::new(CollectedAlerts::default());
    let transport = Arc::new(ScriptedTransport::new());
    let body = markets(34_000.0, "2024-01-30T12:00:00.000Z").replace("\"market_cap\":0", "\"market_cap\":-5");
    transport.push_response(200, body);
    let pipeline = Pipeline::from_config(
        client(&transport),
        &PipelineConfig::default(),
        store.clone(),
        alerts.clone(),
    );

    // When the cycle runs
    let err = pipeline.run_snapshot_cycle(2, "usd").await.unwrap_err();

    // Then nothing is stored and an alert is raised
    assert_eq!(err.exit_code(), 2);
    assert_eq!(store.statistics().unwrap().snapshot_rows, 0);
    assert_eq!(alerts.0.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn backfill_stores_candles_and_snapshots_the_database() {
    // Given an API with two hours of bitcoin history
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MarketStore::open(dir.path().join("market.duckdb")).unwrap());
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_response(200, markets(34_000.0, "2024-01-30T12:00:00.000Z"))
        .push_response(
            200,
            json!({
                "prices": [
                    [1706000400000_i64, 10.0], [1706002200000_i64, 15.0],
                    [1706004000000_i64, 7.0], [1706005800000_i64, 12.0]
                ],
                "market_caps": [[1706000400000_i64, 100.0]],
                "total_volumes": [[1706000400000_i64, 5.0], [1706005800000_i64, 9.0]]
            })
            .to_string(),
        )
        .push_response(200, json!({ "prices": [] }).to_string());
    let pipeline = Pipeline::from_config(
        client(&transport),
        &PipelineConfig::default(),
        store.clone(),
        Arc::new(CollectedAlerts::default()),
    );

    // When the hourly backfill runs and a snapshot is taken
    let outcome = pipeline
        .run_backfill_cycle(2, 1, Interval::Hourly)
        .await
        .unwrap();
    let manager = SnapshotManager::new(store.path(), dir.path().join("backups"), 4);
    let snapshot = manager.snapshot_store(&store).unwrap();

    // Then one candle per hour is stored and the snapshot file exists
    assert!(matches!(outcome, CycleOutcome::Persisted(_)));
    let candles = store.candles("bitcoin", Interval::Hourly).unwrap();
    assert_eq!(candles.len(), 2);
    assert_eq!((candles[0].open, candles[0].close), (10.0, 15.0));
    assert_eq!((candles[1].high, candles[1].low), (12.0, 7.0));
    assert_eq!(candles[1].volume, Some(9.0));
    assert!(store.candles("tether", Interval::Hourly).unwrap().is_empty());
    assert!(snapshot.is_file());
}

fn daily_history(points: &[(i64, f64)]) -> String {
    let prices: Vec<serde_json::Value> = points.iter().map(|&(ms, price)| json!([ms, price])).collect();
    json!({ "prices": prices }).to_string()
}

#[tokio::test]
async fn overlapping_backfills_keep_complete_candles() {
    // Given a full day of bitcoin history already backfilled
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MarketStore::open(dir.path().join("market.duckdb")).unwrap());
    let transport = Arc::new(ScriptedTransport::new());
    let pipeline = Pipeline::from_config(
        client(&transport),
        &PipelineConfig::default(),
        store.clone(),
        Arc::new(CollectedAlerts::default()),
    );
    let listing = markets(34_000.0, "2024-01-30T12:00:00.000Z");
    transport
        .push_response(200, listing.clone())
        .push_response(
            200,
            daily_history(&[
                (1705968000000, 10.0),
                (1705989600000, 50.0),
                (1706011200000, 5.0),
                (1706050800000, 20.0),
            ]),
        )
        .push_response(200, json!({ "prices": [] }).to_string());
    pipeline
        .run_backfill_cycle(2, 1, Interval::Daily)
        .await
        .unwrap();

    // When a later window starts at 18:00 on that day
    transport
        .push_response(200, listing)
        .push_response(
            200,
            daily_history(&[
                (1706032800000, 20.0),
                (1706050800000, 20.0),
                (1706054400000, 22.0),
                (1706076000000, 25.0),
            ]),
        )
        .push_response(200, json!({ "prices": [] }).to_string());
    pipeline
        .run_backfill_cycle(2, 1, Interval::Daily)
        .await
        .unwrap();

    // Then the complete candle survives and only the new day is added
    let candles = store.candles("bitcoin", Interval::Daily).unwrap();
    assert_eq!(candles.len(), 2);
    let first = &candles[0];
    assert_eq!(
        (first.open, first.high, first.low, first.close),
        (10.0, 50.0, 5.0, 20.0)
    );
    assert_eq!((candles[1].open, candles[1].close), (22.0, 25.0));
}
