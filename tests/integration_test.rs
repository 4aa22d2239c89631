use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use humidscope::config::{load_with, MEMORY_DB_URL};
use humidscope::routes::{self, HttpState};
use humidscope::scheduler::Job;
use humidscope::{
    ingest, AlarmRow, AppContext, Granularity, MemoryStore, Notification, Notifier, Outbox,
    Scheduler,
};

const HUMIDITY: i32 = 1;
const POWER: i32 = 3;

#[derive(Debug, Deserialize)]
struct IngestResponse {
    accepted: usize,
    dropped: usize,
}

/// Notifier that keeps everything it is handed.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<Notification>>>);

#[async_trait]
impl Notifier for Captured {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.0.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

async fn spawn_server(state: HttpState) -> Result<String> {
    // ---
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(axum::serve(listener, routes::router(state)).into_future());
    Ok(format!("http://{}", addr))
}

#[tokio::test]
async fn health_endpoint_reports_ok() -> Result<()> {
    // ---
    let (ingest, _batcher) = ingest::channel(8);
    let base = spawn_server(HttpState { ingest, feeds: Arc::new(HashMap::new()) }).await?;

    let body: serde_json::Value = Client::new().get(format!("{}/health", base)).send().await?.json().await?;
    assert_eq!(body, json!({ "status": "ok" }));

    Ok(())
}

#[tokio::test]
async fn readings_endpoint_queues_attributable_readings() -> Result<()> {
    // ---
    let (ingest, mut batcher) = ingest::channel(64);
    let feeds = HashMap::from([("basement/humidity".to_string(), HUMIDITY)]);
    let base = spawn_server(HttpState { ingest, feeds: Arc::new(feeds) }).await?;

    let payload = json!([
        { "sensor_id": POWER, "time": "2025-09-01T11:00:00Z", "value": 250.0 },
        { "feed": "basement/humidity", "value": 41.5 },
        { "feed": "attic/humidity", "value": 30.0 },
        { "value": 12.0 }
    ]);

    let response = Client::new().post(format!("{}/readings", base)).json(&payload).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let counts: IngestResponse = response.json().await?;
    assert_eq!(counts.accepted, 2);
    assert_eq!(counts.dropped, 2);

    let queued = batcher.drain();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].sensor_id, POWER);
    assert_eq!(queued[0].time, Utc.with_ymd_and_hms(2025, 9, 1, 11, 0, 0).unwrap());
    assert_eq!(queued[1].sensor_id, HUMIDITY);
    assert_eq!(queued[1].value, 41.5);
    // Server-stamped readings carry whole seconds only
    assert_eq!(queued[1].time.timestamp_subsec_nanos(), 0);

    Ok(())
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 12, 30, 0).unwrap()
}

#[tokio::test]
async fn one_tick_runs_the_whole_pipeline() -> Result<()> {
    // ---
    let store = Arc::new(MemoryStore::new());
    store.put_sensor("basement/humidity", HUMIDITY).await;
    store
        .put_alarm(AlarmRow {
            id: "humidity".to_string(),
            sensor_id: Some(HUMIDITY),
            aggregate: "AVG".to_string(),
            window_secs: 15 * 60,
            min_value: Some(20.0),
            max_value: Some(50.0),
            message: "Basement humidity out of range".to_string(),
            state: "STARTUP".to_string(),
        })
        .await;

    let cfg = load_with(|name| match name {
        "DATABASE_URL" => Some(MEMORY_DB_URL.to_string()),
        "RUN_ALL_ON_START" => Some("true".to_string()),
        "NOTIFY_RECIPIENTS" => Some("ops@example.com".to_string()),
        _ => None,
    })?;
    let (handle, batcher) = ingest::channel(cfg.ingest_queue_capacity);
    let captured = Captured::default();
    let ctx = AppContext { store: store.clone(), outbox: Outbox::new(), config: cfg };
    let mut scheduler = Scheduler::new(ctx, batcher, Box::new(captured.clone()), now());

    // Compressor power during the 11:00 hour
    let power = [50.0, 250.0, 250.0, 50.0, 260.0, 50.0, 250.0];
    let eleven = Utc.with_ymd_and_hms(2025, 9, 1, 11, 0, 0).unwrap();
    for (minute, value) in power.iter().enumerate() {
        assert!(handle.push(POWER, eleven + Duration::minutes(minute as i64), *value));
    }
    // Dry basement over the last ten minutes
    for minute in 1..=10 {
        assert!(handle.push(HUMIDITY, now() - Duration::minutes(minute), 15.0));
    }

    let report = scheduler.tick(now()).await;
    assert!(report.ran.iter().all(|(_, ok)| *ok), "failed jobs: {:?}", report.ran);
    assert_eq!(report.ran.len(), Job::ALL.len());

    assert_eq!(store.readings().await.len(), power.len() + 10);
    assert_eq!(store.cycles().await.len(), 2);

    let hourly = store.aggregates(Granularity::Hourly).await;
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].sensor_id, POWER);
    assert_eq!(hourly[0].samples, power.len() as i64);
    assert!(store.aggregates(Granularity::Daily).await.is_empty());

    assert_eq!(store.alarm_state("humidity").await.as_deref(), Some("TOO_LOW"));
    {
        let delivered = captured.0.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].subject, "TOO_LOW: Basement humidity out of range");
        assert_eq!(delivered[0].recipients, vec!["ops@example.com".to_string()]);
        assert!(delivered[0].body.contains("Topic:\t\tbasement/humidity"));
    }

    // An hour later the hourly jobs come round again without repeating work
    let later = now() + Duration::hours(1);
    let report = scheduler.tick(later).await;
    assert!(report.ran.iter().all(|(_, ok)| *ok));
    assert_eq!(store.cycles().await.len(), 2);
    assert_eq!(captured.0.lock().unwrap().len(), 2, "window emptied, alarm went UNKNOWN");
    assert_eq!(store.alarm_state("humidity").await.as_deref(), Some("UNKNOWN"));

    Ok(())
}
