//! End-to-end pipeline scenarios over the in-memory store: classification,
//! bucket rollover, alarm lifecycle, maintenance suppression and restart
//! recovery.

use std::net::SocketAddr;
use std::sync::Arc;

use bacmon::alert::{AlertLevel, AlertManager, MaintenanceWindow, RateLimit};
use bacmon::config::BacmonConfig;
use bacmon::count::parse_record;
use bacmon::kv::{KvStore, MemoryKv};
use bacmon::monitor::{Monitor, MonitorContext};
use bacmon::rate::{RateSpec, RateTask};

fn source() -> SocketAddr {
    "192.0.2.10:47808".parse().unwrap()
}

/// A complete I-Am broadcast: BVLL + NPDU + APDU
fn i_am_packet(instance: u32) -> Vec<u8> {
    let object_id = ((8u32 << 22) | instance).to_be_bytes();
    let mut apdu = vec![0x10, 0x00, 0xC4];
    apdu.extend_from_slice(&object_id);
    apdu.extend_from_slice(&[0x22, 0x05, 0xC4, 0x91, 0x00, 0x21, 0x0F]);

    let mut body = vec![0x01, 0x00];
    body.extend_from_slice(&apdu);

    let length = (4 + body.len()) as u16;
    let mut data = vec![0x81, 0x01, (length >> 8) as u8, (length & 0xFF) as u8];
    data.extend_from_slice(&body);
    data
}

fn alert_manager(kv: Arc<MemoryKv>) -> Arc<AlertManager> {
    Arc::new(AlertManager::new(kv, Vec::new(), RateLimit::default()))
}

async fn monitor_at(kv: Arc<MemoryKv>, now: u64) -> Monitor {
    let context = MonitorContext::new(kv.clone(), BacmonConfig::default()).unwrap();
    Monitor::new(context, alert_manager(kv), now)
        .await
        .unwrap()
}

#[tokio::test]
async fn single_packet_classification() {
    let kv = Arc::new(MemoryKv::new());
    let mut monitor = monitor_at(kv.clone(), 1000).await;

    monitor
        .process_datagram(&i_am_packet(12345), source(), 1000)
        .await
        .unwrap();

    assert_eq!(kv.get("total").await.unwrap(), Some("1".to_string()));
    assert!(kv
        .smembers("ip-traffic")
        .await
        .unwrap()
        .contains(&"192.0.2.10".to_string()));
    assert!(kv
        .smembers("application-traffic")
        .await
        .unwrap()
        .contains(&"IAmRequest,192.0.2.10,12345".to_string()));

    // cross the second boundary: the completed bucket lands at the head
    monitor
        .process_datagram(&i_am_packet(12345), source(), 1001)
        .await
        .unwrap();
    assert_eq!(
        kv.lrange("IAmRequest,192.0.2.10,12345:s", 0, 0)
            .await
            .unwrap(),
        vec!["[1000, 1]"]
    );
}

#[tokio::test]
async fn bucket_rollover() {
    let kv = Arc::new(MemoryKv::new());
    let mut monitor = monitor_at(kv.clone(), 100).await;

    for _ in 0..5 {
        monitor
            .process_datagram(&i_am_packet(1), source(), 100)
            .await
            .unwrap();
    }
    for _ in 0..3 {
        monitor
            .process_datagram(&i_am_packet(1), source(), 101)
            .await
            .unwrap();
    }

    assert_eq!(
        kv.lrange("total:s", 0, 0).await.unwrap(),
        vec!["[100, 5]"]
    );
    assert_eq!(kv.get("total:sn").await.unwrap(), Some("3".to_string()));
    assert_eq!(kv.get("total:si").await.unwrap(), Some("101".to_string()));
}

#[tokio::test]
async fn series_invariants() {
    let kv = Arc::new(MemoryKv::new());
    let mut monitor = monitor_at(kv.clone(), 5000).await;

    for second in 5000..5040 {
        for _ in 0..2 {
            monitor
                .process_datagram(&i_am_packet(1), source(), second)
                .await
                .unwrap();
        }
    }

    for series in ["total:s", "total:m"] {
        let records = kv.lrange(series, 0, -1).await.unwrap();
        let buckets: Vec<_> = records
            .iter()
            .map(|record| parse_record(record).expect("numeric record"))
            .collect();
        let modulus = if series == "total:s" { 1 } else { 60 };
        for bucket in &buckets {
            assert_eq!(bucket.ts % modulus, 0);
        }
        for pair in buckets.windows(2) {
            assert!(pair[0].ts > pair[1].ts, "series must be newest first");
        }
    }
}

#[tokio::test]
async fn alarm_arming_and_auto_clear() {
    let kv = Arc::new(MemoryKv::new());
    let alerts = alert_manager(kv.clone());

    // counts over eight consecutive seconds: threshold 10, duration 3
    let counts = [5u64, 12, 15, 14, 13, 4, 3, 2];
    for (index, count) in counts.iter().enumerate() {
        kv.lpush(
            "K:s",
            &bacmon::count::format_record(100 + index as u64, *count),
        )
        .await
        .unwrap();
    }

    let spec = RateSpec {
        key: "K:s".to_string(),
        interval: 1,
        max_value: 10.0,
        duration: 3,
    };
    let mut task = RateTask::threshold(spec, 100);
    task.tick(&*kv, &alerts, 108).await.unwrap();

    // the alarm rose at the third consecutive breach and cleared after
    // three consecutive quiet samples
    assert!(!kv.exists("K:s:alarm").await.unwrap());
    assert_eq!(
        kv.lrange("K:s:alarm-history", 0, 0).await.unwrap(),
        vec!["[103, 107]"]
    );

    let history = alerts.history(AlertLevel::Debug, 10, 0).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].level, AlertLevel::Warning);
    assert!(history[0].resolved);

    assert!(kv
        .smembers("critical-messages")
        .await
        .unwrap()
        .contains(&"-/K:s/Rate Exceeded".to_string()));
}

#[tokio::test]
async fn maintenance_suppression_keeps_alarm_and_legacy_entry() {
    let kv = Arc::new(MemoryKv::new());
    let alerts = alert_manager(kv.clone());
    alerts
        .add_maintenance_window(MaintenanceWindow {
            name: "window".to_string(),
            start_time: 40,
            end_time: 160,
            entity_patterns: vec!["K".to_string()],
            key_patterns: Vec::new(),
        })
        .await;

    for ts in 100..105 {
        kv.lpush("K:s", &bacmon::count::format_record(ts, 50))
            .await
            .unwrap();
    }

    let spec = RateSpec {
        key: "K:s".to_string(),
        interval: 1,
        max_value: 10.0,
        duration: 3,
    };
    let mut task = RateTask::threshold(spec, 100);
    task.tick(&*kv, &alerts, 105).await.unwrap();

    // local alarm detection still ran
    assert!(task.state().is_active());
    assert!(kv.exists("K:s:alarm").await.unwrap());
    // the structured alert was suppressed
    assert_eq!(alerts.active_count().await, 0);
    // but the legacy set still records the message
    assert!(kv
        .smembers("critical-messages")
        .await
        .unwrap()
        .contains(&"-/K:s/Rate Exceeded".to_string()));
}

#[tokio::test]
async fn restart_lifts_open_bucket() {
    let kv = Arc::new(MemoryKv::new());

    {
        let mut monitor = monitor_at(kv.clone(), 300).await;
        for _ in 0..50 {
            monitor
                .process_datagram(&i_am_packet(1), source(), 300)
                .await
                .unwrap();
        }
    }

    // restart mid-bucket: the next packet adopts the stored open count
    let mut monitor = monitor_at(kv.clone(), 300).await;
    monitor
        .process_datagram(&i_am_packet(1), source(), 300)
        .await
        .unwrap();

    assert_eq!(kv.get("total:sn").await.unwrap(), Some("51".to_string()));
    // the cumulative counter kept counting as well
    assert_eq!(kv.get("total").await.unwrap(), Some("51".to_string()));
}

#[tokio::test]
async fn alarm_recovery_skips_pre_alarm_samples() {
    let kv = Arc::new(MemoryKv::new());
    let alerts = alert_manager(kv.clone());

    // a previous process left the alarm active at t=200
    kv.set("K:s:alarm", "200").await.unwrap();

    let spec = RateSpec {
        key: "K:s".to_string(),
        interval: 1,
        max_value: 10.0,
        duration: 3,
    };
    let mut task = RateTask::threshold(spec, 205);
    task.recover(&*kv).await.unwrap();

    assert!(task.state().is_active());
    assert!(task.next_check() >= 200);

    // quiet samples after recovery clear the alarm normally
    for ts in 205..209 {
        kv.lpush("K:s", &bacmon::count::format_record(ts, 1))
            .await
            .unwrap();
    }
    task.tick(&*kv, &alerts, 209).await.unwrap();
    assert!(!kv.exists("K:s:alarm").await.unwrap());
    assert_eq!(
        kv.lrange("K:s:alarm-history", 0, -1).await.unwrap().len(),
        1
    );
}
