//! Monitor Loop
//!
//! The monitor domain: one cooperative loop owning the UDP socket, the
//! per-resolution counters and the recurring task queue. Nothing in this
//! loop runs concurrently with anything else in it, which makes the
//! counter caches and alarm state single-writer by construction. The API
//! domain shares only the KV store.
//!
//! The receive path never blocks for long: the socket read is bounded by a
//! one-second timeout so due rate tasks and cleanup passes always get a
//! turn, and every store failure on the packet path degrades to a dropped
//! update instead of an exit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertLevel, AlertManager};
use crate::config::BacmonConfig;
use crate::count::{CountInterval, Resolution};
use crate::decoder::{Category, DecodeOutcome, Decoder};
use crate::kv::KvStore;
use crate::rate::RateTask;
use crate::unix_now;

/// Fatal monitor failures
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Kv(#[from] crate::kv::KvError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Everything the monitor's operations need, threaded explicitly
pub struct MonitorContext {
    pub kv: Arc<dyn KvStore>,
    pub config: BacmonConfig,
    pub decoder: Decoder,
}

impl MonitorContext {
    pub fn new(kv: Arc<dyn KvStore>, config: BacmonConfig) -> Result<Self, crate::config::ConfigError> {
        let decoder = Decoder::new(config.bacmon.bbmd_addresses()?);
        Ok(MonitorContext { kv, config, decoder })
    }
}

/// The monitor domain: packet path plus recurring tasks
pub struct Monitor {
    context: MonitorContext,
    intervals: Vec<CountInterval>,
    tasks: Vec<RateTask>,
    alerts: Arc<AlertManager>,
    /// Store updates abandoned while the KV was unreachable
    dropped_updates: u64,
}

impl Monitor {
    /// Build the monitor from configuration: counters for every
    /// resolution, one rate task per configured rate, alarm recovery
    /// included.
    pub async fn new(
        context: MonitorContext,
        alerts: Arc<AlertManager>,
        now: u64,
    ) -> Result<Self, MonitorError> {
        let retention = &context.config.redis_optimization;
        let intervals = Resolution::all()
            .into_iter()
            .map(|resolution| {
                CountInterval::new(resolution, retention.max_len(resolution), now)
            })
            .collect();

        let rate_config = &context.config.rate_monitoring;
        let detector_config = rate_config.detector_config();
        let mut tasks = Vec::new();
        let specs = rate_config.rate_specs()?;
        for (name, spec) in specs {
            debug!(name = %name, key = %spec.key, "installing rate task");
            let mut task = if rate_config.use_enhanced_detection {
                RateTask::enhanced(spec, &detector_config, now)
            } else {
                RateTask::threshold(spec, now)
            };
            task.recover(context.kv.as_ref()).await?;
            tasks.push(task);
        }

        Ok(Monitor {
            context,
            intervals,
            tasks,
            alerts,
            dropped_updates: 0,
        })
    }

    /// Store updates abandoned so far
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates
    }

    /// Count one observation of `key`, at every resolution, and add the
    /// key to its category set on first observation.
    async fn count(
        &mut self,
        key: &str,
        category: Option<Category>,
        now: u64,
    ) -> crate::kv::Result<()> {
        let kv = self.context.kv.as_ref();
        for interval in &mut self.intervals {
            interval.count(kv, key, now).await?;
        }

        if kv.incr(key).await? == 1 {
            if let Some(category) = category {
                kv.sadd(category.set_name(), key).await?;
            }
        }
        Ok(())
    }

    /// The packet path: classify and count one datagram
    pub async fn process_datagram(
        &mut self,
        data: &[u8],
        source: SocketAddr,
        now: u64,
    ) -> crate::kv::Result<()> {
        let outcome = self.context.decoder.decode(data, source);

        self.count("total", None, now).await?;
        let source_key = crate::decoder::render_address(&source);
        self.count(&source_key, Some(Category::IpTraffic), now)
            .await?;

        match outcome {
            DecodeOutcome::Classified(classified) => {
                if let Some(bvll_family) = &classified.bvll_family {
                    self.count(bvll_family, Some(Category::BvllTraffic), now)
                        .await?;
                }
                self.count(&classified.family, Some(classified.category), now)
                    .await?;

                if let Some(forwarder) = &classified.non_bbmd_forwarder {
                    let link = classified
                        .bvll_family
                        .as_deref()
                        .unwrap_or(&classified.family);
                    self.flag_non_bbmd_forwarder(forwarder, link, now).await?;
                }
            }
            DecodeOutcome::Error(failure) => {
                if let Some(bvll_family) = &failure.bvll_family {
                    self.count(bvll_family, Some(Category::BvllTraffic), now)
                        .await?;
                }

                let mut entry = format!("{},{}", failure.kind.label(), source_key);
                if !failure.detail.is_empty() {
                    entry.push(',');
                    entry.push_str(&failure.detail);
                }
                self.context.kv.sadd("error-traffic", &entry).await?;

                if let Some(forwarder) = &failure.non_bbmd_forwarder {
                    let link = failure.bvll_family.as_deref().unwrap_or("ForwardedNPDU");
                    self.flag_non_bbmd_forwarder(forwarder, link, now).await?;
                }
            }
        }

        Ok(())
    }

    /// A Forwarded-NPDU arrived from a peer that is not a configured BBMD
    async fn flag_non_bbmd_forwarder(
        &self,
        forwarder: &str,
        link: &str,
        now: u64,
    ) -> crate::kv::Result<()> {
        let legacy = format!("{}/{}/Forwarded NPDU from non-BBMD", forwarder, link);
        let newly_seen = self.context.kv.sadd("critical-messages", &legacy).await?;

        if newly_seen {
            let mut details = serde_json::Map::new();
            details.insert(
                "bbmd".to_string(),
                serde_json::json!(self.context.config.bacmon.bbmd),
            );
            let _ = self
                .alerts
                .create(
                    "forwarded-npdu",
                    &format!("Forwarded NPDU from non-BBMD source {}", forwarder),
                    AlertLevel::Warning,
                    "decoder",
                    Some(forwarder.to_string()),
                    details,
                    now,
                )
                .await;
        }
        Ok(())
    }

    /// Run every rate task once
    pub async fn run_rate_tasks(&mut self, now: u64) {
        for task in &mut self.tasks {
            if let Err(err) = task
                .tick(self.context.kv.as_ref(), self.alerts.as_ref(), now)
                .await
            {
                warn!(key = task.key(), error = %err, "rate task tick failed");
            }
        }
    }

    /// Trim every series to its configured bound
    async fn cleanup_series(&self) -> crate::kv::Result<()> {
        let kv = self.context.kv.as_ref();
        for resolution in Resolution::all() {
            let bound = self.context.config.redis_optimization.max_len(resolution) as i64;
            let pattern = format!("*:{}", resolution.label());
            for key in kv.scan_keys(&pattern).await? {
                kv.ltrim(&key, 0, bound - 1).await?;
            }
        }
        Ok(())
    }

    /// Flush open buckets; called at shutdown so a restart loses nothing
    pub async fn flush_open_buckets(&mut self, now: u64) -> crate::kv::Result<()> {
        let kv = self.context.kv.as_ref();
        for interval in &mut self.intervals {
            interval.flush(kv).await?;
        }
        kv.set("flush_time", &now.to_string()).await?;
        Ok(())
    }

    /// Bind the socket and run until interrupted
    pub async fn run(mut self) -> Result<(), MonitorError> {
        let bind = self.context.config.bacmon.bind_address();
        let socket = UdpSocket::bind(&bind).await?;
        info!(%bind, "monitoring BACnet/IP traffic");

        let kv = Arc::clone(&self.context.kv);
        kv.set("startup_time", &unix_now().to_string()).await?;
        kv.set("daemon_version", env!("CARGO_PKG_VERSION")).await?;

        let worker = self.alerts.start_worker();

        let scan_interval =
            Duration::from_millis(self.context.config.rate_monitoring.scan_interval);
        let cleanup_interval =
            Duration::from_secs(self.context.config.redis_optimization.cleanup_interval);
        let mut next_scan = tokio::time::Instant::now() + scan_interval;
        let mut next_cleanup = tokio::time::Instant::now() + cleanup_interval;

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut buffer = [0u8; 1500];
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                received = tokio::time::timeout(
                    Duration::from_secs(1),
                    socket.recv_from(&mut buffer),
                ) => {
                    match received {
                        Ok(Ok((length, source))) => {
                            let now = unix_now();
                            if let Err(err) =
                                self.process_datagram(&buffer[..length], source, now).await
                            {
                                self.dropped_updates += 1;
                                warn!(
                                    error = %err,
                                    dropped = self.dropped_updates,
                                    "dropping counter update",
                                );
                            }
                        }
                        Ok(Err(err)) => {
                            error!(error = %err, "socket receive failed");
                        }
                        // timeout: fall through to the task queue
                        Err(_) => {}
                    }
                }
            }

            let now = tokio::time::Instant::now();
            if now >= next_scan {
                self.run_rate_tasks(unix_now()).await;
                next_scan = now + scan_interval;
            }
            if now >= next_cleanup {
                if let Err(err) = self.cleanup_series().await {
                    warn!(error = %err, "cleanup pass failed");
                }
                next_cleanup = now + cleanup_interval;
            }
        }

        if let Err(err) = self.flush_open_buckets(unix_now()).await {
            warn!(error = %err, "failed to flush open buckets at shutdown");
        }
        worker.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RateLimit;
    use crate::kv::MemoryKv;

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

    async fn monitor(kv: Arc<MemoryKv>) -> Monitor {
        let config = BacmonConfig::default();
        let alerts = Arc::new(AlertManager::new(
            kv.clone(),
            Vec::new(),
            RateLimit::default(),
        ));
        let context = MonitorContext::new(kv, config).unwrap();
        Monitor::new(context, alerts, 1000).await.unwrap()
    }

    #[tokio::test]
    async fn test_single_packet_classification() {
        let kv = Arc::new(MemoryKv::new());
        let mut monitor = monitor(kv.clone()).await;

        let source: SocketAddr = "192.0.2.10:47808".parse().unwrap();
        monitor
            .process_datagram(&i_am_packet(12345), source, 1000)
            .await
            .unwrap();

        assert_eq!(kv.get("total").await.unwrap(), Some("1".to_string()));
        assert_eq!(
            kv.smembers("ip-traffic").await.unwrap(),
            vec!["192.0.2.10"]
        );
        assert!(kv
            .smembers("application-traffic")
            .await
            .unwrap()
            .contains(&"IAmRequest,192.0.2.10,12345".to_string()));
        assert!(kv
            .smembers("bvll-traffic")
            .await
            .unwrap()
            .contains(&"OriginalBroadcastNPDU,192.0.2.10".to_string()));

        // after the second boundary, the family's series holds one bucket
        monitor
            .process_datagram(&i_am_packet(12345), source, 1001)
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
    async fn test_family_set_add_is_idempotent() {
        let kv = Arc::new(MemoryKv::new());
        let mut monitor = monitor(kv.clone()).await;
        let source: SocketAddr = "192.0.2.10:47808".parse().unwrap();

        monitor
            .process_datagram(&i_am_packet(7), source, 1000)
            .await
            .unwrap();
        monitor
            .process_datagram(&i_am_packet(7), source, 1000)
            .await
            .unwrap();

        let members = kv.smembers("application-traffic").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(kv.get("IAmRequest,192.0.2.10,7").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_decode_error_recorded() {
        let kv = Arc::new(MemoryKv::new());
        let mut monitor = monitor(kv.clone()).await;
        let source: SocketAddr = "192.0.2.10:47808".parse().unwrap();

        monitor
            .process_datagram(&[0x55, 0x01], source, 1000)
            .await
            .unwrap();

        let errors = kv.smembers("error-traffic").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("non_bvll,192.0.2.10"));
        // the packet still counted toward the totals
        assert_eq!(kv.get("total").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_flush_open_buckets_at_shutdown() {
        let kv = Arc::new(MemoryKv::new());
        let mut monitor = monitor(kv.clone()).await;
        let source: SocketAddr = "192.0.2.10:47808".parse().unwrap();

        for _ in 0..3 {
            monitor
                .process_datagram(&i_am_packet(9), source, 1000)
                .await
                .unwrap();
        }
        monitor.flush_open_buckets(1000).await.unwrap();

        assert_eq!(
            kv.lrange("total:s", 0, 0).await.unwrap(),
            vec!["[1000, 3]"]
        );
        assert_eq!(kv.get("flush_time").await.unwrap(), Some("1000".to_string()));
    }
}
