//! Alert Management
//!
//! Lifecycle for externally visible alerts: admission through the
//! maintenance and rate-limit gates, persistence to the store
//! (`active_alerts` hash while open, bounded `alert_history` list once
//! resolved), and notification dispatch through a single background worker
//! draining a bounded queue.
//!
//! The in-memory state is authoritative; store writes that fail are logged
//! and rewritten by the next successful operation. Channel failures never
//! fail admission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::kv::KvStore;

/// Bound on the resolved-alert history
pub const MAX_ALERT_HISTORY: usize = 1000;

/// Per-send timeout for notification channels
pub const CHANNEL_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the alert subsystem
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("channel send failed: {0}")]
    Send(String),
    #[error("channel configuration invalid: {0}")]
    Config(String),
}

/// Alert severity levels, ordered
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Debug,
    Info,
    Warning,
    Alert,
    Critical,
    Emergency,
}

impl AlertLevel {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Debug => "debug",
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Alert => "alert",
            AlertLevel::Critical => "critical",
            AlertLevel::Emergency => "emergency",
        }
    }

    /// Parse a lowercase name
    pub fn parse(name: &str) -> Option<AlertLevel> {
        match name {
            "debug" => Some(AlertLevel::Debug),
            "info" => Some(AlertLevel::Info),
            "warning" => Some(AlertLevel::Warning),
            "alert" => Some(AlertLevel::Alert),
            "critical" => Some(AlertLevel::Critical),
            "emergency" => Some(AlertLevel::Emergency),
            _ => None,
        }
    }

    /// Store key of the legacy message set for this level
    pub fn legacy_set(&self) -> String {
        format!("{}-messages", self.as_str())
    }
}

fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// An externally visible alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub uuid: String,
    /// Alert type key (e.g. `rate-anomaly`)
    pub key: String,
    pub message: String,
    pub level: AlertLevel,
    /// Component that raised the alert
    pub source: String,
    /// Affected entity, usually a family key
    pub entity: Option<String>,
    pub details: Map<String, Value>,
    /// Creation time (seconds since epoch)
    pub timestamp: u64,
    pub acknowledged: bool,
    pub resolved: bool,
    pub notifications_sent: u32,
}

impl Alert {
    /// Create a new alert; the id is a stable function of key, creation
    /// time and message so duplicates collide across processes.
    pub fn new(
        key: &str,
        message: &str,
        level: AlertLevel,
        source: &str,
        entity: Option<String>,
        details: Map<String, Value>,
        now: u64,
    ) -> Self {
        let uuid = format!(
            "{}_{}_{}",
            key,
            now,
            fnv1a64(message.as_bytes()) % 100_000
        );
        Alert {
            uuid,
            key: key.to_string(),
            message: message.to_string(),
            level,
            source: source.to_string(),
            entity,
            details,
            timestamp: now,
            acknowledged: false,
            resolved: false,
            notifications_sent: 0,
        }
    }

    /// Legacy message-set entry: `entity/key/message`
    pub fn legacy_message(&self) -> String {
        let entity = self.entity.as_deref().unwrap_or("-");
        format!("{}/{}/{}", entity, self.key, self.message)
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A window during which matching alerts are suppressed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceWindow {
    pub name: String,
    pub start_time: u64,
    pub end_time: u64,
    #[serde(default)]
    pub entity_patterns: Vec<String>,
    #[serde(default)]
    pub key_patterns: Vec<String>,
}

impl MaintenanceWindow {
    /// Whether the window covers `now`
    pub fn is_active(&self, now: u64) -> bool {
        self.start_time <= now && now <= self.end_time
    }

    /// Whether this window suppresses the alert. Pattern matching is
    /// substring containment; a window with no patterns at all matches
    /// every alert.
    pub fn matches(&self, alert: &Alert, now: u64) -> bool {
        if !self.is_active(now) {
            return false;
        }

        if self.entity_patterns.is_empty() && self.key_patterns.is_empty() {
            return true;
        }

        if let Some(entity) = &alert.entity {
            if self
                .entity_patterns
                .iter()
                .any(|pattern| entity.contains(pattern))
            {
                return true;
            }
        }

        self.key_patterns
            .iter()
            .any(|pattern| alert.key.contains(pattern))
    }
}

/// Per-key alert admission limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimit {
    /// Admitted alerts per key per hour
    pub max_alerts_per_hour: u32,
    /// Seconds between same-(key, entity) alerts
    pub cooldown_period: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit {
            max_alerts_per_hour: 10,
            cooldown_period: 300,
        }
    }
}

/// One notification transport
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    fn enabled(&self) -> bool;
    fn min_level(&self) -> AlertLevel;

    /// Whether this channel should carry the alert
    fn can_notify(&self, alert: &Alert) -> bool {
        self.enabled() && alert.level >= self.min_level()
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// SMTP email channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_level")]
    pub min_level: AlertLevel,
    pub smtp_server: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub use_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
}

fn default_min_level() -> AlertLevel {
    AlertLevel::Alert
}

fn default_smtp_port() -> u16 {
    25
}

/// SMTP email channel
pub struct EmailChannel {
    config: EmailConfig,
    transport: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Result<Self, AlertError> {
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, Tokio1Executor};

        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
                .map_err(|err| AlertError::Config(err.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_server)
        };
        builder = builder.port(config.smtp_port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(EmailChannel {
            transport: builder.build(),
            config,
        })
    }

    fn body(alert: &Alert) -> String {
        let mut body = format!(
            "Level: {}\nKey: {}\nEntity: {}\nTime: {}\n\n{}\n",
            alert.level.as_str(),
            alert.key,
            alert.entity.as_deref().unwrap_or("-"),
            alert.timestamp,
            alert.message,
        );
        if !alert.details.is_empty() {
            body.push_str("\nDetails:\n");
            for (field, value) in &alert.details {
                body.push_str(&format!("  {}: {}\n", field, value));
            }
        }
        body
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn min_level(&self) -> AlertLevel {
        self.config.min_level
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        use lettre::message::Mailbox;
        use lettre::{AsyncTransport, Message};

        let from: Mailbox = self
            .config
            .from_address
            .parse()
            .map_err(|_| AlertError::Config("invalid from address".to_string()))?;

        let subject = format!("[{}] {}", alert.level.as_str().to_uppercase(), alert.key);
        let body = Self::body(alert);

        for to_address in &self.config.to_addresses {
            let to: Mailbox = to_address
                .parse()
                .map_err(|_| AlertError::Config(format!("invalid address: {}", to_address)))?;
            let message = Message::builder()
                .from(from.clone())
                .to(to)
                .subject(subject.clone())
                .body(body.clone())
                .map_err(|err| AlertError::Send(err.to_string()))?;
            self.transport
                .send(message)
                .await
                .map_err(|err| AlertError::Send(err.to_string()))?;
        }
        Ok(())
    }
}

/// Webhook channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_level")]
    pub min_level: AlertLevel,
    pub url: String,
}

/// HTTP POST channel; 2xx responses count as delivered
pub struct WebhookChannel {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Self {
        WebhookChannel {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn min_level(&self) -> AlertLevel {
        self.config.min_level
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(alert)
            .send()
            .await
            .map_err(|err| AlertError::Send(err.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AlertError::Send(format!(
                "webhook returned {}",
                response.status()
            )))
        }
    }
}

/// Log-file channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_level")]
    pub min_level: AlertLevel,
    pub file: String,
}

/// Append-to-file channel
pub struct LogFileChannel {
    config: LogFileConfig,
}

impl LogFileChannel {
    pub fn new(config: LogFileConfig) -> Self {
        LogFileChannel { config }
    }
}

#[async_trait]
impl NotificationChannel for LogFileChannel {
    fn name(&self) -> &str {
        "logfile"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn min_level(&self) -> AlertLevel {
        self.config.min_level
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        use tokio::io::AsyncWriteExt;

        let line = format!(
            "{} [{}] {} {} {}\n",
            alert.timestamp,
            alert.level.as_str(),
            alert.entity.as_deref().unwrap_or("-"),
            alert.key,
            alert.message,
        );

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.file)
            .await
            .map_err(|err| AlertError::Send(err.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| AlertError::Send(err.to_string()))?;
        Ok(())
    }
}

/// Build the configured notification channels. A channel whose
/// configuration is unusable is skipped with a warning rather than failing
/// startup.
pub fn channels_from_config(
    section: &crate::config::AlertsSection,
) -> Vec<Arc<dyn NotificationChannel>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

    if let Some(email) = &section.email {
        match EmailChannel::new(email.clone()) {
            Ok(channel) => channels.push(Arc::new(channel)),
            Err(err) => warn!(error = %err, "skipping email channel"),
        }
    }
    if let Some(webhook) = &section.webhook {
        channels.push(Arc::new(WebhookChannel::new(webhook.clone())));
    }
    if let Some(logfile) = &section.logfile {
        channels.push(Arc::new(LogFileChannel::new(logfile.clone())));
    }

    channels
}

#[derive(Default)]
struct ManagerState {
    active: HashMap<String, Alert>,
    history: Vec<Alert>,
    windows: Vec<MaintenanceWindow>,
}

/// Central alert lifecycle manager
pub struct AlertManager {
    kv: Arc<dyn KvStore>,
    state: Mutex<ManagerState>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    rate_limit: RateLimit,
    queue_tx: mpsc::Sender<Alert>,
    queue_rx: Mutex<Option<mpsc::Receiver<Alert>>>,
}

impl AlertManager {
    pub fn new(
        kv: Arc<dyn KvStore>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        rate_limit: RateLimit,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(256);
        AlertManager {
            kv,
            state: Mutex::new(ManagerState::default()),
            channels,
            rate_limit,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    /// Rehydrate active alerts, history and maintenance windows from the
    /// store; used at startup by both the monitor and the API server.
    pub async fn load(&self) -> crate::kv::Result<()> {
        let mut state = self.state.lock().await;

        for (uuid, payload) in self.kv.hgetall("active_alerts").await? {
            match serde_json::from_str::<Alert>(&payload) {
                Ok(alert) => {
                    state.active.insert(uuid, alert);
                }
                Err(err) => warn!(%uuid, error = %err, "dropping malformed stored alert"),
            }
        }

        let mut history: Vec<Alert> = Vec::new();
        for payload in self
            .kv
            .lrange("alert_history", 0, MAX_ALERT_HISTORY as i64 - 1)
            .await?
        {
            if let Ok(alert) = serde_json::from_str::<Alert>(&payload) {
                history.push(alert);
            }
        }
        state.history = history;

        if let Some(payload) = self.kv.get("maintenance_windows").await? {
            match serde_json::from_str::<Vec<MaintenanceWindow>>(&payload) {
                Ok(windows) => state.windows = windows,
                Err(err) => warn!(error = %err, "dropping malformed maintenance windows"),
            }
        }

        Ok(())
    }

    fn is_rate_limited(&self, state: &ManagerState, alert: &Alert) -> bool {
        let hour_ago = alert.timestamp.saturating_sub(3600);
        let mut hourly = 0u32;

        for existing in &state.history {
            if existing.key == alert.key {
                if existing.entity == alert.entity
                    && alert.timestamp.saturating_sub(existing.timestamp)
                        < self.rate_limit.cooldown_period
                {
                    return true;
                }
                if existing.timestamp >= hour_ago {
                    hourly += 1;
                }
            }
        }

        // recently admitted alerts count against the hourly limit too
        for existing in state.active.values() {
            if existing.key == alert.key {
                if existing.entity == alert.entity
                    && alert.timestamp.saturating_sub(existing.timestamp)
                        < self.rate_limit.cooldown_period
                {
                    return true;
                }
                if existing.timestamp >= hour_ago {
                    hourly += 1;
                }
            }
        }

        hourly >= self.rate_limit.max_alerts_per_hour
    }

    /// Run an alert through the admission pipeline. Returns the admitted
    /// alert, or `None` when a gate suppressed it.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        key: &str,
        message: &str,
        level: AlertLevel,
        source: &str,
        entity: Option<String>,
        details: Map<String, Value>,
        now: u64,
    ) -> Option<Alert> {
        let alert = Alert::new(key, message, level, source, entity, details, now);

        let mut state = self.state.lock().await;

        for window in &state.windows {
            if window.matches(&alert, now) {
                info!(key, window = %window.name, "alert suppressed by maintenance window");
                return None;
            }
        }

        if self.is_rate_limited(&state, &alert) {
            info!(key, "alert suppressed by rate limit");
            return None;
        }

        state.active.insert(alert.uuid.clone(), alert.clone());
        drop(state);

        if let Err(err) = self
            .kv
            .hset("active_alerts", &alert.uuid, &alert.to_json())
            .await
        {
            warn!(error = %err, "failed to persist alert");
        }
        if let Err(err) = self
            .kv
            .sadd(&alert.level.legacy_set(), &alert.legacy_message())
            .await
        {
            warn!(error = %err, "failed to record legacy message");
        }

        if self.queue_tx.try_send(alert.clone()).is_err() {
            warn!(uuid = %alert.uuid, "notification queue full, skipping dispatch");
        }

        Some(alert)
    }

    /// Mark an alert acknowledged; idempotent
    pub async fn acknowledge(&self, uuid: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(alert) = state.active.get_mut(uuid) else {
            return false;
        };
        alert.acknowledged = true;
        let payload = alert.to_json();
        drop(state);

        if let Err(err) = self.kv.hset("active_alerts", uuid, &payload).await {
            warn!(error = %err, "failed to persist acknowledgment");
        }
        true
    }

    /// Resolve an open alert. Returns false when the alert is not active,
    /// so a second resolve reports false.
    pub async fn resolve(&self, uuid: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(mut alert) = state.active.remove(uuid) else {
            return false;
        };
        alert.resolved = true;
        state.history.insert(0, alert.clone());
        state.history.truncate(MAX_ALERT_HISTORY);
        drop(state);

        if let Err(err) = self.kv.hdel("active_alerts", uuid).await {
            warn!(error = %err, "failed to drop resolved alert from store");
        }
        if let Err(err) = self
            .kv
            .lpush_trim("alert_history", &alert.to_json(), MAX_ALERT_HISTORY)
            .await
        {
            warn!(error = %err, "failed to persist alert history");
        }
        true
    }

    /// Resolve every open alert with the given key and entity
    pub async fn resolve_matching(&self, key: &str, entity: &str) -> usize {
        let uuids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .active
                .values()
                .filter(|alert| alert.key == key && alert.entity.as_deref() == Some(entity))
                .map(|alert| alert.uuid.clone())
                .collect()
        };

        let mut resolved = 0;
        for uuid in uuids {
            if self.resolve(&uuid).await {
                resolved += 1;
            }
        }
        resolved
    }

    /// Open alerts at or above `min_level`, newest first
    pub async fn active_alerts(&self, min_level: AlertLevel) -> Vec<Alert> {
        let state = self.state.lock().await;
        let mut alerts: Vec<Alert> = state
            .active
            .values()
            .filter(|alert| alert.level >= min_level)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        alerts
    }

    /// One alert by id, searching active then history
    pub async fn get(&self, uuid: &str) -> Option<Alert> {
        let state = self.state.lock().await;
        state
            .active
            .get(uuid)
            .cloned()
            .or_else(|| state.history.iter().find(|alert| alert.uuid == uuid).cloned())
    }

    /// Resolved alerts at or above `min_level`, newest first
    pub async fn history(&self, min_level: AlertLevel, limit: usize, offset: usize) -> Vec<Alert> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|alert| alert.level >= min_level)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of open alerts
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    async fn persist_windows(&self) {
        let payload = {
            let state = self.state.lock().await;
            serde_json::to_string(&state.windows).unwrap_or_else(|_| "[]".to_string())
        };
        if let Err(err) = self.kv.set("maintenance_windows", &payload).await {
            warn!(error = %err, "failed to persist maintenance windows");
        }
    }

    /// Add a maintenance window
    pub async fn add_maintenance_window(&self, window: MaintenanceWindow) {
        {
            let mut state = self.state.lock().await;
            state.windows.push(window);
        }
        self.persist_windows().await;
    }

    /// Remove a maintenance window by name
    pub async fn remove_maintenance_window(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            let before = state.windows.len();
            state.windows.retain(|window| window.name != name);
            state.windows.len() != before
        };
        if removed {
            self.persist_windows().await;
        }
        removed
    }

    /// Current maintenance windows
    pub async fn maintenance_windows(&self) -> Vec<MaintenanceWindow> {
        self.state.lock().await.windows.clone()
    }

    /// Spawn the notification worker. The worker is the only code that
    /// performs outbound I/O on the alert path; each channel send is
    /// bounded by [`CHANNEL_SEND_TIMEOUT`].
    pub fn start_worker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut queue_rx = match manager.queue_rx.lock().await.take() {
                Some(queue_rx) => queue_rx,
                None => return,
            };

            while let Some(alert) = queue_rx.recv().await {
                let mut sent = 0u32;
                for channel in &manager.channels {
                    if !channel.can_notify(&alert) {
                        continue;
                    }
                    let outcome =
                        tokio::time::timeout(CHANNEL_SEND_TIMEOUT, channel.send(&alert)).await;
                    match outcome {
                        Ok(Ok(())) => sent += 1,
                        Ok(Err(err)) => {
                            warn!(channel = channel.name(), error = %err, "notification failed")
                        }
                        Err(_) => {
                            warn!(channel = channel.name(), "notification timed out")
                        }
                    }
                }

                if sent > 0 {
                    let mut state = manager.state.lock().await;
                    if let Some(active) = state.active.get_mut(&alert.uuid) {
                        active.notifications_sent += sent;
                        let payload = active.to_json();
                        drop(state);
                        if let Err(err) =
                            manager.kv.hset("active_alerts", &alert.uuid, &payload).await
                        {
                            warn!(error = %err, "failed to persist notification count");
                        }
                    }
                }
            }
        })
    }
}
