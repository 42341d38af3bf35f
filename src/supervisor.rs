//! Scheduler/supervisor.
//!
//! Owns every long-running task: channel workers, the webhook server, the
//! Signal poll loop, the retention sweep, the contact refresh, the
//! WhatsApp session health probe, and the config-file watcher. A single
//! shutdown signal propagates to all of them; on shutdown, loops get a
//! grace period to drain in-flight work before the supervisor returns.
//!
//! Config reloads are applied atomically: the new value is broadcast to
//! subscribers, removed channels are drained then stopped, and added
//! channels are started. An invalid config file is logged and ignored.

use crate::bridge::{self, ChannelContext, ChannelHandle, ChannelIngress};
use crate::config::{self, BridgeConfig, ChannelSpec};
use crate::contacts::{ContactResolver, ContactSource};
use crate::error::BridgeError;
use crate::media::MediaCache;
use crate::shutdown::{self, Shutdown, ShutdownHandle};
use crate::signal::{self, SignalApi, SignalRpcClient};
use crate::storage::MessageStore;
use crate::webhook::{self, WebhookState};
use crate::whatsapp::{SessionStatus, WhatsAppApi, WhatsAppClient};
use chrono::Utc;
use notify::Watcher;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(60);
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

/// Per-adapter degraded bits, flipped by probes and pollers, read by
/// operators via logs.
#[derive(Clone, Default)]
pub struct HealthState {
    pub whatsapp_degraded: Arc<AtomicBool>,
    pub signal_degraded: Arc<AtomicBool>,
}

pub struct Supervisor {
    config_path: Option<PathBuf>,
    config: Arc<BridgeConfig>,
    store: Arc<Mutex<MessageStore>>,
    media: Arc<MediaCache>,
    contacts: Arc<ContactResolver>,
    whatsapp: Arc<dyn WhatsAppApi>,
    signal: Arc<dyn SignalApi>,
    health: HealthState,
    channels: HashMap<String, ChannelHandle>,
    webhook_state: Option<Arc<WebhookState>>,
    poller: Option<(ShutdownHandle, JoinHandle<()>)>,
    config_tx: broadcast::Sender<Arc<BridgeConfig>>,
    shutdown_handle: ShutdownHandle,
    shutdown: Shutdown,
}

/// Build a supervisor with the production adapters.
pub fn build(config_path: Option<PathBuf>, config: BridgeConfig) -> Result<Supervisor, BridgeError> {
    let store = Arc::new(Mutex::new(MessageStore::open(&config.database_path)?));
    let media = Arc::new(MediaCache::new(config.media.clone(), store.clone())?);
    media.scan_orphans()?;

    let whatsapp = Arc::new(WhatsAppClient::new(&config.whatsapp)?);
    let signal = Arc::new(SignalRpcClient::new(&config.signal)?);
    let contacts = Arc::new(ContactResolver::new(
        store.clone(),
        whatsapp.clone() as Arc<dyn ContactSource>,
        chrono::Duration::hours(i64::from(config.contact_cache_hours)),
    ));

    Ok(Supervisor::new(
        config_path,
        config,
        store,
        media,
        contacts,
        whatsapp,
        signal,
    ))
}

impl Supervisor {
    /// Assemble a supervisor from already-built components (tests inject
    /// fakes here).
    pub fn new(
        config_path: Option<PathBuf>,
        config: BridgeConfig,
        store: Arc<Mutex<MessageStore>>,
        media: Arc<MediaCache>,
        contacts: Arc<ContactResolver>,
        whatsapp: Arc<dyn WhatsAppApi>,
        signal: Arc<dyn SignalApi>,
    ) -> Self {
        let (config_tx, _) = broadcast::channel(8);
        let (shutdown_handle, shutdown) = shutdown::channel();
        Supervisor {
            config_path,
            config: Arc::new(config),
            store,
            media,
            contacts,
            whatsapp,
            signal,
            health: HealthState::default(),
            channels: HashMap::new(),
            webhook_state: None,
            poller: None,
            config_tx,
            shutdown_handle,
            shutdown,
        }
    }

    /// Subscribe to configuration reloads. Each subscriber runs in its own
    /// task; a slow or dead subscriber only lags its own receiver.
    pub fn subscribe_config(&self) -> broadcast::Receiver<Arc<BridgeConfig>> {
        self.config_tx.subscribe()
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Run until `external_shutdown` resolves (typically SIGINT/SIGTERM),
    /// then drain within the configured grace period.
    pub async fn run(
        mut self,
        external_shutdown: impl Future<Output = ()>,
    ) -> Result<(), BridgeError> {
        // Channel workers first, so both ingress paths have queues.
        for spec in self.config.channels.clone() {
            self.start_channel(spec);
        }

        // Webhook server.
        let webhook_state = Arc::new(WebhookState::new(
            self.config.whatsapp.webhook_secret.clone(),
            self.config.webhook.clone(),
            self.webhook_routes(),
            self.store.clone(),
        ));
        self.webhook_state = Some(webhook_state.clone());
        let listener = tokio::net::TcpListener::bind(&self.config.webhook.bind)
            .await
            .map_err(|e| {
                BridgeError::InvalidConfig(format!(
                    "binding webhook listener on {}: {e}",
                    self.config.webhook.bind
                ))
            })?;
        info!(addr = %self.config.webhook.bind, "webhook listener bound");
        let mut server_shutdown = self.shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, webhook::router(webhook_state))
                .with_graceful_shutdown(async move { server_shutdown.raised().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "webhook server failed");
            }
        });

        // Signal poll loop.
        self.restart_poller();

        // Config file watcher.
        let (reload_tx, mut reload_rx) = mpsc::channel::<()>(4);
        let _watcher = self.config_path.as_ref().and_then(|path| {
            match watch_config_file(path.clone(), reload_tx) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, "config watcher unavailable, hot reload disabled");
                    None
                }
            }
        });

        // Periodic work.
        let sweep_every =
            Duration::from_secs(u64::from(self.config.cleanup_interval_hours) * 3600);
        let contact_every =
            Duration::from_secs(u64::from(self.config.contact_cache_hours) * 3600);
        let mut sweep_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + sweep_every,
            sweep_every,
        );
        let mut contact_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + contact_every,
            contact_every,
        );
        let mut health_timer = tokio::time::interval(HEALTH_PROBE_INTERVAL);
        sweep_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        contact_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(channels = self.channels.len(), "bridge running");
        tokio::pin!(external_shutdown);
        loop {
            tokio::select! {
                _ = &mut external_shutdown => break,
                _ = sweep_timer.tick() => self.run_sweep().await,
                _ = contact_timer.tick() => {
                    let refreshed = self.contacts.refresh_stale(Utc::now()).await;
                    info!(refreshed, "contact cache refresh finished");
                }
                _ = health_timer.tick() => self.probe_whatsapp_health().await,
                Some(()) = reload_rx.recv() => {
                    // Editors fire bursts of fs events; coalesce them.
                    tokio::time::sleep(RELOAD_DEBOUNCE).await;
                    while reload_rx.try_recv().is_ok() {}
                    self.reload_config().await;
                }
            }
        }

        info!("shutdown requested, draining");
        self.drain().await;
        let _ = server.await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Channel lifecycle
    // -----------------------------------------------------------------------

    fn channel_context(&self, spec: ChannelSpec) -> ChannelContext {
        ChannelContext {
            spec,
            store: self.store.clone(),
            media: self.media.clone(),
            contacts: self.contacts.clone(),
            whatsapp: self.whatsapp.clone(),
            signal: self.signal.clone(),
            retry: self.config.retry.clone(),
        }
    }

    fn start_channel(&mut self, spec: ChannelSpec) {
        let session = spec.whatsapp_session.clone();
        let handle = bridge::spawn_channel(
            self.channel_context(spec),
            self.config.queue_capacity,
            self.shutdown.clone(),
        );
        info!(channel = %session, "channel started");
        self.channels.insert(session, handle);
    }

    fn webhook_routes(&self) -> HashMap<String, ChannelIngress> {
        self.channels
            .iter()
            .map(|(session, handle)| {
                (
                    session.clone(),
                    ChannelIngress {
                        channel: session.clone(),
                        sender: handle.sender.clone(),
                    },
                )
            })
            .collect()
    }

    fn signal_routes(&self) -> HashMap<String, ChannelIngress> {
        self.config
            .channels
            .iter()
            .filter_map(|spec| {
                self.channels.get(&spec.whatsapp_session).map(|handle| {
                    (
                        spec.signal_destination.clone(),
                        ChannelIngress {
                            channel: spec.whatsapp_session.clone(),
                            sender: handle.sender.clone(),
                        },
                    )
                })
            })
            .collect()
    }

    /// (Re)start the Signal poll loop with the current routing table. The
    /// previous incarnation is stopped via its own shutdown signal so its
    /// queue senders are released.
    fn restart_poller(&mut self) {
        if let Some((handle, _join)) = self.poller.take() {
            handle.trigger();
        }
        let (handle, poller_shutdown) = shutdown::channel();
        let join = tokio::spawn(signal::run_poll_loop(
            self.signal.clone(),
            self.signal_routes(),
            self.store.clone(),
            self.config.signal.poll_interval,
            self.config.signal.poll_timeout,
            self.config.retry.clone(),
            self.health.signal_degraded.clone(),
            poller_shutdown,
        ));
        self.poller = Some((handle, join));
    }

    // -----------------------------------------------------------------------
    // Periodic work
    // -----------------------------------------------------------------------

    async fn run_sweep(&self) {
        let retention = chrono::Duration::days(i64::from(self.config.retention_days));
        let report = {
            let mut store = self.store.lock().await;
            store.sweep(Utc::now(), retention)
        };
        match report {
            Ok(report) => {
                info!(
                    mappings = report.deleted_mappings,
                    seen = report.deleted_seen,
                    contacts = report.deleted_contacts,
                    orphaned_media = report.orphaned_fingerprints.len(),
                    "retention sweep finished"
                );
                if !report.orphaned_fingerprints.is_empty() {
                    match self.media.collect(&report.orphaned_fingerprints).await {
                        Ok(collected) => info!(collected, "orphaned media collected"),
                        Err(e) => error!(error = %e, "media collection failed"),
                    }
                }
            }
            Err(e) => error!(error = %e, "retention sweep failed"),
        }
    }

    async fn probe_whatsapp_health(&self) {
        let mut degraded = false;
        for spec in &self.config.channels {
            match self.whatsapp.session_health(&spec.whatsapp_session).await {
                Ok(SessionStatus::Working) => {}
                Ok(status) => {
                    warn!(channel = %spec.whatsapp_session, ?status, "whatsapp session unhealthy");
                    degraded = true;
                }
                Err(e) => {
                    warn!(channel = %spec.whatsapp_session, error = %e, "whatsapp health probe failed");
                    degraded = true;
                }
            }
        }
        let was = self.health.whatsapp_degraded.swap(degraded, Ordering::SeqCst);
        if was != degraded {
            info!(degraded, "whatsapp adapter health changed");
        }
    }

    // -----------------------------------------------------------------------
    // Config reload
    // -----------------------------------------------------------------------

    async fn reload_config(&mut self) {
        let Some(path) = self.config_path.clone() else {
            return;
        };
        let new = match config::load_config_from_path(&path) {
            Ok(new) => Arc::new(new),
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping current config");
                return;
            }
        };

        let (added, removed) = diff_channels(&self.config.channels, &new.channels);
        self.config = new.clone();
        let _ = self.config_tx.send(new);

        for spec in added {
            self.start_channel(spec);
        }

        // Re-route ingress before stopping removed workers so their queue
        // senders drop and the workers drain to completion.
        if let Some(state) = &self.webhook_state {
            state.set_routes(self.webhook_routes_excluding(&removed)).await;
        }
        self.restart_poller();

        for session in removed {
            if let Some(handle) = self.channels.remove(&session) {
                drop(handle.sender);
                let grace = self.config.shutdown_grace;
                if tokio::time::timeout(grace, handle.join).await.is_err() {
                    warn!(channel = %session, "removed channel did not drain within grace");
                } else {
                    info!(channel = %session, "channel drained and stopped");
                }
            }
        }

        if let Some(state) = &self.webhook_state {
            state.set_routes(self.webhook_routes()).await;
        }
        info!(channels = self.channels.len(), "config reloaded");
    }

    fn webhook_routes_excluding(&self, removed: &[String]) -> HashMap<String, ChannelIngress> {
        let mut routes = self.webhook_routes();
        for session in removed {
            routes.remove(session);
        }
        routes
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    async fn drain(&mut self) {
        self.shutdown_handle.trigger();
        if let Some((handle, join)) = self.poller.take() {
            handle.trigger();
            let _ = tokio::time::timeout(self.config.shutdown_grace, join).await;
        }
        let grace = self.config.shutdown_grace;
        for (session, handle) in self.channels.drain() {
            drop(handle.sender);
            if tokio::time::timeout(grace, handle.join).await.is_err() {
                warn!(channel = %session, "channel worker did not stop within grace");
            }
        }
        info!("drained");
    }
}

/// Channel-set diff for a reload: channels to start and sessions to stop.
/// A changed destination counts as remove + add.
pub fn diff_channels(
    old: &[ChannelSpec],
    new: &[ChannelSpec],
) -> (Vec<ChannelSpec>, Vec<String>) {
    let added = new
        .iter()
        .filter(|spec| !old.contains(spec))
        .cloned()
        .collect();
    let removed = old
        .iter()
        .filter(|spec| !new.contains(spec))
        .map(|spec| spec.whatsapp_session.clone())
        .collect();
    (added, removed)
}

fn watch_config_file(
    path: PathBuf,
    tx: mpsc::Sender<()>,
) -> Result<notify::RecommendedWatcher, notify::Error> {
    let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
        if res.is_ok() {
            let _ = tx.blocking_send(());
        }
    })?;
    watcher.watch(&path, notify::RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(session: &str, dest: &str) -> ChannelSpec {
        ChannelSpec {
            whatsapp_session: session.to_owned(),
            signal_destination: dest.to_owned(),
        }
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let old = vec![spec("a", "+1"), spec("b", "+2")];
        let new = vec![spec("b", "+2"), spec("c", "+3")];
        let (added, removed) = diff_channels(&old, &new);
        assert_eq!(added, vec![spec("c", "+3")]);
        assert_eq!(removed, vec!["a".to_owned()]);
    }

    #[test]
    fn changed_destination_is_remove_plus_add() {
        let old = vec![spec("a", "+1")];
        let new = vec![spec("a", "+9")];
        let (added, removed) = diff_channels(&old, &new);
        assert_eq!(added, vec![spec("a", "+9")]);
        assert_eq!(removed, vec!["a".to_owned()]);
    }

    #[test]
    fn identical_sets_diff_to_nothing() {
        let channels = vec![spec("a", "+1"), spec("b", "+2")];
        let (added, removed) = diff_channels(&channels, &channels);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
