//! Bridge engine: the per-channel forwarding pipeline.
//!
//! Each configured channel owns a bounded FIFO queue and a single worker
//! task that drains it serially, so outbound operations leave in the order
//! the inbound envelopes were accepted. Channels are independent; N
//! channels process in parallel.
//!
//! Per envelope: dedup (LRU window + mapping store) → kind dispatch →
//! retry-wrapped delivery to the target adapter → mapping record → ack.
//! Failures are caught here, logged with the source id, and never take the
//! worker down.

use crate::config::ChannelSpec;
use crate::contacts::ContactResolver;
use crate::envelope::{Direction, Envelope, EnvelopeKind, MediaKind, MediaSource, Platform};
use crate::error::BridgeError;
use crate::media::MediaCache;
use crate::retry::{self, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::signal::{OutgoingSignal, SignalApi};
use crate::storage::{MessageMapping, MessageStore};
use crate::whatsapp::{OutgoingWhatsApp, WhatsAppApi};
use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Source ids remembered per channel for replay suppression.
const DEDUP_WINDOW: usize = 10_000;

/// Everything a channel worker needs to run its pipeline.
#[derive(Clone)]
pub struct ChannelContext {
    pub spec: ChannelSpec,
    pub store: Arc<Mutex<MessageStore>>,
    pub media: Arc<MediaCache>,
    pub contacts: Arc<ContactResolver>,
    pub whatsapp: Arc<dyn WhatsAppApi>,
    pub signal: Arc<dyn SignalApi>,
    pub retry: RetryPolicy,
}

/// Handle to a running channel worker. Dropping the sender lets the worker
/// drain its queue and stop.
pub struct ChannelHandle {
    pub sender: mpsc::Sender<Envelope>,
    pub join: JoinHandle<()>,
}

/// Ingress side of a channel queue, handed to the webhook server and the
/// Signal poller.
#[derive(Clone)]
pub struct ChannelIngress {
    pub channel: String,
    pub sender: mpsc::Sender<Envelope>,
}

/// Terminal state of one envelope.
#[derive(Debug)]
pub enum Outcome {
    Done,
    Skipped(&'static str),
    Failed(BridgeError),
}

/// Spawn the worker task for one channel.
pub fn spawn_channel(
    ctx: ChannelContext,
    queue_capacity: usize,
    shutdown: Shutdown,
) -> ChannelHandle {
    let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
    let join = tokio::spawn(run_worker(ctx, receiver, shutdown));
    ChannelHandle { sender, join }
}

async fn run_worker(ctx: ChannelContext, mut receiver: mpsc::Receiver<Envelope>, shutdown: Shutdown) {
    let channel = ctx.spec.whatsapp_session.clone();
    let mut worker = ChannelWorker {
        ctx,
        dedup: LruCache::new(NonZeroUsize::new(DEDUP_WINDOW).expect("window is nonzero")),
        shutdown: shutdown.clone(),
    };
    worker.rehydrate().await;
    info!(channel = %channel, "channel worker started");

    let mut shutdown = shutdown;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.raised() => break,
            envelope = receiver.recv() => match envelope {
                // All senders dropped: the channel was removed from config.
                // The queue is already drained at this point.
                None => break,
                Some(envelope) => worker.handle(envelope).await,
            }
        }
    }
    info!(channel = %channel, "channel worker stopped");
}

struct ChannelWorker {
    ctx: ChannelContext,
    dedup: LruCache<(Platform, String), ()>,
    shutdown: Shutdown,
}

impl ChannelWorker {
    fn channel(&self) -> &str {
        &self.ctx.spec.whatsapp_session
    }

    /// Reload the dedup window from the mapping store after a restart.
    async fn rehydrate(&mut self) {
        let store = self.ctx.store.lock().await;
        match store.recent_source_ids(&self.ctx.spec.whatsapp_session, DEDUP_WINDOW) {
            Ok(ids) => {
                // newest-first from the store; insert oldest-first so the
                // newest ids are the last to be evicted.
                for key in ids.into_iter().rev() {
                    self.dedup.put(key, ());
                }
            }
            Err(e) => error!(channel = %self.ctx.spec.whatsapp_session, error = %e, "dedup rehydration failed"),
        }
    }

    async fn handle(&mut self, envelope: Envelope) {
        let kind = envelope.kind.label();
        let source_id = envelope.source_id.clone();
        let outcome = match self.process(&envelope).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(e),
        };
        match &outcome {
            Outcome::Done => {
                self.dedup.put(envelope.dedup_key(), ());
                info!(channel = %self.channel(), source_id = %source_id, kind, "envelope bridged");
            }
            Outcome::Skipped(reason) => {
                self.dedup.put(envelope.dedup_key(), ());
                debug!(channel = %self.channel(), source_id = %source_id, kind, reason, "envelope skipped");
            }
            Outcome::Failed(e) => {
                error!(channel = %self.channel(), source_id = %source_id, kind, error = %e, "envelope failed");
            }
        }
    }

    async fn process(&mut self, env: &Envelope) -> Result<Outcome, BridgeError> {
        // Dedup: window hit or existing mapping means replay or echo.
        let key = env.dedup_key();
        if self.dedup.contains(&key) {
            return Ok(Outcome::Skipped("duplicate"));
        }
        {
            let store = self.ctx.store.lock().await;
            if store
                .lookup_by_platform(&env.channel, env.direction.source(), &env.source_id)?
                .is_some()
            {
                return Ok(Outcome::Skipped("already_mapped"));
            }
        }

        match &env.kind {
            EnvelopeKind::Text { body } => {
                let body = self.prefixed_body(env, body).await;
                let counterpart = self.dispatch_send(env, body, None, None).await?;
                self.record(env, counterpart, None, None, None).await?;
                Ok(Outcome::Done)
            }
            EnvelopeKind::Media {
                kind,
                source,
                caption,
            } => self.process_media(env, *kind, source, caption.as_deref()).await,
            EnvelopeKind::Reply {
                body,
                reply_to,
                quoted,
            } => self.process_reply(env, body, reply_to, quoted.as_deref()).await,
            EnvelopeKind::Edit { target, new_body } => {
                self.process_edit(env, target, new_body).await
            }
            EnvelopeKind::Delete { target } => self.process_delete(env, target).await,
            EnvelopeKind::React { target, emoji } => self.process_react(env, target, emoji).await,
        }
    }

    async fn process_media(
        &self,
        env: &Envelope,
        kind: MediaKind,
        source: &MediaSource,
        caption: Option<&str>,
    ) -> Result<Outcome, BridgeError> {
        let media = self.ctx.media.clone();
        let acquired = retry::retry(&self.ctx.retry, &self.shutdown, "media_acquire", |_| {
            let media = media.clone();
            let source = source.clone();
            async move { media.acquire(&source, kind).await }
        })
        .await;

        match acquired {
            Ok(artifact) => {
                let body = match caption {
                    Some(c) => self.prefixed_body(env, c).await,
                    None => String::new(),
                };
                let counterpart = self
                    .dispatch_send(env, body, None, Some(artifact.local_path.clone()))
                    .await?;
                self.record(env, counterpart, None, None, Some(artifact.fingerprint))
                    .await?;
                Ok(Outcome::Done)
            }
            Err(BridgeError::MediaRejected(reason)) => {
                // The counterpart gets a system notice instead of nothing.
                let notice = format!("[media rejected: {reason}]");
                let counterpart = self.dispatch_send(env, notice, None, None).await?;
                self.record(env, counterpart, None, None, None).await?;
                Ok(Outcome::Done)
            }
            Err(e) => Err(e),
        }
    }

    async fn process_reply(
        &self,
        env: &Envelope,
        body: &str,
        reply_to: &str,
        quoted: Option<&str>,
    ) -> Result<Outcome, BridgeError> {
        let referent = {
            let store = self.ctx.store.lock().await;
            store.lookup_by_platform(&env.channel, env.direction.source(), reply_to)?
        };

        match referent {
            Some(mapping) => {
                let counterpart_ref = mapping.id_on(target_of(env.direction)).to_owned();
                let root_wa = mapping
                    .thread_root_wa
                    .clone()
                    .unwrap_or_else(|| mapping.wa_id.clone());
                let root_signal = mapping
                    .thread_root_signal
                    .clone()
                    .unwrap_or_else(|| mapping.signal_id.clone());
                let body = self.prefixed_body(env, body).await;
                let counterpart = self
                    .dispatch_send(env, body, Some(counterpart_ref), None)
                    .await?;
                self.record(env, counterpart, Some(root_wa), Some(root_signal), None)
                    .await?;
                Ok(Outcome::Done)
            }
            None => {
                // TTL-expired or never bridged: deliver unthreaded, quoting
                // the original when the platform handed us a snippet.
                let fallback = match quoted {
                    Some(q) => format!("> {q}\n{body}"),
                    None => body.to_owned(),
                };
                let fallback = self.prefixed_body(env, &fallback).await;
                let counterpart = self.dispatch_send(env, fallback, None, None).await?;
                self.record(env, counterpart, None, None, None).await?;
                Ok(Outcome::Done)
            }
        }
    }

    async fn process_edit(
        &self,
        env: &Envelope,
        target: &str,
        new_body: &str,
    ) -> Result<Outcome, BridgeError> {
        let mapping = {
            let store = self.ctx.store.lock().await;
            store.lookup_by_platform(&env.channel, env.direction.source(), target)?
        };

        match (env.direction, mapping) {
            // WhatsApp supports edits natively.
            (Direction::SignalToWhatsApp, Some(mapping)) => {
                let api = self.ctx.whatsapp.clone();
                let session = self.ctx.spec.whatsapp_session.clone();
                let wa_id = mapping.wa_id.clone();
                let body = new_body.to_owned();
                retry::retry(&self.ctx.retry, &self.shutdown, "whatsapp_edit", move |_| {
                    let api = api.clone();
                    let session = session.clone();
                    let wa_id = wa_id.clone();
                    let body = body.clone();
                    async move { api.edit_message(&session, &wa_id, &body).await }
                })
                .await?;
                let mut store = self.ctx.store.lock().await;
                store.touch(&env.channel, Platform::Signal, target, Utc::now())?;
                Ok(Outcome::Done)
            }
            // Signal has no remote edit: deliver a new message instead.
            (Direction::WhatsAppToSignal, mapping) => {
                let body = self
                    .prefixed_body(env, &format!("[edited] {new_body}"))
                    .await;
                let counterpart = self.dispatch_send(env, body, None, None).await?;
                self.record(env, counterpart, None, None, None).await?;
                if mapping.is_some() {
                    let mut store = self.ctx.store.lock().await;
                    store.touch(&env.channel, Platform::WhatsApp, target, Utc::now())?;
                }
                Ok(Outcome::Done)
            }
            // Edit of a message that was never bridged: deliver as new.
            (Direction::SignalToWhatsApp, None) => {
                let counterpart = self
                    .dispatch_send(env, format!("[edited] {new_body}"), None, None)
                    .await?;
                self.record(env, counterpart, None, None, None).await?;
                Ok(Outcome::Done)
            }
        }
    }

    async fn process_delete(&self, env: &Envelope, target: &str) -> Result<Outcome, BridgeError> {
        let mapping = {
            let store = self.ctx.store.lock().await;
            store.lookup_by_platform(&env.channel, env.direction.source(), target)?
        };
        let Some(mapping) = mapping else {
            return Ok(Outcome::Skipped("unmapped_delete"));
        };

        match env.direction {
            Direction::WhatsAppToSignal => {
                let api = self.ctx.signal.clone();
                let dest = self.ctx.spec.signal_destination.clone();
                let signal_id = mapping.signal_id.clone();
                retry::retry(&self.ctx.retry, &self.shutdown, "signal_delete", move |_| {
                    let api = api.clone();
                    let dest = dest.clone();
                    let signal_id = signal_id.clone();
                    async move { api.remote_delete(&dest, &signal_id).await }
                })
                .await?;
            }
            Direction::SignalToWhatsApp => {
                let api = self.ctx.whatsapp.clone();
                let session = self.ctx.spec.whatsapp_session.clone();
                let wa_id = mapping.wa_id.clone();
                retry::retry(&self.ctx.retry, &self.shutdown, "whatsapp_delete", move |_| {
                    let api = api.clone();
                    let session = session.clone();
                    let wa_id = wa_id.clone();
                    async move { api.delete_message(&session, &wa_id).await }
                })
                .await?;
            }
        }

        let mut store = self.ctx.store.lock().await;
        store.delete_mapping(&env.channel, env.direction.source(), target)?;
        Ok(Outcome::Done)
    }

    async fn process_react(
        &self,
        env: &Envelope,
        target: &str,
        emoji: &str,
    ) -> Result<Outcome, BridgeError> {
        let mapping = {
            let store = self.ctx.store.lock().await;
            store.lookup_by_platform(&env.channel, env.direction.source(), target)?
        };
        let Some(mapping) = mapping else {
            return Ok(Outcome::Skipped("unmapped_reaction"));
        };

        // Reactions are best-effort and never mapped.
        match env.direction {
            Direction::WhatsAppToSignal => {
                let api = self.ctx.signal.clone();
                let dest = self.ctx.spec.signal_destination.clone();
                let signal_id = mapping.signal_id.clone();
                let emoji = emoji.to_owned();
                retry::retry(&self.ctx.retry, &self.shutdown, "signal_react", move |_| {
                    let api = api.clone();
                    let dest = dest.clone();
                    let signal_id = signal_id.clone();
                    let emoji = emoji.clone();
                    async move { api.react(&dest, &signal_id, &emoji).await }
                })
                .await?;
            }
            Direction::SignalToWhatsApp => {
                let api = self.ctx.whatsapp.clone();
                let session = self.ctx.spec.whatsapp_session.clone();
                let wa_id = mapping.wa_id.clone();
                let emoji = emoji.to_owned();
                retry::retry(&self.ctx.retry, &self.shutdown, "whatsapp_react", move |_| {
                    let api = api.clone();
                    let session = session.clone();
                    let wa_id = wa_id.clone();
                    let emoji = emoji.clone();
                    async move { api.react(&session, &wa_id, &emoji).await }
                })
                .await?;
            }
        }

        let mut store = self.ctx.store.lock().await;
        store.touch(&env.channel, env.direction.source(), target, Utc::now())?;
        Ok(Outcome::Done)
    }

    /// Prefix `"<name>: "` when a group-originated message lands in a 1:1
    /// chat, so the Signal side can tell speakers apart. Equal-kind pairs
    /// are never prefixed.
    async fn prefixed_body(&self, env: &Envelope, body: &str) -> String {
        if env.direction == Direction::WhatsAppToSignal && env.from_group {
            let name = self.ctx.contacts.resolve(&env.sender).await;
            format!("{name}: {body}")
        } else {
            body.to_owned()
        }
    }

    /// Deliver one message to the target adapter, wrapped in the retry
    /// executor. Returns the counterpart id the target assigned.
    async fn dispatch_send(
        &self,
        env: &Envelope,
        body: String,
        reply_to: Option<String>,
        media_path: Option<String>,
    ) -> Result<String, BridgeError> {
        match env.direction {
            Direction::WhatsAppToSignal => {
                let api = self.ctx.signal.clone();
                let dest = self.ctx.spec.signal_destination.clone();
                let out = OutgoingSignal {
                    body,
                    reply_to,
                    attachment: media_path,
                };
                retry::retry(&self.ctx.retry, &self.shutdown, "signal_send", move |_| {
                    let api = api.clone();
                    let dest = dest.clone();
                    let out = out.clone();
                    async move { api.send(&dest, &out).await }
                })
                .await
            }
            Direction::SignalToWhatsApp => {
                let api = self.ctx.whatsapp.clone();
                let session = self.ctx.spec.whatsapp_session.clone();
                let out = OutgoingWhatsApp {
                    body,
                    reply_to,
                    media_path,
                    correlation_id: env.source_id.clone(),
                };
                retry::retry(&self.ctx.retry, &self.shutdown, "whatsapp_send", move |_| {
                    let api = api.clone();
                    let session = session.clone();
                    let out = out.clone();
                    async move { api.send_message(&session, &out).await }
                })
                .await
            }
        }
    }

    /// Persist the new cross-platform mapping. Runs only after the sink
    /// accepted the message.
    async fn record(
        &self,
        env: &Envelope,
        counterpart_id: String,
        thread_root_wa: Option<String>,
        thread_root_signal: Option<String>,
        media_fingerprint: Option<String>,
    ) -> Result<(), BridgeError> {
        let now = Utc::now();
        let (wa_id, signal_id) = match env.direction {
            Direction::WhatsAppToSignal => (env.source_id.clone(), counterpart_id),
            Direction::SignalToWhatsApp => (counterpart_id, env.source_id.clone()),
        };
        let mapping = MessageMapping {
            channel: env.channel.clone(),
            wa_id,
            signal_id,
            direction: env.direction,
            created_at: now,
            last_seen_at: now,
            thread_root_wa,
            thread_root_signal,
            media_fingerprint,
        };
        let mut store = self.ctx.store.lock().await;
        store.record(&mapping)
    }
}

fn target_of(direction: Direction) -> Platform {
    match direction {
        Direction::WhatsAppToSignal => Platform::Signal,
        Direction::SignalToWhatsApp => Platform::WhatsApp,
    }
}
