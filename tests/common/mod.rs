//! Shared harness for integration tests: recording adapter fakes and a
//! pre-wired bridge environment over a temp store and media cache.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use whatsignal::bridge::{ChannelContext, ChannelHandle, spawn_channel};
use whatsignal::config::{AllowedTypes, ChannelSpec, MediaConfig, MediaLimits};
use whatsignal::contacts::{ContactResolver, ContactSource};
use whatsignal::envelope::{Direction, Envelope, EnvelopeKind};
use whatsignal::error::BridgeError;
use whatsignal::media::MediaCache;
use whatsignal::retry::RetryPolicy;
use whatsignal::shutdown::{Shutdown, ShutdownHandle, channel as shutdown_channel};
use whatsignal::signal::{OutgoingSignal, SignalApi, SignalInbound};
use whatsignal::storage::MessageStore;
use whatsignal::whatsapp::{OutgoingWhatsApp, SessionStatus, WhatsAppApi};

// ---------------------------------------------------------------------------
// Recording Signal fake
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSignal {
    pub sends: std::sync::Mutex<Vec<(String, OutgoingSignal)>>,
    pub deletes: std::sync::Mutex<Vec<(String, String)>>,
    pub reacts: std::sync::Mutex<Vec<(String, String, String)>>,
    /// Fail this many send attempts with a 503 before succeeding.
    pub fail_sends: AtomicU32,
    /// Send attempts entered, counted before the gate and before any
    /// forced failure. Lets tests observe a worker parked mid-dispatch.
    pub attempts: AtomicU32,
    next_id: AtomicU64,
    /// Destinations whose sends block until permits are released.
    gates: std::sync::Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl RecordingSignal {
    pub fn sent(&self) -> Vec<(String, OutgoingSignal)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, out)| out.body).collect()
    }

    /// Make sends to `destination` block until [`Self::release`] is called.
    pub fn gate(&self, destination: &str) -> Arc<Semaphore> {
        let sem = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .unwrap()
            .insert(destination.to_owned(), sem.clone());
        sem
    }
}

#[async_trait]
impl SignalApi for RecordingSignal {
    async fn send(&self, destination: &str, out: &OutgoingSignal) -> Result<String, BridgeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().get(destination).cloned();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        self.sends
            .lock()
            .unwrap()
            .push((destination.to_owned(), out.clone()));
        if self.fail_sends.load(Ordering::SeqCst) > 0 {
            self.fail_sends.fetch_sub(1, Ordering::SeqCst);
            return Err(BridgeError::UpstreamSignal {
                status: Some(503),
                message: "unavailable".to_owned(),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("B{n}"))
    }

    async fn react(
        &self,
        destination: &str,
        target_id: &str,
        emoji: &str,
    ) -> Result<(), BridgeError> {
        self.reacts.lock().unwrap().push((
            destination.to_owned(),
            target_id.to_owned(),
            emoji.to_owned(),
        ));
        Ok(())
    }

    async fn remote_delete(&self, destination: &str, target_id: &str) -> Result<(), BridgeError> {
        self.deletes
            .lock()
            .unwrap()
            .push((destination.to_owned(), target_id.to_owned()));
        Ok(())
    }

    async fn receive(&self, _timeout: Duration) -> Result<Vec<SignalInbound>, BridgeError> {
        Ok(vec![])
    }
}

// ---------------------------------------------------------------------------
// Recording WhatsApp fake
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingWhatsApp {
    pub sends: std::sync::Mutex<Vec<(String, OutgoingWhatsApp)>>,
    pub edits: std::sync::Mutex<Vec<(String, String, String)>>,
    pub deletes: std::sync::Mutex<Vec<(String, String)>>,
    pub reacts: std::sync::Mutex<Vec<(String, String, String)>>,
    next_id: AtomicU64,
}

impl RecordingWhatsApp {
    pub fn sent(&self) -> Vec<(String, OutgoingWhatsApp)> {
        self.sends.lock().unwrap().clone()
    }
}

#[async_trait]
impl WhatsAppApi for RecordingWhatsApp {
    async fn send_message(
        &self,
        session: &str,
        out: &OutgoingWhatsApp,
    ) -> Result<String, BridgeError> {
        self.sends
            .lock()
            .unwrap()
            .push((session.to_owned(), out.clone()));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("WA{n}"))
    }

    async fn edit_message(
        &self,
        session: &str,
        wa_id: &str,
        new_body: &str,
    ) -> Result<(), BridgeError> {
        self.edits.lock().unwrap().push((
            session.to_owned(),
            wa_id.to_owned(),
            new_body.to_owned(),
        ));
        Ok(())
    }

    async fn delete_message(&self, session: &str, wa_id: &str) -> Result<(), BridgeError> {
        self.deletes
            .lock()
            .unwrap()
            .push((session.to_owned(), wa_id.to_owned()));
        Ok(())
    }

    async fn react(&self, session: &str, wa_id: &str, emoji: &str) -> Result<(), BridgeError> {
        self.reacts.lock().unwrap().push((
            session.to_owned(),
            wa_id.to_owned(),
            emoji.to_owned(),
        ));
        Ok(())
    }

    async fn session_health(&self, _session: &str) -> Result<SessionStatus, BridgeError> {
        Ok(SessionStatus::Working)
    }
}

// ---------------------------------------------------------------------------
// Contact fake
// ---------------------------------------------------------------------------

pub struct FixedContacts;

#[async_trait]
impl ContactSource for FixedContacts {
    async fn fetch(&self, handle: &str) -> Result<Option<String>, BridgeError> {
        Ok(match handle {
            "wa-alice" => Some("alice".to_owned()),
            "wa-bob" => Some("bob".to_owned()),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

pub struct TestEnv {
    pub store: Arc<AsyncMutex<MessageStore>>,
    pub media: Arc<MediaCache>,
    pub contacts: Arc<ContactResolver>,
    pub whatsapp: Arc<RecordingWhatsApp>,
    pub signal: Arc<RecordingSignal>,
    pub shutdown_handle: ShutdownHandle,
    pub shutdown: Shutdown,
    pub media_dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let store = Arc::new(AsyncMutex::new(MessageStore::open_in_memory().unwrap()));
        let media_dir = tempfile::tempdir().unwrap();
        let media_config = MediaConfig {
            cache_dir: media_dir.path().to_path_buf(),
            limits: MediaLimits {
                image: 1024,
                video: 1024,
                document: 1024,
                voice: 1024,
            },
            allowed: AllowedTypes {
                image: vec!["image/png".to_owned()],
                video: vec!["video/mp4".to_owned()],
                document: vec!["application/pdf".to_owned()],
                voice: vec!["audio/ogg".to_owned()],
            },
        };
        let media = Arc::new(MediaCache::new(media_config, store.clone()).unwrap());
        let contacts = Arc::new(ContactResolver::new(
            store.clone(),
            Arc::new(FixedContacts),
            chrono::Duration::hours(24),
        ));
        let (shutdown_handle, shutdown) = shutdown_channel();
        TestEnv {
            store,
            media,
            contacts,
            whatsapp: Arc::new(RecordingWhatsApp::default()),
            signal: Arc::new(RecordingSignal::default()),
            shutdown_handle,
            shutdown,
            media_dir,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 5,
            jitter: false,
        }
    }

    pub fn context(&self, session: &str, destination: &str) -> ChannelContext {
        ChannelContext {
            spec: ChannelSpec {
                whatsapp_session: session.to_owned(),
                signal_destination: destination.to_owned(),
            },
            store: self.store.clone(),
            media: self.media.clone(),
            contacts: self.contacts.clone(),
            whatsapp: self.whatsapp.clone(),
            signal: self.signal.clone(),
            retry: self.retry_policy(),
        }
    }

    pub fn spawn(&self, session: &str, destination: &str, capacity: usize) -> ChannelHandle {
        spawn_channel(
            self.context(session, destination),
            capacity,
            self.shutdown.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Envelope builders
// ---------------------------------------------------------------------------

pub fn wa_text(channel: &str, id: &str, body: &str) -> Envelope {
    Envelope {
        channel: channel.to_owned(),
        source_id: id.to_owned(),
        sender: "wa-alice".to_owned(),
        from_group: true,
        direction: Direction::WhatsAppToSignal,
        timestamp: Utc::now(),
        kind: EnvelopeKind::Text {
            body: body.to_owned(),
        },
    }
}

pub fn signal_kind(channel: &str, id: &str, kind: EnvelopeKind) -> Envelope {
    Envelope {
        channel: channel.to_owned(),
        source_id: id.to_owned(),
        sender: "+15550001".to_owned(),
        from_group: false,
        direction: Direction::SignalToWhatsApp,
        timestamp: Utc::now(),
        kind,
    }
}

/// Wait until `check` passes or the deadline lapses.
pub async fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while !check() {
        assert!(
            start.elapsed() < deadline,
            "condition not met within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
