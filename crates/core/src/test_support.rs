//! Scripted upstream used by the session, registry and manager tests.

use crate::{
    config::ManagerConfig,
    error::{RealtimeError, RealtimeResult},
    upstream::{LinkEvent, LinkOptions, UpstreamChannel, UpstreamConnector, UpstreamLink},
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;

/// A command the fake link received, in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Sent {
    Audio(Bytes),
    Text(String),
    Commit,
    ResponseCreate,
    Close,
}

/// How the fake provider answers the session configuration.
#[derive(Debug, Clone)]
pub(crate) enum Handshake {
    Ack,
    Fail(RealtimeError),
    /// Never answers; the session's handshake timeout decides.
    Hang,
}

pub(crate) struct FakeConnector {
    handshake: Handshake,
    open_delay: Duration,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<Sent>>>,
    last_options: Mutex<Option<LinkOptions>>,
    provider_tx: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl FakeConnector {
    pub(crate) fn new(handshake: Handshake, open_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            handshake,
            open_delay,
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
            last_options: Mutex::new(None),
            provider_tx: Mutex::new(None),
        })
    }

    pub(crate) fn acking() -> Arc<Self> {
        Self::new(Handshake::Ack, Duration::ZERO)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Links opened and not yet dropped.
    pub(crate) fn live_links(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub(crate) fn last_options(&self) -> Option<LinkOptions> {
        self.last_options.lock().clone()
    }

    /// Pushes a provider-side event into the most recently opened link.
    pub(crate) async fn emit(&self, event: LinkEvent) {
        let sender = self.provider_tx.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Simulates the provider connection vanishing.
    pub(crate) fn drop_connection(&self) {
        self.provider_tx.lock().take();
    }
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn open(&self, options: LinkOptions) -> RealtimeResult<UpstreamChannel> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let (tx, rx) = mpsc::channel(64);
        match &self.handshake {
            Handshake::Ack => {
                let _ = tx.send(LinkEvent::Ready).await;
            }
            Handshake::Fail(err) => {
                let _ = tx.send(LinkEvent::Failed(err.clone())).await;
            }
            Handshake::Hang => {}
        }
        *self.provider_tx.lock() = Some(tx);
        *self.last_options.lock() = Some(options);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(UpstreamChannel {
            link: Box::new(FakeLink {
                sent: self.sent.clone(),
                live: self.live.clone(),
            }),
            events: rx,
        })
    }
}

struct FakeLink {
    sent: Arc<Mutex<Vec<Sent>>>,
    live: Arc<AtomicUsize>,
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpstreamLink for FakeLink {
    async fn send_audio(&self, chunk: Bytes) -> RealtimeResult<()> {
        self.sent.lock().push(Sent::Audio(chunk));
        Ok(())
    }

    async fn send_text(&self, text: String) -> RealtimeResult<()> {
        self.sent.lock().push(Sent::Text(text));
        Ok(())
    }

    async fn commit(&self) -> RealtimeResult<()> {
        self.sent.lock().push(Sent::Commit);
        Ok(())
    }

    async fn request_response(&self) -> RealtimeResult<()> {
        self.sent.lock().push(Sent::ResponseCreate);
        Ok(())
    }

    async fn close(&self) {
        self.sent.lock().push(Sent::Close);
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn last_error(&self) -> Option<RealtimeError> {
        None
    }
}

/// Short timeouts and a default credential so sessions can start.
pub(crate) fn test_config() -> ManagerConfig {
    let mut config = ManagerConfig {
        handshake_timeout: Duration::from_millis(200),
        ready_timeout: Duration::from_millis(200),
        close_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    config.defaults.credential = Some(SecretString::from("sk-test".to_string()));
    config
}
