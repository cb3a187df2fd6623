//! Reconnecting per-document annotation channel.
//!
//! A driver task owns the socket. The handle only publishes status and
//! forwards outbound events while the driver reports `Connected`.

use std::sync::Arc;
use std::time::Duration;

use folio_core::{DocumentId, SyncConfig};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::policy::{CloseKind, ReconnectPolicy, RetryDecision};
use crate::protocol::{channel_url, AnnotationRecord, DeletedRef, InboundEvent, OutboundEvent};
use crate::token::TokenSource;
use crate::transport::{Connector, Frame, SocketConnection};

/// Receives remote mutations in arrival order.
pub trait AnnotationSink: Send + Sync {
    fn created(&self, record: AnnotationRecord);
    fn updated(&self, record: AnnotationRecord);
    fn deleted(&self, id: Uuid);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Closed(CloseKind),
    /// Retry budget exhausted; nothing reconnects until the next `open`.
    Failed,
}

pub struct AnnotationChannel {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    sink: Arc<dyn AnnotationSink>,
    status: Arc<watch::Sender<ChannelStatus>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundEvent>>>,
    driver: Option<(CancellationToken, JoinHandle<()>)>,
    document: Option<DocumentId>,
}

impl AnnotationChannel {
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
        sink: Arc<dyn AnnotationSink>,
    ) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Disconnected);
        Self {
            config,
            connector,
            tokens,
            sink,
            status: Arc::new(status),
            outbound: Mutex::new(None),
            driver: None,
            document: None,
        }
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    pub fn document(&self) -> Option<DocumentId> {
        self.document
    }

    /// Connects to `document`, tearing down any socket opened before.
    #[instrument(skip(self))]
    pub async fn open(&mut self, document: DocumentId) {
        self.shutdown().await;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let driver = Driver {
            document,
            base_url: self.config.base_url.clone(),
            connector: Arc::clone(&self.connector),
            tokens: Arc::clone(&self.tokens),
            sink: Arc::clone(&self.sink),
            status: Arc::clone(&self.status),
            policy: ReconnectPolicy::new(&self.config),
            commands: rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(driver.run());

        *self.outbound.lock() = Some(tx);
        self.driver = Some((cancel, handle));
        self.document = Some(document);
    }

    /// Sends a clean close and stops reconnecting.
    pub async fn close(&mut self) {
        self.shutdown().await;
        if let Some(document) = self.document.take() {
            info!(%document, "annotation channel closed");
            self.status.send_if_modified(|status| {
                if *status == ChannelStatus::Failed {
                    return false;
                }
                *status = ChannelStatus::Closed(CloseKind::Clean);
                true
            });
        }
    }

    pub fn create(&self, record: impl Into<AnnotationRecord>) -> bool {
        self.emit(OutboundEvent::Create(record.into()))
    }

    pub fn update(&self, record: impl Into<AnnotationRecord>) -> bool {
        self.emit(OutboundEvent::Update(record.into()))
    }

    pub fn delete(&self, id: Uuid) -> bool {
        self.emit(OutboundEvent::Delete(DeletedRef { id }))
    }

    fn emit(&self, event: OutboundEvent) -> bool {
        let status = self.status();
        if status != ChannelStatus::Connected {
            warn!(?status, ?event, "annotation channel not connected, event dropped");
            return false;
        }
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    async fn shutdown(&mut self) {
        self.outbound.lock().take();
        if let Some((cancel, handle)) = self.driver.take() {
            cancel.cancel();
            if let Err(err) = handle.await {
                error!(error = ?err, "annotation channel driver panicked");
            }
        }
    }
}

impl Drop for AnnotationChannel {
    fn drop(&mut self) {
        if let Some((cancel, _)) = &self.driver {
            cancel.cancel();
        }
    }
}

enum SessionEnd {
    Closed(CloseKind),
    Cancelled,
    Fatal,
}

struct Driver {
    document: DocumentId,
    base_url: String,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    sink: Arc<dyn AnnotationSink>,
    status: Arc<watch::Sender<ChannelStatus>>,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<OutboundEvent>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.status.send_replace(ChannelStatus::Connecting);
            let kind = match self.session().await {
                SessionEnd::Cancelled => {
                    self.status.send_replace(ChannelStatus::Disconnected);
                    return;
                }
                SessionEnd::Fatal => {
                    self.status.send_replace(ChannelStatus::Failed);
                    return;
                }
                SessionEnd::Closed(kind) => kind,
            };
            self.status.send_replace(ChannelStatus::Closed(kind));

            match self.policy.on_close(kind) {
                RetryDecision::Stop => {
                    info!(document = %self.document, "annotation channel closed by server");
                    return;
                }
                RetryDecision::GiveUp => {
                    error!(document = %self.document, ?kind, "annotation channel retry limit reached");
                    self.status.send_replace(ChannelStatus::Failed);
                    return;
                }
                RetryDecision::Retry(delay) => {
                    debug!(document = %self.document, ?kind, ?delay, "scheduling reconnect");
                    if !self.idle(delay).await {
                        self.status.send_replace(ChannelStatus::Disconnected);
                        return;
                    }
                }
            }
        }
    }

    /// Waits out a reconnect delay. Returns false when cancelled.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(event) = self.commands.recv() => {
                    warn!(?event, "event emitted while reconnecting dropped");
                }
            }
        }
    }

    async fn session(&mut self) -> SessionEnd {
        let cancel = self.cancel.clone();

        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            token = self.tokens.fetch(self.document) => token,
        };
        let token = match token {
            Ok(token) => token,
            Err(err) => {
                warn!(document = %self.document, error = ?err, "channel token unavailable");
                return SessionEnd::Closed(CloseKind::Other);
            }
        };

        let url = match channel_url(&self.base_url, self.document, &token) {
            Ok(url) => url,
            Err(err) => {
                error!(base = %self.base_url, error = ?err, "cannot build channel url");
                return SessionEnd::Fatal;
            }
        };

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            connected = self.connector.connect(&url) => connected,
        };
        let mut socket = match connected {
            Ok(socket) => socket,
            Err(err) => {
                warn!(document = %self.document, error = ?err, "annotation channel connect failed");
                return SessionEnd::Closed(CloseKind::Other);
            }
        };

        while let Ok(event) = self.commands.try_recv() {
            debug!(?event, "discarding event queued before connect");
        }
        self.status.send_replace(ChannelStatus::Connected);
        info!(document = %self.document, "annotation channel connected");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    while let Ok(event) = self.commands.try_recv() {
                        if let Err(err) = send_event(socket.as_mut(), &event).await {
                            debug!(error = ?err, ?event, "queued event not delivered");
                            break;
                        }
                    }
                    if let Err(err) = socket.send(Frame::Close(Some(1000))).await {
                        debug!(error = ?err, "close frame not delivered");
                    }
                    return SessionEnd::Cancelled;
                }
                Some(event) = self.commands.recv() => {
                    if let Err(err) = send_event(socket.as_mut(), &event).await {
                        warn!(error = ?err, ?event, "annotation channel send failed");
                        return SessionEnd::Closed(CloseKind::Other);
                    }
                }
                frame = socket.recv() => match frame {
                    Some(Ok(Frame::Text(text))) => self.dispatch(&text),
                    Some(Ok(Frame::Close(code))) => {
                        let kind = CloseKind::classify(code);
                        info!(document = %self.document, ?code, ?kind, "annotation channel closed");
                        return SessionEnd::Closed(kind);
                    }
                    Some(Err(err)) => {
                        warn!(document = %self.document, error = ?err, "annotation channel transport error");
                        return SessionEnd::Closed(CloseKind::Other);
                    }
                    None => return SessionEnd::Closed(CloseKind::Other),
                },
            }
        }
    }

    fn dispatch(&mut self, text: &str) {
        let event = match InboundEvent::decode(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = ?err, payload = %text, "dropping malformed annotation message");
                return;
            }
        };
        debug!(?event, "applying remote annotation event");
        match event {
            InboundEvent::Created(record) => self.sink.created(record),
            InboundEvent::Updated(record) => self.sink.updated(record),
            InboundEvent::Deleted(DeletedRef { id }) => self.sink.deleted(id),
        }
        self.policy.reset();
    }
}

async fn send_event(
    socket: &mut dyn SocketConnection,
    event: &OutboundEvent,
) -> Result<(), crate::SyncError> {
    let text = event.encode()?;
    socket.send(Frame::Text(text)).await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use folio_core::{Annotation, Point, ViewerStore};
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::{StoreSink, SyncError};

    struct ScriptedSocket {
        frames: VecDeque<Frame>,
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    #[async_trait]
    impl SocketConnection for ScriptedSocket {
        async fn send(&mut self, frame: Frame) -> Result<(), SyncError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<Frame, SyncError>> {
            match self.frames.pop_front() {
                Some(frame) => Some(Ok(frame)),
                None => std::future::pending().await,
            }
        }
    }

    /// Plays one queued script per connection, then `fallback` forever.
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Vec<Frame>>>,
        fallback: Vec<Frame>,
        connects: AtomicUsize,
        urls: Mutex<Vec<Url>>,
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    impl ScriptedConnector {
        fn new(fallback: Vec<Frame>) -> Arc<Self> {
            Self::with_scripts(Vec::new(), fallback)
        }

        fn with_scripts(scripts: Vec<Vec<Frame>>, fallback: Vec<Frame>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                fallback,
                connects: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
                sent: Arc::new(Mutex::new(Vec::new())),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn sent(&self) -> Vec<Frame> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, url: &Url) -> Result<Box<dyn SocketConnection>, SyncError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().push(url.clone());
            let frames = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            Ok(Box::new(ScriptedSocket {
                frames: frames.into(),
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    #[derive(Default)]
    struct CountingTokens {
        fetched: AtomicUsize,
        /// Fetches failing before the first success.
        failures: usize,
    }

    impl CountingTokens {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                ..Self::default()
            })
        }

        fn fetched(&self) -> usize {
            self.fetched.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn fetch(&self, _document: DocumentId) -> Result<String, SyncError> {
            let n = self.fetched.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(SyncError::Unavailable("token endpoint down".to_owned()));
            }
            Ok(format!("token-{n}"))
        }
    }

    fn channel(
        connector: &Arc<ScriptedConnector>,
        tokens: &Arc<CountingTokens>,
        store: &ViewerStore,
    ) -> AnnotationChannel {
        AnnotationChannel::new(
            SyncConfig::default(),
            connector.clone(),
            tokens.clone(),
            Arc::new(StoreSink::new(store.clone())),
        )
    }

    fn created_note(note: &Annotation) -> Frame {
        Frame::Text(json!({ "event": "annotation.created", "data": note }).to_string())
    }

    async fn wait_for_status(channel: &AnnotationChannel, wanted: ChannelStatus) {
        channel
            .subscribe()
            .wait_for(|status| *status == wanted)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_auth_closes_end_in_failed() {
        let connector = ScriptedConnector::new(vec![Frame::Close(Some(4401))]);
        let tokens = Arc::new(CountingTokens::default());
        let mut channel = channel(&connector, &tokens, &ViewerStore::default());

        channel.open(Uuid::new_v4()).await;
        wait_for_status(&channel, ChannelStatus::Failed).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(connector.connects(), 6);
        assert_eq!(tokens.fetched(), 6);
        assert_eq!(channel.status(), ChannelStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_transport_closes_end_in_failed() {
        let connector = ScriptedConnector::new(vec![Frame::Close(Some(1006))]);
        let tokens = Arc::new(CountingTokens::default());
        let mut channel = channel(&connector, &tokens, &ViewerStore::default());

        channel.open(Uuid::new_v4()).await;
        wait_for_status(&channel, ChannelStatus::Failed).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(connector.connects(), 6);
        assert_eq!(tokens.fetched(), 6);

        channel.close().await;
        assert_eq!(channel.status(), ChannelStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn token_failures_back_off_then_connect() {
        let connector = ScriptedConnector::new(Vec::new());
        let tokens = CountingTokens::failing(2);
        let mut channel = channel(&connector, &tokens, &ViewerStore::default());

        channel.open(Uuid::new_v4()).await;
        wait_for_status(&channel, ChannelStatus::Connected).await;

        assert_eq!(tokens.fetched(), 3);
        assert_eq!(connector.connects(), 1);
        let urls = connector.urls.lock().clone();
        assert_eq!(urls[0].query(), Some("token=token-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn token_endpoint_outage_ends_in_failed() {
        let connector = ScriptedConnector::new(Vec::new());
        let tokens = CountingTokens::failing(usize::MAX);
        let mut channel = channel(&connector, &tokens, &ViewerStore::default());

        channel.open(Uuid::new_v4()).await;
        wait_for_status(&channel, ChannelStatus::Failed).await;

        assert_eq!(tokens.fetched(), 6);
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_never_fetches_another_token() {
        let connector = ScriptedConnector::new(vec![Frame::Close(Some(1000))]);
        let tokens = Arc::new(CountingTokens::default());
        let mut channel = channel(&connector, &tokens, &ViewerStore::default());

        channel.open(Uuid::new_v4()).await;
        wait_for_status(&channel, ChannelStatus::Closed(CloseKind::Clean)).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(tokens.fetched(), 1);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_traffic_resets_retry_budget() {
        let note = Annotation::note(1, Point::new(5.0, 5.0), "hi");
        let mut scripts = vec![vec![Frame::Close(Some(4401))]; 5];
        scripts.push(vec![created_note(&note), Frame::Close(Some(4401))]);
        let connector = ScriptedConnector::with_scripts(scripts, vec![Frame::Close(Some(4403))]);
        let tokens = Arc::new(CountingTokens::default());
        let store = ViewerStore::default();
        let mut channel = channel(&connector, &tokens, &store);

        channel.open(Uuid::new_v4()).await;
        wait_for_status(&channel, ChannelStatus::Failed).await;

        assert_eq!(connector.connects(), 11);
        assert_eq!(store.snapshot().annotations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_are_dropped_without_closing() {
        let note = Annotation::note(2, Point::new(40.0, 300.0), "remote");
        let connector = ScriptedConnector::new(vec![
            Frame::Text("{not json".to_owned()),
            Frame::Text(r#"{"event":"annotation.created","data":{"id":1}}"#.to_owned()),
            created_note(&note),
        ]);
        let tokens = Arc::new(CountingTokens::default());
        let store = ViewerStore::default();
        let mut channel = channel(&connector, &tokens, &store);

        channel.open(Uuid::new_v4()).await;
        store
            .subscribe()
            .wait_for(|state| !state.annotations.is_empty())
            .await
            .unwrap();

        assert_eq!(store.snapshot().annotations[0], note);
        assert_eq!(channel.status(), ChannelStatus::Connected);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_events_require_connection() {
        let connector = ScriptedConnector::new(Vec::new());
        let tokens = Arc::new(CountingTokens::default());
        let mut channel = channel(&connector, &tokens, &ViewerStore::default());
        let note = Annotation::note(1, Point::new(1.0, 2.0), "local");

        assert!(!channel.create(note.clone()));

        channel.open(Uuid::new_v4()).await;
        wait_for_status(&channel, ChannelStatus::Connected).await;
        assert!(channel.create(note.clone()));
        assert!(channel.delete(note.id));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events: Vec<String> = connector
            .sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
                    value["event"].as_str().map(str::to_owned)
                }
                Frame::Close(_) => None,
            })
            .collect();
        assert_eq!(events, vec!["annotation.create", "annotation.delete"]);

        channel.close().await;
        assert!(connector.sent().contains(&Frame::Close(Some(1000))));
        assert_eq!(channel.status(), ChannelStatus::Closed(CloseKind::Clean));
        assert!(!channel.update(note));
        assert_eq!(tokens.fetched(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_queued_events_first() {
        let connector = ScriptedConnector::new(Vec::new());
        let tokens = Arc::new(CountingTokens::default());
        let mut channel = channel(&connector, &tokens, &ViewerStore::default());
        let note = Annotation::note(2, Point::new(5.0, 6.0), "last words");

        channel.open(Uuid::new_v4()).await;
        wait_for_status(&channel, ChannelStatus::Connected).await;
        assert!(channel.create(note));
        channel.close().await;

        let sent = connector.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Frame::Text(text) if text.contains("annotation.create")));
        assert_eq!(sent[1], Frame::Close(Some(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_replaces_the_previous_socket() {
        let connector = ScriptedConnector::new(Vec::new());
        let tokens = Arc::new(CountingTokens::default());
        let mut channel = channel(&connector, &tokens, &ViewerStore::default());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        channel.open(first).await;
        wait_for_status(&channel, ChannelStatus::Connected).await;
        channel.open(second).await;
        wait_for_status(&channel, ChannelStatus::Connected).await;

        let urls = connector.urls.lock().clone();
        assert_eq!(urls.len(), 2);
        assert!(urls[1].path().contains(&second.to_string()));
        assert_eq!(urls[1].query(), Some("token=token-1"));
        assert_eq!(connector.sent(), vec![Frame::Close(Some(1000))]);
        assert_eq!(channel.document(), Some(second));
    }
}
