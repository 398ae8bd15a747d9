//! Session channel
//!
//! Connecting → Open → Closed, plus the orthogonal "agent is thinking" flag.
//!
//! All state lives in one `watch` channel. Every mutation is a single
//! `send_if_modified` call, so inbound events and outbound sends coming from
//! different tasks are applied one at a time, in arrival order, and observers
//! always see a consistent snapshot.

use super::transport::{OutboundFrame, Transport, TransportEvent, TransportLink};
use crate::error::AgentError;
use crate::models::{ChatMessage, ConnectionStatus, InboundEvent, SessionState};
use crate::persistence::MessageSink;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct SessionConfig {
    pub session_id: String,
    /// When set, a failed or slow connect closes the session instead of
    /// leaving it in `Connecting`.
    pub connect_timeout: Option<Duration>,
    /// Optional durable mirror of the transcript
    pub sink: Option<Arc<dyn MessageSink>>,
}

impl SessionConfig {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            connect_timeout: None,
            sink: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

struct Inner {
    session_id: String,
    state: watch::Sender<SessionState>,
    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    persist: Option<mpsc::UnboundedSender<ChatMessage>>,
    shutdown: CancellationToken,
}

/// Client side of one chat session
pub struct SessionChannel {
    inner: Arc<Inner>,
}

impl SessionChannel {
    /// Start connecting to `url`. Must be called from within a Tokio runtime.
    pub fn open(transport: Arc<dyn Transport>, url: impl Into<String>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::connecting());
        let shutdown = CancellationToken::new();

        let persist = config.sink.clone().map(|sink| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(persist_loop(config.session_id.clone(), sink, rx));
            tx
        });

        let inner = Arc::new(Inner {
            session_id: config.session_id.clone(),
            state,
            outbound: Mutex::new(None),
            persist,
            shutdown,
        });

        let url = url.into();
        tokio::spawn(connect_task(Arc::clone(&inner), transport, url, config.connect_timeout));

        Self { inner }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.borrow().connection_status
    }

    pub fn is_agent_thinking(&self) -> bool {
        self.inner.state.borrow().is_agent_thinking
    }

    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.inner.state.borrow().transcript.clone()
    }

    /// Send a user turn. Silently dropped unless the session is open.
    pub async fn send_message(&self, text: &str) {
        if let Err(e) = self.try_send_message(text).await {
            debug!(session_id = %self.inner.session_id, "Send dropped: {}", e);
        }
    }

    /// Like [`send_message`](Self::send_message) but reports why nothing was sent.
    pub async fn try_send_message(&self, text: &str) -> Result<()> {
        // Held until the frame is queued, so transmit order matches transcript order.
        let outbound = self.inner.outbound.lock().await;

        match self.status() {
            ConnectionStatus::Open => {}
            ConnectionStatus::Connecting => {
                return Err(AgentError::Transport("Session is still connecting".into()));
            }
            ConnectionStatus::Closed => return Err(AgentError::TransportClosed),
        }

        let Some(sender) = outbound.as_ref() else {
            return Err(AgentError::TransportClosed);
        };

        // Nothing is recorded until the transport has room for the frame.
        let Ok(permit) = sender.reserve().await else {
            warn!(session_id = %self.inner.session_id, "Transport dropped while sending");
            self.inner.mark_closed();
            return Err(AgentError::TransportClosed);
        };

        let message = ChatMessage::user(text);
        let committed = self.inner.state.send_if_modified(|state| {
            if state.connection_status != ConnectionStatus::Open {
                return false;
            }
            state.transcript.push(message.clone());
            state.is_agent_thinking = true;
            self.inner.mirror(&message);
            true
        });
        if !committed {
            return Err(AgentError::TransportClosed);
        }

        permit.send(OutboundFrame::Text(text.to_string()));
        Ok(())
    }

    /// Terminal failure on the caller's side: stop showing the agent as
    /// thinking and record `notice` as the agent's turn. Returns `false` when
    /// no reply was pending.
    pub fn report_failure(&self, notice: &str) -> bool {
        let message = ChatMessage::agent(notice);
        self.inner.state.send_if_modified(|state| {
            if !state.is_agent_thinking {
                return false;
            }
            state.is_agent_thinking = false;
            state.transcript.push(message.clone());
            self.inner.mirror(&message);
            true
        })
    }

    /// Stop accepting sends immediately and ask the transport to close.
    pub async fn close(&self) {
        self.inner.mark_closed();
        self.inner.shutdown.cancel();

        if let Some(outbound) = self.inner.outbound.lock().await.take() {
            let _ = outbound.send(OutboundFrame::Close).await;
        }
    }

    /// Resolves once the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx
            .wait_for(|s| s.connection_status == ConnectionStatus::Closed)
            .await;
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn mirror(&self, message: &ChatMessage) {
        if let Some(persist) = &self.persist {
            let _ = persist.send(message.clone());
        }
    }

    fn mark_open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.connection_status != ConnectionStatus::Connecting {
                return false;
            }
            state.connection_status = ConnectionStatus::Open;
            true
        })
    }

    fn mark_closed(&self) {
        let changed = self.state.send_if_modified(|state| {
            if state.connection_status == ConnectionStatus::Closed {
                return false;
            }
            state.connection_status = ConnectionStatus::Closed;
            true
        });
        if changed {
            info!(session_id = %self.session_id, "Session closed");
        }
    }

    fn handle_inbound(&self, raw: &str) {
        let event: InboundEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Ignoring unparseable inbound event");
                return;
            }
        };

        if !event.is_agent_response() {
            debug!(session_id = %self.session_id, kind = %event.kind, "Ignoring inbound event");
            return;
        }

        let message = ChatMessage::agent(event.message.unwrap_or_default());
        self.state.send_if_modified(|state| {
            // Replies that land after close are discarded.
            if state.connection_status != ConnectionStatus::Open {
                return false;
            }
            state.transcript.push(message.clone());
            state.is_agent_thinking = false;
            self.mirror(&message);
            true
        });
    }
}

async fn connect_task(
    inner: Arc<Inner>,
    transport: Arc<dyn Transport>,
    url: String,
    connect_timeout: Option<Duration>,
) {
    let connect = transport.connect(&url);
    let result = tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        result = async {
            match connect_timeout {
                Some(limit) => tokio::time::timeout(limit, connect)
                    .await
                    .unwrap_or_else(|_| {
                        Err(AgentError::Transport(format!("Connect timed out after {:?}", limit)))
                    }),
                None => connect.await,
            }
        } => result,
    };

    let link = match result {
        Ok(link) => link,
        Err(e) => {
            error!(session_id = %inner.session_id, %url, "Session connect failed: {}", e);
            if connect_timeout.is_some() {
                inner.mark_closed();
            }
            return;
        }
    };

    let TransportLink { outbound, inbound } = link;
    *inner.outbound.lock().await = Some(outbound);

    if !inner.mark_open() {
        // Closed locally while the connection was being established.
        if let Some(outbound) = inner.outbound.lock().await.take() {
            let _ = outbound.send(OutboundFrame::Close).await;
        }
        return;
    }

    info!(session_id = %inner.session_id, %url, "Session open");
    pump_inbound(inner, inbound).await;
}

async fn pump_inbound(inner: Arc<Inner>, mut inbound: mpsc::Receiver<TransportEvent>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = inbound.recv() => match event {
                Some(TransportEvent::Text(raw)) => inner.handle_inbound(&raw),
                Some(TransportEvent::Closed) | None => break,
            },
        }
    }

    inner.mark_closed();
    inner.outbound.lock().await.take();
}

async fn persist_loop(
    session_id: String,
    sink: Arc<dyn MessageSink>,
    mut messages: mpsc::UnboundedReceiver<ChatMessage>,
) {
    while let Some(message) = messages.recv().await {
        if let Err(e) = sink.append(&session_id, &message).await {
            warn!(%session_id, "Transcript persistence failed, continuing: {}", e);
        }
    }
}
