//! Protocol sessions.
//!
//! A session binds the framed multi-channel protocol to one byte stream.
//! It is created on connect or accept, authenticates, and then serves
//! frames until either side closes. The session handle is cheap to clone;
//! the read half lives in a [`SessionReader`] that is driven by the dial
//! or accept task until adoption, after which its events flow to the
//! owning contact's agent through a re-targetable sink.

use crate::error::{Error, Result};
use crate::identity::{Identity, OnionAddress};
use crate::protocol::auth;
use crate::protocol::frame::{Frame, FrameReader, CONTROL_CHANNEL};
use crate::protocol::wire::{
    self, AuthMessage, ChannelType, ChatMessage, ControlMessage, RequestMessage, RequestStatus,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Anything a session can run over: a Tor-proxied TCP stream, a loopback
/// socket, or an in-memory duplex pipe in tests.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ByteStream for T {}

/// Boxed byte stream a session is built over.
pub type BoxStream = Box<dyn ByteStream>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier, used to match close signals against
/// the session they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Who initiated the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer.
    Outbound,
    /// We accepted the peer's connection.
    Inbound,
}

/// An event produced by a session's read loop.
#[derive(Debug)]
pub struct SessionEvent {
    /// The session that produced the event.
    pub session: SessionId,
    /// What happened.
    pub kind: SessionEventKind,
}

/// Kinds of session events.
#[derive(Debug)]
pub enum SessionEventKind {
    /// A chat message arrived.
    ChatReceived {
        /// Channel it arrived on; acks go back on the same channel.
        channel: u16,
        /// Sender-assigned identifier.
        id: u32,
        /// Message text.
        text: String,
    },
    /// The peer acknowledged one of our chat messages.
    ChatAcked {
        /// Identifier of the delivered message.
        id: u32,
    },
    /// The peer hints it has read our messages up to this identifier.
    ReadHint {
        /// Last identifier the peer has displayed.
        last_received: u32,
    },
    /// A contact request greeting arrived (unknown-peer sessions only).
    RequestReceived {
        /// Channel the request came in on; replies go back on it.
        channel: u16,
        /// Proposed nickname, unfiltered.
        nickname: String,
        /// Greeting text, unfiltered.
        message: String,
    },
    /// The peer answered our outbound contact request.
    RequestResponse {
        /// Reported status.
        status: RequestStatus,
    },
    /// A channel was closed or refused by the peer.
    ChannelClosed {
        /// The channel id.
        channel: u16,
        /// What it carried.
        channel_type: ChannelType,
    },
    /// The session ended. Always the last event.
    Closed,
}

enum WriteCmd {
    Frame(Frame),
    Shutdown,
}

struct ChannelTable {
    open: HashMap<u16, ChannelType>,
    next_local: u16,
}

struct Shared {
    id: SessionId,
    direction: Direction,
    my_label: OnionAddress,
    peer_label: Mutex<Option<OnionAddress>>,
    authed: AtomicBool,
    closed: AtomicBool,
    accepts_requests: AtomicBool,
    cancel: CancellationToken,
    writer: mpsc::Sender<WriteCmd>,
    sink: Mutex<mpsc::Sender<SessionEvent>>,
    channels: Mutex<ChannelTable>,
}

/// Handle to a live protocol session. Clones share the same connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Build a session over `stream` and spawn its writer task. Returns the
    /// handle plus the [`SessionReader`] that drives the read half.
    pub fn new(stream: BoxStream, direction: Direction, my_label: OnionAddress) -> (Session, SessionReader) {
        let (read, write) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::channel(64);
        // Events go nowhere until a sink is attached.
        let (orphan_tx, _) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            direction,
            my_label,
            peer_label: Mutex::new(None),
            authed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            accepts_requests: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            writer: writer_tx,
            sink: Mutex::new(orphan_tx),
            channels: Mutex::new(ChannelTable {
                open: HashMap::new(),
                next_local: match direction {
                    Direction::Outbound => 1,
                    Direction::Inbound => 2,
                },
            }),
        });
        tokio::spawn(write_loop(write, writer_rx));
        let session = Session { shared };
        let reader = SessionReader {
            session: session.clone(),
            read,
            buf: FrameReader::new(),
        };
        (session, reader)
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Connection direction.
    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Our own label.
    pub fn my_label(&self) -> &OnionAddress {
        &self.shared.my_label
    }

    /// The peer's label: known up front when we dialed, proven during the
    /// handshake when we accepted.
    pub fn peer_label(&self) -> Option<OnionAddress> {
        self.shared.peer_label.lock().ok().and_then(|g| g.clone())
    }

    /// Whether authentication has completed.
    pub fn is_authed(&self) -> bool {
        self.shared.authed.load(Ordering::SeqCst)
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Close the session: stops the read loop and shuts the socket down.
    /// Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
        let _ = self.shared.writer.try_send(WriteCmd::Shutdown);
    }

    /// Redirect the session's events to a new owner.
    pub(crate) fn set_sink(&self, tx: mpsc::Sender<SessionEvent>) {
        if let Ok(mut sink) = self.shared.sink.lock() {
            *sink = tx;
        }
    }

    /// Allow the peer to open a contact-request channel. Only set on
    /// inbound sessions from unknown peers.
    pub(crate) fn set_accepts_requests(&self, allow: bool) {
        self.shared.accepts_requests.store(allow, Ordering::SeqCst);
    }

    fn set_peer_label(&self, label: OnionAddress) {
        if let Ok(mut guard) = self.shared.peer_label.lock() {
            *guard = Some(label);
        }
    }

    fn set_authed(&self) {
        self.shared.authed.store(true, Ordering::SeqCst);
    }

    fn allocate_channel(&self, channel_type: ChannelType) -> u16 {
        let mut table = match self.shared.channels.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = table.next_local;
        table.next_local = table.next_local.wrapping_add(2);
        table.open.insert(id, channel_type);
        id
    }

    fn release_channel(&self, channel: u16) -> Option<ChannelType> {
        match self.shared.channels.lock() {
            Ok(mut t) => t.open.remove(&channel),
            Err(poisoned) => poisoned.into_inner().open.remove(&channel),
        }
    }

    fn channel_type(&self, channel: u16) -> Option<ChannelType> {
        match self.shared.channels.lock() {
            Ok(t) => t.open.get(&channel).copied(),
            Err(poisoned) => poisoned.into_inner().open.get(&channel).copied(),
        }
    }

    fn register_peer_channel(&self, channel: u16, channel_type: ChannelType) -> Result<()> {
        // The dialer opens odd channels, the acceptor even ones.
        let peer_opens_odd = self.shared.direction == Direction::Inbound;
        if channel == CONTROL_CHANNEL || (channel % 2 == 1) != peer_opens_odd {
            return Err(Error::Protocol(format!("peer opened invalid channel id {}", channel)));
        }
        let mut table = match self.shared.channels.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if table.open.contains_key(&channel) {
            return Err(Error::Protocol(format!("channel {} opened twice", channel)));
        }
        table.open.insert(channel, channel_type);
        Ok(())
    }

    /// Queue a raw frame. Suspends only while the write queue is full.
    pub(crate) async fn send_frame(&self, channel: u16, payload: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let frame = Frame::new(channel, payload)?;
        self.shared
            .writer
            .send(WriteCmd::Frame(frame))
            .await
            .map_err(|_| Error::Closed)
    }

    async fn send_message<T: Serialize>(&self, channel: u16, msg: &T) -> Result<()> {
        self.send_frame(channel, wire::encode(msg)?).await
    }

    pub(crate) async fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        self.send_message(CONTROL_CHANNEL, msg).await
    }

    /// Open a chat channel from our side. Opens are optimistic: the frame
    /// ordering guarantees the peer sees the open before anything sent on
    /// the channel.
    pub(crate) async fn open_chat_channel(&self) -> Result<u16> {
        let channel = self.allocate_channel(ChannelType::Chat);
        self.send_control(&ControlMessage::OpenChannel {
            channel,
            channel_type: ChannelType::Chat,
            cookie: None,
        })
        .await?;
        Ok(channel)
    }

    /// Open a contact-request channel from our side.
    pub(crate) async fn open_request_channel(&self) -> Result<u16> {
        let channel = self.allocate_channel(ChannelType::ContactRequest);
        self.send_control(&ControlMessage::OpenChannel {
            channel,
            channel_type: ChannelType::ContactRequest,
            cookie: None,
        })
        .await?;
        Ok(channel)
    }

    /// Close one channel, leaving the session up.
    pub(crate) async fn close_channel(&self, channel: u16) -> Result<()> {
        self.release_channel(channel);
        self.send_control(&ControlMessage::CloseChannel { channel }).await
    }

    pub(crate) async fn send_chat_message(&self, channel: u16, id: u32, text: &str) -> Result<()> {
        self.send_message(channel, &ChatMessage::Message { id, text: text.to_owned() })
            .await
    }

    pub(crate) async fn send_chat_ack(&self, channel: u16, id: u32) -> Result<()> {
        self.send_message(channel, &ChatMessage::Ack { id }).await
    }

    pub(crate) async fn send_mark_read(&self, channel: u16, last_received: u32) -> Result<()> {
        self.send_message(channel, &ChatMessage::MarkRead { last_received }).await
    }

    pub(crate) async fn send_request(&self, channel: u16, nickname: &str, message: &str) -> Result<()> {
        self.send_message(
            channel,
            &RequestMessage::Request {
                nickname: nickname.to_owned(),
                message: message.to_owned(),
            },
        )
        .await
    }

    pub(crate) async fn send_request_response(&self, channel: u16, status: RequestStatus) -> Result<()> {
        self.send_message(channel, &RequestMessage::Response { status }).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("peer", &self.peer_label())
            .field("authed", &self.is_authed())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owns the read half of a session's stream. Drives the authentication
/// handshake and then the steady-state frame loop.
pub struct SessionReader {
    session: Session,
    read: ReadHalf<BoxStream>,
    buf: FrameReader,
}

impl SessionReader {
    /// The session this reader belongs to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.buf.try_read()? {
                // Empty control frames are keepalives.
                if frame.channel == CONTROL_CHANNEL && frame.payload.is_empty() {
                    continue;
                }
                return Ok(frame);
            }
            let mut chunk = [0u8; 4096];
            let n = self.read.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::Closed);
            }
            self.buf.push(&chunk[..n]);
        }
    }

    /// Run the dialer's side of the authentication handshake against the
    /// peer we dialed. Returns the peer's `is_known_contact` verdict.
    pub async fn authenticate_outbound(&mut self, identity: &Identity, peer: &OnionAddress) -> Result<bool> {
        self.session.set_peer_label(peer.clone());
        let client_cookie = auth::new_cookie();
        let channel = self.session.allocate_channel(ChannelType::Auth);
        self.session
            .send_control(&ControlMessage::OpenChannel {
                channel,
                channel_type: ChannelType::Auth,
                cookie: Some(client_cookie),
            })
            .await?;

        let frame = self.next_frame().await?;
        if frame.channel != CONTROL_CHANNEL {
            return Err(Error::Protocol("expected channel result".into()));
        }
        let server_cookie = match wire::decode::<ControlMessage>(&frame.payload)? {
            ControlMessage::ChannelResult { channel: c, opened: true, cookie: Some(cookie), .. }
                if c == channel =>
            {
                cookie
            }
            ControlMessage::ChannelResult { opened: false, error, .. } => {
                return Err(Error::Auth(format!(
                    "auth channel refused: {}",
                    error.unwrap_or_else(|| "unspecified".into())
                )));
            }
            other => {
                return Err(Error::Protocol(format!("unexpected message during auth: {:?}", other)));
            }
        };

        let signature = auth::sign_proof(identity, &client_cookie, &server_cookie)?;
        self.session
            .send_message(
                channel,
                &AuthMessage::Proof {
                    public_key: identity.public_key_der().to_vec(),
                    signature,
                },
            )
            .await?;

        let frame = self.next_frame().await?;
        if frame.channel != channel {
            return Err(Error::Protocol("expected auth result".into()));
        }
        match wire::decode::<AuthMessage>(&frame.payload)? {
            AuthMessage::Result { accepted: true, is_known_contact } => {
                self.session.release_channel(channel);
                self.session.set_authed();
                Ok(is_known_contact)
            }
            AuthMessage::Result { accepted: false, .. } => {
                Err(Error::Auth("peer rejected our proof".into()))
            }
            other => Err(Error::Protocol(format!("unexpected message during auth: {:?}", other))),
        }
    }

    /// Run the acceptor's side of the handshake. `is_known` reports whether
    /// a proven label belongs to a non-rejected contact. Returns the proven
    /// label and that verdict.
    pub async fn authenticate_inbound<F>(&mut self, identity: &Identity, is_known: F) -> Result<(OnionAddress, bool)>
    where
        F: Fn(&OnionAddress) -> bool,
    {
        let frame = self.next_frame().await?;
        if frame.channel != CONTROL_CHANNEL {
            return Err(Error::Protocol("expected auth channel open".into()));
        }
        let (channel, client_cookie) = match wire::decode::<ControlMessage>(&frame.payload)? {
            ControlMessage::OpenChannel {
                channel,
                channel_type: ChannelType::Auth,
                cookie: Some(cookie),
            } if channel % 2 == 1 => (channel, cookie),
            other => {
                return Err(Error::Protocol(format!("expected auth channel open, got {:?}", other)));
            }
        };

        let server_cookie = auth::new_cookie();
        self.session
            .send_control(&ControlMessage::ChannelResult {
                channel,
                opened: true,
                error: None,
                cookie: Some(server_cookie),
            })
            .await?;

        let frame = self.next_frame().await?;
        if frame.channel != channel {
            return Err(Error::Protocol("expected auth proof".into()));
        }
        let (public_key, signature) = match wire::decode::<AuthMessage>(&frame.payload)? {
            AuthMessage::Proof { public_key, signature } => (public_key, signature),
            other => {
                return Err(Error::Protocol(format!("expected auth proof, got {:?}", other)));
            }
        };

        match auth::verify_proof(&public_key, &signature, &client_cookie, &server_cookie) {
            Ok(label) => {
                let known = is_known(&label);
                self.session
                    .send_message(channel, &AuthMessage::Result { accepted: true, is_known_contact: known })
                    .await?;
                self.session.close_channel(channel).await?;
                self.session.set_peer_label(label.clone());
                self.session.set_authed();
                Ok((label, known))
            }
            Err(e) => {
                let _ = self
                    .session
                    .send_message(channel, &AuthMessage::Result { accepted: false, is_known_contact: false })
                    .await;
                Err(e)
            }
        }
    }

    /// Steady-state frame loop. Runs until the peer disconnects, a
    /// session-level protocol error occurs, or the session is closed
    /// locally. Always emits [`SessionEventKind::Closed`] last.
    pub async fn serve(mut self) {
        let outcome = self.run().await;
        match outcome {
            Ok(()) | Err(Error::Closed) => {
                debug!(session = %self.session.id(), "session ended");
            }
            Err(e) => {
                warn!(session = %self.session.id(), error = %e, "session terminated");
            }
        }
        self.session.close();
        self.emit(SessionEventKind::Closed).await;
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            let cancelled = self.session.shared.cancel.clone();
            let frame = tokio::select! {
                _ = cancelled.cancelled() => return Ok(()),
                frame = self.next_frame() => frame?,
            };
            self.dispatch(frame).await?;
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        if frame.channel == CONTROL_CHANNEL {
            return self.handle_control(wire::decode(&frame.payload)?).await;
        }
        match self.session.channel_type(frame.channel) {
            Some(ChannelType::Chat) => self.handle_chat(frame.channel, wire::decode(&frame.payload)?).await,
            Some(ChannelType::ContactRequest) => {
                self.handle_request(wire::decode(&frame.payload)?, frame.channel).await
            }
            Some(ChannelType::Auth) => {
                Err(Error::Protocol("auth message outside the handshake".into()))
            }
            None => Err(Error::Protocol(format!("message on closed channel {}", frame.channel))),
        }
    }

    async fn handle_control(&mut self, msg: ControlMessage) -> Result<()> {
        match msg {
            ControlMessage::OpenChannel { channel, channel_type, .. } => {
                self.handle_open(channel, channel_type).await
            }
            ControlMessage::ChannelResult { channel, opened, .. } => {
                if !opened {
                    if let Some(channel_type) = self.session.release_channel(channel) {
                        self.emit(SessionEventKind::ChannelClosed { channel, channel_type }).await;
                    }
                }
                Ok(())
            }
            ControlMessage::CloseChannel { channel } => {
                if let Some(channel_type) = self.session.release_channel(channel) {
                    self.emit(SessionEventKind::ChannelClosed { channel, channel_type }).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_open(&mut self, channel: u16, channel_type: ChannelType) -> Result<()> {
        if !self.session.is_authed() {
            return Err(Error::Protocol("channel open before authentication".into()));
        }
        match channel_type {
            ChannelType::Auth => Err(Error::Protocol("auth channel reopened after handshake".into())),
            ChannelType::Chat => {
                self.session.register_peer_channel(channel, ChannelType::Chat)?;
                self.session
                    .send_control(&ControlMessage::ChannelResult {
                        channel,
                        opened: true,
                        error: None,
                        cookie: None,
                    })
                    .await
            }
            ChannelType::ContactRequest => {
                if !self.session.shared.accepts_requests.load(Ordering::SeqCst) {
                    // Known contacts have nothing to request; refuse the
                    // channel but keep the session.
                    return self
                        .session
                        .send_control(&ControlMessage::ChannelResult {
                            channel,
                            opened: false,
                            error: Some("UnauthorizedError".into()),
                            cookie: None,
                        })
                        .await;
                }
                self.session.register_peer_channel(channel, ChannelType::ContactRequest)?;
                self.session
                    .send_control(&ControlMessage::ChannelResult {
                        channel,
                        opened: true,
                        error: None,
                        cookie: None,
                    })
                    .await
            }
        }
    }

    async fn handle_chat(&mut self, channel: u16, msg: ChatMessage) -> Result<()> {
        let kind = match msg {
            ChatMessage::Message { id, text } => SessionEventKind::ChatReceived { channel, id, text },
            ChatMessage::Ack { id } => SessionEventKind::ChatAcked { id },
            ChatMessage::MarkRead { last_received } => SessionEventKind::ReadHint { last_received },
        };
        self.emit(kind).await;
        Ok(())
    }

    async fn handle_request(&mut self, msg: RequestMessage, channel: u16) -> Result<()> {
        let kind = match msg {
            RequestMessage::Request { nickname, message } => {
                SessionEventKind::RequestReceived { channel, nickname, message }
            }
            RequestMessage::Response { status } => SessionEventKind::RequestResponse { status },
        };
        self.emit(kind).await;
        Ok(())
    }

    async fn emit(&self, kind: SessionEventKind) {
        let tx = match self.session.shared.sink.lock() {
            Ok(sink) => sink.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let _ = tx
            .send(SessionEvent {
                session: self.session.id(),
                kind,
            })
            .await;
    }
}

async fn write_loop(mut write: WriteHalf<BoxStream>, mut rx: mpsc::Receiver<WriteCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCmd::Frame(frame) => {
                if let Err(e) = write.write_all(&frame.encode()).await {
                    debug!(error = %e, "session write failed");
                    break;
                }
                if write.flush().await.is_err() {
                    break;
                }
            }
            WriteCmd::Shutdown => break,
        }
    }
    let _ = write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn authed_pair(
        alice: StdArc<Identity>,
        bob: StdArc<Identity>,
        bob_knows_alice: bool,
    ) -> ((Session, SessionReader, bool), (Session, SessionReader, OnionAddress)) {
        let (a_stream, b_stream) = tokio::io::duplex(64 * 1024);
        let (a_sess, mut a_reader) =
            Session::new(Box::new(a_stream), Direction::Outbound, alice.address().clone());
        let (b_sess, mut b_reader) =
            Session::new(Box::new(b_stream), Direction::Inbound, bob.address().clone());

        let bob_task = {
            let bob = bob.clone();
            tokio::spawn(async move {
                let outcome = b_reader
                    .authenticate_inbound(&bob, |_| bob_knows_alice)
                    .await
                    .expect("inbound auth");
                (b_reader, outcome)
            })
        };
        let known = a_reader
            .authenticate_outbound(&alice, bob.address())
            .await
            .expect("outbound auth");
        let (b_reader, (label, _)) = bob_task.await.expect("join");
        ((a_sess, a_reader, known), (b_sess, b_reader, label))
    }

    #[tokio::test]
    async fn handshake_proves_label_and_known_flag() {
        let alice = StdArc::new(Identity::generate().expect("alice"));
        let bob = StdArc::new(Identity::generate().expect("bob"));
        let ((a_sess, _a_reader, known), (b_sess, _b_reader, label)) =
            authed_pair(alice.clone(), bob.clone(), true).await;

        assert!(known);
        assert_eq!(&label, alice.address());
        assert!(a_sess.is_authed());
        assert!(b_sess.is_authed());
        assert_eq!(a_sess.peer_label().as_ref(), Some(bob.address()));
        assert_eq!(b_sess.peer_label().as_ref(), Some(alice.address()));
    }

    #[tokio::test]
    async fn unknown_contact_flag_propagates() {
        let alice = StdArc::new(Identity::generate().expect("alice"));
        let bob = StdArc::new(Identity::generate().expect("bob"));
        let ((_a, _ar, known), _) = authed_pair(alice, bob, false).await;
        assert!(!known);
    }

    #[tokio::test]
    async fn chat_message_and_ack_flow() {
        let alice = StdArc::new(Identity::generate().expect("alice"));
        let bob = StdArc::new(Identity::generate().expect("bob"));
        let ((a_sess, a_reader, _), (b_sess, b_reader, _)) =
            authed_pair(alice, bob, true).await;

        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        a_sess.set_sink(a_tx);
        b_sess.set_sink(b_tx);
        tokio::spawn(a_reader.serve());
        tokio::spawn(b_reader.serve());

        let channel = a_sess.open_chat_channel().await.expect("open");
        a_sess.send_chat_message(channel, 1, "hello bob").await.expect("send");

        let ev = timeout(Duration::from_secs(5), b_rx.recv()).await.expect("timely").expect("event");
        let (recv_channel, id) = match ev.kind {
            SessionEventKind::ChatReceived { channel, id, ref text } => {
                assert_eq!(text, "hello bob");
                (channel, id)
            }
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(id, 1);

        b_sess.send_chat_ack(recv_channel, id).await.expect("ack");
        let ev = timeout(Duration::from_secs(5), a_rx.recv()).await.expect("timely").expect("event");
        assert!(matches!(ev.kind, SessionEventKind::ChatAcked { id: 1 }));
    }

    #[tokio::test]
    async fn close_emits_closed_event_on_both_sides() {
        let alice = StdArc::new(Identity::generate().expect("alice"));
        let bob = StdArc::new(Identity::generate().expect("bob"));
        let ((a_sess, a_reader, _), (b_sess, b_reader, _)) =
            authed_pair(alice, bob, true).await;

        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        a_sess.set_sink(a_tx);
        b_sess.set_sink(b_tx);
        tokio::spawn(a_reader.serve());
        tokio::spawn(b_reader.serve());

        a_sess.close();
        let ev = timeout(Duration::from_secs(5), a_rx.recv()).await.expect("timely").expect("event");
        assert!(matches!(ev.kind, SessionEventKind::Closed));
        let ev = timeout(Duration::from_secs(5), b_rx.recv()).await.expect("timely").expect("event");
        assert!(matches!(ev.kind, SessionEventKind::Closed));
        assert!(a_sess.is_closed());
    }

    #[tokio::test]
    async fn contact_request_channel_refused_for_known_contacts() {
        let alice = StdArc::new(Identity::generate().expect("alice"));
        let bob = StdArc::new(Identity::generate().expect("bob"));
        let ((a_sess, a_reader, _), (b_sess, b_reader, _)) =
            authed_pair(alice, bob, true).await;

        let (a_tx, mut a_rx) = mpsc::channel(16);
        a_sess.set_sink(a_tx);
        b_sess.set_sink(mpsc::channel(16).0);
        tokio::spawn(a_reader.serve());
        tokio::spawn(b_reader.serve());

        // accepts_requests was never set on bob's side, so the open is
        // refused while the session stays up.
        let channel = a_sess.open_request_channel().await.expect("open");
        let ev = timeout(Duration::from_secs(5), a_rx.recv()).await.expect("timely").expect("event");
        match ev.kind {
            SessionEventKind::ChannelClosed { channel: c, channel_type } => {
                assert_eq!(c, channel);
                assert_eq!(channel_type, ChannelType::ContactRequest);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!a_sess.is_closed());
        assert!(!b_sess.is_closed());
    }
}
