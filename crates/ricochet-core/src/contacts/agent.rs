//! Per-contact connection agent.
//!
//! Each contact runs one agent task. It races outbound dials against
//! inbound sessions, resolves duels deterministically, keeps the contact's
//! conversation attached to whichever session survives, and reacts to
//! session loss by dialing again with backoff. Nothing else writes the
//! contact's `current` session.

use super::{Contact, ContactStatus};
use crate::events::ContactEventKind;
use crate::identity::OnionAddress;
use crate::protocol::{ChannelType, Direction, RequestStatus, Session, SessionEvent, SessionEventKind};
use crate::tor::{Backoff, OnionConnector};
use crate::HANDSHAKE_TIMEOUT;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A connection kept for at least this long resets the dial backoff.
const SUSTAINED_CONNECTION: Duration = Duration::from_secs(60);

/// A current session older than this always loses a duel to a fresh one.
const DUEL_AGE_LIMIT: Duration = Duration::from_secs(30);

/// Commands delivered through the agent's inbox.
#[derive(Debug)]
pub(crate) enum AgentCommand {
    /// Begin trying to reach this peer.
    Start,
    /// Cease trying; close any current session.
    Stop,
    /// Stop and terminate the agent task.
    Shutdown,
    /// A freshly authenticated inbound session arrived.
    InboundAuthed {
        session: Session,
        known_contact: bool,
    },
    /// Our dial succeeded and authenticated.
    OutboundAuthed {
        session: Session,
        known_contact: bool,
    },
}

/// What the duel resolution needs to know about the current session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CurrentSessionInfo {
    pub direction: Direction,
    pub age: Duration,
    pub closed: bool,
}

/// Decide whether a newly authenticated session replaces the current one.
///
/// Pure function of the labels, the current session's direction and age,
/// and the new session's direction; both endpoints evaluate it with
/// mirrored inputs and converge on keeping the same session.
pub(crate) fn should_replace_connection(
    my_label: &OnionAddress,
    peer_label: &OnionAddress,
    current: &CurrentSessionInfo,
    new_direction: Direction,
) -> bool {
    if current.closed {
        return true;
    }
    if current.direction == new_direction {
        return true;
    }
    if current.age > DUEL_AGE_LIMIT {
        return true;
    }
    // Stable tie-break: the endpoint with the smaller label keeps the
    // session it dialed.
    let prefer_outbound = my_label < peer_label;
    match new_direction {
        Direction::Outbound => prefer_outbound,
        Direction::Inbound => !prefer_outbound,
    }
}

struct DialTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Agent {
    contact: Arc<Contact>,
    cmd_rx: mpsc::Receiver<AgentCommand>,
    session_rx: mpsc::Receiver<SessionEvent>,
    enabled: bool,
    seen_chat: HashSet<u32>,
    request_channel: Option<u16>,
    dial: Option<DialTask>,
    backoff: Arc<Mutex<Backoff>>,
}

pub(crate) async fn run(
    contact: Arc<Contact>,
    cmd_rx: mpsc::Receiver<AgentCommand>,
    session_rx: mpsc::Receiver<SessionEvent>,
) {
    let agent = Agent {
        contact,
        cmd_rx,
        session_rx,
        enabled: false,
        seen_chat: HashSet::new(),
        request_channel: None,
        dial: None,
        backoff: Arc::new(Mutex::new(Backoff::new())),
    };
    agent.run().await;
}

impl Agent {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(AgentCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                ev = self.session_rx.recv() => match ev {
                    Some(ev) => self.handle_session_event(ev).await,
                    None => break,
                },
            }
        }
        debug!(contact = %self.contact.address(), "agent exiting");
        self.cancel_dial();
        self.clear_current(false).await;
    }

    async fn handle_command(&mut self, cmd: AgentCommand) {
        match cmd {
            AgentCommand::Start => {
                self.enabled = true;
                self.maybe_dial();
            }
            AgentCommand::Stop => {
                self.enabled = false;
                self.cancel_dial();
                self.clear_current(true).await;
            }
            AgentCommand::Shutdown => {}
            AgentCommand::InboundAuthed { session, known_contact } => {
                self.adopt(session, known_contact, Direction::Inbound).await;
            }
            AgentCommand::OutboundAuthed { session, known_contact } => {
                self.adopt(session, known_contact, Direction::Outbound).await;
            }
        }
    }

    /// Take over a freshly authenticated session, if it wins against the
    /// current one.
    async fn adopt(&mut self, session: Session, known_contact: bool, direction: Direction) {
        if !self.enabled {
            debug!(contact = %self.contact.address(), "connections disabled, discarding session");
            session.close();
            return;
        }
        if !session.is_authed()
            || session.is_closed()
            || session.peer_label().as_ref() != Some(self.contact.address())
        {
            warn!(contact = %self.contact.address(), session = %session.id(), "session not in a valid state to adopt");
            session.close();
            return;
        }

        if direction == Direction::Outbound && !known_contact && !self.contact.is_request_pending() {
            // The peer authenticated us but says we are not a contact.
            warn!(contact = %self.contact.address(), "peer does not recognize us, halting outbound attempts");
            session.close();
            self.cancel_dial();
            {
                let mut state = self.contact.lock_state();
                state.status = ContactStatus::Rejected;
            }
            self.contact.persist();
            self.contact.publish(ContactEventKind::Update);
            return;
        }

        let mut old_session = None;
        let mut greeting = None;
        {
            let mut guard = self.contact.lock_state();
            let state = &mut *guard;
            if let Some(current) = &state.current {
                let info = CurrentSessionInfo {
                    direction: current.direction(),
                    age: state.connected_at.map(|t| t.elapsed()).unwrap_or_default(),
                    closed: current.is_closed(),
                };
                if !should_replace_connection(
                    self.contact.deps.identity.address(),
                    self.contact.address(),
                    &info,
                    direction,
                ) {
                    drop(guard);
                    debug!(contact = %self.contact.address(), "keeping existing session");
                    session.close();
                    return;
                }
                old_session = state.current.take();
            }
            state.current = Some(session.clone());
            state.connected_at = Some(Instant::now());
            state.last_connected = Some(Utc::now());
            let greet_peer =
                state.request.is_some() && direction == Direction::Outbound && !known_contact;
            if greet_peer {
                // Outbound connection for a pending request: greet, and
                // stay out of ONLINE until the peer accepts.
                if let Some(request) = &state.request {
                    greeting = Some((request.my_nickname.clone(), request.message.clone()));
                }
                state.status = ContactStatus::Request;
            } else if state.request.is_some() {
                // An inbound session, or a positive isKnownContact verdict,
                // implicitly accepts the pending request.
                info!(contact = %self.contact.address(), "contact request implicitly accepted");
                state.request = None;
                state.status = ContactStatus::Online;
            } else {
                state.status = ContactStatus::Online;
            }
        }

        if let Some(old) = old_session {
            info!(contact = %self.contact.address(), replaced = %old.id(), adopted = %session.id(), "replacing session");
            old.close();
        } else {
            info!(contact = %self.contact.address(), session = %session.id(), ?direction, "session adopted");
        }
        self.seen_chat.clear();
        self.request_channel = None;
        session.set_sink(self.contact.session_events_sender());
        self.cancel_dial();
        self.contact.persist();
        self.contact.publish(ContactEventKind::Update);

        match greeting {
            Some((nickname, message)) => match session.open_request_channel().await {
                Ok(channel) => {
                    self.request_channel = Some(channel);
                    if let Err(e) = session.send_request(channel, &nickname, &message).await {
                        warn!(error = %e, "contact request greeting not sent");
                    }
                }
                Err(e) => warn!(error = %e, "contact request channel not opened"),
            },
            None => {
                let mut conversation = self.contact.conversation().await;
                conversation.attach(session.clone());
                let sent = conversation.send_queued_messages().await;
                drop(conversation);
                if sent > 0 {
                    info!(contact = %self.contact.address(), sent, "sent queued messages");
                }
            }
        }
    }

    async fn handle_session_event(&mut self, ev: SessionEvent) {
        let Some(current) = self.contact.current_session() else {
            return;
        };
        if ev.session != current.id() {
            // Signal from a session that already lost a duel.
            return;
        }
        match ev.kind {
            SessionEventKind::Closed => self.handle_closed().await,
            SessionEventKind::ChatReceived { channel, id, text } => {
                if !self.seen_chat.insert(id) {
                    // Retransmission on the same session: re-ack, no append.
                    debug!(contact = %self.contact.address(), id, "duplicate chat message re-acked");
                    let _ = current.send_chat_ack(channel, id).await;
                    return;
                }
                {
                    let mut conversation = self.contact.conversation().await;
                    conversation.receive(id, &text).await;
                }
                let _ = current.send_chat_ack(channel, id).await;
            }
            SessionEventKind::ChatAcked { id } => {
                self.contact.conversation().await.update_sent_status(id, true);
            }
            SessionEventKind::ReadHint { last_received } => {
                self.contact.conversation().await.apply_read_hint(last_received);
            }
            SessionEventKind::RequestResponse { status } => {
                self.handle_request_response(current, status).await;
            }
            SessionEventKind::ChannelClosed { channel, channel_type } => match channel_type {
                ChannelType::Chat => {
                    self.contact.conversation().await.reset_chat_channel();
                }
                ChannelType::ContactRequest => {
                    if self.request_channel == Some(channel) {
                        self.request_channel = None;
                    }
                }
                ChannelType::Auth => {}
            },
            // Contact sessions never accept request channels.
            SessionEventKind::RequestReceived { .. } => {}
        }
    }

    /// React to the peer's answer to our outbound contact request.
    async fn handle_request_response(&mut self, session: Session, status: RequestStatus) {
        match status {
            RequestStatus::Pending => {
                {
                    let mut state = self.contact.lock_state();
                    if let Some(request) = &mut state.request {
                        request.when_delivered = Some(Utc::now());
                    }
                }
                self.contact.persist();
                self.contact.publish(ContactEventKind::Update);
            }
            RequestStatus::Accepted => {
                info!(contact = %self.contact.address(), "contact request accepted");
                {
                    let mut state = self.contact.lock_state();
                    state.request = None;
                    state.status = ContactStatus::Online;
                }
                if let Some(channel) = self.request_channel.take() {
                    let _ = session.close_channel(channel).await;
                }
                self.contact.persist();
                self.contact.publish(ContactEventKind::Update);
                let mut conversation = self.contact.conversation().await;
                conversation.attach(session.clone());
                conversation.send_queued_messages().await;
            }
            RequestStatus::Rejected | RequestStatus::Error => {
                warn!(contact = %self.contact.address(), ?status, "contact request refused");
                {
                    let mut state = self.contact.lock_state();
                    if let Some(request) = &mut state.request {
                        request.when_rejected = Some(Utc::now());
                        if status == RequestStatus::Error {
                            request.remote_error = Some("error occurred".into());
                        }
                    }
                    state.status = ContactStatus::Rejected;
                }
                self.contact.persist();
                self.contact.publish(ContactEventKind::Update);
                self.cancel_dial();
                session.close();
            }
        }
    }

    /// The current session ended: record the loss, then start dialing
    /// again unless stopped or rejected.
    async fn handle_closed(&mut self) {
        let connected_for = self.clear_current(true).await;
        if connected_for.map(|d| d >= SUSTAINED_CONNECTION).unwrap_or(false) {
            match self.backoff.lock() {
                Ok(mut backoff) => backoff.reset(),
                Err(poisoned) => poisoned.into_inner().reset(),
            }
        }
        self.maybe_dial();
    }

    /// Drop the current session and record the transition. Returns how
    /// long it had been connected.
    async fn clear_current(&mut self, publish: bool) -> Option<Duration> {
        let (session, connected_for) = {
            let mut state = self.contact.lock_state();
            let session = state.current.take();
            if session.is_none() {
                return None;
            }
            let connected_for = state.connected_at.take().map(|t| t.elapsed());
            if state.status != ContactStatus::Rejected {
                state.status = if state.request.is_some() {
                    ContactStatus::Request
                } else {
                    ContactStatus::Offline
                };
            }
            state.last_connected = Some(Utc::now());
            (session, connected_for)
        };
        if let Some(session) = session {
            session.close();
        }
        self.contact.conversation().await.detach();
        self.contact.persist();
        if publish {
            self.contact.publish(ContactEventKind::Update);
        }
        connected_for
    }

    /// Spawn the outbound attempt loop when one should be running.
    fn maybe_dial(&mut self) {
        if !self.enabled || self.dial.is_some() {
            return;
        }
        {
            let state = self.contact.lock_state();
            // No outbound dials to contacts in the REJECTED state.
            if state.status == ContactStatus::Rejected || state.current.is_some() {
                return;
            }
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(connect_outbound(
            self.contact.clone(),
            self.backoff.clone(),
            cancel.clone(),
        ));
        self.dial = Some(DialTask { cancel, handle });
    }

    fn cancel_dial(&mut self) {
        if let Some(dial) = self.dial.take() {
            dial.cancel.cancel();
            dial.handle.abort();
        }
    }
}

/// Outbound attempt loop: dial, authenticate, hand the session to the
/// agent. Runs until it succeeds or is cancelled; handshake failures back
/// off and retry.
async fn connect_outbound(contact: Arc<Contact>, backoff: Arc<Mutex<Backoff>>, cancel: CancellationToken) {
    let identity = contact.deps.identity.clone();
    let connector = OnionConnector::new(contact.deps.resolver.clone(), backoff);
    let target = contact.address().as_str().to_owned();

    loop {
        let stream = match connector.connect(&target, &cancel).await {
            Ok(stream) => stream,
            Err(_) => return,
        };
        debug!(contact = %target, "outbound socket connected, authenticating");

        let (session, mut reader) = Session::new(
            Box::new(stream),
            Direction::Outbound,
            identity.address().clone(),
        );
        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            reader.authenticate_outbound(&identity, contact.address()),
        );
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                session.close();
                return;
            }
            result = handshake => result,
        };
        match result {
            Ok(Ok(known_contact)) => {
                session.set_sink(contact.session_events_sender());
                contact.deliver_outbound(session, known_contact).await;
                tokio::spawn(reader.serve());
                return;
            }
            Ok(Err(e)) => {
                warn!(contact = %target, error = %e, "outbound handshake failed");
                session.close();
            }
            Err(_) => {
                warn!(contact = %target, "outbound handshake timed out");
                session.close();
            }
        }
        if connector.backoff(&cancel).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::contacts::{ContactDeps, ContactState};
    use crate::events::EventPublisher;
    use crate::identity::Identity;
    use crate::messaging::MessageStatus;
    use crate::protocol::SessionReader;
    use crate::tor::Resolver;
    use std::net::SocketAddr;

    fn label(s: &str) -> OnionAddress {
        OnionAddress::from_string(s).expect("label")
    }

    #[test]
    fn duel_replaces_closed_current() {
        let info = CurrentSessionInfo {
            direction: Direction::Inbound,
            age: Duration::ZERO,
            closed: true,
        };
        assert!(should_replace_connection(
            &label("aaaaaaaaaaaaaaaa"),
            &label("bbbbbbbbbbbbbbbb"),
            &info,
            Direction::Inbound
        ));
    }

    #[test]
    fn duel_same_direction_always_replaces() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            let info = CurrentSessionInfo {
                direction,
                age: Duration::ZERO,
                closed: false,
            };
            assert!(should_replace_connection(
                &label("bbbbbbbbbbbbbbbb"),
                &label("aaaaaaaaaaaaaaaa"),
                &info,
                direction
            ));
        }
    }

    #[test]
    fn duel_old_current_always_replaced() {
        let info = CurrentSessionInfo {
            direction: Direction::Inbound,
            age: Duration::from_secs(31),
            closed: false,
        };
        // Tie-break would keep the current one; age overrides it.
        assert!(should_replace_connection(
            &label("bbbbbbbbbbbbbbbb"),
            &label("aaaaaaaaaaaaaaaa"),
            &info,
            Direction::Outbound
        ));
    }

    #[test]
    fn duel_tie_break_prefers_smaller_label_outbound() {
        let a = label("aaaaaaaaaaaaaaaa");
        let b = label("bbbbbbbbbbbbbbbb");
        let fresh = |direction| CurrentSessionInfo {
            direction,
            age: Duration::from_secs(1),
            closed: false,
        };

        // Smaller label keeps its outbound session.
        assert!(should_replace_connection(&a, &b, &fresh(Direction::Inbound), Direction::Outbound));
        assert!(!should_replace_connection(&a, &b, &fresh(Direction::Outbound), Direction::Inbound));
        // Larger label keeps its inbound session.
        assert!(!should_replace_connection(&b, &a, &fresh(Direction::Inbound), Direction::Outbound));
        assert!(should_replace_connection(&b, &a, &fresh(Direction::Outbound), Direction::Inbound));
    }

    #[test]
    fn duel_tie_break_converges_on_both_endpoints() {
        let a = label("aaaaaaaaaaaaaaaa");
        let b = label("bbbbbbbbbbbbbbbb");
        // Session X is A-dialed, session Y is B-dialed. Whatever order the
        // sessions land in, both endpoints must keep the same session.
        for (a_current, a_new) in [(Direction::Outbound, Direction::Inbound), (Direction::Inbound, Direction::Outbound)] {
            let mirror = |d: Direction| match d {
                Direction::Outbound => Direction::Inbound,
                Direction::Inbound => Direction::Outbound,
            };
            let fresh = |direction| CurrentSessionInfo { direction, age: Duration::from_secs(1), closed: false };

            let a_keeps_new = should_replace_connection(&a, &b, &fresh(a_current), a_new);
            let b_keeps_new = should_replace_connection(&b, &a, &fresh(mirror(a_current)), mirror(a_new));
            // "New" refers to the same underlying session on both sides.
            assert_eq!(a_keeps_new, b_keeps_new);

            // And the survivor is the A-dialed session.
            let survivor_is_x = if a_keeps_new { a_new == Direction::Outbound } else { a_current == Direction::Outbound };
            assert!(survivor_is_x, "the endpoint with the smaller label keeps its outbound session");
        }
    }

    // Async agent tests drive real sessions over in-memory pipes.

    fn dead_addr() -> SocketAddr {
        // Bind and immediately drop a listener so dials fail fast.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    }

    fn deps_for(identity: Arc<Identity>, peer: &OnionAddress) -> ContactDeps {
        let resolver = Resolver::default();
        resolver.set_local_override(peer.as_str(), dead_addr());
        ContactDeps {
            identity,
            resolver: Arc::new(resolver),
            config: ConfigStore::in_memory(),
            events: EventPublisher::new(),
        }
    }

    /// Authenticated session pair over a duplex pipe; the first tuple is
    /// the dialer's side.
    async fn authed_duplex(
        dialer: Arc<Identity>,
        acceptor: Arc<Identity>,
    ) -> ((Session, SessionReader), (Session, SessionReader)) {
        let (d_stream, a_stream) = tokio::io::duplex(64 * 1024);
        let (d_sess, mut d_reader) =
            Session::new(Box::new(d_stream), Direction::Outbound, dialer.address().clone());
        let (a_sess, mut a_reader) =
            Session::new(Box::new(a_stream), Direction::Inbound, acceptor.address().clone());
        let acceptor_task = tokio::spawn({
            let acceptor = acceptor.clone();
            async move {
                a_reader
                    .authenticate_inbound(&acceptor, |_| true)
                    .await
                    .expect("inbound auth");
                a_reader
            }
        });
        d_reader
            .authenticate_outbound(&dialer, acceptor.address())
            .await
            .expect("outbound auth");
        let a_reader = acceptor_task.await.expect("join");
        ((d_sess, d_reader), (a_sess, a_reader))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn adoption_goes_online_and_drains_queue() {
        let alice = Arc::new(Identity::generate().expect("alice"));
        let bob = Arc::new(Identity::generate().expect("bob"));
        let deps = deps_for(alice.clone(), bob.address());
        let contact = Contact::spawn(
            0,
            bob.address().clone(),
            ContactState::new("bob".into(), ContactStatus::Unknown, None),
            deps,
        );
        contact.start().await;

        // Compose while offline: the message is queued.
        let id = contact.conversation().await.send("hello offline").await.expect("send");
        assert_eq!(contact.conversation().await.messages()[0].status, MessageStatus::Queued);

        // Bob dials us; our side of the pair is the inbound session.
        let ((bob_sess, bob_reader), (our_sess, our_reader)) =
            authed_duplex(bob.clone(), alice.clone()).await;
        let (bob_tx, mut bob_rx) = mpsc::channel(16);
        bob_sess.set_sink(bob_tx);
        tokio::spawn(bob_reader.serve());

        our_sess.set_sink(contact.session_events_sender());
        contact.deliver_inbound(our_sess.clone(), true).await;
        tokio::spawn(our_reader.serve());

        {
            let contact = contact.clone();
            wait_until(move || contact.status() == ContactStatus::Online).await;
        }
        assert!(contact.last_connected().is_some());

        // The queued message arrives on bob's side.
        let ev = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
            .await
            .expect("timely")
            .expect("event");
        let (channel, recv_id) = match ev.kind {
            SessionEventKind::ChatReceived { channel, id, ref text } => {
                assert_eq!(text, "hello offline");
                (channel, id)
            }
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(recv_id, id);

        // Bob acks; the message becomes delivered on our side.
        bob_sess.send_chat_ack(channel, recv_id).await.expect("ack");
        for _ in 0..500 {
            if contact.conversation().await.messages()[0].status == MessageStatus::Delivered {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(contact.conversation().await.messages()[0].status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn duplicate_chat_message_is_reacked_but_not_appended() {
        let alice = Arc::new(Identity::generate().expect("alice"));
        let bob = Arc::new(Identity::generate().expect("bob"));
        let deps = deps_for(alice.clone(), bob.address());
        let contact = Contact::spawn(
            1,
            bob.address().clone(),
            ContactState::new("bob".into(), ContactStatus::Unknown, None),
            deps,
        );
        contact.start().await;

        let ((bob_sess, bob_reader), (our_sess, our_reader)) =
            authed_duplex(bob.clone(), alice.clone()).await;
        let (bob_tx, mut bob_rx) = mpsc::channel(16);
        bob_sess.set_sink(bob_tx);
        tokio::spawn(bob_reader.serve());
        our_sess.set_sink(contact.session_events_sender());
        contact.deliver_inbound(our_sess, true).await;
        tokio::spawn(our_reader.serve());
        {
            let contact = contact.clone();
            wait_until(move || contact.status() == ContactStatus::Online).await;
        }

        let channel = bob_sess.open_chat_channel().await.expect("open");
        bob_sess.send_chat_message(channel, 9, "once").await.expect("send");
        bob_sess.send_chat_message(channel, 9, "once").await.expect("resend");

        // Both transmissions are acked.
        for _ in 0..2 {
            let ev = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
                .await
                .expect("timely")
                .expect("event");
            assert!(matches!(ev.kind, SessionEventKind::ChatAcked { id: 9 }));
        }
        // Only one copy was appended.
        assert_eq!(contact.conversation().await.messages().len(), 1);
    }

    #[tokio::test]
    async fn same_direction_duel_adopts_the_new_session() {
        let alice = Arc::new(Identity::generate().expect("alice"));
        let bob = Arc::new(Identity::generate().expect("bob"));
        let deps = deps_for(alice.clone(), bob.address());
        let contact = Contact::spawn(
            2,
            bob.address().clone(),
            ContactState::new("bob".into(), ContactStatus::Unknown, None),
            deps,
        );
        contact.start().await;

        let ((_bob1, bob1_reader), (s1, s1_reader)) = authed_duplex(bob.clone(), alice.clone()).await;
        tokio::spawn(bob1_reader.serve());
        s1.set_sink(contact.session_events_sender());
        contact.deliver_inbound(s1.clone(), true).await;
        tokio::spawn(s1_reader.serve());
        {
            let contact = contact.clone();
            wait_until(move || contact.status() == ContactStatus::Online).await;
        }

        let ((_bob2, bob2_reader), (s2, s2_reader)) = authed_duplex(bob.clone(), alice.clone()).await;
        tokio::spawn(bob2_reader.serve());
        s2.set_sink(contact.session_events_sender());
        contact.deliver_inbound(s2.clone(), true).await;
        tokio::spawn(s2_reader.serve());

        {
            let contact = contact.clone();
            let s2_id = s2.id();
            wait_until(move || contact.current_session().map(|s| s.id()) == Some(s2_id)).await;
        }
        assert!(s1.is_closed());
        assert!(!s2.is_closed());
    }

    #[tokio::test]
    async fn opposite_direction_duel_follows_the_label_tie_break() {
        let alice = Arc::new(Identity::generate().expect("alice"));
        let bob = Arc::new(Identity::generate().expect("bob"));
        let deps = deps_for(alice.clone(), bob.address());
        let contact = Contact::spawn(
            3,
            bob.address().clone(),
            ContactState::new("bob".into(), ContactStatus::Unknown, None),
            deps,
        );
        contact.start().await;

        // Current session: bob dialed us (inbound on our side).
        let ((_bob1, bob1_reader), (s1, s1_reader)) = authed_duplex(bob.clone(), alice.clone()).await;
        tokio::spawn(bob1_reader.serve());
        s1.set_sink(contact.session_events_sender());
        contact.deliver_inbound(s1.clone(), true).await;
        tokio::spawn(s1_reader.serve());
        {
            let contact = contact.clone();
            wait_until(move || contact.current_session().is_some()).await;
        }

        // New session: we dialed bob (outbound on our side).
        let ((s2, s2_reader), (_bob2, bob2_reader)) = authed_duplex(alice.clone(), bob.clone()).await;
        tokio::spawn(bob2_reader.serve());
        s2.set_sink(contact.session_events_sender());
        contact.deliver_outbound(s2.clone(), true).await;
        tokio::spawn(s2_reader.serve());

        let expect_new = should_replace_connection(
            alice.address(),
            bob.address(),
            &CurrentSessionInfo {
                direction: Direction::Inbound,
                age: Duration::ZERO,
                closed: false,
            },
            Direction::Outbound,
        );
        let winner = if expect_new { s2.id() } else { s1.id() };
        let loser = if expect_new { s1.clone() } else { s2.clone() };
        {
            let contact = contact.clone();
            wait_until(move || {
                contact.current_session().map(|s| s.id()) == Some(winner)
            })
            .await;
        }
        wait_until(move || loser.is_closed()).await;
    }

    #[tokio::test]
    async fn outbound_not_known_without_request_moves_to_rejected() {
        let alice = Arc::new(Identity::generate().expect("alice"));
        let bob = Arc::new(Identity::generate().expect("bob"));
        let deps = deps_for(alice.clone(), bob.address());
        let contact = Contact::spawn(
            4,
            bob.address().clone(),
            ContactState::new("bob".into(), ContactStatus::Unknown, None),
            deps,
        );
        contact.start().await;

        let ((s, s_reader), (_peer, peer_reader)) = authed_duplex(alice.clone(), bob.clone()).await;
        tokio::spawn(peer_reader.serve());
        s.set_sink(contact.session_events_sender());
        contact.deliver_outbound(s.clone(), false).await;
        tokio::spawn(s_reader.serve());

        {
            let contact = contact.clone();
            wait_until(move || contact.status() == ContactStatus::Rejected).await;
        }
        assert!(s.is_closed());
        assert!(contact.current_session().is_none());
    }

    #[tokio::test]
    async fn rejected_contact_start_does_not_connect_or_publish() {
        let alice = Arc::new(Identity::generate().expect("alice"));
        let bob = Arc::new(Identity::generate().expect("bob"));
        let deps = deps_for(alice.clone(), bob.address());
        let mut events = deps.events.subscribe();
        let contact = Contact::spawn(
            5,
            bob.address().clone(),
            ContactState::new("bob".into(), ContactStatus::Rejected, None),
            deps,
        );
        contact.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(contact.status(), ContactStatus::Rejected);
        assert!(contact.current_session().is_none());
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }
}
