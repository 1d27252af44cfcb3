//! Client assembly.
//!
//! Wires the identity, config document, contact registry, event stream and
//! the accept loop together. The hidden service itself is published by the
//! external Tor daemon; the client only listens on the local address the
//! service forwards to.

use crate::config::{ConfigStore, IdentityConfig};
use crate::contacts::{
    filtered_message, filtered_nickname, ContactDeps, ContactList, RequestDecision, RequestRouting,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventPublisher};
use crate::identity::{Identity, OnionAddress};
use crate::protocol::{
    Direction, RequestStatus, Session, SessionEvent, SessionEventKind, SessionReader,
};
use crate::tor::Resolver;
use crate::HANDSHAKE_TIMEOUT;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ListenerTask {
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

/// The peer connection core, assembled.
pub struct Client {
    identity: Arc<Identity>,
    config: ConfigStore,
    events: EventPublisher,
    contacts: Arc<ContactList>,
    listener: Mutex<Option<ListenerTask>>,
}

impl Client {
    /// Open a client over a config store and an overlay resolver. Loads
    /// (or generates and persists) the identity and populates the contact
    /// registry; agents for known contacts start dialing immediately.
    pub async fn open(config: ConfigStore, resolver: Resolver) -> Result<Arc<Client>> {
        let identity = Arc::new(load_or_generate_identity(&config)?);
        info!(address = %identity.address(), "identity ready");

        let events = EventPublisher::new();
        let contacts = ContactList::new(ContactDeps {
            identity: identity.clone(),
            resolver: Arc::new(resolver),
            config: config.clone(),
            events: events.clone(),
        });
        contacts.load().await?;

        Ok(Arc::new(Client {
            identity,
            config,
            events,
            contacts,
            listener: Mutex::new(None),
        }))
    }

    /// The local identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Our onion address.
    pub fn address(&self) -> &OnionAddress {
        self.identity.address()
    }

    /// The contact registry.
    pub fn contacts(&self) -> &ContactList {
        &self.contacts
    }

    /// The config document.
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Subscribe to contact and conversation events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Start accepting inbound overlay connections on `bind`. The hidden
    /// service's virtual port forwards here. Returns the bound address.
    pub async fn listen(&self, bind: SocketAddr) -> Result<SocketAddr> {
        let mut slot = match self.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return Err(Error::Transport("already listening".into()));
        }
        let listener = std::net::TcpListener::bind(bind)
            .map_err(|e| Error::Transport(format!("bind {} failed: {}", bind, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let listener =
            TcpListener::from_std(listener).map_err(|e| Error::Transport(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;
        info!(%local_addr, "listening for inbound connections");

        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            self.identity.clone(),
            self.contacts.clone(),
            cancel.clone(),
        ));
        *slot = Some(ListenerTask { cancel, local_addr });
        Ok(local_addr)
    }

    /// The address the accept loop is bound to, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.listener.lock() {
            Ok(guard) => guard.as_ref().map(|t| t.local_addr),
            Err(poisoned) => poisoned.into_inner().as_ref().map(|t| t.local_addr),
        }
    }

    /// Stop the accept loop and every contact agent.
    pub async fn shutdown(&self) {
        let task = match self.listener.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.cancel.cancel();
        }
        self.contacts.shutdown().await;
        info!("client shut down");
    }
}

fn load_or_generate_identity(config: &ConfigStore) -> Result<Identity> {
    if let Some(identity_cfg) = config.read(|doc| doc.identity.clone()) {
        let der = BASE64
            .decode(identity_cfg.service_key)
            .map_err(|e| Error::Identity(format!("invalid service key encoding: {}", e)))?;
        return Identity::from_der(&der);
    }
    let identity = Identity::generate()?;
    let der = identity.to_der()?;
    let mut write = config.open_write();
    write.identity = Some(IdentityConfig {
        service_key: BASE64.encode(der),
    });
    write.save();
    Ok(identity)
}

/// The global accept loop: one task, one spawned handler per connection.
async fn accept_loop(
    listener: TcpListener,
    identity: Arc<Identity>,
    contacts: Arc<ContactList>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                debug!(%remote, "accepted inbound connection");
                tokio::spawn(handle_inbound(stream, identity.clone(), contacts.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
    debug!("accept loop stopped");
}

/// Authenticate one inbound connection and route it: to the owning
/// contact's agent when the proven label is known, or into the
/// contact-request flow otherwise.
async fn handle_inbound(stream: TcpStream, identity: Arc<Identity>, contacts: Arc<ContactList>) {
    let (session, mut reader) = Session::new(
        Box::new(stream),
        Direction::Inbound,
        identity.address().clone(),
    );
    let handshake = timeout(
        HANDSHAKE_TIMEOUT,
        reader.authenticate_inbound(&identity, |label| contacts.is_known_non_rejected(label)),
    )
    .await;
    let (label, known) = match handshake {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            debug!(error = %e, "inbound authentication failed");
            session.close();
            return;
        }
        Err(_) => {
            debug!("inbound handshake timed out");
            session.close();
            return;
        }
    };

    if known {
        if let Some(contact) = contacts.get_by_label(&label) {
            session.set_sink(contact.session_events_sender());
            contact.deliver_inbound(session, true).await;
            // This task stays on as the session's read loop.
            reader.serve().await;
            return;
        }
    }
    handle_inbound_request(session, reader, label, contacts).await;
}

/// Serve an authenticated session from an unknown peer: the only thing it
/// may do is ask to become a contact.
async fn handle_inbound_request(
    session: Session,
    reader: SessionReader,
    label: OnionAddress,
    contacts: Arc<ContactList>,
) {
    session.set_accepts_requests(true);
    let (tx, mut rx) = mpsc::channel(8);
    session.set_sink(tx);
    tokio::spawn(reader.serve());

    // The greeting has to arrive promptly.
    let (channel, nickname, message) = loop {
        let ev = match timeout(HANDSHAKE_TIMEOUT, rx.recv()).await {
            Ok(Some(ev)) => ev,
            _ => {
                session.close();
                return;
            }
        };
        match ev.kind {
            SessionEventKind::RequestReceived { channel, nickname, message } => {
                break (channel, nickname, message);
            }
            SessionEventKind::Closed => return,
            _ => {
                debug!(peer = %label, "unexpected traffic from unknown peer");
                session.close();
                return;
            }
        }
    };

    let nickname = filtered_nickname(&nickname);
    let message = filtered_message(&message);

    match contacts.register_inbound_request(&label, &nickname, &message) {
        RequestRouting::AcceptExisting(contact) => {
            let _ = session.send_request_response(channel, RequestStatus::Accepted).await;
            let _ = session.close_channel(channel).await;
            session.set_accepts_requests(false);
            session.set_sink(contact.session_events_sender());
            contact.deliver_inbound(session, true).await;
        }
        RequestRouting::Rejected => {
            let _ = session.send_request_response(channel, RequestStatus::Rejected).await;
            let _ = session.close_channel(channel).await;
            session.close();
        }
        RequestRouting::Pending(mut decision_rx) => {
            let _ = session.send_request_response(channel, RequestStatus::Pending).await;
            loop {
                tokio::select! {
                    ev = rx.recv() => match ev {
                        Some(SessionEvent { kind: SessionEventKind::Closed, .. }) | None => {
                            // The peer went away; the pending request keeps
                            // its data and waits for the next session.
                            return;
                        }
                        Some(SessionEvent { kind: SessionEventKind::RequestReceived { .. }, .. }) => {
                            // Greeting retransmitted on the open channel.
                        }
                        Some(_) => {}
                    },
                    decision = &mut decision_rx => match decision {
                        Ok(RequestDecision::Accept(contact)) => {
                            let _ = session.send_request_response(channel, RequestStatus::Accepted).await;
                            let _ = session.close_channel(channel).await;
                            session.set_accepts_requests(false);
                            session.set_sink(contact.session_events_sender());
                            contact.deliver_inbound(session.clone(), true).await;
                            return;
                        }
                        Ok(RequestDecision::Reject) => {
                            let _ = session.send_request_response(channel, RequestStatus::Rejected).await;
                            let _ = session.close_channel(channel).await;
                            session.close();
                            return;
                        }
                        Err(_) => {
                            // A newer session for the same address took over
                            // the pending request.
                            debug!(peer = %label, "request session superseded");
                            session.close();
                            return;
                        }
                    },
                }
            }
        }
    }
}
