//! Contacts and their connection management.
//!
//! A contact is an immutable identity (id, onion address) plus mutable
//! state guarded by one mutex. Each contact owns a connection agent task
//! that keeps at most one authenticated session alive, and exactly one
//! conversation carried over whichever session is current.

mod agent;
mod registry;

pub use registry::{ContactList, IncomingRequestInfo};

pub(crate) use agent::AgentCommand;
pub(crate) use registry::{RequestDecision, RequestRouting};

use crate::config::{ConfigStore, ContactConfig, ContactRequestConfig};
use crate::error::{Error, Result};
use crate::events::{ContactEventKind, Event, EventPublisher};
use crate::identity::{Identity, OnionAddress};
use crate::messaging::Conversation;
use crate::protocol::{Session, SessionEvent};
use crate::tor::Resolver;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::warn;

/// Maximum nickname length in characters.
pub const MAX_NICKNAME_LEN: usize = 30;

/// Connection status of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactStatus {
    /// Never connected since startup.
    Unknown,
    /// No session at the moment.
    Offline,
    /// An authenticated session is current.
    Online,
    /// An outbound contact request is outstanding.
    Request,
    /// The peer rejected us; no outbound dials are made.
    Rejected,
}

/// Outbound contact request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Nickname we introduce ourselves with.
    pub my_nickname: String,
    /// Greeting text.
    pub message: String,
    /// When the peer acknowledged the request as pending.
    pub when_delivered: Option<DateTime<Utc>>,
    /// When the peer rejected the request.
    pub when_rejected: Option<DateTime<Utc>>,
    /// Error reported by the peer, if any.
    pub remote_error: Option<String>,
}

impl OutboundRequest {
    /// A fresh request that has not been delivered yet.
    pub fn new(my_nickname: String, message: String) -> Self {
        Self {
            my_nickname,
            message,
            when_delivered: None,
            when_rejected: None,
            remote_error: None,
        }
    }

    /// Whether the peer has rejected this request.
    pub fn is_rejected(&self) -> bool {
        self.when_rejected.is_some()
    }
}

/// Immutable copy of a contact's state, as carried in events.
#[derive(Debug, Clone)]
pub struct ContactSnapshot {
    /// Contact id.
    pub id: u32,
    /// Onion address.
    pub address: OnionAddress,
    /// Nickname.
    pub nickname: String,
    /// Connection status.
    pub status: ContactStatus,
    /// Creation time.
    pub when_created: DateTime<Utc>,
    /// Last successful connection, if any.
    pub last_connected: Option<DateTime<Utc>>,
    /// Outbound request state, if any.
    pub request: Option<OutboundRequest>,
}

/// Collaborators every contact needs.
#[derive(Clone)]
pub(crate) struct ContactDeps {
    pub identity: Arc<Identity>,
    pub resolver: Arc<Resolver>,
    pub config: ConfigStore,
    pub events: EventPublisher,
}

/// Mutable contact state, guarded by the per-contact mutex.
pub(crate) struct ContactState {
    pub nickname: String,
    pub when_created: DateTime<Utc>,
    pub last_connected: Option<DateTime<Utc>>,
    pub status: ContactStatus,
    pub request: Option<OutboundRequest>,
    /// The adopted session. Written only by the agent task.
    pub current: Option<Session>,
    /// When the current session was adopted.
    pub connected_at: Option<Instant>,
}

impl ContactState {
    pub(crate) fn new(nickname: String, status: ContactStatus, request: Option<OutboundRequest>) -> Self {
        Self {
            nickname,
            when_created: Utc::now(),
            last_connected: None,
            status,
            request,
            current: None,
            connected_at: None,
        }
    }
}

/// A known peer.
pub struct Contact {
    id: u32,
    address: OnionAddress,
    deps: ContactDeps,
    state: Mutex<ContactState>,
    conversation: tokio::sync::Mutex<Conversation>,
    agent_tx: mpsc::Sender<AgentCommand>,
    session_tx: mpsc::Sender<SessionEvent>,
}

impl Contact {
    /// Create the contact and spawn its connection agent.
    pub(crate) fn spawn(id: u32, address: OnionAddress, state: ContactState, deps: ContactDeps) -> Arc<Contact> {
        let (agent_tx, agent_rx) = mpsc::channel(16);
        let (session_tx, session_rx) = mpsc::channel(64);
        let conversation = Conversation::new(
            deps.identity.address().clone(),
            address.clone(),
            deps.events.clone(),
        );
        let contact = Arc::new(Contact {
            id,
            address,
            deps,
            state: Mutex::new(state),
            conversation: tokio::sync::Mutex::new(conversation),
            agent_tx,
            session_tx,
        });
        tokio::spawn(agent::run(contact.clone(), agent_rx, session_rx));
        contact
    }

    /// Contact id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Onion address.
    pub fn address(&self) -> &OnionAddress {
        &self.address
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ContactState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current nickname.
    pub fn nickname(&self) -> String {
        self.lock_state().nickname.clone()
    }

    /// Current status.
    pub fn status(&self) -> ContactStatus {
        self.lock_state().status
    }

    /// Last successful connection time.
    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.lock_state().last_connected
    }

    /// Whether an outbound contact request is outstanding.
    pub fn is_request_pending(&self) -> bool {
        self.lock_state().request.is_some()
    }

    /// The adopted session, if any. At most one session is ever current.
    pub fn current_session(&self) -> Option<Session> {
        self.lock_state().current.clone()
    }

    /// Take a snapshot of the contact's state.
    pub fn snapshot(&self) -> ContactSnapshot {
        let state = self.lock_state();
        ContactSnapshot {
            id: self.id,
            address: self.address.clone(),
            nickname: state.nickname.clone(),
            status: state.status,
            when_created: state.when_created,
            last_connected: state.last_connected,
            request: state.request.clone(),
        }
    }

    /// Rename the contact. The nickname must pass the acceptability
    /// filter.
    pub fn set_nickname(&self, nickname: &str) -> Result<()> {
        if !is_nickname_acceptable(nickname) {
            return Err(Error::Validation("nickname is unacceptable".into()));
        }
        {
            let mut state = self.lock_state();
            state.nickname = nickname.to_owned();
        }
        self.persist();
        self.publish(ContactEventKind::Update);
        Ok(())
    }

    /// Access the conversation.
    pub async fn conversation(&self) -> tokio::sync::MutexGuard<'_, Conversation> {
        self.conversation.lock().await
    }

    /// Begin trying to reach this peer.
    pub async fn start(&self) {
        let _ = self.agent_tx.send(AgentCommand::Start).await;
    }

    /// Cease trying; close any current session.
    pub async fn stop(&self) {
        let _ = self.agent_tx.send(AgentCommand::Stop).await;
    }

    /// Stop and terminate the agent task. Used when the contact is
    /// deleted or the client shuts down.
    pub(crate) async fn shutdown(&self) {
        let _ = self.agent_tx.send(AgentCommand::Shutdown).await;
    }

    /// Hand a freshly authenticated inbound session to the agent.
    pub(crate) async fn deliver_inbound(&self, session: Session, known_contact: bool) {
        let _ = self
            .agent_tx
            .send(AgentCommand::InboundAuthed { session, known_contact })
            .await;
    }

    /// Hand a freshly authenticated outbound session to the agent.
    pub(crate) async fn deliver_outbound(&self, session: Session, known_contact: bool) {
        let _ = self
            .agent_tx
            .send(AgentCommand::OutboundAuthed { session, known_contact })
            .await;
    }

    /// The sink adopted sessions send their events to.
    pub(crate) fn session_events_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.session_tx.clone()
    }

    /// Write this contact's entry in the config document. Failures are
    /// logged by the store; in-memory state stands either way.
    pub(crate) fn persist(&self) {
        let entry = {
            let state = self.lock_state();
            ContactConfig {
                hostname: self.address.onion_hostname(),
                nickname: state.nickname.clone(),
                when_created: state.when_created.to_rfc3339(),
                last_connected: state
                    .last_connected
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                request: match &state.request {
                    Some(request) => ContactRequestConfig {
                        pending: true,
                        when_delivered: request
                            .when_delivered
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_default(),
                        when_rejected: request
                            .when_rejected
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_default(),
                        remote_error: request.remote_error.clone().unwrap_or_default(),
                        my_nickname: request.my_nickname.clone(),
                        message: request.message.clone(),
                    },
                    None => ContactRequestConfig::default(),
                },
            }
        };
        let mut write = self.deps.config.open_write();
        write.contacts.insert(self.id.to_string(), entry);
        write.save();
    }

    pub(crate) fn publish(&self, kind: ContactEventKind) {
        self.deps.events.publish(Event::Contact {
            kind,
            contact: self.snapshot(),
        });
    }

    pub(crate) fn remove_from_config(&self) {
        let mut write = self.deps.config.open_write();
        write.contacts.remove(&self.id.to_string());
        write.save();
    }
}

impl std::fmt::Debug for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("status", &self.status())
            .finish()
    }
}

/// Whether a nickname passes the acceptability filter: non-empty, at most
/// [`MAX_NICKNAME_LEN`] characters, no control characters.
pub fn is_nickname_acceptable(nickname: &str) -> bool {
    !nickname.is_empty()
        && nickname.chars().count() <= MAX_NICKNAME_LEN
        && !nickname.chars().any(|c| c.is_control())
}

/// Whether greeting text passes the acceptability filter: non-empty, at
/// most 2000 bytes, no control characters beyond whitespace.
pub fn is_message_acceptable(message: &str) -> bool {
    !message.is_empty()
        && message.len() <= crate::messaging::MAX_MESSAGE_TEXT_LEN
        && !message.chars().any(|c| c.is_control() && c != '\n' && c != '\t' && c != '\r')
}

/// Strip a nickname that fails the filter, logging the rejection.
pub(crate) fn filtered_nickname(nickname: &str) -> String {
    if nickname.is_empty() || is_nickname_acceptable(nickname) {
        nickname.to_owned()
    } else {
        warn!(encoded = %hex::encode(nickname.as_bytes()), "stripping unacceptable nickname from inbound request");
        String::new()
    }
}

/// Strip greeting text that fails the filter, logging the rejection.
pub(crate) fn filtered_message(message: &str) -> String {
    if message.is_empty() || is_message_acceptable(message) {
        message.to_owned()
    } else {
        warn!(len = message.len(), "stripping unacceptable message from inbound request");
        String::new()
    }
}
