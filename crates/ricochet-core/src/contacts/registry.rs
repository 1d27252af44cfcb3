//! The contact registry.
//!
//! Keyed by bare onion address. Routes authenticated inbound sessions to
//! the right contact's agent, and owns the lifecycle of inbound contact
//! requests: a request is held pending until the user accepts or rejects
//! it, and a rejected address stays rejected.

use super::{
    is_nickname_acceptable, Contact, ContactDeps, ContactState, ContactStatus, OutboundRequest,
};
use crate::config::ContactConfig;
use crate::error::{Error, Result};
use crate::events::{ContactEventKind, Event};
use crate::identity::OnionAddress;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// A pending inbound contact request, as exposed to subscribers.
#[derive(Debug, Clone)]
pub struct IncomingRequestInfo {
    /// The requesting peer's address.
    pub address: OnionAddress,
    /// Proposed nickname, already filtered.
    pub nickname: String,
    /// Greeting text, already filtered.
    pub message: String,
    /// When the request first arrived.
    pub when_created: DateTime<Utc>,
}

/// The user's verdict on a pending inbound request, delivered to the
/// session task holding the request channel open.
pub(crate) enum RequestDecision {
    Accept(Arc<Contact>),
    Reject,
}

/// Where an inbound contact request goes.
pub(crate) enum RequestRouting {
    /// The address already belongs to a contact: implicitly accepted.
    AcceptExisting(Arc<Contact>),
    /// Held for a user decision; resolved through the receiver.
    Pending(oneshot::Receiver<RequestDecision>),
    /// Rejected outright.
    Rejected,
}

struct PendingRequest {
    nickname: String,
    message: String,
    when_created: DateTime<Utc>,
    rejected: bool,
    decision_tx: Option<oneshot::Sender<RequestDecision>>,
}

struct Inner {
    contacts: HashMap<OnionAddress, Arc<Contact>>,
    requests: HashMap<OnionAddress, PendingRequest>,
    next_id: u32,
}

/// Set of known contacts plus pending inbound requests.
pub struct ContactList {
    deps: ContactDeps,
    inner: Mutex<Inner>,
}

impl ContactList {
    pub(crate) fn new(deps: ContactDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            inner: Mutex::new(Inner {
                contacts: HashMap::new(),
                requests: HashMap::new(),
                next_id: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Load contacts from the config document, publish POPULATE events,
    /// and start agents for everything not rejected.
    pub async fn load(&self) -> Result<()> {
        let entries = self.deps.config.read(|doc| doc.contacts.clone());
        let mut loaded = Vec::new();
        {
            let mut inner = self.lock();
            for (key, cfg) in entries {
                match self.contact_from_config(&key, &cfg) {
                    Ok((id, address, state)) => {
                        if inner.contacts.contains_key(&address) {
                            warn!(%address, "duplicate contact entry ignored");
                            continue;
                        }
                        let contact = Contact::spawn(id, address.clone(), state, self.deps.clone());
                        inner.next_id = inner.next_id.max(id + 1);
                        inner.contacts.insert(address, contact.clone());
                        loaded.push(contact);
                    }
                    Err(e) => warn!(key, error = %e, "skipping invalid contact entry"),
                }
            }
        }
        for contact in loaded {
            self.deps.events.publish(Event::Contact {
                kind: ContactEventKind::Populate,
                contact: contact.snapshot(),
            });
            if contact.status() != ContactStatus::Rejected {
                contact.start().await;
            }
        }
        Ok(())
    }

    fn contact_from_config(&self, key: &str, cfg: &ContactConfig) -> Result<(u32, OnionAddress, ContactState)> {
        let id: u32 = key
            .parse()
            .map_err(|_| Error::Validation(format!("invalid contact id '{}'", key)))?;
        let address = OnionAddress::from_onion_hostname(&cfg.hostname)?;
        let request = if cfg.request.pending {
            Some(OutboundRequest {
                my_nickname: cfg.request.my_nickname.clone(),
                message: cfg.request.message.clone(),
                when_delivered: parse_time(&cfg.request.when_delivered),
                when_rejected: parse_time(&cfg.request.when_rejected),
                remote_error: if cfg.request.remote_error.is_empty() {
                    None
                } else {
                    Some(cfg.request.remote_error.clone())
                },
            })
        } else {
            None
        };
        let status = match &request {
            Some(r) if r.is_rejected() => ContactStatus::Rejected,
            Some(_) => ContactStatus::Request,
            None => ContactStatus::Unknown,
        };
        let mut state = ContactState::new(cfg.nickname.clone(), status, request);
        if let Some(when_created) = parse_time(&cfg.when_created) {
            state.when_created = when_created;
        }
        state.last_connected = parse_time(&cfg.last_connected);
        Ok((id, address, state))
    }

    fn insert_new_contact(
        &self,
        address: OnionAddress,
        nickname: &str,
        status: ContactStatus,
        request: Option<OutboundRequest>,
    ) -> Result<Arc<Contact>> {
        if !nickname.is_empty() && !is_nickname_acceptable(nickname) {
            return Err(Error::Validation("nickname is unacceptable".into()));
        }
        let mut inner = self.lock();
        if inner.contacts.contains_key(&address) {
            return Err(Error::Validation(format!("contact {} already exists", address)));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let state = ContactState::new(nickname.to_owned(), status, request);
        let contact = Contact::spawn(id, address.clone(), state, self.deps.clone());
        inner.contacts.insert(address, contact.clone());
        Ok(contact)
    }

    /// Add a peer the user already trusts (e.g. after accepting an inbound
    /// request out of band). The agent starts dialing immediately.
    pub async fn add_contact(&self, address: &str, nickname: &str) -> Result<Arc<Contact>> {
        let address = OnionAddress::from_string(address)?;
        let contact = self.insert_new_contact(address, nickname, ContactStatus::Unknown, None)?;
        contact.persist();
        contact.publish(ContactEventKind::Add);
        contact.start().await;
        Ok(contact)
    }

    /// Add a peer we still have to introduce ourselves to. The greeting is
    /// sent on the first authenticated outbound session, and the contact
    /// stays in REQUEST until the peer accepts.
    pub async fn add_outbound_request(
        &self,
        address: &str,
        nickname: &str,
        my_nickname: &str,
        message: &str,
    ) -> Result<Arc<Contact>> {
        let address = OnionAddress::from_string(address)?;
        let request = OutboundRequest::new(my_nickname.to_owned(), message.to_owned());
        let contact =
            self.insert_new_contact(address, nickname, ContactStatus::Request, Some(request))?;
        contact.persist();
        contact.publish(ContactEventKind::Add);
        contact.start().await;
        Ok(contact)
    }

    /// Remove a contact: stops its agent, closes any session, deletes the
    /// config entry.
    pub async fn delete_contact(&self, address: &OnionAddress) -> Result<()> {
        let contact = {
            let mut inner = self.lock();
            inner
                .contacts
                .remove(address)
                .ok_or_else(|| Error::Validation(format!("no contact {}", address)))?
        };
        let snapshot = contact.snapshot();
        contact.shutdown().await;
        contact.remove_from_config();
        self.deps.events.publish(Event::Contact {
            kind: ContactEventKind::Delete,
            contact: snapshot,
        });
        info!(%address, "contact deleted");
        Ok(())
    }

    /// Look up a contact by address.
    pub fn get(&self, address: &OnionAddress) -> Option<Arc<Contact>> {
        self.lock().contacts.get(address).cloned()
    }

    /// Look up a contact by the 16-character label a session authenticated
    /// with. Labels and bare addresses are the same strings.
    pub fn get_by_label(&self, label: &OnionAddress) -> Option<Arc<Contact>> {
        self.get(label)
    }

    /// All known contacts.
    pub fn contacts(&self) -> Vec<Arc<Contact>> {
        self.lock().contacts.values().cloned().collect()
    }

    /// Inbound requests awaiting a user decision.
    pub fn pending_requests(&self) -> Vec<IncomingRequestInfo> {
        self.lock()
            .requests
            .iter()
            .filter(|(_, r)| !r.rejected)
            .map(|(address, r)| IncomingRequestInfo {
                address: address.clone(),
                nickname: r.nickname.clone(),
                message: r.message.clone(),
                when_created: r.when_created,
            })
            .collect()
    }

    /// Whether `label` belongs to a non-rejected contact. This is the
    /// `isKnownContact` verdict sent in authentication results.
    pub(crate) fn is_known_non_rejected(&self, label: &OnionAddress) -> bool {
        self.get(label)
            .map(|c| c.status() != ContactStatus::Rejected)
            .unwrap_or(false)
    }

    /// Record an inbound contact request and decide its routing.
    ///
    /// An address the user already accepted resolves immediately; a
    /// previously rejected address (or rejected contact) stays rejected;
    /// anything else is held pending, replacing the decision channel of
    /// any earlier session for the same address.
    pub(crate) fn register_inbound_request(
        &self,
        address: &OnionAddress,
        nickname: &str,
        message: &str,
    ) -> RequestRouting {
        let (routing, announce) = {
            let mut inner = self.lock();
            if let Some(contact) = inner.contacts.get(address) {
                if contact.status() == ContactStatus::Rejected {
                    return RequestRouting::Rejected;
                }
                return RequestRouting::AcceptExisting(contact.clone());
            }
            match inner.requests.get_mut(address) {
                Some(existing) if existing.rejected => (RequestRouting::Rejected, None),
                Some(existing) => {
                    existing.nickname = nickname.to_owned();
                    existing.message = message.to_owned();
                    let (tx, rx) = oneshot::channel();
                    // A newer session supersedes the old decision channel.
                    existing.decision_tx = Some(tx);
                    (RequestRouting::Pending(rx), None)
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    let request = PendingRequest {
                        nickname: nickname.to_owned(),
                        message: message.to_owned(),
                        when_created: Utc::now(),
                        rejected: false,
                        decision_tx: Some(tx),
                    };
                    let announce = IncomingRequestInfo {
                        address: address.clone(),
                        nickname: request.nickname.clone(),
                        message: request.message.clone(),
                        when_created: request.when_created,
                    };
                    inner.requests.insert(address.clone(), request);
                    (RequestRouting::Pending(rx), Some(announce))
                }
            }
        };
        if let Some(request) = announce {
            info!(address = %request.address, "inbound contact request received");
            self.deps.events.publish(Event::InboundRequest { request });
        }
        routing
    }

    /// Accept a pending inbound request: creates the contact and resolves
    /// the waiting session, if one is still connected.
    pub async fn accept_inbound_request(
        &self,
        address: &OnionAddress,
        nickname: &str,
    ) -> Result<Arc<Contact>> {
        if !nickname.is_empty() && !is_nickname_acceptable(nickname) {
            return Err(Error::Validation("nickname is unacceptable".into()));
        }
        let decision_tx = {
            let mut inner = self.lock();
            let request = inner
                .requests
                .remove(address)
                .ok_or_else(|| Error::Validation(format!("no pending request from {}", address)))?;
            if request.rejected {
                inner.requests.insert(address.clone(), request);
                return Err(Error::Validation("request was already rejected".into()));
            }
            request.decision_tx
        };
        let contact = self.insert_new_contact(address.clone(), nickname, ContactStatus::Unknown, None)?;
        contact.persist();
        contact.publish(ContactEventKind::Add);
        contact.start().await;
        if let Some(tx) = decision_tx {
            let _ = tx.send(RequestDecision::Accept(contact.clone()));
        }
        info!(%address, "inbound contact request accepted");
        Ok(contact)
    }

    /// Reject a pending inbound request. The address stays rejected:
    /// later requests from it are refused without user interaction.
    pub async fn reject_inbound_request(&self, address: &OnionAddress) -> Result<()> {
        let decision_tx = {
            let mut inner = self.lock();
            let request = inner
                .requests
                .get_mut(address)
                .ok_or_else(|| Error::Validation(format!("no pending request from {}", address)))?;
            request.rejected = true;
            request.decision_tx.take()
        };
        if let Some(tx) = decision_tx {
            let _ = tx.send(RequestDecision::Reject);
        }
        info!(%address, "inbound contact request rejected");
        Ok(())
    }

    /// Stop every contact's agent. Used at shutdown.
    pub(crate) async fn shutdown(&self) {
        for contact in self.contacts() {
            contact.shutdown().await;
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}
