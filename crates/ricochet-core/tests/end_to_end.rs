//! End-to-end scenarios over loopback TCP.
//!
//! Two full clients talk through the resolver's local-override table
//! instead of a Tor daemon: contact request handshakes, simultaneous
//! dialing, chat delivery with acks and read hints.

use ricochet_core::client::Client;
use ricochet_core::config::ConfigStore;
use ricochet_core::contacts::ContactStatus;
use ricochet_core::events::{ContactEventKind, Event};
use ricochet_core::messaging::MessageStatus;
use ricochet_core::tor::Resolver;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const DEADLINE: Duration = Duration::from_secs(20);

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

async fn new_client() -> (Arc<Client>, Resolver) {
    init_tracing();
    let resolver = Resolver::default();
    let client = Client::open(ConfigStore::in_memory(), resolver.clone())
        .await
        .expect("open client");
    client
        .listen("127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("listen");
    (client, resolver)
}

fn link(from: &Resolver, to: &Arc<Client>) {
    let addr = to.local_addr().expect("listening");
    from.set_local_override(to.address().as_str(), addr);
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn contact_request_accept_then_chat_round_trip() {
    let (alice, alice_resolver) = new_client().await;
    let (bob, _bob_resolver) = new_client().await;
    // Alice can reach bob; bob only answers.
    link(&alice_resolver, &bob);

    let mut bob_events = bob.subscribe();

    let alice_contact = alice
        .contacts()
        .add_outbound_request(bob.address().as_str(), "bob", "alice", "hi, it's alice")
        .await
        .expect("outbound request");
    assert_eq!(alice_contact.status(), ContactStatus::Request);

    // Bob learns about the request.
    let request = timeout(DEADLINE, async {
        loop {
            if let Ok(Event::InboundRequest { request }) = bob_events.recv().await {
                return request;
            }
        }
    })
    .await
    .expect("request event");
    assert_eq!(&request.address, alice.address());
    assert_eq!(request.nickname, "alice");
    assert_eq!(request.message, "hi, it's alice");

    // Bob accepts; both sides converge on ONLINE.
    let bob_contact = bob
        .contacts()
        .accept_inbound_request(alice.address(), "alice")
        .await
        .expect("accept");
    {
        let alice_contact = alice_contact.clone();
        wait_for(move || alice_contact.status() == ContactStatus::Online, "alice online").await;
    }
    {
        let bob_contact = bob_contact.clone();
        wait_for(move || bob_contact.status() == ContactStatus::Online, "bob online").await;
    }
    assert!(!alice_contact.is_request_pending());

    // Round trip: the text and identifier survive delivery.
    let sent_id = alice_contact
        .conversation()
        .await
        .send("hello bob")
        .await
        .expect("send");

    timeout(DEADLINE, async {
        loop {
            let conv = bob_contact.conversation().await;
            if let Some(msg) = conv.messages().first() {
                assert_eq!(msg.text, "hello bob");
                assert_eq!(msg.identifier, sent_id);
                assert_eq!(msg.status, MessageStatus::Unread);
                break;
            }
            drop(conv);
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bob receives");
    assert_eq!(bob_contact.conversation().await.unread_count(), 1);

    // The ack flows back as DELIVERED.
    timeout(DEADLINE, async {
        loop {
            if alice_contact.conversation().await.messages()[0].status == MessageStatus::Delivered {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("delivered");

    // Bob marks the conversation read; the hint reaches alice.
    bob_contact.conversation().await.mark_as_read().await;
    assert_eq!(bob_contact.conversation().await.unread_count(), 0);
    assert_eq!(bob_contact.conversation().await.last_read_identifier(), Some(sent_id));
    timeout(DEADLINE, async {
        loop {
            if alice_contact.conversation().await.messages()[0].status == MessageStatus::Read {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("read hint");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn mutual_contacts_come_online_once_and_chat_flows() {
    let (alice, alice_resolver) = new_client().await;
    let (bob, _bob_resolver) = new_client().await;

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    // Bob trusts alice but cannot reach her yet; his dials back off.
    let bob_contact = bob
        .contacts()
        .add_contact(alice.address().as_str(), "alice")
        .await
        .expect("add alice");

    // Alice can reach bob and both sides adopt her session.
    link(&alice_resolver, &bob);
    let alice_contact = alice
        .contacts()
        .add_contact(bob.address().as_str(), "bob")
        .await
        .expect("add bob");

    {
        let alice_contact = alice_contact.clone();
        wait_for(move || alice_contact.status() == ContactStatus::Online, "alice online").await;
    }
    {
        let bob_contact = bob_contact.clone();
        wait_for(move || bob_contact.status() == ContactStatus::Online, "bob online").await;
    }

    sleep(Duration::from_millis(300)).await;
    assert_eq!(alice_contact.status(), ContactStatus::Online);
    assert_eq!(bob_contact.status(), ContactStatus::Online);

    // Each side went ONLINE exactly once: session replacement never dips
    // through OFFLINE.
    let count_online_transitions = |events: &mut tokio::sync::broadcast::Receiver<Event>| {
        let mut transitions = 0;
        let mut online = false;
        while let Ok(event) = events.try_recv() {
            if let Event::Contact { kind: ContactEventKind::Update, contact } = event {
                let now_online = contact.status == ContactStatus::Online;
                if now_online && !online {
                    transitions += 1;
                }
                online = now_online;
            }
        }
        transitions
    };
    assert_eq!(count_online_transitions(&mut alice_events), 1);
    assert_eq!(count_online_transitions(&mut bob_events), 1);

    // Chat still flows over whichever session survived.
    let id = alice_contact
        .conversation()
        .await
        .send("after the duel")
        .await
        .expect("send");
    timeout(DEADLINE, async {
        loop {
            let conv = bob_contact.conversation().await;
            if conv.messages().iter().any(|m| m.identifier == id && m.text == "after the duel") {
                break;
            }
            drop(conv);
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bob receives");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn rejected_request_halts_outbound_attempts() {
    let (alice, alice_resolver) = new_client().await;
    let (bob, _bob_resolver) = new_client().await;
    link(&alice_resolver, &bob);

    let mut bob_events = bob.subscribe();

    let alice_contact = alice
        .contacts()
        .add_outbound_request(bob.address().as_str(), "bob", "alice", "let me in")
        .await
        .expect("outbound request");

    timeout(DEADLINE, async {
        loop {
            if let Ok(Event::InboundRequest { .. }) = bob_events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("request event");

    bob.contacts()
        .reject_inbound_request(alice.address())
        .await
        .expect("reject");

    // Alice's side records the rejection and stops dialing.
    {
        let alice_contact = alice_contact.clone();
        wait_for(move || alice_contact.status() == ContactStatus::Rejected, "rejected").await;
    }
    let snapshot = alice_contact.snapshot();
    let request = snapshot.request.expect("request state kept");
    assert!(request.is_rejected());

    // Bob never made a contact out of it, and the rejection is sticky.
    assert!(bob.contacts().get(alice.address()).is_none());
    assert!(bob.contacts().pending_requests().is_empty());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn identity_persists_across_restarts() {
    let resolver = Resolver::default();
    let config = ConfigStore::in_memory();
    let first = Client::open(config.clone(), resolver.clone()).await.expect("open");
    let address = first.address().clone();
    first.shutdown().await;

    let second = Client::open(config, resolver).await.expect("reopen");
    assert_eq!(second.address(), &address);
    second.shutdown().await;
}
