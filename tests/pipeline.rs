//! End-to-end tests driving several users through a shared in-memory swarm.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use session_pipeline::{
    encrypt_blinded, encrypt_session, ConfigContact, ConfigurationMessage, ContactStore,
    Destination, Envelope, EnvelopeType, GroupEvent, GroupKeyPair, GroupMembership, GroupStore,
    InMemoryBlocklist, InMemoryContactStore, InMemoryGroupEventSink, InMemoryGroupStore,
    InMemoryMessageStore, InMemorySwarm, Message, MessageKind, Messenger, PipelineConfig,
    ReceiveContext, ReceiveError, ReceiveSource, SendError, Services, UserKeys, VisibleMessage,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Separate consecutive actions by different users in time; the dedup
/// ledger is keyed by millisecond timestamps.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

struct User {
    messenger: Messenger,
    groups: Arc<InMemoryGroupStore>,
    contacts: Arc<InMemoryContactStore>,
    blocklist: Arc<InMemoryBlocklist>,
    messages: Arc<InMemoryMessageStore>,
    events: Arc<InMemoryGroupEventSink>,
    cursors: HashMap<String, usize>,
}

fn user(seed: u8, swarm: &Arc<InMemorySwarm>) -> User {
    let groups = Arc::new(InMemoryGroupStore::new());
    let contacts = Arc::new(InMemoryContactStore::new());
    let blocklist = Arc::new(InMemoryBlocklist::new());
    let messages = Arc::new(InMemoryMessageStore::new());
    let events = Arc::new(InMemoryGroupEventSink::new());

    let mut config = PipelineConfig::default();
    config.sender.pow_nonce_trials = 0;

    let services = Services {
        blocklist: blocklist.clone(),
        contacts: contacts.clone(),
        groups: groups.clone(),
        messages: messages.clone(),
        events: events.clone(),
        ..Services::in_memory(swarm.clone())
    };

    User {
        messenger: Messenger::from_seed(&[seed; 32], config, services).unwrap(),
        groups,
        contacts,
        blocklist,
        messages,
        events,
        cursors: HashMap::new(),
    }
}

impl User {
    fn id(&self) -> String {
        self.messenger.session_id()
    }

    /// Receive everything stored for `recipient` since the last poll.
    async fn poll(
        &mut self,
        swarm: &InMemorySwarm,
        recipient: &str,
    ) -> Vec<Result<Message, ReceiveError>> {
        let stored = swarm.fetch(recipient).await;
        let seen = self.cursors.entry(recipient.to_string()).or_default();
        let fresh = stored[*seen..].to_vec();
        *seen = stored.len();

        let mut results = Vec::new();
        for message in fresh {
            let data = STANDARD.decode(&message.data).unwrap();
            results.push(
                self.messenger
                    .receive(&data, &ReceiveContext::default())
                    .await,
            );
        }
        results
    }
}

fn contact(public_key: &str) -> Destination {
    Destination::Contact {
        public_key: public_key.to_string(),
    }
}

fn closed_group(group: &str) -> Destination {
    Destination::ClosedGroup {
        group_public_key: group.to_string(),
    }
}

fn text_of(message: &Message) -> Option<&str> {
    match &message.kind {
        MessageKind::Visible(visible) => visible.text.as_deref(),
        _ => None,
    }
}

/// Alice creates a group with `others`; every invitee accepts.
async fn group_with(swarm: &Arc<InMemorySwarm>, alice: &User, others: &mut [&mut User]) -> String {
    for other in others.iter() {
        other.contacts.set_approved(&alice.id(), true).await.unwrap();
    }
    let members = others.iter().map(|u| u.id());
    let group = alice.messenger.create_closed_group("Friends", members).await.unwrap();
    for other in others.iter_mut() {
        let id = other.id();
        for result in other.poll(swarm, &id).await {
            result.unwrap();
        }
    }
    tick().await;
    group
}

#[tokio::test]
async fn test_direct_message_round_trip() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(3));
    let mut alice = user(1, &swarm);
    let mut bob = user(2, &swarm);
    let (alice_id, bob_id) = (alice.id(), bob.id());

    alice
        .messenger
        .send_text("hello bob", &contact(&bob_id))
        .await
        .unwrap();

    let results = bob.poll(&swarm, &bob_id).await;
    assert_eq!(results.len(), 1);
    let message = results[0].as_ref().unwrap();
    assert_eq!(message.sender.as_deref(), Some(alice_id.as_str()));
    assert_eq!(text_of(message), Some("hello bob"));
    assert_eq!(bob.messages.messages().await.len(), 1);

    // The sync copy in our own swarm was already handled when sending.
    let own = alice.poll(&swarm, &alice_id).await;
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].as_ref().unwrap_err(), &ReceiveError::DuplicateMessage);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redelivery_is_delivered_once() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let bob = Arc::new(user(2, &swarm));
    let bob_id = bob.id();

    for i in 0..100 {
        alice
            .messenger
            .send_text(&format!("message {i}"), &contact(&bob_id))
            .await
            .unwrap();
    }

    for stored in swarm.fetch(&bob_id).await {
        let data = STANDARD.decode(&stored.data).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let bob = Arc::clone(&bob);
                let data = data.clone();
                tokio::spawn(async move {
                    bob.messenger
                        .receive(&data, &ReceiveContext::default())
                        .await
                })
            })
            .collect();

        let mut delivered = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => delivered += 1,
                Err(e) => assert_eq!(e, ReceiveError::DuplicateMessage),
            }
        }
        assert_eq!(delivered, 1);
    }
    assert_eq!(bob.messages.messages().await.len(), 100);
}

#[tokio::test]
async fn test_redelivery_is_rejected_unless_retried() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let bob = user(2, &swarm);

    alice
        .messenger
        .send_text("once", &contact(&bob.id()))
        .await
        .unwrap();
    let stored = swarm.fetch(&bob.id()).await;
    let data = STANDARD.decode(&stored[0].data).unwrap();

    bob.messenger
        .receive(&data, &ReceiveContext::default())
        .await
        .unwrap();
    let again = bob
        .messenger
        .receive(&data, &ReceiveContext::default())
        .await
        .unwrap_err();
    assert_eq!(again, ReceiveError::DuplicateMessage);
    assert!(!again.is_retryable());

    bob.messenger
        .receive(&data, &ReceiveContext::retry())
        .await
        .unwrap();
    assert_eq!(bob.messages.messages().await.len(), 1);
}

#[tokio::test]
async fn test_new_group_message_tolerates_redelivery() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let bob = user(2, &swarm);
    bob.contacts.set_approved(&alice.id(), true).await.unwrap();

    let group = alice
        .messenger
        .create_closed_group("Friends", [bob.id()])
        .await
        .unwrap();
    let stored = swarm.fetch(&bob.id()).await;
    assert_eq!(stored.len(), 1);
    let data = STANDARD.decode(&stored[0].data).unwrap();

    for _ in 0..2 {
        let message = bob
            .messenger
            .receive(&data, &ReceiveContext::default())
            .await
            .unwrap();
        assert!(message.is_new_closed_group());
    }

    assert_eq!(bob.groups.key_history(&group).await.unwrap().len(), 1);
    assert_eq!(
        bob.events.events().await,
        vec![GroupEvent::Created {
            group: group.clone(),
            name: "Friends".into()
        }]
    );
}

#[tokio::test]
async fn test_group_message_decrypts_with_older_key() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let mut bob = user(2, &swarm);

    let keys: Vec<GroupKeyPair> = (0..3).map(|_| GroupKeyPair::generate()).collect();
    let group = GroupKeyPair::generate().identity();
    for u in [&alice, &bob] {
        let membership = GroupMembership::new(
            group.clone(),
            "Friends",
            [alice.id(), bob.id()],
            vec![alice.id()],
            1,
        );
        u.groups.set_membership(membership).await.unwrap();
    }
    alice.groups.append_key(&group, keys[0].clone()).await.unwrap();
    for key_pair in &keys {
        bob.groups.append_key(&group, key_pair.clone()).await.unwrap();
    }

    alice
        .messenger
        .send_text("old key", &closed_group(&group))
        .await
        .unwrap();

    let results = bob.poll(&swarm, &group).await;
    let message = results[0].as_ref().unwrap();
    assert_eq!(text_of(message), Some("old key"));
    assert_eq!(message.group_public_key.as_deref(), Some(group.as_str()));
}

#[tokio::test]
async fn test_missing_group_key_is_retryable() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let bob = user(2, &swarm);

    let key_pair = GroupKeyPair::generate();
    let group = GroupKeyPair::generate().identity();
    for u in [&alice, &bob] {
        let membership = GroupMembership::new(
            group.clone(),
            "Friends",
            [alice.id(), bob.id()],
            vec![alice.id()],
            1,
        );
        u.groups.set_membership(membership).await.unwrap();
    }
    alice.groups.append_key(&group, key_pair.clone()).await.unwrap();

    alice
        .messenger
        .send_text("too early", &closed_group(&group))
        .await
        .unwrap();
    let data = STANDARD.decode(&swarm.fetch(&group).await[0].data).unwrap();

    let error = bob
        .messenger
        .receive(&data, &ReceiveContext::default())
        .await
        .unwrap_err();
    assert_eq!(error, ReceiveError::NoGroupKeyPair);
    assert!(error.is_retryable());

    bob.groups.append_key(&group, key_pair).await.unwrap();
    let message = bob
        .messenger
        .receive(&data, &ReceiveContext::retry())
        .await
        .unwrap();
    assert_eq!(text_of(&message), Some("too early"));
}

#[tokio::test]
async fn test_removal_rotates_key_for_remaining_members() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(3));
    let alice = user(1, &swarm);
    let mut bob = user(2, &swarm);
    let mut carol = user(3, &swarm);
    let group = group_with(&swarm, &alice, &mut [&mut bob, &mut carol]).await;

    let remaining = BTreeSet::from([alice.id(), bob.id()]);
    alice
        .messenger
        .update_closed_group(&group, remaining.clone(), "Friends")
        .await
        .unwrap();
    assert_eq!(alice.groups.key_history(&group).await.unwrap().len(), 2);

    for result in bob.poll(&swarm, &group).await {
        result.unwrap();
    }
    let bob_membership = bob.groups.membership(&group).await.unwrap().unwrap();
    assert_eq!(bob_membership.members, remaining);
    assert_eq!(
        bob.groups.latest_key(&group).await.unwrap(),
        alice.groups.latest_key(&group).await.unwrap()
    );

    let carol_results = carol.poll(&swarm, &group).await;
    assert!(carol_results[0].is_ok());
    assert_eq!(
        carol_results[1].as_ref().unwrap_err(),
        &ReceiveError::NoGroupKeyPair
    );
    assert!(carol
        .events
        .events()
        .await
        .contains(&GroupEvent::Removed { group: group.clone() }));

    tick().await;
    alice
        .messenger
        .send_text("without carol", &closed_group(&group))
        .await
        .unwrap();
    let results = bob.poll(&swarm, &group).await;
    assert_eq!(text_of(results[0].as_ref().unwrap()), Some("without carol"));
    let results = carol.poll(&swarm, &group).await;
    assert_eq!(results[0].as_ref().unwrap_err(), &ReceiveError::NoGroupKeyPair);
}

#[tokio::test]
async fn test_member_left_becomes_zombie_until_removed() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let mut alice = user(1, &swarm);
    let mut bob = user(2, &swarm);
    let group = group_with(&swarm, &alice, &mut [&mut bob]).await;
    let (alice_id, bob_id) = (alice.id(), bob.id());

    bob.messenger.leave_closed_group(&group).await.unwrap();
    assert!(bob.groups.key_history(&group).await.unwrap().is_empty());

    for result in alice.poll(&swarm, &group).await {
        result.unwrap();
    }
    let membership = alice.groups.membership(&group).await.unwrap().unwrap();
    assert_eq!(membership.members, BTreeSet::from([alice_id.clone(), bob_id.clone()]));
    assert_eq!(membership.zombies, BTreeSet::from([bob_id.clone()]));

    tick().await;
    alice
        .messenger
        .update_closed_group(&group, BTreeSet::from([alice_id.clone()]), "Friends")
        .await
        .unwrap();

    let membership = alice.groups.membership(&group).await.unwrap().unwrap();
    assert_eq!(membership.members, BTreeSet::from([alice_id]));
    assert!(membership.zombies.is_empty());
}

#[tokio::test]
async fn test_admin_leaving_disbands_group() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let mut bob = user(2, &swarm);
    let group = group_with(&swarm, &alice, &mut [&mut bob]).await;

    alice.messenger.leave_closed_group(&group).await.unwrap();

    for result in bob.poll(&swarm, &group).await {
        result.unwrap();
    }
    let membership = bob.groups.membership(&group).await.unwrap().unwrap();
    assert!(!membership.is_active());
    assert!(bob.groups.key_history(&group).await.unwrap().is_empty());
    assert!(bob
        .events
        .events()
        .await
        .contains(&GroupEvent::Disbanded { group }));
}

#[tokio::test]
async fn test_member_added_during_rotation_gets_latest_key() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let mut alice = user(1, &swarm);
    let mut bob = user(2, &swarm);
    let mut carol = user(3, &swarm);
    let group = group_with(&swarm, &alice, &mut [&mut bob]).await;
    let (alice_id, bob_id, carol_id) = (alice.id(), bob.id(), carol.id());
    carol.contacts.set_approved(&alice_id, true).await.unwrap();

    // Bob, who is not an admin, adds Carol with the key he knows.
    bob.messenger
        .update_closed_group(
            &group,
            BTreeSet::from([alice_id.clone(), bob_id.clone(), carol_id.clone()]),
            "Friends",
        )
        .await
        .unwrap();
    tick().await;

    // Meanwhile Alice rotates without knowing about Carol.
    let rotated = alice
        .messenger
        .sender()
        .rotate_and_distribute(&group, &[alice_id.clone(), bob_id.clone()])
        .await
        .unwrap();
    tick().await;

    let results = alice.poll(&swarm, &group).await;
    assert!(results
        .iter()
        .any(|r| matches!(r, Ok(m) if matches!(m.kind, MessageKind::ClosedGroupControl(_)))));
    tick().await;

    for result in carol.poll(&swarm, &carol_id).await {
        result.unwrap();
    }
    assert_eq!(carol.groups.latest_key(&group).await.unwrap(), Some(rotated));

    alice
        .messenger
        .send_text("welcome carol", &closed_group(&group))
        .await
        .unwrap();
    let results = carol.poll(&swarm, &group).await;
    let last = results.last().unwrap().as_ref().unwrap();
    assert_eq!(text_of(last), Some("welcome carol"));
}

#[tokio::test]
async fn test_send_needs_only_one_node() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(3));
    let alice = user(1, &swarm);
    let mut bob = user(2, &swarm);
    let bob_id = bob.id();

    swarm.fail_node(&swarm.nodes()[0].clone()).await;
    swarm.fail_node(&swarm.nodes()[1].clone()).await;
    alice
        .messenger
        .send_text("one node is enough", &contact(&bob_id))
        .await
        .unwrap();
    assert!(bob.poll(&swarm, &bob_id).await[0].is_ok());

    swarm.fail_all().await;
    let error = alice
        .messenger
        .send_text("nobody home", &contact(&bob_id))
        .await
        .unwrap_err();
    assert!(matches!(error, SendError::Transport(_)));
}

#[tokio::test]
async fn test_blocked_sender_is_rejected() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let mut bob = user(2, &swarm);
    let bob_id = bob.id();
    bob.blocklist.block(&alice.id()).await;

    alice
        .messenger
        .send_text("let me in", &contact(&bob_id))
        .await
        .unwrap();

    let results = bob.poll(&swarm, &bob_id).await;
    let error = results[0].as_ref().unwrap_err();
    assert_eq!(error, &ReceiveError::SenderBlocked);
    assert!(!error.is_retryable());
    assert!(bob.messages.messages().await.is_empty());
}

#[tokio::test]
async fn test_configuration_syncs_to_linked_device() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let mut alice_linked = user(1, &swarm);
    let bob = user(2, &swarm);
    let alice_id = alice.id();

    let configuration = Message::new(MessageKind::Configuration(ConfigurationMessage {
        contacts: vec![ConfigContact {
            public_key: bob.id(),
            name: Some("Bob".into()),
            is_approved: true,
            is_blocked: false,
        }],
        ..Default::default()
    }));
    alice
        .messenger
        .send(configuration, &contact(&alice_id))
        .await
        .unwrap();

    for result in alice_linked.poll(&swarm, &alice_id).await {
        result.unwrap();
    }
    assert!(alice_linked.contacts.is_approved(&bob.id()).await.unwrap());
}

#[tokio::test]
async fn test_self_sent_receipt_is_rejected() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let keys = UserKeys::from_seed(&[1; 32]).unwrap();

    let receipt = Message::new(MessageKind::ReadReceipt {
        timestamps: vec![1],
    });
    let plaintext = receipt.to_content().to_padded_bytes().unwrap();
    let ciphertext =
        encrypt_session(&plaintext, keys.x25519_public_key().as_bytes(), &keys).unwrap();
    let envelope = Envelope {
        envelope_type: EnvelopeType::SessionMessage,
        source: String::new(),
        content: ciphertext,
        timestamp: 42,
        server_timestamp: None,
        server_message_id: None,
    };

    let error = alice
        .messenger
        .receive(&envelope.encode().unwrap(), &ReceiveContext::default())
        .await
        .unwrap_err();
    assert_eq!(error, ReceiveError::SelfSend);
}

#[tokio::test]
async fn test_open_group_accepts_only_visible_messages() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let bob = user(2, &swarm);
    let context = ReceiveContext {
        is_retry: false,
        source: ReceiveSource::OpenGroup {
            server: "https://rooms.example".into(),
            room: "lobby".into(),
        },
    };

    let room_envelope = |message: Message, timestamp: u64| Envelope {
        envelope_type: EnvelopeType::SessionMessage,
        source: alice.id(),
        content: message.to_content().to_padded_bytes().unwrap(),
        timestamp,
        server_timestamp: Some(timestamp),
        server_message_id: Some(7),
    };

    let visible = Message::new(MessageKind::Visible(VisibleMessage::text("hi room")));
    let message = bob
        .messenger
        .receive(&room_envelope(visible, 10).encode().unwrap(), &context)
        .await
        .unwrap();
    assert_eq!(message.recipient.as_deref(), Some("lobby"));
    assert_eq!(message.open_group_server_message_id, Some(7));

    let receipt = Message::new(MessageKind::ReadReceipt {
        timestamps: vec![1],
    });
    let error = bob
        .messenger
        .receive(&room_envelope(receipt, 11).encode().unwrap(), &context)
        .await
        .unwrap_err();
    assert_eq!(error, ReceiveError::InvalidMessage);
}

#[tokio::test]
async fn test_blinded_inbox_message() {
    init_tracing();
    let swarm = Arc::new(InMemorySwarm::new(1));
    let alice = user(1, &swarm);
    let bob = user(2, &swarm);
    let alice_keys = UserKeys::from_seed(&[1; 32]).unwrap();
    let server_public_key = [9u8; 32];

    let visible = Message::new(MessageKind::Visible(VisibleMessage::text("psst")));
    let plaintext = visible.to_content().to_padded_bytes().unwrap();
    let ciphertext = encrypt_blinded(
        &plaintext,
        &bob.messenger.blinded_id(&server_public_key),
        &server_public_key,
        &alice_keys,
    )
    .unwrap();
    let envelope = Envelope {
        envelope_type: EnvelopeType::SessionMessage,
        source: alice.messenger.blinded_id(&server_public_key),
        content: ciphertext,
        timestamp: 99,
        server_timestamp: None,
        server_message_id: Some(3),
    };
    let context = ReceiveContext {
        is_retry: false,
        source: ReceiveSource::OpenGroupInbox {
            server_public_key,
            other_blinded_id: alice.messenger.blinded_id(&server_public_key),
            is_outgoing: false,
        },
    };

    let message = bob
        .messenger
        .receive(&envelope.encode().unwrap(), &context)
        .await
        .unwrap();
    assert_eq!(message.sender.as_deref(), Some(alice.id().as_str()));
    assert_eq!(text_of(&message), Some("psst"));
}
