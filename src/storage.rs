//! Storage collaborators consumed by the pipeline, with in-memory
//! implementations.
//!
//! The pipeline never owns persistent state directly; everything it reads or
//! mutates goes through these traits so that a host application can back
//! them with its own database.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::groups::{GroupEvent, GroupKeyPair, GroupMembership};
use crate::message::Message;
use crate::transport::{OpenGroupTransport, SnodeTransport};
use crate::types::StorageResult;

// ============================================================================
// Dedup Ledger
// ============================================================================

/// Append-only set of processed envelope timestamps.
#[async_trait::async_trait]
pub trait DedupLedger: Send + Sync {
    async fn contains(&self, timestamp: u64) -> StorageResult<bool>;

    /// Record `timestamp`, returning `false` if it was already present.
    ///
    /// The check and the write must be atomic: two concurrent inserts of the
    /// same timestamp see exactly one `true`.
    async fn insert(&self, timestamp: u64) -> StorageResult<bool>;

    async fn add(&self, timestamp: u64) -> StorageResult<()> {
        self.insert(timestamp).await.map(|_| ())
    }
}

#[derive(Default)]
pub struct InMemoryDedupLedger {
    timestamps: Arc<RwLock<HashSet<u64>>>,
}

impl InMemoryDedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.timestamps.read().await.len()
    }
}

#[async_trait::async_trait]
impl DedupLedger for InMemoryDedupLedger {
    async fn contains(&self, timestamp: u64) -> StorageResult<bool> {
        Ok(self.timestamps.read().await.contains(&timestamp))
    }

    async fn insert(&self, timestamp: u64) -> StorageResult<bool> {
        Ok(self.timestamps.write().await.insert(timestamp))
    }
}

// ============================================================================
// Contacts
// ============================================================================

/// Predicate over identities the local user has blocked.
#[async_trait::async_trait]
pub trait Blocklist: Send + Sync {
    async fn is_blocked(&self, identity: &str) -> StorageResult<bool>;
}

#[derive(Default)]
pub struct InMemoryBlocklist {
    blocked: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryBlocklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn block(&self, identity: &str) {
        self.blocked.write().await.insert(identity.to_string());
    }

    pub async fn unblock(&self, identity: &str) {
        self.blocked.write().await.remove(identity);
    }
}

#[async_trait::async_trait]
impl Blocklist for InMemoryBlocklist {
    async fn is_blocked(&self, identity: &str) -> StorageResult<bool> {
        Ok(self.blocked.read().await.contains(identity))
    }
}

/// Contact approval state.
///
/// A new closed group is only accepted when one of its admins is an
/// approved contact.
#[async_trait::async_trait]
pub trait ContactStore: Send + Sync {
    async fn is_approved(&self, identity: &str) -> StorageResult<bool>;

    async fn set_approved(&self, identity: &str, approved: bool) -> StorageResult<()>;
}

#[derive(Default)]
pub struct InMemoryContactStore {
    approved: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ContactStore for InMemoryContactStore {
    async fn is_approved(&self, identity: &str) -> StorageResult<bool> {
        Ok(self.approved.read().await.contains(identity))
    }

    async fn set_approved(&self, identity: &str, approved: bool) -> StorageResult<()> {
        let mut contacts = self.approved.write().await;
        if approved {
            contacts.insert(identity.to_string());
        } else {
            contacts.remove(identity);
        }
        Ok(())
    }
}

// ============================================================================
// Closed Groups
// ============================================================================

/// Closed-group key history and membership.
///
/// Key history is ordered oldest to newest. Keys are only ever appended;
/// [`GroupStore::purge_group`] drops the whole history at once.
#[async_trait::async_trait]
pub trait GroupStore: Send + Sync {
    async fn key_history(&self, group: &str) -> StorageResult<Vec<GroupKeyPair>>;

    async fn append_key(&self, group: &str, key_pair: GroupKeyPair) -> StorageResult<()>;

    async fn latest_key(&self, group: &str) -> StorageResult<Option<GroupKeyPair>> {
        Ok(self.key_history(group).await?.pop())
    }

    async fn membership(&self, group: &str) -> StorageResult<Option<GroupMembership>>;

    async fn set_membership(&self, membership: GroupMembership) -> StorageResult<()>;

    /// Drop the key history and unregister the group.
    ///
    /// The membership record is kept so the group can still be displayed.
    async fn purge_group(&self, group: &str) -> StorageResult<()>;

    /// Groups the local user currently participates in.
    async fn group_public_keys(&self) -> StorageResult<Vec<String>>;
}

#[derive(Default)]
pub struct InMemoryGroupStore {
    keys: Arc<RwLock<HashMap<String, Vec<GroupKeyPair>>>>,
    memberships: Arc<RwLock<HashMap<String, GroupMembership>>>,
    registered: Arc<RwLock<BTreeSet<String>>>,
}

impl InMemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl GroupStore for InMemoryGroupStore {
    async fn key_history(&self, group: &str) -> StorageResult<Vec<GroupKeyPair>> {
        let keys = self.keys.read().await;
        Ok(keys.get(group).cloned().unwrap_or_default())
    }

    async fn append_key(&self, group: &str, key_pair: GroupKeyPair) -> StorageResult<()> {
        let mut keys = self.keys.write().await;
        keys.entry(group.to_string()).or_default().push(key_pair);
        Ok(())
    }

    async fn membership(&self, group: &str) -> StorageResult<Option<GroupMembership>> {
        let memberships = self.memberships.read().await;
        Ok(memberships.get(group).cloned())
    }

    async fn set_membership(&self, membership: GroupMembership) -> StorageResult<()> {
        let group = membership.group_public_key.clone();
        self.memberships
            .write()
            .await
            .insert(group.clone(), membership);
        self.registered.write().await.insert(group);
        Ok(())
    }

    async fn purge_group(&self, group: &str) -> StorageResult<()> {
        self.keys.write().await.remove(group);
        self.registered.write().await.remove(group);
        Ok(())
    }

    async fn group_public_keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.registered.read().await.iter().cloned().collect())
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Push-notification server client. All calls are best effort.
#[async_trait::async_trait]
pub trait PushNotifier: Send + Sync {
    async fn subscribe(&self, group: &str, identity: &str) -> StorageResult<()>;

    async fn unsubscribe(&self, group: &str, identity: &str) -> StorageResult<()>;

    /// Tell the server a message was stored for `recipient`.
    async fn notify(&self, recipient: &str, data: &str) -> StorageResult<()>;
}

/// A call observed by [`InMemoryPushNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushCall {
    Subscribe { group: String, identity: String },
    Unsubscribe { group: String, identity: String },
    Notify { recipient: String },
}

#[derive(Default)]
pub struct InMemoryPushNotifier {
    calls: Arc<RwLock<Vec<PushCall>>>,
}

impl InMemoryPushNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<PushCall> {
        self.calls.read().await.clone()
    }
}

#[async_trait::async_trait]
impl PushNotifier for InMemoryPushNotifier {
    async fn subscribe(&self, group: &str, identity: &str) -> StorageResult<()> {
        self.calls.write().await.push(PushCall::Subscribe {
            group: group.to_string(),
            identity: identity.to_string(),
        });
        Ok(())
    }

    async fn unsubscribe(&self, group: &str, identity: &str) -> StorageResult<()> {
        self.calls.write().await.push(PushCall::Unsubscribe {
            group: group.to_string(),
            identity: identity.to_string(),
        });
        Ok(())
    }

    async fn notify(&self, recipient: &str, _data: &str) -> StorageResult<()> {
        self.calls.write().await.push(PushCall::Notify {
            recipient: recipient.to_string(),
        });
        Ok(())
    }
}

/// Sink for handled messages (the "record and notify" step).
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn record(&self, message: &Message) -> StorageResult<()>;

    /// Delete a previously recorded message; returns whether one was found.
    async fn remove(&self, author: &str, sent_timestamp: u64) -> StorageResult<bool>;
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn record(&self, message: &Message) -> StorageResult<()> {
        let mut messages = self.messages.write().await;
        let already_recorded = messages.iter().any(|m| {
            m.sender == message.sender
                && m.sent_timestamp == message.sent_timestamp
                && m.kind.name() == message.kind.name()
        });
        if !already_recorded {
            messages.push(message.clone());
        }
        Ok(())
    }

    async fn remove(&self, author: &str, sent_timestamp: u64) -> StorageResult<bool> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| {
            !(m.sender.as_deref() == Some(author) && m.sent_timestamp == Some(sent_timestamp))
        });
        Ok(messages.len() != before)
    }
}

#[async_trait::async_trait]
pub trait GroupEventSink: Send + Sync {
    async fn emit(&self, event: GroupEvent);
}

#[derive(Default)]
pub struct InMemoryGroupEventSink {
    events: Arc<RwLock<Vec<GroupEvent>>>,
}

impl InMemoryGroupEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<GroupEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait::async_trait]
impl GroupEventSink for InMemoryGroupEventSink {
    async fn emit(&self, event: GroupEvent) {
        self.events.write().await.push(event);
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Registers closed groups for background polling.
#[async_trait::async_trait]
pub trait Poller: Send + Sync {
    async fn start_polling(&self, group: &str);

    async fn stop_polling(&self, group: &str);
}

#[derive(Default)]
pub struct InMemoryPoller {
    groups: Arc<RwLock<BTreeSet<String>>>,
}

impl InMemoryPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_polling(&self, group: &str) -> bool {
        self.groups.read().await.contains(group)
    }
}

#[async_trait::async_trait]
impl Poller for InMemoryPoller {
    async fn start_polling(&self, group: &str) {
        self.groups.write().await.insert(group.to_string());
    }

    async fn stop_polling(&self, group: &str) {
        self.groups.write().await.remove(group);
    }
}

// ============================================================================
// Collaborator bundle
// ============================================================================

/// Handles to every collaborator the receiver and sender talk to.
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<dyn DedupLedger>,
    pub blocklist: Arc<dyn Blocklist>,
    pub contacts: Arc<dyn ContactStore>,
    pub groups: Arc<dyn GroupStore>,
    pub push: Arc<dyn PushNotifier>,
    pub messages: Arc<dyn MessageStore>,
    pub events: Arc<dyn GroupEventSink>,
    pub poller: Arc<dyn Poller>,
    pub snodes: Arc<dyn SnodeTransport>,
    pub open_groups: Option<Arc<dyn OpenGroupTransport>>,
}

impl Services {
    /// Fresh in-memory stores around the given node transport.
    ///
    /// Override individual fields with struct update syntax when a caller
    /// needs to keep a handle on a concrete store.
    pub fn in_memory(snodes: Arc<dyn SnodeTransport>) -> Self {
        Self {
            ledger: Arc::new(InMemoryDedupLedger::new()),
            blocklist: Arc::new(InMemoryBlocklist::new()),
            contacts: Arc::new(InMemoryContactStore::new()),
            groups: Arc::new(InMemoryGroupStore::new()),
            push: Arc::new(InMemoryPushNotifier::new()),
            messages: Arc::new(InMemoryMessageStore::new()),
            events: Arc::new(InMemoryGroupEventSink::new()),
            poller: Arc::new(InMemoryPoller::new()),
            snodes,
            open_groups: None,
        }
    }
}
