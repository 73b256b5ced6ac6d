//! Distributed Tier
//!
//! A [`DistributedProvider`] stores opaque byte keys and values grouped by
//! namespace and publishes change notifications per namespace. Every cache
//! talks to it through a typed [`DistributedAdapter`], which owns the codec
//! (JSON), the namespace and the subscription.
//!
//! # Design
//!
//! - Writes carry the writing node's [`NodeId`]; notifications echo it back so
//!   an adapter can ignore changes it made itself
//! - The adapter is a no-op until a provider is attached, which lets a local
//!   cache switch to distributed mode while running
//! - [`InMemoryDistributedProvider`] shares one store between any number of
//!   in-process "nodes" and supports failure injection
//! - Last-access times travel in a companion namespace (see
//!   [`Namespace::timestamps`]) so a read on one node keeps the entry warm on
//!   every other node

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::entry::{CacheKey, CacheValue};
use crate::error::{Error, Result};
use crate::tenant::Tenant;

// =============================================================================
// Identifiers
// =============================================================================

/// Identity of one engine instance attached to a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random node id
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distributed namespace of one cache: `domain[id]/manager#cache`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(Arc<str>);

impl Namespace {
    /// Derive the namespace for (owner tenant, manager, cache)
    pub fn new(owner: &Tenant, manager: &str, cache: &str) -> Self {
        Self(format!("{}/{}#{}", owner, manager, cache).into())
    }

    /// Companion namespace carrying replicated last-access times
    pub fn timestamps(&self) -> Namespace {
        Self(format!("{}{}", TIMESTAMP_NAMESPACE_PREFIX, self.0).into())
    }

    /// Namespace as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Prefix of the namespaces holding replicated access times
pub const TIMESTAMP_NAMESPACE_PREFIX: &str = "$timestamp$";

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subscription handle returned by [`DistributedProvider::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

// =============================================================================
// Provider Interface
// =============================================================================

/// Kind of change reported by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// Raw change notification in provider encoding
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub kind: ChangeKind,
    pub key: Bytes,
    /// New value for Created/Updated, removed value for Removed
    pub value: Option<Bytes>,
    /// Previous value for Updated
    pub old_value: Option<Bytes>,
    /// Node that made the change
    pub origin: NodeId,
}

/// Subscriber callback
pub type NotificationHandler = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

/// Pluggable distributed store
#[async_trait]
pub trait DistributedProvider: Send + Sync {
    /// Get a value
    async fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Bytes>>;

    /// Put a value, returning the previous one
    async fn put(
        &self,
        namespace: &str,
        key: Bytes,
        value: Bytes,
        origin: NodeId,
    ) -> Result<Option<Bytes>>;

    /// Remove a value, returning it
    async fn remove(&self, namespace: &str, key: &[u8], origin: NodeId) -> Result<Option<Bytes>>;

    /// Check if a key exists
    async fn contains_key(&self, namespace: &str, key: &[u8]) -> Result<bool>;

    /// Remove every key in a namespace (one Removed notification per key)
    async fn clear(&self, namespace: &str, origin: NodeId) -> Result<()>;

    /// Subscribe to changes in a namespace
    fn subscribe(&self, namespace: &str, handler: NotificationHandler) -> SubscriptionId;

    /// Cancel a subscription; returns false if it was unknown
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

// =============================================================================
// In-Memory Provider
// =============================================================================

/// In-process provider shared by several engine instances
pub struct InMemoryDistributedProvider {
    /// namespace -> key -> value
    storage: DashMap<String, DashMap<Bytes, Bytes>>,
    /// namespace -> subscribers
    subscribers: DashMap<String, Vec<(SubscriptionId, NotificationHandler)>>,
    next_subscription: AtomicU64,
    available: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryDistributedProvider {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            available: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl InMemoryDistributedProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every data call fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of keys stored in a namespace
    pub fn len(&self, namespace: &str) -> usize {
        self.storage.get(namespace).map(|ns| ns.len()).unwrap_or(0)
    }

    /// Read/write/delete counters
    pub fn op_counts(&self) -> (u64, u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
        )
    }

    fn check_available(&self, namespace: &str) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::DistributedUnavailable {
                namespace: namespace.to_string(),
                reason: "provider unavailable".to_string(),
            })
        }
    }

    fn notify(&self, namespace: &str, notification: ChangeNotification) {
        // Clone handlers out so no DashMap guard is held during callbacks
        let handlers: Vec<NotificationHandler> = match self.subscribers.get(namespace) {
            Some(subs) => subs.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for handler in handlers {
            handler(&notification);
        }
    }
}

#[async_trait]
impl DistributedProvider for InMemoryDistributedProvider {
    async fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Bytes>> {
        self.check_available(namespace)?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .storage
            .get(namespace)
            .and_then(|ns| ns.get(key).map(|v| v.clone())))
    }

    async fn put(
        &self,
        namespace: &str,
        key: Bytes,
        value: Bytes,
        origin: NodeId,
    ) -> Result<Option<Bytes>> {
        self.check_available(namespace)?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let old = self
            .storage
            .entry(namespace.to_string())
            .or_default()
            .insert(key.clone(), value.clone());

        let kind = if old.is_some() {
            ChangeKind::Updated
        } else {
            ChangeKind::Created
        };
        self.notify(
            namespace,
            ChangeNotification {
                kind,
                key,
                value: Some(value),
                old_value: old.clone(),
                origin,
            },
        );
        Ok(old)
    }

    async fn remove(&self, namespace: &str, key: &[u8], origin: NodeId) -> Result<Option<Bytes>> {
        self.check_available(namespace)?;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        let removed = self
            .storage
            .get(namespace)
            .and_then(|ns| ns.remove(key));

        match removed {
            Some((key, value)) => {
                self.notify(
                    namespace,
                    ChangeNotification {
                        kind: ChangeKind::Removed,
                        key,
                        value: Some(value.clone()),
                        old_value: None,
                        origin,
                    },
                );
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn contains_key(&self, namespace: &str, key: &[u8]) -> Result<bool> {
        self.check_available(namespace)?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .storage
            .get(namespace)
            .map(|ns| ns.contains_key(key))
            .unwrap_or(false))
    }

    async fn clear(&self, namespace: &str, origin: NodeId) -> Result<()> {
        self.check_available(namespace)?;

        let removed = match self.storage.remove(namespace) {
            Some((_, ns)) => ns,
            None => return Ok(()),
        };
        self.deletes
            .fetch_add(removed.len() as u64, Ordering::Relaxed);

        for (key, value) in removed {
            self.notify(
                namespace,
                ChangeNotification {
                    kind: ChangeKind::Removed,
                    key,
                    value: Some(value),
                    old_value: None,
                    origin,
                },
            );
        }
        Ok(())
    }

    fn subscribe(&self, namespace: &str, handler: NotificationHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .entry(namespace.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut found = false;
        self.subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sid, _)| *sid != id);
            found |= subs.len() != before;
            !subs.is_empty()
        });
        found
    }
}

// =============================================================================
// Typed Adapter
// =============================================================================

/// Decoded change made by another node
#[derive(Debug, Clone, PartialEq)]
pub struct PeerChange<K, V> {
    pub kind: ChangeKind,
    pub key: K,
    pub value: Option<V>,
    pub old_value: Option<V>,
}

/// Callback receiving decoded peer changes
pub type PeerHandler<K, V> = Arc<dyn Fn(PeerChange<K, V>) + Send + Sync>;

/// Callback receiving a key's last-access time (epoch millis) from a peer
pub type AccessHandler<K> = Arc<dyn Fn(K, u64) + Send + Sync>;

/// Typed, namespaced view of a provider for one cache
pub struct DistributedAdapter<K, V> {
    namespace: Namespace,
    timestamps: Namespace,
    node_id: NodeId,
    provider: RwLock<Option<Arc<dyn DistributedProvider>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    access_subscription: Mutex<Option<SubscriptionId>>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K: CacheKey, V: CacheValue> DistributedAdapter<K, V> {
    /// Create an adapter; `provider == None` makes every call a no-op
    pub fn new(
        namespace: Namespace,
        node_id: NodeId,
        provider: Option<Arc<dyn DistributedProvider>>,
    ) -> Self {
        Self {
            timestamps: namespace.timestamps(),
            namespace,
            node_id,
            provider: RwLock::new(provider),
            subscription: Mutex::new(None),
            access_subscription: Mutex::new(None),
            _types: PhantomData,
        }
    }

    /// Namespace used in the provider
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Node id stamped on writes
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Check whether a provider is attached
    pub fn is_active(&self) -> bool {
        self.provider.read().is_some()
    }

    fn provider(&self) -> Option<Arc<dyn DistributedProvider>> {
        self.provider.read().clone()
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Get a value from the distributed tier
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let Some(provider) = self.provider() else {
            return Ok(None);
        };
        let raw_key = Self::encode(key)?;
        match provider.get(self.namespace.as_str(), &raw_key).await? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write-through; returns the value the distributed tier held before
    pub async fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        let Some(provider) = self.provider() else {
            return Ok(None);
        };
        let raw_key = Self::encode(key)?;
        let raw_value = Self::encode(value)?;
        match provider
            .put(self.namespace.as_str(), raw_key, raw_value, self.node_id)
            .await?
        {
            Some(old) => Ok(Self::decode(&old).ok()),
            None => Ok(None),
        }
    }

    /// Remove a key; returns the removed value
    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        let Some(provider) = self.provider() else {
            return Ok(None);
        };
        let raw_key = Self::encode(key)?;
        match provider
            .remove(self.namespace.as_str(), &raw_key, self.node_id)
            .await?
        {
            Some(old) => Ok(Self::decode(&old).ok()),
            None => Ok(None),
        }
    }

    /// Remove a key, logging and absorbing any failure
    pub async fn remove_quietly(&self, key: &K) {
        if let Err(e) = self.remove(key).await {
            warn!(namespace = %self.namespace, key = ?key, error = %e, "Distributed remove failed");
        }
    }

    /// Check if a key exists in the distributed tier
    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        let Some(provider) = self.provider() else {
            return Ok(false);
        };
        let raw_key = Self::encode(key)?;
        provider.contains_key(self.namespace.as_str(), &raw_key).await
    }

    /// Remove every key of this cache from the distributed tier
    pub async fn clear(&self) -> Result<()> {
        let Some(provider) = self.provider() else {
            return Ok(());
        };
        provider.clear(self.namespace.as_str(), self.node_id).await
    }

    /// Publish the last-access time of `key` to the other nodes
    pub async fn put_access(&self, key: &K, accessed_at: u64) -> Result<()> {
        let Some(provider) = self.provider() else {
            return Ok(());
        };
        let raw_key = Self::encode(key)?;
        let raw_value = Self::encode(&accessed_at)?;
        provider
            .put(self.timestamps.as_str(), raw_key, raw_value, self.node_id)
            .await?;
        Ok(())
    }

    /// Drop the replicated access time of `key`, absorbing failures
    pub async fn remove_access_quietly(&self, key: &K) {
        let Some(provider) = self.provider() else {
            return;
        };
        let result = match Self::encode(key) {
            Ok(raw_key) => provider
                .remove(self.timestamps.as_str(), &raw_key, self.node_id)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(namespace = %self.timestamps, key = ?key, error = %e, "Distributed timestamp remove failed");
        }
    }

    /// Drop every replicated access time of this cache, absorbing failures
    pub async fn clear_accesses_quietly(&self) {
        let Some(provider) = self.provider() else {
            return;
        };
        if let Err(e) = provider.clear(self.timestamps.as_str(), self.node_id).await {
            warn!(namespace = %self.timestamps, error = %e, "Distributed timestamp clear failed");
        }
    }

    /// Attach a provider and subscribe `handler` to peer changes.
    ///
    /// Returns false if a provider was already attached.
    pub fn attach(&self, provider: Arc<dyn DistributedProvider>, handler: PeerHandler<K, V>) -> bool {
        {
            let mut slot = self.provider.write();
            if slot.is_some() {
                return false;
            }
            *slot = Some(provider);
        }
        self.subscribe(handler);
        true
    }

    /// Subscribe to changes made by other nodes in this namespace
    pub fn subscribe(&self, handler: PeerHandler<K, V>) {
        let Some(provider) = self.provider() else {
            return;
        };
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }

        let own = self.node_id;
        let namespace = self.namespace.clone();
        let raw_handler: NotificationHandler = Arc::new(move |n: &ChangeNotification| {
            if n.origin == own {
                return;
            }
            match decode_change::<K, V>(n) {
                Ok(change) => handler(change),
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Dropping undecodable peer change")
                }
            }
        });

        let id = provider.subscribe(self.namespace.as_str(), raw_handler);
        debug!(namespace = %self.namespace, "Subscribed to distributed changes");
        *subscription = Some(id);
    }

    /// Subscribe to last-access times published by other nodes
    pub fn subscribe_accesses(&self, handler: AccessHandler<K>) {
        let Some(provider) = self.provider() else {
            return;
        };
        let mut subscription = self.access_subscription.lock();
        if subscription.is_some() {
            return;
        }

        let own = self.node_id;
        let namespace = self.timestamps.clone();
        let raw_handler: NotificationHandler = Arc::new(move |n: &ChangeNotification| {
            if n.origin == own || n.kind == ChangeKind::Removed {
                return;
            }
            match decode_access::<K>(n) {
                Ok(Some((key, accessed_at))) => handler(key, accessed_at),
                Ok(None) => {}
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Dropping undecodable access time")
                }
            }
        });

        *subscription = Some(provider.subscribe(self.timestamps.as_str(), raw_handler));
    }

    /// Cancel the peer-change and access-time subscriptions
    pub fn unsubscribe(&self) {
        let ids = [
            self.subscription.lock().take(),
            self.access_subscription.lock().take(),
        ];
        let Some(provider) = self.provider() else {
            return;
        };
        for id in ids.into_iter().flatten() {
            provider.unsubscribe(id);
        }
        debug!(namespace = %self.namespace, "Unsubscribed from distributed changes");
    }
}

fn decode_access<K: CacheKey>(n: &ChangeNotification) -> Result<Option<(K, u64)>> {
    let Some(raw) = n.value.as_deref() else {
        return Ok(None);
    };
    Ok(Some((serde_json::from_slice(&n.key)?, serde_json::from_slice(raw)?)))
}

fn decode_change<K: CacheKey, V: CacheValue>(n: &ChangeNotification) -> Result<PeerChange<K, V>> {
    let key = serde_json::from_slice(&n.key)?;
    let value = n.value.as_deref().map(serde_json::from_slice).transpose()?;
    let old_value = n
        .old_value
        .as_deref()
        .map(serde_json::from_slice)
        .transpose()?;
    Ok(PeerChange {
        kind: n.kind,
        key,
        value,
        old_value,
    })
}

// =============================================================================
// Tests
// =============================================================================
