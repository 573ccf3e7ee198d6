//! Registry credentials and the store that publishes them.
//!
//! A [`CredentialSnapshot`] is an immutable view of every configured registry.
//! The [`CredentialStore`] swaps snapshots atomically; readers always see one
//! complete snapshot and never a mix of two.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use secret::{BasicAuth, Secret};

use crate::reference::normalize_domain;

/// Lowest accepted registry priority.
pub const MIN_PRIORITY: i32 = 0;

/// Highest accepted registry priority.
pub const MAX_PRIORITY: i32 = 10_000;

/// Priority of the offline hub when none is configured.
pub const OFFLINE_DEFAULT_PRIORITY: i32 = 1000;

/// Priority of a mirror registry when none is configured.
pub const REGISTRY_DEFAULT_PRIORITY: i32 = 500;

/// Replace an unset (zero) priority with the class default and clamp the rest
/// into `[MIN_PRIORITY, MAX_PRIORITY]`.
pub fn normalize_priority(priority: i32, offline: bool) -> i32 {
    match priority {
        0 if offline => OFFLINE_DEFAULT_PRIORITY,
        0 => REGISTRY_DEFAULT_PRIORITY,
        p => p.clamp(MIN_PRIORITY, MAX_PRIORITY),
    }
}

/// Login material for one registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryCredential {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: Secret,
    /// Pre-encoded `user:password` in base64.
    pub auth: Secret,
    /// Token used to obtain a registry token.
    pub identity_token: Secret,
    /// Bearer token sent to the registry directly.
    pub registry_token: Secret,
    /// Address the credential was configured for, as written.
    pub server_address: String,
}

impl RegistryCredential {
    /// A credential with no login material.
    pub fn anonymous(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            ..Self::default()
        }
    }

    /// Username and password login.
    pub fn basic(server_address: impl Into<String>, auth: BasicAuth) -> Self {
        let encoded = auth.encode();
        let (username, password) = auth.into_parts();
        Self {
            username,
            password,
            auth: encoded,
            server_address: server_address.into(),
            ..Self::default()
        }
    }

    /// True when there is nothing to log in with.
    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.auth.is_empty()
            && self.identity_token.is_empty()
            && self.registry_token.is_empty()
    }
}

impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("username", &self.username)
            .field("password", &self.password)
            .field("server_address", &self.server_address)
            .finish_non_exhaustive()
    }
}

/// One candidate registry, as seen by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Normalized registry domain.
    pub domain: String,
    /// Credential for the registry.
    pub credential: RegistryCredential,
    /// Normalized priority; larger is tried first.
    pub priority: i32,
    /// True for the offline hub.
    pub is_offline: bool,
    /// True when the registry is used without logging in.
    pub skip_login: bool,
}

/// An immutable set of configured registries, keyed by normalized domain.
#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    cri: BTreeMap<String, RegistryCredential>,
    offline: BTreeMap<String, RegistryCredential>,
    skip_login: BTreeSet<String>,
    priorities: BTreeMap<String, i32>,
    offline_priority: i32,
}

impl Default for CredentialSnapshot {
    fn default() -> Self {
        Self {
            cri: BTreeMap::new(),
            offline: BTreeMap::new(),
            skip_login: BTreeSet::new(),
            priorities: BTreeMap::new(),
            offline_priority: OFFLINE_DEFAULT_PRIORITY,
        }
    }
}

impl CredentialSnapshot {
    /// Start building a snapshot.
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// True when no registry of either kind is configured.
    pub fn is_empty(&self) -> bool {
        self.cri.is_empty() && self.offline.is_empty()
    }

    /// Mirror registries.
    pub fn cri_configs(&self) -> &BTreeMap<String, RegistryCredential> {
        &self.cri
    }

    /// Offline hub registries.
    pub fn offline_configs(&self) -> &BTreeMap<String, RegistryCredential> {
        &self.offline
    }

    /// Exact-domain lookup, mirrors first.
    pub fn lookup(&self, domain: &str) -> Option<&RegistryCredential> {
        let domain = normalize_domain(domain);
        self.cri.get(&domain).or_else(|| self.offline.get(&domain))
    }

    /// True when the registry is configured to be used without logging in.
    pub fn should_skip_login(&self, domain: &str) -> bool {
        self.skip_login.contains(&normalize_domain(domain))
    }

    /// Priority of an offline hub.
    pub fn offline_priority(&self) -> i32 {
        self.offline_priority
    }

    /// Priority of a mirror, or the mirror default.
    pub fn priority(&self, domain: &str) -> i32 {
        self.priorities
            .get(&normalize_domain(domain))
            .copied()
            .unwrap_or(REGISTRY_DEFAULT_PRIORITY)
    }

    /// Every registry ordered by descending priority. On equal priority the
    /// offline hub goes first, then domains in lexical order.
    pub fn sorted_registries(&self) -> Vec<RegistryEntry> {
        let offline = self.offline.iter().map(|(domain, credential)| RegistryEntry {
            domain: domain.clone(),
            credential: credential.clone(),
            priority: self.offline_priority,
            is_offline: true,
            skip_login: self.skip_login.contains(domain),
        });
        let cri = self.cri.iter().map(|(domain, credential)| RegistryEntry {
            domain: domain.clone(),
            credential: credential.clone(),
            priority: self.priority(domain),
            is_offline: false,
            skip_login: self.skip_login.contains(domain),
        });

        let mut entries: Vec<_> = offline.chain(cri).collect();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.is_offline.cmp(&a.is_offline))
        });
        entries
    }
}

/// Builds a [`CredentialSnapshot`], normalizing domains and priorities.
///
/// A registry whose credential is empty is marked skip-login.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    snapshot: CredentialSnapshot,
}

impl SnapshotBuilder {
    /// Add an offline hub registry.
    pub fn offline(mut self, domain: &str, credential: RegistryCredential) -> Self {
        let domain = normalize_domain(domain);
        if credential.is_empty() {
            self.snapshot.skip_login.insert(domain.clone());
        }
        self.snapshot.offline.insert(domain, credential);
        self
    }

    /// Set the priority shared by offline hub registries.
    pub fn offline_priority(mut self, priority: i32) -> Self {
        self.snapshot.offline_priority = checked_priority("offline", priority, true);
        self
    }

    /// Add a mirror registry.
    pub fn registry(mut self, domain: &str, credential: RegistryCredential, priority: i32) -> Self {
        let domain = normalize_domain(domain);
        if credential.is_empty() {
            self.snapshot.skip_login.insert(domain.clone());
        }
        let priority = checked_priority(&domain, priority, false);
        self.snapshot.priorities.insert(domain.clone(), priority);
        self.snapshot.cri.insert(domain, credential);
        self
    }

    /// Mark a registry as used without logging in, whatever its credential.
    pub fn skip_login(mut self, domain: &str) -> Self {
        self.snapshot.skip_login.insert(normalize_domain(domain));
        self
    }

    /// Finish the snapshot.
    pub fn build(self) -> CredentialSnapshot {
        self.snapshot
    }
}

fn checked_priority(domain: &str, priority: i32, offline: bool) -> i32 {
    let normalized = normalize_priority(priority, offline);
    if priority != 0 && normalized != priority {
        tracing::warn!(
            registry = domain,
            priority,
            clamped = normalized,
            "registry priority out of range"
        );
    }
    normalized
}

type Subscriber = Box<dyn Fn(u64) + Send + Sync>;

/// Holds the current [`CredentialSnapshot`] and notifies subscribers when it
/// is replaced.
///
/// Every replacement bumps a generation counter, so work that started under
/// an older snapshot can tell that its results are out of date.
pub struct CredentialStore {
    snapshot: RwLock<Arc<CredentialSnapshot>>,
    generation: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("generation", &self.generation())
            .field("subscribers", &self.subscribers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(CredentialSnapshot::default())
    }
}

impl CredentialStore {
    /// A store holding `snapshot` at generation zero.
    pub fn new(snapshot: CredentialSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Replace the snapshot. `None` clears every registry.
    ///
    /// Subscribers run after the swap, on the calling thread, and receive the
    /// new generation.
    pub fn update(&self, snapshot: Option<CredentialSnapshot>) -> u64 {
        let next = Arc::new(snapshot.unwrap_or_default());
        let (mirrors, offline) = (next.cri.len(), next.offline.len());

        let generation = {
            let mut current = self.snapshot.write();
            *current = next;
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        tracing::info!(generation, mirrors, offline, "credential snapshot replaced");
        for subscriber in self.subscribers.lock().iter() {
            subscriber(generation);
        }
        generation
    }

    /// Register a callback for snapshot replacements.
    ///
    /// Callbacks must not call back into [`CredentialStore::subscribe`].
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Box::new(subscriber));
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<CredentialSnapshot> {
        self.snapshot.read().clone()
    }

    /// The current snapshot together with its generation.
    pub fn current(&self) -> (Arc<CredentialSnapshot>, u64) {
        let snapshot = self.snapshot.read();
        (snapshot.clone(), self.generation.load(Ordering::Acquire))
    }

    /// Number of replacements so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Exact-domain credential lookup.
    pub fn lookup(&self, domain: &str) -> Option<RegistryCredential> {
        self.snapshot.read().lookup(domain).cloned()
    }

    /// See [`CredentialSnapshot::should_skip_login`].
    pub fn should_skip_login(&self, domain: &str) -> bool {
        self.snapshot.read().should_skip_login(domain)
    }

    /// See [`CredentialSnapshot::sorted_registries`].
    pub fn sorted_registries(&self) -> Vec<RegistryEntry> {
        self.snapshot.read().sorted_registries()
    }

    /// A copy of the mirror registries; changes to it do not affect the store.
    pub fn cri_configs(&self) -> BTreeMap<String, RegistryCredential> {
        self.snapshot.read().cri.clone()
    }

    /// A copy of the offline registries; changes to it do not affect the store.
    pub fn offline_configs(&self) -> BTreeMap<String, RegistryCredential> {
        self.snapshot.read().offline.clone()
    }
}
