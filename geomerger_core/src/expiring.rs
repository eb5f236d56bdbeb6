//! Time-based expiration around the identity forest.
//!
//! Every key handed to a mutation is touched (its last-seen time set to
//! `now`), and every key a lookup finds in the forest is refreshed, before a
//! rate-limited sweep runs. Lookups of keys the forest does not hold leave no
//! entry behind. The sweep purges every key that
//! has not been touched for longer than the expiration age, in both
//! directions; an expired primary takes its secondaries with it.

use crate::identity::{IdentityError, IdentityForest, IdentityKey, Role};
use geomerger_env::MergerContext;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// An [`IdentityForest`] whose entries expire when nobody refers to them.
pub struct ExpiringForest<Ctx: MergerContext> {
    forest: IdentityForest,
    context: Arc<Ctx>,

    /// Last time each key was referenced by any call
    last_seen: HashMap<IdentityKey, Duration>,

    /// Keys untouched for longer than this are purged
    expiration_age: Duration,

    /// Minimum time between two sweeps
    sweep_interval: Duration,

    last_sweep: Option<Duration>,
}

impl<Ctx: MergerContext> ExpiringForest<Ctx> {
    pub fn new(context: Arc<Ctx>, expiration_age: Duration, sweep_interval: Duration) -> Self {
        Self {
            forest: IdentityForest::new(),
            context,
            last_seen: HashMap::new(),
            expiration_age,
            sweep_interval,
            last_sweep: None,
        }
    }

    /// Read-only view of the underlying forest. Does not touch any key.
    pub fn inner(&self) -> &IdentityForest {
        &self.forest
    }

    /// Number of keys with a last-seen entry.
    pub fn tracked_len(&self) -> usize {
        self.last_seen.len()
    }

    /// Mutations may make any of `keys` known, so all of them are tracked.
    fn touch_and_sweep(&mut self, keys: &[&IdentityKey]) {
        let now = self.context.now();
        for &key in keys {
            self.last_seen.insert(key.clone(), now);
        }
        self.maintain();
    }

    /// Lookups only refresh keys the forest holds; unmapped keys stay untracked.
    fn refresh_and_sweep(&mut self, keys: &[&IdentityKey]) {
        let now = self.context.now();
        for &key in keys {
            if !self.forest.is_known(key) {
                continue;
            }
            if let Some(seen) = self.last_seen.get_mut(key) {
                *seen = now;
            }
        }
        self.maintain();
    }

    /// Runs the expiration sweep if the last one is at least one sweep
    /// interval ago. Returns the keys purged from the forest.
    pub fn maintain(&mut self) -> Vec<IdentityKey> {
        let now = self.context.now();
        if let Some(last) = self.last_sweep {
            if now.saturating_sub(last) < self.sweep_interval {
                return Vec::new();
            }
        }
        self.last_sweep = Some(now);

        let age = self.expiration_age;
        let stale: Vec<IdentityKey> = self
            .last_seen
            .iter()
            .filter(|&(_, &seen)| now.saturating_sub(seen) > age)
            .map(|(key, _)| key.clone())
            .collect();

        let mut purged = Vec::new();
        for key in stale {
            self.last_seen.remove(&key);
            purged.extend(self.forest.remove(&key));
        }
        if !purged.is_empty() {
            debug!(count = purged.len(), "Expired identities");
        }
        purged
    }

    pub fn map_secondary(&mut self, secondary: &IdentityKey, primary: &IdentityKey) -> Result<(), IdentityError> {
        self.touch_and_sweep(&[secondary, primary]);
        self.forest.map_secondary(secondary, primary)
    }

    pub fn remap_secondary(&mut self, secondary: &IdentityKey, new_primary: &IdentityKey) -> Result<(), IdentityError> {
        self.touch_and_sweep(&[secondary, new_primary]);
        self.forest.remap_secondary(secondary, new_primary)
    }

    pub fn demote_primary(
        &mut self,
        primary: &IdentityKey,
        new_primary: &IdentityKey,
        migrate_children: bool,
    ) -> Result<Vec<IdentityKey>, IdentityError> {
        self.touch_and_sweep(&[primary, new_primary]);
        self.forest.demote_primary(primary, new_primary, migrate_children)
    }

    pub fn get_primary(&mut self, secondary: &IdentityKey) -> Result<IdentityKey, IdentityError> {
        self.refresh_and_sweep(&[secondary]);
        self.forest.get_primary(secondary)
    }

    pub fn get_secondaries(&mut self, primary: &IdentityKey) -> Result<Vec<IdentityKey>, IdentityError> {
        self.refresh_and_sweep(&[primary]);
        self.forest.get_secondaries(primary)
    }

    pub fn canonical(&mut self, key: &IdentityKey) -> IdentityKey {
        self.refresh_and_sweep(&[key]);
        self.forest.canonical(key)
    }

    pub fn role(&mut self, key: &IdentityKey) -> Role {
        self.refresh_and_sweep(&[key]);
        self.forest.role(key)
    }

    pub fn is_primary(&mut self, key: &IdentityKey) -> bool {
        self.refresh_and_sweep(&[key]);
        self.forest.is_primary(key)
    }

    pub fn is_secondary(&mut self, key: &IdentityKey) -> bool {
        self.refresh_and_sweep(&[key]);
        self.forest.is_secondary(key)
    }

    pub fn is_secondary_for(&mut self, key: &IdentityKey, primary: &IdentityKey) -> bool {
        self.refresh_and_sweep(&[key, primary]);
        self.forest.is_secondary_for(key, primary)
    }

    pub fn is_known(&mut self, key: &IdentityKey) -> bool {
        self.refresh_and_sweep(&[key]);
        self.forest.is_known(key)
    }
}
