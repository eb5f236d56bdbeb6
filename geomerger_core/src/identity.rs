//! The "IDENTITY" Engine - Primary/Secondary Forest
//!
//! Solves the "one object, many names" problem: every camera assigns its own
//! ids, so the same car crossing two overlapping fields of view shows up
//! under two unrelated ids. The forest records which of those ids are
//! known to name the same object:
//!
//! - A **Primary** is the canonical name of a cluster and is emitted as-is
//! - A **Secondary** points to exactly one Primary and is rewritten to it
//!
//! The forest is kept flat (depth 1) and never links two ids of the same
//! source. Keys are interned into small integer handles so that both
//! directions of the mapping are plain handle-keyed maps.
//!
//! All mutating operations are idempotent: repeating a mutation that is
//! already satisfied is a no-op, never an error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// KEYS
// ============================================================================

/// Opaque per-source object identifier, as assigned by an upstream tracker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(#[serde(with = "hex::serde")] pub Vec<u8>);

impl ObjectId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for ObjectId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show first 4 bytes for readability
        let shown = &self.0[..self.0.len().min(4)];
        write!(f, "{}", hex::encode(shown))
    }
}

/// One source's view of one object. Object ids are only unique per source,
/// so `(cam1, 0xab)` and `(cam2, 0xab)` are unrelated keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub source_id: String,
    pub object_id: ObjectId,
}

impl IdentityKey {
    pub fn new(source_id: impl Into<String>, object_id: impl Into<Vec<u8>>) -> Self {
        Self {
            source_id: source_id.into(),
            object_id: ObjectId::new(object_id),
        }
    }

    #[inline]
    pub fn same_source(&self, other: &IdentityKey) -> bool {
        self.source_id == other.source_id
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.object_id)
    }
}

/// The role a key currently holds in the forest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Primary,
    SecondaryOf(IdentityKey),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Unknown => write!(f, "unknown"),
            Role::Primary => write!(f, "primary"),
            Role::SecondaryOf(primary) => write!(f, "secondary of {}", primary),
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised by forest mutations and role-specific queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Cannot link {secondary} to {primary}: same source")]
    SameSourceViolation {
        secondary: IdentityKey,
        primary: IdentityKey,
    },

    #[error("Secondary {secondary} already mapped to primary {existing}")]
    ConflictingMapping {
        secondary: IdentityKey,
        existing: IdentityKey,
    },

    #[error("{0} is not secondary")]
    SecondaryNotFound(IdentityKey),

    #[error("{0} is not primary")]
    PrimaryNotFound(IdentityKey),

    #[error("{key} is already {role}")]
    RoleConflict { key: IdentityKey, role: Role },
}

// ============================================================================
// FOREST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Handle(u32);

/// Primary/secondary mapping between per-source identities.
#[derive(Debug, Clone, Default)]
pub struct IdentityForest {
    /// Interned keys → handle
    handles: HashMap<IdentityKey, Handle>,

    /// Handle → key (arena slot, `None` when freed)
    keys: Vec<Option<IdentityKey>>,

    /// Freed arena slots
    free: Vec<Handle>,

    primary_by_secondary: HashMap<Handle, Handle>,

    /// Insertion-ordered secondaries per primary
    secondaries_by_primary: HashMap<Handle, Vec<Handle>>,
}

impl IdentityForest {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // ARENA
    // ========================================================================

    fn handle(&self, key: &IdentityKey) -> Option<Handle> {
        self.handles.get(key).copied()
    }

    fn intern(&mut self, key: &IdentityKey) -> Handle {
        if let Some(h) = self.handle(key) {
            return h;
        }
        let h = match self.free.pop() {
            Some(h) => {
                self.keys[h.0 as usize] = Some(key.clone());
                h
            }
            None => {
                self.keys.push(Some(key.clone()));
                Handle((self.keys.len() - 1) as u32)
            }
        };
        self.handles.insert(key.clone(), h);
        h
    }

    fn key(&self, h: Handle) -> Option<&IdentityKey> {
        self.keys.get(h.0 as usize).and_then(Option::as_ref)
    }

    fn keys_of(&self, handles: &[Handle]) -> Vec<IdentityKey> {
        handles.iter().filter_map(|&h| self.key(h).cloned()).collect()
    }

    /// Frees the slot of a handle that no longer takes part in any mapping.
    fn release_if_unlinked(&mut self, h: Handle) {
        if self.primary_by_secondary.contains_key(&h) || self.secondaries_by_primary.contains_key(&h) {
            return;
        }
        if let Some(key) = self.keys.get_mut(h.0 as usize).and_then(Option::take) {
            self.handles.remove(&key);
            self.free.push(h);
        }
    }

    fn link(&mut self, primary: Handle, secondary: Handle) {
        self.secondaries_by_primary.entry(primary).or_default().push(secondary);
        self.primary_by_secondary.insert(secondary, primary);
    }

    /// Detaches `secondary` from its primary. The primary keeps its entry,
    /// even with zero secondaries left.
    fn unlink(&mut self, secondary: Handle) -> Option<Handle> {
        let primary = self.primary_by_secondary.remove(&secondary)?;
        if let Some(children) = self.secondaries_by_primary.get_mut(&primary) {
            children.retain(|&c| c != secondary);
        }
        Some(primary)
    }

    // ========================================================================
    // PREDICATES
    // ========================================================================

    pub fn is_primary(&self, key: &IdentityKey) -> bool {
        self.handle(key)
            .is_some_and(|h| self.secondaries_by_primary.contains_key(&h))
    }

    pub fn is_secondary(&self, key: &IdentityKey) -> bool {
        self.handle(key)
            .is_some_and(|h| self.primary_by_secondary.contains_key(&h))
    }

    pub fn is_secondary_for(&self, key: &IdentityKey, primary: &IdentityKey) -> bool {
        match (self.handle(key), self.handle(primary)) {
            (Some(s), Some(p)) => self.primary_by_secondary.get(&s) == Some(&p),
            _ => false,
        }
    }

    pub fn is_known(&self, key: &IdentityKey) -> bool {
        self.is_primary(key) || self.is_secondary(key)
    }

    /// The role `key` holds right now.
    pub fn role(&self, key: &IdentityKey) -> Role {
        let Some(h) = self.handle(key) else {
            return Role::Unknown;
        };
        if let Some(&p) = self.primary_by_secondary.get(&h) {
            return match self.key(p) {
                Some(primary) => Role::SecondaryOf(primary.clone()),
                None => Role::Unknown,
            };
        }
        if self.secondaries_by_primary.contains_key(&h) {
            Role::Primary
        } else {
            Role::Unknown
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_primary(&self, secondary: &IdentityKey) -> Result<IdentityKey, IdentityError> {
        self.handle(secondary)
            .and_then(|h| self.primary_by_secondary.get(&h))
            .and_then(|&p| self.key(p).cloned())
            .ok_or_else(|| IdentityError::SecondaryNotFound(secondary.clone()))
    }

    /// Secondaries of `primary`, in insertion order.
    pub fn get_secondaries(&self, primary: &IdentityKey) -> Result<Vec<IdentityKey>, IdentityError> {
        self.handle(primary)
            .and_then(|h| self.secondaries_by_primary.get(&h))
            .map(|children| self.keys_of(children))
            .ok_or_else(|| IdentityError::PrimaryNotFound(primary.clone()))
    }

    /// The id `key` is emitted under: its primary if it is a secondary,
    /// otherwise the key itself.
    pub fn canonical(&self, key: &IdentityKey) -> IdentityKey {
        self.get_primary(key).unwrap_or_else(|_| key.clone())
    }

    /// Number of keys that are primary or secondary.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// All current primaries (unordered).
    pub fn primaries(&self) -> Vec<IdentityKey> {
        self.secondaries_by_primary
            .keys()
            .filter_map(|&h| self.key(h).cloned())
            .collect()
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Maps `secondary` to `primary`, creating `primary` lazily.
    pub fn map_secondary(&mut self, secondary: &IdentityKey, primary: &IdentityKey) -> Result<(), IdentityError> {
        if secondary.same_source(primary) {
            return Err(IdentityError::SameSourceViolation {
                secondary: secondary.clone(),
                primary: primary.clone(),
            });
        }

        match self.role(secondary) {
            Role::SecondaryOf(existing) if &existing == primary => return Ok(()),
            Role::SecondaryOf(existing) => {
                return Err(IdentityError::ConflictingMapping {
                    secondary: secondary.clone(),
                    existing,
                });
            }
            Role::Primary => {
                return Err(IdentityError::RoleConflict {
                    key: secondary.clone(),
                    role: Role::Primary,
                });
            }
            Role::Unknown => {}
        }

        // Keep the forest flat
        if let role @ Role::SecondaryOf(_) = self.role(primary) {
            return Err(IdentityError::RoleConflict {
                key: primary.clone(),
                role,
            });
        }

        let p = self.intern(primary);
        let s = self.intern(secondary);
        self.link(p, s);
        Ok(())
    }

    /// Moves an existing secondary over to `new_primary`, creating it lazily.
    pub fn remap_secondary(&mut self, secondary: &IdentityKey, new_primary: &IdentityKey) -> Result<(), IdentityError> {
        if !self.is_secondary(secondary) {
            return Err(IdentityError::SecondaryNotFound(secondary.clone()));
        }
        if secondary.same_source(new_primary) {
            return Err(IdentityError::SameSourceViolation {
                secondary: secondary.clone(),
                primary: new_primary.clone(),
            });
        }
        if self.is_secondary_for(secondary, new_primary) {
            return Ok(());
        }
        if let role @ Role::SecondaryOf(_) = self.role(new_primary) {
            return Err(IdentityError::RoleConflict {
                key: new_primary.clone(),
                role,
            });
        }

        let s = self.intern(secondary);
        self.unlink(s);
        let p = self.intern(new_primary);
        self.link(p, s);
        Ok(())
    }

    /// Demotes `primary` to a secondary of `new_primary`.
    ///
    /// The former secondaries of `primary` are always detached from it. With
    /// `migrate_children` they follow it to `new_primary` in their original
    /// order; a child that shares `new_primary`'s source cannot, and is
    /// released instead.
    ///
    /// Returns the keys that ended up unknown.
    pub fn demote_primary(
        &mut self,
        primary: &IdentityKey,
        new_primary: &IdentityKey,
        migrate_children: bool,
    ) -> Result<Vec<IdentityKey>, IdentityError> {
        if !self.is_primary(primary) {
            return Err(IdentityError::PrimaryNotFound(primary.clone()));
        }
        if primary.same_source(new_primary) {
            return Err(IdentityError::SameSourceViolation {
                secondary: primary.clone(),
                primary: new_primary.clone(),
            });
        }
        if let role @ Role::SecondaryOf(_) = self.role(new_primary) {
            return Err(IdentityError::RoleConflict {
                key: new_primary.clone(),
                role,
            });
        }

        let old = self.intern(primary);
        let children = self.secondaries_by_primary.remove(&old).unwrap_or_default();
        for &child in &children {
            self.primary_by_secondary.remove(&child);
        }

        let np = self.intern(new_primary);
        self.link(np, old);

        let mut released = Vec::new();
        for child in children {
            let Some(child_key) = self.key(child).cloned() else {
                continue;
            };
            if migrate_children && !child_key.same_source(new_primary) {
                self.link(np, child);
            } else {
                self.release_if_unlinked(child);
                released.push(child_key);
            }
        }
        Ok(released)
    }

    /// Purges `key` from the forest in both directions. A primary takes its
    /// secondaries down with it.
    ///
    /// Returns every key that became unknown.
    pub fn remove(&mut self, key: &IdentityKey) -> Vec<IdentityKey> {
        let Some(h) = self.handle(key) else {
            return Vec::new();
        };
        let mut removed = Vec::new();

        if let Some(children) = self.secondaries_by_primary.remove(&h) {
            for child in children {
                self.primary_by_secondary.remove(&child);
                if let Some(child_key) = self.key(child).cloned() {
                    removed.push(child_key);
                }
                self.release_if_unlinked(child);
            }
        }
        self.unlink(h);

        removed.push(key.clone());
        self.release_if_unlinked(h);
        removed
    }

    /// Checks the structural invariants: both directions agree, depth is
    /// exactly 1, no same-source links, no key is both roles.
    pub fn is_consistent(&self) -> bool {
        for (&s, &p) in &self.primary_by_secondary {
            if self.secondaries_by_primary.contains_key(&s) {
                return false;
            }
            if self.primary_by_secondary.contains_key(&p) {
                return false;
            }
            let listed = self
                .secondaries_by_primary
                .get(&p)
                .is_some_and(|children| children.iter().filter(|&&c| c == s).count() == 1);
            if !listed {
                return false;
            }
            match (self.key(s), self.key(p)) {
                (Some(sk), Some(pk)) if !sk.same_source(pk) => {}
                _ => return false,
            }
        }
        for (&p, children) in &self.secondaries_by_primary {
            if children.iter().any(|c| self.primary_by_secondary.get(c) != Some(&p)) {
                return false;
            }
        }
        self.handles.iter().all(|(key, &h)| {
            self.key(h) == Some(key)
                && (self.primary_by_secondary.contains_key(&h) || self.secondaries_by_primary.contains_key(&h))
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(source: &str, id: &[u8]) -> IdentityKey {
        IdentityKey::new(source, id)
    }

    #[test]
    fn test_map_secondary() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let sec = key("s2", b"sec1");

        forest.map_secondary(&sec, &prim).unwrap();

        assert!(forest.is_primary(&prim));
        assert!(!forest.is_secondary(&prim));
        assert!(forest.is_secondary(&sec));
        assert!(!forest.is_primary(&sec));
        assert!(forest.is_secondary_for(&sec, &prim));
        assert_eq!(forest.get_primary(&sec).unwrap(), prim);
        assert_eq!(forest.canonical(&sec), prim);
        assert_eq!(forest.canonical(&prim), prim);
    }

    #[test]
    fn test_map_secondary_idempotent() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let sec = key("s2", b"sec1");

        forest.map_secondary(&sec, &prim).unwrap();
        forest.map_secondary(&sec, &prim).unwrap();

        assert_eq!(forest.get_secondaries(&prim).unwrap(), vec![sec.clone()]);
        assert_eq!(forest.len(), 2);
        assert!(forest.is_consistent());
    }

    #[test]
    fn test_map_secondary_existing() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let prim2 = key("s1", b"pri2");
        let sec = key("s2", b"sec1");

        forest.map_secondary(&sec, &prim).unwrap();

        let err = forest.map_secondary(&sec, &prim2).unwrap_err();
        assert_eq!(
            err,
            IdentityError::ConflictingMapping {
                secondary: sec.clone(),
                existing: prim.clone(),
            }
        );

        assert!(forest.is_secondary_for(&sec, &prim));
        assert!(!forest.is_known(&prim2));
    }

    #[test]
    fn test_map_secondary_keeps_forest_flat() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let sec = key("s2", b"sec1");
        let other = key("s3", b"obj1");

        forest.map_secondary(&sec, &prim).unwrap();

        // A secondary cannot become somebody's primary
        assert!(matches!(
            forest.map_secondary(&other, &sec),
            Err(IdentityError::RoleConflict { .. })
        ));
        // A primary cannot become somebody's secondary through a plain map
        assert!(matches!(
            forest.map_secondary(&prim, &other),
            Err(IdentityError::RoleConflict { .. })
        ));
        assert!(!forest.is_known(&other));
    }

    #[test]
    fn test_remap_secondary() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let prim2 = key("s1", b"pri2");
        let sec = key("s2", b"sec1");

        forest.map_secondary(&sec, &prim).unwrap();
        forest.remap_secondary(&sec, &prim2).unwrap();

        assert!(forest.is_primary(&prim2));
        assert!(forest.is_secondary_for(&sec, &prim2));
        // The old primary survives with no secondaries
        assert!(forest.is_primary(&prim));
        assert!(forest.get_secondaries(&prim).unwrap().is_empty());
        assert!(forest.is_consistent());
    }

    #[test]
    fn test_remap_unknown_secondary() {
        let mut forest = IdentityForest::new();
        let err = forest.remap_secondary(&key("s2", b"x"), &key("s1", b"y")).unwrap_err();
        assert_eq!(err, IdentityError::SecondaryNotFound(key("s2", b"x")));
    }

    #[test]
    fn test_demote_primary() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let prim2 = key("s3", b"pri2");
        let sec = key("s2", b"sec1");
        let sec2 = key("s2", b"sec2");

        forest.map_secondary(&sec, &prim).unwrap();
        forest.map_secondary(&sec2, &prim).unwrap();
        assert_eq!(forest.get_secondaries(&prim).unwrap(), vec![sec.clone(), sec2.clone()]);

        let released = forest.demote_primary(&prim, &prim2, false).unwrap();

        assert!(forest.is_secondary_for(&prim, &prim2));
        assert_eq!(forest.get_secondaries(&prim2).unwrap(), vec![prim.clone()]);
        assert!(!forest.is_secondary(&sec));
        assert!(!forest.is_secondary(&sec2));
        assert_eq!(released, vec![sec, sec2]);
        assert!(forest.is_consistent());
    }

    #[test]
    fn test_demote_primary_migrate() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let prim2 = key("s3", b"pri2");
        let sec = key("s2", b"sec1");
        let sec2 = key("s2", b"sec2");

        forest.map_secondary(&sec, &prim).unwrap();
        forest.map_secondary(&sec2, &prim).unwrap();

        let released = forest.demote_primary(&prim, &prim2, true).unwrap();

        assert!(released.is_empty());
        assert!(forest.is_secondary_for(&prim, &prim2));
        assert_eq!(forest.get_secondaries(&prim2).unwrap(), vec![prim, sec, sec2]);
        assert!(forest.is_consistent());
    }

    #[test]
    fn test_demote_primary_drops_children_of_new_primary_source() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let sec = key("s2", b"sec1");
        let new_prim = key("s2", b"pri2");

        forest.map_secondary(&sec, &prim).unwrap();
        let released = forest.demote_primary(&prim, &new_prim, true).unwrap();

        assert_eq!(released, vec![sec.clone()]);
        assert!(!forest.is_known(&sec));
        assert_eq!(forest.get_secondaries(&new_prim).unwrap(), vec![prim]);
        assert!(forest.is_consistent());
    }

    #[test]
    fn test_demote_requires_primary() {
        let mut forest = IdentityForest::new();
        let err = forest
            .demote_primary(&key("s1", b"a"), &key("s2", b"b"), true)
            .unwrap_err();
        assert_eq!(err, IdentityError::PrimaryNotFound(key("s1", b"a")));
    }

    #[test]
    fn test_source_constraint() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let sec = key("s1", b"sec1");

        assert!(matches!(
            forest.map_secondary(&sec, &prim),
            Err(IdentityError::SameSourceViolation { .. })
        ));
        assert!(!forest.is_known(&sec));
        assert!(!forest.is_known(&prim));
        assert!(forest.is_empty());
    }

    #[test]
    fn test_source_constraint_remap() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let prim2 = key("s2", b"pri2");
        let sec = key("s2", b"sec1");

        forest.map_secondary(&sec, &prim).unwrap();

        assert!(matches!(
            forest.remap_secondary(&sec, &prim2),
            Err(IdentityError::SameSourceViolation { .. })
        ));
        assert!(forest.is_secondary_for(&sec, &prim));
        assert!(!forest.is_known(&prim2));
    }

    #[test]
    fn test_remove_primary_takes_secondaries() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let sec = key("s2", b"sec1");
        let sec2 = key("s3", b"sec2");
        forest.map_secondary(&sec, &prim).unwrap();
        forest.map_secondary(&sec2, &prim).unwrap();

        let removed = forest.remove(&prim);

        assert_eq!(removed.len(), 3);
        assert!(forest.is_empty());
        assert!(forest.is_consistent());
    }

    #[test]
    fn test_remove_secondary_keeps_primary() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let sec = key("s2", b"sec1");
        forest.map_secondary(&sec, &prim).unwrap();

        assert_eq!(forest.remove(&sec), vec![sec.clone()]);

        assert!(forest.is_primary(&prim));
        assert!(!forest.is_known(&sec));
        assert!(forest.is_consistent());
    }

    #[test]
    fn test_freed_handles_are_reused() {
        let mut forest = IdentityForest::new();
        let prim = key("s1", b"pri1");
        let sec = key("s2", b"sec1");
        forest.map_secondary(&sec, &prim).unwrap();
        forest.remove(&prim);

        forest.map_secondary(&key("s4", b"x"), &key("s3", b"y")).unwrap();

        assert_eq!(forest.keys.len(), 2);
        assert!(forest.is_consistent());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Map(usize, usize),
        Remap(usize, usize),
        Demote(usize, usize, bool),
        Remove(usize),
    }

    /// 3 sources x 3 objects
    fn universe(i: usize) -> IdentityKey {
        key(&format!("s{}", i % 3), &[(i / 3) as u8])
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..9usize, 0..9usize).prop_map(|(a, b)| Op::Map(a, b)),
            (0..9usize, 0..9usize).prop_map(|(a, b)| Op::Remap(a, b)),
            (0..9usize, 0..9usize, any::<bool>()).prop_map(|(a, b, m)| Op::Demote(a, b, m)),
            (0..9usize).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_forest_stays_consistent(ops in prop::collection::vec(op_strategy(), 0..40)) {
            let mut forest = IdentityForest::new();
            for op in ops {
                let before = forest.clone();
                let result = match &op {
                    Op::Map(a, b) => forest.map_secondary(&universe(*a), &universe(*b)).map(|_| ()),
                    Op::Remap(a, b) => forest.remap_secondary(&universe(*a), &universe(*b)),
                    Op::Demote(a, b, m) => forest.demote_primary(&universe(*a), &universe(*b), *m).map(|_| ()),
                    Op::Remove(a) => { forest.remove(&universe(*a)); Ok(()) }
                };
                prop_assert!(forest.is_consistent(), "inconsistent after {:?}", op);
                if result.is_err() {
                    // Failed mutations leave the forest untouched
                    for i in 0..9 {
                        prop_assert_eq!(forest.role(&universe(i)), before.role(&universe(i)));
                    }
                }
                for i in 0..9 {
                    let k = universe(i);
                    prop_assert!(!(forest.is_primary(&k) && forest.is_secondary(&k)));
                }
            }
        }

        #[test]
        fn prop_map_secondary_is_idempotent(a in 0..9usize, b in 0..9usize) {
            let mut once = IdentityForest::new();
            let r1 = once.map_secondary(&universe(a), &universe(b));
            let mut twice = once.clone();
            let r2 = twice.map_secondary(&universe(a), &universe(b));
            prop_assert_eq!(r1.is_ok(), r2.is_ok());
            for i in 0..9 {
                prop_assert_eq!(once.role(&universe(i)), twice.role(&universe(i)));
            }
        }
    }
}
