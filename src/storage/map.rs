// ============================================================================
// Copy-on-Write Versioned Map
// ============================================================================
//
// An `MvMap` never mutates a published tree. Every write clones the current
// root (`im::OrdMap` shares structure, so the clone is O(1)), applies the
// change and publishes a new `RootReference` under the map's write lock.
// Readers grab the current `Arc<RootReference>` and keep a stable snapshot
// for as long as they hold it.
//
// ============================================================================

use crate::core::Result;
use im::OrdMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// Immutable snapshot of a map: the tree root plus the map version that produced it
#[derive(Debug)]
pub struct RootReference<K: Ord, V> {
    root: OrdMap<K, V>,
    version: u64,
}

impl<K: Ord + Clone, V: Clone> RootReference<K, V> {
    pub fn root(&self) -> &OrdMap<K, V> {
        &self.root
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of entries, tombstones included
    pub fn total_count(&self) -> usize {
        self.root.len()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.root.get(key)
    }

    /// Forward cursor over this snapshot starting at `from` (inclusive)
    pub fn cursor(&self, from: Option<&K>) -> Cursor<K, V> {
        let lower = match from {
            Some(key) => Bound::Included(key.clone()),
            None => Bound::Unbounded,
        };
        Cursor::new(self.root.clone(), lower, Bound::Unbounded)
    }

    /// Forward cursor over `[from, to]`
    pub fn range_cursor(&self, from: Option<&K>, to: Option<&K>) -> Cursor<K, V> {
        let lower = from.map_or(Bound::Unbounded, |key| Bound::Included(key.clone()));
        let upper = to.map_or(Bound::Unbounded, |key| Bound::Included(key.clone()));
        Cursor::new(self.root.clone(), lower, upper)
    }
}

/// Lazy, forward-only iteration over one pinned tree
///
/// The cursor owns its (structurally shared) copy of the tree and remembers
/// the last key it produced, so it never borrows from the map and never
/// observes writes published after it was created.
pub struct Cursor<K, V> {
    root: OrdMap<K, V>,
    lower: Bound<K>,
    upper: Bound<K>,
}

impl<K: Ord + Clone, V: Clone> Cursor<K, V> {
    fn new(root: OrdMap<K, V>, lower: Bound<K>, upper: Bound<K>) -> Self {
        Self { root, lower, upper }
    }

    fn is_exhausted(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }
}

impl<K: Ord + Clone, V: Clone> Iterator for Cursor<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_exhausted() {
            return None;
        }
        let (key, value) = self
            .root
            .range((self.lower.clone(), self.upper.clone()))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))?;
        self.lower = Bound::Excluded(key.clone());
        Some((key, value))
    }
}

/// What an [`MvMap::operate`] callback decided to do with the current entry
#[derive(Debug)]
pub enum Decision<V> {
    Abort,
    Remove,
    Put(V),
}

/// A named, versioned, copy-on-write ordered map
#[derive(Debug)]
pub struct MvMap<K: Ord, V> {
    id: u32,
    name: String,
    root: RwLock<Arc<RootReference<K, V>>>,
}

impl<K: Ord + Clone, V: Clone> MvMap<K, V> {
    pub(crate) fn new(id: u32, name: impl Into<String>) -> Self {
        Self::with_root(id, name, OrdMap::new())
    }

    pub(crate) fn with_root(id: u32, name: impl Into<String>, root: OrdMap<K, V>) -> Self {
        Self {
            id,
            name: name.into(),
            root: RwLock::new(Arc::new(RootReference { root, version: 0 })),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current root reference; holding it pins the snapshot
    pub fn get_root(&self) -> Result<Arc<RootReference<K, V>>> {
        Ok(Arc::clone(&*self.root.read()?))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.get_root()?.get(key).cloned())
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get_root()?.get(key).is_some())
    }

    /// Atomically decide what to do with the entry for `key` and apply it.
    ///
    /// Returns the previous value when the decision changed the map.
    pub fn operate<F>(&self, key: &K, decide: F) -> Result<Option<V>>
    where
        F: FnOnce(Option<&V>) -> Decision<V>,
    {
        let mut guard = self.root.write()?;
        let current = guard.root.get(key);
        match decide(current) {
            Decision::Abort => Ok(None),
            Decision::Remove => {
                let mut next = guard.root.clone();
                let previous = next.remove(key);
                if previous.is_some() {
                    let version = guard.version + 1;
                    *guard = Arc::new(RootReference { root: next, version });
                }
                Ok(previous)
            }
            Decision::Put(value) => {
                let mut next = guard.root.clone();
                let previous = next.insert(key.clone(), value);
                let version = guard.version + 1;
                *guard = Arc::new(RootReference { root: next, version });
                Ok(previous)
            }
        }
    }

    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.operate(&key, |_| Decision::Put(value))
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.operate(key, |_| Decision::Remove)
    }

    /// Insert only if the key is absent; returns the existing value otherwise
    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        let mut existing = None;
        self.operate(&key, |current| match current {
            Some(v) => {
                existing = Some(v.clone());
                Decision::Abort
            }
            None => Decision::Put(value),
        })?;
        Ok(existing)
    }

    /// Replace the value only if it still equals `expected` (compare-and-swap)
    pub fn replace(&self, key: &K, expected: &V, value: V) -> Result<bool>
    where
        V: PartialEq,
    {
        let mut swapped = false;
        self.operate(key, |current| match current {
            Some(v) if v == expected => {
                swapped = true;
                Decision::Put(value)
            }
            _ => Decision::Abort,
        })?;
        Ok(swapped)
    }

    pub fn clear(&self) -> Result<()> {
        let mut guard = self.root.write()?;
        if !guard.root.is_empty() {
            let version = guard.version + 1;
            *guard = Arc::new(RootReference { root: OrdMap::new(), version });
        }
        Ok(())
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.get_root()?.total_count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    pub fn version(&self) -> Result<u64> {
        Ok(self.get_root()?.version())
    }

    /// Forward cursor over the current root
    pub fn cursor(&self, from: Option<&K>) -> Result<Cursor<K, V>> {
        Ok(self.get_root()?.cursor(from))
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        Ok(self.get_root()?.root.iter().next().map(|(k, _)| k.clone()))
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        Ok(self.get_root()?.root.iter().next_back().map(|(k, _)| k.clone()))
    }

    /// Smallest key strictly greater than `key`
    pub fn higher_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate((Bound::Excluded(key.clone()), Bound::Unbounded), false)
    }

    /// Smallest key greater than or equal to `key`
    pub fn ceiling_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate((Bound::Included(key.clone()), Bound::Unbounded), false)
    }

    /// Largest key strictly smaller than `key`
    pub fn lower_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate((Bound::Unbounded, Bound::Excluded(key.clone())), true)
    }

    /// Largest key smaller than or equal to `key`
    pub fn floor_key(&self, key: &K) -> Result<Option<K>> {
        self.navigate((Bound::Unbounded, Bound::Included(key.clone())), true)
    }

    fn navigate(&self, range: (Bound<K>, Bound<K>), backwards: bool) -> Result<Option<K>> {
        let root = self.get_root()?;
        let mut iter = root.root.range(range);
        let found = if backwards { iter.next_back() } else { iter.next() };
        Ok(found.map(|(k, _)| k.clone()))
    }
}
