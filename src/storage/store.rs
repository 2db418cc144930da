// ============================================================================
// Versioned Store
// ============================================================================
//
// Registry of named copy-on-write maps. Maps are created lazily and typed at
// open time; maps loaded from a snapshot file stay encoded until the first
// `open_map::<K, V>` decodes them. The store also tracks which versions are
// pinned by in-flight statements (`TxCounter`) and persists a consistent
// image of all maps on `commit()` when a path is configured.
//
// ============================================================================

use super::epoch::{Epoch, stable_sample};
use super::map::{MvMap, RootReference};
use super::persistence::{MapImage, SnapshotFile, StoreImage};
use crate::config::StoreConfig;
use crate::core::{DbError, Result};
use im::OrdMap;
use log::{debug, info};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub const TEMP_MAP_PREFIX: &str = "temp.";

/// Type-erased view of a registered map, used for persistence and downcasting
pub trait StoredMap: Send + Sync {
    fn map_id(&self) -> u32;
    fn map_name(&self) -> &str;
    fn pin(&self) -> Result<Box<dyn PinnedRoot>>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A pinned root of some map; identity is the address of the published root
pub trait PinnedRoot: Send {
    fn identity(&self) -> *const ();
    fn encode(&self) -> Result<Vec<u8>>;
}

impl<K, V> PinnedRoot for Arc<RootReference<K, V>>
where
    K: Ord + Clone + Serialize + Send + Sync,
    V: Clone + Serialize + Send + Sync,
{
    fn identity(&self) -> *const () {
        Arc::as_ptr(self) as *const ()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let entries: Vec<(&K, &V)> = self.root().iter().collect();
        Ok(rmp_serde::to_vec(&entries)?)
    }
}

impl<K, V> StoredMap for MvMap<K, V>
where
    K: Ord + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn map_id(&self) -> u32 {
        self.id()
    }

    fn map_name(&self) -> &str {
        self.name()
    }

    fn pin(&self) -> Result<Box<dyn PinnedRoot>> {
        Ok(Box::new(self.get_root()?))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Handle on a pinned store version; returned to the store when the statement ends
#[derive(Debug, PartialEq, Eq)]
pub struct TxCounter {
    version: u64,
}

impl TxCounter {
    pub fn version(&self) -> u64 {
        self.version
    }
}

struct PendingMap {
    id: u32,
    entries: Vec<u8>,
}

#[derive(Default)]
struct MapRegistry {
    open: HashMap<String, Arc<dyn StoredMap>>,
    pending: HashMap<String, PendingMap>,
    names: HashMap<u32, String>,
    next_map_id: u32,
}

struct PinnedImage(Vec<(u32, String, Box<dyn PinnedRoot>)>);

impl Epoch for PinnedImage {
    fn same_epoch(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.2.identity() == b.2.identity())
    }
}

pub struct MvStore {
    config: StoreConfig,
    registry: RwLock<MapRegistry>,
    version: AtomicU64,
    version_usage: Mutex<BTreeMap<u64, usize>>,
    temp_counter: AtomicU64,
    persist_lock: Mutex<()>,
    closed: AtomicBool,
}

impl MvStore {
    /// Open a store, loading the snapshot file when the config names one
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut registry = MapRegistry { next_map_id: 1, ..Default::default() };
        let mut version = 0;

        if let Some(path) = &config.path
            && let Some(image) = SnapshotFile::new(path).load()?
        {
            info!("Loaded store image version {} with {} maps", image.version, image.maps.len());
            version = image.version;
            registry.next_map_id = image.next_map_id;
            for map in image.maps {
                registry.names.insert(map.id, map.name.clone());
                registry.pending.insert(map.name, PendingMap { id: map.id, entries: map.entries });
            }
        }

        Ok(Self {
            config,
            registry: RwLock::new(registry),
            version: AtomicU64::new(version),
            version_usage: Mutex::new(BTreeMap::new()),
            temp_counter: AtomicU64::new(0),
            persist_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Purely in-memory store
    pub fn in_memory() -> Self {
        Self {
            config: StoreConfig::new(),
            registry: RwLock::new(MapRegistry { next_map_id: 1, ..Default::default() }),
            version: AtomicU64::new(0),
            version_usage: Mutex::new(BTreeMap::new()),
            temp_counter: AtomicU64::new(0),
            persist_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::StoreClosed);
        }
        Ok(())
    }

    /// Open (or create) a map with concrete key and value types
    pub fn open_map<K, V>(&self, name: &str) -> Result<Arc<MvMap<K, V>>>
    where
        K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.check_open()?;
        {
            let registry = self.registry.read()?;
            if let Some(existing) = registry.open.get(name) {
                return downcast(name, Arc::clone(existing));
            }
        }

        let mut registry = self.registry.write()?;
        if let Some(existing) = registry.open.get(name) {
            return downcast(name, Arc::clone(existing));
        }

        let map = if let Some(pending) = registry.pending.get(name) {
            let entries: Vec<(K, V)> = rmp_serde::from_slice(&pending.entries)?;
            let id = pending.id;
            let mut root = OrdMap::new();
            for (key, value) in entries {
                root.insert(key, value);
            }
            registry.pending.remove(name);
            debug!("Decoded map '{}' ({} entries)", name, root.len());
            Arc::new(MvMap::with_root(id, name, root))
        } else {
            let id = registry.next_map_id;
            registry.next_map_id += 1;
            registry.names.insert(id, name.to_string());
            debug!("Created map '{}' with id {}", name, id);
            Arc::new(MvMap::new(id, name))
        };
        registry.open.insert(name.to_string(), map.clone() as Arc<dyn StoredMap>);
        Ok(map)
    }

    pub fn map_name(&self, id: u32) -> Result<Option<String>> {
        Ok(self.registry.read()?.names.get(&id).cloned())
    }

    pub fn has_map(&self, name: &str) -> Result<bool> {
        let registry = self.registry.read()?;
        Ok(registry.open.contains_key(name) || registry.pending.contains_key(name))
    }

    pub fn map_names(&self) -> Result<Vec<String>> {
        let registry = self.registry.read()?;
        let mut names: Vec<String> = registry.names.values().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn remove_map(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.write()?;
        let id = match (registry.open.remove(name), registry.pending.remove(name)) {
            (Some(map), _) => map.map_id(),
            (None, Some(pending)) => pending.id,
            (None, None) => return Err(DbError::MapNotFound(name.to_string())),
        };
        registry.names.remove(&id);
        debug!("Removed map '{}'", name);
        Ok(())
    }

    /// Scratch map that is never persisted
    pub fn create_temp_map<K, V>(&self) -> Result<Arc<MvMap<K, V>>>
    where
        K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.open_map(&format!("{}{}", TEMP_MAP_PREFIX, n))
    }

    /// Drop every temp map, including leftovers found in a loaded image
    pub fn remove_temp_maps(&self) -> Result<usize> {
        let temp_names: Vec<String> = self
            .map_names()?
            .into_iter()
            .filter(|name| name.starts_with(TEMP_MAP_PREFIX))
            .collect();
        for name in &temp_names {
            self.remove_map(name)?;
        }
        Ok(temp_names.len())
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Pin the current version for the duration of a statement
    pub fn register_version_usage(&self) -> Result<TxCounter> {
        let mut usage = self.version_usage.lock()?;
        let version = self.current_version();
        *usage.entry(version).or_insert(0) += 1;
        Ok(TxCounter { version })
    }

    pub fn deregister_version_usage(&self, counter: TxCounter) -> Result<()> {
        let mut usage = self.version_usage.lock()?;
        if let Some(count) = usage.get_mut(&counter.version) {
            *count -= 1;
            if *count == 0 {
                usage.remove(&counter.version);
            }
        }
        Ok(())
    }

    /// Oldest version still pinned by a statement, or the current one
    pub fn oldest_version_in_use(&self) -> Result<u64> {
        let usage = self.version_usage.lock()?;
        Ok(usage.keys().next().copied().unwrap_or_else(|| self.current_version()))
    }

    /// Close the current version and persist it when the store is backed by a file
    pub fn commit(&self) -> Result<u64> {
        self.check_open()?;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        if self.config.path.is_some() && !self.config.read_only {
            self.persist(version)?;
        }
        Ok(version)
    }

    fn persist(&self, version: u64) -> Result<()> {
        let Some(path) = &self.config.path else {
            return Ok(());
        };
        let _serialized = self.persist_lock.lock()?;

        let (pinned, pending, next_map_id) = {
            let registry = self.registry.read()?;
            let mut open: Vec<&Arc<dyn StoredMap>> = registry
                .open
                .values()
                .filter(|map| !map.map_name().starts_with(TEMP_MAP_PREFIX))
                .collect();
            open.sort_by_key(|map| map.map_id());

            let pinned = stable_sample(|| {
                let mut roots = Vec::with_capacity(open.len());
                for map in &open {
                    roots.push((map.map_id(), map.map_name().to_string(), map.pin()?));
                }
                Ok(PinnedImage(roots))
            })?;

            let pending: Vec<MapImage> = registry
                .pending
                .iter()
                .filter(|(name, _)| !name.starts_with(TEMP_MAP_PREFIX))
                .map(|(name, map)| MapImage { id: map.id, name: name.clone(), entries: map.entries.clone() })
                .collect();
            (pinned, pending, registry.next_map_id)
        };

        let mut maps = pending;
        for (id, name, root) in pinned.0 {
            maps.push(MapImage { id, name, entries: root.encode()? });
        }
        SnapshotFile::new(path).save(&StoreImage::new(version, next_map_id, maps))?;
        debug!("Persisted store version {}", version);
        Ok(())
    }

    /// Persist a final image (when file backed) and refuse further use
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.config.path.is_some() && !self.config.read_only {
            self.persist(self.current_version())?;
        }
        info!("Store closed at version {}", self.current_version());
        Ok(())
    }
}

impl Default for MvStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn downcast<K, V>(name: &str, map: Arc<dyn StoredMap>) -> Result<Arc<MvMap<K, V>>>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    map.into_any().downcast::<MvMap<K, V>>().map_err(|_| {
        DbError::TypeMismatch(format!("Map '{}' is already open with different key/value types", name))
    })
}
