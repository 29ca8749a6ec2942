//! The collection store.
//!
//! [`LocalStore`] keeps every collection in memory and persists mutations to a
//! checksummed journal on a [`StorageBackend`]. Opening a store replays the
//! journal; a torn tail left by a crash is cut off so the last complete entry
//! wins.

use crate::backend::StorageBackend;
use crate::clock::{Clock, SystemClock};
use crate::dir::StoreDir;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::journal::{self, JournalEntry, JournalOp, Snapshot};
use crate::key::{IndexValue, RecordKey};
use crate::memory::InMemoryBackend;
use crate::query::Query;
use crate::schema::{CollectionSchema, IndexSchema, StoreSchema};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// A stored record: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Field holding a record's primary key.
pub const KEY_FIELD: &str = "id";

/// Field stamped with the write time by [`LocalStore::put`].
pub const UPDATED_AT_FIELD: &str = "updatedAt";

const DEFAULT_QUOTA_BYTES: u64 = 50 * 1024 * 1024;
const COMPACT_FILE: &str = "journal.log.compact";

/// Configuration for a [`LocalStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum journal size in bytes. Default: 50 MiB.
    pub quota_bytes: u64,
    /// Call `sync` (rather than `flush`) after every write. Default: true.
    pub sync_on_write: bool,
    /// Create the store directory if it does not exist. Default: true.
    pub create_if_missing: bool,
    /// Source of `updatedAt` timestamps.
    pub clock: Arc<dyn Clock>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            quota_bytes: DEFAULT_QUOTA_BYTES,
            sync_on_write: true,
            create_if_missing: true,
            clock: Arc::new(SystemClock),
        }
    }
}

impl StoreConfig {
    /// Sets the quota.
    #[must_use]
    pub fn with_quota_bytes(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// Sets whether every write is synced.
    #[must_use]
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets whether a missing directory is created.
    #[must_use]
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Storage usage against the configured quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    /// Bytes used by the journal.
    pub usage: u64,
    /// Configured quota in bytes.
    pub quota: u64,
}

impl StorageEstimate {
    /// Fraction of the quota in use. A zero quota counts as full.
    pub fn ratio(&self) -> f64 {
        if self.quota == 0 {
            return 1.0;
        }
        self.usage as f64 / self.quota as f64
    }
}

#[derive(Debug, Clone)]
enum BatchOp {
    Put {
        collection: String,
        record: Value,
        stamp: bool,
    },
    Delete {
        collection: String,
        key: RecordKey,
    },
    Clear {
        collection: String,
    },
}

/// A group of writes committed as one journal entry.
///
/// Either every write in the batch is applied or none is. Validation errors
/// (unknown collection, missing key) reject the whole batch before anything
/// is written.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a record and stamps `updatedAt`.
    pub fn put(&mut self, collection: impl Into<String>, record: Value) -> &mut Self {
        self.ops.push(BatchOp::Put {
            collection: collection.into(),
            record,
            stamp: true,
        });
        self
    }

    /// Upserts a record exactly as given, keeping its own `updatedAt`.
    ///
    /// Used for authoritative copies received from a server.
    pub fn put_verbatim(&mut self, collection: impl Into<String>, record: Value) -> &mut Self {
        self.ops.push(BatchOp::Put {
            collection: collection.into(),
            record,
            stamp: false,
        });
        self
    }

    /// Deletes a record. Deleting a missing key is not an error.
    pub fn delete(&mut self, collection: impl Into<String>, key: impl Into<RecordKey>) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            collection: collection.into(),
            key: key.into(),
        });
        self
    }

    /// Removes every record of a collection.
    pub fn clear(&mut self, collection: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Clear {
            collection: collection.into(),
        });
        self
    }

    /// Number of writes in the batch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch has no writes.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

type IndexMap = BTreeMap<IndexValue, BTreeSet<RecordKey>>;

#[derive(Debug)]
struct CollectionState {
    schema: CollectionSchema,
    records: BTreeMap<RecordKey, Document>,
    indexes: HashMap<String, IndexMap>,
}

impl CollectionState {
    fn new(schema: CollectionSchema) -> Self {
        let indexes = schema
            .indexes
            .iter()
            .map(|i| (i.name.clone(), IndexMap::new()))
            .collect();
        Self {
            schema,
            records: BTreeMap::new(),
            indexes,
        }
    }

    fn add_index(&mut self, index: &IndexSchema) {
        let mut map = IndexMap::new();
        for (key, record) in &self.records {
            map.entry(IndexValue::from_field(record.get(&index.field)))
                .or_default()
                .insert(key.clone());
        }
        self.indexes.insert(index.name.clone(), map);
        self.schema.indexes.push(index.clone());
    }

    fn unindex(&mut self, key: &RecordKey, record: &Document) {
        for index in &self.schema.indexes {
            let value = IndexValue::from_field(record.get(&index.field));
            if let Some(map) = self.indexes.get_mut(&index.name) {
                if let Some(keys) = map.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        map.remove(&value);
                    }
                }
            }
        }
    }

    fn put(&mut self, record: Document) {
        let Some(key) = record.get(KEY_FIELD).and_then(RecordKey::from_value) else {
            return;
        };

        if let Some(old) = self.records.remove(&key) {
            self.unindex(&key, &old);
        }

        for index in &self.schema.indexes {
            self.indexes
                .entry(index.name.clone())
                .or_default()
                .entry(IndexValue::from_field(record.get(&index.field)))
                .or_default()
                .insert(key.clone());
        }
        self.records.insert(key, record);
    }

    fn delete(&mut self, key: &RecordKey) {
        if let Some(old) = self.records.remove(key) {
            self.unindex(key, &old);
        }
    }

    fn clear(&mut self) {
        self.records.clear();
        for map in self.indexes.values_mut() {
            map.clear();
        }
    }
}

#[derive(Debug, Default)]
struct State {
    schema: StoreSchema,
    collections: BTreeMap<String, CollectionState>,
}

impl State {
    fn collection(&self, name: &str) -> StorageResult<&CollectionState> {
        self.collections
            .get(name)
            .ok_or_else(|| StorageError::unknown_collection(name))
    }

    fn provision(&mut self, schema: &StoreSchema) {
        self.schema.merge(schema);
        for declared in &self.schema.collections {
            match self.collections.get_mut(&declared.name) {
                Some(existing) => {
                    for index in &declared.indexes {
                        if existing.schema.find_index(&index.name).is_none() {
                            existing.add_index(index);
                        }
                    }
                }
                None => {
                    self.collections
                        .insert(declared.name.clone(), CollectionState::new(declared.clone()));
                }
            }
        }
    }

    fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::Provision { schema } => self.provision(&schema),
            JournalOp::Put { collection, record } => {
                if let Some(c) = self.collections.get_mut(&collection) {
                    c.put(record);
                }
            }
            JournalOp::Delete { collection, key } => {
                if let Some(c) = self.collections.get_mut(&collection) {
                    c.delete(&key);
                }
            }
            JournalOp::Clear { collection } => {
                if let Some(c) = self.collections.get_mut(&collection) {
                    c.clear();
                }
            }
        }
    }

    fn restore(snapshot: Snapshot) -> Self {
        let mut state = State::default();
        state.provision(&snapshot.schema);
        for (name, records) in snapshot.collections {
            if let Some(c) = state.collections.get_mut(&name) {
                for record in records {
                    c.put(record);
                }
            }
        }
        state
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            schema: self.schema.clone(),
            collections: self
                .collections
                .iter()
                .map(|(name, c)| (name.clone(), c.records.values().cloned().collect()))
                .collect(),
        }
    }

    /// Validates batch ops and turns them into journal ops.
    fn prepare(&self, ops: Vec<BatchOp>, now: i64) -> StorageResult<Vec<JournalOp>> {
        ops.into_iter()
            .map(|op| match op {
                BatchOp::Put {
                    collection,
                    record,
                    stamp,
                } => {
                    self.collection(&collection)?;
                    let Value::Object(mut record) = record else {
                        return Err(StorageError::NotAnObject { collection });
                    };
                    if record
                        .get(KEY_FIELD)
                        .and_then(RecordKey::from_value)
                        .is_none()
                    {
                        return Err(StorageError::MissingKey { collection });
                    }
                    if stamp {
                        record.insert(UPDATED_AT_FIELD.to_string(), Value::from(now));
                    }
                    Ok(JournalOp::Put { collection, record })
                }
                BatchOp::Delete { collection, key } => {
                    self.collection(&collection)?;
                    Ok(JournalOp::Delete { collection, key })
                }
                BatchOp::Clear { collection } => {
                    self.collection(&collection)?;
                    Ok(JournalOp::Clear { collection })
                }
            })
            .collect()
    }
}

/// A durable store of JSON records organised into collections.
///
/// All methods take `&self`; the store is safe to share behind an `Arc`.
/// Writers are serialised, and a reader never observes half of a write.
///
/// # Example
///
/// ```rust
/// use offsync_storage::{CollectionSchema, InMemoryBackend, LocalStore, StoreConfig, StoreSchema};
/// use serde_json::json;
///
/// let backend = InMemoryBackend::new();
/// let schema = StoreSchema::new().collection(CollectionSchema::records("tasks"));
///
/// let store = LocalStore::with_backend(Box::new(backend.clone()), StoreConfig::default()).unwrap();
/// store.provision(&schema).unwrap();
/// store.put("tasks", json!({"id": "a", "title": "draft"})).unwrap();
/// drop(store);
///
/// // Reopen over the same bytes.
/// let store = LocalStore::with_backend(Box::new(backend), StoreConfig::default()).unwrap();
/// assert!(store.get("tasks", "a").unwrap().is_some());
/// ```
pub struct LocalStore {
    state: RwLock<State>,
    backend: Mutex<Box<dyn StorageBackend>>,
    config: StoreConfig,
    dir: Option<StoreDir>,
}

impl LocalStore {
    /// Creates an empty store over an in-memory backend.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(State::default()),
            backend: Mutex::new(Box::new(InMemoryBackend::new())),
            config: StoreConfig::default(),
            dir: None,
        }
    }

    /// Opens a store over a backend, replaying its journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or the torn tail cannot
    /// be truncated.
    pub fn with_backend(
        mut backend: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> StorageResult<Self> {
        let state = recover(backend.as_mut())?;
        Ok(Self {
            state: RwLock::new(state),
            backend: Mutex::new(backend),
            config,
            dir: None,
        })
    }

    /// Opens a file-backed store in `path`, taking the directory lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process has the store open.
    pub fn open_dir(path: &Path, config: StoreConfig) -> StorageResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let backend = FileBackend::open(&dir.journal_path())?;
        let mut store = Self::with_backend(Box::new(backend), config)?;
        tracing::debug!(path = %path.display(), "opened store directory");
        store.dir = Some(dir);
        Ok(store)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the current time according to the store's clock.
    pub fn now_millis(&self) -> i64 {
        self.config.clock.now_millis()
    }

    /// Declares collections and indexes.
    ///
    /// Idempotent: declarations already present are left alone, so this is
    /// safe to call on every startup. New indexes on existing collections are
    /// built from the records already stored.
    pub fn provision(&self, schema: &StoreSchema) -> StorageResult<()> {
        let mut state = self.state.write();

        let mut merged = state.schema.clone();
        merged.merge(schema);
        if merged == state.schema {
            return Ok(());
        }

        self.commit(&mut state, vec![JournalOp::Provision { schema: merged }])?;
        tracing::debug!(
            collections = state.collections.len(),
            "provisioned store schema"
        );
        Ok(())
    }

    /// Returns the current schema.
    pub fn schema(&self) -> StoreSchema {
        self.state.read().schema.clone()
    }

    /// Returns the names of all collections.
    pub fn collections(&self) -> Vec<String> {
        self.state.read().collections.keys().cloned().collect()
    }

    /// Fetches one record by primary key.
    pub fn get(
        &self,
        collection: &str,
        key: impl Into<RecordKey>,
    ) -> StorageResult<Option<Document>> {
        let state = self.state.read();
        let key = key.into();
        Ok(state.collection(collection)?.records.get(&key).cloned())
    }

    /// Runs a query over a collection.
    ///
    /// # Errors
    ///
    /// - [`StorageError::UnknownCollection`] if the collection was never
    ///   provisioned
    /// - [`StorageError::UnknownIndex`] if the query names a missing index
    pub fn get_all(&self, collection: &str, query: &Query) -> StorageResult<Vec<Document>> {
        let state = self.state.read();
        let c = state.collection(collection)?;

        let candidates: Vec<Document> = match &query.index {
            Some((name, value)) => {
                let map = c.indexes.get(name).ok_or_else(|| StorageError::UnknownIndex {
                    collection: collection.to_string(),
                    index: name.clone(),
                })?;
                map.get(value)
                    .map(|keys| {
                        keys.iter()
                            .filter_map(|k| c.records.get(k).cloned())
                            .collect()
                    })
                    .unwrap_or_default()
            }
            None => c.records.values().cloned().collect(),
        };

        Ok(query.finish(candidates))
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: &str) -> StorageResult<usize> {
        Ok(self.state.read().collection(collection)?.records.len())
    }

    /// Upserts a record by its `id` and stamps `updatedAt`.
    ///
    /// Returns the record as stored.
    pub fn put(&self, collection: &str, record: Value) -> StorageResult<Document> {
        let mut batch = WriteBatch::new();
        batch.put(collection, record);
        let mut state = self.state.write();
        let ops = state.prepare(batch.ops, self.now_millis())?;
        let stored = match ops.first() {
            Some(JournalOp::Put { record, .. }) => record.clone(),
            _ => Document::new(),
        };
        self.commit(&mut state, ops)?;
        Ok(stored)
    }

    /// Deletes a record. Returns whether it existed.
    pub fn delete(&self, collection: &str, key: impl Into<RecordKey>) -> StorageResult<bool> {
        let key = key.into();
        let mut state = self.state.write();
        if !state.collection(collection)?.records.contains_key(&key) {
            return Ok(false);
        }
        self.commit(
            &mut state,
            vec![JournalOp::Delete {
                collection: collection.to_string(),
                key,
            }],
        )?;
        Ok(true)
    }

    /// Removes every record of a collection.
    pub fn clear(&self, collection: &str) -> StorageResult<()> {
        let mut state = self.state.write();
        state.collection(collection)?;
        self.commit(
            &mut state,
            vec![JournalOp::Clear {
                collection: collection.to_string(),
            }],
        )
    }

    /// Commits a batch atomically.
    pub fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        let ops = state.prepare(batch.ops, self.now_millis())?;
        self.commit(&mut state, ops)
    }

    /// Reports journal usage against the quota.
    pub fn estimate(&self) -> StorageResult<StorageEstimate> {
        Ok(StorageEstimate {
            usage: self.backend.lock().size()?,
            quota: self.config.quota_bytes,
        })
    }

    /// Rewrites the journal as one snapshot entry. Returns the bytes reclaimed.
    ///
    /// For a store opened with [`open_dir`](Self::open_dir) the snapshot is
    /// written to a side file and renamed over the journal, so a crash leaves
    /// either the old or the new journal. Other backends are truncated and
    /// rewritten in place.
    pub fn compact(&self) -> StorageResult<u64> {
        let state = self.state.write();
        let bytes = JournalEntry::Snapshot(state.snapshot()).encode()?;

        let mut backend = self.backend.lock();
        let before = backend.size()?;

        match &self.dir {
            Some(dir) => {
                let side = dir.path().join(COMPACT_FILE);
                if side.exists() {
                    fs::remove_file(&side)?;
                }
                {
                    let mut fresh = FileBackend::open(&side)?;
                    fresh.append(&bytes)?;
                    fresh.sync()?;
                }
                fs::rename(&side, dir.journal_path())?;
                *backend = Box::new(FileBackend::open(&dir.journal_path())?);
            }
            None => {
                backend.truncate(0)?;
                backend.append(&bytes)?;
                backend.sync()?;
            }
        }

        let after = backend.size()?;
        tracing::info!(before, after, "compacted journal");
        Ok(before.saturating_sub(after))
    }

    /// Appends ops as one journal entry, then applies them.
    fn commit(&self, state: &mut State, ops: Vec<JournalOp>) -> StorageResult<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let entry = JournalEntry::Ops(ops);
        let bytes = entry.encode()?;

        {
            let mut backend = self.backend.lock();
            let usage = backend.size()?;
            let requested = bytes.len() as u64;
            if usage.saturating_add(requested) > self.config.quota_bytes {
                return Err(StorageError::QuotaExceeded {
                    usage,
                    requested,
                    quota: self.config.quota_bytes,
                });
            }

            // An entry that fails to land is cut off again, so it cannot
            // reappear on the next open.
            let written = backend.append(&bytes).and_then(|_| {
                if self.config.sync_on_write {
                    backend.sync()
                } else {
                    backend.flush()
                }
            });
            if let Err(err) = written {
                let _ = backend.truncate(usage);
                return Err(err);
            }
        }

        if let JournalEntry::Ops(ops) = entry {
            for op in ops {
                state.apply(op);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("collections", &self.collections())
            .field("config", &self.config)
            .field("dir", &self.dir.as_ref().map(StoreDir::path))
            .finish()
    }
}

fn recover(backend: &mut dyn StorageBackend) -> StorageResult<State> {
    let size = backend.size()?;
    if size == 0 {
        return Ok(State::default());
    }

    let bytes = backend.read_all()?;
    let scan = journal::scan(&bytes);

    if let Some(reason) = &scan.stopped {
        tracing::warn!(
            valid_len = scan.valid_len,
            discarded = size - scan.valid_len,
            %reason,
            "discarding torn journal tail"
        );
        backend.truncate(scan.valid_len)?;
        backend.sync()?;
    }

    let mut state = State::default();
    let entries = scan.entries.len();
    for entry in scan.entries {
        match entry {
            JournalEntry::Snapshot(snapshot) => state = State::restore(snapshot),
            JournalEntry::Ops(ops) => {
                for op in ops {
                    state.apply(op);
                }
            }
        }
    }

    tracing::debug!(entries, bytes = scan.valid_len, "replayed journal");
    Ok(state)
}
