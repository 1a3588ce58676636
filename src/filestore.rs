//! In-memory write-back cache over [`crate::partstore::PartStore`].
//!
//! # Locking discipline
//!
//! A single store-wide mutex (`cache`) guards only the `(zoneId, name) ->
//! slot` map and each slot's pin count. Each slot additionally owns its own
//! mutex (`EntryHandle::state`). To operate on a file, every public method
//! here:
//!
//! 1. locks the store, gets-or-creates the slot, increments its pin count,
//!    clones the `Arc<Mutex<CacheEntry>>`, unlocks the store;
//! 2. locks the entry;
//! 3. does the work (including, where needed, persistence I/O);
//! 4. unlocks the entry;
//! 5. locks the store, decrements the pin count, and removes the slot if it
//!    is now unpinned and clean.
//!
//! No operation ever holds both locks at once while doing I/O — I/O only
//! ever happens under an entry lock. [`PinGuard`] makes steps 1 and 5 an RAII
//! pair so every pin is released on every exit path, including panics.
//!
//! A clean entry (`CacheEntry::file == None`) means "no dirty data — reads
//! go straight to persistence"; a dirty entry holds a full in-memory working
//! copy of the file's metadata plus whichever data parts have been touched
//! since the last flush.

pub mod cache;
pub mod circular;
pub mod ijson;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value as Json;

use crate::broker::{Broker, BrokerEvent, FileOp};
use crate::config::Config;
use crate::error::{ErrorList, FilestoreError, FilestoreResult};
use crate::partstore::{DataPart, FileMeta, FileOpts, PartStore};

use cache::{CacheEntry, EntryHandle};

type Key = (String, String);

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const FLUSH_BUDGET: Duration = Duration::from_secs(2);
const MAX_FLUSH_ERRORS: u32 = 3;

struct Slot {
    entry: Arc<EntryHandle>,
    pin_count: usize,
}

/// The write-cached append log.
pub struct Filestore {
    part_store: Arc<PartStore>,
    cache: Mutex<HashMap<Key, Slot>>,
    is_flushing: AtomicBool,
    part_data_size: usize,
    shutdown: Arc<AtomicBool>,
    wake: Arc<(Mutex<()>, Condvar)>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    broker: Option<Arc<Broker>>,
}

/// RAII pin: acquired in [`Filestore::pin`], releases (and possibly evicts)
/// the slot on drop regardless of how the scope exits.
struct PinGuard<'a> {
    store: &'a Filestore,
    key: Key,
    entry: Arc<EntryHandle>,
}

impl<'a> Drop for PinGuard<'a> {
    fn drop(&mut self) {
        self.store.release(&self.key);
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

impl Filestore {
    pub fn open(config: &Config) -> FilestoreResult<Arc<Self>> {
        let part_store = Arc::new(PartStore::open(&config.db_path())?);
        Ok(Self::from_part_store(part_store, config.part_data_size, None))
    }

    pub fn open_in_memory(part_data_size: usize, broker: Option<Arc<Broker>>) -> FilestoreResult<Arc<Self>> {
        let part_store = Arc::new(PartStore::open_in_memory()?);
        Ok(Self::from_part_store(part_store, part_data_size, broker))
    }

    fn from_part_store(
        part_store: Arc<PartStore>,
        part_data_size: usize,
        broker: Option<Arc<Broker>>,
    ) -> Arc<Self> {
        let store = Arc::new(Filestore {
            part_store,
            cache: Mutex::new(HashMap::new()),
            is_flushing: AtomicBool::new(false),
            part_data_size,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new((Mutex::new(()), Condvar::new())),
            flusher: Mutex::new(None),
            broker,
        });
        store.start_flusher();
        store
    }

    pub fn set_broker(&mut self, broker: Arc<Broker>) {
        self.broker = Some(broker);
    }

    fn start_flusher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let wake = self.wake.clone();
        let handle = std::thread::spawn(move || loop {
            {
                let (lock, cvar) = &*wake;
                let guard = lock.lock().unwrap();
                let _ = cvar.wait_timeout(guard, FLUSH_INTERVAL).unwrap();
            }
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Some(store) = weak.upgrade() {
                let _ = store.flush_cache(FLUSH_BUDGET);
            } else {
                break;
            }
        });
        *self.flusher.lock().unwrap() = Some(handle);
    }

    /// Stop the flusher thread and perform one last flush pass.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.1.notify_all();
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
        let _ = self.flush_cache(FLUSH_BUDGET);
    }

    fn pin(&self, key: Key) -> PinGuard<'_> {
        let entry = {
            let mut cache = self.cache.lock().unwrap();
            let slot = cache.entry(key.clone()).or_insert_with(|| Slot {
                entry: Arc::new(EntryHandle::new()),
                pin_count: 0,
            });
            slot.pin_count += 1;
            slot.entry.clone()
        };
        PinGuard { store: self, key, entry }
    }

    fn release(&self, key: &Key) {
        let mut cache = self.cache.lock().unwrap();
        if let Some(slot) = cache.get_mut(key) {
            slot.pin_count = slot.pin_count.saturating_sub(1);
            if slot.pin_count == 0 {
                let clean = !slot.entry.state.lock().unwrap().is_dirty();
                if clean {
                    cache.remove(key);
                }
            }
        }
    }

    fn publish_fileop(&self, zone_id: &str, name: &str, fileop: FileOp) {
        if let Some(broker) = &self.broker {
            broker.publish(BrokerEvent::file_change(zone_id, name, fileop));
        }
    }

    // ---- metadata operations -------------------------------------------------

    pub fn make_file(&self, zone_id: &str, name: &str, meta: Json, opts: FileOpts) -> FilestoreResult<()> {
        validate_opts(&opts)?;
        let mut opts = opts;
        if opts.circular {
            opts.max_size = circular::round_up_max_size(opts.max_size, self.part_data_size);
        }
        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let mut entry = guard.entry.state.lock().unwrap();
        let ts = now_ms();
        let file = FileMeta {
            zone_id: zone_id.to_string(),
            name: name.to_string(),
            created_ts: ts,
            mod_ts: ts,
            size: 0,
            opts,
            meta,
        };
        self.part_store.insert_file(&file)?;
        // inserted straight to disk; entry stays clean.
        entry.file = None;
        entry.data_entries.clear();
        Ok(())
    }

    pub fn delete_file(&self, zone_id: &str, name: &str) -> FilestoreResult<()> {
        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let mut entry = guard.entry.state.lock().unwrap();
        self.part_store.delete_file(zone_id, name)?;
        entry.file = None;
        entry.data_entries.clear();
        entry.flush_errors = 0;
        Ok(())
    }

    pub fn delete_zone(&self, zone_id: &str) -> Result<(), ErrorList<FilestoreError>> {
        let names = self.part_store.get_zone_file_names(zone_id).map_err(|e| ErrorList(vec![e]))?;
        let mut errors = Vec::new();
        for name in names {
            if let Err(e) = self.delete_file(zone_id, &name) {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ErrorList(errors))
        }
    }

    pub fn stat(&self, zone_id: &str, name: &str) -> FilestoreResult<FileMeta> {
        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let entry = guard.entry.state.lock().unwrap();
        if let Some(file) = &entry.file {
            return Ok(file.clone());
        }
        drop(entry);
        self.part_store
            .get_file(zone_id, name)?
            .ok_or_else(|| FilestoreError::not_exist(zone_id, name))
    }

    pub fn list_files(&self, zone_id: &str) -> FilestoreResult<Vec<FileMeta>> {
        let mut files = self.part_store.get_zone_files(zone_id)?;
        let cache = self.cache.lock().unwrap();
        for (key, slot) in cache.iter() {
            if key.0 != zone_id {
                continue;
            }
            if let Some(dirty) = &slot.entry.state.lock().unwrap().file {
                if let Some(existing) = files.iter_mut().find(|f| f.name == key.1) {
                    *existing = dirty.clone();
                } else {
                    files.push(dirty.clone());
                }
            }
        }
        Ok(files)
    }

    pub fn write_meta(&self, zone_id: &str, name: &str, meta: Json, merge: bool) -> FilestoreResult<()> {
        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let mut entry = guard.entry.state.lock().unwrap();
        self.ensure_dirty(&mut entry, zone_id, name)?;
        let file = entry.file.as_mut().unwrap();
        if merge {
            merge_meta(&mut file.meta, &meta);
        } else {
            file.meta = meta;
        }
        file.mod_ts = now_ms();
        Ok(())
    }

    // ---- data operations ------------------------------------------------------

    pub fn write_file(&self, zone_id: &str, name: &str, data: &[u8]) -> FilestoreResult<()> {
        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let mut entry = guard.entry.state.lock().unwrap();
        self.ensure_dirty(&mut entry, zone_id, name)?;
        {
            let file = entry.file.as_mut().unwrap();
            if file.opts.circular {
                return Err(FilestoreError::InvalidArgument(
                    "write_file not supported on circular files".into(),
                ));
            }
        }
        entry.data_entries.clear();
        write_parts(&mut entry.data_entries, 0, data, self.part_data_size);
        {
            let file = entry.file.as_mut().unwrap();
            file.size = data.len() as u64;
            file.mod_ts = now_ms();
        }

        // Shrinking writes must flush immediately with replace=true so no
        // stale tail parts can resurrect on the next read.
        let flush_result = self.flush_entry_locked(zone_id, name, &mut entry, true);
        drop(entry);
        flush_result?;
        self.publish_fileop(zone_id, name, FileOp::Truncate);
        Ok(())
    }

    pub fn write_at(&self, zone_id: &str, name: &str, offset: u64, data: &[u8]) -> FilestoreResult<()> {
        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let mut entry = guard.entry.state.lock().unwrap();
        self.ensure_dirty(&mut entry, zone_id, name)?;
        self.apply_write(&mut entry, zone_id, name, offset, data)?;
        self.publish_fileop(zone_id, name, FileOp::Append);
        Ok(())
    }

    pub fn append_data(&self, zone_id: &str, name: &str, data: &[u8]) -> FilestoreResult<()> {
        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let mut entry = guard.entry.state.lock().unwrap();
        self.ensure_dirty(&mut entry, zone_id, name)?;
        let offset = entry.file.as_ref().unwrap().size;
        self.apply_write(&mut entry, zone_id, name, offset, data)?;
        self.publish_fileop(zone_id, name, FileOp::Append);
        Ok(())
    }

    pub fn append_ijson(&self, zone_id: &str, name: &str, cmd: &ijson::Command) -> FilestoreResult<()> {
        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let mut entry = guard.entry.state.lock().unwrap();
        self.ensure_dirty(&mut entry, zone_id, name)?;
        {
            let file = entry.file.as_ref().unwrap();
            if !file.opts.ijson {
                return Err(FilestoreError::InvalidArgument("not an ijson file".into()));
            }
        }

        let size_before = entry.file.as_ref().unwrap().size;
        let line = ijson::encode_command(cmd);
        let offset = size_before;
        self.apply_write(&mut entry, zone_id, name, offset, &line)?;

        let file = entry.file.as_mut().unwrap();
        let numcmds = meta_counter(&file.meta, "ijson:numcmds") + 1;
        let incbytes = meta_counter(&file.meta, "ijson:incbytes") + line.len() as u64;
        set_meta_counter(&mut file.meta, "ijson:numcmds", numcmds);
        set_meta_counter(&mut file.meta, "ijson:incbytes", incbytes);

        let should = ijson::should_compact(numcmds, incbytes, size_before);
        drop(entry);
        self.publish_fileop(zone_id, name, FileOp::Append);
        if should {
            self.compact_ijson(zone_id, name)?;
        }
        Ok(())
    }

    pub fn compact_ijson(&self, zone_id: &str, name: &str) -> FilestoreResult<()> {
        let full = self.read_file(zone_id, name)?;
        let commands = ijson::parse_commands(&full);

        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let mut entry = guard.entry.state.lock().unwrap();
        self.ensure_dirty(&mut entry, zone_id, name)?;
        let budget = entry.file.as_ref().unwrap().opts.ijson_budget;
        let (_doc, log) = ijson::compact(&commands, budget);

        let mut encoded = Vec::new();
        let mut tail_bytes: u64 = 0;
        for (i, cmd) in log.iter().enumerate() {
            let line = ijson::encode_command(cmd);
            if i > 0 {
                tail_bytes += line.len() as u64;
            }
            encoded.extend_from_slice(&line);
        }

        entry.data_entries.clear();
        write_parts(&mut entry.data_entries, 0, &encoded, self.part_data_size);
        {
            let file = entry.file.as_mut().unwrap();
            file.size = encoded.len() as u64;
            file.mod_ts = now_ms();
            set_meta_counter(&mut file.meta, "ijson:numcmds", log.len() as u64);
            set_meta_counter(&mut file.meta, "ijson:incbytes", tail_bytes);
        }
        let result = self.flush_entry_locked(zone_id, name, &mut entry, true);
        drop(entry);
        result?;
        self.publish_fileop(zone_id, name, FileOp::Truncate);
        Ok(())
    }

    pub fn read_at(&self, zone_id: &str, name: &str, offset: u64, size: usize) -> FilestoreResult<(u64, Vec<u8>)> {
        let key = (zone_id.to_string(), name.to_string());
        let guard = self.pin(key);
        let mut entry = guard.entry.state.lock().unwrap();

        let file = match &entry.file {
            Some(f) => f.clone(),
            None => {
                self.part_store.get_file(zone_id, name)?.ok_or_else(|| FilestoreError::not_exist(zone_id, name))?
            }
        };

        let (start, end) = if file.opts.circular {
            let window_start = circular::window_start(file.size, file.opts.max_size);
            let clamp_start = offset.max(window_start);
            (clamp_start, file.size)
        } else {
            (offset, file.size)
        };

        if start >= end {
            return Ok((start.min(file.size), Vec::new()));
        }
        let avail = (end - start) as usize;
        let want = avail.min(size);
        let real_end = start + want as u64;

        let part_size = self.part_data_size as u64;
        let first_part = start / part_size;
        let last_part = if real_end == start { first_part } else { (real_end - 1) / part_size };

        let part_count = if file.opts.circular { file.opts.max_size / part_size } else { 0 };

        let mut out = Vec::with_capacity(want);
        for idx in first_part..=last_part {
            let stored_idx = if file.opts.circular { idx % part_count.max(1) } else { idx };
            let bytes = self.load_part(&mut entry, zone_id, name, stored_idx)?;
            let part_start = idx * part_size;
            let lo = start.max(part_start) - part_start;
            let hi = real_end.min(part_start + part_size) - part_start;
            let lo = lo as usize;
            let hi = hi as usize;
            if lo < bytes.len() {
                out.extend_from_slice(&bytes[lo..hi.min(bytes.len())]);
            }
            // bytes missing entirely (neither cached nor persisted) are
            // treated as zero-filled, per the read algorithm's safeguard.
            if hi > bytes.len() {
                out.resize(out.len() + (hi - bytes.len().max(lo)), 0);
            }
        }
        out.truncate(want);
        Ok((start, out))
    }

    pub fn read_file(&self, zone_id: &str, name: &str) -> FilestoreResult<Vec<u8>> {
        Ok(self.read_at(zone_id, name, 0, usize::MAX)?.1)
    }

    // ---- internal helpers -------------------------------------------------

    fn ensure_dirty(&self, entry: &mut CacheEntry, zone_id: &str, name: &str) -> FilestoreResult<()> {
        if entry.file.is_none() {
            let file = self
                .part_store
                .get_file(zone_id, name)?
                .ok_or_else(|| FilestoreError::not_exist(zone_id, name))?;
            entry.file = Some(file);
        }
        Ok(())
    }

    fn load_part(
        &self,
        entry: &mut CacheEntry,
        zone_id: &str,
        name: &str,
        part_idx: u64,
    ) -> FilestoreResult<Vec<u8>> {
        if let Some(bytes) = entry.data_entries.get(&part_idx) {
            return Ok(bytes.clone());
        }
        let parts = self.part_store.get_file_parts(zone_id, name, &[part_idx])?;
        Ok(parts.get(&part_idx).map(|p| p.data.clone()).unwrap_or_default())
    }

    /// Core write_at-style mutation: clamp for circular files, pre-load any
    /// partially-overwritten parts, then mutate `entry.data_entries`.
    fn apply_write(
        &self,
        entry: &mut CacheEntry,
        zone_id: &str,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> FilestoreResult<()> {
        let (circular, max_size, cur_size) = {
            let file = entry.file.as_ref().unwrap();
            (file.opts.circular, file.opts.max_size, file.size)
        };
        if offset > cur_size {
            return Err(FilestoreError::InvalidArgument(format!(
                "offset {} beyond size {}",
                offset, cur_size
            )));
        }
        let original_end = offset + data.len() as u64;
        let new_size = cur_size.max(original_end);

        let write_plan = if circular {
            circular::clamp_circular_write(cur_size, max_size, offset, data)
        } else {
            Some((offset, data.to_vec()))
        };

        if let Some((write_offset, write_data)) = write_plan {
            if !write_data.is_empty() {
                let part_size = self.part_data_size as u64;
                let part_count = if circular { max_size / part_size } else { 0 };

                // Pre-load any part that will receive a partial write.
                let end = write_offset + write_data.len() as u64;
                let first_part = write_offset / part_size;
                let last_part = (end - 1) / part_size;
                for idx in first_part..=last_part {
                    let part_start = idx * part_size;
                    let part_end = part_start + part_size;
                    let covers_fully = write_offset <= part_start && end >= part_end;
                    let stored_idx = if circular { idx % part_count.max(1) } else { idx };
                    if !covers_fully && !entry.data_entries.contains_key(&stored_idx) {
                        let bytes = self.load_part_direct(zone_id, name, stored_idx)?;
                        entry.data_entries.insert(stored_idx, bytes);
                    }
                }

                write_parts_wrapped(&mut entry.data_entries, write_offset, &write_data, self.part_data_size, part_count);
            }
        }

        let file = entry.file.as_mut().unwrap();
        file.size = new_size;
        file.mod_ts = now_ms();
        Ok(())
    }

    fn load_part_direct(&self, zone_id: &str, name: &str, part_idx: u64) -> FilestoreResult<Vec<u8>> {
        let parts = self.part_store.get_file_parts(zone_id, name, &[part_idx])?;
        Ok(parts.get(&part_idx).map(|p| p.data.clone()).unwrap_or_default())
    }

    fn flush_entry_locked(
        &self,
        zone_id: &str,
        name: &str,
        entry: &mut CacheEntry,
        replace: bool,
    ) -> FilestoreResult<()> {
        let file = match &entry.file {
            Some(f) => f.clone(),
            None => return Ok(()),
        };
        let parts: Vec<DataPart> = entry
            .data_entries
            .iter()
            .map(|(idx, data)| DataPart { part_idx: *idx, data: data.clone() })
            .collect();
        match self.part_store.write_cache_entry(
            zone_id,
            name,
            file.size,
            file.mod_ts,
            &file.meta,
            &parts,
            replace,
        ) {
            Ok(()) => {
                entry.file = None;
                entry.data_entries.clear();
                entry.flush_errors = 0;
                Ok(())
            }
            Err(e) => {
                entry.flush_errors += 1;
                if entry.flush_errors > MAX_FLUSH_ERRORS {
                    entry.file = None;
                    entry.data_entries.clear();
                }
                Err(e)
            }
        }
    }

    /// Flush every dirty entry. Returns the errors encountered (flushing is
    /// best-effort: one entry's persistence error does not stop the rest).
    /// Only one flush pass runs at a time; if one is already in flight this
    /// call is a no-op and returns no errors.
    pub fn flush_cache(&self, budget: Duration) -> Vec<FilestoreError> {
        if self
            .is_flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Vec::new();
        }
        let _guard = FlushGuard(&self.is_flushing);

        let keys: Vec<(Key, Arc<EntryHandle>)> = {
            let cache = self.cache.lock().unwrap();
            cache.iter().map(|(k, s)| (k.clone(), s.entry.clone())).collect()
        };

        let deadline = Instant::now() + budget;
        let mut errors = Vec::new();
        for (key, entry) in keys {
            if Instant::now() >= deadline {
                break;
            }
            let mut state = entry.state.lock().unwrap();
            if !state.is_dirty() {
                continue;
            }
            if let Err(e) = self.flush_entry_locked(&key.0, &key.1, &mut state, false) {
                errors.push(e);
            }
            let now_clean = !state.is_dirty();
            drop(state);
            if now_clean {
                let mut cache = self.cache.lock().unwrap();
                if let Some(slot) = cache.get(&key) {
                    if slot.pin_count == 0 && Arc::ptr_eq(&slot.entry, &entry) {
                        cache.remove(&key);
                    }
                }
            }
        }
        errors
    }
}

struct FlushGuard<'a>(&'a AtomicBool);
impl<'a> Drop for FlushGuard<'a> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn validate_opts(opts: &FileOpts) -> FilestoreResult<()> {
    if opts.circular && opts.max_size == 0 {
        return Err(FilestoreError::InvalidArgument("circular requires max_size > 0".into()));
    }
    if opts.circular && opts.ijson {
        return Err(FilestoreError::InvalidArgument("circular and ijson are mutually exclusive".into()));
    }
    if opts.ijson_budget > 0 && !opts.ijson {
        return Err(FilestoreError::InvalidArgument("ijson_budget requires ijson".into()));
    }
    Ok(())
}

/// Key-wise merge of `patch` into `target` (both expected to be JSON
/// objects): a `null` value in `patch` deletes the key, anything else
/// replaces it wholesale (values below the top level are immutable).
fn merge_meta(target: &mut Json, patch: &Json) {
    if !target.is_object() {
        *target = Json::Object(Default::default());
    }
    let Some(pmap) = patch.as_object() else {
        return;
    };
    let tmap = target.as_object_mut().unwrap();
    for (k, v) in pmap {
        if v.is_null() {
            tmap.remove(k);
        } else {
            tmap.insert(k.clone(), v.clone());
        }
    }
}

fn meta_counter(meta: &Json, key: &str) -> u64 {
    meta.get(key).and_then(Json::as_u64).unwrap_or(0)
}

fn set_meta_counter(meta: &mut Json, key: &str, value: u64) {
    if !meta.is_object() {
        *meta = Json::Object(Default::default());
    }
    meta.as_object_mut().unwrap().insert(key.to_string(), Json::from(value));
}

/// Write `data` into a (non-wrapping) part map starting at `offset`.
fn write_parts(map: &mut HashMap<u64, Vec<u8>>, offset: u64, data: &[u8], part_size: usize) {
    write_parts_wrapped(map, offset, data, part_size, 0)
}

/// Write `data` into a part map starting at logical `offset`, wrapping part
/// indices modulo `part_count` when `part_count > 0` (circular files).
fn write_parts_wrapped(
    map: &mut HashMap<u64, Vec<u8>>,
    offset: u64,
    data: &[u8],
    part_size: usize,
    part_count: u64,
) {
    let part_size_u = part_size as u64;
    let mut pos = 0usize;
    while pos < data.len() {
        let logical_offset = offset + pos as u64;
        let part_idx = logical_offset / part_size_u;
        let stored_idx = if part_count > 0 { part_idx % part_count } else { part_idx };
        let part_off = (logical_offset % part_size_u) as usize;
        let chunk_len = (part_size - part_off).min(data.len() - pos);

        let buf = map.entry(stored_idx).or_insert_with(|| Vec::with_capacity(part_size));
        if buf.len() < part_off + chunk_len {
            buf.resize(part_off + chunk_len, 0);
        }
        buf[part_off..part_off + chunk_len].copy_from_slice(&data[pos..pos + chunk_len]);

        pos += chunk_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn store() -> Arc<Filestore> {
        Filestore::open_in_memory(16, None).unwrap()
    }

    #[test]
    fn create_append_stat() {
        let fs = store();
        fs.make_file("z1", "t1", Json::Object(Default::default()), FileOpts::default()).unwrap();
        fs.append_data("z1", "t1", b"hello").unwrap();
        fs.append_data("z1", "t1", b" world").unwrap();
        let meta = fs.stat("z1", "t1").unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(fs.read_file("z1", "t1").unwrap(), b"hello world");
    }

    #[test]
    fn circular_wrap_matches_spec_example() {
        // part_data_size chosen so max_size=50 is already a multiple and
        // round_up_max_size is a no-op, keeping the byte math legible.
        let fs = Filestore::open_in_memory(50, None).unwrap();
        let opts = FileOpts { max_size: 50, circular: true, ..Default::default() };
        fs.make_file("z1", "ring", Json::Object(Default::default()), opts).unwrap();
        let base: Vec<u8> = "123456789 ".repeat(5).into_bytes();
        assert_eq!(base.len(), 50);
        fs.write_file("z1", "ring", &base).unwrap_err(); // circular files reject write_file
        // build the same effect with write_at + append instead.
        fs.write_at("z1", "ring", 0, &base).unwrap();
        fs.append_data("z1", "ring", b"apple").unwrap();
        let content = fs.read_file("z1", "ring").unwrap();
        assert_eq!(content, b"6789 123456789 123456789 123456789 123456789 apple");
        fs.append_data("z1", "ring", b" banana").unwrap();
        let content = fs.read_file("z1", "ring").unwrap();
        assert_eq!(content, b"3456789 123456789 123456789 123456789 apple banana");
    }

    #[test]
    fn truncate_replaces_cleanly() {
        let fs = store();
        fs.make_file("z1", "t1", Json::Object(Default::default()), FileOpts::default()).unwrap();
        fs.write_file("z1", "t1", b"hello world!").unwrap();
        fs.write_file("z1", "t1", b"hi").unwrap();
        let content = fs.read_file("z1", "t1").unwrap();
        assert_eq!(content, b"hi");
        let meta = fs.stat("z1", "t1").unwrap();
        assert_eq!(meta.size, 2);
        fs.flush_cache(Duration::from_secs(1));
        assert_eq!(fs.read_file("z1", "t1").unwrap(), b"hi");
    }

    #[test]
    fn multi_part_write() {
        let fs = Filestore::open_in_memory(50, None).unwrap();
        fs.make_file("z1", "t1", Json::Object(Default::default()), FileOpts::default()).unwrap();
        let data: Vec<u8> = "0123456789".repeat(8).into_bytes();
        fs.append_data("z1", "t1", &data).unwrap();
        fs.write_at("z1", "t1", 49, b"world").unwrap();
        let content = fs.read_file("z1", "t1").unwrap();
        assert_eq!(content.len(), 80);
        assert_eq!(&content[48..55], b"8world4");
    }

    #[test]
    fn delete_file_clears_dirty_state() {
        let fs = store();
        fs.make_file("z1", "t1", Json::Object(Default::default()), FileOpts::default()).unwrap();
        fs.append_data("z1", "t1", b"hello").unwrap();
        fs.delete_file("z1", "t1").unwrap();
        assert!(fs.stat("z1", "t1").unwrap_err().is_not_exist());
        assert!(fs.read_at("z1", "t1", 0, 10).unwrap_err().is_not_exist());
    }

    #[test]
    fn concurrent_appends_preserve_total_size() {
        let fs = store();
        fs.make_file("z1", "t1", Json::Object(Default::default()), FileOpts::default()).unwrap();
        let n = 8;
        let barrier = Arc::new(Barrier::new(n));
        let mut handles = Vec::new();
        for i in 0..n {
            let fs = fs.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..100 {
                    fs.append_data("z1", "t1", &[i as u8]).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let meta = fs.stat("z1", "t1").unwrap();
        assert_eq!(meta.size, (100 * n) as u64);
        let content = fs.read_file("z1", "t1").unwrap();
        let mut counts = [0u32; 256];
        for b in content {
            counts[b as usize] += 1;
        }
        for i in 0..n {
            assert_eq!(counts[i], 100);
        }
    }

    #[test]
    fn ijson_roundtrip_and_compaction() {
        let fs = store();
        let opts = FileOpts { ijson: true, ..Default::default() };
        fs.make_file("z1", "doc", Json::Object(Default::default()), opts).unwrap();
        fs.append_ijson("z1", "doc", &ijson::Command::Set { path: String::new(), value: serde_json::json!({"items": []}) }).unwrap();
        for i in 0..100 {
            fs.append_ijson(
                "z1",
                "doc",
                &ijson::Command::Append { path: "/items".into(), value: Json::from(i) },
            )
            .unwrap();
        }
        let raw = fs.read_file("z1", "doc").unwrap();
        let commands = ijson::parse_commands(&raw);
        assert!(
            commands.len() < 100,
            "compaction should have folded the log at least once, got {} commands",
            commands.len()
        );
        let (doc, _) = ijson::compact(&commands, 0);
        let items = doc.get("items").and_then(|v| v.as_array()).unwrap();
        assert_eq!(items.len(), 100);
    }

    #[test]
    fn ijson_budget_retains_tail_after_compaction() {
        let fs = store();
        let opts = FileOpts { ijson: true, ijson_budget: 64, ..Default::default() };
        fs.make_file("z1", "doc", Json::Object(Default::default()), opts).unwrap();
        fs.append_ijson("z1", "doc", &ijson::Command::Set { path: String::new(), value: serde_json::json!({"items": []}) })
            .unwrap();
        for i in 0..20 {
            fs.append_ijson("z1", "doc", &ijson::Command::Append { path: "/items".into(), value: Json::from(i) })
                .unwrap();
        }
        let meta = fs.stat("z1", "doc").unwrap();
        let numcmds = meta_counter(&meta.meta, "ijson:numcmds");
        assert!(numcmds >= 1, "expected at least the folded set command, got {}", numcmds);
        let raw = fs.read_file("z1", "doc").unwrap();
        let commands = ijson::parse_commands(&raw);
        let mut replayed = Json::Null;
        for c in &commands {
            ijson::apply(&mut replayed, c);
        }
        let items = replayed.get("items").and_then(|v| v.as_array()).unwrap();
        assert_eq!(items.len(), 20);
    }
}
