//! The write-back cache entry and its pin/lock protocol.
//!
//! `file.is_some()` means the entry is dirty and must eventually be
//! flushed to the [`crate::partstore::PartStore`]; a clean entry (`file:
//! None`) only exists in memory because it is currently pinned by an
//! in-flight caller.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::partstore::{DataPart, FileMeta};

#[derive(Default)]
pub struct CacheEntry {
    pub file: Option<FileMeta>,
    pub data_entries: HashMap<u64, Vec<u8>>,
    pub flush_errors: u32,
}

impl CacheEntry {
    pub fn is_dirty(&self) -> bool {
        self.file.is_some()
    }
}

/// A cache slot's own lock. The pin count itself lives on `Slot` in
/// `crate::filestore`, maintained under the store-wide map lock so it can
/// be checked atomically alongside map membership.
pub struct EntryHandle {
    pub state: Mutex<CacheEntry>,
}

impl EntryHandle {
    pub fn new() -> Self {
        EntryHandle { state: Mutex::new(CacheEntry::default()) }
    }
}

impl Default for EntryHandle {
    fn default() -> Self {
        Self::new()
    }
}
