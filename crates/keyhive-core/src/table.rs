//! Masked-hash key table
//!
//! Maps a key to the head page of its record. The slot of a key is the
//! primary bucket (low `mask_bits` of the hash) joined with a sub-bucket
//! taken from the next `collision_mask_bits`. A slot chain never holds more
//! than `max_elements`; an insert that would overflow grows `mask_bits` by
//! one and redistributes every element. Empty slots take no memory.

use std::io::{self, Write};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::config::MAX_MASK_BITS;
use crate::error::{StoreError, StoreResult};
use crate::hash::KeyHasher;
use crate::page::PageId;
use crate::record::printable;

/// One key's table slot entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub hash: u64,
    pub key: Vec<u8>,
    /// Head page of the record chain
    pub head: PageId,
    /// Sequence number of the record at `head`
    pub seq: u64,
}

/// Result of [`HashTable::insert`].
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Element previously stored under the same key
    pub replaced: Option<Element>,
    /// The table grew; the new geometry must be persisted
    pub grew: bool,
}

pub struct HashTable {
    hasher: Arc<dyn KeyHasher>,
    mask_bits: u8,
    collision_mask_bits: u8,
    max_elements: usize,
    slots: HashMap<u64, Vec<Element>>,
    len: usize,
}

impl HashTable {
    pub fn new(mask_bits: u8, collision_mask_bits: u8, max_elements: usize, hasher: Arc<dyn KeyHasher>) -> Self {
        Self {
            hasher,
            mask_bits,
            collision_mask_bits,
            max_elements,
            slots: HashMap::new(),
            len: 0,
        }
    }

    pub fn hasher(&self) -> &dyn KeyHasher {
        self.hasher.as_ref()
    }

    /// Element for `key`, hashed by this table's hasher.
    pub fn element(&self, key: &[u8], head: PageId, seq: u64) -> Element {
        Element { hash: self.hasher.hash(key), key: key.to_vec(), head, seq }
    }

    pub fn mask_bits(&self) -> u8 {
        self.mask_bits
    }

    pub fn collision_mask_bits(&self) -> u8 {
        self.collision_mask_bits
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot_of(hash: u64, mask_bits: u8, collision_mask_bits: u8) -> u64 {
        let primary = hash & ((1u64 << mask_bits) - 1);
        let sub = (hash >> mask_bits) & ((1u64 << collision_mask_bits) - 1);
        (primary << collision_mask_bits) | sub
    }

    fn slot(&self, hash: u64) -> u64 {
        Self::slot_of(hash, self.mask_bits, self.collision_mask_bits)
    }

    pub fn get(&self, key: &[u8]) -> Option<&Element> {
        let hash = self.hasher.hash(key);
        self.slots
            .get(&self.slot(hash))?
            .iter()
            .find(|e| e.hash == hash && e.key == key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace. On `Full` the table is left as it was.
    pub fn insert(&mut self, element: Element) -> StoreResult<InsertOutcome> {
        let slot = self.slot(element.hash);
        let chain = self.slots.entry(slot).or_default();
        if let Some(existing) = chain
            .iter_mut()
            .find(|e| e.hash == element.hash && e.key == element.key)
        {
            let old = std::mem::replace(existing, element);
            return Ok(InsertOutcome { replaced: Some(old), grew: false });
        }

        let hash = element.hash;
        let key = element.key.clone();
        chain.push(element);
        self.len += 1;
        if chain.len() <= self.max_elements {
            return Ok(InsertOutcome::default());
        }

        let before = self.mask_bits;
        while self.longest_chain() > self.max_elements {
            if self.mask_bits >= MAX_MASK_BITS {
                self.remove_hashed(hash, &key);
                self.rebuild(before);
                return Err(StoreError::Full(format!(
                    "sub-bucket exceeds {} elements at the largest mask ({} bits)",
                    self.max_elements, MAX_MASK_BITS
                )));
            }
            self.rebuild(self.mask_bits + 1);
        }
        tracing::info!(from = before, to = self.mask_bits, entries = self.len, "key table grew");
        Ok(InsertOutcome { replaced: None, grew: true })
    }

    fn rebuild(&mut self, mask_bits: u8) {
        if mask_bits == self.mask_bits {
            return;
        }
        let old = std::mem::take(&mut self.slots);
        self.mask_bits = mask_bits;
        for e in old.into_values().flatten() {
            let slot = self.slot(e.hash);
            self.slots.entry(slot).or_default().push(e);
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Element> {
        self.remove_hashed(self.hasher.hash(key), key)
    }

    fn remove_hashed(&mut self, hash: u64, key: &[u8]) -> Option<Element> {
        let slot = self.slot(hash);
        let chain = self.slots.get_mut(&slot)?;
        let pos = chain.iter().position(|e| e.hash == hash && e.key == key)?;
        let removed = chain.swap_remove(pos);
        if chain.is_empty() {
            self.slots.remove(&slot);
        }
        self.len -= 1;
        Some(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.slots.values().flat_map(|c| c.iter())
    }

    /// Keys in ascending byte order.
    pub fn sorted_keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self.iter().map(|e| e.key.clone()).collect();
        keys.sort();
        keys
    }

    pub fn longest_chain(&self) -> usize {
        self.slots.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn occupied_slots(&self) -> usize {
        self.slots.len()
    }

    /// Human-readable dump: one line per occupied slot, then its elements.
    pub fn dump(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(
            w,
            "key table: mask_bits={} collision_mask_bits={} max_elements={} entries={}",
            self.mask_bits, self.collision_mask_bits, self.max_elements, self.len
        )?;
        let mut slots: Vec<(&u64, &Vec<Element>)> = self.slots.iter().collect();
        slots.sort_by_key(|(s, _)| **s);
        for (slot, chain) in slots {
            let primary = slot >> self.collision_mask_bits;
            let sub = slot & ((1u64 << self.collision_mask_bits) - 1);
            writeln!(w, "  [{:#x}/{:#x}] {} element(s)", primary, sub, chain.len())?;
            for e in chain {
                writeln!(
                    w,
                    "    hash={:016x} head={} seq={} key=\"{}\"",
                    e.hash,
                    e.head,
                    e.seq,
                    printable(&e.key)
                )?;
            }
        }
        Ok(())
    }
}
