//! The classic MPQ hash table
//!
//! A power-of-two array of 16-byte entries probed linearly from the
//! name's TABLE_OFFSET hash. Deleted entries stay as tombstones so that
//! probe chains over them keep working; only a never-used entry
//! terminates a probe.

use crate::crypto::{hash_string, hash_type};
use crate::stream::Stream;
use crate::{Error, Result};

/// Key for the hash table's own encryption
pub fn table_key() -> u32 {
    hash_string("(hash table)", hash_type::FILE_KEY)
}

/// Hash table entry (16 bytes on disk)
#[derive(Debug, Clone, Copy)]
pub struct HashEntry {
    /// The hash of the full file name (part A)
    pub name_a: u32,
    /// The hash of the full file name (part B)
    pub name_b: u32,
    /// The language of the file (Windows LANGID)
    pub locale: u16,
    /// The platform the file is used for; always observed as 0
    pub platform: u16,
    /// File table index or one of the two sentinel values
    pub block_index: u32,
}

impl HashEntry {
    /// Entry has never been used; terminates probe chains
    pub const FREE: u32 = 0xFFFFFFFF;
    /// Entry was deleted; probes continue across it
    pub const DELETED: u32 = 0xFFFFFFFE;

    /// A never-used entry
    pub fn free() -> Self {
        Self {
            name_a: 0xFFFFFFFF,
            name_b: 0xFFFFFFFF,
            locale: 0xFFFF,
            platform: 0xFFFF,
            block_index: Self::FREE,
        }
    }

    /// Check if this entry has never been used
    pub fn is_free(&self) -> bool {
        self.block_index == Self::FREE
    }

    /// Check if this entry is a tombstone
    pub fn is_deleted(&self) -> bool {
        self.block_index == Self::DELETED
    }

    /// Check if this entry points at a live file
    pub fn is_valid(&self) -> bool {
        self.block_index < Self::DELETED
    }
}

/// The classic hash table
#[derive(Debug, Clone)]
pub struct HashTable {
    entries: Vec<HashEntry>,
}

impl HashTable {
    /// Create an empty table; `size` must be a power of two
    pub fn new(size: usize) -> Result<Self> {
        if !crate::is_power_of_two(size as u32) {
            return Err(Error::invalid_parameter(
                "hash table size must be a power of two",
            ));
        }
        Ok(Self {
            entries: vec![HashEntry::free(); size],
        })
    }

    /// Parse a table from its decrypted on-disk bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % 16 != 0 {
            return Err(Error::corrupt("hash table size not a multiple of 16"));
        }
        let entries = data
            .chunks_exact(16)
            .map(|chunk| HashEntry {
                name_a: u32::from_le_bytes(chunk[0..4].try_into().unwrap()),
                name_b: u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
                locale: u16::from_le_bytes(chunk[8..10].try_into().unwrap()),
                platform: u16::from_le_bytes(chunk[10..12].try_into().unwrap()),
                block_index: u32::from_le_bytes(chunk[12..16].try_into().unwrap()),
            })
            .collect();
        Ok(Self { entries })
    }

    /// Read and decrypt a table from the archive
    ///
    /// A stored size smaller than `entries * 16` bytes means the table is
    /// compressed. A table extending past the end of the file is
    /// tolerated by synthesizing free entries for the missing tail.
    pub fn read(
        stream: &mut Stream,
        offset: u64,
        entry_count: u32,
        on_disk_size: usize,
    ) -> Result<Self> {
        let real_size = entry_count as usize * 16;

        let readable = (stream.size().saturating_sub(offset) as usize).min(on_disk_size);
        if readable < on_disk_size && on_disk_size == real_size {
            // Truncated uncompressed table: load what exists, zero the rest
            let mut data =
                super::load_table(stream, offset, readable & !15, readable & !15, table_key())?;
            data.resize(real_size, 0);
            let mut table = Self::from_bytes(&data)?;
            for entry in table.entries.iter_mut().skip((readable & !15) / 16) {
                *entry = HashEntry::free();
            }
            return Ok(table);
        }

        let data = super::load_table(stream, offset, on_disk_size, real_size, table_key())?;
        Self::from_bytes(&data)
    }

    /// Serialize to plaintext bytes (encryption happens at store time)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 16);
        for entry in &self.entries {
            out.extend_from_slice(&entry.name_a.to_le_bytes());
            out.extend_from_slice(&entry.name_b.to_le_bytes());
            out.extend_from_slice(&entry.locale.to_le_bytes());
            out.extend_from_slice(&entry.platform.to_le_bytes());
            out.extend_from_slice(&entry.block_index.to_le_bytes());
        }
        out
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// All slots
    pub fn entries(&self) -> &[HashEntry] {
        &self.entries
    }

    /// One slot
    pub fn get(&self, index: usize) -> Option<&HashEntry> {
        self.entries.get(index)
    }

    /// Number of live entries
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_valid()).count()
    }

    fn start_index(&self, filename: &str) -> usize {
        hash_string(filename, hash_type::TABLE_OFFSET) as usize & (self.entries.len() - 1)
    }

    /// Find the slot holding `filename` with exactly `locale`
    pub fn find_exact(&self, filename: &str, locale: u16) -> Option<usize> {
        self.probe(filename, |entry| entry.locale == locale)
    }

    /// Find `filename` preferring `locale`, falling back to neutral
    pub fn find(&self, filename: &str, locale: u16) -> Option<usize> {
        if locale != 0 {
            if let Some(index) = self.find_exact(filename, locale) {
                return Some(index);
            }
        }
        self.find_exact(filename, 0)
    }

    /// Find `filename` under any locale, preferring neutral
    pub fn find_any_locale(&self, filename: &str) -> Option<usize> {
        if let Some(index) = self.find_exact(filename, 0) {
            return Some(index);
        }
        self.probe(filename, |_| true)
    }

    /// Linear probe skipping tombstones, stopping at the first free slot
    fn probe<F: Fn(&HashEntry) -> bool>(&self, filename: &str, accept: F) -> Option<usize> {
        let name_a = hash_string(filename, hash_type::NAME_A);
        let name_b = hash_string(filename, hash_type::NAME_B);
        let start = self.start_index(filename);
        let mask = self.entries.len() - 1;

        let mut index = start;
        loop {
            let entry = &self.entries[index];
            if entry.is_free() {
                return None;
            }
            if entry.is_valid()
                && entry.name_a == name_a
                && entry.name_b == name_b
                && accept(entry)
            {
                return Some(index);
            }
            index = (index + 1) & mask;
            if index == start {
                return None;
            }
        }
    }

    /// Pick the slot for inserting `filename` with `locale`
    ///
    /// Prefers an existing entry for the same name and locale, then the
    /// first tombstone seen, then the first free slot.
    pub fn find_insert_slot(&self, filename: &str, locale: u16) -> Option<usize> {
        let name_a = hash_string(filename, hash_type::NAME_A);
        let name_b = hash_string(filename, hash_type::NAME_B);
        let start = self.start_index(filename);
        let mask = self.entries.len() - 1;

        let mut first_reusable = None;
        let mut index = start;
        loop {
            let entry = &self.entries[index];
            if entry.is_free() {
                return Some(first_reusable.unwrap_or(index));
            }
            if entry.is_deleted() && first_reusable.is_none() {
                first_reusable = Some(index);
            }
            if entry.is_valid()
                && entry.name_a == name_a
                && entry.name_b == name_b
                && entry.locale == locale
            {
                return Some(index);
            }
            index = (index + 1) & mask;
            if index == start {
                return first_reusable;
            }
        }
    }

    /// Write an entry for `filename` into the chosen slot
    pub fn insert(
        &mut self,
        filename: &str,
        locale: u16,
        block_index: u32,
    ) -> Result<usize> {
        let slot = self
            .find_insert_slot(filename, locale)
            .ok_or_else(|| Error::CannotComplete("hash table is full".to_string()))?;
        self.entries[slot] = HashEntry {
            name_a: hash_string(filename, hash_type::NAME_A),
            name_b: hash_string(filename, hash_type::NAME_B),
            locale,
            platform: 0,
            block_index,
        };
        Ok(slot)
    }

    /// Turn a slot into a tombstone, or a free slot when the next slot
    /// is already free (nothing probes across it)
    pub fn delete(&mut self, index: usize) {
        let mask = self.entries.len() - 1;
        if self.entries[(index + 1) & mask].is_free() {
            self.entries[index] = HashEntry::free();
        } else {
            self.entries[index] = HashEntry {
                name_a: 0xFFFFFFFF,
                name_b: 0xFFFFFFFF,
                locale: 0xFFFF,
                platform: 0xFFFF,
                block_index: HashEntry::DELETED,
            };
        }
    }

    /// Update the block index of a slot in place
    pub fn set_block_index(&mut self, index: usize, block_index: u32) {
        self.entries[index].block_index = block_index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_states() {
        let free = HashEntry::free();
        assert!(free.is_free());
        assert!(!free.is_deleted());
        assert!(!free.is_valid());
    }

    #[test]
    fn test_insert_and_find() {
        let mut table = HashTable::new(16).unwrap();
        table.insert("war3map.j", 0, 3).unwrap();
        table.insert("war3map.w3e", 0, 4).unwrap();

        let slot = table.find("war3map.j", 0).unwrap();
        assert_eq!(table.get(slot).unwrap().block_index, 3);
        assert!(table.find("missing.txt", 0).is_none());
    }

    #[test]
    fn test_locale_fallback() {
        let mut table = HashTable::new(16).unwrap();
        table.insert("ui.txt", 0, 1).unwrap();
        table.insert("ui.txt", 0x409, 2).unwrap();

        // Exact locale wins
        let slot = table.find("ui.txt", 0x409).unwrap();
        assert_eq!(table.get(slot).unwrap().block_index, 2);

        // Unknown locale falls back to neutral
        let slot = table.find("ui.txt", 0x40C).unwrap();
        assert_eq!(table.get(slot).unwrap().block_index, 1);
    }

    #[test]
    fn test_tombstones_do_not_break_chains() {
        let mut table = HashTable::new(16).unwrap();

        // Fabricate a collision chain by inserting into forced slots
        let names = ["a.txt", "b.txt", "c.txt"];
        for (i, name) in names.iter().enumerate() {
            table.insert(name, 0, i as u32).unwrap();
        }

        // Delete the middle entry of whatever chain formed, then verify
        // every other name still resolves.
        let slot_b = table.find("b.txt", 0).unwrap();
        table.delete(slot_b);
        assert!(table.find("a.txt", 0).is_some());
        assert!(table.find("c.txt", 0).is_some());
        assert!(table.find("b.txt", 0).is_none());
    }

    #[test]
    fn test_insert_prefers_tombstone() {
        let mut table = HashTable::new(16).unwrap();
        table.insert("one.txt", 0, 0).unwrap();
        let slot = table.find("one.txt", 0).unwrap();

        // Force a tombstone by faking a following occupied slot
        let next = (slot + 1) & 15;
        table.entries[next].block_index = 42;
        table.entries[next].name_a = 1;
        table.entries[next].name_b = 2;
        table.delete(slot);
        assert!(table.entries[slot].is_deleted());

        // Reinsert of a colliding name reuses the tombstone if it comes
        // first in its chain
        table.insert("one.txt", 0, 7).unwrap();
        let found = table.find("one.txt", 0).unwrap();
        assert_eq!(table.get(found).unwrap().block_index, 7);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut table = HashTable::new(8).unwrap();
        table.insert("x.bin", 3, 1).unwrap();

        let bytes = table.to_bytes();
        let parsed = HashTable::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.size(), 8);
        let slot = parsed.find("x.bin", 3).unwrap();
        assert_eq!(parsed.get(slot).unwrap().block_index, 1);
    }

    #[test]
    fn test_probe_bound_at_three_quarter_fill() {
        let size = 256;
        let mut table = HashTable::new(size).unwrap();
        let count = size * 3 / 4;

        let names: Vec<String> = (0..count).map(|i| format!("file_{:04}.dat", i)).collect();
        for (i, name) in names.iter().enumerate() {
            table.insert(name, 0, i as u32).unwrap();
        }

        // Successful lookups stay under table_size probes and find the
        // right entries; missing names terminate at a free slot.
        for (i, name) in names.iter().enumerate() {
            let slot = table.find(name, 0).unwrap();
            assert_eq!(table.get(slot).unwrap().block_index, i as u32);
        }
        for i in 0..64 {
            assert!(table.find(&format!("absent_{}.dat", i), 0).is_none());
        }
    }
}
