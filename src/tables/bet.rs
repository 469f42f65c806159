//! The BET (block entry) table
//!
//! A bit-packed replacement for the block table: each record stores the
//! file position, sizes, and an index into a small shared flag array,
//! all at globally chosen bit widths just wide enough for the largest
//! value. A parallel bit-packed array holds the truncated name hashes
//! used to confirm HET matches.

use super::het::bits_needed;
use crate::bits::BitArray;
use crate::signatures;
use crate::stream::Stream;
use crate::{Error, Result};

const BET_HEADER_SIZE: usize = 76;

/// One unpacked BET record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BetRecord {
    /// File position relative to archive start
    pub file_pos: u64,
    /// Uncompressed size
    pub file_size: u64,
    /// Stored size
    pub compressed_size: u64,
    /// Block flags
    pub flags: u32,
    /// Truncated name hash (the HET remainder)
    pub name_hash: u64,
}

/// The BET table, in memory
#[derive(Debug, Clone)]
pub struct BetTable {
    /// Number of records; must match the HET entry count
    pub entry_count: u32,
    /// Width of the stored name hash remainder
    pub name_hash_bits: u32,
    bit_count_file_pos: u32,
    bit_count_file_size: u32,
    bit_count_cmp_size: u32,
    bit_count_flag_index: u32,
    table_entry_size: u32,
    flags: Vec<u32>,
    file_table: BitArray,
    name_hashes: BitArray,
}

impl BetTable {
    /// Pack `records` into a new table
    ///
    /// `name_hash_bits` is the HET hash width minus the 8 fragment bits.
    pub fn build(records: &[BetRecord], name_hash_bits: u32) -> Result<Self> {
        let mut max_file_pos = 0u64;
        let mut max_file_size = 0u64;
        let mut max_cmp_size = 0u64;
        let mut flags: Vec<u32> = Vec::new();

        for record in records {
            max_file_pos = max_file_pos.max(record.file_pos);
            max_file_size = max_file_size.max(record.file_size);
            max_cmp_size = max_cmp_size.max(record.compressed_size);
            if !flags.contains(&record.flags) {
                flags.push(record.flags);
            }
        }
        flags.sort_unstable();

        let bit_count_file_pos = bits_needed(max_file_pos);
        let bit_count_file_size = bits_needed(max_file_size);
        let bit_count_cmp_size = bits_needed(max_cmp_size);
        let bit_count_flag_index = bits_needed(flags.len().saturating_sub(1) as u64);
        let table_entry_size =
            bit_count_file_pos + bit_count_file_size + bit_count_cmp_size + bit_count_flag_index;

        let mut table = Self {
            entry_count: records.len() as u32,
            name_hash_bits,
            bit_count_file_pos,
            bit_count_file_size,
            bit_count_cmp_size,
            bit_count_flag_index,
            table_entry_size,
            file_table: BitArray::new(records.len() * table_entry_size as usize),
            name_hashes: BitArray::new(records.len() * name_hash_bits as usize),
            flags,
        };

        for (i, record) in records.iter().enumerate() {
            table.write_record(i, record)?;
        }

        Ok(table)
    }

    fn write_record(&mut self, index: usize, record: &BetRecord) -> Result<()> {
        let flag_index = self
            .flags
            .iter()
            .position(|&f| f == record.flags)
            .expect("flag array covers every record") as u64;

        let mut at = index * self.table_entry_size as usize;
        self.file_table
            .set_bits(at, self.bit_count_file_pos, record.file_pos)?;
        at += self.bit_count_file_pos as usize;
        self.file_table
            .set_bits(at, self.bit_count_file_size, record.file_size)?;
        at += self.bit_count_file_size as usize;
        self.file_table
            .set_bits(at, self.bit_count_cmp_size, record.compressed_size)?;
        at += self.bit_count_cmp_size as usize;
        self.file_table
            .set_bits(at, self.bit_count_flag_index, flag_index)?;

        self.name_hashes.set_bits(
            index * self.name_hash_bits as usize,
            self.name_hash_bits,
            record.name_hash,
        )?;
        Ok(())
    }

    /// Unpack one record
    pub fn get(&self, index: u32) -> Result<BetRecord> {
        if index >= self.entry_count {
            return Err(Error::invalid_parameter(format!(
                "BET record {} out of range ({})",
                index, self.entry_count
            )));
        }

        let mut at = index as usize * self.table_entry_size as usize;
        let file_pos = self.file_table.get_bits(at, self.bit_count_file_pos)?;
        at += self.bit_count_file_pos as usize;
        let file_size = self.file_table.get_bits(at, self.bit_count_file_size)?;
        at += self.bit_count_file_size as usize;
        let compressed_size = self.file_table.get_bits(at, self.bit_count_cmp_size)?;
        at += self.bit_count_cmp_size as usize;
        let flag_index = self.file_table.get_bits(at, self.bit_count_flag_index)?;

        let flags = self
            .flags
            .get(flag_index as usize)
            .copied()
            .ok_or_else(|| Error::corrupt("BET flag index out of range"))?;

        let name_hash = self.name_hashes.get_bits(
            index as usize * self.name_hash_bits as usize,
            self.name_hash_bits,
        )?;

        Ok(BetRecord {
            file_pos,
            file_size,
            compressed_size,
            flags,
            name_hash,
        })
    }

    /// Truncated name hash of one record
    pub fn name_hash(&self, index: u32) -> Result<u64> {
        self.name_hashes.get_bits(
            index as usize * self.name_hash_bits as usize,
            self.name_hash_bits,
        )
    }

    /// Parse the decompressed table payload
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < BET_HEADER_SIZE {
            return Err(Error::corrupt("BET table payload too short"));
        }
        let u32_at = |at: usize| u32::from_le_bytes(payload[at..at + 4].try_into().unwrap());

        let entry_count = u32_at(4);
        let table_entry_size = u32_at(12);
        let bit_count_file_pos = u32_at(36);
        let bit_count_file_size = u32_at(40);
        let bit_count_cmp_size = u32_at(44);
        let bit_count_flag_index = u32_at(48);
        let name_hash_bits = u32_at(64);
        let name_hash_array_size = u32_at(68) as usize;
        let flag_count = u32_at(72) as usize;

        if table_entry_size
            != bit_count_file_pos + bit_count_file_size + bit_count_cmp_size + bit_count_flag_index
        {
            return Err(Error::corrupt("BET entry size does not match bit counts"));
        }

        let flags_at = BET_HEADER_SIZE;
        let file_table_at = flags_at + flag_count * 4;
        let file_table_size = (entry_count as usize * table_entry_size as usize).div_ceil(8);
        let hashes_at = file_table_at + file_table_size;

        if payload.len() < hashes_at + name_hash_array_size {
            return Err(Error::corrupt("BET table arrays truncated"));
        }

        let flags = payload[flags_at..file_table_at]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();

        Ok(Self {
            entry_count,
            name_hash_bits,
            bit_count_file_pos,
            bit_count_file_size,
            bit_count_cmp_size,
            bit_count_flag_index,
            table_entry_size,
            flags,
            file_table: BitArray::from_bytes(payload[file_table_at..hashes_at].to_vec()),
            name_hashes: BitArray::from_bytes(
                payload[hashes_at..hashes_at + name_hash_array_size].to_vec(),
            ),
        })
    }

    /// Serialize to the table payload (without the extended header)
    pub fn to_payload(&self) -> Vec<u8> {
        let file_table_bytes = self.file_table.as_bytes();
        let hash_bytes = self.name_hashes.as_bytes();
        let table_size =
            (BET_HEADER_SIZE + self.flags.len() * 4 + file_table_bytes.len() + hash_bytes.len())
                as u32;

        let bit_index_file_pos = 0u32;
        let bit_index_file_size = self.bit_count_file_pos;
        let bit_index_cmp_size = bit_index_file_size + self.bit_count_file_size;
        let bit_index_flag_index = bit_index_cmp_size + self.bit_count_cmp_size;
        let bit_index_unknown = bit_index_flag_index + self.bit_count_flag_index;

        let mut out = Vec::with_capacity(table_size as usize);
        out.extend_from_slice(&table_size.to_le_bytes());
        out.extend_from_slice(&self.entry_count.to_le_bytes());
        out.extend_from_slice(&0x10u32.to_le_bytes());
        out.extend_from_slice(&self.table_entry_size.to_le_bytes());
        out.extend_from_slice(&bit_index_file_pos.to_le_bytes());
        out.extend_from_slice(&bit_index_file_size.to_le_bytes());
        out.extend_from_slice(&bit_index_cmp_size.to_le_bytes());
        out.extend_from_slice(&bit_index_flag_index.to_le_bytes());
        out.extend_from_slice(&bit_index_unknown.to_le_bytes());
        out.extend_from_slice(&self.bit_count_file_pos.to_le_bytes());
        out.extend_from_slice(&self.bit_count_file_size.to_le_bytes());
        out.extend_from_slice(&self.bit_count_cmp_size.to_le_bytes());
        out.extend_from_slice(&self.bit_count_flag_index.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(self.entry_count * self.name_hash_bits).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.name_hash_bits.to_le_bytes());
        out.extend_from_slice(&(hash_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.flags.len() as u32).to_le_bytes());

        for &flags in &self.flags {
            out.extend_from_slice(&flags.to_le_bytes());
        }
        out.extend_from_slice(file_table_bytes);
        out.extend_from_slice(hash_bytes);
        out
    }

    /// Load from the archive stream
    pub fn read(stream: &mut Stream, offset: u64, on_disk_size: usize, key: u32) -> Result<Self> {
        let payload =
            super::load_ext_table(stream, offset, on_disk_size, signatures::BET_TABLE, key)?;
        Self::from_payload(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::BlockFlags;

    fn sample_records() -> Vec<BetRecord> {
        vec![
            BetRecord {
                file_pos: 0x210,
                file_size: 4000,
                compressed_size: 1200,
                flags: (BlockFlags::COMPRESS | BlockFlags::EXISTS).bits(),
                name_hash: 0x1234_5678_9A,
            },
            BetRecord {
                file_pos: 0x6C0,
                file_size: 16,
                compressed_size: 16,
                flags: BlockFlags::EXISTS.bits(),
                name_hash: 0xBBBB_CCCC_DD,
            },
            BetRecord {
                file_pos: 0x6D0,
                file_size: 90000,
                compressed_size: 88000,
                flags: (BlockFlags::COMPRESS | BlockFlags::EXISTS).bits(),
                name_hash: 0x0102_0304_05,
            },
        ]
    }

    #[test]
    fn test_build_and_get() {
        let records = sample_records();
        let table = BetTable::build(&records, 40).unwrap();
        assert_eq!(table.entry_count, 3);

        for (i, record) in records.iter().enumerate() {
            assert_eq!(&table.get(i as u32).unwrap(), record, "record {}", i);
        }
        assert!(table.get(3).is_err());
    }

    #[test]
    fn test_payload_round_trip() {
        let records = sample_records();
        let table = BetTable::build(&records, 40).unwrap();

        let payload = table.to_payload();
        let parsed = BetTable::from_payload(&payload).unwrap();
        assert_eq!(parsed.entry_count, 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(&parsed.get(i as u32).unwrap(), record);
        }
    }

    #[test]
    fn test_flag_array_is_shared() {
        let records = sample_records();
        let table = BetTable::build(&records, 40).unwrap();
        // Two distinct flag combinations across three records
        assert_eq!(table.flags.len(), 2);
    }

    #[test]
    fn test_empty_table() {
        let table = BetTable::build(&[], 40).unwrap();
        let parsed = BetTable::from_payload(&table.to_payload()).unwrap();
        assert_eq!(parsed.entry_count, 0);
    }
}
