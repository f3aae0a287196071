//! DISA and DIFF: the save-data and extdata archive containers.
//!
//! Both keep two copies of their partition table (descriptor); a header
//! byte selects the active one. A commit writes the refreshed descriptor
//! into the inactive slot first and flips the byte last, so a crash in
//! between leaves the old consistent state selected.

pub mod partdesc;

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use crate::fileio::{SharedFile, SubFile};
use crate::hash::sha256;
use crate::{LimonkaError, LimonkaResult};

use partdesc::{open_partition_tree, IvfcTree, Lv4File, PartDesc};

/// One partition of a DISA/DIFF archive.
pub struct Partition {
    desc: PartDesc,
    tree: Arc<Mutex<IvfcTree>>,
}

impl Partition {
    fn load(base: &SharedFile, desc_raw: &[u8], offset: u64, size: u64) -> LimonkaResult<Self> {
        let desc = PartDesc::from_bytes(desc_raw)?;
        let tree = open_partition_tree(SubFile::new(base.clone(), offset, size), &desc)?;
        Ok(Self { desc, tree })
    }

    /// Opens the IVFC level-4 payload as a seekable read-write view.
    #[must_use]
    pub fn open_lv4(&self) -> Lv4File {
        Lv4File::new(self.tree.clone())
    }

    /// Verifies level 1 against the descriptor's master hashes.
    pub fn verify(&self) -> LimonkaResult<()> {
        self.tree.lock().unwrap().verify_master()
    }

    /// Verifies one level-4 block through the whole hash chain.
    pub fn verify_block(&self, block: u64) -> LimonkaResult<()> {
        self.tree.lock().unwrap().verify_lv4_block(block)
    }

    /// The descriptor with the current (possibly updated) master hashes.
    fn current_desc(&self) -> PartDesc {
        let tree = self.tree.lock().unwrap();
        let mut desc = self.desc.clone();
        desc.master_hashes = tree.master_hashes().to_vec();
        desc
    }

    fn dirty(&self) -> bool {
        self.tree.lock().unwrap().dirty()
    }

    fn clear_dirty(&self) {
        self.tree.lock().unwrap().clear_dirty();
    }
}

/// Reads and writes DISA save archives.
pub struct Disa {
    base: SharedFile,
    cmac: [u8; 16],
    header: [u8; 0x100],
    table: Vec<u8>,
    active_table: u8,
    primary_table_offset: u64,
    secondary_table_offset: u64,
    partdesc_slots: Vec<(u64, u64)>,
    pub partitions: Vec<Partition>,
}

impl Disa {
    pub fn new(base: SharedFile) -> LimonkaResult<Self> {
        let mut cmac = [0u8; 16];
        let mut header = [0u8; 0x100];
        {
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut cmac)?;
            guard.seek(SeekFrom::Start(0x100))?;
            guard.read_exact(&mut header)?;
        }

        if &header[0..8] != b"DISA\0\0\x04\0" {
            if header[0..0x20] == [0; 0x20] {
                return Err(LimonkaError::InvalidHeader {
                    container: "DISA (unformatted save)",
                    offset: 0x100,
                });
            }
            return Err(LimonkaError::InvalidHeader {
                container: "DISA",
                offset: 0x100,
            });
        }

        let le64 = |at: usize| u64::from_le_bytes(header[at..at + 8].try_into().unwrap());
        let partition_count = u32::from_le_bytes(header[0x8..0xC].try_into().unwrap());
        let secondary_table_offset = le64(0x10);
        let primary_table_offset = le64(0x18);
        let table_size = le64(0x20);
        let partdesc_a = (le64(0x28), le64(0x30));
        let partdesc_b = (le64(0x38), le64(0x40));
        let partition_a = (le64(0x48), le64(0x50));
        let partition_b = (le64(0x58), le64(0x60));
        let active_table = header[0x68];
        let table_hash = &header[0x6C..0x8C];

        let table_offset = if active_table == 0 {
            primary_table_offset
        } else {
            secondary_table_offset
        };

        let mut table = vec![0u8; table_size as usize];
        {
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(table_offset))?;
            guard.read_exact(&mut table)?;
        }
        if sha256(&table) != table_hash {
            return Err(LimonkaError::InvalidIvfc("active partition table is corrupt"));
        }

        let mut partitions = Vec::new();
        let mut partdesc_slots = Vec::new();
        let mut load = |slot: (u64, u64), partition: (u64, u64)| -> LimonkaResult<()> {
            let desc_raw = table
                .get(slot.0 as usize..(slot.0 + slot.1) as usize)
                .ok_or(LimonkaError::SliceTooSmall)?;
            partitions.push(Partition::load(&base, desc_raw, partition.0, partition.1)?);
            partdesc_slots.push(slot);
            Ok(())
        };
        load(partdesc_a, partition_a)?;
        if partition_count == 2 {
            load(partdesc_b, partition_b)?;
        }

        Ok(Self {
            base,
            cmac,
            header,
            table,
            active_table,
            primary_table_offset,
            secondary_table_offset,
            partdesc_slots,
            partitions,
        })
    }

    #[must_use]
    pub fn cmac(&self) -> &[u8; 16] {
        &self.cmac
    }

    #[must_use]
    pub fn active_table(&self) -> u8 {
        self.active_table
    }

    /// Writes updated partition descriptors to the inactive table slot,
    /// then flips the active-table byte. No-op when nothing was written.
    pub fn commit(&mut self) -> LimonkaResult<()> {
        if !self.partitions.iter().any(|p| p.dirty()) {
            return Ok(());
        }

        let mut table = self.table.clone();
        for (partition, slot) in self.partitions.iter().zip(&self.partdesc_slots) {
            let desc = partition.current_desc().to_bytes();
            table[slot.0 as usize..slot.0 as usize + desc.len()].copy_from_slice(&desc);
        }

        let new_active = self.active_table ^ 1;
        let target_offset = if new_active == 0 {
            self.primary_table_offset
        } else {
            self.secondary_table_offset
        };

        self.header[0x6C..0x8C].copy_from_slice(&sha256(&table));
        self.header[0x68] = new_active;

        {
            let mut guard = self.base.lock().unwrap();
            // descriptor first, flag byte last
            guard.seek(SeekFrom::Start(target_offset))?;
            guard.write_all(&table)?;
            guard.flush()?;
            guard.seek(SeekFrom::Start(0x100))?;
            guard.write_all(&self.header)?;
            guard.flush()?;
        }

        self.table = table;
        self.active_table = new_active;
        for partition in &self.partitions {
            partition.clear_dirty();
        }
        Ok(())
    }
}

/// Reads and writes DIFF extdata archives.
pub struct Diff {
    base: SharedFile,
    cmac: [u8; 16],
    header: [u8; 0x100],
    desc_raw: Vec<u8>,
    active_desc: u32,
    primary_desc_offset: u64,
    secondary_desc_offset: u64,
    unique_identifier: u64,
    pub partition: Partition,
}

impl Diff {
    pub fn new(base: SharedFile) -> LimonkaResult<Self> {
        let mut cmac = [0u8; 16];
        let mut header = [0u8; 0x100];
        {
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut cmac)?;
            guard.seek(SeekFrom::Start(0x100))?;
            guard.read_exact(&mut header)?;
        }

        if &header[0..8] != b"DIFF\0\0\x03\0" {
            return Err(LimonkaError::InvalidHeader {
                container: "DIFF",
                offset: 0x100,
            });
        }

        let le64 = |at: usize| u64::from_le_bytes(header[at..at + 8].try_into().unwrap());
        let secondary_desc_offset = le64(0x8);
        let primary_desc_offset = le64(0x10);
        let desc_size = le64(0x18);
        let partition_offset = le64(0x20);
        let partition_size = le64(0x28);
        let active_desc = u32::from_le_bytes(header[0x30..0x34].try_into().unwrap());
        let desc_hash = &header[0x34..0x54];
        let unique_identifier = le64(0x54);

        let desc_offset = if active_desc == 0 {
            primary_desc_offset
        } else {
            secondary_desc_offset
        };

        let mut desc_raw = vec![0u8; desc_size as usize];
        {
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(desc_offset))?;
            guard.read_exact(&mut desc_raw)?;
        }
        if sha256(&desc_raw) != desc_hash {
            return Err(LimonkaError::InvalidIvfc(
                "active partition descriptor is corrupt",
            ));
        }

        let partition = Partition::load(&base, &desc_raw, partition_offset, partition_size)?;

        Ok(Self {
            base,
            cmac,
            header,
            desc_raw,
            active_desc,
            primary_desc_offset,
            secondary_desc_offset,
            unique_identifier,
            partition,
        })
    }

    #[must_use]
    pub fn cmac(&self) -> &[u8; 16] {
        &self.cmac
    }

    #[must_use]
    pub fn unique_identifier(&self) -> u64 {
        self.unique_identifier
    }

    #[must_use]
    pub fn active_descriptor(&self) -> u32 {
        self.active_desc
    }

    /// Writes the updated descriptor to the inactive slot, then flips the
    /// active-descriptor field.
    pub fn commit(&mut self) -> LimonkaResult<()> {
        if !self.partition.dirty() {
            return Ok(());
        }

        let desc = self.partition.current_desc().to_bytes();
        let mut desc_raw = self.desc_raw.clone();
        desc_raw[..desc.len()].copy_from_slice(&desc);

        let new_active = self.active_desc ^ 1;
        let target_offset = if new_active == 0 {
            self.primary_desc_offset
        } else {
            self.secondary_desc_offset
        };

        self.header[0x34..0x54].copy_from_slice(&sha256(&desc_raw));
        self.header[0x30..0x34].copy_from_slice(&new_active.to_le_bytes());

        {
            let mut guard = self.base.lock().unwrap();
            guard.seek(SeekFrom::Start(target_offset))?;
            guard.write_all(&desc_raw)?;
            guard.flush()?;
            guard.seek(SeekFrom::Start(0x100))?;
            guard.write_all(&self.header)?;
            guard.flush()?;
        }

        self.desc_raw = desc_raw;
        self.active_desc = new_active;
        self.partition.clear_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::partdesc::{Difi, Dpfs, Ivfc, LevelData};
    use super::*;
    use crate::fileio::shared;
    use std::io::Cursor;

    /// Geometry used by the test archives.
    ///
    /// DPFS: lv1 8x2 at 0, lv2 8x2 at 0x10, lv3 0x400x2 at 0x20.
    /// IVFC (within the lv3 stream): lv1/lv2/lv3 one 0x20 hash each,
    /// lv4 0x40 bytes of data at 0x200.
    fn geometry() -> (Difi, Ivfc, Dpfs) {
        let difi = Difi {
            ivfc_offset: 0x44,
            ivfc_size: 0x78,
            dpfs_offset: 0xBC,
            dpfs_size: 0x50,
            part_hash_offset: 0x10C,
            part_hash_size: 0x20,
            enable_external_ivfc_lv4: false,
            dpfs_tree_lv1_selector: 0,
            external_ivfc_lv4_offset: 0,
        };
        let ivfc = Ivfc {
            master_hash_size: 0x20,
            levels: [
                LevelData { offset: 0x00, size: 0x20, block_size_log2: 5 },
                LevelData { offset: 0x80, size: 0x20, block_size_log2: 5 },
                LevelData { offset: 0x100, size: 0x20, block_size_log2: 5 },
                LevelData { offset: 0x200, size: 0x40, block_size_log2: 6 },
            ],
            descriptor_size: 0x78,
        };
        let dpfs = Dpfs {
            levels: [
                LevelData { offset: 0x00, size: 8, block_size_log2: 3 },
                LevelData { offset: 0x10, size: 8, block_size_log2: 3 },
                LevelData { offset: 0x20, size: 0x400, block_size_log2: 9 },
            ],
        };
        (difi, ivfc, dpfs)
    }

    /// Builds the partition image (DPFS area) with a valid IVFC chain over
    /// the given lv4 payload, all in the "0" DPFS chunks.
    fn build_partition(lv4: &[u8; 0x40]) -> (Vec<u8>, [u8; 0x20]) {
        let mut lv3_stream = vec![0u8; 0x400];
        lv3_stream[0x200..0x240].copy_from_slice(lv4);
        let lv4_hash = sha256(&{
            let mut block = [0u8; 0x40];
            block.copy_from_slice(lv4);
            block
        });
        lv3_stream[0x100..0x120].copy_from_slice(&lv4_hash);
        let lv3_hash = sha256(&lv3_stream[0x100..0x120]);
        lv3_stream[0x80..0xA0].copy_from_slice(&lv3_hash);
        let lv2_hash = sha256(&lv3_stream[0x80..0xA0]);
        lv3_stream[0x00..0x20].copy_from_slice(&lv2_hash);
        let master = sha256(&lv3_stream[0x00..0x20]);

        // partition: lv1 chunks (all zero bits), lv2 chunks (zero bits),
        // lv3 chunk0 = stream, chunk1 = zeros
        let mut partition = vec![0u8; 0x20 + 0x800];
        partition[0x20..0x420].copy_from_slice(&lv3_stream);
        (partition, master)
    }

    fn build_partdesc(master: &[u8; 0x20]) -> Vec<u8> {
        let (difi, ivfc, dpfs) = geometry();
        let mut out = vec![0u8; 0x12C];
        out[..0x44].copy_from_slice(&difi.to_bytes());
        out[0x44..0xBC].copy_from_slice(&ivfc.to_bytes());
        out[0xBC..0x10C].copy_from_slice(&dpfs.to_bytes());
        out[0x10C..0x12C].copy_from_slice(master);
        out
    }

    fn build_disa(lv4: &[u8; 0x40]) -> Vec<u8> {
        let (partition, master) = build_partition(lv4);
        let desc = build_partdesc(&master);

        let primary_table = 0x200u64;
        let secondary_table = 0x400u64;
        let partition_offset = 0x1000u64;

        let mut out = vec![0u8; partition_offset as usize + partition.len()];
        out[0x100..0x108].copy_from_slice(b"DISA\0\0\x04\0");
        out[0x108..0x10C].copy_from_slice(&1u32.to_le_bytes());
        out[0x110..0x118].copy_from_slice(&secondary_table.to_le_bytes());
        out[0x118..0x120].copy_from_slice(&primary_table.to_le_bytes());
        out[0x120..0x128].copy_from_slice(&(desc.len() as u64).to_le_bytes());
        // partdesc A at table offset 0
        out[0x128..0x130].copy_from_slice(&0u64.to_le_bytes());
        out[0x130..0x138].copy_from_slice(&(desc.len() as u64).to_le_bytes());
        out[0x148..0x150].copy_from_slice(&partition_offset.to_le_bytes());
        out[0x150..0x158].copy_from_slice(&(partition.len() as u64).to_le_bytes());
        out[0x168] = 0; // primary table active
        out[0x16C..0x18C].copy_from_slice(&sha256(&desc));

        out[primary_table as usize..primary_table as usize + desc.len()].copy_from_slice(&desc);
        out[partition_offset as usize..].copy_from_slice(&partition);
        out
    }

    #[test]
    fn reads_lv4_payload_and_verifies() {
        let mut lv4 = [0u8; 0x40];
        lv4[..14].copy_from_slice(b"save contents!");
        let disa = Disa::new(shared(Cursor::new(build_disa(&lv4)))).unwrap();
        assert_eq!(disa.active_table(), 0);

        let partition = &disa.partitions[0];
        partition.verify().unwrap();
        partition.verify_block(0).unwrap();

        let mut payload = Vec::new();
        partition.open_lv4().read_to_end(&mut payload).unwrap();
        assert_eq!(payload.len(), 0x40);
        assert_eq!(&payload[..14], b"save contents!");
    }

    #[test]
    fn corrupt_table_hash_is_rejected() {
        let lv4 = [0u8; 0x40];
        let mut image = build_disa(&lv4);
        image[0x200] ^= 0xFF;
        assert!(matches!(
            Disa::new(shared(Cursor::new(image))),
            Err(LimonkaError::InvalidIvfc(_))
        ));
    }

    #[test]
    fn unformatted_save_is_reported() {
        let image = vec![0u8; 0x1000];
        assert!(matches!(
            Disa::new(shared(Cursor::new(image))),
            Err(LimonkaError::InvalidHeader {
                container: "DISA (unformatted save)",
                ..
            })
        ));
    }

    #[test]
    fn write_commit_flips_active_table() {
        let mut lv4 = [0u8; 0x40];
        lv4[..5].copy_from_slice(b"first");
        let image = build_disa(&lv4);
        let base = shared(Cursor::new(image));

        let mut disa = Disa::new(base.clone()).unwrap();
        {
            let mut payload = disa.partitions[0].open_lv4();
            payload.write_all(b"patched").unwrap();
        }
        disa.commit().unwrap();
        assert_eq!(disa.active_table(), 1);

        // reopen from the same backing bytes
        let disa = Disa::new(base).unwrap();
        assert_eq!(disa.active_table(), 1);
        disa.partitions[0].verify().unwrap();
        disa.partitions[0].verify_block(0).unwrap();
        let mut payload = Vec::new();
        disa.partitions[0]
            .open_lv4()
            .read_to_end(&mut payload)
            .unwrap();
        assert_eq!(&payload[..7], b"patched");
    }

    #[test]
    fn commit_without_writes_is_a_no_op() {
        let lv4 = [0u8; 0x40];
        let base = shared(Cursor::new(build_disa(&lv4)));
        let mut disa = Disa::new(base).unwrap();
        disa.commit().unwrap();
        assert_eq!(disa.active_table(), 0);
    }

    fn build_diff(lv4: &[u8; 0x40]) -> Vec<u8> {
        let (partition, master) = build_partition(lv4);
        let desc = build_partdesc(&master);

        let primary_desc = 0x200u64;
        let secondary_desc = 0x400u64;
        let partition_offset = 0x1000u64;

        let mut out = vec![0u8; partition_offset as usize + partition.len()];
        out[0x100..0x108].copy_from_slice(b"DIFF\0\0\x03\0");
        out[0x108..0x110].copy_from_slice(&secondary_desc.to_le_bytes());
        out[0x110..0x118].copy_from_slice(&primary_desc.to_le_bytes());
        out[0x118..0x120].copy_from_slice(&(desc.len() as u64).to_le_bytes());
        out[0x120..0x128].copy_from_slice(&partition_offset.to_le_bytes());
        out[0x128..0x130].copy_from_slice(&(partition.len() as u64).to_le_bytes());
        out[0x130..0x134].copy_from_slice(&0u32.to_le_bytes());
        out[0x134..0x154].copy_from_slice(&sha256(&desc));
        out[0x154..0x15C].copy_from_slice(&0xDEADBEEFu64.to_le_bytes());

        out[primary_desc as usize..primary_desc as usize + desc.len()].copy_from_slice(&desc);
        out[partition_offset as usize..].copy_from_slice(&partition);
        out
    }

    #[test]
    fn diff_round_trip_with_commit() {
        let mut lv4 = [0u8; 0x40];
        lv4[..7].copy_from_slice(b"extdata");
        let base = shared(Cursor::new(build_diff(&lv4)));

        let mut diff = Diff::new(base.clone()).unwrap();
        assert_eq!(diff.unique_identifier(), 0xDEADBEEF);
        diff.partition.verify().unwrap();

        let mut payload = Vec::new();
        diff.partition.open_lv4().read_to_end(&mut payload).unwrap();
        assert_eq!(&payload[..7], b"extdata");

        {
            let mut writer = diff.partition.open_lv4();
            writer.seek(SeekFrom::Start(8)).unwrap();
            writer.write_all(b"updated").unwrap();
        }
        diff.commit().unwrap();
        assert_eq!(diff.active_descriptor(), 1);

        let diff = Diff::new(base).unwrap();
        assert_eq!(diff.active_descriptor(), 1);
        diff.partition.verify().unwrap();
        let mut payload = Vec::new();
        diff.partition.open_lv4().read_to_end(&mut payload).unwrap();
        assert_eq!(&payload[8..15], b"updated");
    }
}
