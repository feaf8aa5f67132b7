use block_io::BufferedReader;
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
    little_endian::{U32, U64},
};

use crate::error::{Error, Result};
use crate::nonce::generate_secondary_nonce;
use crate::region::{
    LayoutRegion, RegionIterator, RegionKind, RegionTable, RegionType, SOLE_INSTANCE,
};
use crate::superblock::SuperBlockData;

pub(crate) const INDEX_SAVE_DATA_VERSION: u32 = 1;
pub(crate) const INDEX_SAVE_DATA_SIZE: usize = core::mem::size_of::<IndexSaveData>();

/// Upper bound on the opaque state buffer a save may carry in its header
/// block.
pub(crate) const MAX_STATE_BUFFER_SIZE: usize = 512;

/// Whether a snapshot carries the open chapter.
///
/// A save is taken at clean shutdown and includes the open chapter; a
/// checkpoint is taken mid-flight and omits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveType {
    Save,
    Checkpoint,
}

impl SaveType {
    fn region_type(self) -> RegionType {
        match self {
            SaveType::Save => RegionType::Save,
            SaveType::Checkpoint => RegionType::Checkpoint,
        }
    }
}

/// A sub-region of a save slot that a producer reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveContent {
    IndexPageMap,
    OpenChapter,
    VolumeIndexZone(u32),
}

/// The fixed part of a slot's header payload.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct IndexSaveData {
    timestamp_ms: U64,
    nonce: U64,
    version: U32,
    unused: U32,
}

impl IndexSaveData {
    pub(crate) fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms.get()
    }

    pub(crate) fn nonce(&self) -> u64 {
        self.nonce.get()
    }
}

/// Derive a slot's nonce from the sub-index nonce, the save data with the
/// nonce field zeroed, and the slot's start block.
pub(crate) fn generate_save_nonce(
    sub_index_nonce: u64,
    save_data: &IndexSaveData,
    start_block: u64,
) -> u64 {
    let mut scrubbed = *save_data;
    scrubbed.nonce = U64::new(0);
    let mut buffer = [0u8; INDEX_SAVE_DATA_SIZE + 8];
    buffer[..INDEX_SAVE_DATA_SIZE].copy_from_slice(scrubbed.as_bytes());
    buffer[INDEX_SAVE_DATA_SIZE..].copy_from_slice(&start_block.to_le_bytes());
    generate_secondary_nonce(sub_index_nonce, &buffer)
}

/// One of the rotating save slots inside the sub-index.
///
/// A slot is observable in four states: empty (freshly reset, type
/// `Unsaved`), written (a complete header is on disk), valid (the header's
/// nonce verifies), and invalid (written but rejected). All of them are
/// carried by this one type; `validate` distinguishes the last two.
pub(crate) struct IndexSaveLayout {
    /// The whole slot within the sub-index.
    pub index_save: LayoutRegion,
    pub header: LayoutRegion,
    pub index_page_map: LayoutRegion,
    pub volume_index_zones: Vec<LayoutRegion>,
    pub open_chapter: Option<LayoutRegion>,
    pub free_space: Option<LayoutRegion>,
    pub region_type: RegionType,
    pub save_data: IndexSaveData,
    pub state_buffer: Option<Vec<u8>>,
}

impl IndexSaveLayout {
    /// An empty slot: header, page map, and scratch for the remainder.
    pub(crate) fn reset(index_save: LayoutRegion, page_map_blocks: u64) -> Self {
        let start = index_save.start_block();
        let header = LayoutRegion::new(start, 1, RegionKind::Header, SOLE_INSTANCE);
        let index_page_map = LayoutRegion::new(
            start + 1,
            page_map_blocks,
            RegionKind::IndexPageMap,
            SOLE_INSTANCE,
        );
        let free_blocks = index_save
            .block_count()
            .saturating_sub(1 + page_map_blocks);
        let free_space = (free_blocks > 0).then(|| {
            LayoutRegion::new(
                start + 1 + page_map_blocks,
                free_blocks,
                RegionKind::Scratch,
                SOLE_INSTANCE,
            )
        });
        Self {
            index_save,
            header,
            index_page_map,
            volume_index_zones: Vec::new(),
            open_chapter: None,
            free_space,
            region_type: RegionType::Unsaved,
            save_data: IndexSaveData::new_zeroed(),
            state_buffer: None,
        }
    }

    /// Turn a reset slot into an in-flight save: split the post-header block
    /// budget evenly across the volume index zones, reserve the open chapter
    /// for a full save, and stamp fresh save data whose nonce chains to the
    /// sub-index.
    pub(crate) fn instantiate(
        &mut self,
        super_block: &SuperBlockData,
        sub_index_nonce: u64,
        zone_count: u32,
        save_type: SaveType,
        now_ms: u64,
    ) -> Result<()> {
        if zone_count == 0 {
            return Err(Error::BadState("a save needs at least one zone"));
        }
        let page_map_blocks = super_block.page_map_blocks();
        let open_chapter_blocks = match save_type {
            SaveType::Save => super_block.open_chapter_blocks(),
            SaveType::Checkpoint => 0,
        };
        let budget = self
            .index_save
            .block_count()
            .checked_sub(1 + page_map_blocks + open_chapter_blocks)
            .ok_or(Error::BadState("save slot is too small"))?;
        let zone_blocks = budget / u64::from(zone_count);
        if zone_blocks == 0 {
            return Err(Error::BadState("too many zones for the save slot"));
        }
        let scratch_blocks = budget - zone_blocks * u64::from(zone_count);

        let start = self.index_save.start_block();
        let mut next_block = start + 1 + page_map_blocks;
        self.volume_index_zones = (0..zone_count)
            .map(|zone| {
                let region =
                    LayoutRegion::new(next_block, zone_blocks, RegionKind::VolumeIndex, zone as u16);
                next_block += zone_blocks;
                region
            })
            .collect();
        self.open_chapter = (save_type == SaveType::Save).then(|| {
            let region = LayoutRegion::new(
                next_block,
                open_chapter_blocks,
                RegionKind::OpenChapter,
                SOLE_INSTANCE,
            );
            next_block += open_chapter_blocks;
            region
        });
        self.free_space = (scratch_blocks > 0).then(|| {
            LayoutRegion::new(next_block, scratch_blocks, RegionKind::Scratch, SOLE_INSTANCE)
        });

        self.region_type = save_type.region_type();
        let mut save_data = IndexSaveData {
            timestamp_ms: U64::new(now_ms),
            nonce: U64::new(0),
            version: U32::new(INDEX_SAVE_DATA_VERSION),
            unused: U32::new(0),
        };
        save_data.nonce = U64::new(generate_save_nonce(sub_index_nonce, &save_data, start));
        self.save_data = save_data;
        self.state_buffer = Some(Vec::with_capacity(MAX_STATE_BUFFER_SIZE));
        Ok(())
    }

    /// The slot's one-block header table.
    pub(crate) fn build_table(&self) -> Result<RegionTable> {
        let mut regions = vec![self.header, self.index_page_map];
        regions.extend(self.volume_index_zones.iter().copied());
        if let Some(open_chapter) = self.open_chapter {
            regions.push(open_chapter);
        }
        if let Some(free_space) = self.free_space {
            regions.push(free_space);
        }
        let payload = match self.region_type {
            RegionType::Unsaved => 0,
            _ => {
                let state_len = self.state_buffer.as_ref().map_or(0, Vec::len);
                u16::try_from(INDEX_SAVE_DATA_SIZE + state_len)
                    .map_err(|_| Error::BadState("state buffer too large"))?
            }
        };
        RegionTable::new(
            self.region_type,
            self.index_save.block_count(),
            payload,
            regions,
        )
    }

    /// Reconstruct a slot from its on-disk header. The table and payload
    /// have to be internally consistent with the slot region and the
    /// superblock geometry; the caller decides what to do with a slot that
    /// fails (open treats it as invalid rather than aborting).
    pub(crate) fn load(
        index_save: LayoutRegion,
        super_block: &SuperBlockData,
        reader: &mut BufferedReader,
    ) -> Result<Self> {
        let table = RegionTable::read_from(reader)?;
        let region_type = table.region_type()?;
        if region_type == RegionType::Super {
            return Err(Error::CorruptComponent("save slot header type"));
        }
        if table.header.region_blocks() != index_save.block_count() {
            return Err(Error::CorruptComponent("save slot header size"));
        }

        let start = index_save.start_block();
        let mut iter = RegionIterator::new(&table.regions, start);
        let header = iter
            .expect(RegionKind::Header, SOLE_INSTANCE, Some(1), "save slot header region")
            .unwrap_or_else(|| LayoutRegion::new(start, 1, RegionKind::Header, SOLE_INSTANCE));
        let index_page_map = iter
            .expect(
                RegionKind::IndexPageMap,
                SOLE_INSTANCE,
                Some(super_block.page_map_blocks()),
                "save slot page map region",
            )
            .unwrap_or(header);
        let mut volume_index_zones = Vec::new();
        while let Some(zone) =
            iter.accept(RegionKind::VolumeIndex, volume_index_zones.len() as u16, None)
        {
            volume_index_zones.push(zone);
        }
        let open_chapter = iter.accept(
            RegionKind::OpenChapter,
            SOLE_INSTANCE,
            Some(super_block.open_chapter_blocks()),
        );
        // The trailing scratch region may be absent when the zones consumed
        // the whole budget.
        let free_space = iter.accept(RegionKind::Scratch, SOLE_INSTANCE, None);
        iter.finish(index_save.end_block())?;

        if region_type == RegionType::Checkpoint && open_chapter.is_some() {
            return Err(Error::CorruptComponent("checkpoint with an open chapter"));
        }
        if region_type == RegionType::Save && open_chapter.is_none() {
            return Err(Error::CorruptComponent("save without an open chapter"));
        }

        let payload = usize::from(table.header.payload());
        let (save_data, state_buffer) = if region_type == RegionType::Unsaved {
            if payload != 0 {
                return Err(Error::CorruptComponent("unsaved slot payload"));
            }
            (IndexSaveData::new_zeroed(), None)
        } else {
            let state_len = payload
                .checked_sub(INDEX_SAVE_DATA_SIZE)
                .ok_or(Error::CorruptComponent("save data size"))?;
            if state_len > MAX_STATE_BUFFER_SIZE {
                return Err(Error::CorruptComponent("state buffer size"));
            }
            let mut bytes = [0u8; INDEX_SAVE_DATA_SIZE];
            reader.read_fully(&mut bytes)?;
            let save_data = IndexSaveData::read_from_bytes(&bytes)
                .map_err(|_| Error::CorruptComponent("save data"))?;
            if save_data.version.get() != INDEX_SAVE_DATA_VERSION {
                return Err(Error::UnsupportedVersion(save_data.version.get()));
            }
            let mut state = vec![0; state_len];
            reader.read_fully(&mut state)?;
            (save_data, Some(state))
        };

        Ok(Self {
            index_save,
            header,
            index_page_map,
            volume_index_zones,
            open_chapter,
            free_space,
            region_type,
            save_data,
            state_buffer,
        })
    }

    /// `Some(timestamp)` when the slot holds a genuine snapshot.
    pub(crate) fn validate(&self, sub_index_nonce: u64) -> Option<u64> {
        if self.region_type == RegionType::Unsaved {
            return None;
        }
        if self.volume_index_zones.is_empty() {
            return None;
        }
        let timestamp = self.save_data.timestamp_ms();
        if timestamp == 0 {
            return None;
        }
        let expected =
            generate_save_nonce(sub_index_nonce, &self.save_data, self.index_save.start_block());
        if expected != self.save_data.nonce() {
            return None;
        }
        Some(timestamp)
    }

    pub(crate) fn zone_count(&self) -> u32 {
        self.volume_index_zones.len() as u32
    }
}

/// The slot to overwrite next: any invalid slot, otherwise the
/// least-recently-written valid one. Ties go to the lowest index.
pub(crate) fn select_oldest_slot(slots: &[IndexSaveLayout], sub_index_nonce: u64) -> usize {
    let mut oldest = 0;
    let mut oldest_timestamp = u64::MAX;
    for (index, slot) in slots.iter().enumerate() {
        let timestamp = slot.validate(sub_index_nonce).unwrap_or(0);
        if timestamp < oldest_timestamp {
            oldest_timestamp = timestamp;
            oldest = index;
        }
    }
    oldest
}

/// The newest valid slot, if any. Ties go to the highest index so the
/// choice is deterministic when two saves land in the same millisecond.
pub(crate) fn select_latest_slot(slots: &[IndexSaveLayout], sub_index_nonce: u64) -> Option<usize> {
    let mut latest = None;
    let mut latest_timestamp = 0;
    for (index, slot) in slots.iter().enumerate() {
        if let Some(timestamp) = slot.validate(sub_index_nonce) {
            if timestamp >= latest_timestamp {
                latest_timestamp = timestamp;
                latest = Some(index);
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use block_io::{BufferedWriter, IoFactory, IoRegion, MemoryIoFactory};

    use super::*;
    use crate::config::IndexConfig;
    use crate::context::RandomSource;
    use crate::geometry::SaveLayoutSizes;

    const BLOCK: usize = 4096;
    const NONCE: u64 = 0x1122_3344_5566_7788;

    struct FixedRandom;

    impl RandomSource for FixedRandom {
        fn fill_bytes(&self, buf: &mut [u8]) {
            buf.fill(9);
        }
    }

    fn super_block() -> SuperBlockData {
        let sizes = SaveLayoutSizes::new(&IndexConfig::small_for_tests(), BLOCK as u32).unwrap();
        SuperBlockData::generate(&sizes, &FixedRandom)
    }

    fn slot_region() -> LayoutRegion {
        // An 8-block slot starting at block 19, as in the small test config.
        LayoutRegion::new(19, 8, RegionKind::Save, 0)
    }

    fn instantiated(save_type: SaveType, zones: u32, now_ms: u64) -> IndexSaveLayout {
        let mut slot = IndexSaveLayout::reset(slot_region(), 1);
        slot.instantiate(&super_block(), NONCE, zones, save_type, now_ms)
            .unwrap();
        slot
    }

    fn store_and_load(slot: &IndexSaveLayout) -> Result<IndexSaveLayout> {
        let factory = Arc::new(MemoryIoFactory::new(BLOCK));
        let shared: Arc<dyn IoFactory> = factory.clone();
        let region = IoRegion::new(shared, 0, BLOCK as u64).unwrap();
        let mut writer = BufferedWriter::new(region.clone(), BLOCK).unwrap();
        slot.build_table().unwrap().write_to(&mut writer).unwrap();
        if slot.region_type != RegionType::Unsaved {
            writer.write(slot.save_data.as_bytes()).unwrap();
            if let Some(state) = &slot.state_buffer {
                writer.write(state).unwrap();
            }
        }
        writer.flush().unwrap();

        let mut reader = BufferedReader::new(region, BLOCK).unwrap();
        IndexSaveLayout::load(slot_region(), &super_block(), &mut reader)
    }

    #[test]
    fn test_save_data_size() {
        assert_eq!(24, INDEX_SAVE_DATA_SIZE);
    }

    #[test]
    fn test_reset_geometry() {
        let slot = IndexSaveLayout::reset(slot_region(), 1);
        assert_eq!(RegionType::Unsaved, slot.region_type);
        assert_eq!(19, slot.header.start_block());
        assert_eq!(20, slot.index_page_map.start_block());
        let free_space = slot.free_space.unwrap();
        assert_eq!(21, free_space.start_block());
        assert_eq!(27, free_space.end_block());
        assert!(slot.volume_index_zones.is_empty());
        assert!(slot.open_chapter.is_none());
        assert!(slot.state_buffer.is_none());
        assert_eq!(None, slot.validate(NONCE));
    }

    #[test]
    fn test_instantiate_save_geometry() {
        let slot = instantiated(SaveType::Save, 1, 1000);
        // 8 blocks: header, page map, then 4 zone blocks and 2 open chapter
        // blocks leave nothing for scratch.
        assert_eq!(1, slot.volume_index_zones.len());
        assert_eq!(21, slot.volume_index_zones[0].start_block());
        assert_eq!(4, slot.volume_index_zones[0].block_count());
        let open_chapter = slot.open_chapter.unwrap();
        assert_eq!(25, open_chapter.start_block());
        assert_eq!(27, open_chapter.end_block());
        assert!(slot.free_space.is_none());
        assert_eq!(Some(1000), slot.validate(NONCE));
    }

    #[test]
    fn test_instantiate_checkpoint_geometry() {
        let slot = instantiated(SaveType::Checkpoint, 2, 1000);
        // Without the open chapter the 6-block budget splits across 2 zones.
        assert!(slot.open_chapter.is_none());
        assert_eq!(2, slot.volume_index_zones.len());
        assert_eq!(3, slot.volume_index_zones[0].block_count());
        assert_eq!(3, slot.volume_index_zones[1].block_count());
        assert!(slot.free_space.is_none());
    }

    #[test]
    fn test_uneven_zone_split_leaves_scratch() {
        let slot = instantiated(SaveType::Save, 3, 1000);
        // 4 blocks across 3 zones: one each, one block of scratch.
        assert_eq!(3, slot.volume_index_zones.len());
        for zone in &slot.volume_index_zones {
            assert_eq!(1, zone.block_count());
        }
        assert_eq!(1, slot.free_space.unwrap().block_count());
    }

    #[test]
    fn test_too_many_zones() {
        let mut slot = IndexSaveLayout::reset(slot_region(), 1);
        assert!(matches!(
            slot.instantiate(&super_block(), NONCE, 5, SaveType::Save, 1000),
            Err(Error::BadState(_))
        ));
    }

    #[test]
    fn test_unsaved_round_trip() {
        let slot = IndexSaveLayout::reset(slot_region(), 1);
        let loaded = store_and_load(&slot).unwrap();
        assert_eq!(RegionType::Unsaved, loaded.region_type);
        assert_eq!(None, loaded.validate(NONCE));
        assert!(loaded.state_buffer.is_none());
    }

    #[test]
    fn test_save_round_trip() {
        let mut slot = instantiated(SaveType::Save, 1, 12345);
        slot.state_buffer.as_mut().unwrap().extend_from_slice(&[0x11; 16]);
        let loaded = store_and_load(&slot).unwrap();
        assert_eq!(RegionType::Save, loaded.region_type);
        assert_eq!(slot.save_data, loaded.save_data);
        assert_eq!(Some(&vec![0x11; 16]), loaded.state_buffer.as_ref());
        assert_eq!(Some(12345), loaded.validate(NONCE));
        assert_eq!(1, loaded.zone_count());
    }

    #[test]
    fn test_wrong_nonce_is_invalid() {
        let slot = instantiated(SaveType::Save, 1, 12345);
        assert_eq!(None, slot.validate(NONCE + 1));
    }

    #[test]
    fn test_checkpoint_never_stores_open_chapter() {
        let mut slot = instantiated(SaveType::Checkpoint, 1, 5);
        slot.state_buffer.as_mut().unwrap().push(1);
        let loaded = store_and_load(&slot).unwrap();
        assert_eq!(RegionType::Checkpoint, loaded.region_type);
        assert!(loaded.open_chapter.is_none());
        assert_eq!(Some(5), loaded.validate(NONCE));
    }

    #[test]
    fn test_selection_prefers_invalid_then_oldest() {
        let empty = IndexSaveLayout::reset(slot_region(), 1);
        let old = instantiated(SaveType::Save, 1, 100);
        let new = instantiated(SaveType::Save, 1, 200);

        let slots = vec![old, empty, new];
        assert_eq!(1, select_oldest_slot(&slots, NONCE));
        assert_eq!(2, select_latest_slot(&slots, NONCE).unwrap());

        let slots: Vec<_> = slots
            .into_iter()
            .map(|slot| match slot.region_type {
                RegionType::Unsaved => instantiated(SaveType::Save, 1, 300),
                _ => slot,
            })
            .collect();
        assert_eq!(0, select_oldest_slot(&slots, NONCE));
    }

    #[test]
    fn test_selection_tie_breaks() {
        let a = instantiated(SaveType::Save, 1, 100);
        let b = instantiated(SaveType::Save, 1, 100);
        let slots = vec![a, b];
        // Equal timestamps: the later slot wins the latest pick, the earlier
        // one the oldest pick.
        assert_eq!(1, select_latest_slot(&slots, NONCE).unwrap());
        assert_eq!(0, select_oldest_slot(&slots, NONCE));
    }

    #[test]
    fn test_no_valid_slots() {
        let slots = vec![
            IndexSaveLayout::reset(slot_region(), 1),
            IndexSaveLayout::reset(slot_region(), 1),
        ];
        assert_eq!(None, select_latest_slot(&slots, NONCE));
    }
}
