use std::sync::Arc;

use block_io::{BufferedReader, BufferedWriter, IoError, IoFactory, IoRegion};
use log::{debug, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::config::{CONFIG_DATA_SIZE, ConfigData, IndexConfig};
use crate::context::LayoutContext;
use crate::error::{Error, Result};
use crate::geometry::{SaveLayoutSizes, validate_block_size};
use crate::nonce::generate_secondary_nonce;
use crate::region::{
    LayoutRegion, RegionKind, RegionTable, RegionType, SOLE_INSTANCE,
};
use crate::save_slot::{
    IndexSaveLayout, MAX_STATE_BUFFER_SIZE, SaveContent, SaveType, select_latest_slot,
    select_oldest_slot,
};
use crate::superblock::{SUPER_BLOCK_DATA_SIZE, SuperBlockData};

/// The sub-index: the volume plus the rotating save slots, tied together by
/// a nonce derived from the superblock.
struct SubIndexLayout {
    region: LayoutRegion,
    nonce: u64,
    volume: LayoutRegion,
    saves: Vec<IndexSaveLayout>,
}

/// Derive the sub-index nonce from the master nonce, the sub-index start
/// block, and the sub-index id (always 0). If the derivation lands on zero,
/// retry with the two's complement of the master nonce; zero is reserved to
/// mean "no nonce".
fn define_sub_index_nonce(master_nonce: u64, start_block: u64) -> u64 {
    let mut buffer = [0u8; 10];
    buffer[..8].copy_from_slice(&start_block.to_le_bytes());
    let nonce = generate_secondary_nonce(master_nonce, &buffer);
    if nonce != 0 {
        nonce
    } else {
        generate_secondary_nonce(master_nonce.wrapping_neg(), &buffer)
    }
}

fn check_top_region(
    region: &LayoutRegion,
    kind: RegionKind,
    instance: u16,
    start_block: u64,
    block_count: Option<u64>,
) -> Result<()> {
    if region.kind()? != kind
        || region.instance() != instance
        || region.start_block() != start_block
        || region.block_count() == 0
        || block_count.is_some_and(|count| region.block_count() != count)
    {
        return Err(Error::CorruptComponent("layout region table"));
    }
    Ok(())
}

/// Owner of the on-disk geometry of one index: the superblock, the fixed
/// top-level regions, and the save slot array.
pub struct IndexLayout {
    factory: Arc<dyn IoFactory>,
    context: LayoutContext,
    block_size: u32,
    total_blocks: u64,
    super_block: SuperBlockData,
    header: LayoutRegion,
    config: LayoutRegion,
    seal: LayoutRegion,
    sub_index: SubIndexLayout,
}

impl IndexLayout {
    /// Lay out and persist a brand-new index in `capacity` bytes starting at
    /// `offset`. All size and alignment failures are reported before
    /// anything is written. The superblock goes out last, so a layout that
    /// failed mid-create can never validate.
    pub fn create(
        factory: Arc<dyn IoFactory>,
        offset: u64,
        capacity: u64,
        block_size: u32,
        config: &IndexConfig,
        context: LayoutContext,
    ) -> Result<Self> {
        let sizes = SaveLayoutSizes::new(config, block_size)?;
        if offset % u64::from(block_size) != 0 {
            return Err(Error::IncorrectAlignment("layout offset must be block aligned"));
        }
        let needed = sizes.total_blocks * u64::from(block_size);
        if needed > capacity {
            return Err(Error::InsufficientIndexSpace {
                needed,
                available: capacity,
            });
        }
        if offset + needed > factory.capacity() {
            return Err(Error::InsufficientIndexSpace {
                needed: offset + needed,
                available: factory.capacity(),
            });
        }

        let super_block = SuperBlockData::generate(&sizes, context.random.as_ref());
        let layout = Self::generate_layout(factory, context, block_size, offset, &sizes, super_block);

        // Kill any stale slot headers first so old data can never validate,
        // then persist the empty slots, the config, and finally the
        // superblock with the top-level table.
        let zero_block = vec![0; block_size as usize];
        for index in 0..layout.sub_index.saves.len() {
            let region = layout.block_region(&layout.sub_index.saves[index].header)?;
            region.write(0, &zero_block)?;
            layout.write_slot_header(index)?;
        }
        layout.write_config(config)?;
        layout.write_super_block()?;
        layout.factory.sync()?;
        info!(
            "created index layout of {} blocks of {} bytes at offset {}",
            layout.total_blocks, block_size, offset
        );
        Ok(layout)
    }

    /// Read an existing layout back. A slot whose header is unreadable or
    /// malformed is kept as an invalid slot rather than failing the open; a
    /// failing device read does fail the open.
    pub fn open(
        factory: Arc<dyn IoFactory>,
        offset: u64,
        capacity: u64,
        block_size: u32,
        context: LayoutContext,
    ) -> Result<Self> {
        validate_block_size(block_size)?;
        if offset % u64::from(block_size) != 0 {
            return Err(Error::IncorrectAlignment("layout offset must be block aligned"));
        }
        let first_block = offset / u64::from(block_size);

        let header_region = IoRegion::new(factory.clone(), offset, u64::from(block_size))
            .map_err(Error::from)?;
        let mut reader = BufferedReader::new(header_region, block_size as usize)?;
        let table = RegionTable::read_from(&mut reader)?;
        if table.region_type()? != RegionType::Super {
            return Err(Error::CorruptComponent("layout header type"));
        }
        if usize::from(table.header.payload()) != SUPER_BLOCK_DATA_SIZE {
            return Err(Error::CorruptComponent("superblock size"));
        }
        let mut bytes = [0u8; SUPER_BLOCK_DATA_SIZE];
        reader.read_fully(&mut bytes)?;
        let super_block = SuperBlockData::read_from_bytes(&bytes)
            .map_err(|_| Error::CorruptComponent("superblock"))?;
        super_block.validate(block_size)?;

        let layout =
            Self::reconstitute(factory, context, block_size, first_block, capacity, table, super_block)?;
        info!(
            "opened index layout of {} blocks of {} bytes at offset {}",
            layout.total_blocks, block_size, offset
        );
        Ok(layout)
    }

    /// Check the stored configuration against what the caller expects.
    pub fn verify_config(&self, expected: &IndexConfig) -> Result<()> {
        let mut reader = self.region_reader(&self.config)?;
        let mut bytes = [0u8; CONFIG_DATA_SIZE];
        reader.read_fully(&mut bytes)?;
        let data =
            ConfigData::read_from_bytes(&bytes).map_err(|_| Error::CorruptComponent("config"))?;
        data.validate()?;
        if data.to_config() != *expected {
            warn!("the stored index configuration does not match the expected one");
            return Err(Error::NoIndex);
        }
        Ok(())
    }

    /// Claim the oldest slot for a new save. The slot's invalidation header
    /// is durable before this returns, so at most one slot is ever in an
    /// indeterminate state.
    pub fn setup_save_slot(&mut self, zone_count: u32, save_type: SaveType) -> Result<u32> {
        let index = select_oldest_slot(&self.sub_index.saves, self.sub_index.nonce);
        let region = self.sub_index.saves[index].index_save;
        self.sub_index.saves[index] =
            IndexSaveLayout::reset(region, self.super_block.page_map_blocks());
        self.write_slot_header(index)?;
        self.factory.sync()?;

        let super_block = self.super_block;
        let nonce = self.sub_index.nonce;
        let now_ms = self.context.time.now_ms();
        self.sub_index.saves[index].instantiate(&super_block, nonce, zone_count, save_type, now_ms)?;
        debug!("set up save slot {index} with {zone_count} zones");
        Ok(index as u32)
    }

    /// The opaque state buffer the caller fills before committing.
    pub fn state_buffer_mut(&mut self, slot: u32) -> Result<&mut Vec<u8>> {
        self.save_slot_mut(slot)?
            .state_buffer
            .as_mut()
            .ok_or(Error::BadState("save slot has no state buffer"))
    }

    pub fn state_buffer(&self, slot: u32) -> Result<&[u8]> {
        self.save_slot(slot)?
            .state_buffer
            .as_deref()
            .ok_or(Error::BadState("save slot has no state buffer"))
    }

    pub fn open_save_writer(&self, slot: u32, content: SaveContent) -> Result<BufferedWriter> {
        let region = self.save_content_region(slot, content)?;
        BufferedWriter::new(self.block_region(&region)?, self.block_size as usize)
            .map_err(Error::from)
    }

    pub fn open_save_reader(&self, slot: u32, content: SaveContent) -> Result<BufferedReader> {
        let region = self.save_content_region(slot, content)?;
        BufferedReader::new(self.block_region(&region)?, self.block_size as usize)
            .map_err(Error::from)
    }

    /// Make the save durable. The body regions must already be written;
    /// they are fenced by a sync before the header block, which is the
    /// commit point, goes out.
    pub fn commit_save(&mut self, slot: u32) -> Result<()> {
        let index = self.slot_index(slot)?;
        {
            let slot_ref = &self.sub_index.saves[index];
            if slot_ref.region_type == RegionType::Unsaved {
                return Err(Error::BadState("no save in progress"));
            }
            let state = slot_ref
                .state_buffer
                .as_ref()
                .ok_or(Error::BadState("no save in progress"))?;
            if state.is_empty() {
                return Err(Error::BadState("state buffer is empty"));
            }
            if state.len() > MAX_STATE_BUFFER_SIZE {
                return Err(Error::BadState("state buffer too large"));
            }
        }
        self.factory.sync()?;
        self.write_slot_header(index)?;
        self.factory.sync()?;
        debug!("committed save slot {slot}");
        Ok(())
    }

    /// Abandon an in-progress save without touching storage. The slot was
    /// already invalidated on disk by setup, so it stays the oldest and
    /// will be picked again.
    pub fn cancel_save(&mut self, slot: u32) -> Result<()> {
        let index = self.slot_index(slot)?;
        let region = self.sub_index.saves[index].index_save;
        self.sub_index.saves[index] =
            IndexSaveLayout::reset(region, self.super_block.page_map_blocks());
        debug!("cancelled save slot {slot}");
        Ok(())
    }

    /// The newest valid slot and its zone count.
    pub fn find_latest_slot(&self) -> Result<(u32, u32)> {
        let index = select_latest_slot(&self.sub_index.saves, self.sub_index.nonce)
            .ok_or(Error::IndexNotSavedCleanly)?;
        Ok((index as u32, self.sub_index.saves[index].zone_count()))
    }

    /// Invalidate every slot, or just the latest valid one. With nothing
    /// valid to discard, discarding the latest is a no-op.
    pub fn discard_saves(&mut self, all: bool) -> Result<()> {
        if all {
            for index in 0..self.sub_index.saves.len() {
                self.invalidate_slot(index)?;
            }
        } else if let Some(index) = select_latest_slot(&self.sub_index.saves, self.sub_index.nonce)
        {
            self.invalidate_slot(index)?;
        }
        self.factory.sync()?;
        Ok(())
    }

    /// The volume byte range, for the volume management layer. The region
    /// holds its own factory reference and may outlive this layout.
    pub fn open_volume_region(&self) -> Result<IoRegion> {
        self.block_region(&self.sub_index.volume)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn max_saves(&self) -> u32 {
        u32::from(self.super_block.max_saves())
    }

    fn generate_layout(
        factory: Arc<dyn IoFactory>,
        context: LayoutContext,
        block_size: u32,
        offset: u64,
        sizes: &SaveLayoutSizes,
        super_block: SuperBlockData,
    ) -> Self {
        let first_block = offset / u64::from(block_size);
        let header = LayoutRegion::new(first_block, 1, RegionKind::Header, SOLE_INSTANCE);
        let config = LayoutRegion::new(first_block + 1, 1, RegionKind::Config, SOLE_INSTANCE);
        let sub_index_region = LayoutRegion::new(
            first_block + 2,
            sizes.sub_index_blocks,
            RegionKind::Index,
            0,
        );
        let volume = LayoutRegion::new(
            first_block + 2,
            sizes.volume_blocks,
            RegionKind::Volume,
            SOLE_INSTANCE,
        );
        let mut next_block = first_block + 2 + sizes.volume_blocks;
        let saves = (0..sizes.save_count)
            .map(|instance| {
                let region =
                    LayoutRegion::new(next_block, sizes.save_blocks, RegionKind::Save, instance);
                next_block += sizes.save_blocks;
                IndexSaveLayout::reset(region, sizes.page_map_blocks)
            })
            .collect();
        let seal = LayoutRegion::new(next_block, 1, RegionKind::Seal, SOLE_INSTANCE);
        let nonce = define_sub_index_nonce(super_block.nonce(), sub_index_region.start_block());
        Self {
            factory,
            context,
            block_size,
            total_blocks: sizes.total_blocks,
            super_block,
            header,
            config,
            seal,
            sub_index: SubIndexLayout {
                region: sub_index_region,
                nonce,
                volume,
                saves,
            },
        }
    }

    fn reconstitute(
        factory: Arc<dyn IoFactory>,
        context: LayoutContext,
        block_size: u32,
        first_block: u64,
        capacity: u64,
        table: RegionTable,
        super_block: SuperBlockData,
    ) -> Result<Self> {
        let total_blocks = table.header.region_blocks();
        let needed = total_blocks * u64::from(block_size);
        if needed > capacity {
            return Err(Error::InsufficientIndexSpace {
                needed,
                available: capacity,
            });
        }
        let max_saves = usize::from(super_block.max_saves());
        if table.regions.len() != 4 + max_saves {
            return Err(Error::CorruptComponent("layout region count"));
        }

        let header = table.regions[0];
        check_top_region(&header, RegionKind::Header, SOLE_INSTANCE, first_block, Some(1))?;
        let config = table.regions[1];
        check_top_region(&config, RegionKind::Config, SOLE_INSTANCE, first_block + 1, Some(1))?;
        let sub_index_region = table.regions[2];
        check_top_region(&sub_index_region, RegionKind::Index, 0, first_block + 2, None)?;
        let seal = table.regions[3 + max_saves];
        check_top_region(&seal, RegionKind::Seal, SOLE_INSTANCE, sub_index_region.end_block(), Some(1))?;
        if seal.end_block() != first_block + total_blocks {
            return Err(Error::CorruptComponent("layout region table"));
        }

        let save_regions = &table.regions[3..3 + max_saves];
        let volume_blocks = save_regions
            .first()
            .map(|save| save.start_block().saturating_sub(sub_index_region.start_block()))
            .ok_or(Error::CorruptComponent("layout region table"))?;
        if volume_blocks == 0 {
            return Err(Error::CorruptComponent("layout region table"));
        }
        let volume = LayoutRegion::new(
            sub_index_region.start_block(),
            volume_blocks,
            RegionKind::Volume,
            SOLE_INSTANCE,
        );
        let mut next_block = sub_index_region.start_block() + volume_blocks;
        for (index, save) in save_regions.iter().enumerate() {
            check_top_region(save, RegionKind::Save, index as u16, next_block, None)?;
            next_block = save.end_block();
        }
        if next_block != sub_index_region.end_block() {
            return Err(Error::CorruptComponent("layout region table"));
        }

        let nonce = define_sub_index_nonce(super_block.nonce(), sub_index_region.start_block());
        let mut layout = Self {
            factory,
            context,
            block_size,
            total_blocks,
            super_block,
            header,
            config,
            seal,
            sub_index: SubIndexLayout {
                region: sub_index_region,
                nonce,
                volume,
                saves: Vec::with_capacity(max_saves),
            },
        };

        for (index, save_region) in save_regions.iter().enumerate() {
            let slot = layout.load_save_slot(index, *save_region)?;
            layout.sub_index.saves.push(slot);
        }
        Ok(layout)
    }

    /// Read one slot's header back. Integrity failures leave the slot in
    /// the invalid state; only a device-level read failure propagates.
    fn load_save_slot(&self, index: usize, region: LayoutRegion) -> Result<IndexSaveLayout> {
        let header_block =
            LayoutRegion::new(region.start_block(), 1, RegionKind::Header, SOLE_INSTANCE);
        let mut reader = self.region_reader(&header_block)?;
        match IndexSaveLayout::load(region, &self.super_block, &mut reader) {
            Ok(slot) => Ok(slot),
            Err(Error::Io(IoError::EndOfFile)) | Err(Error::Io(IoError::NumericConversion(_))) => {
                warn!("save slot {index} header is truncated; treating the slot as invalid");
                Ok(IndexSaveLayout::reset(region, self.super_block.page_map_blocks()))
            }
            Err(Error::Io(err)) => Err(Error::Io(err)),
            Err(err) => {
                warn!("save slot {index} is unreadable ({err}); treating the slot as invalid");
                Ok(IndexSaveLayout::reset(region, self.super_block.page_map_blocks()))
            }
        }
    }

    fn invalidate_slot(&mut self, index: usize) -> Result<()> {
        let region = self.sub_index.saves[index].index_save;
        self.sub_index.saves[index] =
            IndexSaveLayout::reset(region, self.super_block.page_map_blocks());
        self.write_slot_header(index)
    }

    fn write_slot_header(&self, index: usize) -> Result<()> {
        let slot = &self.sub_index.saves[index];
        let table = slot.build_table()?;
        let mut writer = self.region_writer(&slot.header)?;
        table.write_to(&mut writer)?;
        if slot.region_type != RegionType::Unsaved {
            writer.write(slot.save_data.as_bytes())?;
            if let Some(state) = &slot.state_buffer {
                writer.write(state)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn write_config(&self, config: &IndexConfig) -> Result<()> {
        let mut writer = self.region_writer(&self.config)?;
        writer.write(ConfigData::from_config(config).as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn write_super_block(&self) -> Result<()> {
        let mut regions = vec![self.header, self.config, self.sub_index.region];
        regions.extend(self.sub_index.saves.iter().map(|slot| slot.index_save));
        regions.push(self.seal);
        let table = RegionTable::new(
            RegionType::Super,
            self.total_blocks,
            SUPER_BLOCK_DATA_SIZE as u16,
            regions,
        )?;
        let mut writer = self.region_writer(&self.header)?;
        table.write_to(&mut writer)?;
        writer.write(self.super_block.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn slot_index(&self, slot: u32) -> Result<usize> {
        let index = slot as usize;
        if index >= self.sub_index.saves.len() {
            return Err(Error::BadState("no such save slot"));
        }
        Ok(index)
    }

    fn save_slot(&self, slot: u32) -> Result<&IndexSaveLayout> {
        let index = self.slot_index(slot)?;
        Ok(&self.sub_index.saves[index])
    }

    fn save_slot_mut(&mut self, slot: u32) -> Result<&mut IndexSaveLayout> {
        let index = self.slot_index(slot)?;
        Ok(&mut self.sub_index.saves[index])
    }

    fn save_content_region(&self, slot: u32, content: SaveContent) -> Result<LayoutRegion> {
        let slot = self.save_slot(slot)?;
        if slot.region_type == RegionType::Unsaved {
            return Err(Error::BadState("save slot is not set up"));
        }
        match content {
            SaveContent::IndexPageMap => Ok(slot.index_page_map),
            SaveContent::OpenChapter => slot
                .open_chapter
                .ok_or(Error::BadState("checkpoint slots have no open chapter")),
            SaveContent::VolumeIndexZone(zone) => slot
                .volume_index_zones
                .get(zone as usize)
                .copied()
                .ok_or(Error::BadState("no such volume index zone")),
        }
    }

    fn block_region(&self, region: &LayoutRegion) -> Result<IoRegion> {
        let block_size = u64::from(self.block_size);
        IoRegion::new(
            self.factory.clone(),
            region.start_block() * block_size,
            region.block_count() * block_size,
        )
        .map_err(Error::from)
    }

    fn region_reader(&self, region: &LayoutRegion) -> Result<BufferedReader> {
        BufferedReader::new(self.block_region(region)?, self.block_size as usize)
            .map_err(Error::from)
    }

    fn region_writer(&self, region: &LayoutRegion) -> Result<BufferedWriter> {
        BufferedWriter::new(self.block_region(region)?, self.block_size as usize)
            .map_err(Error::from)
    }
}
