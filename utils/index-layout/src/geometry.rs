use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::region::{LAYOUT_REGION_SIZE, REGION_HEADER_SIZE};
use crate::superblock::SUPER_BLOCK_DATA_SIZE;

/// A record is a 16-byte name plus 16 bytes of metadata.
pub(crate) const BYTES_PER_RECORD: u32 = 32;

const OPEN_CHAPTER_HEADER_SIZE: u64 = 40;
const PAGE_MAP_HEADER_SIZE: u64 = 8;

const MIN_BLOCK_SIZE: u32 = 1024;
const MAX_SAVE_COUNT: u32 = 64;

/// Every block count the layout needs, computed up front so that all size
/// and alignment failures happen before anything touches storage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SaveLayoutSizes {
    pub block_size: u32,
    pub volume_blocks: u64,
    pub volume_index_blocks: u64,
    pub page_map_blocks: u64,
    pub open_chapter_blocks: u64,
    pub save_count: u16,
    pub save_blocks: u64,
    pub sub_index_blocks: u64,
    pub total_blocks: u64,
}

impl SaveLayoutSizes {
    pub(crate) fn new(config: &IndexConfig, block_size: u32) -> Result<Self> {
        validate_block_size(block_size)?;
        if config.chapters_per_volume == 0 {
            return Err(Error::BadState("a volume needs at least one chapter"));
        }
        if config.record_pages_per_chapter >= config.pages_per_chapter {
            return Err(Error::BadState("a chapter needs at least one index page"));
        }
        if config.sparse_chapters_per_volume >= config.chapters_per_volume {
            return Err(Error::BadState("a volume needs at least one dense chapter"));
        }
        if config.bytes_per_page % block_size != 0 {
            return Err(Error::IncorrectAlignment(
                "page size must be a multiple of the block size",
            ));
        }
        let save_count = 2 + config.checkpoint_count;
        if save_count > MAX_SAVE_COUNT {
            return Err(Error::BadState("too many checkpoints"));
        }
        // The top-level table and superblock share block 0.
        let header_bytes = REGION_HEADER_SIZE
            + (4 + save_count as usize) * LAYOUT_REGION_SIZE
            + SUPER_BLOCK_DATA_SIZE;
        if header_bytes > block_size as usize {
            return Err(Error::BadState("the layout header does not fit in one block"));
        }

        let block_size_u64 = u64::from(block_size);

        // The volume holds every chapter page plus one header page.
        let pages_per_volume =
            u64::from(config.pages_per_chapter) * u64::from(config.chapters_per_volume) + 1;
        let bytes_per_volume = u64::from(config.bytes_per_page) * pages_per_volume;
        if bytes_per_volume % block_size_u64 != 0 {
            return Err(Error::IncorrectAlignment(
                "volume size must be a multiple of the block size",
            ));
        }
        let volume_blocks = bytes_per_volume / block_size_u64;

        // The page map records two bytes per index page in the volume.
        let index_pages_per_chapter =
            u64::from(config.pages_per_chapter - config.record_pages_per_chapter);
        let page_map_bytes = PAGE_MAP_HEADER_SIZE
            + 2 * u64::from(config.chapters_per_volume) * index_pages_per_chapter;
        let page_map_blocks = page_map_bytes.div_ceil(block_size_u64);

        let records_per_page = u64::from(config.bytes_per_page / BYTES_PER_RECORD);
        let records_per_chapter = records_per_page * u64::from(config.record_pages_per_chapter);
        let open_chapter_bytes =
            OPEN_CHAPTER_HEADER_SIZE + records_per_chapter * u64::from(BYTES_PER_RECORD);
        let open_chapter_blocks = open_chapter_bytes.div_ceil(block_size_u64);

        // One extra block holds the delta list bookkeeping tail.
        let volume_index_blocks = config.volume_index_mem_bytes.div_ceil(block_size_u64) + 1;

        let save_blocks = 1 + volume_index_blocks + page_map_blocks + open_chapter_blocks;
        let sub_index_blocks = volume_blocks + u64::from(save_count) * save_blocks;
        // Layout header, config, and seal surround the sub-index.
        let total_blocks = 3 + sub_index_blocks;

        Ok(Self {
            block_size,
            volume_blocks,
            volume_index_blocks,
            page_map_blocks,
            open_chapter_blocks,
            save_count: save_count as u16,
            save_blocks,
            sub_index_blocks,
            total_blocks,
        })
    }
}

pub(crate) fn validate_block_size(block_size: u32) -> Result<()> {
    if !block_size.is_power_of_two() || block_size < MIN_BLOCK_SIZE {
        return Err(Error::IncorrectAlignment(
            "block size must be a power of two of at least 1024",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_config_sizes() {
        let sizes = SaveLayoutSizes::new(&IndexConfig::small_for_tests(), 4096).unwrap();
        // 4 chapters of 4 pages plus the volume header page.
        assert_eq!(17, sizes.volume_blocks);
        // 8 bytes of header plus 2 bytes for each of the 12 index pages.
        assert_eq!(1, sizes.page_map_blocks);
        // 40 bytes of header plus 128 records of 32 bytes.
        assert_eq!(2, sizes.open_chapter_blocks);
        // Three blocks of memory image plus the bookkeeping block.
        assert_eq!(4, sizes.volume_index_blocks);
        assert_eq!(2, sizes.save_count);
        assert_eq!(8, sizes.save_blocks);
        assert_eq!(17 + 2 * 8, sizes.sub_index_blocks);
        assert_eq!(3 + 33, sizes.total_blocks);
    }

    #[test]
    fn test_checkpoints_add_saves() {
        let mut config = IndexConfig::small_for_tests();
        config.checkpoint_count = 3;
        let sizes = SaveLayoutSizes::new(&config, 4096).unwrap();
        assert_eq!(5, sizes.save_count);
        assert_eq!(17 + 5 * 8, sizes.sub_index_blocks);
    }

    #[test]
    fn test_page_alignment_guard() {
        let mut config = IndexConfig::small_for_tests();
        config.bytes_per_page = 2048;
        assert!(matches!(
            SaveLayoutSizes::new(&config, 4096),
            Err(Error::IncorrectAlignment(_))
        ));
    }

    #[test]
    fn test_block_size_guard() {
        let config = IndexConfig::small_for_tests();
        assert!(SaveLayoutSizes::new(&config, 4096).is_ok());
        assert!(SaveLayoutSizes::new(&config, 4095).is_err());
        assert!(SaveLayoutSizes::new(&config, 512).is_err());
    }

    #[test]
    fn test_degenerate_configs_rejected() {
        let mut config = IndexConfig::small_for_tests();
        config.chapters_per_volume = 0;
        assert!(SaveLayoutSizes::new(&config, 4096).is_err());

        let mut config = IndexConfig::small_for_tests();
        config.record_pages_per_chapter = config.pages_per_chapter;
        assert!(SaveLayoutSizes::new(&config, 4096).is_err());

        let mut config = IndexConfig::small_for_tests();
        config.checkpoint_count = 1000;
        assert!(SaveLayoutSizes::new(&config, 4096).is_err());

        let mut config = IndexConfig::small_for_tests();
        config.sparse_chapters_per_volume = config.chapters_per_volume;
        assert!(SaveLayoutSizes::new(&config, 4096).is_err());
    }

    #[test]
    fn test_page_map_rounds_up() {
        let mut config = IndexConfig::small_for_tests();
        // 4096 chapters * 3 index pages * 2 bytes + 8 = 24584 bytes.
        config.chapters_per_volume = 4096;
        let sizes = SaveLayoutSizes::new(&config, 4096).unwrap();
        assert_eq!(7, sizes.page_map_blocks);
    }
}
