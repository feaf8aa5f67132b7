use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{U16, U32, U64},
};

use crate::context::RandomSource;
use crate::error::{Error, Result};
use crate::geometry::SaveLayoutSizes;
use crate::nonce::generate_primary_nonce;

/// The label that identifies a single-file index layout.
pub(crate) const LAYOUT_MAGIC: [u8; 32] = *b"*ALBIREO*SINGLE*FILE*LAYOUT*001*";

/// Only version 1 has ever been written, so the accepted range collapses to
/// a single value until the format changes.
pub(crate) const SUPER_VERSION_MINIMUM: u32 = 1;
pub(crate) const SUPER_VERSION_CURRENT: u32 = 1;

pub(crate) const NONCE_SEED_SIZE: usize = 32;

pub(crate) const SUPER_BLOCK_DATA_SIZE: usize = core::mem::size_of::<SuperBlockData>();

/// The top-level descriptor stored in block 0, after the layout's region
/// table.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct SuperBlockData {
    magic_label: [u8; 32],
    nonce_seed: [u8; NONCE_SEED_SIZE],
    nonce: U64,
    version: U32,
    block_size: U32,
    /// Historically more than one sub-index was possible; always 1 now.
    index_count: U16,
    max_saves: U16,
    /// Blank field on permanent storage; must read back as zero.
    padding: [u8; 4],
    open_chapter_blocks: U64,
    page_map_blocks: U64,
}

impl SuperBlockData {
    pub(crate) fn generate(sizes: &SaveLayoutSizes, random: &dyn RandomSource) -> Self {
        let mut nonce_seed = [0u8; NONCE_SEED_SIZE];
        random.fill_bytes(&mut nonce_seed);
        let nonce = generate_primary_nonce(&nonce_seed);
        Self {
            magic_label: LAYOUT_MAGIC,
            nonce_seed,
            nonce: U64::new(nonce),
            version: U32::new(SUPER_VERSION_CURRENT),
            block_size: U32::new(sizes.block_size),
            index_count: U16::new(1),
            max_saves: U16::new(sizes.save_count),
            padding: [0; 4],
            open_chapter_blocks: U64::new(sizes.open_chapter_blocks),
            page_map_blocks: U64::new(sizes.page_map_blocks),
        }
    }

    /// Verify a decoded superblock against the caller's block size. The
    /// check order matters: a foreign file fails on the label, a newer
    /// format on the version, and only then is the nonce chain consulted.
    pub(crate) fn validate(&self, expected_block_size: u32) -> Result<()> {
        if self.magic_label != LAYOUT_MAGIC {
            return Err(Error::CorruptComponent("superblock magic label"));
        }
        let version = self.version.get();
        if !(SUPER_VERSION_MINIMUM..=SUPER_VERSION_CURRENT).contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }
        if self.index_count.get() != 1 {
            return Err(Error::CorruptComponent("superblock index count"));
        }
        if self.padding != [0; 4] {
            return Err(Error::CorruptComponent("superblock padding"));
        }
        if self.nonce.get() != generate_primary_nonce(&self.nonce_seed) {
            return Err(Error::CorruptComponent("superblock nonce"));
        }
        if self.max_saves.get() < 2 {
            return Err(Error::CorruptComponent("superblock save count"));
        }
        if self.block_size.get() != expected_block_size {
            return Err(Error::WrongIndexConfig);
        }
        Ok(())
    }

    pub(crate) fn nonce(&self) -> u64 {
        self.nonce.get()
    }

    pub(crate) fn max_saves(&self) -> u16 {
        self.max_saves.get()
    }

    pub(crate) fn open_chapter_blocks(&self) -> u64 {
        self.open_chapter_blocks.get()
    }

    pub(crate) fn page_map_blocks(&self) -> u64 {
        self.page_map_blocks.get()
    }
}
