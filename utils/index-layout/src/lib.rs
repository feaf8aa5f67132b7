#![allow(clippy::new_without_default)]

//! On-disk layout engine for a single-file deduplication index.
//!
//! The layout partitions a byte range of an [`block_io::IoFactory`] into a
//! fixed hierarchy of block-aligned regions: a superblock, a config region,
//! an opaque volume, a set of rotating save slots, and a trailing seal.
//! Saved state is validated on load by a chain of nonces rooted in the
//! superblock's random seed, so a crashed, tampered, or foreign file can
//! never be mistaken for a cleanly saved index.

mod config;
mod context;
mod error;
mod geometry;
mod layout;
mod nonce;
mod region;
mod save_slot;
mod superblock;

pub use config::IndexConfig;
pub use context::{LayoutContext, OsRandomSource, RandomSource, SystemTimeSource, TimeSource};
pub use error::{Error, Result};
pub use layout::IndexLayout;
pub use save_slot::{SaveContent, SaveType};
