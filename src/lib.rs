//! BlockFS - block storage for large 3-D scalar volumes
//!
//! A volume is partitioned into fixed-size bricks of voxels ("blocks").
//! BlockFS persists each block compressed into a small set of very large
//! append-only block files, indexes them by grid coordinate in a single
//! directory file, and serves random-access reads - the layout imaging
//! viewers such as Neuroglancer want to sit on top of.
//!
//! # Features
//!
//! - Append-only, write-once blocks: no overwrites, no deletion, no
//!   read-modify-write
//! - Concurrent ingestion from many producers over bounded per-spindle
//!   queues, one writer task per block file
//! - Dense O(1) coordinate index persisted with a CRC-checked binary
//!   header
//! - Pluggable per-block codecs (`raw`, `zlib`, `gzip` built in)
//! - Relocation helpers (`move_volume`, `copy_volume`, `rebase`) for
//!   volumes whose block-file paths are embedded in the directory file
//!
//! # Example
//!
//! ```rust,ignore
//! use blockfs::{BlockCoord, CodecSpec, DataType, Directory, DirectoryOptions, RawBlock, VolumeLayout};
//!
//! # async fn example() -> blockfs::Result<()> {
//! let layout = VolumeLayout::new([2048, 2048, 1024], [64, 64, 64], DataType::U16)?;
//! let volume = Directory::create(
//!     "/data/brain.blockfs",
//!     layout,
//!     DirectoryOptions::default().with_codec(CodecSpec::gzip(6)),
//! )
//! .await?;
//!
//! let block = RawBlock::zeroed([64, 64, 64], DataType::U16);
//! volume.write_block(block, BlockCoord::new(0, 0, 0)).await?;
//! let errors = volume.close().await?;
//! assert!(errors.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod blockfile;
pub mod codec;
pub mod directory;
pub mod error;
pub mod index;
pub mod layout;
pub mod relocate;
pub mod types;

mod header;
mod writer;

// Re-exports
pub use codec::{Codec, CodecRegistry, CodecSpec};
pub use directory::{Directory, DirectoryOptions, WRITERS_ENV};
pub use error::{Error, Result, WriteError};
pub use header::{FORMAT_VERSION, MAGIC};
pub use index::IndexEntry;
pub use layout::VolumeLayout;
pub use relocate::{copy_volume, move_volume, rebase};
pub use types::{BlockCoord, DataType, RawBlock};

/// Version of the BlockFS implementation
pub const BLOCKFS_VERSION: &str = env!("CARGO_PKG_VERSION");
