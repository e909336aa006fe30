//! End-to-end volume lifecycle tests: create, concurrent ingestion,
//! flush, close, reopen, relocation and corruption recovery.

use blockfs::{
    copy_volume, move_volume, rebase, BlockCoord, Codec, CodecRegistry, CodecSpec, DataType,
    Directory, DirectoryOptions, Error, RawBlock, VolumeLayout, WriteError,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn layout_8(dtype: DataType) -> VolumeLayout {
    VolumeLayout::new([8, 8, 8], [4, 4, 4], dtype).unwrap()
}

fn u16_block(fill: u8) -> RawBlock {
    RawBlock::new([4, 4, 4], DataType::U16, vec![fill; 128]).unwrap()
}

async fn block_file_sizes(volume: &Directory) -> Vec<u64> {
    let mut sizes = Vec::new();
    for file in volume.block_files() {
        sizes.push(tokio::fs::metadata(file).await.unwrap().len());
    }
    sizes
}

#[tokio::test]
async fn test_raw_round_trip_and_absent_reads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");

    let volume = Directory::create(
        &path,
        layout_8(DataType::U16),
        DirectoryOptions::default()
            .with_codec(CodecSpec::raw())
            .with_writers(2),
    )
    .await
    .unwrap();

    volume
        .write_block(u16_block(0x00), BlockCoord::new(0, 0, 0))
        .await
        .unwrap();
    volume
        .write_block(u16_block(0xFF), BlockCoord::new(1, 1, 1))
        .await
        .unwrap();
    assert!(volume.close().await.unwrap().is_empty());

    let volume = Directory::open(&path).await.unwrap();
    let zeros = volume
        .read_block(BlockCoord::new(0, 0, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(zeros.data().len(), 128);
    assert!(zeros.data().iter().all(|&b| b == 0x00));

    let ones = volume
        .read_block(BlockCoord::new(1, 1, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ones.data().len(), 128);
    assert!(ones.data().iter().all(|&b| b == 0xFF));

    // Never-written coordinates are absent, not zero and not an error.
    assert!(volume
        .read_block(BlockCoord::new(1, 0, 0))
        .await
        .unwrap()
        .is_none());

    // Out-of-grid coordinates are an error, not absent.
    assert!(matches!(
        volume.read_block(BlockCoord::new(2, 0, 0)).await,
        Err(Error::OutOfRange { .. })
    ));
}

#[tokio::test]
async fn test_gzip_round_trip_compresses() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");

    let volume = Directory::create(
        &path,
        layout_8(DataType::U16),
        DirectoryOptions::default()
            .with_codec(CodecSpec::gzip(6))
            .with_writers(2),
    )
    .await
    .unwrap();

    volume
        .write_block(u16_block(0x00), BlockCoord::new(0, 0, 0))
        .await
        .unwrap();
    volume
        .write_block(u16_block(0xFF), BlockCoord::new(1, 1, 1))
        .await
        .unwrap();
    assert!(volume.close().await.unwrap().is_empty());

    // Constant blocks must compress: both encoded blocks together stay
    // well under the 2 x 128 raw bytes.
    let stored: u64 = block_file_sizes(&Directory::open(&path).await.unwrap())
        .await
        .iter()
        .sum();
    assert!(stored > 0);
    assert!(stored < 256, "{} bytes stored, expected < 256", stored);

    let volume = Directory::open(&path).await.unwrap();
    assert_eq!(
        volume
            .read_block(BlockCoord::new(0, 0, 0))
            .await
            .unwrap()
            .unwrap(),
        u16_block(0x00)
    );
    assert_eq!(
        volume
            .read_block(BlockCoord::new(1, 1, 1))
            .await
            .unwrap()
            .unwrap(),
        u16_block(0xFF)
    );
}

/// Value each voxel byte of a coordinate's block is filled with, so
/// every block is distinguishable on read-back.
fn fill_for(coord: BlockCoord) -> u8 {
    (coord.x * 16 + coord.y * 4 + coord.z + 1) as u8
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_cover_disjoint_coordinates() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");

    let layout = VolumeLayout::new([16, 16, 16], [4, 4, 4], DataType::U16).unwrap();
    let volume = Arc::new(
        Directory::create(
            &path,
            layout,
            DirectoryOptions::default()
                .with_codec(CodecSpec::raw())
                .with_writers(4),
        )
        .await
        .unwrap(),
    );

    // 8 producers, each writing a disjoint set of 8 coordinates, 64
    // blocks in total.
    let mut producers = Vec::new();
    for x in 0..4u32 {
        for y_half in 0..2u32 {
            let volume = Arc::clone(&volume);
            producers.push(tokio::spawn(async move {
                for y_off in 0..2u32 {
                    for z in 0..4u32 {
                        let coord = BlockCoord::new(x, y_half * 2 + y_off, z);
                        let block =
                            RawBlock::new([4, 4, 4], DataType::U16, vec![fill_for(coord); 128])
                                .unwrap();
                        volume.write_block(block, coord).await.unwrap();
                    }
                }
            }));
        }
    }
    for producer in producers {
        producer.await.unwrap();
    }
    assert!(volume.close().await.unwrap().is_empty());

    let volume = Directory::open(&path).await.unwrap();
    assert_eq!(volume.written_blocks(), 64);

    // Every block reads back with its producer's fill, regardless of
    // interleaving.
    let mut per_file = vec![0usize; volume.block_files().len()];
    for x in 0..4u32 {
        for y in 0..4u32 {
            for z in 0..4u32 {
                let coord = BlockCoord::new(x, y, z);
                let block = volume.read_block(coord).await.unwrap().unwrap();
                assert!(
                    block.data().iter().all(|&b| b == fill_for(coord)),
                    "bad contents at {}",
                    coord
                );
                let entry = volume.block_location(coord).unwrap().unwrap();
                per_file[entry.file_id as usize] += 1;
            }
        }
    }

    // Hash routing spreads the 64 blocks across all 4 spindles.
    assert_eq!(per_file.iter().sum::<usize>(), 64);
    for (file_id, &count) in per_file.iter().enumerate() {
        assert!(
            (4..=32).contains(&count),
            "file {} received {} blocks",
            file_id,
            count
        );
    }
}

#[tokio::test]
async fn test_second_write_is_reported_duplicate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");

    let volume = Directory::create(
        &path,
        layout_8(DataType::U16),
        DirectoryOptions::default()
            .with_codec(CodecSpec::raw())
            .with_writers(2),
    )
    .await
    .unwrap();

    let coord = BlockCoord::new(1, 1, 1);
    volume.write_block(u16_block(0x11), coord).await.unwrap();
    volume.write_block(u16_block(0x22), coord).await.unwrap();

    let errors = volume.flush().await.unwrap();
    assert_eq!(errors, vec![WriteError::DuplicateWrite(coord)]);

    // The log was drained; a quiet flush returns nothing.
    assert!(volume.flush().await.unwrap().is_empty());

    // First writer wins.
    let block = volume.read_block(coord).await.unwrap().unwrap();
    assert!(block.data().iter().all(|&b| b == 0x11));

    volume.close().await.unwrap();
}

#[tokio::test]
async fn test_flush_makes_blocks_visible_to_fresh_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");

    let volume = Directory::create(
        &path,
        layout_8(DataType::U16),
        DirectoryOptions::default()
            .with_codec(CodecSpec::raw())
            .with_writers(2),
    )
    .await
    .unwrap();

    volume
        .write_block(u16_block(0x7E), BlockCoord::new(0, 1, 0))
        .await
        .unwrap();
    assert!(volume.flush().await.unwrap().is_empty());

    // The writer is still open, but a fresh read-only open already sees
    // everything committed before the flush.
    let reader = Directory::open(&path).await.unwrap();
    let block = reader
        .read_block(BlockCoord::new(0, 1, 0))
        .await
        .unwrap()
        .unwrap();
    assert!(block.data().iter().all(|&b| b == 0x7E));

    volume.close().await.unwrap();
}

#[tokio::test]
async fn test_edge_blocks_are_zero_padded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");

    // 10 voxels over 4-voxel blocks: the high-edge block covers 2.
    let layout = VolumeLayout::new([10, 8, 8], [4, 4, 4], DataType::U8).unwrap();
    let volume = Directory::create(
        &path,
        layout,
        DirectoryOptions::default()
            .with_codec(CodecSpec::raw())
            .with_writers(1),
    )
    .await
    .unwrap();

    let coord = BlockCoord::new(2, 0, 0);
    let clipped = RawBlock::new([4, 4, 2], DataType::U8, vec![0xCC; 32]).unwrap();
    volume.write_block(clipped, coord).await.unwrap();
    assert!(volume.close().await.unwrap().is_empty());

    let volume = Directory::open(&path).await.unwrap();
    let block = volume.read_block(coord).await.unwrap().unwrap();
    assert_eq!(block.shape(), [4, 4, 4]);
    for z in 0..4usize {
        for y in 0..4usize {
            for x in 0..4usize {
                let expected = if x < 2 { 0xCC } else { 0x00 };
                assert_eq!(block.data()[((z * 4) + y) * 4 + x], expected);
            }
        }
    }
}

/// Ten distinct coordinates in a 4 x 4 x 4 grid.
fn ten_coords() -> Vec<BlockCoord> {
    (0..10u32)
        .map(|i| BlockCoord::new(i % 4, (i / 4) % 4, i / 16))
        .collect()
}

async fn create_ten_block_volume(path: &Path) -> Vec<(BlockCoord, RawBlock)> {
    let layout = VolumeLayout::new([16, 16, 16], [4, 4, 4], DataType::U16).unwrap();
    let volume = Directory::create(
        path,
        layout,
        DirectoryOptions::default()
            .with_codec(CodecSpec::gzip(4))
            .with_writers(2),
    )
    .await
    .unwrap();

    let mut written = Vec::new();
    for coord in ten_coords() {
        let block = RawBlock::new([4, 4, 4], DataType::U16, vec![fill_for(coord); 128]).unwrap();
        volume.write_block(block.clone(), coord).await.unwrap();
        written.push((coord, block));
    }
    assert!(volume.close().await.unwrap().is_empty());
    written
}

#[tokio::test]
async fn test_move_then_rebase_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");
    let written = create_ten_block_volume(&path).await;

    // Library move first, then a hand-move repaired by rebase: both
    // legs must leave every block byte-identical.
    let moved = move_volume(&path, dir.path().join("moved")).await.unwrap();

    let second_home = dir.path().join("moved-again");
    tokio::fs::create_dir_all(&second_home).await.unwrap();
    let volume = Directory::open(&moved).await.unwrap();
    let block_files: Vec<String> = volume.block_files().to_vec();
    drop(volume);
    for old in &block_files {
        let name = Path::new(old).file_name().unwrap();
        tokio::fs::rename(old, second_home.join(name)).await.unwrap();
    }
    let final_path = second_home.join("vol.blockfs");
    tokio::fs::rename(&moved, &final_path).await.unwrap();
    rebase(&final_path).await.unwrap();

    let volume = Directory::open(&final_path).await.unwrap();
    assert_eq!(volume.written_blocks(), 10);
    for (coord, block) in &written {
        let read = volume.read_block(*coord).await.unwrap().unwrap();
        assert_eq!(&read, block, "mismatch at {}", coord);
    }
}

#[tokio::test]
async fn test_copied_volume_reads_identically() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");
    let written = create_ten_block_volume(&path).await;

    let copied = copy_volume(&path, dir.path().join("copy")).await.unwrap();
    for dir_file in [&path, &copied] {
        let volume = Directory::open(dir_file).await.unwrap();
        for (coord, block) in &written {
            assert_eq!(
                volume.read_block(*coord).await.unwrap().unwrap(),
                *block,
                "mismatch at {} in {}",
                coord,
                dir_file.display()
            );
        }
    }
}

/// Codec that rejects blocks filled with a poison byte; stands in for a
/// spindle that fails mid-ingest.
struct PoisonCodec;

impl Codec for PoisonCodec {
    fn name(&self) -> &str {
        "poison"
    }

    fn params(&self) -> Vec<u8> {
        Vec::new()
    }

    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, Error> {
        if raw.iter().all(|&b| b == 0xEE) {
            return Err(Error::Codec("synthetic encode failure".into()));
        }
        Ok(raw.to_vec())
    }

    fn decode(&self, encoded: &[u8], _expected_size: usize) -> Result<Vec<u8>, Error> {
        Ok(encoded.to_vec())
    }
}

fn poison_registry() -> CodecRegistry {
    let mut registry = CodecRegistry::default();
    registry.register("poison", |_| Ok(Arc::new(PoisonCodec) as Arc<dyn Codec>));
    registry
}

#[tokio::test]
async fn test_failed_write_is_logged_and_never_advertised() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");

    let volume = Directory::create(
        &path,
        layout_8(DataType::U16),
        DirectoryOptions::default()
            .with_codec(CodecSpec::new("poison", Vec::new()))
            .with_writers(2)
            .with_registry(poison_registry()),
    )
    .await
    .unwrap();

    let poisoned = BlockCoord::new(1, 0, 1);
    for x in 0..2u32 {
        for y in 0..2u32 {
            for z in 0..2u32 {
                let coord = BlockCoord::new(x, y, z);
                let fill = if coord == poisoned { 0xEE } else { fill_for(coord) };
                volume
                    .write_block(u16_block(fill), coord)
                    .await
                    .unwrap();
            }
        }
    }

    let errors = volume.flush().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        WriteError::WriteFailure { coord, .. } if *coord == poisoned
    ));
    assert!(volume.close().await.unwrap().is_empty());

    let volume = Directory::open_with_registry(&path, poison_registry())
        .await
        .unwrap();
    assert_eq!(volume.written_blocks(), 7);
    assert!(volume.read_block(poisoned).await.unwrap().is_none());
    for x in 0..2u32 {
        for y in 0..2u32 {
            for z in 0..2u32 {
                let coord = BlockCoord::new(x, y, z);
                if coord == poisoned {
                    continue;
                }
                let block = volume.read_block(coord).await.unwrap().unwrap();
                assert!(block.data().iter().all(|&b| b == fill_for(coord)));
            }
        }
    }
}

#[tokio::test]
async fn test_on_disk_corruption_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");
    create_ten_block_volume(&path).await;

    let mut bytes = tokio::fs::read(&path).await.unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    tokio::fs::write(&path, &bytes).await.unwrap();

    assert!(matches!(
        Directory::open(&path).await,
        Err(Error::Format(_))
    ));
}

#[tokio::test]
async fn test_reopen_truncates_garbage_tails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vol.blockfs");
    let written = create_ten_block_volume(&path).await;

    let volume = Directory::open(&path).await.unwrap();
    let clean_sizes = block_file_sizes(&volume).await;
    let block_files: Vec<String> = volume.block_files().to_vec();
    drop(volume);

    // A crashed writer can leave bytes past the committed end of every
    // block file.
    for file in &block_files {
        let mut bytes = tokio::fs::read(file).await.unwrap();
        bytes.extend_from_slice(b"garbage tail from a crashed writer");
        tokio::fs::write(file, &bytes).await.unwrap();
    }

    let volume = Directory::open(&path).await.unwrap();
    assert_eq!(block_file_sizes(&volume).await, clean_sizes);
    for (coord, block) in &written {
        assert_eq!(volume.read_block(*coord).await.unwrap().unwrap(), *block);
    }
}
