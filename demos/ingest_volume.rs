//! Example: ingest a small volume from several producers, then read it back
//!
//! Run with: cargo run --example ingest_volume

use blockfs::{
    BlockCoord, CodecSpec, DataType, Directory, DirectoryOptions, RawBlock, VolumeLayout,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("demo.blockfs");

    let layout = VolumeLayout::new([256, 256, 128], [64, 64, 64], DataType::U16)?;
    println!(
        "Creating {} ({} blocks of {} bytes each)",
        path.display(),
        layout.cell_count(),
        layout.block_bytes()
    );

    let volume = Arc::new(
        Directory::create(
            &path,
            layout.clone(),
            DirectoryOptions::default()
                .with_codec(CodecSpec::gzip(6))
                .with_writers(4),
        )
        .await?,
    );

    // One producer task per z-slab of the block grid.
    let [nx, ny, nz] = layout.grid_extent();
    let mut producers = Vec::new();
    for z in 0..nz {
        let volume = Arc::clone(&volume);
        producers.push(tokio::spawn(async move {
            for y in 0..ny {
                for x in 0..nx {
                    let fill = (x + y * nx + z * nx * ny) as u8;
                    let block =
                        RawBlock::new([64, 64, 64], DataType::U16, vec![fill; 64 * 64 * 64 * 2])
                            .expect("block shape");
                    volume
                        .write_block(block, BlockCoord::new(x, y, z))
                        .await
                        .expect("write_block");
                }
            }
        }));
    }
    for producer in producers {
        producer.await?;
    }

    let errors = volume.close().await?;
    println!(
        "Ingested {} blocks, {} write errors",
        volume.written_blocks(),
        errors.len()
    );

    let reader = Directory::open(&path).await?;
    let mut stored = 0u64;
    for file in reader.block_files() {
        stored += tokio::fs::metadata(file).await?.len();
    }
    let raw_total = reader.written_blocks() * reader.layout().block_bytes() as u64;
    println!(
        "Stored {} bytes for {} bytes of voxels ({:.1}x compression)",
        stored,
        raw_total,
        raw_total as f64 / stored as f64
    );

    let sample = reader
        .read_block(BlockCoord::new(1, 2, 1))
        .await?
        .expect("block was written");
    println!(
        "Sample block (1, 2, 1): shape {:?}, first voxel byte {:#04x}",
        sample.shape(),
        sample.data()[0]
    );

    Ok(())
}
