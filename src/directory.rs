//! Directory - the top-level handle for one volume
//!
//! A `Directory` composes the layout, codec, block files, index and
//! writer pool behind a shareable handle: producers clone an `Arc` of it
//! and call `write_block`/`read_block` concurrently.
//!
//! Block files take no OS-level locks, so each is owned by exactly one
//! worker within one process. Several processes may share a volume only
//! if they write disjoint block files; concurrent writers to the same
//! block file from different processes are unsupported.

use crate::blockfile::BlockFile;
use crate::codec::{Codec, CodecRegistry, CodecSpec};
use crate::error::{Error, Result, WriteError};
use crate::header::{self, DirectoryHeader};
use crate::index::{BlockIndex, IndexEntry};
use crate::layout::VolumeLayout;
use crate::types::{BlockCoord, RawBlock};
use crate::writer::{PoolHandle, WriterPool};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// Environment variable consulted for the block-file count when
/// `DirectoryOptions::writers` is not set.
pub const WRITERS_ENV: &str = "BLOCKFS_WRITERS";

/// Options for [`Directory::create`].
#[derive(Clone)]
pub struct DirectoryOptions {
    /// Codec applied to every block before storage.
    pub codec: CodecSpec,
    /// Number of writer workers and therefore block files. Defaults to
    /// the `BLOCKFS_WRITERS` environment variable, then the number of
    /// available cores.
    pub writers: Option<usize>,
    /// Per-worker submission queue capacity. Defaults to `4 * writers`.
    pub queue_depth: Option<usize>,
    /// Codec registry used to resolve `codec` (and any plug-in codecs).
    pub registry: CodecRegistry,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            codec: CodecSpec::default(),
            writers: None,
            queue_depth: None,
            registry: CodecRegistry::default(),
        }
    }
}

impl DirectoryOptions {
    pub fn with_codec(mut self, codec: CodecSpec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_writers(mut self, writers: usize) -> Self {
        self.writers = Some(writers);
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = Some(queue_depth);
        self
    }

    pub fn with_registry(mut self, registry: CodecRegistry) -> Self {
        self.registry = registry;
        self
    }
}

fn resolve_writer_count(explicit: Option<usize>) -> usize {
    if let Some(w) = explicit {
        return w.max(1);
    }
    if let Ok(value) = std::env::var(WRITERS_ENV) {
        if let Ok(w) = value.trim().parse::<usize>() {
            if w > 0 {
                return w;
            }
        }
        tracing::warn!(%value, "ignoring unparsable {}", WRITERS_ENV);
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug)]
enum Pool {
    Idle,
    Running(WriterPool),
    Closed,
}

/// One volume: create it fresh for writing, or open an existing
/// directory file read-only.
#[derive(Debug)]
pub struct Directory {
    path: PathBuf,
    layout: VolumeLayout,
    codec_spec: CodecSpec,
    codec: Arc<dyn Codec>,
    /// Block-file locations exactly as persisted in the path table.
    block_files: Vec<String>,
    index: Arc<RwLock<BlockIndex>>,
    errors: Arc<Mutex<Vec<WriteError>>>,
    pool: Mutex<Pool>,
    start_gate: tokio::sync::Mutex<()>,
    flush_gate: tokio::sync::Mutex<()>,
    queue_depth: usize,
    writable: bool,
}

impl Directory {
    /// Create a fresh volume at `path`.
    ///
    /// Writes the directory file and `writers` empty block files named
    /// `<path>.<i>`. The writer pool is not started yet; the first
    /// `write_block` (or an explicit [`start_writers`](Self::start_writers))
    /// does that.
    pub async fn create(
        path: impl AsRef<Path>,
        layout: VolumeLayout,
        options: DirectoryOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if fs::try_exists(&path).await? {
            return Err(Error::AlreadyExists(path));
        }
        let codec = options
            .registry
            .resolve(&options.codec.name, &options.codec.params)?;

        let writers = resolve_writer_count(options.writers).min(u16::MAX as usize);
        let block_files: Vec<String> = (0..writers)
            .map(|i| format!("{}.{}", path.display(), i))
            .collect();

        let mut created: Vec<&String> = Vec::new();
        for file in &block_files {
            match BlockFile::create(file).await {
                Ok(_) => created.push(file),
                Err(e) => {
                    // Leave nothing half-made behind.
                    for file in created {
                        let _ = fs::remove_file(file).await;
                    }
                    return Err(e);
                }
            }
        }

        let index = BlockIndex::new(layout.cell_count());
        let dir_header = DirectoryHeader {
            layout: layout.clone(),
            codec: options.codec.clone(),
            block_paths: block_files.clone(),
        };
        header::persist(&path, &dir_header, &index).await?;

        tracing::info!(
            path = %path.display(),
            extent = ?layout.extent(),
            block = ?layout.block_size(),
            dtype = %layout.dtype(),
            codec = %options.codec.name,
            writers,
            "created volume"
        );

        let queue_depth = options.queue_depth.unwrap_or(4 * writers).max(1);
        Ok(Self {
            path,
            layout,
            codec_spec: options.codec,
            codec,
            block_files,
            index: Arc::new(RwLock::new(index)),
            errors: Arc::new(Mutex::new(Vec::new())),
            pool: Mutex::new(Pool::Idle),
            start_gate: tokio::sync::Mutex::new(()),
            flush_gate: tokio::sync::Mutex::new(()),
            queue_depth,
            writable: true,
        })
    }

    /// Open an existing volume read-only with the default codec registry.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_registry(path, CodecRegistry::default()).await
    }

    /// Open an existing volume read-only, resolving its codec through
    /// `registry`.
    ///
    /// Block files carrying undefined bytes past the highest committed
    /// end (a crashed writer, say) are truncated back; missing block
    /// files are tolerated until a read actually needs them, so a moved
    /// volume can still be opened and repaired with `rebase`.
    pub async fn open_with_registry(
        path: impl AsRef<Path>,
        registry: CodecRegistry,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = header::load(&path).await?;
        let DirectoryHeader {
            layout,
            codec: codec_spec,
            block_paths,
        } = file.header;
        let codec = registry.resolve(&codec_spec.name, &codec_spec.params)?;

        let extents = file.index.file_extents(block_paths.len() as u16);
        for (block_file, &end) in block_paths.iter().zip(&extents) {
            BlockFile::truncate_to(block_file, end).await?;
        }

        tracing::info!(
            path = %path.display(),
            blocks = file.index.written_count(),
            codec = %codec_spec.name,
            "opened volume read-only"
        );

        Ok(Self {
            path,
            layout,
            codec_spec,
            codec,
            block_files: block_paths,
            index: Arc::new(RwLock::new(file.index)),
            errors: Arc::new(Mutex::new(Vec::new())),
            pool: Mutex::new(Pool::Idle),
            start_gate: tokio::sync::Mutex::new(()),
            flush_gate: tokio::sync::Mutex::new(()),
            queue_depth: 1,
            writable: false,
        })
    }

    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    pub fn codec_spec(&self) -> &CodecSpec {
        &self.codec_spec
    }

    /// Path of the directory file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block-file locations as recorded in the path table
    pub fn block_files(&self) -> &[String] {
        &self.block_files
    }

    /// Number of blocks currently committed to the index
    pub fn written_blocks(&self) -> u64 {
        self.index.read().written_count()
    }

    /// Number of background write errors accumulated since the last
    /// `flush`/`close` drain
    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    /// Start the writer pool explicitly.
    ///
    /// Useful to pay the start-up cost before the first submission;
    /// otherwise `write_block` does it lazily.
    pub async fn start_writers(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.running_handle().await.map(|_| ())
    }

    async fn running_handle(&self) -> Result<PoolHandle> {
        match &*self.pool.lock() {
            Pool::Running(pool) => return Ok(pool.handle()),
            Pool::Closed => return Err(Error::Closed),
            Pool::Idle => {}
        }

        let _gate = self.start_gate.lock().await;
        // Lost the race: someone else started the pool meanwhile.
        match &*self.pool.lock() {
            Pool::Running(pool) => return Ok(pool.handle()),
            Pool::Closed => return Err(Error::Closed),
            Pool::Idle => {}
        }

        let mut files = Vec::with_capacity(self.block_files.len());
        for file in &self.block_files {
            files.push(BlockFile::open_for_append(file).await?);
        }
        let pool = WriterPool::start(
            files,
            Arc::clone(&self.codec),
            Arc::clone(&self.index),
            Arc::clone(&self.errors),
            self.queue_depth,
        );
        let handle = pool.handle();

        // Re-check under the state lock: a concurrent close may have
        // won while the block files were being opened.
        let closed_meanwhile = {
            let mut guard = self.pool.lock();
            if matches!(*guard, Pool::Closed) {
                true
            } else {
                *guard = Pool::Running(pool);
                false
            }
        };
        if closed_meanwhile {
            return Err(Error::Closed);
        }
        tracing::debug!(workers = handle.n_workers(), "writer pool started");
        Ok(handle)
    }

    /// Submit one block for writing.
    ///
    /// The block must match the volume dtype and either the nominal
    /// block shape or the clipped shape of its grid cell; edge blocks
    /// are zero-padded to nominal before encoding. Returns once the
    /// submission is queued on its worker (backpressure applies), not
    /// once it is committed; commit failures surface in the error log
    /// drained by [`flush`](Self::flush) and [`close`](Self::close).
    pub async fn write_block(&self, block: RawBlock, coord: BlockCoord) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if !self.layout.in_bounds(coord) {
            let [nx, ny, nz] = self.layout.grid_extent();
            return Err(Error::OutOfRange { coord, nx, ny, nz });
        }
        if block.dtype() != self.layout.dtype() {
            return Err(Error::DtypeMismatch {
                expected: self.layout.dtype(),
                actual: block.dtype(),
            });
        }
        let shape = block.shape();
        if shape != self.layout.nominal_shape() && shape != self.layout.clipped_shape(coord) {
            let elem = self.layout.dtype().size_in_bytes();
            let clipped = self.layout.clipped_shape(coord);
            return Err(Error::ShapeMismatch {
                expected: clipped.iter().map(|&d| d as usize).product::<usize>() * elem,
                actual: block.data().len(),
            });
        }

        let data = self.layout.pad_to_nominal(&block);
        let idx = self.layout.linear_index(coord);
        let handle = self.running_handle().await?;
        handle.submit(coord, idx, data).await
    }

    /// Locate a committed block without reading it.
    pub fn block_location(&self, coord: BlockCoord) -> Result<Option<IndexEntry>> {
        if !self.layout.in_bounds(coord) {
            let [nx, ny, nz] = self.layout.grid_extent();
            return Err(Error::OutOfRange { coord, nx, ny, nz });
        }
        Ok(self.index.read().get(self.layout.linear_index(coord)))
    }

    /// Read one block.
    ///
    /// `Ok(None)` means the coordinate was never written; errors are
    /// reserved for blocks that exist but cannot be produced.
    pub async fn read_block(&self, coord: BlockCoord) -> Result<Option<RawBlock>> {
        let entry = match self.block_location(coord)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let file = self
            .block_files
            .get(entry.file_id as usize)
            .ok_or_else(|| {
                Error::ReadFailure(format!("index references unknown file {}", entry.file_id))
            })?;
        let encoded = BlockFile::read_at(file, entry.offset, entry.nbytes).await?;
        let expected = self.layout.block_bytes();
        let decoded = self
            .codec
            .decode(&encoded, expected)
            .map_err(|e| Error::ReadFailure(e.to_string()))?;
        if decoded.len() != expected {
            return Err(Error::ReadFailure(format!(
                "block {} decoded to {} bytes, expected {}",
                coord,
                decoded.len(),
                expected
            )));
        }
        Ok(Some(RawBlock::new(
            self.layout.nominal_shape(),
            self.layout.dtype(),
            decoded,
        )?))
    }

    fn encode_directory_file(&self) -> Result<Vec<u8>> {
        let dir_header = DirectoryHeader {
            layout: self.layout.clone(),
            codec: self.codec_spec.clone(),
            block_paths: self.block_files.clone(),
        };
        let index = self.index.read();
        header::encode(&dir_header, &index)
    }

    /// Wait for every accepted submission to commit or fail, sync the
    /// block files, atomically rewrite the directory file, and drain the
    /// error log.
    pub async fn flush(&self) -> Result<Vec<WriteError>> {
        if !self.writable {
            return Ok(Vec::new());
        }
        let _gate = self.flush_gate.lock().await;

        let handle = match &*self.pool.lock() {
            Pool::Running(pool) => Some(pool.handle()),
            Pool::Idle => None,
            Pool::Closed => return Err(Error::Closed),
        };
        if let Some(handle) = handle {
            handle.checkpoint().await?;
        }

        let bytes = self.encode_directory_file()?;
        header::write_atomic(&self.path, &bytes).await?;

        let drained = std::mem::take(&mut *self.errors.lock());
        tracing::debug!(
            blocks = self.written_blocks(),
            errors = drained.len(),
            "flushed volume"
        );
        Ok(drained)
    }

    /// Drain and stop the writer pool, persist the final index, and
    /// release the block files. Further writes fail with `Closed`;
    /// reads keep working. Closing twice is a no-op.
    pub async fn close(&self) -> Result<Vec<WriteError>> {
        if !self.writable {
            return Ok(Vec::new());
        }
        let _gate = self.flush_gate.lock().await;

        let previous = {
            let mut pool = self.pool.lock();
            std::mem::replace(&mut *pool, Pool::Closed)
        };
        match previous {
            Pool::Running(pool) => pool.shutdown().await,
            Pool::Idle => {}
            Pool::Closed => return Ok(Vec::new()),
        }

        let bytes = self.encode_directory_file()?;
        header::write_atomic(&self.path, &bytes).await?;

        let drained = std::mem::take(&mut *self.errors.lock());
        tracing::info!(
            path = %self.path.display(),
            blocks = self.written_blocks(),
            errors = drained.len(),
            "closed volume"
        );
        Ok(drained)
    }
}
