//! Directory-file layout and persistence
//!
//! The directory file is the volume's single source of truth: a fixed
//! preamble describing the volume, the block-file path table, the dense
//! index, and a trailing CRC-32 over everything before it. All integers
//! are little-endian.
//!
//! ```text
//! magic            8 B   "BLOCKFS\0"
//! version          2 B   currently 1
//! dtype code       2 B
//! X, Y, Z          3 x 8 B
//! bx, by, bz       3 x 4 B
//! codec name       2 B length + UTF-8 bytes
//! codec params     2 B length + opaque bytes
//! W                2 B   block-file count
//! path table       W x (2 B length + UTF-8 bytes)
//! index length     8 B   Nx * Ny * Nz
//! index entries    index length x 14 B
//! crc32            4 B   over all prior bytes
//! ```

use crate::codec::CodecSpec;
use crate::error::{Error, Result};
use crate::index::{BlockIndex, ENTRY_SIZE};
use crate::layout::VolumeLayout;
use crate::types::DataType;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Magic bytes opening every directory file
pub const MAGIC: &[u8; 8] = b"BLOCKFS\0";

/// Current directory-file format version
pub const FORMAT_VERSION: u16 = 1;

/// Decoded directory-file preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirectoryHeader {
    pub layout: VolumeLayout,
    pub codec: CodecSpec,
    /// Block-file locations as recorded at create or the last rebase.
    pub block_paths: Vec<String>,
}

/// A parsed directory file: preamble plus index.
#[derive(Debug, Clone)]
pub(crate) struct DirectoryFile {
    pub header: DirectoryHeader,
    pub index: BlockIndex,
}

fn push_str(buf: &mut Vec<u8>, s: &[u8], what: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::Format(format!("{} longer than 65535 bytes", what)))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s);
    Ok(())
}

/// Serialise a directory file to its exact byte layout.
pub(crate) fn encode(header: &DirectoryHeader, index: &BlockIndex) -> Result<Vec<u8>> {
    let layout = &header.layout;
    debug_assert_eq!(index.cell_count(), layout.cell_count());

    let mut buf = Vec::with_capacity(128 + index.cell_count() as usize * ENTRY_SIZE);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&layout.dtype().code().to_le_bytes());
    for extent in layout.extent() {
        buf.extend_from_slice(&extent.to_le_bytes());
    }
    for block in layout.block_size() {
        buf.extend_from_slice(&block.to_le_bytes());
    }
    push_str(&mut buf, header.codec.name.as_bytes(), "codec name")?;
    push_str(&mut buf, &header.codec.params, "codec params")?;

    let n_files = u16::try_from(header.block_paths.len())
        .map_err(|_| Error::Format("more than 65535 block files".into()))?;
    buf.extend_from_slice(&n_files.to_le_bytes());
    for path in &header.block_paths {
        push_str(&mut buf, path.as_bytes(), "block-file path")?;
    }

    buf.extend_from_slice(&index.cell_count().to_le_bytes());
    index.encode_into(&mut buf);

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Format("truncated directory file".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Format(format!("{} is not valid UTF-8", what)))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Parse and verify a directory file.
///
/// The CRC is checked over the whole byte image before any field is
/// trusted, so a flipped bit anywhere surfaces as a format error rather
/// than a misparse.
pub(crate) fn decode(bytes: &[u8]) -> Result<DirectoryFile> {
    if bytes.len() < MAGIC.len() + 4 {
        return Err(Error::Format("truncated directory file".into()));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    if crc32fast::hash(body) != stored_crc {
        return Err(Error::Format("directory file checksum mismatch".into()));
    }

    let mut reader = Reader::new(body);
    if reader.take(MAGIC.len())? != MAGIC {
        return Err(Error::Format("bad magic, not a BlockFS directory".into()));
    }
    let version = reader.u16()?;
    if version != FORMAT_VERSION {
        return Err(Error::Format(format!(
            "unsupported format version {}",
            version
        )));
    }

    let dtype = DataType::from_code(reader.u16()?)?;
    let extent = [reader.u64()?, reader.u64()?, reader.u64()?];
    let block_size = [reader.u32()?, reader.u32()?, reader.u32()?];
    let layout = VolumeLayout::new(extent, block_size, dtype)?;

    let codec_name = reader.string("codec name")?;
    let params_len = reader.u16()? as usize;
    let codec_params = reader.take(params_len)?.to_vec();

    let n_files = reader.u16()?;
    let mut block_paths = Vec::with_capacity(n_files as usize);
    for _ in 0..n_files {
        block_paths.push(reader.string("block-file path")?);
    }

    let cell_count = reader.u64()?;
    if cell_count != layout.cell_count() {
        return Err(Error::Format(format!(
            "index length {} does not match grid of {} cells",
            cell_count,
            layout.cell_count()
        )));
    }
    if cell_count > (reader.remaining() / ENTRY_SIZE) as u64 {
        return Err(Error::Format("truncated directory file".into()));
    }
    let index_bytes = reader.take(cell_count as usize * ENTRY_SIZE)?;
    let index = BlockIndex::decode(index_bytes, cell_count)?;

    if reader.remaining() != 0 {
        return Err(Error::Format("trailing bytes after index".into()));
    }

    Ok(DirectoryFile {
        header: DirectoryHeader {
            layout,
            codec: CodecSpec::new(codec_name, codec_params),
            block_paths,
        },
        index,
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Atomically replace the directory file with `bytes`: write
/// `<path>.tmp`, fsync, rename over `<path>`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Serialise and atomically rewrite the directory file.
pub(crate) async fn persist(
    path: &Path,
    header: &DirectoryHeader,
    index: &BlockIndex,
) -> Result<()> {
    let bytes = encode(header, index)?;
    write_atomic(path, &bytes).await
}

/// Read and parse a directory file.
///
/// A leftover `<path>.tmp` from an interrupted rewrite is used only when
/// `<path>` itself is gone; when both exist the rename never happened,
/// so the temporary is stale and is deleted.
pub(crate) async fn load(path: &Path) -> Result<DirectoryFile> {
    let tmp = tmp_path(path);
    let bytes = match fs::read(path).await {
        Ok(bytes) => {
            if fs::try_exists(&tmp).await.unwrap_or(false) {
                let _ = fs::remove_file(&tmp).await;
            }
            bytes
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => match fs::read(&tmp).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(Error::Io(e)),
        },
        Err(e) => return Err(Error::Io(e)),
    };
    decode(&bytes)
}
