//! Per-block encoding and decoding
//!
//! A codec is a stateless `encode`/`decode` pair applied to the packed
//! voxel bytes of one block before storage. The directory file persists
//! the codec name plus an opaque parameter blob; a [`CodecRegistry`]
//! resolves them back to a codec at open time.

use crate::error::{Error, Result};
use flate2::read::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

/// Default compression level for the zlib and gzip codecs
pub const DEFAULT_LEVEL: u8 = 6;

/// Trait for per-block encode/decode operations.
///
/// Lossless codecs satisfy `decode(encode(b), b.len()) == b`; lossy
/// plug-in codecs document their own fidelity bound instead.
pub trait Codec: Send + Sync {
    /// The name persisted in the directory-file header
    fn name(&self) -> &str;

    /// Codec-specific parameter bytes persisted alongside the name
    fn params(&self) -> Vec<u8>;

    /// Encode one block's packed voxel bytes
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>>;

    /// Decode one block; `expected_size` is the nominal decoded length
    fn decode(&self, encoded: &[u8], expected_size: usize) -> Result<Vec<u8>>;
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").field("name", &self.name()).finish()
    }
}

/// Identity codec: bytes are stored exactly as submitted
#[derive(Debug, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &str {
        "raw"
    }

    fn params(&self) -> Vec<u8> {
        Vec::new()
    }

    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decode(&self, encoded: &[u8], _expected_size: usize) -> Result<Vec<u8>> {
        Ok(encoded.to_vec())
    }
}

/// Zlib codec with a persisted compression level
#[derive(Debug)]
pub struct ZlibCodec {
    level: u8,
}

impl ZlibCodec {
    pub fn new(level: u8) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Codec for ZlibCodec {
    fn name(&self) -> &str {
        "zlib"
    }

    fn params(&self) -> Vec<u8> {
        vec![self.level]
    }

    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(raw, FlateCompression::new(self.level as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| Error::Codec(e.to_string()))?;
        Ok(compressed)
    }

    fn decode(&self, encoded: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(encoded);
        let mut decompressed = Vec::with_capacity(expected_size);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| Error::Codec(e.to_string()))?;
        Ok(decompressed)
    }
}

/// Gzip codec with a persisted compression level
#[derive(Debug)]
pub struct GzipCodec {
    level: u8,
}

impl GzipCodec {
    pub fn new(level: u8) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Codec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn params(&self) -> Vec<u8> {
        vec![self.level]
    }

    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(raw, FlateCompression::new(self.level as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| Error::Codec(e.to_string()))?;
        Ok(compressed)
    }

    fn decode(&self, encoded: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(encoded);
        let mut decompressed = Vec::with_capacity(expected_size);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| Error::Codec(e.to_string()))?;
        Ok(decompressed)
    }
}

fn level_from_params(params: &[u8]) -> Result<u8> {
    match params {
        [] => Ok(DEFAULT_LEVEL),
        [level] if *level <= 9 => Ok(*level),
        other => Err(Error::Codec(format!(
            "bad compression-level params: {:?}",
            other
        ))),
    }
}

/// Codec selection persisted in the directory-file header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub name: String,
    pub params: Vec<u8>,
}

impl CodecSpec {
    pub fn new(name: impl Into<String>, params: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// No transformation
    pub fn raw() -> Self {
        Self::new("raw", Vec::new())
    }

    /// Zlib at the given level (0-9)
    pub fn zlib(level: u8) -> Self {
        Self::new("zlib", vec![level.min(9)])
    }

    /// Gzip at the given level (0-9)
    pub fn gzip(level: u8) -> Self {
        Self::new("gzip", vec![level.min(9)])
    }
}

impl Default for CodecSpec {
    fn default() -> Self {
        Self::zlib(DEFAULT_LEVEL)
    }
}

type CodecFactory = dyn Fn(&[u8]) -> Result<Arc<dyn Codec>> + Send + Sync;

/// Resolves persisted codec names to codec instances.
///
/// The default registry carries `raw`, `zlib` and `gzip`. External
/// codecs (tile-image, jpeg2000 and friends) are supplied by registering
/// a factory under their persisted name before `create`/`open`.
#[derive(Clone)]
pub struct CodecRegistry {
    factories: HashMap<String, Arc<CodecFactory>>,
}

impl CodecRegistry {
    /// An empty registry with no codecs at all
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a codec factory under the name it persists
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&[u8]) -> Result<Arc<dyn Codec>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Resolve a persisted `(name, params)` pair to a codec.
    ///
    /// Fails with `UnsupportedCodec` when the name is not registered.
    pub fn resolve(&self, name: &str, params: &[u8]) -> Result<Arc<dyn Codec>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnsupportedCodec(name.to_string()))?;
        (**factory)(params)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("raw", |_params| Ok(Arc::new(RawCodec) as Arc<dyn Codec>));
        registry.register("zlib", |params| {
            Ok(Arc::new(ZlibCodec::new(level_from_params(params)?)) as Arc<dyn Codec>)
        });
        registry.register("gzip", |params| {
            Ok(Arc::new(GzipCodec::new(level_from_params(params)?)) as Arc<dyn Codec>)
        });
        registry
    }
}
