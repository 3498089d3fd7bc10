//! The model file container.
//!
//! Layout: 8 byte magic, `u64` little-endian header length, JSON header, then the
//! array blocks back to back. The header carries the model metadata, the payload
//! tree with arrays replaced by block indices, and one entry per block with its
//! dtype, shape, compression and the SHA-256 of the uncompressed bytes.

use crate::codec::array::{ArrayData, Dtype, NdArray};
use crate::codec::prefix::PrefixSet;
use crate::codec::tree::{join_path, ArrayHandle, TreeNode};
use crate::config::ContainerConfig;
use crate::metadata::{atomic_write_with, ModelMeta};
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

const FORMAT_VERSION: u32 = 1;
const PREFIX_LEN: u64 = 16;

/// Compression applied to one array block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd,
    Zlib,
}

impl Compression {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
            Compression::Zlib => "zlib",
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => zstd::encode_all(data, ContainerConfig::ZSTD_LEVEL)
                .map_err(|e| VaultError::codec(format!("ZSTD compression failed: {}", e))),
            Compression::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                let failed = |e: std::io::Error| {
                    VaultError::codec(format!("zlib compression failed: {}", e))
                };
                encoder.write_all(data).map_err(failed)?;
                encoder.finish().map_err(failed)
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => zstd::decode_all(data)
                .map_err(|e| VaultError::codec(format!("ZSTD decompression failed: {}", e))),
            Compression::Zlib => {
                let mut out = Vec::new();
                flate2::read::ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| VaultError::codec(format!("zlib decompression failed: {}", e)))?;
                Ok(out)
            }
        }
    }
}

/// How arrays are written.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub compression: Compression,
    /// Arrays at or below these tree paths are stored uncompressed.
    pub no_compression: PrefixSet,
}

/// Location and encoding of one array block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Offset from the start of the block area.
    pub offset: u64,
    pub length: u64,
    pub raw_length: u64,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub compression: Compression,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Skeleton {
    Array(usize),
    Map(BTreeMap<String, Skeleton>),
    List(Vec<Skeleton>),
    Scalar(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    format_version: u32,
    meta: ModelMeta,
    tree: Skeleton,
    blocks: Vec<BlockInfo>,
}

/// Serialize `meta` and `tree` into container bytes.
pub fn encode_container(meta: &ModelMeta, tree: &TreeNode, options: &WriteOptions) -> Result<Vec<u8>> {
    let mut blocks = Vec::new();
    let mut body = Vec::new();
    let skeleton = build_skeleton(tree, "", options, &mut blocks, &mut body)?;
    let header = serde_json::to_vec(&Header {
        format_version: FORMAT_VERSION,
        meta: meta.clone(),
        tree: skeleton,
        blocks,
    })?;

    let mut out = Vec::with_capacity(PREFIX_LEN as usize + header.len() + body.len());
    out.extend_from_slice(ContainerConfig::MAGIC);
    out.extend_from_slice(&(header.len() as u64).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Write a container to `path` atomically and return its size in bytes.
pub fn write_container(
    path: &Path,
    meta: &ModelMeta,
    tree: &TreeNode,
    options: &WriteOptions,
) -> Result<u64> {
    let bytes = encode_container(meta, tree, options)?;
    atomic_write_with(path, |writer| {
        writer
            .write_all(&bytes)
            .map_err(|e| VaultError::io_with_path(e, path))
    })?;
    Ok(bytes.len() as u64)
}

fn build_skeleton(
    node: &TreeNode,
    path: &str,
    options: &WriteOptions,
    blocks: &mut Vec<BlockInfo>,
    body: &mut Vec<u8>,
) -> Result<Skeleton> {
    Ok(match node {
        TreeNode::Scalar(value) => Skeleton::Scalar(value.clone()),
        TreeNode::Map(children) => Skeleton::Map(
            children
                .iter()
                .map(|(key, child)| {
                    build_skeleton(child, &join_path(path, key), options, blocks, body)
                        .map(|skeleton| (key.clone(), skeleton))
                })
                .collect::<Result<_>>()?,
        ),
        TreeNode::List(items) => Skeleton::List(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    build_skeleton(item, &join_path(path, &i.to_string()), options, blocks, body)
                })
                .collect::<Result<_>>()?,
        ),
        TreeNode::Array(handle) => {
            let array = handle.get()?;
            let raw = array.data().to_le_bytes();
            let compression = if options.no_compression.contains(path) {
                Compression::None
            } else {
                options.compression
            };
            debug!(
                "Writing array {} ({} {:?}) with {}",
                path,
                array.dtype(),
                array.shape(),
                compression.as_str()
            );
            let stored = compression.compress(&raw)?;
            blocks.push(BlockInfo {
                offset: body.len() as u64,
                length: stored.len() as u64,
                raw_length: raw.len() as u64,
                dtype: array.dtype(),
                shape: array.shape().to_vec(),
                compression,
                sha256: hex::encode(Sha256::digest(&raw)),
            });
            body.extend_from_slice(&stored);
            Skeleton::Array(blocks.len() - 1)
        }
    })
}

/// Shared handle on an open container file.
#[derive(Debug)]
pub struct ContainerSource {
    path: PathBuf,
    data_start: u64,
    size: u64,
    file: Mutex<Option<File>>,
}

impl ContainerSource {
    fn read_block(&self, block: &BlockInfo) -> Result<NdArray> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| VaultError::codec("container file lock poisoned"))?;
        let file = guard.as_mut().ok_or_else(|| VaultError::CorruptContainer {
            message: "the container has been closed".to_string(),
            path: Some(self.path.clone()),
        })?;
        let (start, end) = block_range(block, self.data_start, self.size, Some(&self.path))?;
        let mut stored = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .and_then(|_| file.read_exact(&mut stored))
            .map_err(|e| VaultError::io_with_path(e, &self.path))?;
        decode_block(block, &stored, Some(&self.path))
    }

    /// Release the file handle. Unloaded lazy arrays fail afterwards.
    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if guard.take().is_some() {
                debug!("Closed {}", self.path.display());
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }
}

/// An array which is read from its container on first access.
#[derive(Debug, Clone)]
pub struct LazyArray {
    source: Arc<ContainerSource>,
    block: BlockInfo,
    cell: Arc<OnceLock<NdArray>>,
}

impl LazyArray {
    pub fn get(&self) -> Result<&NdArray> {
        if let Some(array) = self.cell.get() {
            return Ok(array);
        }
        let array = self.source.read_block(&self.block)?;
        let _ = self.cell.set(array);
        self.cell
            .get()
            .ok_or_else(|| VaultError::codec("lazy array failed to initialize"))
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn block(&self) -> &BlockInfo {
        &self.block
    }
}

fn decode_block(block: &BlockInfo, stored: &[u8], path: Option<&Path>) -> Result<NdArray> {
    let corrupt = |message: String| VaultError::CorruptContainer {
        message,
        path: path.map(Path::to_path_buf),
    };
    let raw = block.compression.decompress(stored)?;
    if raw.len() as u64 != block.raw_length {
        return Err(corrupt(format!(
            "block holds {} bytes, header says {}",
            raw.len(),
            block.raw_length
        )));
    }
    if hex::encode(Sha256::digest(&raw)) != block.sha256 {
        return Err(corrupt("block checksum mismatch".to_string()));
    }
    NdArray::new(block.shape.clone(), ArrayData::from_le_bytes(block.dtype, &raw)?)
}

/// A decoded container.
#[derive(Debug)]
pub struct Container {
    pub meta: ModelMeta,
    pub tree: TreeNode,
    /// Total size of the serialized container in bytes.
    pub size: u64,
    source: Option<Arc<ContainerSource>>,
}

impl Container {
    /// Release the underlying file, if any.
    pub fn close(&self) {
        if let Some(source) = &self.source {
            source.close();
        }
    }

    pub fn source(&self) -> Option<Arc<ContainerSource>> {
        self.source.clone()
    }
}

fn read_header_from(reader: &mut impl Read, path: Option<&Path>) -> Result<(Header, u64)> {
    let corrupt = |message: String| VaultError::CorruptContainer {
        message,
        path: path.map(Path::to_path_buf),
    };
    let mut prefix = [0u8; PREFIX_LEN as usize];
    reader
        .read_exact(&mut prefix)
        .map_err(|_| corrupt("file is too short".to_string()))?;
    if &prefix[..8] != ContainerConfig::MAGIC {
        return Err(corrupt("not a model container".to_string()));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&prefix[8..]);
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > ContainerConfig::MAX_HEADER_BYTES {
        return Err(corrupt(format!("header of {} bytes is too large", header_len)));
    }
    let mut header = vec![0u8; header_len as usize];
    reader
        .read_exact(&mut header)
        .map_err(|_| corrupt("truncated header".to_string()))?;
    let header: Header = serde_json::from_slice(&header)
        .map_err(|e| corrupt(format!("invalid header: {}", e)))?;
    if header.format_version > FORMAT_VERSION {
        return Err(corrupt(format!(
            "format version {} is newer than supported {}",
            header.format_version, FORMAT_VERSION
        )));
    }
    Ok((header, PREFIX_LEN + header_len))
}

/// Read only the metadata of a container.
pub fn read_meta(path: &Path) -> Result<ModelMeta> {
    let mut file = File::open(path).map_err(|e| VaultError::io_with_path(e, path))?;
    Ok(read_header_from(&mut file, Some(path))?.0.meta)
}

/// Read only the metadata of an in-memory container.
pub fn read_meta_from_bytes(bytes: &[u8]) -> Result<ModelMeta> {
    Ok(read_header_from(&mut &bytes[..], None)?.0.meta)
}

/// Open a container file.
///
/// With `lazy` the file stays open and arrays are read on first access until
/// [`Container::close`]. Otherwise every array is read now and the file is closed.
pub fn open_container(path: &Path, lazy: bool) -> Result<Container> {
    let mut file = File::open(path).map_err(|e| VaultError::io_with_path(e, path))?;
    let size = file
        .metadata()
        .map_err(|e| VaultError::io_with_path(e, path))?
        .len();
    let (header, data_start) = read_header_from(&mut file, Some(path))?;
    let source = Arc::new(ContainerSource {
        path: path.to_path_buf(),
        data_start,
        size,
        file: Mutex::new(Some(file)),
    });

    let tree = restore_tree(&header.tree, &header.blocks, &mut |block| {
        if lazy {
            Ok(ArrayHandle::Lazy(LazyArray {
                source: Arc::clone(&source),
                block: block.clone(),
                cell: Arc::new(OnceLock::new()),
            }))
        } else {
            source.read_block(block).map(ArrayHandle::from)
        }
    });
    if !lazy {
        source.close();
    }
    let tree = tree?;
    debug!(
        "Opened {} ({} blocks, lazy={})",
        path.display(),
        header.blocks.len(),
        lazy
    );
    Ok(Container {
        meta: header.meta,
        tree,
        size,
        source: if lazy { Some(source) } else { None },
    })
}

/// Decode an in-memory container eagerly.
pub fn decode_container(bytes: &[u8]) -> Result<Container> {
    let (header, data_start) = read_header_from(&mut &bytes[..], None)?;
    let tree = restore_tree(&header.tree, &header.blocks, &mut |block| {
        let (start, end) = block_range(block, data_start, bytes.len() as u64, None)?;
        decode_block(block, &bytes[start as usize..end as usize], None).map(ArrayHandle::from)
    })?;
    Ok(Container {
        meta: header.meta,
        tree,
        size: bytes.len() as u64,
        source: None,
    })
}

/// Byte range of `block` in a container of `size` bytes.
fn block_range(
    block: &BlockInfo,
    data_start: u64,
    size: u64,
    path: Option<&Path>,
) -> Result<(u64, u64)> {
    data_start
        .checked_add(block.offset)
        .and_then(|start| Some((start, start.checked_add(block.length)?)))
        .filter(|&(_, end)| end <= size)
        .ok_or_else(|| VaultError::CorruptContainer {
            message: format!(
                "block at offset {} with length {} extends past the end of the container",
                block.offset, block.length
            ),
            path: path.map(Path::to_path_buf),
        })
}

fn restore_tree<F>(skeleton: &Skeleton, blocks: &[BlockInfo], load: &mut F) -> Result<TreeNode>
where
    F: FnMut(&BlockInfo) -> Result<ArrayHandle>,
{
    Ok(match skeleton {
        Skeleton::Scalar(value) => TreeNode::Scalar(value.clone()),
        Skeleton::Map(children) => TreeNode::Map(
            children
                .iter()
                .map(|(key, child)| restore_tree(child, blocks, load).map(|node| (key.clone(), node)))
                .collect::<Result<_>>()?,
        ),
        Skeleton::List(items) => TreeNode::List(
            items
                .iter()
                .map(|item| restore_tree(item, blocks, load))
                .collect::<Result<_>>()?,
        ),
        Skeleton::Array(index) => {
            let block = blocks.get(*index).ok_or_else(|| VaultError::CorruptContainer {
                message: format!("block {} is missing from the block table", index),
                path: None,
            })?;
            TreeNode::Array(load(block)?)
        }
    })
}
