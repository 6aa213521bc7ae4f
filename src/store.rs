use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as IoWrite};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::block::Block;
use crate::config::StorageConfig;
use crate::crypto::{Address, Hash32};
use crate::error::CoreError;
use crate::wire::{Reader, WireDecode, WireEncode, Writer};
use crate::Result;

/// Key-schema prefixes of the state store. One flat keyspace, first byte
/// selects the record family.
pub mod keys {
    use super::*;

    pub const ACCOUNT: u8 = 0x01;
    pub const BLOCK_META: u8 = 0x02;
    pub const HEIGHT_INDEX: u8 = 0x03;
    pub const BLOCK_LOCATION: u8 = 0x04;
    pub const TOKEN: u8 = 0x05;
    pub const CHAIN_TIP: u8 = 0x06;
    pub const WRITE_SET: u8 = 0x07;
    pub const FORK_STATE: u8 = 0x08;
    pub const PENDING_SPEND: u8 = 0x09;
    pub const MEMPOOL_SNAPSHOT: u8 = 0x0a;

    pub fn account(addr: &Address) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + addr.as_bytes().len());
        key.push(ACCOUNT);
        key.extend_from_slice(addr.as_bytes());
        key
    }

    pub fn block_meta(hash: &Hash32) -> Vec<u8> {
        prefixed(BLOCK_META, hash)
    }

    pub fn height_index(height: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(HEIGHT_INDEX);
        key.extend_from_slice(&height.to_be_bytes());
        key
    }

    pub fn block_location(hash: &Hash32) -> Vec<u8> {
        prefixed(BLOCK_LOCATION, hash)
    }

    pub fn token(token_hash: &Hash32) -> Vec<u8> {
        prefixed(TOKEN, token_hash)
    }

    pub fn chain_tip() -> Vec<u8> {
        vec![CHAIN_TIP]
    }

    pub fn write_set(hash: &Hash32) -> Vec<u8> {
        prefixed(WRITE_SET, hash)
    }

    pub fn fork_state() -> Vec<u8> {
        vec![FORK_STATE]
    }

    pub fn pending_spend(spend_tx: &Hash32) -> Vec<u8> {
        prefixed(PENDING_SPEND, spend_tx)
    }

    pub fn mempool_snapshot() -> Vec<u8> {
        vec![MEMPOOL_SNAPSHOT]
    }

    fn prefixed(prefix: u8, hash: &Hash32) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(prefix);
        key.extend_from_slice(hash);
        key
    }
}

/// Where a block body lives inside the append-only block files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub file_id: u32,
    /// Offset of the record start (the magic bytes).
    pub offset: u64,
    /// Full record length: magic + length prefix + body.
    pub length: u32,
}

impl WireEncode for BlockLocation {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u32(self.file_id);
        out.put_u64(self.offset);
        out.put_u32(self.length);
    }
}

impl WireDecode for BlockLocation {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockLocation {
            file_id: reader.u32()?,
            offset: reader.u64()?,
            length: reader.u32()?,
        })
    }
}

/// Record framing inside block files: magic, big-endian length, body.
const RECORD_HEADER_LEN: u64 = 8;

struct BlockFiles {
    dir: PathBuf,
    magic: [u8; 4],
    rotate_at: u64,
    current_id: u32,
    current_len: u64,
    current: Option<File>,
}

impl BlockFiles {
    fn file_path(dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("{id:05}.dat"))
    }

    fn open(dir: PathBuf, magic: [u8; 4], rotate_at: u64) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut current_id = 0u32;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".dat") {
                if let Ok(id) = stem.parse::<u32>() {
                    current_id = current_id.max(id);
                }
            }
        }
        let path = Self::file_path(&dir, current_id);
        let current_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            dir,
            magic,
            rotate_at,
            current_id,
            current_len,
            current: None,
        })
    }

    fn writer(&mut self) -> Result<&mut File> {
        if self.current.is_none() {
            let path = Self::file_path(&self.dir, self.current_id);
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.current = Some(file);
        }
        Ok(self.current.as_mut().expect("writer just opened"))
    }

    fn append(&mut self, body: &[u8]) -> Result<BlockLocation> {
        let record_len = RECORD_HEADER_LEN + body.len() as u64;
        if self.current_len > 0 && self.current_len + record_len > self.rotate_at {
            self.current = None;
            self.current_id += 1;
            self.current_len = 0;
            log::info!("rotating to block file {:05}.dat", self.current_id);
        }
        let offset = self.current_len;
        let magic = self.magic;
        let file = self.writer()?;
        file.write_all(&magic)?;
        file.write_all(&(body.len() as u32).to_be_bytes())?;
        file.write_all(body)?;
        file.flush()?;
        file.sync_data()?;
        self.current_len += record_len;
        Ok(BlockLocation {
            file_id: self.current_id,
            offset,
            length: record_len as u32,
        })
    }

    fn read(&self, location: &BlockLocation) -> Result<Vec<u8>> {
        let path = Self::file_path(&self.dir, location.file_id);
        let mut file = File::open(&path).map_err(|e| {
            CoreError::StoreCorruption(format!("missing block file {}: {e}", path.display()))
        })?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header).map_err(|e| {
            CoreError::StoreCorruption(format!("truncated block record: {e}"))
        })?;
        if header[..4] != self.magic {
            return Err(CoreError::StoreCorruption(format!(
                "bad magic in {} at offset {}",
                path.display(),
                location.offset
            )));
        }
        let body_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as u64;
        if body_len + RECORD_HEADER_LEN != location.length as u64 {
            return Err(CoreError::StoreCorruption(format!(
                "record length mismatch in {} at offset {}",
                path.display(),
                location.offset
            )));
        }
        let mut body = vec![0u8; body_len as usize];
        file.read_exact(&mut body).map_err(|e| {
            CoreError::StoreCorruption(format!("truncated block body: {e}"))
        })?;
        Ok(body)
    }
}

/// Persistent store: append-only block files plus the sled key-value index.
/// Chain mutations are expressed as single atomic batches; block bodies are
/// written before the batch that indexes them, so a crash leaves at worst an
/// unreferenced record at a file tail.
pub struct Store {
    db: sled::Db,
    files: Mutex<BlockFiles>,
}

impl Store {
    pub fn open(data_dir: &Path, magic: [u8; 4], storage: &StorageConfig) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let db = sled::open(data_dir.join("state"))?;
        let files = BlockFiles::open(data_dir.join("blocks"), magic, storage.block_file_size)?;
        Ok(Self {
            db,
            files: Mutex::new(files),
        })
    }

    // Raw KV surface; record (de)serialization belongs to the callers.

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|ivec| ivec.to_vec()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    /// Apply a batch atomically and make it durable.
    pub fn commit(&self, batch: sled::Batch) -> Result<()> {
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // Block bodies.

    /// Append a block body to the block files. The caller indexes the
    /// returned location under `keys::block_location` in its commit batch.
    pub fn append_block(&self, block: &Block) -> Result<BlockLocation> {
        self.files.lock().append(&block.encode())
    }

    pub fn read_block_at(&self, location: &BlockLocation) -> Result<Block> {
        let body = self.files.lock().read(location)?;
        Block::decode(&body)
            .map_err(|e| CoreError::StoreCorruption(format!("undecodable block body: {e}")))
    }

    pub fn block_location(&self, hash: &Hash32) -> Result<Option<BlockLocation>> {
        match self.get(&keys::block_location(hash))? {
            Some(bytes) => Ok(Some(BlockLocation::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>> {
        match self.block_location(hash)? {
            Some(location) => Ok(Some(self.read_block_at(&location)?)),
            None => Ok(None),
        }
    }

    pub fn tip_hash(&self) -> Result<Option<Hash32>> {
        match self.get(&keys::chain_tip())? {
            Some(bytes) => {
                if bytes.len() != 32 {
                    return Err(CoreError::StoreCorruption("bad chain tip record".into()));
                }
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn header_hash_at(&self, height: u64) -> Result<Option<Hash32>> {
        match self.get(&keys::height_index(height))? {
            Some(bytes) => {
                if bytes.len() != 32 {
                    return Err(CoreError::StoreCorruption("bad height index record".into()));
                }
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    /// Startup recovery: make sure the KV tip actually resolves to a
    /// readable block. If the tail of a block file was lost, walk the height
    /// index backwards, dropping index entries until a readable block is
    /// found, and re-point the tip there. Returns the recovered tip hash.
    pub fn recover(&self) -> Result<Option<Hash32>> {
        let Some(tip) = self.tip_hash()? else {
            return Ok(None);
        };
        let Some(location) = self.block_location(&tip)? else {
            return Err(CoreError::StoreCorruption(
                "chain tip has no block location".into(),
            ));
        };
        let tip_block = match self.read_block_at(&location) {
            Ok(block) => Some(block),
            Err(err) => {
                log::warn!("tip block unreadable ({err}), truncating to last consistent block");
                None
            }
        };
        if let Some(block) = tip_block {
            if block.hash() == tip {
                return Ok(Some(tip));
            }
            log::warn!("tip block hash mismatch, truncating");
        }

        // Find the tip height through the block meta of the broken tip being
        // unavailable; scan the height index downward from the highest entry.
        let mut height = self.highest_indexed_height()?;
        loop {
            let Some(h) = height else {
                // Nothing readable remains.
                return Err(CoreError::StoreCorruption(
                    "no consistent block found during recovery".into(),
                ));
            };
            let hash = self.header_hash_at(h)?;
            let readable = match hash {
                Some(hash) => match self.block_location(&hash)? {
                    Some(location) => self
                        .read_block_at(&location)
                        .map(|block| block.hash() == hash)
                        .unwrap_or(false),
                    None => false,
                },
                None => false,
            };
            if readable {
                let hash = hash.expect("readable implies hash");
                let mut batch = sled::Batch::default();
                batch.insert(keys::chain_tip(), hash.to_vec());
                self.commit(batch)?;
                log::warn!("recovered chain tip at height {h}");
                return Ok(Some(hash));
            }
            if let Some(hash) = hash {
                // Undo the truncated block's state effects first, so the
                // accounts match the tip we fall back to and peers can
                // replay the block cleanly.
                let mut batch = match self.get(&keys::write_set(&hash))? {
                    Some(bytes) => {
                        let write_set = crate::state::WriteSet::decode(&bytes)?;
                        crate::state::revert_batch(&write_set)
                    }
                    None => sled::Batch::default(),
                };
                batch.remove(keys::height_index(h));
                batch.remove(keys::block_location(&hash));
                batch.remove(keys::block_meta(&hash));
                batch.remove(keys::write_set(&hash));
                self.commit(batch)?;
            }
            height = if h == 0 { None } else { Some(h - 1) };
        }
    }

    fn highest_indexed_height(&self) -> Result<Option<u64>> {
        let prefix = [keys::HEIGHT_INDEX];
        let mut last = None;
        for item in self.db.scan_prefix(prefix) {
            let (key, _) = item?;
            if key.len() == 9 {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&key[1..]);
                last = Some(u64::from_be_bytes(raw));
            }
        }
        Ok(last)
    }
}
