//! RocksDB-backed room table.
//!
//! Column families:
//! - `rooms` - `room_id (16 bytes)` → bincode [`StoredRoom`], content LZ4 compressed
//! - `codes` - `room_code (utf-8)` → `room_id (16 bytes)`
//!
//! Both entries of a room are written in one batch, so the code index never
//! points at a missing row.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::StoreError;
use crate::room::{Room, RoomCode, RoomId};

const CF_ROOMS: &str = "rooms";
const CF_CODES: &str = "codes";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_CODES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("roompad_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// On-disk shape of a room row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRoom {
    id: Uuid,
    room_code: String,
    /// LZ4 (size-prepended) content; `None` for a null column
    content: Option<Vec<u8>>,
    created_at: u64,
}

impl StoredRoom {
    fn from_room(room: &Room) -> Self {
        Self {
            id: room.id.as_uuid(),
            room_code: room.room_code.to_string(),
            content: room
                .content
                .as_ref()
                .map(|text| lz4_flex::compress_prepend_size(text.as_bytes())),
            created_at: room.created_at,
        }
    }

    fn into_room(self) -> Result<Room, StoreError> {
        let room_code = RoomCode::parse(&self.room_code)
            .ok_or_else(|| StoreError::Corrupt(format!("empty room code for {}", self.id)))?;

        let content = match self.content {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Some(String::from_utf8(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?)
            }
            None => None,
        };

        Ok(Room {
            id: RoomId::from_uuid(self.id),
            room_code,
            content,
            created_at: self.created_at,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (room, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(room)
    }
}

/// Durable room table.
pub struct RoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RoomStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Content is already LZ4 compressed per row.
            CF_ROOMS => opts.set_compression_type(DBCompressionType::None),
            CF_CODES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Insert or overwrite a room row and its code index entry.
    pub fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_codes = self.cf(CF_CODES)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_rooms, room.id.as_bytes(), StoredRoom::from_room(room).encode()?);
        batch.put_cf(cf_codes, room.room_code.as_str().as_bytes(), room.id.as_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load one room by id.
    pub fn load_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(StoredRoom::decode(&bytes)?.into_room()?)),
            None => Ok(None),
        }
    }

    /// Resolve a code through the index.
    pub fn room_id_for_code(&self, code: &RoomCode) -> Result<Option<RoomId>, StoreError> {
        let cf = self.cf(CF_CODES)?;
        match self.db.get_cf(cf, code.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load every stored room.
    pub fn load_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rooms.push(StoredRoom::decode(&value)?.into_room()?);
        }

        Ok(rooms)
    }

    /// Number of stored rooms.
    pub fn room_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn decode_id(bytes: &[u8]) -> Result<RoomId, StoreError> {
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| StoreError::Corrupt("Invalid room id key".into()))?;
        Ok(RoomId::from_uuid(Uuid::from_bytes(raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RoomStore {
        RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn room(code: &str, content: Option<&str>) -> Room {
        let mut room = Room::new(RoomCode::parse(code).unwrap());
        room.content = content.map(str::to_string);
        room
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let saved = room("AB12CD", Some("hello, store"));
        store.save_room(&saved).unwrap();

        let loaded = store.load_room(saved.id).unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(
            store.room_id_for_code(&saved.room_code).unwrap(),
            Some(saved.id)
        );
    }

    #[test]
    fn test_missing_room() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.load_room(RoomId::new()).unwrap().is_none());
        assert!(store
            .room_id_for_code(&RoomCode::parse("NOPE00").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_null_content_survives() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let saved = room("NULL00", None);
        store.save_room(&saved).unwrap();
        assert_eq!(store.load_room(saved.id).unwrap().unwrap().content, None);
    }

    #[test]
    fn test_overwrite_keeps_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let mut saved = room("AB12CD", Some("v1"));
        store.save_room(&saved).unwrap();
        saved.content = Some("v2".into());
        store.save_room(&saved).unwrap();

        assert_eq!(store.room_count().unwrap(), 1);
        let loaded = store.load_room(saved.id).unwrap().unwrap();
        assert_eq!(loaded.content.as_deref(), Some("v2"));
    }

    #[test]
    fn test_reopen_recovers_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let large = "lorem ipsum ".repeat(10_000);
        let ids = {
            let store = open(&dir);
            let a = room("ROOM01", Some("first"));
            let b = room("ROOM02", Some(&large));
            store.save_room(&a).unwrap();
            store.save_room(&b).unwrap();
            store.flush().unwrap();
            (a.id, b.id)
        };

        let store = open(&dir);
        let mut rooms = store.load_rooms().unwrap();
        rooms.sort_by(|x, y| x.room_code.cmp(&y.room_code));
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].id, ids.0);
        assert_eq!(rooms[1].id, ids.1);
        assert_eq!(rooms[1].content.as_deref(), Some(large.as_str()));
    }
}
