//! RocksDB-backed durable store.
//!
//! Column families:
//! - `comments`     : `<artifact>\0<comment uuid>` → bincode [`Comment`]
//! - `activities`   : `<artifact>\0<timestamp BE><seq BE><uuid>` → JSON [`Activity`]
//! - `notifications`: `<recipient>\0<uuid>` → JSON [`Notification`]
//! - `versions`     : `<artifact>\0<version BE>` → bincode [`VersionMarker`]
//!
//! Fixed-shape records use bincode; records carrying free-form JSON
//! payloads use serde_json since bincode cannot decode self-describing
//! values. Values above [`COMPRESS_THRESHOLD`] are LZ4 compressed and
//! tagged with a leading byte.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, Direction, IteratorMode,
    Options, WriteOptions, DB,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::DurableStore;
use crate::error::StoreError;
use crate::model::{Activity, Comment, Notification, VersionMarker};

const CF_COMMENTS: &str = "comments";
const CF_ACTIVITIES: &str = "activities";
const CF_NOTIFICATIONS: &str = "notifications";
const CF_VERSIONS: &str = "versions";

const COLUMN_FAMILIES: &[&str] = &[CF_COMMENTS, CF_ACTIVITIES, CF_NOTIFICATIONS, CF_VERSIONS];

/// Values at least this large are stored LZ4 compressed.
pub const COMPRESS_THRESHOLD: usize = 1024;

const TAG_RAW: u8 = 0;
const TAG_LZ4: u8 = 1;

#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

impl RocksConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

pub struct RocksStore {
    db: DB,
    config: RocksConfig,
    /// Orders activities appended within the same millisecond.
    activity_seq: AtomicU64,
}

impl RocksStore {
    /// Open (or create) the store and its column families.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                let mut block_opts = BlockBasedOptions::default();
                block_opts.set_block_cache(&cache);
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
                // Large values are already LZ4 framed by the record codec.
                opts.set_compression_type(DBCompressionType::None);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, descriptors)?;
        log::info!("Opened durable store at {}", config.path.display());
        // Seeded from the clock so sequences keep increasing across restarts.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Ok(Self {
            db,
            config,
            activity_seq: AtomicU64::new(seed),
        })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        self.db.put_cf_opt(cf, key, frame_value(value), &self.write_opts())?;
        Ok(())
    }

    fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(stored) => Ok(Some(unframe_value(&stored)?)),
            None => Ok(None),
        }
    }

    /// All values under `prefix` in key order.
    fn scan(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(unframe_value(&value)?);
        }
        Ok(values)
    }

    /// The last `limit` values under `prefix`, returned in key order.
    fn scan_tail(
        &self,
        cf_name: &str,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut upper = prefix.to_vec();
        if let Some(last) = upper.last_mut() {
            *last += 1;
        }
        let mut values = Vec::with_capacity(limit.min(256));
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse))
        {
            if values.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                if key.as_ref() > prefix {
                    continue;
                }
                break;
            }
            values.push(unframe_value(&value)?);
        }
        values.reverse();
        Ok(values)
    }
}

/// `<scope>\0`: every key in this store starts with one.
fn scope_prefix(scope: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(scope.len() + 1);
    key.extend_from_slice(scope.as_bytes());
    key.push(0);
    key
}

fn comment_key(artifact_id: &str, comment_id: Uuid) -> Vec<u8> {
    let mut key = scope_prefix(artifact_id);
    key.extend_from_slice(comment_id.as_bytes());
    key
}

fn activity_key(activity: &Activity, seq: u64) -> Vec<u8> {
    let mut key = scope_prefix(&activity.artifact_id);
    key.extend_from_slice(&activity.timestamp.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key.extend_from_slice(activity.id.as_bytes());
    key
}

fn notification_key(recipient: &str, id: Uuid) -> Vec<u8> {
    let mut key = scope_prefix(recipient);
    key.extend_from_slice(id.as_bytes());
    key
}

fn version_key(artifact_id: &str, version_no: u64) -> Vec<u8> {
    let mut key = scope_prefix(artifact_id);
    key.extend_from_slice(&version_no.to_be_bytes());
    key
}

fn frame_value(raw: &[u8]) -> Vec<u8> {
    let mut framed;
    if raw.len() >= COMPRESS_THRESHOLD {
        let compressed = lz4_flex::compress_prepend_size(raw);
        framed = Vec::with_capacity(compressed.len() + 1);
        framed.push(TAG_LZ4);
        framed.extend_from_slice(&compressed);
    } else {
        framed = Vec::with_capacity(raw.len() + 1);
        framed.push(TAG_RAW);
        framed.extend_from_slice(raw);
    }
    framed
}

fn unframe_value(stored: &[u8]) -> Result<Vec<u8>, StoreError> {
    match stored.split_first() {
        Some((&TAG_RAW, body)) => Ok(body.to_vec()),
        Some((&TAG_LZ4, body)) => lz4_flex::decompress_size_prepended(body)
            .map_err(|e| StoreError::Compression(e.to_string())),
        Some((tag, _)) => Err(StoreError::Deserialization(format!("unknown value tag {tag}"))),
        None => Err(StoreError::Deserialization("empty value".into())),
    }
}

fn to_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_bincode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

#[async_trait]
impl DurableStore for RocksStore {
    async fn insert_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.put(
            CF_COMMENTS,
            &comment_key(&comment.artifact_id, comment.id),
            &to_bincode(comment)?,
        )
    }

    async fn update_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.insert_comment(comment).await
    }

    async fn delete_comment(&self, artifact_id: &str, comment_id: Uuid) -> Result<(), StoreError> {
        let cf = self.cf(CF_COMMENTS)?;
        self.db
            .delete_cf_opt(cf, comment_key(artifact_id, comment_id), &self.write_opts())?;
        Ok(())
    }

    async fn get_comment(
        &self,
        artifact_id: &str,
        comment_id: Uuid,
    ) -> Result<Option<Comment>, StoreError> {
        self.get(CF_COMMENTS, &comment_key(artifact_id, comment_id))?
            .map(|bytes| from_bincode(&bytes))
            .transpose()
    }

    async fn list_comments(&self, artifact_id: &str) -> Result<Vec<Comment>, StoreError> {
        let mut comments = self
            .scan(CF_COMMENTS, &scope_prefix(artifact_id))?
            .iter()
            .map(|bytes| from_bincode::<Comment>(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn append_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        let seq = self.activity_seq.fetch_add(1, Ordering::Relaxed);
        self.put(CF_ACTIVITIES, &activity_key(activity, seq), &to_json(activity)?)
    }

    async fn recent_activities(
        &self,
        artifact_id: &str,
        limit: usize,
    ) -> Result<Vec<Activity>, StoreError> {
        self.scan_tail(CF_ACTIVITIES, &scope_prefix(artifact_id), limit)?
            .iter()
            .map(|bytes| from_json(bytes))
            .collect()
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.put(
            CF_NOTIFICATIONS,
            &notification_key(&notification.recipient, notification.id),
            &to_json(notification)?,
        )
    }

    async fn update_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.insert_notification(notification).await
    }

    async fn get_notification(
        &self,
        recipient: &str,
        id: Uuid,
    ) -> Result<Option<Notification>, StoreError> {
        self.get(CF_NOTIFICATIONS, &notification_key(recipient, id))?
            .map(|bytes| from_json(&bytes))
            .transpose()
    }

    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, StoreError> {
        let mut all = self
            .scan(CF_NOTIFICATIONS, &scope_prefix(recipient))?
            .iter()
            .map(|bytes| from_json::<Notification>(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        all.sort_by_key(|n| n.created_at);
        Ok(all)
    }

    async fn record_version(&self, marker: &VersionMarker) -> Result<(), StoreError> {
        self.put(
            CF_VERSIONS,
            &version_key(&marker.artifact_id, marker.version_no),
            &to_bincode(marker)?,
        )
    }

    async fn versions(&self, artifact_id: &str) -> Result<Vec<VersionMarker>, StoreError> {
        self.scan(CF_VERSIONS, &scope_prefix(artifact_id))?
            .iter()
            .map(|bytes| from_bincode(bytes))
            .collect()
    }
}
