//! Persistence collaborator, stable review identity, and the shared fetch
//! throttle for the hotel review sampler.

use std::collections::{BTreeMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hrs_core::{HotelCandidate, RawReview, TaskEvent, TaskRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod probe;
pub mod throttle;

pub use probe::{classify_status, classify_status_code, HttpProbe, ProbeConfig, ProbeReport};
pub use throttle::{BackoffPolicy, RateBudgetSnapshot, RateLimitConfig, RateLimiter, RetryDecision};

pub const CRATE_NAME: &str = "hrs-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record in {path} line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of an idempotent review upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Append/upsert-only store the scheduler and workers hand their results to.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn upsert_hotel(&self, hotel: &HotelCandidate) -> Result<(), StorageError>;

    /// Stores reviews not seen before, keyed by `review_id`.
    async fn upsert_reviews(&self, reviews: &[RawReview]) -> Result<UpsertOutcome, StorageError>;

    async fn record_task_event(&self, event: &TaskEvent) -> Result<(), StorageError>;

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StorageError>;

    async fn load_tasks(&self) -> Result<Vec<TaskRecord>, StorageError>;

    async fn load_hotels(&self) -> Result<Vec<HotelCandidate>, StorageError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable dedup key for a review. The site's own id wins when it has one.
pub fn stable_review_id(hotel_id: &str, site_review_id: Option<&str>, content: &str, user_nick: Option<&str>) -> String {
    if let Some(id) = site_review_id.map(str::trim).filter(|id| !id.is_empty()) {
        return format!("{hotel_id}_{id}");
    }
    let digest = sha256_hex(format!("{hotel_id}|{content}|{}", user_nick.unwrap_or_default()).as_bytes());
    format!("{hotel_id}_{}", &digest[..16])
}

#[derive(Debug, Default)]
struct MemoryState {
    hotels: BTreeMap<String, HotelCandidate>,
    reviews: BTreeMap<String, RawReview>,
    tasks: BTreeMap<Uuid, TaskRecord>,
    events: Vec<TaskEvent>,
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reviews(&self) -> Vec<RawReview> {
        self.state.lock().await.reviews.values().cloned().collect()
    }

    pub async fn events(&self) -> Vec<TaskEvent> {
        self.state.lock().await.events.clone()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn upsert_hotel(&self, hotel: &HotelCandidate) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.hotels.insert(hotel.external_id.clone(), hotel.clone());
        Ok(())
    }

    async fn upsert_reviews(&self, reviews: &[RawReview]) -> Result<UpsertOutcome, StorageError> {
        let mut state = self.state.lock().await;
        let mut outcome = UpsertOutcome::default();
        for review in reviews {
            if state.reviews.contains_key(&review.review_id) {
                outcome.duplicates += 1;
            } else {
                state.reviews.insert(review.review_id.clone(), review.clone());
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn record_task_event(&self, event: &TaskEvent) -> Result<(), StorageError> {
        self.state.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StorageError> {
        self.state.lock().await.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        Ok(self.state.lock().await.tasks.values().cloned().collect())
    }

    async fn load_hotels(&self) -> Result<Vec<HotelCandidate>, StorageError> {
        Ok(self.state.lock().await.hotels.values().cloned().collect())
    }
}

#[derive(Debug, Default)]
struct FileState {
    hotels: BTreeMap<String, HotelCandidate>,
    tasks: BTreeMap<Uuid, TaskRecord>,
    review_ids: HashSet<String>,
}

/// Directory-backed store.
///
/// Hotels are a small snapshot rewritten through a temp file + rename. Task
/// records, reviews and task events are append-only JSON lines. Task records
/// are replayed on open with the last line per id winning, then compacted; the
/// review id index is rebuilt from `reviews.jsonl`.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    state: Mutex<FileState>,
}

impl FileStore {
    pub const HOTELS_FILE: &'static str = "hotels.json";
    pub const TASKS_FILE: &'static str = "tasks.jsonl";
    pub const REVIEWS_FILE: &'static str = "reviews.jsonl";
    pub const EVENTS_FILE: &'static str = "task_events.jsonl";

    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(io_err(&root))?;

        let hotels: Vec<HotelCandidate> = read_snapshot(&root.join(Self::HOTELS_FILE)).await?;
        let task_lines: Vec<TaskRecord> = read_json_lines(&root.join(Self::TASKS_FILE)).await?;
        let reviews: Vec<RawReview> = read_json_lines(&root.join(Self::REVIEWS_FILE)).await?;
        // Only checked for a torn tail; events are never read back.
        let events: Vec<TaskEvent> = read_json_lines(&root.join(Self::EVENTS_FILE)).await?;

        let replayed = task_lines.len();
        let state = FileState {
            hotels: hotels.into_iter().map(|h| (h.external_id.clone(), h)).collect(),
            tasks: task_lines.into_iter().map(|t| (t.id, t)).collect(),
            review_ids: reviews.into_iter().map(|r| r.review_id).collect(),
        };
        if replayed > state.tasks.len() {
            let mut rows: Vec<&TaskRecord> = state.tasks.values().collect();
            rows.sort_by_key(|t| t.seq);
            let mut buf = Vec::new();
            for row in rows {
                serde_json::to_writer(&mut buf, row)?;
                buf.push(b'\n');
            }
            write_atomic(&root.join(Self::TASKS_FILE), &buf).await?;
        }
        debug!(
            root = %root.display(),
            hotels = state.hotels.len(),
            tasks = state.tasks.len(),
            reviews = state.review_ids.len(),
            events = events.len(),
            task_lines = replayed,
            "opened file store"
        );
        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn review_count(&self) -> usize {
        self.state.lock().await.review_ids.len()
    }

    async fn append_lines<T: Serialize>(&self, file: &str, rows: &[T]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let path = self.root.join(file);
        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }
        let mut out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err(&path))?;
        out.write_all(&buf).await.map_err(io_err(&path))?;
        out.flush().await.map_err(io_err(&path))
    }
}

#[async_trait]
impl Persistence for FileStore {
    async fn upsert_hotel(&self, hotel: &HotelCandidate) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.hotels.insert(hotel.external_id.clone(), hotel.clone());
        let rows: Vec<&HotelCandidate> = state.hotels.values().collect();
        write_atomic(&self.root.join(Self::HOTELS_FILE), &serde_json::to_vec_pretty(&rows)?).await
    }

    async fn upsert_reviews(&self, reviews: &[RawReview]) -> Result<UpsertOutcome, StorageError> {
        let mut state = self.state.lock().await;
        let mut outcome = UpsertOutcome::default();
        let mut fresh = Vec::new();
        for review in reviews {
            if state.review_ids.insert(review.review_id.clone()) {
                fresh.push(review);
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        if let Err(err) = self.append_lines(Self::REVIEWS_FILE, &fresh).await {
            for review in fresh {
                state.review_ids.remove(&review.review_id);
            }
            return Err(err);
        }
        Ok(outcome)
    }

    async fn record_task_event(&self, event: &TaskEvent) -> Result<(), StorageError> {
        let _state = self.state.lock().await;
        self.append_lines(Self::EVENTS_FILE, std::slice::from_ref(event)).await
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        self.append_lines(Self::TASKS_FILE, std::slice::from_ref(task)).await?;
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let state = self.state.lock().await;
        let mut rows: Vec<TaskRecord> = state.tasks.values().cloned().collect();
        rows.sort_by_key(|t| t.seq);
        Ok(rows)
    }

    async fn load_hotels(&self) -> Result<Vec<HotelCandidate>, StorageError> {
        Ok(self.state.lock().await.hotels.values().cloned().collect())
    }
}

async fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    if !fs::try_exists(path).await.map_err(io_err(path))? {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).await.map_err(io_err(path))?;
    serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
        path: path.to_path_buf(),
        line: 0,
        source,
    })
}

/// Rows of a JSON-lines file.
///
/// A last line without its newline is what a crash mid-append leaves behind.
/// It is kept if it parses and cut off otherwise, so the next append starts on
/// a fresh line. A bad line anywhere before it is corruption.
async fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    if !fs::try_exists(path).await.map_err(io_err(path))? {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).await.map_err(io_err(path))?;
    let terminated = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |idx| idx + 1);
    let (body, tail) = bytes.split_at(terminated);

    let mut rows = Vec::new();
    for (idx, line) in body.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let row = serde_json::from_slice(line).map_err(|source| StorageError::Corrupt {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        rows.push(row);
    }
    if tail.iter().all(u8::is_ascii_whitespace) {
        return Ok(rows);
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(io_err(path))?;
    match serde_json::from_slice(tail) {
        Ok(row) => {
            rows.push(row);
            file.seek(SeekFrom::End(0)).await.map_err(io_err(path))?;
            file.write_all(b"\n").await.map_err(io_err(path))?;
        }
        Err(err) => {
            warn!(path = %path.display(), bytes = tail.len(), error = %err, "dropping torn last line");
            file.set_len(terminated as u64).await.map_err(io_err(path))?;
        }
    }
    file.flush().await.map_err(io_err(path))?;
    Ok(rows)
}

/// Replace `path` with `bytes` through a sibling temp file and a rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
