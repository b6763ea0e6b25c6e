//! Flight recorder: asynchronous capture of keyframes and delta frames.
//!
//! The tick thread serializes repository state into one of two capture
//! buffers; a single background worker LZ4-compresses the other and appends
//! it to the length-prefixed frame stream. When the worker is still busy a
//! non-blocking capture drops the frame and forces the next one to be a
//! keyframe, so the stream stays self-healing under backpressure.
//!
//! File layout (little-endian):
//!
//! ```text
//! [6 bytes: magic "FDPREC"]
//! [4 bytes: format version]
//! [8 bytes: unix timestamp seconds]
//!
//! Frame:
//! [4 bytes: compressed length]
//! [4 bytes: uncompressed length]
//! [8 bytes: tick]
//! [1 byte: kind (0 = delta, 1 = keyframe)]
//! [N bytes: LZ4 block payload]
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::component::DataPolicy;
use crate::error::{FdpError, Result};
use crate::repository::Repository;

/// Magic bytes identifying a recording file.
pub const RECORDING_MAGIC: &[u8; 6] = b"FDPREC";

/// Current recording format version; playback rejects mismatches.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the global file header in bytes.
pub const FILE_HEADER_LEN: usize = 6 + 4 + 8;

/// Size of a per-frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 4 + 4 + 8 + 1;

const DEFAULT_BUFFER_CAPACITY: usize = 32 * 1024 * 1024;

/// Recorded frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Columns changed since the previous recorded frame, plus destructions
    Delta = 0,
    /// Full snapshot of every recordable column
    Keyframe = 1,
}

impl FrameKind {
    /// Converts from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Delta),
            1 => Some(Self::Keyframe),
            _ => None,
        }
    }
}

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Every Nth recorded frame is a keyframe
    pub keyframe_interval: u32,
    /// Entities below this index are never recorded
    pub min_recordable_id: u32,
    /// Wait for the worker instead of dropping frames
    pub blocking: bool,
    /// Capture buffer size (two are allocated)
    pub buffer_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            keyframe_interval: 60,
            min_recordable_id: 0,
            blocking: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Advisory sidecar written next to the recording on close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub format_version: u32,
    pub created_unix_ms: i64,
    pub frames: u64,
    pub keyframes: u64,
    pub dropped_frames: u64,
    pub entity_index_high_water: u32,
    pub last_tick: u64,
}

struct Job {
    buf: Vec<u8>,
    tick: u64,
    kind: FrameKind,
}

/// Double-buffered asynchronous frame recorder.
pub struct FlightRecorder {
    config: RecorderConfig,
    path: PathBuf,

    /// Capture buffer owned by the tick thread
    front: Vec<u8>,
    /// Second buffer when not in flight with the worker
    back: Option<Vec<u8>>,

    job_tx: Option<Sender<Job>>,
    recycle_rx: Receiver<Vec<u8>>,
    worker: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<String>>>,

    recorded_frames: u64,
    dropped_frames: u64,
    keyframes: u64,
    frames_since_keyframe: u32,
    force_keyframe_next: bool,
    /// Version of the previous recorded frame (delta baseline)
    prev_recorded_version: u64,
    last_tick: u64,
    entity_high_water: u32,
    created_unix_ms: i64,
}

impl FlightRecorder {
    /// Create a recording at `path`, writing the global header and spawning
    /// the compression worker.
    pub fn create(path: impl AsRef<Path>, config: RecorderConfig) -> Result<FlightRecorder> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(File::create(&path)?);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        file.write_all(RECORDING_MAGIC)?;
        file.write_all(&FORMAT_VERSION.to_le_bytes())?;
        file.write_all(&(now.as_secs() as i64).to_le_bytes())?;

        let (job_tx, job_rx) = bounded::<Job>(1);
        let (recycle_tx, recycle_rx) = bounded::<Vec<u8>>(1);
        let last_error = Arc::new(Mutex::new(None));

        let worker_error = Arc::clone(&last_error);
        let worker = std::thread::Builder::new()
            .name("fdp-recorder".into())
            .spawn(move || worker_loop(file, job_rx, recycle_tx, worker_error))
            .map_err(|e| FdpError::RecorderError(e.to_string()))?;

        Ok(FlightRecorder {
            front: Vec::with_capacity(config.buffer_capacity),
            back: Some(Vec::with_capacity(config.buffer_capacity)),
            config,
            path,
            job_tx: Some(job_tx),
            recycle_rx,
            worker: Some(worker),
            last_error,
            recorded_frames: 0,
            dropped_frames: 0,
            keyframes: 0,
            frames_since_keyframe: 0,
            force_keyframe_next: false,
            prev_recorded_version: 0,
            last_tick: 0,
            entity_high_water: 0,
            created_unix_ms: now.as_millis() as i64,
        })
    }

    /// Capture the current state as a delta (or keyframe when due or forced).
    ///
    /// With a busy worker and `blocking == false` the frame is dropped,
    /// `dropped_frames` incremented, and the next capture forced to a
    /// keyframe.
    pub fn capture_frame(&mut self, repo: &mut Repository) -> Result<()> {
        self.capture_internal(repo, false)
    }

    /// Capture a full keyframe regardless of the interval.
    pub fn capture_keyframe(&mut self, repo: &mut Repository) -> Result<()> {
        self.capture_internal(repo, true)
    }

    fn capture_internal(&mut self, repo: &mut Repository, force_keyframe: bool) -> Result<()> {
        if let Some(err) = self.last_error.lock().clone() {
            return Err(FdpError::RecorderError(err));
        }

        // Reclaim the second buffer; the worker holds it while compressing.
        let mut buf = match self.back.take() {
            Some(buf) => buf,
            None => {
                if self.config.blocking {
                    self.recycle_rx
                        .recv()
                        .map_err(|_| FdpError::RecorderError("worker terminated".into()))?
                } else {
                    match self.recycle_rx.try_recv() {
                        Ok(buf) => buf,
                        Err(_) => {
                            self.dropped_frames += 1;
                            self.force_keyframe_next = true;
                            warn!(dropped = self.dropped_frames, "recorder worker busy, frame dropped");
                            return Ok(());
                        }
                    }
                }
            }
        };

        let keyframe_due = self.config.keyframe_interval > 0
            && self.frames_since_keyframe + 1 >= self.config.keyframe_interval;
        let kind = if force_keyframe
            || self.force_keyframe_next
            || self.recorded_frames == 0
            || keyframe_due
        {
            FrameKind::Keyframe
        } else {
            FrameKind::Delta
        };

        let tick = repo.global_version();
        self.front.clear();
        match kind {
            FrameKind::Keyframe => serialize_keyframe(
                &mut self.front,
                repo,
                tick,
                self.config.min_recordable_id,
            ),
            FrameKind::Delta => serialize_delta(
                &mut self.front,
                repo,
                tick,
                self.config.min_recordable_id,
                self.prev_recorded_version,
            ),
        }
        repo.drain_destruction_log();

        // The swap: the serialized front becomes the in-flight back buffer.
        std::mem::swap(&mut self.front, &mut buf);
        self.job_tx
            .as_ref()
            .expect("recorder open")
            .send(Job { buf, tick, kind })
            .map_err(|_| FdpError::RecorderError("worker terminated".into()))?;

        self.recorded_frames += 1;
        self.prev_recorded_version = tick;
        self.last_tick = tick;
        self.entity_high_water = self.entity_high_water.max(repo.entity_index().high_water());
        if kind == FrameKind::Keyframe {
            self.keyframes += 1;
            self.frames_since_keyframe = 0;
            self.force_keyframe_next = false;
        } else {
            self.frames_since_keyframe += 1;
        }
        Ok(())
    }

    /// Flush and join the worker, write the advisory `.meta.json` sidecar,
    /// and surface any stored worker error.
    pub fn close(mut self) -> Result<()> {
        self.shutdown_worker();

        let meta = RecordingMeta {
            format_version: FORMAT_VERSION,
            created_unix_ms: self.created_unix_ms,
            frames: self.recorded_frames,
            keyframes: self.keyframes,
            dropped_frames: self.dropped_frames,
            entity_index_high_water: self.entity_high_water,
            last_tick: self.last_tick,
        };
        let sidecar = PathBuf::from(format!("{}.meta.json", self.path.display()));
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| FdpError::RecorderError(e.to_string()))?;
        std::fs::write(sidecar, json)?;

        if let Some(err) = self.last_error.lock().take() {
            return Err(FdpError::RecorderError(err));
        }
        Ok(())
    }

    fn shutdown_worker(&mut self) {
        drop(self.job_tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Frames successfully handed to the worker
    pub fn recorded_frames(&self) -> u64 {
        self.recorded_frames
    }

    /// Frames dropped because the worker was busy
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Keyframes among the recorded frames
    pub fn keyframes(&self) -> u64 {
        self.keyframes
    }

    /// Stored worker error, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// True if the next capture will be a keyframe
    pub fn keyframe_pending(&self) -> bool {
        self.force_keyframe_next || self.recorded_frames == 0
    }
}

impl Drop for FlightRecorder {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

fn worker_loop(
    mut file: BufWriter<File>,
    job_rx: Receiver<Job>,
    recycle_tx: Sender<Vec<u8>>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    let mut compressed: Vec<u8> = Vec::new();

    for job in job_rx {
        let result = write_frame(&mut file, &mut compressed, &job);
        if let Err(err) = result {
            warn!(error = %err, "recorder worker failure");
            let mut slot = last_error.lock();
            if slot.is_none() {
                *slot = Some(err.to_string());
            }
        }

        let mut buf = job.buf;
        buf.clear();
        if recycle_tx.send(buf).is_err() {
            break; // Recorder dropped
        }
    }

    if let Err(err) = file.flush() {
        let mut slot = last_error.lock();
        if slot.is_none() {
            *slot = Some(err.to_string());
        }
    }
}

fn write_frame(file: &mut BufWriter<File>, compressed: &mut Vec<u8>, job: &Job) -> Result<()> {
    let max_len = lz4_flex::block::get_maximum_output_size(job.buf.len());
    if compressed.len() < max_len {
        compressed.resize(max_len, 0);
    }
    let comp_len = lz4_flex::block::compress_into(&job.buf, compressed)
        .map_err(|e| FdpError::RecorderError(e.to_string()))?;

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(&(comp_len as u32).to_le_bytes());
    header[4..8].copy_from_slice(&(job.buf.len() as u32).to_le_bytes());
    header[8..16].copy_from_slice(&job.tick.to_le_bytes());
    header[16] = job.kind as u8;

    file.write_all(&header)?;
    file.write_all(&compressed[..comp_len])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Payload serialization
// ---------------------------------------------------------------------------

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn patch_u32(buf: &mut [u8], pos: usize, value: u32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

/// Matched archetype ids in ascending mask order (deterministic streams).
fn recordable_archetypes(repo: &Repository) -> Vec<usize> {
    let mut ids: Vec<(crate::mask::TypeMask, usize)> = repo
        .archetypes()
        .iter()
        .enumerate()
        .map(|(id, archetype)| (archetype.mask(), id))
        .collect();
    ids.sort_by_key(|&(mask, _)| mask);
    ids.into_iter().map(|(_, id)| id).collect()
}

/// Rows of `chunk` whose entity index clears the recording floor.
fn recorded_rows(chunk: &crate::chunk::Chunk, min_id: u32) -> Vec<usize> {
    chunk
        .entities()
        .iter()
        .enumerate()
        .filter(|(_, e)| e.index() >= min_id)
        .map(|(row, _)| row)
        .collect()
}

fn put_filtered_column(
    buf: &mut Vec<u8>,
    chunk: &crate::chunk::Chunk,
    col: usize,
    rows: &[usize],
) {
    let size = chunk.layout().columns[col].size;
    put_u32(buf, (rows.len() * size) as u32);
    if rows.len() == chunk.len() {
        buf.extend_from_slice(chunk.column_bytes(col));
    } else {
        for &row in rows {
            buf.extend_from_slice(chunk.row_bytes(col, row));
        }
    }
}

fn serialize_keyframe(buf: &mut Vec<u8>, repo: &Repository, tick: u64, min_id: u32) {
    put_u64(buf, tick);
    buf.push(FrameKind::Keyframe as u8);

    // Entity records, in the exact traversal order of the chunk data below.
    let entity_count_pos = buf.len();
    put_u32(buf, 0);
    let mut entity_count = 0u32;
    let archetype_order = recordable_archetypes(repo);
    for &arch_id in &archetype_order {
        let archetype = &repo.archetypes()[arch_id];
        let mask_bytes = archetype.mask().to_bytes();
        for chunk in archetype.chunks() {
            for &entity in chunk.entities() {
                if entity.index() < min_id {
                    continue;
                }
                let lifecycle = repo
                    .entity_index()
                    .lifecycle(entity)
                    .unwrap_or(crate::entity::Lifecycle::Active);
                put_u32(buf, entity.index());
                put_u16(buf, entity.generation());
                buf.extend_from_slice(&mask_bytes);
                buf.push(lifecycle as u8);
                entity_count += 1;
            }
        }
    }
    patch_u32(buf, entity_count_pos, entity_count);

    // Per-archetype chunk data: recordable columns of recorded rows.
    let archetype_count_pos = buf.len();
    put_u32(buf, 0);
    let mut archetype_count = 0u32;
    for &arch_id in &archetype_order {
        let archetype = &repo.archetypes()[arch_id];
        let chunk_rows: Vec<Vec<usize>> = archetype
            .chunks()
            .iter()
            .map(|chunk| recorded_rows(chunk, min_id))
            .collect();
        if chunk_rows.iter().all(|rows| rows.is_empty()) {
            continue;
        }
        archetype_count += 1;
        buf.extend_from_slice(&archetype.mask().to_bytes());
        put_u32(buf, archetype.chunks().len() as u32);

        for (chunk, rows) in archetype.chunks().iter().zip(&chunk_rows) {
            put_u32(buf, rows.len() as u32);
            let recordable: Vec<usize> = (0..chunk.layout().columns.len())
                .filter(|&col| chunk.layout().columns[col].policy.contains(DataPolicy::RECORDABLE))
                .collect();
            put_u16(buf, recordable.len() as u16);
            for col in recordable {
                put_u16(buf, chunk.layout().columns[col].type_id.0);
                put_filtered_column(buf, chunk, col, rows);
            }
        }
    }
    patch_u32(buf, archetype_count_pos, archetype_count);
}

fn serialize_delta(
    buf: &mut Vec<u8>,
    repo: &Repository,
    tick: u64,
    min_id: u32,
    prev_version: u64,
) {
    put_u64(buf, tick);
    buf.push(FrameKind::Delta as u8);

    // Destructions since the previous recorded frame.
    let destroyed: Vec<u32> = repo
        .destruction_log()
        .iter()
        .filter(|d| d.index >= min_id)
        .map(|d| d.index)
        .collect();
    put_u32(buf, destroyed.len() as u32);
    for index in destroyed {
        put_u32(buf, index);
    }

    // Columns written after the previous recorded frame.
    let changed_count_pos = buf.len();
    put_u32(buf, 0);
    let mut changed_count = 0u32;
    for &arch_id in &recordable_archetypes(repo) {
        let archetype = &repo.archetypes()[arch_id];
        let mask_bytes = archetype.mask().to_bytes();
        for (chunk_id, chunk) in archetype.chunks().iter().enumerate() {
            if chunk.write_version() <= prev_version || chunk.is_empty() {
                continue;
            }
            let rows = recorded_rows(chunk, min_id);
            if rows.is_empty() {
                continue;
            }
            for col in 0..chunk.layout().columns.len() {
                let column = &chunk.layout().columns[col];
                if !column.policy.contains(DataPolicy::RECORDABLE) {
                    continue;
                }
                if chunk.column_version(col) <= prev_version {
                    continue;
                }
                buf.extend_from_slice(&mask_bytes);
                put_u32(buf, chunk_id as u32);
                put_u16(buf, column.type_id.0);
                put_u32(buf, rows.len() as u32);
                put_filtered_column(buf, chunk, col, &rows);
                changed_count += 1;
            }
        }
    }
    patch_u32(buf, changed_count_pos, changed_count);

    // Reserved event section; this implementation records none.
    put_u32(buf, 0);
}
