//! Playback of recorded frame streams.
//!
//! Opening a recording validates the magic and format version, then scans
//! the length-prefixed frames into an in-memory index for random access.
//! Applying a keyframe replaces repository state for all recordable
//! components; applying a delta overwrites carried columns and processes
//! destruction records. Replayed entities keep their recorded indices; the
//! engine reserves the recorded index range so fresh entities cannot
//! collide.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::component::ComponentTypeId;
use crate::entity::{Entity, Lifecycle};
use crate::error::{FdpError, Result};
use crate::mask::TypeMask;
use crate::recorder::{FrameKind, FILE_HEADER_LEN, FORMAT_VERSION, FRAME_HEADER_LEN, RECORDING_MAGIC};
use crate::repository::Repository;

/// Index entry for one on-disk frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameEntry {
    pub offset: u64,
    pub comp_len: u32,
    pub uncomp_len: u32,
    pub tick: u64,
    pub kind: FrameKind,
}

/// Random-access player over a recorded frame stream.
pub struct Replay {
    file: File,
    index: Vec<FrameEntry>,
    current: Option<usize>,
    comp_buf: Vec<u8>,
    payload_buf: Vec<u8>,
    /// Entities this player created; despawned before each keyframe apply
    materialized: Vec<Entity>,
}

impl Replay {
    /// Open a recording, validating its header and indexing every frame.
    pub fn open(path: impl AsRef<Path>) -> Result<Replay> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut header = [0u8; FILE_HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|_| FdpError::FormatError("truncated file header".into()))?;
        if &header[0..6] != RECORDING_MAGIC {
            return Err(FdpError::FormatError("bad magic".into()));
        }
        let version = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
        if version != FORMAT_VERSION {
            return Err(FdpError::FormatError(format!(
                "format version {version} unsupported (expected {FORMAT_VERSION})"
            )));
        }

        let mut index = Vec::new();
        let mut offset = FILE_HEADER_LEN as u64;
        let mut frame_header = [0u8; FRAME_HEADER_LEN];
        while offset + FRAME_HEADER_LEN as u64 <= file_len {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut frame_header)?;
            let comp_len = u32::from_le_bytes(frame_header[0..4].try_into().expect("4 bytes"));
            let uncomp_len = u32::from_le_bytes(frame_header[4..8].try_into().expect("4 bytes"));
            let tick = u64::from_le_bytes(frame_header[8..16].try_into().expect("8 bytes"));
            let kind = FrameKind::from_u8(frame_header[16])
                .ok_or_else(|| FdpError::FormatError("unknown frame kind".into()))?;

            let end = offset + FRAME_HEADER_LEN as u64 + comp_len as u64;
            if end > file_len {
                return Err(FdpError::FormatError("truncated frame payload".into()));
            }
            index.push(FrameEntry {
                offset,
                comp_len,
                uncomp_len,
                tick,
                kind,
            });
            offset = end;
        }

        Ok(Replay {
            file,
            index,
            current: None,
            comp_buf: Vec::new(),
            payload_buf: Vec::new(),
            materialized: Vec::new(),
        })
    }

    /// Number of frames in the recording
    pub fn total_frames(&self) -> usize {
        self.index.len()
    }

    /// Frame most recently applied, if any
    pub fn current_frame(&self) -> Option<usize> {
        self.current
    }

    /// True once the last frame has been applied
    pub fn is_at_end(&self) -> bool {
        match self.current {
            Some(current) => current + 1 >= self.index.len(),
            None => self.index.is_empty(),
        }
    }

    /// Index entry for frame `n`
    pub fn frame(&self, n: usize) -> Option<&FrameEntry> {
        self.index.get(n)
    }

    /// Apply the next frame. Returns false at the end of the stream.
    pub fn step_forward(&mut self, repo: &mut Repository) -> Result<bool> {
        let next = match self.current {
            None => 0,
            Some(current) => current + 1,
        };
        if next >= self.index.len() {
            return Ok(false);
        }

        if self.current.is_none() && self.index[next].kind == FrameKind::Delta {
            // No base state yet; rebuild from the nearest keyframe.
            self.seek_to_frame(repo, next)?;
            return Ok(true);
        }

        self.apply_frame(repo, next)?;
        self.current = Some(next);
        Ok(true)
    }

    /// Rewind one frame by re-applying from the previous keyframe.
    /// Returns false when already at (or before) the first frame.
    pub fn step_backward(&mut self, repo: &mut Repository) -> Result<bool> {
        match self.current {
            None | Some(0) => Ok(false),
            Some(current) => {
                self.seek_to_frame(repo, current - 1)?;
                Ok(true)
            }
        }
    }

    /// Jump to frame `n`: apply the nearest keyframe at or before `n`, then
    /// every delta up to `n`. Seeking to the same frame twice is idempotent.
    pub fn seek_to_frame(&mut self, repo: &mut Repository, n: usize) -> Result<()> {
        if n >= self.index.len() {
            return Err(FdpError::ReplayError(format!(
                "frame {n} out of range ({} frames)",
                self.index.len()
            )));
        }
        let keyframe = (0..=n)
            .rev()
            .find(|&i| self.index[i].kind == FrameKind::Keyframe)
            .ok_or_else(|| FdpError::ReplayError(format!("no keyframe at or before frame {n}")))?;

        for i in keyframe..=n {
            self.apply_frame(repo, i)?;
        }
        self.current = Some(n);
        Ok(())
    }

    /// Jump to the smallest frame whose tick is >= `tick` (the last frame
    /// when every tick is smaller).
    pub fn seek_to_tick(&mut self, repo: &mut Repository, tick: u64) -> Result<()> {
        if self.index.is_empty() {
            return Err(FdpError::ReplayError("empty recording".into()));
        }
        let n = self
            .index
            .iter()
            .position(|frame| frame.tick >= tick)
            .unwrap_or(self.index.len() - 1);
        self.seek_to_frame(repo, n)
    }

    /// Apply every remaining frame in order.
    pub fn play_to_end(&mut self, repo: &mut Repository) -> Result<()> {
        while self.step_forward(repo)? {}
        Ok(())
    }

    fn apply_frame(&mut self, repo: &mut Repository, n: usize) -> Result<()> {
        let entry = self.index[n];
        self.file
            .seek(SeekFrom::Start(entry.offset + FRAME_HEADER_LEN as u64))?;
        self.comp_buf.resize(entry.comp_len as usize, 0);
        self.file.read_exact(&mut self.comp_buf)?;

        self.payload_buf.resize(entry.uncomp_len as usize, 0);
        let written = lz4_flex::block::decompress_into(&self.comp_buf, &mut self.payload_buf)
            .map_err(|e| FdpError::FormatError(format!("lz4: {e}")))?;
        if written != entry.uncomp_len as usize {
            return Err(FdpError::FormatError("payload length mismatch".into()));
        }

        let payload = std::mem::take(&mut self.payload_buf);
        let result = self.apply_payload(repo, &entry, &payload);
        self.payload_buf = payload;
        result
    }

    fn apply_payload(
        &mut self,
        repo: &mut Repository,
        entry: &FrameEntry,
        payload: &[u8],
    ) -> Result<()> {
        let mut reader = Reader::new(payload);
        let tick = reader.read_u64()?;
        let kind = FrameKind::from_u8(reader.read_u8()?)
            .ok_or_else(|| FdpError::FormatError("unknown payload kind".into()))?;
        if tick != entry.tick || kind != entry.kind {
            return Err(FdpError::FormatError(
                "payload header disagrees with frame header".into(),
            ));
        }

        // Replayed state is stamped with the recorded tick.
        repo.set_global_version(tick);
        match kind {
            FrameKind::Keyframe => self.apply_keyframe(repo, &mut reader, tick),
            FrameKind::Delta => self.apply_delta(repo, &mut reader, tick),
        }
    }

    fn apply_keyframe(
        &mut self,
        repo: &mut Repository,
        reader: &mut Reader<'_>,
        tick: u64,
    ) -> Result<()> {
        // A keyframe replaces everything this player materialized earlier.
        for entity in self.materialized.drain(..) {
            if repo.is_alive(entity) {
                repo.destroy_entity(entity)?;
            }
        }

        struct EntityRecord {
            index: u32,
            generation: u16,
            mask: TypeMask,
            lifecycle: Lifecycle,
        }

        let entity_count = reader.read_u32()? as usize;
        let mut records = Vec::with_capacity(entity_count);
        let mut max_index = 0u32;
        for _ in 0..entity_count {
            let index = reader.read_u32()?;
            let generation = reader.read_u16()?;
            let mask = TypeMask::from_bytes(reader.read_array::<32>()?);
            let lifecycle = Lifecycle::from_u8(reader.read_u8()?)
                .ok_or_else(|| FdpError::FormatError("bad lifecycle".into()))?;
            max_index = max_index.max(index);
            records.push(EntityRecord {
                index,
                generation,
                mask,
                lifecycle,
            });
        }
        if entity_count > 0 {
            repo.reserve_id_range(max_index + 1);
        }

        let mut record_iter = records.into_iter();
        let archetype_count = reader.read_u32()?;
        for _ in 0..archetype_count {
            let mask = TypeMask::from_bytes(reader.read_array::<32>()?);
            let chunk_count = reader.read_u32()?;
            for _ in 0..chunk_count {
                let row_count = reader.read_u32()?;
                let arch_id = repo.replay_begin_chunk(mask)?;
                let chunk_index = repo.archetypes()[arch_id].chunks().len() - 1;

                for _ in 0..row_count {
                    let record = record_iter
                        .next()
                        .ok_or_else(|| FdpError::FormatError("entity records exhausted".into()))?;
                    if record.mask != mask {
                        return Err(FdpError::FormatError(
                            "entity record archetype disagrees with chunk data".into(),
                        ));
                    }
                    let entity = repo.replay_spawn(
                        record.index,
                        record.generation,
                        mask,
                        record.lifecycle,
                    )?;
                    self.materialized.push(entity);
                }

                let column_count = reader.read_u16()?;
                for _ in 0..column_count {
                    let type_id = ComponentTypeId(reader.read_u16()?);
                    let byte_len = reader.read_u32()? as usize;
                    let bytes = reader.read_bytes(byte_len)?;
                    repo.replay_write_column(arch_id, chunk_index, type_id, bytes, tick)?;
                }
            }
        }
        Ok(())
    }

    fn apply_delta(
        &mut self,
        repo: &mut Repository,
        reader: &mut Reader<'_>,
        tick: u64,
    ) -> Result<()> {
        let destroyed_count = reader.read_u32()?;
        for _ in 0..destroyed_count {
            let index = reader.read_u32()?;
            // Mirror the recording side's swap-remove so chunk layouts stay
            // aligned with later delta frames.
            if let Some(entity) = repo.entity_index().entity_at(index) {
                repo.destroy_entity(entity)?;
            }
        }

        let changed_count = reader.read_u32()?;
        for _ in 0..changed_count {
            let mask = TypeMask::from_bytes(reader.read_array::<32>()?);
            let chunk_id = reader.read_u32()? as usize;
            let type_id = ComponentTypeId(reader.read_u16()?);
            let _row_count = reader.read_u32()?;
            let byte_len = reader.read_u32()? as usize;
            let bytes = reader.read_bytes(byte_len)?;

            let arch_id = repo.get_or_create_archetype(mask)?;
            repo.replay_write_column(arch_id, chunk_id, type_id, bytes, tick)?;
        }

        // Optional trailing event section; events are not replayed.
        if !reader.at_end() {
            let _event_count = reader.read_u32()?;
        }
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    fn read_array<const N: usize>(&mut self) -> Result<&'a [u8; N]> {
        let bytes = self.read_bytes(N)?;
        Ok(bytes.try_into().expect("exact length"))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(FdpError::FormatError("truncated frame payload".into()));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}
