// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deferred structural edits.
//!
//! Operations append to a per-buffer byte log with an operation header;
//! managed values and events ride in a side table of boxed apply thunks
//! referenced by slot from the log, so playback preserves total order.
//! Entities created inside a buffer are placeholder tokens resolved to real
//! handles at playback. Operations on entities that died before playback
//! are dropped with a diagnostic; destroying twice is a no-op.

use tracing::debug;

use crate::component::{ManagedComponent, UnmanagedComponent};
use crate::entity::{Entity, Lifecycle};
use crate::error::{FdpError, Result};
use crate::event::Event;
use crate::repository::Repository;

/// High bit marks a placeholder token in the entity field of an op header.
const PENDING_FLAG: u64 = 1 << 63;

/// Recorded operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum OpCode {
    Create = 0,
    Destroy = 1,
    Add = 2,
    Set = 3,
    Remove = 4,
    SetManaged = 5,
    RemoveManaged = 6,
    PublishEvent = 7,
    SetLifecycle = 8,
}

impl OpCode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Create),
            1 => Some(Self::Destroy),
            2 => Some(Self::Add),
            3 => Some(Self::Set),
            4 => Some(Self::Remove),
            5 => Some(Self::SetManaged),
            6 => Some(Self::RemoveManaged),
            7 => Some(Self::PublishEvent),
            8 => Some(Self::SetLifecycle),
            _ => None,
        }
    }
}

/// Placeholder handle for an entity created inside a command buffer.
///
/// Resolves to a real handle when the buffer plays back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntity(u32);

/// Target of a deferred operation: a real handle or an in-buffer placeholder.
#[derive(Debug, Clone, Copy)]
pub struct EntityTarget(u64);

impl From<Entity> for EntityTarget {
    fn from(entity: Entity) -> Self {
        EntityTarget(((entity.generation() as u64) << 32) | entity.index() as u64)
    }
}

impl From<PendingEntity> for EntityTarget {
    fn from(pending: PendingEntity) -> Self {
        EntityTarget(PENDING_FLAG | pending.0 as u64)
    }
}

type ApplyThunk = Box<dyn FnOnce(&mut Repository, Entity) -> Result<()> + Send>;

/// Command buffer for deferred structural edits, replayed in recorded order.
#[derive(Default)]
pub struct CommandBuffer {
    log: Vec<u8>,
    thunks: Vec<Option<ApplyThunk>>,
    types: Vec<(std::any::TypeId, &'static str)>,
    pending_count: u32,
    op_count: usize,
}

impl CommandBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a preallocated byte log
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            log: Vec::with_capacity(bytes),
            ..Self::default()
        }
    }

    /// Queue entity creation; the placeholder resolves at playback.
    pub fn create_entity(&mut self) -> PendingEntity {
        let pending = PendingEntity(self.pending_count);
        self.pending_count += 1;
        self.push_header(OpCode::Create);
        pending
    }

    /// Queue entity destruction. Destroying an already-dead entity is a
    /// no-op at playback.
    pub fn destroy_entity(&mut self, target: impl Into<EntityTarget>) {
        self.push_header(OpCode::Destroy);
        self.push_u64(target.into().0);
    }

    /// Queue a component add (overwrite when already present).
    pub fn add_component<T: UnmanagedComponent>(
        &mut self,
        target: impl Into<EntityTarget>,
        value: T,
    ) {
        self.push_component_op(OpCode::Add, target.into(), value);
    }

    /// Queue an unconditional component overwrite.
    pub fn set_component<T: UnmanagedComponent>(
        &mut self,
        target: impl Into<EntityTarget>,
        value: T,
    ) {
        self.push_component_op(OpCode::Set, target.into(), value);
    }

    /// Queue a component removal.
    pub fn remove_component<T: UnmanagedComponent>(&mut self, target: impl Into<EntityTarget>) {
        let slot = self.push_type::<T>();
        self.push_header(OpCode::Remove);
        self.push_u64(target.into().0);
        self.push_u16(slot);
    }

    /// Queue a managed component overwrite.
    pub fn set_managed<T: ManagedComponent>(&mut self, target: impl Into<EntityTarget>, value: T) {
        let slot = self.push_thunk(Box::new(move |repo, entity| repo.set_managed(entity, value)));
        self.push_header(OpCode::SetManaged);
        self.push_u64(target.into().0);
        self.push_u32(slot);
    }

    /// Queue a managed component removal.
    pub fn remove_managed<T: ManagedComponent>(&mut self, target: impl Into<EntityTarget>) {
        let slot = self.push_thunk(Box::new(move |repo, entity| {
            repo.remove_managed::<T>(entity).map(|_| ())
        }));
        self.push_header(OpCode::RemoveManaged);
        self.push_u64(target.into().0);
        self.push_u32(slot);
    }

    /// Queue an event publish (lands in the bus at playback).
    pub fn publish_event<E: Event>(&mut self, event: E) {
        let slot = self.push_thunk(Box::new(move |repo, _| {
            repo.events_mut().publish(event);
            Ok(())
        }));
        self.push_header(OpCode::PublishEvent);
        self.push_u32(slot);
    }

    /// Queue a lifecycle change.
    pub fn set_lifecycle(&mut self, target: impl Into<EntityTarget>, state: Lifecycle) {
        self.push_header(OpCode::SetLifecycle);
        self.push_u64(target.into().0);
        self.log.push(state as u8);
    }

    /// Apply all recorded operations in order and clear the buffer.
    ///
    /// Not interleaved with other writers; the caller holds the repository
    /// exclusively for the duration.
    pub fn playback(&mut self, repo: &mut Repository) -> Result<()> {
        let log = std::mem::take(&mut self.log);
        let mut thunks = std::mem::take(&mut self.thunks);
        let types = std::mem::take(&mut self.types);
        self.pending_count = 0;
        self.op_count = 0;

        let mut created: Vec<Entity> = Vec::new();
        let mut cursor = Cursor::new(&log);

        while !cursor.at_end() {
            let opcode = OpCode::from_u8(cursor.read_u8()?)
                .ok_or_else(|| FdpError::CommandError("unknown opcode".into()))?;
            match opcode {
                OpCode::Create => {
                    created.push(repo.create_entity()?);
                }
                OpCode::Destroy => {
                    let token = cursor.read_u64()?;
                    if let Some(entity) = resolve(token, &created) {
                        if repo.is_alive(entity) {
                            repo.destroy_entity(entity)?;
                        }
                    }
                }
                OpCode::Add | OpCode::Set => {
                    let token = cursor.read_u64()?;
                    let slot = cursor.read_u16()? as usize;
                    let len = cursor.read_u32()? as usize;
                    let bytes = cursor.read_bytes(len)?;
                    let (rust_id, name) = types[slot];
                    match live_target(repo, token, &created) {
                        Some(entity) => {
                            let type_id = repo
                                .registry()
                                .id_of_rust_type(rust_id)
                                .ok_or(FdpError::TypeNotRegistered(name))?;
                            repo.set_component_raw(entity, type_id, bytes)?;
                        }
                        None => debug!(component = name, "dropped set on dead entity"),
                    }
                }
                OpCode::Remove => {
                    let token = cursor.read_u64()?;
                    let slot = cursor.read_u16()? as usize;
                    let (rust_id, name) = types[slot];
                    match live_target(repo, token, &created) {
                        Some(entity) => {
                            let type_id = repo
                                .registry()
                                .id_of_rust_type(rust_id)
                                .ok_or(FdpError::TypeNotRegistered(name))?;
                            match repo.remove_component_raw(entity, type_id) {
                                Err(FdpError::ComponentNotFound) => {
                                    debug!(component = name, "dropped remove of absent component");
                                }
                                other => other?,
                            }
                        }
                        None => debug!(component = name, "dropped remove on dead entity"),
                    }
                }
                OpCode::SetManaged | OpCode::RemoveManaged => {
                    let token = cursor.read_u64()?;
                    let slot = cursor.read_u32()? as usize;
                    let thunk = thunks
                        .get_mut(slot)
                        .and_then(|t| t.take())
                        .ok_or_else(|| FdpError::CommandError("missing thunk slot".into()))?;
                    match live_target(repo, token, &created) {
                        Some(entity) => thunk(repo, entity)?,
                        None => debug!("dropped managed op on dead entity"),
                    }
                }
                OpCode::PublishEvent => {
                    let slot = cursor.read_u32()? as usize;
                    let thunk = thunks
                        .get_mut(slot)
                        .and_then(|t| t.take())
                        .ok_or_else(|| FdpError::CommandError("missing thunk slot".into()))?;
                    thunk(repo, Entity::NULL)?;
                }
                OpCode::SetLifecycle => {
                    let token = cursor.read_u64()?;
                    let state = Lifecycle::from_u8(cursor.read_u8()?)
                        .ok_or_else(|| FdpError::CommandError("bad lifecycle state".into()))?;
                    match live_target(repo, token, &created) {
                        Some(entity) => repo.set_lifecycle(entity, state)?,
                        None => debug!("dropped lifecycle change on dead entity"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.op_count == 0
    }

    /// Number of recorded operations
    pub fn len(&self) -> usize {
        self.op_count
    }

    /// Discard all recorded operations.
    pub fn clear(&mut self) {
        self.log.clear();
        self.thunks.clear();
        self.types.clear();
        self.pending_count = 0;
        self.op_count = 0;
    }

    fn push_component_op<T: UnmanagedComponent>(
        &mut self,
        opcode: OpCode,
        target: EntityTarget,
        value: T,
    ) {
        let slot = self.push_type::<T>();
        self.push_header(opcode);
        self.push_u64(target.0);
        self.push_u16(slot);
        let size = std::mem::size_of::<T>();
        self.push_u32(size as u32);
        // SAFETY: T is Copy plain data; its object representation is size
        // bytes starting at &value.
        let bytes = unsafe { std::slice::from_raw_parts(&value as *const T as *const u8, size) };
        self.log.extend_from_slice(bytes);
    }

    fn push_type<T: 'static>(&mut self) -> u16 {
        let entry = (std::any::TypeId::of::<T>(), std::any::type_name::<T>());
        if let Some(slot) = self.types.iter().position(|&t| t == entry) {
            return slot as u16;
        }
        self.types.push(entry);
        (self.types.len() - 1) as u16
    }

    fn push_thunk(&mut self, thunk: ApplyThunk) -> u32 {
        self.thunks.push(Some(thunk));
        (self.thunks.len() - 1) as u32
    }

    fn push_header(&mut self, opcode: OpCode) {
        self.log.push(opcode as u8);
        self.op_count += 1;
    }

    fn push_u16(&mut self, value: u16) {
        self.log.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u32(&mut self, value: u32) {
        self.log.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u64(&mut self, value: u64) {
        self.log.extend_from_slice(&value.to_le_bytes());
    }
}

fn resolve(token: u64, created: &[Entity]) -> Option<Entity> {
    if token & PENDING_FLAG != 0 {
        created.get((token & u32::MAX as u64) as usize).copied()
    } else {
        Some(Entity::from_parts(token as u32, (token >> 32) as u16))
    }
}

fn live_target(repo: &Repository, token: u64, created: &[Entity]) -> Option<Entity> {
    resolve(token, created).filter(|&entity| repo.is_alive(entity))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
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

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(FdpError::CommandError("truncated op log".into()));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}
