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

//! Repository: central entity, component and archetype storage.
//!
//! The repository owns the type registry, entity index, chunk allocator,
//! archetype table, managed store, event bus and the monotonically
//! increasing global version. Exactly one thread advances the version;
//! external writers enqueue structural edits into a command buffer.

use std::any::{Any, TypeId};
use std::sync::Arc;

use ahash::AHashMap;

use crate::archetype::Archetype;
use crate::chunk::{copy_row_intersection, Chunk, ChunkAllocator, ChunkLayout};
use crate::component::{
    ComponentDescriptor, ComponentKind, ComponentTypeId, DataPolicy, ManagedComponent,
    TypeRegistry, UnmanagedComponent,
};
use crate::entity::{Entity, EntityIndex, Lifecycle};
use crate::error::{FdpError, Result};
use crate::event::EventBus;
use crate::managed::ManagedStore;
use crate::mask::TypeMask;
use crate::query::QueryBuilder;
use crate::time::GlobalTime;

/// Entry in the destruction log consumed by the flight recorder.
#[derive(Debug, Clone, Copy)]
pub struct DestroyedEntity {
    pub index: u32,
    pub version: u64,
}

/// Central ECS repository
pub struct Repository {
    registry: TypeRegistry,
    entities: EntityIndex,
    allocator: ChunkAllocator,

    /// All archetypes, creation order; index 0 is the empty archetype
    archetypes: Vec<Archetype>,

    /// Maps component masks to archetype indices
    archetype_index: AHashMap<TypeMask, usize>,

    managed: ManagedStore,
    events: EventBus,

    /// Typed singletons (global time peers, registries, collaborator state)
    resources: AHashMap<TypeId, Box<dyn Any + Send + Sync>>,

    /// Monotonic tick counter; starts at 1 so version-0 chunk stamps always
    /// read as untouched
    global_version: u64,
    time: GlobalTime,

    /// Entities destroyed since the last recorder capture
    destruction_log: Vec<DestroyedEntity>,
}

impl Repository {
    /// Create a new, empty repository.
    pub fn new() -> Self {
        let mut repo = Self {
            registry: TypeRegistry::new(),
            entities: EntityIndex::new(),
            allocator: ChunkAllocator::new(),
            archetypes: Vec::with_capacity(64),
            archetype_index: AHashMap::with_capacity(64),
            managed: ManagedStore::new(),
            events: EventBus::new(),
            resources: AHashMap::new(),
            global_version: 1,
            time: GlobalTime::new(),
            destruction_log: Vec::new(),
        };

        // Bootstrap the empty archetype (entities with no unmanaged
        // components); always index 0.
        repo.get_or_create_archetype(TypeMask::EMPTY)
            .expect("empty archetype layout");
        repo
    }

    // ========== Registration ==========

    /// Register an unmanaged component type; must precede any use.
    pub fn register_unmanaged<T: UnmanagedComponent>(
        &mut self,
        policy: DataPolicy,
    ) -> Result<ComponentTypeId> {
        self.registry.register_unmanaged::<T>(policy)
    }

    /// Register a managed component type; must precede any use.
    pub fn register_managed<T: ManagedComponent>(
        &mut self,
        policy: DataPolicy,
    ) -> Result<ComponentTypeId> {
        self.registry.register_managed::<T>(policy)
    }

    /// The component type registry
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    // ========== Entity lifecycle ==========

    /// Create a live entity with no components.
    pub fn create_entity(&mut self) -> Result<Entity> {
        let entity = self.entities.allocate();
        let version = self.global_version;
        let location =
            match self.archetypes[0].push_entity(&mut self.allocator, 0, entity, version) {
                Ok(location) => location,
                Err(err) => {
                    self.entities.free(entity);
                    return Err(err);
                }
            };
        self.entities.set_location(entity.index(), location);
        self.entities.set_mask(entity.index(), TypeMask::EMPTY);
        Ok(entity)
    }

    /// Destroy a live entity; destroying a dead or stale handle is an error.
    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        let location = self
            .entities
            .location(entity)
            .ok_or(FdpError::EntityNotFound)?;
        let version = self.global_version;

        let archetype = &mut self.archetypes[location.archetype_id as usize];
        if let Some((moved, moved_loc)) =
            archetype.swap_remove(&mut self.allocator, location, version)
        {
            self.entities.set_location(moved.index(), moved_loc);
        }

        self.managed.clear_entity(entity.index() as usize);
        self.entities.free(entity);
        self.destruction_log.push(DestroyedEntity {
            index: entity.index(),
            version,
        });
        Ok(())
    }

    /// True if the handle refers to a live entity of matching generation.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Lifecycle state of a live entity
    pub fn lifecycle(&self, entity: Entity) -> Option<Lifecycle> {
        self.entities.lifecycle(entity)
    }

    /// Set the lifecycle state of a live entity.
    pub fn set_lifecycle(&mut self, entity: Entity, state: Lifecycle) -> Result<()> {
        if self.entities.set_lifecycle(entity, state) {
            Ok(())
        } else {
            Err(FdpError::EntityNotFound)
        }
    }

    /// Force the next fresh entity index to be at least `n` (replay guard).
    pub fn reserve_id_range(&mut self, n: u32) {
        self.entities.reserve_range(n);
    }

    /// Number of live entities
    pub fn entity_count(&self) -> usize {
        self.entities.alive_count()
    }

    // ========== Unmanaged components ==========

    /// Add a component, relocating the entity to the wider archetype.
    /// Adding an already-present component overwrites its value in place.
    pub fn add_component<T: UnmanagedComponent>(&mut self, entity: Entity, value: T) -> Result<()> {
        let type_id = self.registry.expect_unmanaged::<T>()?;
        let bit = type_id.mask_bit();
        let mask = self.entities.mask(entity).ok_or(FdpError::EntityNotFound)?;
        let version = self.global_version;

        if mask.contains(bit) {
            let location = self
                .entities
                .location(entity)
                .ok_or(FdpError::EntityNotFound)?;
            let archetype = &mut self.archetypes[location.archetype_id as usize];
            let col = archetype
                .column_index(type_id)
                .ok_or(FdpError::TypeMismatch)?;
            let chunk = archetype
                .chunk_mut(location.chunk_index as usize)
                .ok_or(FdpError::TypeMismatch)?;
            chunk.write_value(col, location.row as usize, value, version);
            return Ok(());
        }

        self.move_entity(entity, mask.with(bit), move |chunk, row| {
            if let Some(col) = chunk.layout().column_index(type_id) {
                chunk.write_value(col, row, value, version);
            }
        })
    }

    /// Set a component value: unconditional overwrite, adding it if absent.
    pub fn set_component<T: UnmanagedComponent>(&mut self, entity: Entity, value: T) -> Result<()> {
        self.add_component(entity, value)
    }

    /// Remove a component, relocating the entity to the narrower archetype.
    pub fn remove_component<T: UnmanagedComponent>(&mut self, entity: Entity) -> Result<()> {
        let type_id = self.registry.expect_unmanaged::<T>()?;
        let bit = type_id.mask_bit();
        let mask = self.entities.mask(entity).ok_or(FdpError::EntityNotFound)?;
        if !mask.contains(bit) {
            return Err(FdpError::ComponentNotFound);
        }
        self.move_entity(entity, mask.without(bit), |_, _| {})
    }

    /// Check if the entity currently has component `T`
    pub fn has_component<T: UnmanagedComponent>(&self, entity: Entity) -> bool {
        match self.registry.id_of::<T>() {
            Some(id) if id.is_unmanaged() => self
                .entities
                .mask(entity)
                .is_some_and(|mask| mask.contains(id.mask_bit())),
            _ => false,
        }
    }

    /// Read-only component access
    pub fn get_component<T: UnmanagedComponent>(&self, entity: Entity) -> Option<&T> {
        let type_id = self.registry.id_of::<T>()?;
        if !type_id.is_unmanaged() {
            return None;
        }
        let location = self.entities.location(entity)?;
        let archetype = self.archetypes.get(location.archetype_id as usize)?;
        let col = archetype.column_index(type_id)?;
        let chunk = archetype.chunk(location.chunk_index as usize)?;
        Some(chunk.value::<T>(col, location.row as usize))
    }

    /// Read-write component access; stamps the column and chunk versions.
    pub fn get_component_mut<T: UnmanagedComponent>(&mut self, entity: Entity) -> Option<&mut T> {
        let type_id = self.registry.id_of::<T>()?;
        if !type_id.is_unmanaged() {
            return None;
        }
        let version = self.global_version;
        let location = self.entities.location(entity)?;
        let archetype = self.archetypes.get_mut(location.archetype_id as usize)?;
        let col = archetype.column_index(type_id)?;
        let chunk = archetype.chunk_mut(location.chunk_index as usize)?;
        chunk.mark_column_written(col, version);
        Some(&mut chunk.column_slice_mut::<T>(col)[location.row as usize])
    }

    /// Dynamic component write from raw bytes (command replay, playback).
    ///
    /// Adds the component when absent. `bytes` must match the registered
    /// size exactly.
    pub(crate) fn set_component_raw(
        &mut self,
        entity: Entity,
        type_id: ComponentTypeId,
        bytes: &[u8],
    ) -> Result<()> {
        let desc = self
            .registry
            .lookup(type_id)
            .ok_or(FdpError::TypeNotRegistered("unknown type id"))?;
        if desc.kind != ComponentKind::Unmanaged {
            return Err(FdpError::TypeMismatch);
        }
        if bytes.len() != desc.size as usize {
            return Err(FdpError::TypeMismatch);
        }
        let bit = type_id.mask_bit();
        let mask = self.entities.mask(entity).ok_or(FdpError::EntityNotFound)?;
        let version = self.global_version;

        if mask.contains(bit) {
            let location = self
                .entities
                .location(entity)
                .ok_or(FdpError::EntityNotFound)?;
            let archetype = &mut self.archetypes[location.archetype_id as usize];
            let col = archetype
                .column_index(type_id)
                .ok_or(FdpError::TypeMismatch)?;
            let chunk = archetype
                .chunk_mut(location.chunk_index as usize)
                .ok_or(FdpError::TypeMismatch)?;
            chunk.write_row_bytes(col, location.row as usize, bytes, version);
            return Ok(());
        }

        self.move_entity(entity, mask.with(bit), move |chunk, row| {
            if let Some(col) = chunk.layout().column_index(type_id) {
                chunk.write_row_bytes(col, row, bytes, version);
            }
        })
    }

    /// Dynamic component removal by numeric id (command replay path).
    pub(crate) fn remove_component_raw(
        &mut self,
        entity: Entity,
        type_id: ComponentTypeId,
    ) -> Result<()> {
        if !type_id.is_unmanaged() {
            return Err(FdpError::TypeMismatch);
        }
        let bit = type_id.mask_bit();
        let mask = self.entities.mask(entity).ok_or(FdpError::EntityNotFound)?;
        if !mask.contains(bit) {
            return Err(FdpError::ComponentNotFound);
        }
        self.move_entity(entity, mask.without(bit), |_, _| {})
    }

    // ========== Managed components ==========

    /// Overwrite the managed component for the entity.
    pub fn set_managed<T: ManagedComponent>(&mut self, entity: Entity, value: T) -> Result<()> {
        let type_id = self.registry.expect_managed::<T>()?;
        if !self.entities.is_alive(entity) {
            return Err(FdpError::EntityNotFound);
        }
        self.managed.set(type_id, entity.index() as usize, value);
        Ok(())
    }

    /// Shared borrow of the managed component
    pub fn get_managed<T: ManagedComponent>(&self, entity: Entity) -> Option<&T> {
        let type_id = self.registry.id_of::<T>()?;
        if type_id.is_unmanaged() || !self.entities.is_alive(entity) {
            return None;
        }
        self.managed.get::<T>(type_id, entity.index() as usize)
    }

    /// Exclusive borrow of the managed component
    pub fn get_managed_mut<T: ManagedComponent>(&mut self, entity: Entity) -> Option<&mut T> {
        let type_id = self.registry.id_of::<T>()?;
        if type_id.is_unmanaged() || !self.entities.is_alive(entity) {
            return None;
        }
        self.managed.get_mut::<T>(type_id, entity.index() as usize)
    }

    /// Drop the managed component; Ok(false) when none was present.
    pub fn remove_managed<T: ManagedComponent>(&mut self, entity: Entity) -> Result<bool> {
        let type_id = self.registry.expect_managed::<T>()?;
        if !self.entities.is_alive(entity) {
            return Err(FdpError::EntityNotFound);
        }
        Ok(self.managed.remove(type_id, entity.index() as usize))
    }

    /// Check managed component presence
    pub fn has_managed<T: ManagedComponent>(&self, entity: Entity) -> bool {
        match self.registry.id_of::<T>() {
            Some(id) if !id.is_unmanaged() => {
                self.entities.is_alive(entity) && self.managed.has(id, entity.index() as usize)
            }
            _ => false,
        }
    }

    // ========== Queries ==========

    /// Start building an archetype-filtered query.
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    // ========== Events ==========

    /// The event bus, read side
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The event bus, publish side
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    // ========== Singletons ==========

    /// Insert or replace a typed singleton.
    pub fn set_singleton<R: Send + Sync + 'static>(&mut self, value: R) {
        self.resources.insert(TypeId::of::<R>(), Box::new(value));
    }

    /// Shared borrow of a typed singleton
    pub fn get_singleton<R: 'static>(&self) -> Option<&R> {
        self.resources
            .get(&TypeId::of::<R>())
            .and_then(|r| r.downcast_ref())
    }

    /// Exclusive borrow of a typed singleton
    pub fn get_singleton_mut<R: 'static>(&mut self) -> Option<&mut R> {
        self.resources
            .get_mut(&TypeId::of::<R>())
            .and_then(|r| r.downcast_mut())
    }

    /// Remove a typed singleton and return it
    pub fn remove_singleton<R: 'static>(&mut self) -> Option<R> {
        self.resources
            .remove(&TypeId::of::<R>())
            .and_then(|r| r.downcast().ok())
            .map(|boxed| *boxed)
    }

    // ========== Tick & versioning ==========

    /// Systemless tick: advance the version, swap event buffers, prune.
    ///
    /// Scheduler-driven repositories use `Scheduler::tick`, which interleaves
    /// phase execution into the same sequence.
    pub fn tick(&mut self, dt: f32) {
        self.advance_frame(dt);
        self.events.swap_buffers();
        self.prune();
    }

    /// Advance the global version by exactly one and update time.
    pub fn advance_frame(&mut self, dt: f32) {
        self.global_version += 1;
        self.time.advance(dt, self.global_version);
    }

    /// Swap event buffers (scheduler hook; end of PostSimulation).
    pub fn swap_event_buffers(&mut self) {
        self.events.swap_buffers();
    }

    /// Retire empty chunks back to the allocator.
    pub fn prune(&mut self) {
        for archetype in &mut self.archetypes {
            archetype.prune_empty_chunks(&mut self.allocator);
        }
    }

    /// Current global version (tick counter)
    pub fn global_version(&self) -> u64 {
        self.global_version
    }

    pub(crate) fn set_global_version(&mut self, version: u64) {
        self.global_version = version;
    }

    /// Global simulation time
    pub fn time(&self) -> &GlobalTime {
        &self.time
    }

    // ========== Archetype access ==========

    /// All archetypes, creation order
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    /// Archetype by index
    pub fn archetype(&self, id: usize) -> Option<&Archetype> {
        self.archetypes.get(id)
    }

    /// Number of archetypes (the empty archetype included)
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Split borrow for query iteration: registry read + chunk writes.
    pub(crate) fn query_parts_mut(&mut self) -> (&TypeRegistry, &mut [Archetype], u64) {
        (&self.registry, &mut self.archetypes, self.global_version)
    }

    pub(crate) fn entity_index(&self) -> &EntityIndex {
        &self.entities
    }

    pub(crate) fn managed_store(&self) -> &ManagedStore {
        &self.managed
    }

    pub(crate) fn drain_destruction_log(&mut self) -> Vec<DestroyedEntity> {
        std::mem::take(&mut self.destruction_log)
    }

    pub(crate) fn destruction_log(&self) -> &[DestroyedEntity] {
        &self.destruction_log
    }

    /// Get or create the archetype for `mask`; creation is idempotent.
    pub(crate) fn get_or_create_archetype(&mut self, mask: TypeMask) -> Result<usize> {
        if let Some(&id) = self.archetype_index.get(&mask) {
            return Ok(id);
        }

        let mut descriptors: Vec<&ComponentDescriptor> = Vec::with_capacity(mask.count_ones());
        for bit in mask.ones() {
            let descriptor = self
                .registry
                .lookup(ComponentTypeId(bit as u16))
                .ok_or(FdpError::TypeNotRegistered("unknown mask bit"))?;
            descriptors.push(descriptor);
        }
        let layout = Arc::new(ChunkLayout::compute(&descriptors)?);

        self.archetypes.push(Archetype::new(mask, layout));
        let id = self.archetypes.len() - 1;
        self.archetype_index.insert(mask, id);
        Ok(id)
    }

    /// Move an entity to the archetype for `new_mask`: shared columns are
    /// copied row-wise, fresh columns start zeroed, `init` then runs on the
    /// destination row. Both chunks get their write version bumped.
    fn move_entity<F>(&mut self, entity: Entity, new_mask: TypeMask, init: F) -> Result<()>
    where
        F: FnOnce(&mut Chunk, usize),
    {
        let old_loc = self
            .entities
            .location(entity)
            .ok_or(FdpError::EntityNotFound)?;
        let dst_id = self.get_or_create_archetype(new_mask)?;
        let src_id = old_loc.archetype_id as usize;
        if src_id == dst_id {
            return Ok(());
        }
        let version = self.global_version;

        // Disjoint mutable borrows of source and destination archetypes.
        let (src, dst) = if src_id < dst_id {
            let (left, right) = self.archetypes.split_at_mut(dst_id);
            (&mut left[src_id], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(src_id);
            (&mut right[0], &mut left[dst_id])
        };

        let new_loc = dst.push_entity(&mut self.allocator, dst_id as u32, entity, version)?;
        {
            let src_chunk = src
                .chunk(old_loc.chunk_index as usize)
                .ok_or(FdpError::TypeMismatch)?;
            let dst_chunk = dst
                .chunk_mut(new_loc.chunk_index as usize)
                .expect("row was just pushed");
            copy_row_intersection(src_chunk, old_loc.row as usize, dst_chunk, new_loc.row as usize);
            init(dst_chunk, new_loc.row as usize);
        }

        if let Some((moved, moved_loc)) = src.swap_remove(&mut self.allocator, old_loc, version) {
            self.entities.set_location(moved.index(), moved_loc);
        }
        self.entities.set_location(entity.index(), new_loc);
        self.entities.set_mask(entity.index(), new_mask);
        Ok(())
    }

    // ========== Replay hooks ==========

    /// Open a fresh chunk for `mask`, reproducing recorded chunk boundaries.
    pub(crate) fn replay_begin_chunk(&mut self, mask: TypeMask) -> Result<usize> {
        let arch_id = self.get_or_create_archetype(mask)?;
        self.archetypes[arch_id].begin_replay_chunk(&mut self.allocator)?;
        Ok(arch_id)
    }

    /// Materialize an entity at a recorded `(index, generation)`.
    ///
    /// A live occupant of the index is destroyed first; the recording is the
    /// authority on handle identity.
    pub(crate) fn replay_spawn(
        &mut self,
        index: u32,
        generation: u16,
        mask: TypeMask,
        lifecycle: Lifecycle,
    ) -> Result<Entity> {
        if let Some(existing) = self.entities.entity_at(index) {
            self.destroy_entity(existing)?;
        }
        let entity = self.entities.allocate_at(index, generation, lifecycle);
        let arch_id = self.get_or_create_archetype(mask)?;
        let version = self.global_version;
        let location = self.archetypes[arch_id].push_entity(
            &mut self.allocator,
            arch_id as u32,
            entity,
            version,
        )?;
        self.entities.set_location(index, location);
        self.entities.set_mask(index, mask);
        Ok(entity)
    }

    /// Overwrite a column prefix of one chunk from recorded bytes.
    pub(crate) fn replay_write_column(
        &mut self,
        arch_id: usize,
        chunk_index: usize,
        type_id: ComponentTypeId,
        bytes: &[u8],
        version: u64,
    ) -> Result<()> {
        let archetype = self
            .archetypes
            .get_mut(arch_id)
            .ok_or_else(|| FdpError::ReplayError("archetype out of range".into()))?;
        let col = archetype
            .column_index(type_id)
            .ok_or_else(|| FdpError::ReplayError(format!("type {} not in archetype", type_id.0)))?;
        let chunk = archetype
            .chunk_mut(chunk_index)
            .ok_or_else(|| FdpError::ReplayError("chunk out of range".into()))?;
        let dst = chunk.column_bytes_mut(col);
        if bytes.len() > dst.len() {
            return Err(FdpError::FormatError(format!(
                "column payload of {} bytes exceeds chunk column of {}",
                bytes.len(),
                dst.len()
            )));
        }
        dst[..bytes.len()].copy_from_slice(bytes);
        chunk.mark_column_written(col, version);
        Ok(())
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}
