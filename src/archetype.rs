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

//! Archetype storage: a mask-identified set of chunks with row routing.
//!
//! Chunks are append-only ordered; the last chunk is the open one receiving
//! new rows. Deletions swap the tail row of the last chunk into the hole,
//! and a drained last chunk is retired to the allocator.

use std::sync::Arc;

use crate::chunk::{Chunk, ChunkAllocator, ChunkLayout};
use crate::component::ComponentTypeId;
use crate::entity::{Entity, EntityLocation};
use crate::error::Result;
use crate::mask::TypeMask;

/// Storage for all entities sharing one unmanaged component set.
pub struct Archetype {
    mask: TypeMask,
    layout: Arc<ChunkLayout>,
    chunks: Vec<Chunk>,
}

impl Archetype {
    /// Create an empty archetype for `mask` with a precomputed layout.
    pub fn new(mask: TypeMask, layout: Arc<ChunkLayout>) -> Self {
        Self {
            mask,
            layout,
            chunks: Vec::new(),
        }
    }

    /// Component set of this archetype
    pub fn mask(&self) -> TypeMask {
        self.mask
    }

    /// Shared chunk layout
    pub fn layout(&self) -> &Arc<ChunkLayout> {
        &self.layout
    }

    /// Chunks in append order
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Chunks in append order, mutable
    pub fn chunks_mut(&mut self) -> &mut [Chunk] {
        &mut self.chunks
    }

    /// Chunk by index
    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    /// Chunk by index, mutable
    pub fn chunk_mut(&mut self, index: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(index)
    }

    /// Column index of `type_id` within this archetype's chunks
    pub fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.layout.column_index(type_id)
    }

    /// Total rows across all chunks
    pub fn entity_count(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    /// True when no chunk holds a row
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_empty())
    }

    /// Route a new row into the open chunk, allocating one when full.
    ///
    /// Column bytes of the new row start zeroed. Returns the row location.
    pub fn push_entity(
        &mut self,
        allocator: &mut ChunkAllocator,
        archetype_id: u32,
        entity: Entity,
        version: u64,
    ) -> Result<EntityLocation> {
        let needs_chunk = self.chunks.last().map_or(true, |c| c.is_full());
        if needs_chunk {
            let buf = allocator.acquire()?;
            self.chunks.push(Chunk::new(buf, Arc::clone(&self.layout)));
        }

        let chunk_index = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_index];
        let row = chunk.push_row(entity, version);
        Ok(EntityLocation {
            archetype_id,
            chunk_index: chunk_index as u32,
            row: row as u32,
        })
    }

    /// Open a fresh chunk regardless of spare capacity (replay path, which
    /// must reproduce recorded chunk boundaries exactly).
    pub(crate) fn begin_replay_chunk(&mut self, allocator: &mut ChunkAllocator) -> Result<()> {
        let buf = allocator.acquire()?;
        self.chunks.push(Chunk::new(buf, Arc::clone(&self.layout)));
        Ok(())
    }

    /// Remove the row at `location`, filling the hole from the tail of the
    /// last chunk. A drained last chunk is retired to the allocator.
    ///
    /// Returns the entity moved into the hole with its new location, so the
    /// entity index can be patched.
    pub fn swap_remove(
        &mut self,
        allocator: &mut ChunkAllocator,
        location: EntityLocation,
        version: u64,
    ) -> Option<(Entity, EntityLocation)> {
        let hole_chunk = location.chunk_index as usize;
        let hole_row = location.row as usize;

        // Empty trailing chunks (possible after replay) cannot donate a row.
        while self.chunks.len() - 1 > hole_chunk
            && self.chunks.last().is_some_and(|c| c.is_empty())
        {
            let chunk = self.chunks.pop().expect("last chunk exists");
            allocator.release(chunk.into_buf());
        }
        let last_chunk = self.chunks.len() - 1;

        let moved = if hole_chunk == last_chunk {
            self.chunks[hole_chunk]
                .swap_remove_row(hole_row, version)
                .map(|entity| (entity, location))
        } else {
            // The hole and the donor tail live in different chunks: copy the
            // tail row over, then pop it from the last chunk.
            let (head, tail) = self.chunks.split_at_mut(last_chunk);
            let hole = &mut head[hole_chunk];
            let donor = &mut tail[0];
            let donor_row = donor.len() - 1;
            let donor_entity = donor.entity(donor_row);

            for col in 0..self.layout.columns.len() {
                let size = self.layout.columns[col].size;
                if size == 0 {
                    continue;
                }
                let bytes = donor.row_bytes(col, donor_row).to_vec();
                hole.column_bytes_mut(col)[hole_row * size..(hole_row + 1) * size]
                    .copy_from_slice(&bytes);
            }
            hole.write_entity(hole_row, donor_entity);
            hole.mark_structural_change(version);
            donor.swap_remove_row(donor_row, version);

            Some((donor_entity, location))
        };

        // Retire the last chunk once drained.
        if self.chunks.last().is_some_and(|c| c.is_empty()) {
            let chunk = self.chunks.pop().expect("last chunk exists");
            allocator.release(chunk.into_buf());
        }

        moved
    }

    /// Retire every empty chunk (tick pruning).
    pub fn prune_empty_chunks(&mut self, allocator: &mut ChunkAllocator) -> usize {
        let mut retired = 0;
        while self.chunks.last().is_some_and(|c| c.is_empty()) {
            let chunk = self.chunks.pop().expect("last chunk exists");
            allocator.release(chunk.into_buf());
            retired += 1;
        }
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDescriptor, ComponentKind, DataPolicy};

    fn small_layout() -> Arc<ChunkLayout> {
        let desc = ComponentDescriptor {
            type_id: ComponentTypeId(0),
            name: "u64",
            size: 8,
            align: 8,
            kind: ComponentKind::Unmanaged,
            policy: DataPolicy::NONE,
        };
        Arc::new(ChunkLayout::compute(&[&desc]).unwrap())
    }

    #[test]
    fn test_push_overflows_into_new_chunk() {
        let layout = small_layout();
        let capacity = layout.capacity;
        let mut allocator = ChunkAllocator::new();
        let mut archetype = Archetype::new(TypeMask::single(0), layout);

        for i in 0..capacity as u32 + 1 {
            let loc = archetype
                .push_entity(&mut allocator, 0, Entity::from_parts(i, 1), 1)
                .unwrap();
            if (i as usize) < capacity {
                assert_eq!(loc.chunk_index, 0);
            } else {
                assert_eq!(loc.chunk_index, 1);
                assert_eq!(loc.row, 0);
            }
        }
        assert_eq!(archetype.chunks().len(), 2);
        assert_eq!(archetype.entity_count(), capacity + 1);
        // Prior rows intact
        assert_eq!(archetype.chunk(0).unwrap().entity(0), Entity::from_parts(0, 1));
    }

    #[test]
    fn test_swap_remove_across_chunks() {
        let layout = small_layout();
        let capacity = layout.capacity;
        let mut allocator = ChunkAllocator::new();
        let mut archetype = Archetype::new(TypeMask::single(0), layout);

        for i in 0..capacity as u32 + 2 {
            archetype
                .push_entity(&mut allocator, 0, Entity::from_parts(i, 1), 1)
                .unwrap();
        }

        // Hole in chunk 0 is filled by the tail of chunk 1
        let hole = EntityLocation {
            archetype_id: 0,
            chunk_index: 0,
            row: 3,
        };
        let (moved, new_loc) = archetype.swap_remove(&mut allocator, hole, 2).unwrap();
        assert_eq!(moved, Entity::from_parts(capacity as u32 + 1, 1));
        assert_eq!(new_loc, hole);
        assert_eq!(archetype.chunk(0).unwrap().entity(3), moved);
        assert_eq!(archetype.chunks().len(), 2);
    }

    #[test]
    fn test_last_row_removal_retires_chunk() {
        let layout = small_layout();
        let mut allocator = ChunkAllocator::new();
        let mut archetype = Archetype::new(TypeMask::single(0), layout);

        let loc = archetype
            .push_entity(&mut allocator, 0, Entity::from_parts(0, 1), 1)
            .unwrap();
        assert_eq!(archetype.chunks().len(), 1);

        assert!(archetype.swap_remove(&mut allocator, loc, 2).is_none());
        assert_eq!(archetype.chunks().len(), 0);
        assert_eq!(allocator.free_count(), 1);
    }
}
