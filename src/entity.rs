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

//! Entity handles and the generational entity index.
//!
//! Handles are `(index, generation)` pairs. Indices are dense and recycled
//! through a free list; the generation bumps on destruction so stale handles
//! are detectable. The index floor set by `reserve_range` keeps replayed
//! entity indices from colliding with freshly created ones.

use crate::mask::TypeMask;

/// Non-owning entity handle.
///
/// Generation 0 is never assigned to a live entity; `Entity::NULL` uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    index: u32,
    generation: u16,
}

impl Entity {
    /// The null handle; never alive.
    pub const NULL: Entity = Entity {
        index: 0,
        generation: 0,
    };

    /// Build a handle from raw parts (replay and wire paths).
    pub fn from_parts(index: u32, generation: u16) -> Self {
        Self { index, generation }
    }

    /// Dense index of this handle.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of this handle.
    pub fn generation(self) -> u16 {
        self.generation
    }

    /// True for the null handle.
    pub fn is_null(self) -> bool {
        self.generation == 0
    }
}

/// Entity lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Preliminary = 0,
    Constructing = 1,
    Active = 2,
    Dying = 3,
    Destroyed = 4,
}

impl Lifecycle {
    /// Converts from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Preliminary),
            1 => Some(Self::Constructing),
            2 => Some(Self::Active),
            3 => Some(Self::Dying),
            4 => Some(Self::Destroyed),
            _ => None,
        }
    }
}

/// Where an entity's row lives: archetype, chunk within it, row within that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype_id: u32,
    pub chunk_index: u32,
    pub row: u32,
}

impl EntityLocation {
    pub(crate) const INVALID: EntityLocation = EntityLocation {
        archetype_id: u32::MAX,
        chunk_index: u32::MAX,
        row: u32::MAX,
    };
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u16,
    alive: bool,
    lifecycle: Lifecycle,
    location: EntityLocation,
    /// Archetype mask mirror for cheap per-entity checks
    mask: TypeMask,
}

impl Slot {
    fn empty() -> Self {
        Self {
            generation: 0,
            alive: false,
            lifecycle: Lifecycle::Destroyed,
            location: EntityLocation::INVALID,
            mask: TypeMask::EMPTY,
        }
    }
}

/// Dense generational entity index.
pub struct EntityIndex {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// Fresh allocations never go below this index.
    floor: u32,
    /// Highest index ever handed out.
    high_water: u32,
    alive_count: usize,
}

impl EntityIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            floor: 0,
            high_water: 0,
            alive_count: 0,
        }
    }

    /// Allocate a handle: pop the free list, else append at the floor.
    pub fn allocate(&mut self) -> Entity {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                let index = (self.slots.len() as u32).max(self.floor);
                self.ensure_index(index);
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        if slot.generation == 0 {
            slot.generation = 1;
        }
        slot.alive = true;
        slot.lifecycle = Lifecycle::Active;
        slot.location = EntityLocation::INVALID;
        slot.mask = TypeMask::EMPTY;

        self.alive_count += 1;
        self.high_water = self.high_water.max(index);
        Entity {
            index,
            generation: slot.generation,
        }
    }

    /// Activate a slot at a fixed `(index, generation)` (replay path).
    ///
    /// Overwrites whatever generation the slot held; the recording is the
    /// authority on handle identity.
    pub(crate) fn allocate_at(&mut self, index: u32, generation: u16, lifecycle: Lifecycle) -> Entity {
        self.ensure_index(index);
        let slot = &mut self.slots[index as usize];
        if !slot.alive {
            self.alive_count += 1;
        }
        slot.generation = if generation == 0 { 1 } else { generation };
        slot.alive = true;
        slot.lifecycle = lifecycle;
        slot.location = EntityLocation::INVALID;
        slot.mask = TypeMask::EMPTY;

        self.free_list.retain(|&i| i != index);
        self.high_water = self.high_water.max(index);
        Entity {
            index,
            generation: slot.generation,
        }
    }

    /// Release a handle: bump the generation, recycle the index.
    ///
    /// Indices below the reservation floor are replay-owned and are not
    /// recycled into the free list.
    pub fn free(&mut self, entity: Entity) -> bool {
        let Some(slot) = self.slots.get_mut(entity.index as usize) else {
            return false;
        };
        if !slot.alive || slot.generation != entity.generation {
            return false;
        }

        slot.alive = false;
        slot.lifecycle = Lifecycle::Destroyed;
        slot.location = EntityLocation::INVALID;
        slot.mask = TypeMask::EMPTY;
        slot.generation = slot.generation.wrapping_add(1);
        if slot.generation == 0 {
            slot.generation = 1;
        }

        self.alive_count -= 1;
        if entity.index >= self.floor {
            self.free_list.push(entity.index);
        }
        true
    }

    /// Force the next fresh index to be at least `n`.
    ///
    /// Free-list entries below `n` become unallocatable. The floor only ever
    /// rises.
    pub fn reserve_range(&mut self, n: u32) {
        if n <= self.floor {
            return;
        }
        self.floor = n;
        self.free_list.retain(|&i| i >= n);
    }

    /// True if the handle refers to a live entity of matching generation.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index as usize)
            .map(|slot| slot.alive && slot.generation == entity.generation)
            .unwrap_or(false)
    }

    /// Current handle for a raw index, if that slot is alive.
    pub fn entity_at(&self, index: u32) -> Option<Entity> {
        let slot = self.slots.get(index as usize)?;
        if slot.alive {
            Some(Entity {
                index,
                generation: slot.generation,
            })
        } else {
            None
        }
    }

    /// Storage location of a live entity.
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        let slot = self.slots.get(entity.index as usize)?;
        if slot.alive && slot.generation == entity.generation {
            Some(slot.location)
        } else {
            None
        }
    }

    pub(crate) fn set_location(&mut self, index: u32, location: EntityLocation) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.location = location;
        }
    }

    /// Archetype mask mirror for a live entity.
    pub fn mask(&self, entity: Entity) -> Option<TypeMask> {
        let slot = self.slots.get(entity.index as usize)?;
        if slot.alive && slot.generation == entity.generation {
            Some(slot.mask)
        } else {
            None
        }
    }

    pub(crate) fn set_mask(&mut self, index: u32, mask: TypeMask) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.mask = mask;
        }
    }

    /// Lifecycle state of a live entity.
    pub fn lifecycle(&self, entity: Entity) -> Option<Lifecycle> {
        let slot = self.slots.get(entity.index as usize)?;
        if slot.alive && slot.generation == entity.generation {
            Some(slot.lifecycle)
        } else {
            None
        }
    }

    /// Set the lifecycle state; false if the handle is stale.
    pub fn set_lifecycle(&mut self, entity: Entity, lifecycle: Lifecycle) -> bool {
        let Some(slot) = self.slots.get_mut(entity.index as usize) else {
            return false;
        };
        if !slot.alive || slot.generation != entity.generation {
            return false;
        }
        slot.lifecycle = lifecycle;
        true
    }

    /// Number of live entities
    pub fn alive_count(&self) -> usize {
        self.alive_count
    }

    /// Highest index ever handed out
    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    fn ensure_index(&mut self, index: u32) {
        if index as usize >= self.slots.len() {
            self.slots.resize(index as usize + 1, Slot::empty());
        }
    }
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self::new()
    }
}
