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

//! Query engine with compiled archetype-mask filtering.
//!
//! Predicates compile into two 256-bit masks; an archetype matches iff
//! `(mask & required) == required && (mask & forbidden) == 0`. Managed and
//! lifecycle predicates filter rows after the archetype match. Iteration is
//! deterministic: archetypes in ascending mask order, chunks in append
//! order, rows ascending. The parallel variant gives up cross-chunk order
//! but keeps within-chunk order and hands each chunk to exactly one worker.

use smallvec::SmallVec;

use crate::chunk::Chunk;
use crate::component::{ComponentTypeId, ManagedComponent, TypeRegistry, UnmanagedComponent};
use crate::entity::{Entity, Lifecycle};
use crate::mask::TypeMask;
use crate::repository::Repository;

/// Builder for compiled queries; obtained from [`Repository::query`].
///
/// A predicate naming an unregistered type makes the query match nothing
/// (`with`/`with_managed`) or is a no-op (`without`); queries never fail at
/// runtime.
pub struct QueryBuilder<'r> {
    repo: &'r Repository,
    required: TypeMask,
    forbidden: TypeMask,
    write_set: TypeMask,
    managed: SmallVec<[ComponentTypeId; 4]>,
    lifecycle: Option<Lifecycle>,
    unsatisfiable: bool,
}

impl<'r> QueryBuilder<'r> {
    pub(crate) fn new(repo: &'r Repository) -> Self {
        Self {
            repo,
            required: TypeMask::EMPTY,
            forbidden: TypeMask::EMPTY,
            write_set: TypeMask::EMPTY,
            managed: SmallVec::new(),
            lifecycle: None,
            unsatisfiable: false,
        }
    }

    /// Require component `T` on matched entities.
    pub fn with<T: UnmanagedComponent>(mut self) -> Self {
        match self.repo.registry().id_of::<T>() {
            Some(id) if id.is_unmanaged() => self.required.set(id.mask_bit()),
            _ => self.unsatisfiable = true,
        }
        self
    }

    /// Exclude entities carrying component `T`.
    pub fn without<T: UnmanagedComponent>(mut self) -> Self {
        if let Some(id) = self.repo.registry().id_of::<T>() {
            if id.is_unmanaged() {
                self.forbidden.set(id.mask_bit());
            }
        }
        self
    }

    /// Require `T` and declare it part of the query's write set.
    pub fn write<T: UnmanagedComponent>(mut self) -> Self {
        match self.repo.registry().id_of::<T>() {
            Some(id) if id.is_unmanaged() => {
                self.required.set(id.mask_bit());
                self.write_set.set(id.mask_bit());
            }
            _ => self.unsatisfiable = true,
        }
        self
    }

    /// Require managed component `T`, checked per entity after the
    /// archetype match.
    pub fn with_managed<T: ManagedComponent>(mut self) -> Self {
        match self.repo.registry().id_of::<T>() {
            Some(id) if !id.is_unmanaged() => self.managed.push(id),
            _ => self.unsatisfiable = true,
        }
        self
    }

    /// Require a lifecycle state, checked per entity.
    pub fn with_lifecycle(mut self, state: Lifecycle) -> Self {
        self.lifecycle = Some(state);
        self
    }

    /// Compile the predicates into a reusable query.
    pub fn build(self) -> CompiledQuery {
        CompiledQuery {
            required: self.required,
            forbidden: self.forbidden,
            write_set: self.write_set,
            managed: self.managed,
            lifecycle: self.lifecycle,
            unsatisfiable: self.unsatisfiable,
        }
    }
}

/// Rows of one chunk selected by per-entity predicates.
#[derive(Clone, Debug)]
pub enum RowSelection {
    /// Every occupied row matches
    All(usize),
    /// Only the listed rows match, ascending
    Listed(Vec<u32>),
}

impl RowSelection {
    /// Number of selected rows
    pub fn len(&self) -> usize {
        match self {
            RowSelection::All(len) => *len,
            RowSelection::Listed(rows) => rows.len(),
        }
    }

    /// True when nothing is selected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate selected row indices, ascending.
    pub fn iter(&self) -> RowSelectionIter<'_> {
        match self {
            RowSelection::All(len) => RowSelectionIter::All(0..*len),
            RowSelection::Listed(rows) => RowSelectionIter::Listed(rows.iter()),
        }
    }
}

/// Iterator over selected row indices
pub enum RowSelectionIter<'a> {
    All(std::ops::Range<usize>),
    Listed(std::slice::Iter<'a, u32>),
}

impl<'a> Iterator for RowSelectionIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            RowSelectionIter::All(range) => range.next(),
            RowSelectionIter::Listed(iter) => iter.next().map(|&r| r as usize),
        }
    }
}

/// A compiled, repository-independent query.
#[derive(Clone, Debug)]
pub struct CompiledQuery {
    required: TypeMask,
    forbidden: TypeMask,
    write_set: TypeMask,
    managed: SmallVec<[ComponentTypeId; 4]>,
    lifecycle: Option<Lifecycle>,
    unsatisfiable: bool,
}

impl CompiledQuery {
    /// Mask of components this query must be present
    pub fn required(&self) -> TypeMask {
        self.required
    }

    /// Mask of components this query declares writable
    pub fn write_set(&self) -> TypeMask {
        self.write_set
    }

    /// The archetype-level match rule.
    pub fn matches_mask(&self, mask: TypeMask) -> bool {
        !self.unsatisfiable
            && mask.contains_all(&self.required)
            && mask.is_disjoint(&self.forbidden)
    }

    /// Matched archetype ids in ascending mask order.
    fn matched_archetypes(&self, repo: &Repository) -> Vec<usize> {
        let mut matched: Vec<(TypeMask, usize)> = repo
            .archetypes()
            .iter()
            .enumerate()
            .filter(|(_, archetype)| self.matches_mask(archetype.mask()))
            .map(|(id, archetype)| (archetype.mask(), id))
            .collect();
        matched.sort_by_key(|&(mask, _)| mask);
        matched.into_iter().map(|(_, id)| id).collect()
    }

    fn select_rows(&self, repo: &Repository, chunk: &Chunk) -> RowSelection {
        if self.managed.is_empty() && self.lifecycle.is_none() {
            return RowSelection::All(chunk.len());
        }

        let mut rows = Vec::new();
        'rows: for (row, &entity) in chunk.entities().iter().enumerate() {
            for &managed_id in &self.managed {
                if !repo.managed_store().has(managed_id, entity.index() as usize) {
                    continue 'rows;
                }
            }
            if let Some(state) = self.lifecycle {
                if repo.entity_index().lifecycle(entity) != Some(state) {
                    continue 'rows;
                }
            }
            rows.push(row as u32);
        }
        RowSelection::Listed(rows)
    }

    /// Deterministic chunk plan: (archetype, chunk, selected rows).
    fn build_plan(&self, repo: &Repository) -> Vec<(usize, usize, RowSelection)> {
        let mut plan = Vec::new();
        for arch_id in self.matched_archetypes(repo) {
            let archetype = &repo.archetypes()[arch_id];
            for (chunk_index, chunk) in archetype.chunks().iter().enumerate() {
                if chunk.is_empty() {
                    continue;
                }
                let rows = self.select_rows(repo, chunk);
                if rows.is_empty() {
                    continue;
                }
                plan.push((arch_id, chunk_index, rows));
            }
        }
        plan
    }

    /// Number of matching entities.
    pub fn count(&self, repo: &Repository) -> usize {
        self.build_plan(repo).iter().map(|(_, _, rows)| rows.len()).sum()
    }

    /// Sequential row iteration in deterministic order.
    pub fn for_each<F>(&self, repo: &Repository, mut f: F)
    where
        F: FnMut(Entity, RowRef<'_>),
    {
        let registry = repo.registry();
        for (arch_id, chunk_index, rows) in self.build_plan(repo) {
            let chunk = &repo.archetypes()[arch_id].chunks()[chunk_index];
            for row in rows.iter() {
                f(chunk.entity(row), RowRef { chunk, registry, row });
            }
        }
    }

    /// Sequential mutable row iteration; writes stamp column and chunk
    /// versions with the current global version.
    pub fn for_each_mut<F>(&self, repo: &mut Repository, mut f: F)
    where
        F: FnMut(Entity, RowRefMut<'_>),
    {
        let plan = self.build_plan(repo);
        let (registry, archetypes, version) = repo.query_parts_mut();
        for (arch_id, chunk_index, rows) in plan {
            let chunk = &mut archetypes[arch_id].chunks_mut()[chunk_index];
            for row in rows.iter() {
                let entity = chunk.entity(row);
                f(
                    entity,
                    RowRefMut {
                        chunk: &mut *chunk,
                        registry,
                        row,
                        version,
                    },
                );
            }
        }
    }

    /// Sequential chunk iteration in deterministic order.
    pub fn for_each_chunk<F>(&self, repo: &Repository, mut f: F)
    where
        F: FnMut(ChunkRef<'_>),
    {
        let registry = repo.registry();
        for (arch_id, chunk_index, rows) in self.build_plan(repo) {
            let chunk = &repo.archetypes()[arch_id].chunks()[chunk_index];
            f(ChunkRef { chunk, registry, rows });
        }
    }

    /// Sequential mutable chunk iteration.
    pub fn for_each_chunk_mut<F>(&self, repo: &mut Repository, mut f: F)
    where
        F: FnMut(ChunkMut<'_>),
    {
        let write_set = self.write_set;
        let plan = self.build_plan(repo);
        let (registry, archetypes, version) = repo.query_parts_mut();
        for (arch_id, chunk_index, rows) in plan {
            let chunk = &mut archetypes[arch_id].chunks_mut()[chunk_index];
            f(ChunkMut {
                chunk,
                registry,
                rows,
                write_set,
                version,
            });
        }
    }

    /// Chunk-parallel iteration over the work-stealing pool.
    ///
    /// Each matched chunk is exclusively owned by one worker for the
    /// duration of the closure call. The body may only mutate components in
    /// the query's write set, and only rows of the handed chunk; cross-chunk
    /// ordering is unspecified, within-chunk order stays ascending.
    #[cfg(feature = "parallel")]
    pub fn for_each_parallel<F>(&self, repo: &mut Repository, f: F)
    where
        F: Fn(ChunkMut<'_>) + Send + Sync,
    {
        use rayon::prelude::*;

        let write_set = self.write_set;
        let plan = self.build_plan(repo);
        let (registry, archetypes, version) = repo.query_parts_mut();

        // Convert pointers to usize for Send + Sync across thread boundaries;
        // they are only used as opaque handles until the worker runs.
        let jobs: Vec<(usize, RowSelection)> = plan
            .into_iter()
            .map(|(arch_id, chunk_index, rows)| {
                let chunk = &mut archetypes[arch_id].chunks_mut()[chunk_index] as *mut Chunk;
                (chunk as usize, rows)
            })
            .collect();

        jobs.into_par_iter().for_each(|(chunk_addr, rows)| {
            // SAFETY: This is safe because:
            // 1. Every (archetype, chunk) pair appears exactly once in the
            //    plan, so each chunk pointer is handed to exactly one worker.
            // 2. The pointers stay valid for the duration of this call; no
            //    structural change can run while `repo` is mutably borrowed.
            // 3. The registry is only read, and reads are Sync.
            let chunk = unsafe { &mut *(chunk_addr as *mut Chunk) };
            f(ChunkMut {
                chunk,
                registry,
                rows,
                write_set,
                version,
            });
        });
    }
}

/// Read access to one row during query iteration
pub struct RowRef<'a> {
    chunk: &'a Chunk,
    registry: &'a TypeRegistry,
    row: usize,
}

impl<'a> RowRef<'a> {
    /// Component of the iterated entity, if present on its archetype.
    pub fn get<T: UnmanagedComponent>(&self) -> Option<&'a T> {
        let id = self.registry.id_of::<T>()?;
        let col = self.chunk.layout().column_index(id)?;
        Some(&self.chunk.column_slice::<T>(col)[self.row])
    }

    /// Row index within the chunk
    pub fn row(&self) -> usize {
        self.row
    }
}

/// Write access to one row during query iteration
pub struct RowRefMut<'a> {
    chunk: &'a mut Chunk,
    registry: &'a TypeRegistry,
    row: usize,
    version: u64,
}

impl<'a> RowRefMut<'a> {
    /// Read a component of the iterated entity.
    pub fn get<T: UnmanagedComponent>(&self) -> Option<&T> {
        let id = self.registry.id_of::<T>()?;
        let col = self.chunk.layout().column_index(id)?;
        Some(&self.chunk.column_slice::<T>(col)[self.row])
    }

    /// Mutate a component of the iterated entity; stamps the column and
    /// chunk write versions.
    pub fn get_mut<T: UnmanagedComponent>(&mut self) -> Option<&mut T> {
        let id = self.registry.id_of::<T>()?;
        let col = self.chunk.layout().column_index(id)?;
        self.chunk.mark_column_written(col, self.version);
        Some(&mut self.chunk.column_slice_mut::<T>(col)[self.row])
    }

    /// Row index within the chunk
    pub fn row(&self) -> usize {
        self.row
    }
}

/// Read access to one matched chunk
pub struct ChunkRef<'a> {
    chunk: &'a Chunk,
    registry: &'a TypeRegistry,
    rows: RowSelection,
}

impl<'a> ChunkRef<'a> {
    /// Occupied rows in this chunk
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    /// True when the chunk holds no rows
    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Entity handles, ascending row order
    pub fn entities(&self) -> &'a [Entity] {
        self.chunk.entities()
    }

    /// Rows matching the query's per-entity predicates
    pub fn rows(&self) -> RowSelectionIter<'_> {
        self.rows.iter()
    }

    /// Typed column over the occupied rows
    pub fn slice<T: UnmanagedComponent>(&self) -> Option<&'a [T]> {
        let id = self.registry.id_of::<T>()?;
        let col = self.chunk.layout().column_index(id)?;
        Some(self.chunk.column_slice::<T>(col))
    }
}

/// Write access to one matched chunk (exclusively owned by one worker in
/// parallel iteration)
pub struct ChunkMut<'a> {
    chunk: &'a mut Chunk,
    registry: &'a TypeRegistry,
    rows: RowSelection,
    write_set: TypeMask,
    version: u64,
}

impl<'a> ChunkMut<'a> {
    /// Occupied rows in this chunk
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    /// True when the chunk holds no rows
    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Entity handles, ascending row order
    pub fn entities(&self) -> &[Entity] {
        self.chunk.entities()
    }

    /// Rows matching the query's per-entity predicates
    pub fn rows(&self) -> RowSelectionIter<'_> {
        self.rows.iter()
    }

    /// Typed read-only column
    pub fn slice<T: UnmanagedComponent>(&self) -> Option<&[T]> {
        let id = self.registry.id_of::<T>()?;
        let col = self.chunk.layout().column_index(id)?;
        Some(self.chunk.column_slice::<T>(col))
    }

    /// Typed writable column; only write-set components are handed out.
    /// Stamps the column and chunk write versions.
    pub fn slice_mut<T: UnmanagedComponent>(&mut self) -> Option<&mut [T]> {
        let id = self.registry.id_of::<T>()?;
        if !self.write_set.contains(id.mask_bit()) {
            return None;
        }
        let col = self.chunk.layout().column_index(id)?;
        self.chunk.mark_column_written(col, self.version);
        Some(self.chunk.column_slice_mut::<T>(col))
    }

    /// Writable column `W` alongside a read-only column `R` of the same
    /// chunk; `W` must be in the write set.
    pub fn slice_pair_mut<W: UnmanagedComponent, R: UnmanagedComponent>(
        &mut self,
    ) -> Option<(&mut [W], &[R])> {
        let w_id = self.registry.id_of::<W>()?;
        let r_id = self.registry.id_of::<R>()?;
        if w_id == r_id || !self.write_set.contains(w_id.mask_bit()) {
            return None;
        }
        let w_col = self.chunk.layout().column_index(w_id)?;
        let r_col = self.chunk.layout().column_index(r_id)?;
        self.chunk.mark_column_written(w_col, self.version);
        Some(self.chunk.column_pair_mut::<W, R>(w_col, r_col))
    }
}
