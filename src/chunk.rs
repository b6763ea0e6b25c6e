//! Fixed-size chunk storage.
//!
//! A chunk is a 64 KiB aligned region holding the rows of one archetype:
//! an entity-handle array followed by one naturally-aligned column per
//! unmanaged component type. Buffers are zero-filled on acquire (including
//! recycled ones) so a replayed structural sequence produces byte-identical
//! chunks. Per-column write versions drive change detection and delta
//! recording.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::component::{ComponentDescriptor, ComponentTypeId, DataPolicy};
use crate::entity::Entity;
use crate::error::{FdpError, Result};

/// Size of a chunk's backing region.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Base alignment of chunk buffers; bounds supported component alignment.
pub const CHUNK_ALIGN: usize = 64;

/// Owned, aligned, fixed-size chunk buffer.
pub struct ChunkBuf {
    ptr: NonNull<u8>,
}

impl ChunkBuf {
    fn layout() -> Layout {
        // CHUNK_SIZE and CHUNK_ALIGN are valid layout constants
        Layout::from_size_align(CHUNK_SIZE, CHUNK_ALIGN).expect("chunk layout")
    }

    /// Allocate a zero-filled buffer; `OutOfMemory` when the host refuses.
    fn alloc() -> Result<ChunkBuf> {
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(Self::layout()) };
        match NonNull::new(raw) {
            Some(ptr) => Ok(ChunkBuf { ptr }),
            None => Err(FdpError::OutOfMemory),
        }
    }

    fn zero(&mut self) {
        // SAFETY: the buffer is exactly CHUNK_SIZE bytes and exclusively owned.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, CHUNK_SIZE) };
    }

    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for ChunkBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with the same layout in `alloc`.
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout()) };
    }
}

// SAFETY: ChunkBuf uniquely owns its allocation; access is governed by the
// owning Chunk's borrows.
unsafe impl Send for ChunkBuf {}
unsafe impl Sync for ChunkBuf {}

/// Free-listing allocator for chunk buffers.
///
/// Buffers are recycled within the process and never returned to the OS
/// during a tick.
pub struct ChunkAllocator {
    free: Vec<ChunkBuf>,
    allocated: usize,
}

impl ChunkAllocator {
    /// Create an empty allocator
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            allocated: 0,
        }
    }

    /// Acquire a zero-filled buffer, recycling a released one if available.
    pub fn acquire(&mut self) -> Result<ChunkBuf> {
        if let Some(mut buf) = self.free.pop() {
            buf.zero();
            return Ok(buf);
        }
        let buf = ChunkBuf::alloc()?;
        self.allocated += 1;
        Ok(buf)
    }

    /// Return a buffer to the free list.
    pub fn release(&mut self, buf: ChunkBuf) {
        self.free.push(buf);
    }

    /// Total buffers ever allocated from the host
    pub fn allocated_count(&self) -> usize {
        self.allocated
    }

    /// Buffers currently on the free list
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl Default for ChunkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Placement of one component column inside a chunk.
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    pub type_id: ComponentTypeId,
    pub offset: usize,
    pub size: usize,
    pub align: usize,
    pub policy: DataPolicy,
}

/// Row capacity and column placement for one archetype, shared by its chunks.
#[derive(Debug, Clone)]
pub struct ChunkLayout {
    pub capacity: usize,
    pub columns: Vec<ColumnLayout>,
}

impl ChunkLayout {
    /// Solve for the largest row capacity whose entity array plus columns
    /// fit in a chunk with every column naturally aligned.
    ///
    /// `descriptors` must be sorted by type id (mask bit order).
    pub fn compute(descriptors: &[&ComponentDescriptor]) -> Result<ChunkLayout> {
        let entity_size = std::mem::size_of::<Entity>();
        let row_stride: usize = entity_size
            + descriptors.iter().map(|d| d.size as usize).sum::<usize>();

        let mut capacity = CHUNK_SIZE / row_stride;
        loop {
            if capacity == 0 {
                return Err(FdpError::LayoutError(format!(
                    "row of {row_stride} bytes cannot fit in a {CHUNK_SIZE} byte chunk"
                )));
            }
            if let Some(columns) = Self::place(descriptors, capacity) {
                return Ok(ChunkLayout { capacity, columns });
            }
            // Alignment padding pushed a column past the end; shrink and retry.
            capacity -= 1;
        }
    }

    fn place(descriptors: &[&ComponentDescriptor], capacity: usize) -> Option<Vec<ColumnLayout>> {
        let mut cursor = capacity * std::mem::size_of::<Entity>();
        let mut columns = Vec::with_capacity(descriptors.len());

        for desc in descriptors {
            let align = (desc.align as usize).max(1);
            cursor = (cursor + align - 1) & !(align - 1);
            let size = desc.size as usize;
            let end = cursor + capacity * size;
            if end > CHUNK_SIZE {
                return None;
            }
            columns.push(ColumnLayout {
                type_id: desc.type_id,
                offset: cursor,
                size,
                align,
                policy: desc.policy,
            });
            cursor = end;
        }
        Some(columns)
    }

    /// Index of the column holding `type_id`
    pub fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.columns.iter().position(|c| c.type_id == type_id)
    }
}

/// One 64 KiB region of rows for a single archetype.
pub struct Chunk {
    buf: ChunkBuf,
    layout: Arc<ChunkLayout>,
    len: usize,
    // Padded to its own cache line; parallel workers bump versions of
    // adjacent chunks.
    write_version: CachePadded<u64>,
    column_versions: Vec<u64>,
}

impl Chunk {
    /// Wrap a freshly acquired (zeroed) buffer.
    pub fn new(buf: ChunkBuf, layout: Arc<ChunkLayout>) -> Self {
        let column_count = layout.columns.len();
        Self {
            buf,
            layout,
            len: 0,
            write_version: CachePadded::new(0),
            column_versions: vec![0; column_count],
        }
    }

    /// Number of occupied rows
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no rows are occupied
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when no row slot remains
    pub fn is_full(&self) -> bool {
        self.len >= self.layout.capacity
    }

    /// Row capacity of this chunk
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    /// Shared layout of this chunk's archetype
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Version of the most recent write to any column or row of this chunk
    pub fn write_version(&self) -> u64 {
        *self.write_version
    }

    /// Version of the most recent write to column `col`
    pub fn column_version(&self, col: usize) -> u64 {
        self.column_versions[col]
    }

    /// Stamp a column (and the chunk) as written at `version`.
    pub fn mark_column_written(&mut self, col: usize, version: u64) {
        self.column_versions[col] = version;
        *self.write_version = version;
    }

    /// Stamp the chunk as structurally changed at `version`.
    pub fn mark_structural_change(&mut self, version: u64) {
        *self.write_version = version;
    }

    /// Entity handles of the occupied rows, ascending row order.
    pub fn entities(&self) -> &[Entity] {
        // SAFETY: rows 0..len were written through push_row/write_entity and
        // the entity array starts at offset 0 with sufficient alignment.
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr() as *const Entity, self.len) }
    }

    /// Entity handle at `row`
    pub fn entity(&self, row: usize) -> Entity {
        self.entities()[row]
    }

    pub(crate) fn write_entity(&mut self, row: usize, entity: Entity) {
        debug_assert!(row < self.layout.capacity);
        // SAFETY: row is within capacity; the entity array occupies
        // capacity * size_of::<Entity>() bytes from offset 0.
        unsafe {
            let ptr = (self.buf.as_mut_ptr() as *mut Entity).add(row);
            std::ptr::write(ptr, entity);
        }
    }

    /// Append a row for `entity`; column bytes start zeroed.
    ///
    /// Returns the new row index.
    pub fn push_row(&mut self, entity: Entity, version: u64) -> usize {
        debug_assert!(!self.is_full());
        let row = self.len;
        self.write_entity(row, entity);
        self.len += 1;
        *self.write_version = version;
        row
    }

    /// Swap-remove `row`: the tail row moves into the hole, the vacated tail
    /// slot is re-zeroed so recycled rows always start from zero bytes.
    ///
    /// Returns the entity that now occupies `row`, if any.
    pub fn swap_remove_row(&mut self, row: usize, version: u64) -> Option<Entity> {
        debug_assert!(row < self.len);
        let last = self.len - 1;

        if row != last {
            let moved = self.entity(last);
            for col in 0..self.layout.columns.len() {
                let size = self.layout.columns[col].size;
                if size == 0 {
                    continue;
                }
                // SAFETY: row and last are distinct occupied rows of the same
                // column; regions of `size` bytes do not overlap.
                unsafe {
                    let base = self.column_ptr_mut(col);
                    std::ptr::copy_nonoverlapping(
                        base.add(last * size) as *const u8,
                        base.add(row * size),
                        size,
                    );
                }
            }
            self.write_entity(row, moved);
        }

        self.zero_row(last);
        self.len = last;
        *self.write_version = version;

        if row < self.len {
            Some(self.entity(row))
        } else {
            None
        }
    }

    fn zero_row(&mut self, row: usize) {
        self.write_entity(row, Entity::NULL);
        for col in 0..self.layout.columns.len() {
            let size = self.layout.columns[col].size;
            if size == 0 {
                continue;
            }
            // SAFETY: row is within capacity; the region lies inside the column.
            unsafe {
                std::ptr::write_bytes(self.column_ptr_mut(col).add(row * size), 0, size);
            }
        }
    }

    fn column_ptr(&self, col: usize) -> *const u8 {
        // SAFETY: the column offset is inside the buffer by layout construction.
        unsafe { self.buf.as_ptr().add(self.layout.columns[col].offset) }
    }

    fn column_ptr_mut(&mut self, col: usize) -> *mut u8 {
        // SAFETY: as column_ptr.
        unsafe { self.buf.as_mut_ptr().add(self.layout.columns[col].offset) }
    }

    /// Typed view of a column over the occupied rows.
    pub fn column_slice<T>(&self, col: usize) -> &[T] {
        debug_assert_eq!(std::mem::size_of::<T>(), self.layout.columns[col].size);
        // SAFETY: the column is naturally aligned for T (registration checked
        // align, buffer base is CHUNK_ALIGN aligned) and holds len rows.
        unsafe { std::slice::from_raw_parts(self.column_ptr(col) as *const T, self.len) }
    }

    /// Typed mutable view of a column over the occupied rows.
    ///
    /// Does not stamp versions; callers stamp per mutation batch.
    pub fn column_slice_mut<T>(&mut self, col: usize) -> &mut [T] {
        debug_assert_eq!(std::mem::size_of::<T>(), self.layout.columns[col].size);
        // SAFETY: as column_slice, with exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.column_ptr_mut(col) as *mut T, self.len) }
    }

    /// Split borrow of two distinct columns: one writable, one read-only.
    ///
    /// # Panics
    /// Panics in debug builds when both indices name the same column.
    pub fn column_pair_mut<W, R>(&mut self, w_col: usize, r_col: usize) -> (&mut [W], &[R]) {
        debug_assert_ne!(w_col, r_col);
        debug_assert_eq!(std::mem::size_of::<W>(), self.layout.columns[w_col].size);
        debug_assert_eq!(std::mem::size_of::<R>(), self.layout.columns[r_col].size);
        let len = self.len;
        // SAFETY: distinct columns occupy disjoint byte ranges of the buffer,
        // so the two slices never alias; alignment as in column_slice.
        unsafe {
            let w = std::slice::from_raw_parts_mut(self.column_ptr_mut(w_col) as *mut W, len);
            let r = std::slice::from_raw_parts(self.column_ptr(r_col) as *const R, len);
            (w, r)
        }
    }

    /// Raw bytes of a column over the occupied rows (recorder path).
    pub fn column_bytes(&self, col: usize) -> &[u8] {
        let size = self.layout.columns[col].size;
        // SAFETY: len * size bytes from the column start are inside the buffer.
        unsafe { std::slice::from_raw_parts(self.column_ptr(col), self.len * size) }
    }

    /// Raw mutable bytes of a column over the occupied rows (playback path).
    pub fn column_bytes_mut(&mut self, col: usize) -> &mut [u8] {
        let size = self.layout.columns[col].size;
        // SAFETY: as column_bytes, exclusive through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.column_ptr_mut(col), self.len * size) }
    }

    /// Raw bytes of one row of one column.
    pub fn row_bytes(&self, col: usize, row: usize) -> &[u8] {
        debug_assert!(row < self.len);
        let size = self.layout.columns[col].size;
        &self.column_bytes(col)[row * size..(row + 1) * size]
    }

    /// Overwrite one row of one column from raw bytes and stamp versions.
    pub fn write_row_bytes(&mut self, col: usize, row: usize, bytes: &[u8], version: u64) {
        debug_assert!(row < self.len);
        let size = self.layout.columns[col].size;
        debug_assert_eq!(bytes.len(), size);
        self.column_bytes_mut(col)[row * size..(row + 1) * size].copy_from_slice(bytes);
        self.mark_column_written(col, version);
    }

    /// Read one value.
    pub fn value<T>(&self, col: usize, row: usize) -> &T {
        &self.column_slice::<T>(col)[row]
    }

    /// Overwrite one value and stamp versions.
    pub fn write_value<T: Copy>(&mut self, col: usize, row: usize, value: T, version: u64) {
        self.column_slice_mut::<T>(col)[row] = value;
        self.mark_column_written(col, version);
    }

    /// Tear down into the backing buffer for release to the allocator.
    pub fn into_buf(self) -> ChunkBuf {
        self.buf
    }
}

/// Copy the shared-column bytes of one row between chunks of different
/// archetypes (structural moves).
pub(crate) fn copy_row_intersection(
    src: &Chunk,
    src_row: usize,
    dst: &mut Chunk,
    dst_row: usize,
) {
    debug_assert!(src_row < src.len && dst_row < dst.len);
    for dst_col in 0..dst.layout.columns.len() {
        let (type_id, size) = {
            let column = &dst.layout.columns[dst_col];
            (column.type_id, column.size)
        };
        if size == 0 {
            continue;
        }
        if let Some(src_col) = src.layout.column_index(type_id) {
            let bytes = src.row_bytes(src_col, src_row);
            dst.column_bytes_mut(dst_col)[dst_row * size..(dst_row + 1) * size]
                .copy_from_slice(bytes);
        }
    }
}
