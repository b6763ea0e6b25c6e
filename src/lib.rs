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

//! FDP kernel - data-oriented ECS runtime
//!
//! Archetype chunk storage with dual-tier components, versioned change
//! detection, deterministic queries, a phase scheduler, and a flight
//! recorder with random-access playback.

pub mod archetype;
pub mod chunk;
pub mod command;
pub mod component;
pub mod entity;
pub mod error;
pub mod event;
pub mod managed;
pub mod mask;
pub mod query;
pub mod repository;
pub mod schedule;
pub mod time;

// Capture & replay
pub mod playback;
pub mod recorder;

// Re-exports for convenience
pub use command::{CommandBuffer, EntityTarget, PendingEntity};
pub use component::{
    ComponentDescriptor, ComponentKind, ComponentTypeId, DataPolicy, ManagedComponent,
    TypeRegistry, UnmanagedComponent,
};
pub use entity::{Entity, EntityLocation, Lifecycle};
pub use error::{FdpError, Result};
pub use event::EventBus;
pub use mask::TypeMask;
pub use playback::Replay;
pub use query::{ChunkMut, ChunkRef, CompiledQuery, QueryBuilder, RowRef, RowRefMut};
pub use recorder::{FlightRecorder, FrameKind, RecorderConfig};
pub use repository::Repository;
pub use schedule::{BoxedSystem, Phase, Scheduler, System, SystemAccess};
pub use time::GlobalTime;

#[cfg(test)]
mod tests;
