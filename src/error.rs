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

//! Error types

use std::fmt;

/// Kernel error type
#[derive(Debug, Clone)]
pub enum FdpError {
    /// Entity not found or handle generation is stale
    EntityNotFound,

    /// Component not present on the entity
    ComponentNotFound,

    /// Component type was never registered
    TypeNotRegistered(&'static str),

    /// Component type registered twice
    DuplicateRegistration(&'static str),

    /// More unmanaged component types than the archetype mask can hold
    TypeLimitExceeded,

    /// Typed column access with a mismatching component type
    TypeMismatch,

    /// Component layout cannot be placed in a chunk
    LayoutError(String),

    /// Host allocator refused a chunk allocation
    OutOfMemory,

    /// Command buffer error
    CommandError(String),

    /// Two systems in the same phase conflict without an ordering edge
    AccessConflict(String),

    /// System dependency cycle or unknown dependency target
    ScheduleError(String),

    /// Recorder failure (worker error, capture after failure)
    RecorderError(String),

    /// Replay failure (seek out of range, apply on missing archetype)
    ReplayError(String),

    /// Bad magic, version or truncated frame data
    FormatError(String),

    /// IO error (file operations, etc.)
    IoError(String),
}

impl fmt::Display for FdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdpError::EntityNotFound => write!(f, "Entity not found"),
            FdpError::ComponentNotFound => write!(f, "Component not found"),
            FdpError::TypeNotRegistered(name) => write!(f, "Component type not registered: {name}"),
            FdpError::DuplicateRegistration(name) => {
                write!(f, "Component type registered twice: {name}")
            }
            FdpError::TypeLimitExceeded => {
                write!(f, "Unmanaged component type limit exceeded (max 256)")
            }
            FdpError::TypeMismatch => write!(f, "Component type mismatch"),
            FdpError::LayoutError(msg) => write!(f, "Chunk layout error: {msg}"),
            FdpError::OutOfMemory => write!(f, "Chunk allocation failed: out of memory"),
            FdpError::CommandError(msg) => write!(f, "Command error: {msg}"),
            FdpError::AccessConflict(msg) => write!(f, "Access conflict: {msg}"),
            FdpError::ScheduleError(msg) => write!(f, "Schedule error: {msg}"),
            FdpError::RecorderError(msg) => write!(f, "Recorder error: {msg}"),
            FdpError::ReplayError(msg) => write!(f, "Replay error: {msg}"),
            FdpError::FormatError(msg) => write!(f, "Format error: {msg}"),
            FdpError::IoError(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for FdpError {}

impl From<std::io::Error> for FdpError {
    fn from(err: std::io::Error) -> Self {
        FdpError::IoError(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FdpError>;
