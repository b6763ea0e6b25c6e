//! Phase scheduler: system lifecycle, ordering and tick advance.
//!
//! Systems declare a phase and optional component read/write sets. Within a
//! phase, execution order is insertion order unless an explicit dependency
//! reorders it (topological sort). Two systems of the same phase with
//! conflicting access and no ordering edge between them abort
//! initialization; the permission model keeps phases safely parallelizable
//! even though this executor runs them serially.

use std::any::TypeId;
use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::command::CommandBuffer;
use crate::error::{FdpError, Result};
use crate::repository::Repository;

/// Coarse execution slots, ran in declaration order every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    PreSimulation = 0,
    NetworkReceive = 1,
    Simulation = 2,
    PostSimulation = 3,
    Presentation = 4,
}

impl Phase {
    /// All phases in execution order
    pub const ALL: [Phase; 5] = [
        Phase::PreSimulation,
        Phase::NetworkReceive,
        Phase::Simulation,
        Phase::PostSimulation,
        Phase::Presentation,
    ];
}

/// Declared component access of a system
#[derive(Debug, Clone, Default)]
pub struct SystemAccess {
    pub reads: Vec<TypeId>,
    pub writes: Vec<TypeId>,
}

impl SystemAccess {
    /// Create empty access
    pub fn empty() -> Self {
        Self::default()
    }

    /// Declare a read-only component
    pub fn read<T: 'static>(mut self) -> Self {
        self.reads.push(TypeId::of::<T>());
        self
    }

    /// Declare a read-write component
    pub fn write<T: 'static>(mut self) -> Self {
        self.writes.push(TypeId::of::<T>());
        self
    }

    /// Check if conflicts with another access
    pub fn conflicts_with(&self, other: &SystemAccess) -> bool {
        // Write-write conflicts
        for w1 in &self.writes {
            for w2 in &other.writes {
                if w1 == w2 {
                    return true;
                }
            }
        }

        // Write-read conflicts
        for w in &self.writes {
            for r in &other.reads {
                if w == r {
                    return true;
                }
            }
        }

        // Read-write conflicts
        for r in &self.reads {
            for w in &other.writes {
                if r == w {
                    return true;
                }
            }
        }

        false
    }
}

/// System trait
pub trait System: Send + Sync {
    /// Get system name
    fn name(&self) -> &'static str;

    /// Phase this system runs in
    fn phase(&self) -> Phase;

    /// Declared component access; enforced at scheduler initialization
    fn access(&self) -> SystemAccess {
        SystemAccess::empty()
    }

    /// Run once per tick. Structural edits go through the command buffer,
    /// which plays back when the system returns successfully.
    fn run(&mut self, repo: &mut Repository, commands: &mut CommandBuffer) -> Result<()>;
}

/// Boxed system
pub type BoxedSystem = Box<dyn System>;

struct SystemEntry {
    system: BoxedSystem,
    phase: Phase,
    access: SystemAccess,
    after: Vec<String>,
}

/// Phase scheduler driving the per-tick sequence.
pub struct Scheduler {
    entries: Vec<SystemEntry>,
    /// Execution order per phase, set by initialize
    plan: Option<Vec<Vec<usize>>>,
    commands: CommandBuffer,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            plan: None,
            commands: CommandBuffer::new(),
        }
    }

    /// Add a system; order within its phase is insertion order.
    pub fn add_system(&mut self, system: BoxedSystem) {
        let phase = system.phase();
        let access = system.access();
        self.entries.push(SystemEntry {
            system,
            phase,
            access,
            after: Vec::new(),
        });
        self.plan = None;
    }

    /// Add a system that must run after the named system.
    pub fn add_system_after(&mut self, system: BoxedSystem, after: &str) {
        let phase = system.phase();
        let access = system.access();
        self.entries.push(SystemEntry {
            system,
            phase,
            access,
            after: vec![after.to_string()],
        });
        self.plan = None;
    }

    /// Declare an additional ordering edge on an already-added system.
    pub fn order_after(&mut self, system: &str, after: &str) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.system.name() == system)
            .ok_or_else(|| FdpError::ScheduleError(format!("unknown system '{system}'")))?;
        self.entries[idx].after.push(after.to_string());
        self.plan = None;
        Ok(())
    }

    /// Number of registered systems
    pub fn system_count(&self) -> usize {
        self.entries.len()
    }

    /// Validate access declarations and build the per-phase execution order.
    ///
    /// Fails on unknown dependency targets, dependency cycles, and
    /// same-phase access conflicts with no ordering edge between them.
    pub fn initialize(&mut self) -> Result<()> {
        let mut plan: Vec<Vec<usize>> = Vec::with_capacity(Phase::ALL.len());

        for phase in Phase::ALL {
            let members: Vec<usize> = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.phase == phase)
                .map(|(i, _)| i)
                .collect();

            // Dependency edges within the phase (from prerequisite to dependent)
            let mut edges: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
            let mut in_degree: FxHashMap<usize, usize> = FxHashMap::default();
            for &idx in &members {
                in_degree.insert(idx, 0);
            }
            for &idx in &members {
                for name in &self.entries[idx].after {
                    let target = self
                        .entries
                        .iter()
                        .position(|e| e.system.name() == name.as_str())
                        .ok_or_else(|| {
                            FdpError::ScheduleError(format!("unknown dependency '{name}'"))
                        })?;
                    match self.entries[target].phase.cmp(&phase) {
                        std::cmp::Ordering::Less => {} // Earlier phase: already ordered
                        std::cmp::Ordering::Equal => {
                            edges.entry(target).or_default().push(idx);
                            *in_degree.get_mut(&idx).expect("member") += 1;
                        }
                        std::cmp::Ordering::Greater => {
                            return Err(FdpError::ScheduleError(format!(
                                "system '{}' cannot run after '{name}' of a later phase",
                                self.entries[idx].system.name()
                            )));
                        }
                    }
                }
            }

            // Kahn's algorithm, stable by insertion order
            let mut queue: VecDeque<usize> = members
                .iter()
                .copied()
                .filter(|idx| in_degree[idx] == 0)
                .collect();
            let mut ordered = Vec::with_capacity(members.len());
            while let Some(idx) = queue.pop_front() {
                ordered.push(idx);
                if let Some(dependents) = edges.get(&idx) {
                    for &dep in dependents {
                        let degree = in_degree.get_mut(&dep).expect("member");
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dep);
                        }
                    }
                }
            }
            if ordered.len() != members.len() {
                return Err(FdpError::ScheduleError(format!(
                    "dependency cycle among systems of phase {phase:?}"
                )));
            }

            self.check_conflicts(&members, &edges, phase)?;
            plan.push(ordered);
        }

        self.plan = Some(plan);
        Ok(())
    }

    /// Unordered same-phase pairs must not conflict.
    fn check_conflicts(
        &self,
        members: &[usize],
        edges: &FxHashMap<usize, Vec<usize>>,
        phase: Phase,
    ) -> Result<()> {
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                if reachable(edges, a, b) || reachable(edges, b, a) {
                    continue;
                }
                if self.entries[a].access.conflicts_with(&self.entries[b].access) {
                    return Err(FdpError::AccessConflict(format!(
                        "'{}' and '{}' in phase {phase:?} access the same component without an ordering edge",
                        self.entries[a].system.name(),
                        self.entries[b].system.name(),
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run one tick: advance the version, run phases in order, swap event
    /// buffers after PostSimulation, prune after Presentation.
    ///
    /// A failing system discards its command buffer and aborts the tick; no
    /// further phases execute.
    pub fn tick(&mut self, repo: &mut Repository, dt: f32) -> Result<()> {
        if self.plan.is_none() {
            self.initialize()?;
        }

        repo.advance_frame(dt);

        let plan = self.plan.take().expect("initialized plan");
        let result = self.run_phases(repo, &plan);
        self.plan = Some(plan);
        result?;

        repo.prune();
        Ok(())
    }

    fn run_phases(&mut self, repo: &mut Repository, plan: &[Vec<usize>]) -> Result<()> {
        for (phase, order) in Phase::ALL.iter().zip(plan) {
            for &idx in order {
                self.commands.clear();
                let entry = &mut self.entries[idx];
                match entry.system.run(repo, &mut self.commands) {
                    Ok(()) => self.commands.playback(repo)?,
                    Err(err) => {
                        // Commands recorded by a failing system are discarded.
                        self.commands.clear();
                        return Err(err);
                    }
                }
            }
            if *phase == Phase::PostSimulation {
                repo.swap_event_buffers();
            }
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn reachable(edges: &FxHashMap<usize, Vec<usize>>, from: usize, to: usize) -> bool {
    let mut stack = vec![from];
    let mut seen = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if let Some(next) = edges.get(&node) {
            for &n in next {
                if !seen.contains(&n) {
                    seen.push(n);
                    stack.push(n);
                }
            }
        }
    }
    false
}
