//! The single mutable "world" value that every subsystem borrows (§9
//! design note): guest memory, fd table, process table, path resolver,
//! execution state, and the current break. Bundling it here lets tests
//! instantiate isolated worlds instead of sharing process-wide globals.

use crate::cpu::Cpu;
use crate::fs::FdTable;
use crate::loader::EXECUTABLE_BASE;
use crate::memory::GuestMemory;
use crate::process::ProcessTable;

use std::path::PathBuf;

/// The supervisor's state machine (§4.9). Allowed transitions: Started
/// -> Ready, Ready -> Running, Running -> Ready, Running -> Finished,
/// Finished -> Finished. Any other transition is a programmer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Started,
    Ready,
    Running,
    Finished(i32),
}

pub struct World {
    pub memory: GuestMemory,
    pub fds: FdTable,
    pub processes: ProcessTable,
    pub paths: crate::fs::PathResolver,
    pub state: ExecutionState,
    pub current_break: u32,
    pub debug: bool,
}

impl World {
    pub fn new(root: PathBuf, guest_cwd: String, debug: bool) -> Self {
        World {
            memory: GuestMemory::new(),
            fds: FdTable::new(),
            processes: ProcessTable::new(),
            paths: crate::fs::PathResolver::new(root, guest_cwd),
            state: ExecutionState::Started,
            current_break: EXECUTABLE_BASE,
            debug,
        }
    }

    /// Move to a new execution state, panicking on a transition the
    /// state machine disallows (§4.9).
    pub fn transition(&mut self, next: ExecutionState) {
        let allowed = matches!(
            (self.state, next),
            (ExecutionState::Started, ExecutionState::Ready)
                | (ExecutionState::Ready, ExecutionState::Running)
                | (ExecutionState::Running, ExecutionState::Ready)
                | (ExecutionState::Running, ExecutionState::Finished(_))
                | (ExecutionState::Finished(_), ExecutionState::Finished(_))
        );
        assert!(allowed, "illegal execution state transition {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

pub fn drive_cpu_reset(cpu: &mut dyn Cpu, world: &World) {
    cpu.reset(&world.memory);
}
