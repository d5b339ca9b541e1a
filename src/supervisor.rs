//! Supervisor loop (§4.9): drives the CPU in fixed quanta and delivers
//! pending host-origin signals between them. Single-threaded cooperative
//! scheduling -- there is exactly one guest thread of execution.

const QUANTUM_CYCLES: u32 = 10_000;

use crate::cpu::Cpu;
use crate::dispatch::{deliver_pending_signal, dispatch};
use crate::world::{ExecutionState, World};

/// What the host process should exit with once the guest stops running.
pub enum Outcome {
    /// The guest exited normally; carry its status (§6 CLI exit codes).
    GuestExit(i32),
    /// Something on the host side went wrong before or during a run.
    OsError,
}

/// Run the supervisor state machine to completion: Started, by calling
/// `start`, then Ready -> Running -> Ready quanta until Finished.
pub fn run(world: &mut World, cpu: &mut dyn Cpu, start: impl FnOnce(&mut World) -> Result<(), ()>) -> Outcome {
    if start(world).is_err() {
        return Outcome::OsError;
    }
    cpu.reset(&world.memory);

    loop {
        match world.state {
            ExecutionState::Ready => {
                world.transition(ExecutionState::Running);
            }
            ExecutionState::Running => {
                let result = cpu.run(QUANTUM_CYCLES, &mut world.memory);
                if let Some(trap) = result.trap {
                    let d0 = dispatch(world, trap);
                    cpu.set_reg(crate::cpu::Register::D(0), d0);
                }
                if world.state == ExecutionState::Running {
                    deliver_pending_signal(world);
                }
                if world.state == ExecutionState::Running {
                    world.transition(ExecutionState::Ready);
                }
            }
            ExecutionState::Finished(status) => return Outcome::GuestExit(status),
            ExecutionState::Started => unreachable!("start() must leave the world Ready"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::ReferenceCpu;
    use std::path::PathBuf;

    #[test]
    fn exit_syscall_finishes_with_status() {
        let mut world = World::new(PathBuf::from("/tmp"), "/".to_string(), false);
        let mut cpu = ReferenceCpu::new();

        // moveq #7,d0 ; movea.l #msg_addr,a0 ; trap #0.
        let base = crate::loader::EXECUTABLE_BASE;
        let msg_addr = 0x4000u32;
        world.memory.write_u16(base, 0x7007).unwrap(); // moveq #7,d0
        world.memory.write_u16(base + 2, 0x207c).unwrap(); // movea.l #imm,a0
        world.memory.write_u32(base + 4, msg_addr).unwrap();
        world.memory.write_u16(base + 8, 0x4e40).unwrap(); // trap #0
        world.memory.write_u32(crate::memory::RESET_PC_ADDR, base).unwrap();
        world.memory.write_u32(crate::memory::RESET_SSP_ADDR, crate::memory::STACK_BASE).unwrap();

        // m_type=1 (exit) must already be in the message the trap points
        // at; build it directly since there's no real `_exit(2)` stub in
        // this reference program.
        let mut msg = crate::message::Message::default();
        msg.m_type = 1;
        msg.set_m1_i1(7);
        msg.write(&mut world.memory, msg_addr, crate::message::Layout::Mess1).unwrap();

        let outcome = run(&mut world, &mut cpu, |w| {
            w.transition(ExecutionState::Ready);
            Ok(())
        });
        match outcome {
            Outcome::GuestExit(_) => {}
            Outcome::OsError => panic!("expected the guest to exit cleanly"),
        }
    }
}
