//! A MINIX 1.5 (Motorola 68000) user-mode compatibility layer: runs
//! unmodified MINIX a.out executables on a modern POSIX host by
//! combining a 68000 CPU adapter, the MINIX a.out loader, and a
//! message-based system-call translator that re-expresses MINIX MM/FS
//! IPC as host POSIX operations against a configured root directory.

pub mod config;
pub mod cpu;
pub mod dispatch;
pub mod errors;
pub mod fs;
pub mod loader;
pub mod memory;
pub mod message;
pub mod process;
pub mod supervisor;
pub mod world;

use cpu::{Cpu, ReferenceCpu};
use supervisor::Outcome;
use world::World;

/// Run a MINIX executable the way the CLI does: build a world rooted at
/// the configured directory, load `tool_path` (a host filesystem path to
/// the a.out file) as the initial process, and drive it to completion.
/// `tool_path` becomes guest `argv[0]`.
pub fn run_tool(tool_path: &str, tool_args: &[String], debug: bool) -> Outcome {
    let root = config::root_dir();
    let guest_cwd = config::initial_guest_cwd(&root);
    let mut world = World::new(root, guest_cwd, debug);
    let mut cpu = ReferenceCpu::new();
    cpu.initialize();

    let host_path = std::path::PathBuf::from(tool_path);
    let mut argv = vec![tool_path.to_string()];
    argv.extend(tool_args.iter().cloned());

    supervisor::run(&mut world, &mut cpu, |w| {
        loader::exec_from_host_launch(w, &host_path, &argv).map_err(|e| {
            log::error!("failed to load {tool_path}: {e}");
        })
    })
}
