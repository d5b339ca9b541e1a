//! Integration tests for the seed scenarios (spec.md §8): build a world
//! directly (rather than going through `minixcompat::run_tool`, which
//! reads real environment variables) and drive the supervisor loop.

use minixcompat::cpu::{Cpu, ReferenceCpu};
use minixcompat::memory::{RESET_PC_ADDR, RESET_SSP_ADDR, STACK_BASE};
use minixcompat::message::{Layout, Message};
use minixcompat::supervisor::{self, Outcome};
use minixcompat::world::{ExecutionState, World};

fn fresh_world() -> World {
    let root = std::env::temp_dir().join(format!("minixcompat-it-{}", std::process::id()));
    std::fs::create_dir_all(&root).ok();
    World::new(root, "/".to_string(), false)
}

fn assemble_trap_program(world: &mut World, base: u32, d0: i16, d1: i16, a0: u32) -> u32 {
    let mut addr = base;
    world.memory.write_u16(addr, 0x7000 | (d0 as u16 & 0xff)).unwrap();
    addr += 2;
    world.memory.write_u16(addr, 0x7200 | (d1 as u16 & 0xff)).unwrap();
    addr += 2;
    world.memory.write_u16(addr, 0x207c).unwrap();
    addr += 2;
    world.memory.write_u32(addr, a0).unwrap();
    addr += 4;
    world.memory.write_u16(addr, 0x4e40).unwrap();
    addr + 2
}

#[test]
fn hello_aout_writes_to_stdout_and_exits_zero() {
    let mut world = fresh_world();
    let mut cpu = ReferenceCpu::new();
    let base = minixcompat::loader::EXECUTABLE_BASE;

    let msg_addr = 0x5000u32;
    world.memory.write_block(msg_addr + 100, b"hi\n").unwrap();
    let mut write_msg = Message::default();
    write_msg.m_type = 4;
    write_msg.set_m1_i1(1);
    write_msg.set_m1_i2(3);
    write_msg.set_m1_p1(msg_addr + 100);
    write_msg.write(&mut world.memory, msg_addr, Layout::Mess1).unwrap();

    let next = assemble_trap_program(&mut world, base, 3, 1, msg_addr);

    let mut exit_msg = Message::default();
    exit_msg.m_type = 1;
    exit_msg.set_m1_i1(0);
    exit_msg.write(&mut world.memory, msg_addr + 200, Layout::Mess1).unwrap();
    assemble_trap_program(&mut world, next, 3, 1, msg_addr + 200);

    world.memory.write_u32(RESET_PC_ADDR, base).unwrap();
    world.memory.write_u32(RESET_SSP_ADDR, STACK_BASE).unwrap();
    cpu.initialize();

    let outcome = supervisor::run(&mut world, &mut cpu, |w| {
        w.transition(ExecutionState::Ready);
        Ok(())
    });

    match outcome {
        Outcome::GuestExit(status) => assert_eq!(status, 0),
        Outcome::OsError => panic!("expected a clean guest exit"),
    }
    let reply = Message::read(&world.memory, msg_addr, Layout::Mess1).unwrap();
    assert_eq!(reply.m_type, 3, "write should report 3 bytes written");
}

#[test]
fn brk_respects_executable_limit() {
    let mut world = fresh_world();
    world.current_break = minixcompat::loader::EXECUTABLE_BASE;

    let addr = 0x6000u32;
    let mut msg = Message::default();
    msg.m_type = 17;
    msg.set_m1_p1(minixcompat::memory::EXECUTABLE_LIMIT);
    msg.write(&mut world.memory, addr, Layout::Mess1).unwrap();

    let trap = minixcompat::cpu::TrapRequest { func: 3, src_dest: 0, message_addr: addr };
    minixcompat::dispatch::dispatch(&mut world, trap);

    let reply = Message::read(&world.memory, addr, Layout::Mess2).unwrap();
    assert_ne!(reply.m_type, 0, "requesting the limit itself should fail");
}

#[test]
fn unknown_syscall_returns_failure_without_state_mutation() {
    let mut world = fresh_world();
    let addr = 0x8000u32;
    let mut msg = Message::default();
    msg.m_type = 54; // ioctl
    msg.write(&mut world.memory, addr, Layout::Mess1).unwrap();

    let trap = minixcompat::cpu::TrapRequest { func: 3, src_dest: 1, message_addr: addr };
    let d0 = minixcompat::dispatch::dispatch(&mut world, trap);
    assert_eq!(d0, 0xffff_ffff);
    let after = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    assert_eq!(after.m_type, 54, "message must be untouched on an unimplemented call");
}

#[test]
fn open_and_read_directory_yields_synthesized_dirents() {
    let mut world = fresh_world();
    let foo = world.paths.host_root().join("foo");
    std::fs::create_dir_all(&foo).unwrap();
    std::fs::write(foo.join("a"), b"").unwrap();
    std::fs::write(foo.join("b"), b"").unwrap();

    let open_addr = 0x7000u32;
    let name_addr = 0x7100u32;
    world.memory.write_block(name_addr, b"/foo\0").unwrap();
    let mut open_msg = Message::default();
    open_msg.m_type = 5;
    open_msg.set_m3_i1(4); // name length
    open_msg.set_m3_p1(name_addr);
    open_msg.write(&mut world.memory, open_addr, Layout::Mess3).unwrap();

    let trap = minixcompat::cpu::TrapRequest { func: 3, src_dest: 1, message_addr: open_addr };
    minixcompat::dispatch::dispatch(&mut world, trap);
    let opened = Message::read(&world.memory, open_addr, Layout::Mess1).unwrap();
    let fd = opened.m_type;
    assert!(fd >= 0, "open(\"/foo\") should succeed, got {fd}");

    // The host directory also carries "." and "..", so read one 16-byte
    // dirent at a time (as the guest is expected to) until the cache is
    // exhausted, and look only for "a" and "b" among the results.
    let read_addr = 0x7200u32;
    let buf_addr = 0x7300u32;
    let mut names = Vec::new();
    loop {
        let mut read_msg = Message::default();
        read_msg.m_type = 3;
        read_msg.set_m1_i1(fd);
        read_msg.set_m1_i2(16);
        read_msg.set_m1_p1(buf_addr);
        read_msg.write(&mut world.memory, read_addr, Layout::Mess1).unwrap();

        let trap = minixcompat::cpu::TrapRequest { func: 3, src_dest: 1, message_addr: read_addr };
        minixcompat::dispatch::dispatch(&mut world, trap);
        let read_reply = Message::read(&world.memory, read_addr, Layout::Mess1).unwrap();
        if read_reply.m_type != 16 {
            break;
        }
        let entry = world.memory.read_block(buf_addr, 16).unwrap();
        let inode = u16::from_be_bytes([entry[0], entry[1]]);
        assert_ne!(inode, 0, "existing entries must have a non-zero inode");
        let end = entry[2..].iter().position(|&b| b == 0).unwrap_or(14);
        names.push(String::from_utf8_lossy(&entry[2..2 + end]).into_owned());
    }
    assert!(names.contains(&"a".to_string()));
    assert!(names.contains(&"b".to_string()));
}

#[test]
fn fork_returns_child_pid_to_parent_and_wait_reports_exit_status() {
    // Calls the real host fork(2) directly through `ProcessTable::fork`
    // (not through `dispatch`, so the child branch below can `_exit`
    // immediately instead of running back into the test harness).
    let mut world = fresh_world();

    let child_guest_pid = match unsafe { world.processes.fork() }.unwrap() {
        minixcompat::process::ForkOutcome::Child => {
            unsafe { libc::_exit(7) };
        }
        minixcompat::process::ForkOutcome::Parent { child_guest_pid } => child_guest_pid,
    };
    assert!(child_guest_pid > 0, "parent should see a positive child guest pid");

    let wait_addr = 0x9100u32;
    let mut wait_msg = Message::default();
    wait_msg.m_type = 7;
    wait_msg.write(&mut world.memory, wait_addr, Layout::Mess1).unwrap();
    let trap = minixcompat::cpu::TrapRequest { func: 3, src_dest: 0, message_addr: wait_addr };
    minixcompat::dispatch::dispatch(&mut world, trap);
    let wait_reply = Message::read(&world.memory, wait_addr, Layout::Mess2).unwrap();
    assert_eq!(wait_reply.m_type, child_guest_pid);
    assert_eq!(wait_reply.m2_i1(), 0x0700, "exit code 7 belongs in the high byte");
}

#[test]
fn path_joining_matches_configured_root_and_cwd() {
    let root = std::env::temp_dir().join("opt-minix-it");
    let resolver = minixcompat::fs::PathResolver::new(root.clone(), "/usr/ast".to_string());
    assert_eq!(resolver.resolve("x.c"), root.join("usr/ast/x.c"));
    assert_eq!(resolver.resolve("/etc/passwd"), root.join("etc/passwd"));
}
