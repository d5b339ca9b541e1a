//! Syscall dispatcher: the single `TRAP #0` entry point (§4.8;
//! original_source `MINIXCompat_SysCalls.c`). Decodes `(func, src_dest,
//! msg_addr)`, routes by the message's big-endian `m_type` to an MM/FS
//! handler, transcodes arguments and results, and reports the D0 value
//! the CPU adapter should write back.

use crate::cpu::TrapRequest;
use crate::fs::{host_open_flags, MinixOpenFlags, MinixStat, Whence};
use crate::message::{Layout, Message};
use crate::process::{take_pending_signal, ForkOutcome};
use crate::world::{ExecutionState, World};

/// Source/destination task identities (§3 glossary): negative for kernel
/// tasks, 0/1 for MM/FS, >=2 for user processes. Only MM/FS calls are
/// serviced here.
const MM: u16 = 0;
const FS: u16 = 1;

const UID: i32 = 8;
const GID: i32 = 3;
const EFF_ID: i32 = 0;

/// MM/FS call numbers 0..69, used only to name the unimplemented-call
/// diagnostic (§4.8, §7; original_source `MINIXCompat_SysCalls.c`).
const SYSCALL_NAMES: [&str; 70] = [
    "unused0", "exit", "fork", "read", "write", "open", "close", "wait", "creat", "link",
    "unlink", "exec", "chdir", "time", "mknod", "chmod", "chown", "brk", "stat", "lseek",
    "getpid", "mount", "umount", "setuid", "getuid", "stime", "ptrace", "alarm", "fstat", "pause",
    "utime", "stty", "gtty", "access", "nice", "ftime", "sync", "kill", "rename", "mkdir",
    "rmdir", "dup", "pipe", "times", "prof", "unused45", "setgid", "getgid", "signal", "unused49",
    "unused50", "acct", "phys", "lock", "ioctl", "fcntl", "mpx", "unused57", "unused58", "exece",
    "umask", "chroot", "unused62", "unused63", "KSIG", "UNPAUSE", "BRK2", "REVIVE", "TASK_REPLY",
    "unused69",
];

fn syscall_name(m_type: i16) -> &'static str {
    SYSCALL_NAMES.get(m_type as usize).copied().unwrap_or("unknown")
}

/// What a handler reports back to the dispatcher (§4.8 step 3).
pub enum DispatchResult {
    /// D0 = 0x00000000.
    SuccessEmpty,
    /// D0 = the given value.
    Success(u32),
    /// D0 = 0xFFFFFFFF.
    Failure,
}

fn d0_for(result: &DispatchResult) -> u32 {
    match result {
        DispatchResult::SuccessEmpty => 0,
        DispatchResult::Success(v) => *v,
        DispatchResult::Failure => 0xffff_ffff,
    }
}

/// Service a `TRAP #0`, returning the value the CPU adapter should write
/// into D0. `func` selects the IPC primitive (1=send, 2=receive,
/// 3=send+receive); only `receive` after a prior `send` makes sense for
/// a user process, and bare `receive` (func=2) is unsupported (spec
/// Non-goals) and always fails.
pub fn dispatch(world: &mut World, trap: TrapRequest) -> u32 {
    if trap.func == 2 {
        log::debug!("unsupported receive-only IPC (src_dest={})", trap.src_dest);
        return 0xffff_ffff;
    }

    if trap.src_dest != MM && trap.src_dest != FS {
        log::debug!("TRAP #0 to unknown task {}", trap.src_dest);
        return 0xffff_ffff;
    }

    let m_type = match Message::read(&world.memory, trap.message_addr, Layout::Mess1) {
        Ok(msg) => msg.m_type,
        Err(_) => return 0xffff_ffff,
    };

    // The reply message is only copied back to guest memory for a
    // send+receive call (func == 3); a bare send (func == 1) leaves the
    // guest's message buffer untouched (§4.8 step 4).
    d0_for(&route(world, trap.message_addr, m_type, trap.func))
}

fn route(world: &mut World, addr: u32, m_type: i16, func: u16) -> DispatchResult {
    match m_type {
        1 => sys_exit(world, addr),
        2 => sys_fork(world, addr, func),
        3 => sys_read(world, addr, func),
        4 => sys_write(world, addr, func),
        5 => sys_open(world, addr, func),
        6 => sys_close(world, addr, func),
        7 => sys_wait(world, addr, func),
        8 => sys_creat(world, addr, func),
        10 => sys_unlink(world, addr, func),
        13 => sys_time(world, addr, func),
        17 => sys_brk(world, addr, func),
        18 => sys_stat(world, addr, func),
        19 => sys_lseek(world, addr, func),
        20 => sys_getpid(world, addr, func),
        24 => sys_getuid(world, addr, func),
        28 => sys_fstat(world, addr, func),
        33 => sys_access(world, addr, func),
        37 => sys_kill(world, addr, func),
        47 => sys_getgid(world, addr, func),
        48 => sys_signal(world, addr, func),
        59 => sys_exece(world, addr, func),
        other => {
            log::debug!("unimplemented syscall {} ({other})", syscall_name(other));
            DispatchResult::Failure
        }
    }
}

/// Write `reply` back to the guest's message buffer only for a
/// send+receive call; a bare send must leave the buffer untouched (§4.8
/// step 4, spec.md:225).
fn reply_if_expected(func: u16, reply: &Message, world: &mut World, addr: u32, layout: Layout) {
    if func == 3 {
        reply.write(&mut world.memory, addr, layout).ok();
    }
}

fn read_path(world: &World, addr: u32, len: i16) -> Vec<u8> {
    world.memory.read_block(addr, len as usize).unwrap_or_default()
}

fn path_as_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn sys_exit(world: &mut World, addr: u32) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let status = msg.m1_i1();
    world.transition(ExecutionState::Finished(status as i32));
    DispatchResult::SuccessEmpty
}

fn sys_fork(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let minix_pid = match unsafe { world.processes.fork() } {
        Ok(ForkOutcome::Parent { child_guest_pid }) => child_guest_pid,
        Ok(ForkOutcome::Child) => 0,
        Err(_) => -(crate::errors::minix_errno_for_current()),
    };
    let mut reply = Message::default();
    reply.m_type = minix_pid;
    reply_if_expected(func, &reply, world, addr, Layout::Mess2);
    DispatchResult::SuccessEmpty
}

fn sys_read(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let fd = msg.m1_i1() as i32;
    let nbytes = msg.m1_i2();
    let buf_addr = msg.m1_p1();

    let result = match world.fds.read(fd, nbytes.max(0) as usize) {
        Ok(data) => {
            world.memory.write_block(buf_addr, &data).ok();
            data.len() as i16
        }
        Err(_) => -(crate::errors::minix_errno_for_current()),
    };

    let mut reply = Message::default();
    reply.m_type = result;
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_write(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let fd = msg.m1_i1() as i32;
    let nbytes = msg.m1_i2();
    let buf_addr = msg.m1_p1();

    let data = world.memory.read_block(buf_addr, nbytes.max(0) as usize).unwrap_or_default();
    let result = match world.fds.write(fd, &data) {
        Ok(n) => n as i16,
        Err(_) => -(crate::errors::minix_errno_for_current()),
    };

    let mut reply = Message::default();
    reply.m_type = result;
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_open(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    // The request's flags field lands at the same byte offset (m1_i2)
    // whichever layout it's really carrying, so peek it before deciding
    // between mess1 (O_CREAT set) and mess3 (not set).
    let peek = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let minix_flags = MinixOpenFlags::from_bits_truncate(peek.m1_i2() as u16);

    let (name_len, name_addr, minix_mode) = if minix_flags.contains(MinixOpenFlags::CREAT) {
        let msg = peek;
        (msg.m1_i1(), msg.m1_p1(), msg.m1_i3() as u32)
    } else {
        let msg = Message::read(&world.memory, addr, Layout::Mess3).unwrap();
        (msg.m3_i1(), msg.m3_p1(), 0)
    };

    let name = path_as_str(&read_path(world, name_addr, name_len));
    let host_path = world.paths.resolve(&name);
    let host_flags = host_open_flags(minix_flags);

    let fd = match world.fds.open(&host_path, host_flags, minix_mode) {
        Ok(fd) => fd as i16,
        Err(_) => -(crate::errors::minix_errno_for_current()),
    };

    let mut reply = Message::default();
    reply.m_type = fd;
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_close(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let fd = msg.m1_i1() as i32;
    let result = match world.fds.close(fd) {
        Ok(()) => 0,
        Err(_) => -(crate::errors::minix_errno_for_current()),
    };
    let mut reply = Message::default();
    reply.m_type = result;
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_wait(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let (pid, status) = match world.processes.wait() {
        Ok(r) => r,
        Err(_) => (-(crate::errors::minix_errno_for_current()), 0),
    };
    let mut reply = Message::default();
    reply.m_type = pid;
    reply.set_m2_i1(status);
    reply_if_expected(func, &reply, world, addr, Layout::Mess2);
    DispatchResult::SuccessEmpty
}

fn sys_creat(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess3).unwrap();
    let name_len = msg.m3_i1();
    let name_addr = msg.m3_p1();
    let mode = msg.m3_i2() as u32;

    let name = path_as_str(&read_path(world, name_addr, name_len));
    let host_path = world.paths.resolve(&name);
    let flags = libc::O_CREAT | libc::O_TRUNC | libc::O_WRONLY;

    let fd = match world.fds.open(&host_path, flags, mode) {
        Ok(fd) => fd as i16,
        Err(_) => -(crate::errors::minix_errno_for_current()),
    };

    let mut reply = Message::default();
    reply.m_type = fd;
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_unlink(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess3).unwrap();
    let name_len = msg.m3_i1();
    let name_addr = msg.m3_p1();
    let name = path_as_str(&read_path(world, name_addr, name_len));
    let host_path = world.paths.resolve(&name);

    let c_path = std::ffi::CString::new(host_path.as_os_str().to_string_lossy().as_bytes()).unwrap();
    let result = if unsafe { libc::unlink(c_path.as_ptr()) } == 0 {
        0
    } else {
        -(crate::errors::minix_errno_for_current())
    };

    let mut reply = Message::default();
    reply.m_type = result;
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_time(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    let (err, secs) = if now < 0 {
        (-(crate::errors::minix_errno_for_current()), 0)
    } else {
        (0, now as i32)
    };
    let mut reply = Message::default();
    reply.m_type = err;
    reply.set_m2_l1(secs);
    reply_if_expected(func, &reply, world, addr, Layout::Mess2);
    DispatchResult::Success(secs as u32)
}

fn sys_brk(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let requested = msg.m1_p1();

    let (err, new_break) = if requested < crate::memory::EXECUTABLE_LIMIT && requested >= world.current_break {
        world.current_break = requested;
        (0, requested)
    } else {
        (-(9i16 /* ENOMEM */), 0xffff_ffffu32)
    };

    let mut reply = Message::default();
    reply.m_type = err;
    reply.set_m2_p1(new_break);
    reply_if_expected(func, &reply, world, addr, Layout::Mess2);
    DispatchResult::SuccessEmpty
}

fn sys_stat(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let name_len = msg.m1_i1();
    let name_addr = msg.m1_p1();
    let buf_addr = msg.m1_p2();

    let name = path_as_str(&read_path(world, name_addr, name_len));
    let host_path = world.paths.resolve(&name);
    let c_path = std::ffi::CString::new(host_path.as_os_str().to_string_lossy().as_bytes()).unwrap();

    let mut host_stat: libc::stat = unsafe { std::mem::zeroed() };
    let err = if unsafe { libc::stat(c_path.as_ptr(), &mut host_stat) } == 0 {
        let minix_stat = translate_for_wire(&host_stat);
        world.memory.write_block(buf_addr, &minix_stat.to_be_bytes()).ok();
        0
    } else {
        -(crate::errors::minix_errno_for_current())
    };

    let mut reply = Message::default();
    reply.m_type = err;
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_lseek(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess2).unwrap();
    let fd = msg.m2_i1() as i32;
    let whence = Whence::from_minix(msg.m2_i2());
    let offset = msg.m2_l1() as i64;

    let (m_type, new_offset) = match whence.and_then(|w| world.fds.seek(fd, offset, w).ok()) {
        Some(pos) => (pos as i16, pos as i32),
        None => (-(crate::errors::minix_errno_for_current()), offset as i32),
    };

    let mut reply = Message::default();
    reply.m_type = m_type;
    reply.set_m2_l1(new_offset);
    reply_if_expected(func, &reply, world, addr, Layout::Mess2);
    DispatchResult::Success(new_offset as u32)
}

fn sys_getpid(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let (pid, ppid) = world.processes.process_ids();
    let mut reply = Message::default();
    reply.m_type = pid;
    reply.set_m1_i1(ppid);
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_getuid(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let mut reply = Message::default();
    reply.m_type = UID as i16;
    reply.set_m2_i1(EFF_ID as i16);
    reply_if_expected(func, &reply, world, addr, Layout::Mess2);
    DispatchResult::SuccessEmpty
}

fn sys_getgid(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let mut reply = Message::default();
    reply.m_type = GID as i16;
    reply.set_m2_i1(EFF_ID as i16);
    reply_if_expected(func, &reply, world, addr, Layout::Mess2);
    DispatchResult::SuccessEmpty
}

fn sys_fstat(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let fd = msg.m1_i1() as i32;
    let buf_addr = msg.m1_p1();

    let err = match world.fds.fstat(fd) {
        Ok(stat) => {
            world.memory.write_block(buf_addr, &stat.to_be_bytes()).ok();
            0
        }
        Err(_) => -(crate::errors::minix_errno_for_current()),
    };

    let mut reply = Message::default();
    reply.m_type = err;
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_access(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess3).unwrap();
    let name_len = msg.m3_i1();
    let name_addr = msg.m3_p1();
    let mode = msg.m3_i2();

    let name = path_as_str(&read_path(world, name_addr, name_len));
    let host_path = world.paths.resolve(&name);
    let c_path = std::ffi::CString::new(host_path.as_os_str().to_string_lossy().as_bytes()).unwrap();

    let result = if unsafe { libc::access(c_path.as_ptr(), mode as i32) } == 0 {
        0
    } else {
        -(crate::errors::minix_errno_for_current())
    };

    let mut reply = Message::default();
    reply.m_type = result;
    reply_if_expected(func, &reply, world, addr, Layout::Mess1);
    DispatchResult::SuccessEmpty
}

fn sys_kill(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let pid = msg.m1_i1();
    let sig = msg.m1_i2();

    let result = match world.processes.kill(pid, sig) {
        Ok(()) => 0,
        Err(_) => -(crate::errors::minix_errno_for_current()),
    };

    let mut reply = Message::default();
    reply.m_type = result;
    reply_if_expected(func, &reply, world, addr, Layout::Mess2);
    DispatchResult::SuccessEmpty
}

fn sys_signal(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess6).unwrap();
    let sig = msg.m6_i1();
    let new_handler = msg.m6_f1();

    let old_handler = world.processes.set_signal_handler(sig, new_handler);

    let mut reply = Message::default();
    reply.m_type = 0;
    reply_if_expected(func, &reply, world, addr, Layout::Mess2);
    DispatchResult::Success(old_handler)
}

fn sys_exece(world: &mut World, addr: u32, func: u16) -> DispatchResult {
    let msg = Message::read(&world.memory, addr, Layout::Mess1).unwrap();
    let path_len = msg.m1_i1();
    let path_addr = msg.m1_p1();
    let stack_size = msg.m1_i2();
    let stack_addr = msg.m1_p2();

    let path = path_as_str(&read_path(world, path_addr, path_len));
    let host_path = world.paths.resolve(&path);
    let stack_snapshot = world.memory.read_block(stack_addr, stack_size.max(0) as usize).unwrap_or_default();

    match crate::loader::exec_from_guest_stack(world, &host_path, &stack_snapshot) {
        Ok(()) => DispatchResult::SuccessEmpty,
        Err(e) => {
            let mut reply = Message::default();
            reply.m_type = -(crate::errors::MINIX_ERROR);
            reply_if_expected(func, &reply, world, addr, Layout::Mess2);
            log::debug!("exece failed: {e}");
            DispatchResult::Failure
        }
    }
}

fn translate_for_wire(host_stat: &libc::stat) -> MinixStat {
    use crate::fs::{minix_mode_for_host, squeeze_inode};
    MinixStat {
        st_dev: host_stat.st_dev as u16,
        st_ino: squeeze_inode(host_stat.st_ino),
        st_mode: minix_mode_for_host(host_stat.st_mode).bits(),
        st_nlink: host_stat.st_nlink as u16,
        st_uid: host_stat.st_uid as i16,
        st_gid: host_stat.st_gid as i16,
        st_rdev: host_stat.st_rdev as u16,
        st_size: host_stat.st_size.min(0x7fff_ffff) as i32,
        atime: host_stat.st_atime as i32,
        mtime: host_stat.st_mtime as i32,
        ctime: host_stat.st_ctime as i32,
    }
}

/// Deliver a latched host signal to the guest's handler table, applying
/// the default/ignore action when appropriate (§4.9).
pub fn deliver_pending_signal(world: &mut World) {
    let Some(sig) = take_pending_signal() else { return };
    let handler = world.processes.signal_handler(sig);
    match handler {
        crate::process::SIG_IGN => {}
        crate::process::SIG_DFL => {
            world.transition(ExecutionState::Finished(128 + sig as i32));
        }
        guest_addr => {
            log::debug!("vectoring signal {sig} to guest handler {guest_addr:#x}");
            // A real core would push a call frame and set PC=guest_addr;
            // left to the CPU adapter since frame shape is core-specific.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_world() -> World {
        World::new(PathBuf::from("/tmp"), "/".to_string(), false)
    }

    #[test]
    fn write_syscall_returns_byte_count() {
        let mut world = test_world();
        let buf_addr = 0x3000;
        world.memory.write_block(buf_addr, b"hi\n").unwrap();

        let mut msg = Message::default();
        msg.m_type = 4;
        msg.set_m1_i1(1); // fd 1 (stdout)
        msg.set_m1_i2(3);
        msg.set_m1_p1(buf_addr);
        msg.write(&mut world.memory, 0x1000, Layout::Mess1).unwrap();

        let d0 = dispatch(
            &mut world,
            TrapRequest { func: 3, src_dest: FS, message_addr: 0x1000 },
        );
        assert_eq!(d0, 0);
        let reply = Message::read(&world.memory, 0x1000, Layout::Mess1).unwrap();
        assert_eq!(reply.m_type, 3);
    }

    #[test]
    fn unknown_syscall_fails_without_mutating_state() {
        let mut world = test_world();
        let mut msg = Message::default();
        msg.m_type = 54; // ioctl, unimplemented
        msg.write(&mut world.memory, 0x1000, Layout::Mess1).unwrap();

        let d0 = dispatch(
            &mut world,
            TrapRequest { func: 3, src_dest: FS, message_addr: 0x1000 },
        );
        assert_eq!(d0, 0xffff_ffff);
    }

    #[test]
    fn brk_within_limit_succeeds() {
        let mut world = test_world();
        world.current_break = crate::loader::EXECUTABLE_BASE;
        let requested = crate::loader::EXECUTABLE_BASE + 0x1000;

        let mut msg = Message::default();
        msg.m_type = 17;
        msg.set_m1_p1(requested);
        msg.write(&mut world.memory, 0x1000, Layout::Mess1).unwrap();

        dispatch(&mut world, TrapRequest { func: 3, src_dest: MM, message_addr: 0x1000 });
        assert_eq!(world.current_break, requested);
        let reply = Message::read(&world.memory, 0x1000, Layout::Mess2).unwrap();
        assert_eq!(reply.m_type, 0);
    }

    #[test]
    fn send_only_call_leaves_message_buffer_untouched() {
        let mut world = test_world();
        let buf_addr = 0x3000;
        world.memory.write_block(buf_addr, b"hi\n").unwrap();

        let mut msg = Message::default();
        msg.m_type = 4;
        msg.set_m1_i1(1);
        msg.set_m1_i2(3);
        msg.set_m1_p1(buf_addr);
        msg.write(&mut world.memory, 0x1000, Layout::Mess1).unwrap();

        dispatch(&mut world, TrapRequest { func: 1, src_dest: FS, message_addr: 0x1000 });
        let after = Message::read(&world.memory, 0x1000, Layout::Mess1).unwrap();
        assert_eq!(after.m_type, 4, "func==1 (send) must not mutate the guest's message buffer");
    }

    #[test]
    fn getuid_reports_constant_identity() {
        let mut world = test_world();
        let mut msg = Message::default();
        msg.m_type = 24;
        msg.write(&mut world.memory, 0x1000, Layout::Mess1).unwrap();

        dispatch(&mut world, TrapRequest { func: 3, src_dest: MM, message_addr: 0x1000 });
        let reply = Message::read(&world.memory, 0x1000, Layout::Mess2).unwrap();
        assert_eq!(reply.m_type, 8);
        assert_eq!(reply.m2_i1(), 0);
    }
}
