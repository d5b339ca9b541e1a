//! Process layer: guest/host PID table, fork/wait, signal mapping, and
//! argv/envp frame construction (§4.7; original_source
//! `MINIXCompat_Processes.h`).

use crate::memory::{GuestMemory, MemoryError, STACK_BASE};
use thiserror::Error;

pub type MinixPid = i16;
pub type MinixSignal = i16;

pub const SIG_DFL: u32 = 0;
pub const SIG_IGN: u32 = 1;
pub const SIG_ERR: u32 = 0xffff_ffff;

const SIGNAL_COUNT: usize = 16;

/// Guest signal number -> host `libc` signal number, 1-indexed (§4.7).
/// `SIGUNUSED` (7) maps to `SIGSYS` (Linux has no `SIGEMT`, the BSD/macOS
/// signal the source itself maps this slot to) and `SIGSTKFLT` (16) to
/// `SIGXCPU`, matching the source's arbitrary choices rather than
/// anything MINIX itself defines for those slots.
const HOST_SIGNAL: [i32; SIGNAL_COUNT] = [
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGILL,
    libc::SIGTRAP,
    libc::SIGABRT,
    libc::SIGSYS,
    libc::SIGFPE,
    libc::SIGKILL,
    libc::SIGUSR1,
    libc::SIGSEGV,
    libc::SIGUSR2,
    libc::SIGPIPE,
    libc::SIGALRM,
    libc::SIGTERM,
    libc::SIGXCPU,
];

pub fn host_signal_for_minix(minix_signal: MinixSignal) -> Option<i32> {
    HOST_SIGNAL.get((minix_signal - 1) as usize).copied()
}

pub fn minix_signal_for_host(host_signal: i32) -> Option<MinixSignal> {
    HOST_SIGNAL
        .iter()
        .position(|&s| s == host_signal)
        .map(|i| (i + 1) as MinixSignal)
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no free process table slot")]
    TableFull,
    #[error("unknown guest pid {0}")]
    UnknownPid(MinixPid),
    #[error("host fork failed: {0}")]
    ForkFailed(std::io::Error),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

type Result<T> = std::result::Result<T, ProcessError>;

#[derive(Debug, Clone, Copy)]
struct PidEntry {
    host_pid: i32,
    guest_pid: MinixPid,
}

/// What a forked child should do: the caller branches on this to decide
/// whether it's still running as the guest's current process or has just
/// become a brand new one.
pub enum ForkOutcome {
    Parent { child_guest_pid: MinixPid },
    Child,
}

/// Bidirectional guest/host PID table, fork/wait bookkeeping, and the
/// per-process signal handler table (§3, §4.7).
pub struct ProcessTable {
    slots: Vec<Option<PidEntry>>,
    next_guest_pid: MinixPid,
    signal_handlers: [u32; SIGNAL_COUNT],
}

impl ProcessTable {
    /// Slot 0 is "self", slot 1 is "parent". The paternity chain mimics
    /// init -> sh -> getty -> login -> sh -> self (§3).
    pub fn new() -> Self {
        let mut slots = vec![None; 2];
        slots[0] = Some(PidEntry { host_pid: std::process::id() as i32, guest_pid: 7 });
        slots[1] = Some(PidEntry { host_pid: unsafe { libc::getppid() }, guest_pid: 6 });
        ProcessTable { slots, next_guest_pid: 8, signal_handlers: [SIG_DFL; SIGNAL_COUNT] }
    }

    pub fn process_ids(&self) -> (MinixPid, MinixPid) {
        (self.slots[0].unwrap().guest_pid, self.slots[1].unwrap().guest_pid)
    }

    fn reserve_slot(&mut self) -> usize {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            return idx;
        }
        let grown = ((self.slots.len() as f64 * 1.5).ceil() as usize).max(self.slots.len() + 1);
        self.slots.resize(grown, None);
        self.slots.iter().position(|s| s.is_none()).expect("just grew the table")
    }

    fn host_pid_for(&self, guest_pid: MinixPid) -> Option<i32> {
        self.slots.iter().flatten().find(|e| e.guest_pid == guest_pid).map(|e| e.host_pid)
    }

    /// Fork the host process. Reserves a table slot and picks the next
    /// guest pid *before* calling host `fork`, so both parent and child
    /// agree on the child's guest pid without further coordination.
    ///
    /// # Safety
    /// Calls host `fork(2)` directly; the caller must be prepared to run
    /// in either the parent or the child process afterwards.
    pub unsafe fn fork(&mut self) -> Result<ForkOutcome> {
        let slot_idx = self.reserve_slot();
        let child_guest_pid = self.next_guest_pid;

        let host_result = libc::fork();
        if host_result < 0 {
            self.slots[slot_idx] = None;
            return Err(ProcessError::ForkFailed(std::io::Error::last_os_error()));
        }
        self.next_guest_pid += 1;

        if host_result == 0 {
            // Child: old self becomes the new parent entry, and we mint a
            // fresh self entry with our own host pid.
            let old_self = self.slots[0];
            self.slots[slot_idx] = old_self;
            self.slots[1] = self.slots[0];
            self.slots[0] = Some(PidEntry { host_pid: std::process::id() as i32, guest_pid: child_guest_pid });
            Ok(ForkOutcome::Child)
        } else {
            self.slots[slot_idx] = Some(PidEntry { host_pid: host_result, guest_pid: child_guest_pid });
            Ok(ForkOutcome::Parent { child_guest_pid })
        }
    }

    /// Wait for any child, returning its guest pid and MINIX-encoded
    /// status.
    pub fn wait(&mut self) -> Result<(MinixPid, i16)> {
        let mut host_status: i32 = 0;
        let reaped_host_pid = unsafe { libc::wait(&mut host_status) };
        if reaped_host_pid < 0 {
            return Err(ProcessError::ForkFailed(std::io::Error::last_os_error()));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| matches!(s, Some(e) if e.host_pid == reaped_host_pid))
            .ok_or(ProcessError::UnknownPid(0))?;
        let guest_pid = slot.unwrap().guest_pid;
        *slot = None;
        Ok((guest_pid, encode_wait_status(host_status)))
    }

    pub fn signal_handler(&self, minix_signal: MinixSignal) -> u32 {
        self.signal_handlers[(minix_signal - 1) as usize]
    }

    /// Install a handler, returning the previous one.
    pub fn set_signal_handler(&mut self, minix_signal: MinixSignal, handler: u32) -> u32 {
        let idx = (minix_signal - 1) as usize;
        let previous = self.signal_handlers[idx];
        self.signal_handlers[idx] = handler;
        if let Some(host_signal) = host_signal_for_minix(minix_signal) {
            install_host_latch(host_signal);
        }
        previous
    }

    /// Send a signal to a guest process. Only positive guest pids are
    /// supported; unknown ones map to `ESRCH`.
    pub fn kill(&self, guest_pid: MinixPid, minix_signal: MinixSignal) -> Result<()> {
        if guest_pid <= 0 {
            return Err(ProcessError::UnknownPid(guest_pid));
        }
        let host_pid = self.host_pid_for(guest_pid).ok_or(ProcessError::UnknownPid(guest_pid))?;
        let host_signal = host_signal_for_minix(minix_signal).unwrap_or(0);
        if unsafe { libc::kill(host_pid, host_signal) } != 0 {
            return Err(ProcessError::ForkFailed(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a host `wait(2)` status the way the MINIX convention expects:
/// low byte 0 = exited (status in high byte), low byte 0o177 = stopped
/// (stop signal in high byte). For "signaled", the source shifts the
/// signal into the *high* byte rather than following MINIX's own
/// documented low-byte convention; kept for bug compatibility (spec.md
/// §9 item 5) rather than "fixed" to match the MINIX manual.
fn encode_wait_status(host_status: i32) -> i16 {
    if libc::WIFEXITED(host_status) {
        (libc::WEXITSTATUS(host_status) as i16) << 8
    } else if libc::WIFSTOPPED(host_status) {
        0o177 | ((libc::WSTOPSIG(host_status) as i16) << 8)
    } else {
        let term_signal = libc::WTERMSIG(host_status);
        let minix_signal = minix_signal_for_host(term_signal).unwrap_or(0);
        minix_signal << 8
    }
}

/// The latched pending-signal slot (§4.9, §9 item 2: simultaneous
/// signals coalesce into this single integer, last writer wins).
static PENDING_SIGNAL: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(0);

extern "C" fn latch_signal(signal: i32) {
    PENDING_SIGNAL.store(signal, std::sync::atomic::Ordering::SeqCst);
}

fn install_host_latch(host_signal: i32) {
    unsafe {
        libc::signal(host_signal, latch_signal as *const () as libc::sighandler_t);
    }
}

/// Take and clear whichever host signal last fired, if any, translated
/// to its guest number.
pub fn take_pending_signal() -> Option<MinixSignal> {
    let raw = PENDING_SIGNAL.swap(0, std::sync::atomic::Ordering::SeqCst);
    if raw == 0 {
        None
    } else {
        minix_signal_for_host(raw)
    }
}

/// Write the argv/envp frame at [`STACK_BASE`] (§4.7): argc, then the
/// argv pointer array (NULL-terminated), then the envp pointer array
/// (NULL-terminated), then the string bytes themselves, each padded to a
/// multiple of 4 bytes, all in guest byte order. Returns the guest stack
/// pointer to resume at.
pub fn write_argv_envp_frame(mem: &mut GuestMemory, argv: &[&str], envp: &[&str]) -> Result<u32> {
    let mut strings = Vec::new();
    for s in argv.iter().chain(envp.iter()) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        strings.push(bytes);
    }
    let strings_len: usize = strings.iter().map(|b| b.len()).sum();

    let pointer_table_len = 4 + (argv.len() + 1) * 4 + (envp.len() + 1) * 4;
    let frame_len = pointer_table_len + strings_len;
    let frame_start = STACK_BASE - frame_len as u32;

    let mut string_addr = frame_start + pointer_table_len as u32;
    let mut cursor = frame_start;

    mem.write_u32(cursor, argv.len() as u32)?;
    cursor += 4;

    let mut argv_addrs = Vec::with_capacity(argv.len());
    for s in &strings[..argv.len()] {
        argv_addrs.push(string_addr);
        string_addr += s.len() as u32;
    }
    for addr in &argv_addrs {
        mem.write_u32(cursor, *addr)?;
        cursor += 4;
    }
    mem.write_u32(cursor, 0)?;
    cursor += 4;

    let mut envp_addrs = Vec::with_capacity(envp.len());
    for s in &strings[argv.len()..] {
        envp_addrs.push(string_addr);
        string_addr += s.len() as u32;
    }
    for addr in &envp_addrs {
        mem.write_u32(cursor, *addr)?;
        cursor += 4;
    }
    mem.write_u32(cursor, 0)?;
    cursor += 4;

    for s in &strings {
        mem.write_block(cursor, s)?;
        cursor += s.len() as u32;
    }

    Ok(frame_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_table_is_bidirectional_for_mapped_range() {
        for minix_signal in 1..=16i16 {
            let host = host_signal_for_minix(minix_signal).unwrap();
            assert_eq!(minix_signal_for_host(host), Some(minix_signal));
        }
    }

    #[test]
    fn wait_status_exited_places_code_in_high_byte() {
        let status = unsafe { exit_status(7) };
        assert_eq!(encode_wait_status(status), 0x0700);
    }

    #[test]
    fn process_table_starts_with_paternity_chain() {
        let table = ProcessTable::new();
        let (self_pid, parent_pid) = table.process_ids();
        assert_eq!(self_pid, 7);
        assert_eq!(parent_pid, 6);
    }

    #[test]
    fn argv_envp_frame_layout_is_guest_addressable() {
        let mut mem = GuestMemory::new();
        let sp = write_argv_envp_frame(&mut mem, &["prog", "arg1"], &["HOME=/"]).unwrap();
        assert_eq!(mem.read_u32(sp).unwrap(), 2);
        let argv0 = mem.read_u32(sp + 4).unwrap();
        let argv1 = mem.read_u32(sp + 8).unwrap();
        let argv_terminator = mem.read_u32(sp + 12).unwrap();
        assert_eq!(argv_terminator, 0);
        let envp0 = mem.read_u32(sp + 16).unwrap();
        let envp_terminator = mem.read_u32(sp + 20).unwrap();
        assert_eq!(envp_terminator, 0);

        let read_cstr = |addr: u32| -> String {
            let mut bytes = Vec::new();
            let mut a = addr;
            loop {
                let b = mem.read_u8(a).unwrap();
                if b == 0 {
                    break;
                }
                bytes.push(b);
                a += 1;
            }
            String::from_utf8(bytes).unwrap()
        };
        assert_eq!(read_cstr(argv0), "prog");
        assert_eq!(read_cstr(argv1), "arg1");
        assert_eq!(read_cstr(envp0), "HOME=/");
    }

    // Builds a raw wait(2) status for a process that exited with `code`,
    // without forking a real child.
    unsafe fn exit_status(code: i32) -> i32 {
        code << 8
    }
}
