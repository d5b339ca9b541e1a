//! Filesystem layer: guest fd table, directory precache, flag/mode/whence
//! translation, stat, and path rooting (§4.6; original_source
//! `MINIXCompat_Filesystem.c/h`).

use crate::errors::{minix_errno_for_current, MinixErrno};
use bitflags::bitflags;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

pub const FD_TABLE_SIZE: usize = 20;
const DIRENT_SIZE: usize = 16;
const DIRENT_NAME_LEN: usize = 14;
const DIR_GROW_BLOCK: usize = 32;

bitflags! {
    /// MINIX-side `open()` flags, exact octal values from
    /// `MINIXCompat_Filesystem.h`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MinixOpenFlags: u16 {
        const CREAT    = 0o0100;
        const EXCL     = 0o0200;
        const NOCTTY   = 0o0400;
        const TRUNC    = 0o1000;
        const APPEND   = 0o2000;
        const NONBLOCK = 0o4000;
        const WRONLY   = 0o0001;
        const RDWR     = 0o0002;
    }
}

bitflags! {
    /// MINIX-side `st_mode` bits, exact octal values from the same header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MinixMode: u16 {
        const IFMT  = 0o170000;
        const IFREG = 0o100000;
        const IFBLK = 0o060000;
        const IFDIR = 0o040000;
        const IFCHR = 0o020000;
        const IFIFO = 0o010000;
        const ISUID = 0o004000;
        const ISGID = 0o002000;
        const ISVTX = 0o001000;
        const IRUSR = 0o000400;
        const IWUSR = 0o000200;
        const IXUSR = 0o000100;
        const IRGRP = 0o000040;
        const IWGRP = 0o000020;
        const IXGRP = 0o000010;
        const IROTH = 0o000004;
        const IWOTH = 0o000002;
        const IXOTH = 0o000001;
    }
}

/// Translate MINIX `open()` flags to host flags (§4.6). `RDONLY` is 0 on
/// both sides and needs no bit.
pub fn host_open_flags(minix_flags: MinixOpenFlags) -> i32 {
    let mut host = 0;
    if minix_flags.contains(MinixOpenFlags::CREAT) {
        host |= libc::O_CREAT;
    }
    if minix_flags.contains(MinixOpenFlags::EXCL) {
        host |= libc::O_EXCL;
    }
    if minix_flags.contains(MinixOpenFlags::NOCTTY) {
        host |= libc::O_NOCTTY;
    }
    if minix_flags.contains(MinixOpenFlags::TRUNC) {
        host |= libc::O_TRUNC;
    }
    if minix_flags.contains(MinixOpenFlags::APPEND) {
        host |= libc::O_APPEND;
    }
    if minix_flags.contains(MinixOpenFlags::NONBLOCK) {
        host |= libc::O_NONBLOCK;
    }
    if minix_flags.contains(MinixOpenFlags::WRONLY) {
        host |= libc::O_WRONLY;
    }
    if minix_flags.contains(MinixOpenFlags::RDWR) {
        host |= libc::O_RDWR;
    }
    host
}

/// Translate a host `st_mode` to its MINIX equivalent bit for bit. Type
/// bits are masked exactly (`mode & S_IFMT`), not aliased, per the
/// REDESIGN note about the source's `S_IFREG`/`S_IFBLK` overlap bug
/// (spec.md §9 item 4).
pub fn minix_mode_for_host(host_mode: u32) -> MinixMode {
    let mut minix = MinixMode::empty();
    let type_bits = host_mode & libc::S_IFMT;
    match type_bits {
        libc::S_IFREG => minix |= MinixMode::IFREG,
        libc::S_IFBLK => minix |= MinixMode::IFBLK,
        libc::S_IFDIR => minix |= MinixMode::IFDIR,
        libc::S_IFCHR => minix |= MinixMode::IFCHR,
        libc::S_IFIFO => minix |= MinixMode::IFIFO,
        _ => {}
    }
    if host_mode & libc::S_ISUID != 0 {
        minix |= MinixMode::ISUID;
    }
    if host_mode & libc::S_ISGID != 0 {
        minix |= MinixMode::ISGID;
    }
    if host_mode & libc::S_ISVTX != 0 {
        minix |= MinixMode::ISVTX;
    }
    let rwx = [
        (libc::S_IRUSR, MinixMode::IRUSR),
        (libc::S_IWUSR, MinixMode::IWUSR),
        (libc::S_IXUSR, MinixMode::IXUSR),
        (libc::S_IRGRP, MinixMode::IRGRP),
        (libc::S_IWGRP, MinixMode::IWGRP),
        (libc::S_IXGRP, MinixMode::IXGRP),
        (libc::S_IROTH, MinixMode::IROTH),
        (libc::S_IWOTH, MinixMode::IWOTH),
        (libc::S_IXOTH, MinixMode::IXOTH),
    ];
    for (host_bit, minix_bit) in rwx {
        if host_mode & host_bit != 0 {
            minix |= minix_bit;
        }
    }
    minix
}

/// Where a `seek()` measures from (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_minix(value: i16) -> Option<Whence> {
        match value {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// A synthesized directory entry: 2-byte big-endian inode + 14-byte
/// NUL-padded name (§3).
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub inode: u16,
    pub name: [u8; DIRENT_NAME_LEN],
}

impl DirEntry {
    fn to_bytes(self) -> [u8; DIRENT_SIZE] {
        let mut out = [0u8; DIRENT_SIZE];
        out[0..2].copy_from_slice(&self.inode.to_be_bytes());
        out[2..16].copy_from_slice(&self.name);
        out
    }
}

/// Fold a host inode into MINIX's 16-bit inode space (§3). Non-zero host
/// inodes never map to zero.
pub fn squeeze_inode(host_inode: u64) -> u16 {
    if host_inode <= u16::MAX as u64 {
        return host_inode as u16;
    }
    let mut folded: u16 = 0;
    let mut remaining = host_inode;
    while remaining > 0 {
        folded = folded.wrapping_add((remaining & 0xffff) as u16);
        remaining >>= 16;
    }
    if folded == 0 {
        // Synthesize deterministically from the low bits that folded away.
        folded = (host_inode as u16).wrapping_add(1).max(1);
    }
    folded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Unchecked,
    File,
    Directory,
}

pub struct FdSlot {
    pub host_fd: i32,
    pub guest_fd: i32,
    pub kind: SlotKind,
    dir_cache: Vec<DirEntry>,
    dir_offset: usize,
}

impl FdSlot {
    fn closed() -> Self {
        FdSlot { host_fd: -1, guest_fd: -1, kind: SlotKind::Unchecked, dir_cache: Vec::new(), dir_offset: 0 }
    }
}

/// A MINIX-side `stat` structure, packed with no padding (§3).
#[derive(Debug, Clone, Copy, Default)]
pub struct MinixStat {
    pub st_dev: u16,
    pub st_ino: u16,
    pub st_mode: u16,
    pub st_nlink: u16,
    pub st_uid: i16,
    pub st_gid: i16,
    pub st_rdev: u16,
    pub st_size: i32,
    pub atime: i32,
    pub mtime: i32,
    pub ctime: i32,
}

impl MinixStat {
    pub const SIZE: usize = 30;

    /// Serialize in big-endian wire order, as written into guest memory.
    pub fn to_be_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.st_dev.to_be_bytes());
        out[2..4].copy_from_slice(&self.st_ino.to_be_bytes());
        out[4..6].copy_from_slice(&self.st_mode.to_be_bytes());
        out[6..8].copy_from_slice(&self.st_nlink.to_be_bytes());
        out[8..10].copy_from_slice(&self.st_uid.to_be_bytes());
        out[10..12].copy_from_slice(&self.st_gid.to_be_bytes());
        out[12..14].copy_from_slice(&self.st_rdev.to_be_bytes());
        out[14..18].copy_from_slice(&self.st_size.to_be_bytes());
        out[18..22].copy_from_slice(&self.atime.to_be_bytes());
        out[22..26].copy_from_slice(&self.mtime.to_be_bytes());
        out[26..30].copy_from_slice(&self.ctime.to_be_bytes());
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("MINIX errno {0}")]
    Minix(MinixErrno),
}

type Result<T> = std::result::Result<T, FsError>;

fn current_error() -> FsError {
    FsError::Minix(minix_errno_for_current())
}

/// Maps guest file descriptors to host file descriptors and caches
/// directory listings (§3, §4.6).
pub struct FdTable {
    slots: [FdSlot; FD_TABLE_SIZE],
}

impl FdTable {
    pub fn new() -> Self {
        let mut slots: [FdSlot; FD_TABLE_SIZE] = std::array::from_fn(|_| FdSlot::closed());
        for (i, slot) in slots.iter_mut().enumerate().take(3) {
            slot.host_fd = i as i32;
            slot.guest_fd = i as i32;
            slot.kind = SlotKind::File;
        }
        FdTable { slots }
    }

    fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.guest_fd == -1)
    }

    pub fn slot(&self, guest_fd: i32) -> Option<&FdSlot> {
        self.slots.get(guest_fd as usize).filter(|s| s.guest_fd == guest_fd)
    }

    pub fn open(&mut self, host_path: &Path, host_flags: i32, host_mode: u32) -> Result<i32> {
        let idx = self.first_free().ok_or(FsError::Minix(23))?; // ENFILE
        let c_path = path_to_cstring(host_path)?;
        let host_fd = unsafe { libc::open(c_path.as_ptr(), host_flags, host_mode) };
        if host_fd < 0 {
            return Err(current_error());
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(host_fd, &mut stat) } != 0 {
            let err = current_error();
            unsafe { libc::close(host_fd) };
            return Err(err);
        }

        let slot = &mut self.slots[idx];
        slot.host_fd = host_fd;
        slot.guest_fd = idx as i32;

        if stat.st_mode & libc::S_IFMT == libc::S_IFDIR {
            match precache_directory(host_path) {
                Ok(entries) => {
                    slot.kind = SlotKind::Directory;
                    slot.dir_cache = entries;
                    slot.dir_offset = 0;
                }
                Err(e) => {
                    unsafe { libc::close(host_fd) };
                    *slot = FdSlot::closed();
                    return Err(e);
                }
            }
        } else {
            slot.kind = SlotKind::File;
        }

        Ok(idx as i32)
    }

    pub fn close(&mut self, guest_fd: i32) -> Result<()> {
        let slot = self
            .slots
            .get_mut(guest_fd as usize)
            .filter(|s| s.guest_fd == guest_fd)
            .ok_or(FsError::Minix(9))?; // EBADF
        unsafe { libc::close(slot.host_fd) };
        *slot = FdSlot::closed();
        Ok(())
    }

    pub fn read(&mut self, guest_fd: i32, buf_size: usize) -> Result<Vec<u8>> {
        let slot = self
            .slots
            .get_mut(guest_fd as usize)
            .filter(|s| s.guest_fd == guest_fd)
            .ok_or(FsError::Minix(9))?;
        match slot.kind {
            SlotKind::Directory => {
                let cache_bytes: Vec<u8> = slot.dir_cache.iter().flat_map(|e| e.to_bytes()).collect();
                let start = slot.dir_offset;
                let end = start + buf_size;
                if end > cache_bytes.len() {
                    return Err(FsError::Minix(5)); // EIO
                }
                slot.dir_offset = end;
                Ok(cache_bytes[start..end].to_vec())
            }
            _ => {
                let mut buf = vec![0u8; buf_size];
                let n = unsafe { libc::read(slot.host_fd, buf.as_mut_ptr() as *mut _, buf_size) };
                if n < 0 {
                    return Err(current_error());
                }
                buf.truncate(n as usize);
                Ok(buf)
            }
        }
    }

    pub fn write(&mut self, guest_fd: i32, data: &[u8]) -> Result<usize> {
        let slot = self
            .slots
            .get_mut(guest_fd as usize)
            .filter(|s| s.guest_fd == guest_fd)
            .ok_or(FsError::Minix(9))?;
        assert!(slot.kind != SlotKind::Directory, "write() on a directory slot");
        let n = unsafe { libc::write(slot.host_fd, data.as_ptr() as *const _, data.len()) };
        if n < 0 {
            return Err(current_error());
        }
        Ok(n as usize)
    }

    /// Seek. For directories, `dir_offset` is tracked in-process rather
    /// than handed to the host; `Whence::End` anchors at `count*16 - 1`,
    /// matching the source bug rather than the arguably-correct
    /// `count*16` (spec.md §9 item 1).
    pub fn seek(&mut self, guest_fd: i32, offset: i64, whence: Whence) -> Result<i64> {
        let slot = self
            .slots
            .get_mut(guest_fd as usize)
            .filter(|s| s.guest_fd == guest_fd)
            .ok_or(FsError::Minix(9))?;
        match slot.kind {
            SlotKind::Directory => {
                let count = slot.dir_cache.len() as i64;
                let new_offset = match whence {
                    Whence::Set => offset,
                    Whence::Cur => slot.dir_offset as i64 + offset,
                    Whence::End => count * DIRENT_SIZE as i64 - 1 + offset,
                };
                if new_offset < 0 || new_offset > count * DIRENT_SIZE as i64 {
                    return Err(FsError::Minix(22)); // EINVAL
                }
                slot.dir_offset = new_offset as usize;
                Ok(new_offset)
            }
            _ => {
                let host_whence = match whence {
                    Whence::Set => libc::SEEK_SET,
                    Whence::Cur => libc::SEEK_CUR,
                    Whence::End => libc::SEEK_END,
                };
                let result = unsafe { libc::lseek(slot.host_fd, offset, host_whence) };
                if result < 0 {
                    return Err(current_error());
                }
                Ok(result)
            }
        }
    }

    pub fn fstat(&self, guest_fd: i32) -> Result<MinixStat> {
        let slot = self.slot(guest_fd).ok_or(FsError::Minix(9))?;
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(slot.host_fd, &mut stat) } != 0 {
            return Err(current_error());
        }
        Ok(translate_stat(&stat))
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

fn precache_directory(host_path: &Path) -> Result<Vec<DirEntry>> {
    let c_path = path_to_cstring(host_path)?;
    let dir = unsafe { libc::opendir(c_path.as_ptr()) };
    if dir.is_null() {
        return Err(current_error());
    }
    let mut entries = Vec::with_capacity(DIR_GROW_BLOCK);
    loop {
        // EINTR is retried transparently here, per spec.md §5.
        unsafe { *libc::__errno_location() = 0 };
        let ent = unsafe { libc::readdir(dir) };
        if ent.is_null() {
            let err = unsafe { *libc::__errno_location() };
            if err == libc::EINTR {
                continue;
            }
            break;
        }
        let ent = unsafe { &*ent };
        let host_inode = ent.d_ino as u64;
        if host_inode == 0 {
            continue;
        }
        let name_bytes: Vec<u8> = ent
            .d_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        let mut name = [0u8; DIRENT_NAME_LEN];
        let n = name_bytes.len().min(DIRENT_NAME_LEN);
        name[..n].copy_from_slice(&name_bytes[..n]);
        entries.push(DirEntry { inode: squeeze_inode(host_inode), name });
    }
    unsafe { libc::closedir(dir) };
    Ok(entries)
}

fn translate_stat(stat: &libc::stat) -> MinixStat {
    let minix_mode = minix_mode_for_host(stat.st_mode);
    MinixStat {
        st_dev: stat.st_dev as u16,
        st_ino: squeeze_inode(stat.st_ino),
        st_mode: minix_mode.bits(),
        st_nlink: stat.st_nlink as u16,
        st_uid: stat.st_uid as i16,
        st_gid: stat.st_gid as i16,
        st_rdev: stat.st_rdev as u16,
        st_size: stat.st_size.min(0x7fff_ffff) as i32,
        atime: stat.st_atime as i32,
        mtime: stat.st_mtime as i32,
        ctime: stat.st_ctime as i32,
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::Minix(22)) // EINVAL
}

/// Resolves guest paths against a host root directory and a guest-relative
/// cwd (§4.6). `MINIXCOMPAT_PWD` is not validated to lie under
/// `MINIXCOMPAT_DIR` (spec.md §9 item 3) -- this mirrors the source.
pub struct PathResolver {
    root: PathBuf,
    guest_cwd: String,
}

impl PathResolver {
    pub fn new(root: PathBuf, guest_cwd: String) -> Self {
        PathResolver { root, guest_cwd }
    }

    pub fn guest_cwd(&self) -> &str {
        &self.guest_cwd
    }

    pub fn host_root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, guest_path: &str) -> PathBuf {
        if guest_path.starts_with('/') {
            join_stripping_leading_slash(&self.root, guest_path)
        } else {
            let mut base = join_stripping_leading_slash(&self.root, &self.guest_cwd);
            base.push(guest_path);
            base
        }
    }

    /// Set the guest cwd and `chdir` the host process to match.
    pub fn set_cwd(&mut self, guest_path: &str) -> Result<()> {
        let host_path = self.resolve(guest_path);
        let c_path = path_to_cstring(&host_path)?;
        if unsafe { libc::chdir(c_path.as_ptr()) } != 0 {
            return Err(current_error());
        }
        self.guest_cwd = guest_path.to_string();
        Ok(())
    }
}

fn join_stripping_leading_slash(root: &Path, guest_path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    out.push(guest_path.trim_start_matches('/'));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squeeze_never_zero_for_nonzero_input() {
        for inode in [1u64, 0xffff, 0x1_0000, 0x1_0001, 0xffff_ffff, u64::MAX] {
            assert_ne!(squeeze_inode(inode), 0, "inode {inode:#x} squeezed to zero");
        }
    }

    #[test]
    fn small_inodes_pass_through() {
        assert_eq!(squeeze_inode(42), 42);
    }

    #[test]
    fn minix_stat_serializes_to_30_bytes_in_big_endian() {
        let stat = MinixStat {
            st_dev: 1,
            st_ino: 2,
            st_mode: 0o100644,
            st_nlink: 1,
            st_uid: 0,
            st_gid: 0,
            st_rdev: 0,
            st_size: 0x0102_0304,
            atime: 10,
            mtime: 20,
            ctime: 30,
        };
        let bytes = stat.to_be_bytes();
        assert_eq!(bytes.len(), MinixStat::SIZE);
        assert_eq!(&bytes[0..2], &1u16.to_be_bytes());
        assert_eq!(&bytes[14..18], &0x0102_0304i32.to_be_bytes());
        assert_eq!(&bytes[26..30], &30i32.to_be_bytes());
    }

    #[test]
    fn path_joining_absolute_and_relative() {
        let resolver = PathResolver::new(PathBuf::from("/opt/minix"), "/usr/ast".to_string());
        assert_eq!(resolver.resolve("x.c"), PathBuf::from("/opt/minix/usr/ast/x.c"));
        assert_eq!(resolver.resolve("/etc/passwd"), PathBuf::from("/opt/minix/etc/passwd"));
    }

    #[test]
    fn mode_type_bits_use_exact_mask() {
        let mode = minix_mode_for_host(libc::S_IFREG as u32 | 0o644);
        assert!(mode.contains(MinixMode::IFREG));
        assert!(!mode.contains(MinixMode::IFBLK));
        assert!(mode.contains(MinixMode::IRUSR));
    }

    #[test]
    fn open_flags_translate_bitwise() {
        let flags = MinixOpenFlags::CREAT | MinixOpenFlags::TRUNC | MinixOpenFlags::WRONLY;
        let host = host_open_flags(flags);
        assert_eq!(host & libc::O_CREAT, libc::O_CREAT);
        assert_eq!(host & libc::O_TRUNC, libc::O_TRUNC);
        assert_eq!(host & libc::O_WRONLY, libc::O_WRONLY);
    }

    #[test]
    fn fd_table_starts_with_stdio_bound() {
        let table = FdTable::new();
        for fd in 0..3 {
            let slot = table.slot(fd).unwrap();
            assert_eq!(slot.host_fd, fd);
            assert_eq!(slot.kind, SlotKind::File);
        }
        assert!(table.slot(3).is_none());
    }

    #[test]
    fn open_read_close_roundtrip_on_real_directory() {
        let dir = std::env::temp_dir().join(format!("minixcompat-fs-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a"), b"hello").unwrap();

        let mut table = FdTable::new();
        let fd = table.open(&dir, libc::O_RDONLY, 0).unwrap();
        assert_eq!(table.slot(fd).unwrap().kind, SlotKind::Directory);
        let count = table.slot(fd).unwrap().dir_cache.len();
        assert!(count >= 1);
        let bytes = table.read(fd, count * DIRENT_SIZE).unwrap();
        assert_eq!(bytes.len(), count * DIRENT_SIZE);
        table.close(fd).unwrap();
        assert!(table.slot(fd).is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn seek_end_on_directory_is_off_by_one() {
        let dir = std::env::temp_dir().join(format!("minixcompat-fs-seek-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a"), b"x").unwrap();

        let mut table = FdTable::new();
        let fd = table.open(&dir, libc::O_RDONLY, 0).unwrap();
        let count = table.slot(fd).unwrap().dir_cache.len() as i64;
        let pos = table.seek(fd, 0, Whence::End).unwrap();
        assert_eq!(pos, count * DIRENT_SIZE as i64 - 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
