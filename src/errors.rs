//! Bidirectional MINIX errno <-> host errno table (§4.3).
//!
//! The MINIX->host direction is injective except `ERROR` maps to
//! `ENOTRECOVERABLE`; any host errno absent from the table collapses to
//! MINIX `ERROR` (99), per original_source `MINIXCompat_Errors.c`.

/// A MINIX `errno` value, 1..39 or 99 (`ERROR`).
pub type MinixErrno = i16;

pub const MINIX_ERROR: MinixErrno = 99;

macro_rules! errno_table {
    ($(($minix:expr, $host:expr)),+ $(,)?) => {
        const ERRNO_TABLE: &[(MinixErrno, i32)] = &[
            $(($minix, $host)),+
        ];

        /// Maps a host `errno` to its MINIX equivalent, or [`MINIX_ERROR`]
        /// if the host value isn't one MINIX knows about.
        pub fn minix_errno_for_host(host_errno: i32) -> MinixErrno {
            ERRNO_TABLE
                .iter()
                .find(|(_, host)| *host == host_errno)
                .map(|(minix, _)| *minix)
                .unwrap_or(MINIX_ERROR)
        }

        /// Maps a MINIX errno back to its host equivalent.
        ///
        /// `ERROR` (99) maps to `ENOTRECOVERABLE`, since it has no single
        /// host errno of origin.
        pub fn host_errno_for_minix(minix_errno: MinixErrno) -> i32 {
            ERRNO_TABLE
                .iter()
                .find(|(minix, _)| *minix == minix_errno)
                .map(|(_, host)| *host)
                .unwrap_or(libc::ENOTRECOVERABLE)
        }
    };
}

errno_table! {
    (1, libc::EPERM),
    (2, libc::ENOENT),
    (3, libc::ESRCH),
    (4, libc::EINTR),
    (5, libc::EIO),
    (6, libc::ENXIO),
    (7, libc::E2BIG),
    (8, libc::ENOEXEC),
    (9, libc::EBADF),
    (10, libc::ECHILD),
    (11, libc::EAGAIN),
    (12, libc::ENOMEM),
    (13, libc::EACCES),
    (14, libc::EFAULT),
    (15, libc::ENOTBLK),
    (16, libc::EBUSY),
    (17, libc::EEXIST),
    (18, libc::EXDEV),
    (19, libc::ENODEV),
    (20, libc::ENOTDIR),
    (21, libc::EISDIR),
    (22, libc::EINVAL),
    (23, libc::ENFILE),
    (24, libc::EMFILE),
    (25, libc::ENOTTY),
    (26, libc::ETXTBSY),
    (27, libc::EFBIG),
    (28, libc::ENOSPC),
    (29, libc::ESPIPE),
    (30, libc::EROFS),
    (31, libc::EMLINK),
    (32, libc::EPIPE),
    (33, libc::EDOM),
    (34, libc::ERANGE),
    (35, libc::EDEADLK),
    (36, libc::ENAMETOOLONG),
    (37, libc::ENOLCK),
    (38, libc::ENOSYS),
    (39, libc::ENOTEMPTY),
}

/// Returns the current host `errno` mapped to its MINIX equivalent.
pub fn minix_errno_for_current() -> MinixErrno {
    minix_errno_for_host(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
}
