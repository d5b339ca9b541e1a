//! MINIX IPC message: a 2-byte source, a 2-byte type, and a union of six
//! 28-byte layouts (§3, §4.4; original_source `MINIXCompat_Messages.h`).
//!
//! Every integer field is big-endian on the guest side ("on the wire") and
//! host order once copied into a [`Message`]. Swapping happens exactly at
//! the guest-memory boundary: after reading, and again before writing back
//! (§4.4, §4.8 step 1/4).

use std::convert::TryInto;

use crate::memory::GuestMemory;

pub const MESSAGE_SIZE: u32 = 36;

/// A MINIX kernel message, held in host byte order once read off the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Message {
    pub m_source: i16,
    pub m_type: i16,
    /// Raw union storage, large enough for the widest layout (mess2: three
    /// i16 + two i32 + one guest pointer = 28 bytes). Accessed through the
    /// `m1_*`..`m6_*` views below.
    u: [u8; 28],
}

macro_rules! int_field {
    ($get:ident, $set:ident, i16, $offset:expr) => {
        pub fn $get(&self) -> i16 {
            i16::from_ne_bytes(self.u[$offset..$offset + 2].try_into().unwrap())
        }
        pub fn $set(&mut self, value: i16) {
            self.u[$offset..$offset + 2].copy_from_slice(&value.to_ne_bytes());
        }
    };
    ($get:ident, $set:ident, i32, $offset:expr) => {
        pub fn $get(&self) -> i32 {
            i32::from_ne_bytes(self.u[$offset..$offset + 4].try_into().unwrap())
        }
        pub fn $set(&mut self, value: i32) {
            self.u[$offset..$offset + 4].copy_from_slice(&value.to_ne_bytes());
        }
    };
    ($get:ident, $set:ident, u32, $offset:expr) => {
        pub fn $get(&self) -> u32 {
            u32::from_ne_bytes(self.u[$offset..$offset + 4].try_into().unwrap())
        }
        pub fn $set(&mut self, value: u32) {
            self.u[$offset..$offset + 4].copy_from_slice(&value.to_ne_bytes());
        }
    };
}

impl Message {
    pub fn clear(&mut self) {
        *self = Message::default();
    }

    // mess1: {i16 m1i1, m1i2, m1i3; u32 m1p1, m1p2, m1p3}
    int_field!(m1_i1, set_m1_i1, i16, 0);
    int_field!(m1_i2, set_m1_i2, i16, 2);
    int_field!(m1_i3, set_m1_i3, i16, 4);
    int_field!(m1_p1, set_m1_p1, u32, 6);
    int_field!(m1_p2, set_m1_p2, u32, 10);
    int_field!(m1_p3, set_m1_p3, u32, 14);

    // mess2: {i16 m2i1, m2i2, m2i3; i32 m2l1, m2l2; u32 m2p1}
    int_field!(m2_i1, set_m2_i1, i16, 0);
    int_field!(m2_i2, set_m2_i2, i16, 2);
    int_field!(m2_i3, set_m2_i3, i16, 4);
    int_field!(m2_l1, set_m2_l1, i32, 6);
    int_field!(m2_l2, set_m2_l2, i32, 10);
    int_field!(m2_p1, set_m2_p1, u32, 14);

    // mess3: {i16 m3i1, m3i2; u32 m3p1; char m3ca1[14]}
    int_field!(m3_i1, set_m3_i1, i16, 0);
    int_field!(m3_i2, set_m3_i2, i16, 2);
    int_field!(m3_p1, set_m3_p1, u32, 4);

    pub fn m3_ca1(&self) -> &[u8] {
        &self.u[8..22]
    }

    pub fn set_m3_ca1(&mut self, name: &[u8]) {
        let n = name.len().min(14);
        self.u[8..8 + n].copy_from_slice(&name[..n]);
        for b in &mut self.u[8 + n..22] {
            *b = 0;
        }
    }

    // mess4: {i32 m4l1, m4l2, m4l3, m4l4}
    int_field!(m4_l1, set_m4_l1, i32, 0);
    int_field!(m4_l2, set_m4_l2, i32, 4);
    int_field!(m4_l3, set_m4_l3, i32, 8);
    int_field!(m4_l4, set_m4_l4, i32, 12);

    // mess5: {char m5c1, m5c2; i16 m5i1, m5i2; i32 m5l1, m5l2, m5l3}
    pub fn m5_c1(&self) -> u8 {
        self.u[0]
    }
    pub fn set_m5_c1(&mut self, value: u8) {
        self.u[0] = value;
    }
    pub fn m5_c2(&self) -> u8 {
        self.u[1]
    }
    pub fn set_m5_c2(&mut self, value: u8) {
        self.u[1] = value;
    }
    int_field!(m5_i1, set_m5_i1, i16, 2);
    int_field!(m5_i2, set_m5_i2, i16, 4);
    int_field!(m5_l1, set_m5_l1, i32, 6);
    int_field!(m5_l2, set_m5_l2, i32, 10);
    int_field!(m5_l3, set_m5_l3, i32, 14);

    // mess6: {i16 m6i1, m6i2, m6i3; i32 m6l1; u32 m6f1}
    int_field!(m6_i1, set_m6_i1, i16, 0);
    int_field!(m6_i2, set_m6_i2, i16, 2);
    int_field!(m6_i3, set_m6_i3, i16, 4);
    int_field!(m6_l1, set_m6_l1, i32, 6);
    int_field!(m6_f1, set_m6_f1, u32, 10);

    /// Read a 36-byte message out of guest memory (big-endian on the wire)
    /// into host order, swapped according to `layout`.
    pub fn read(mem: &GuestMemory, addr: u32, layout: Layout) -> Result<Message, crate::memory::MemoryError> {
        let raw = mem.read_block(addr, MESSAGE_SIZE as usize)?;
        let mut msg = Message {
            m_source: i16::from_be_bytes([raw[0], raw[1]]),
            m_type: i16::from_be_bytes([raw[2], raw[3]]),
            ..Message::default()
        };
        msg.u.copy_from_slice(&raw[4..32]);
        layout.swap(&mut msg);
        Ok(msg)
    }

    /// Swap `self` back to big-endian and write it into guest memory.
    pub fn write(&self, mem: &mut GuestMemory, addr: u32, layout: Layout) -> Result<(), crate::memory::MemoryError> {
        let mut wire = *self;
        layout.swap(&mut wire);
        let mut raw = [0u8; MESSAGE_SIZE as usize];
        raw[0..2].copy_from_slice(&wire.m_source.to_be_bytes());
        raw[2..4].copy_from_slice(&wire.m_type.to_be_bytes());
        raw[4..32].copy_from_slice(&wire.u);
        mem.write_block(addr, &raw)
    }
}

/// Which of the six overlaid field layouts a message is carrying. Picked by
/// the dispatcher per syscall, per the table in spec.md §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Mess1,
    Mess2,
    Mess3,
    Mess4,
    Mess5,
    Mess6,
}

impl Layout {
    /// Byte-swap every integer/pointer field of this layout, in place.
    /// Applied symmetrically: the same call swaps guest-order into host
    /// order, and host order back into guest order (§4.4, §8 round-trip
    /// invariant).
    pub fn swap(&self, msg: &mut Message) {
        macro_rules! swap16 {
            ($off:expr) => {{
                let v = i16::from_ne_bytes(msg.u[$off..$off + 2].try_into().unwrap());
                msg.u[$off..$off + 2].copy_from_slice(&v.swap_bytes().to_ne_bytes());
            }};
        }
        macro_rules! swap32 {
            ($off:expr) => {{
                let v = u32::from_ne_bytes(msg.u[$off..$off + 4].try_into().unwrap());
                msg.u[$off..$off + 4].copy_from_slice(&v.swap_bytes().to_ne_bytes());
            }};
        }
        match self {
            Layout::Mess1 => {
                swap16!(0);
                swap16!(2);
                swap16!(4);
                swap32!(6);
                swap32!(10);
                swap32!(14);
            }
            Layout::Mess2 => {
                swap16!(0);
                swap16!(2);
                swap16!(4);
                swap32!(6);
                swap32!(10);
                swap32!(14);
            }
            Layout::Mess3 => {
                swap16!(0);
                swap16!(2);
                swap32!(4);
                // m3ca1 is character data: not swapped.
            }
            Layout::Mess4 => {
                swap32!(0);
                swap32!(4);
                swap32!(8);
                swap32!(12);
            }
            Layout::Mess5 => {
                // m5c1/m5c2 are characters: not swapped.
                swap16!(2);
                swap16!(4);
                swap32!(6);
                swap32!(10);
                swap32!(14);
            }
            Layout::Mess6 => {
                swap16!(0);
                swap16!(2);
                swap16!(4);
                swap32!(6);
                swap32!(10);
            }
        }
    }
}
