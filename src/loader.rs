//! MINIX a.out loader (§4.5; original_source `MINIXCompat_Executable.c`).
//!
//! Parses the big-endian header, allocates a click-rounded image buffer,
//! loads text/data, skips the symbol table, and applies the relocation
//! stream. The loaded image is always relative to [`EXECUTABLE_BASE`]; the
//! caller is responsible for copying it into guest memory there.

use std::convert::TryInto;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

use crate::world::{ExecutionState, World};

pub const EXECUTABLE_BASE: u32 = 0x0000_1000;
pub const EXECUTABLE_LIMIT: u32 = crate::memory::EXECUTABLE_LIMIT;

const MAGIC_COMBINED: u32 = 0x0410_0301;
const MAGIC_SEPARATE: u32 = 0x0420_0301;
const FLAGS_VALID: u32 = 0x0000_0020;

const CLICK_SIZE: u32 = 256;

fn click_round(size: u32) -> u32 {
    size.div_ceil(CLICK_SIZE)
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("image would require {0} bytes, exceeding available guest memory")]
    ImageTooLarge(u64),
    #[error("bad a.out magic number {0:#010x}")]
    BadMagic(u32),
    #[error("bad a.out flags {0:#010x}")]
    BadFlags(u32),
    #[error("truncated a.out file: {0}")]
    ReadShort(std::io::Error),
    #[error("malformed relocation stream")]
    RelocFormat,
}

/// The a.out header, normalized to host byte order. Combined I&D images
/// have their text folded into data and `a_text` forced to zero, matching
/// `MINIXExecutableLoadHeader`'s normalization.
#[derive(Debug, Clone, Copy)]
pub struct ExecHeader {
    pub magic: u32,
    pub flags: u32,
    pub text: u32,
    pub data: u32,
    pub bss: u32,
    pub total: u32,
    pub syms: u32,
}

pub struct LoadedExecutable {
    pub header: ExecHeader,
    pub image: Vec<u8>,
}

/// Load and relocate a MINIX a.out image from `input`, positioned at the
/// start of the file.
pub fn load(input: &mut (impl Read + Seek)) -> Result<LoadedExecutable, LoaderError> {
    let header = load_header(input)?;

    let text_clicks = click_round(header.text);
    let total_clicks = click_round(header.total);
    let image_len = total_clicks as u64 * CLICK_SIZE as u64;
    if image_len > crate::memory::RAM_SIZE as u64 {
        return Err(LoaderError::ImageTooLarge(image_len));
    }
    let mut image = vec![0u8; image_len as usize];

    input
        .seek(SeekFrom::Start(32))
        .map_err(LoaderError::ReadShort)?;

    let text_base = 0usize;
    let data_base = (text_clicks * CLICK_SIZE) as usize;

    if header.text > 0 {
        read_exact_into(input, &mut image[text_base..text_base + header.text as usize])?;
    }
    read_exact_into(input, &mut image[data_base..data_base + header.data as usize])?;

    if header.syms > 0 {
        input
            .seek(SeekFrom::Current(header.syms as i64))
            .map_err(LoaderError::ReadShort)?;
    }

    relocate(input, &mut image)?;

    Ok(LoadedExecutable { header, image })
}

fn read_exact_into(input: &mut impl Read, buf: &mut [u8]) -> Result<(), LoaderError> {
    input.read_exact(buf).map_err(LoaderError::ReadShort)
}

fn load_header(input: &mut (impl Read + Seek)) -> Result<ExecHeader, LoaderError> {
    input.seek(SeekFrom::Start(0)).map_err(LoaderError::ReadShort)?;
    let mut raw = [0u8; 32];
    input.read_exact(&mut raw).map_err(LoaderError::ReadShort)?;

    let field = |i: usize| u32::from_be_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
    let magic = field(0);
    let flags = field(1);
    let mut text = field(2);
    let mut data = field(3);
    let bss = field(4);
    let no_entry = field(5);
    let total = field(6);
    let syms = field(7);

    if magic != MAGIC_COMBINED && magic != MAGIC_SEPARATE {
        return Err(LoaderError::BadMagic(magic));
    }
    if flags != FLAGS_VALID {
        return Err(LoaderError::BadFlags(flags));
    }
    if no_entry != 0 || total == 0 {
        return Err(LoaderError::BadMagic(magic));
    }

    if magic == MAGIC_COMBINED {
        data += text;
        text = 0;
    }

    Ok(ExecHeader { magic, flags, text, data, bss, total, syms })
}

fn relocate(input: &mut impl Read, image: &mut [u8]) -> Result<(), LoaderError> {
    let mut offset_buf = [0u8; 4];
    if input.read_exact(&mut offset_buf).is_err() {
        // No relocation information present; nothing to do.
        return Ok(());
    }
    let mut offset = u32::from_be_bytes(offset_buf);
    if offset == 0 {
        return Ok(());
    }

    relocate_long_at(image, offset)?;

    loop {
        let mut b = [0u8];
        input.read_exact(&mut b).map_err(|_| LoaderError::RelocFormat)?;
        let b = b[0];
        if b == 0x00 {
            break;
        } else if b == 0x01 {
            offset += 254;
        } else if b.is_multiple_of(2) {
            offset += b as u32;
            relocate_long_at(image, offset)?;
        } else {
            return Err(LoaderError::RelocFormat);
        }
    }
    Ok(())
}

fn relocate_long_at(image: &mut [u8], offset: u32) -> Result<(), LoaderError> {
    let offset = offset as usize;
    let slice = image
        .get_mut(offset..offset + 4)
        .ok_or(LoaderError::RelocFormat)?;
    let value = u32::from_be_bytes(slice.try_into().unwrap());
    let relocated = value.wrapping_add(EXECUTABLE_BASE);
    slice.copy_from_slice(&relocated.to_be_bytes());
    Ok(())
}

/// Load `host_path` into guest memory at [`EXECUTABLE_BASE`] and reset
/// the break to the start of the image (§4.7 exec entry points). Shared
/// by both exec paths below.
fn load_image_into_world(world: &mut World, host_path: &Path) -> Result<(), LoaderError> {
    let mut file = std::fs::File::open(host_path).map_err(LoaderError::ReadShort)?;
    let loaded = load(&mut file)?;
    world.memory.write_block(EXECUTABLE_BASE, &loaded.image).map_err(|_| LoaderError::ImageTooLarge(loaded.image.len() as u64))?;
    world.current_break = EXECUTABLE_BASE;
    Ok(())
}

/// Entry point 1: from host launch. Builds the argv/envp frame from host
/// argv/envp (skipping argv[0], the tool path itself), and only exports
/// host environment variables prefixed `MINIX_`, with the prefix
/// stripped (§4.7).
pub fn exec_from_host_launch(world: &mut World, host_path: &Path, host_args: &[String]) -> Result<(), LoaderError> {
    load_image_into_world(world, host_path)?;

    let argv: Vec<&str> = host_args.iter().map(String::as_str).collect();
    let envp: Vec<String> = std::env::vars()
        .filter_map(|(k, v)| k.strip_prefix("MINIX_").map(|stripped| format!("{stripped}={v}")))
        .collect();
    let envp_refs: Vec<&str> = envp.iter().map(String::as_str).collect();

    let sp = crate::process::write_argv_envp_frame(&mut world.memory, &argv, &envp_refs)
        .map_err(|_| LoaderError::ImageTooLarge(0))?;
    world.memory.write_u32(crate::memory::RESET_SSP_ADDR, sp).ok();
    world.memory.write_u32(crate::memory::RESET_PC_ADDR, EXECUTABLE_BASE).ok();

    world.transition(ExecutionState::Ready);
    Ok(())
}

/// Entry point 2: from guest `exece`. The guest already built its own
/// stack snapshot with offsets relative to 0; relocate those offsets by
/// adding `Stack_Base` and write the result directly to the guest stack
/// (§4.7, §4.8 call 59).
pub fn exec_from_guest_stack(world: &mut World, host_path: &Path, stack_snapshot: &[u8]) -> Result<(), LoaderError> {
    load_image_into_world(world, host_path)?;

    let sp = crate::memory::STACK_BASE - stack_snapshot.len() as u32;

    let mut relocated = stack_snapshot.to_vec();
    // Walk argv then envp, each NULL-terminated, relocating every
    // non-NULL offset by Stack_Base; the string blob that follows is
    // left untouched.
    let mut off = 4usize;
    for _ in 0..2 {
        loop {
            let raw = u32::from_be_bytes(
                relocated.get(off..off + 4).ok_or(LoaderError::RelocFormat)?.try_into().unwrap(),
            );
            if raw == 0 {
                off += 4;
                break;
            }
            relocated[off..off + 4].copy_from_slice(&(raw + crate::memory::STACK_BASE).to_be_bytes());
            off += 4;
        }
    }

    world.memory.write_block(sp, &relocated).map_err(|_| LoaderError::ImageTooLarge(relocated.len() as u64))?;
    world.memory.write_u32(crate::memory::RESET_SSP_ADDR, sp).ok();
    world.memory.write_u32(crate::memory::RESET_PC_ADDR, EXECUTABLE_BASE).ok();

    world.transition(ExecutionState::Ready);
    Ok(())
}
