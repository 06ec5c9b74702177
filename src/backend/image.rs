//! Binary image packing.
//!
//! The loader on the device consumes this format directly, so the layout
//! is byte-exact and little-endian throughout: header, key tables, CODE
//! (4-byte aligned), DATA (one i32 per register and pooled constant), a
//! content checksum over CODE+DATA, the metadata block of fixed-width
//! name strings, and a whole-file checksum.

use crate::{
    error::{CompileError, Result},
    middle::CompiledProgram,
};

use super::Layout;

pub const MAGIC: [u8; 4] = *b"FXBC";
pub const ISA_VERSION: u16 = 2;
/// Fixed width of every string slot in the metadata block
pub const NAME_BYTES: usize = 32;
/// Entry offset recorded when the script does not define the function
pub const NO_ENTRY: u32 = u32::MAX;

/// Streaming CRC-32 (IEEE polynomial, bit-reflected, no lookup table)
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self { state: !0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.state ^= u32::from(byte);
            for _ in 0..8 {
                let mask = (self.state & 1).wrapping_neg();
                self.state = (self.state >> 1) ^ (0xEDB8_8320 & mask);
            }
        }
    }

    pub fn finish(self) -> u32 {
        !self.state
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finish()
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Pads `name` into a fixed 32-byte slot, zero-filled on the right
fn fixed_name(name: &str) -> Result<[u8; NAME_BYTES]> {
    let bytes = name.as_bytes();
    if bytes.len() > NAME_BYTES {
        return Err(CompileError::syntax(
            0,
            format!("name '{name}' exceeds {NAME_BYTES} bytes"),
        ));
    }
    let mut slot = [0u8; NAME_BYTES];
    slot[..bytes.len()].copy_from_slice(bytes);
    Ok(slot)
}

pub fn pack(
    program: &CompiledProgram,
    layout: &Layout,
    code: &[u8],
    entry: impl Fn(&str) -> Option<u32>,
) -> Result<Vec<u8>> {
    let vars = &program.vars;

    // Persisted and published scalar globals, in declaration order. Key
    // tables carry register indices; names follow in the metadata block.
    let persistent = program
        .globals
        .iter()
        .copied()
        .filter(|&id| vars.get(id).is_persistent && vars.get(id).ty.is_scalar())
        .collect::<Vec<_>>();
    let published = program
        .globals
        .iter()
        .copied()
        .filter(|&id| vars.get(id).is_published && vars.get(id).ty.is_scalar())
        .collect::<Vec<_>>();

    let mut data = Vec::with_capacity(layout.data.len() * 4);
    for &slot in &layout.data {
        data.extend_from_slice(&slot.to_le_bytes());
    }

    let mut code = code.to_vec();
    while code.len() % 4 != 0 {
        code.push(0);
    }

    let count = |n: usize| -> Result<u16> {
        u16::try_from(n).map_err(|_| CompileError::internal("table length overflows u16"))
    };

    let mut image = Vec::new();

    // Header
    image.extend_from_slice(&MAGIC);
    push_u16(&mut image, ISA_VERSION);
    push_u16(&mut image, 0); // reserved
    push_u32(&mut image, crc32(program.name.as_bytes()));
    push_u32(&mut image, code.len() as u32);
    push_u32(&mut image, data.len() as u32);
    push_u32(&mut image, entry("init").unwrap_or(NO_ENTRY));
    push_u32(&mut image, entry("loop").unwrap_or(NO_ENTRY));
    push_u16(&mut image, count(persistent.len())?);
    push_u16(&mut image, count(persistent.len())?);
    push_u16(&mut image, count(published.len())?);
    push_u16(&mut image, count(program.links.len())?);
    push_u16(&mut image, count(program.db_entries.len())?);
    push_u16(&mut image, 0); // cron table is always empty in this stage
    debug_assert_eq!(image.len(), 40);

    // Read-key then write-key tables: registers restored at boot and
    // written back on save. Both cover exactly the persistent globals.
    for _ in 0..2 {
        for &id in &persistent {
            push_u16(&mut image, u16::from(layout.global_register(id)?));
        }
    }
    for &id in &published {
        push_u16(&mut image, u16::from(layout.global_register(id)?));
    }
    for &link in &program.links {
        push_u32(&mut image, crc32(link.value().as_bytes()));
    }
    for &attr in &program.db_entries {
        push_u32(&mut image, crc32(attr.value().as_bytes()));
    }

    image.extend_from_slice(&code);
    image.extend_from_slice(&data);

    let mut content = Crc32::new();
    content.update(&code);
    content.update(&data);
    push_u32(&mut image, content.finish());

    // Metadata: name strings in the same order as the tables above
    image.extend_from_slice(&fixed_name(&program.name)?);
    for &id in &published {
        image.extend_from_slice(&fixed_name(vars.name_of(id).value())?);
    }
    for &link in &program.links {
        image.extend_from_slice(&fixed_name(link.value())?);
    }
    for &attr in &program.db_entries {
        image.extend_from_slice(&fixed_name(attr.value())?);
    }

    let file_hash = crc32(&image);
    push_u32(&mut image, file_hash);
    Ok(image)
}

/// Program name hash from a packed header
pub fn header_name_hash(image: &[u8]) -> Option<u32> {
    image
        .get(8..12)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
