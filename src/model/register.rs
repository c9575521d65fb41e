// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{Address, Exception};
use core::cell::Cell;

/// The declared type of a register, used only to derive its word count;
/// storage itself is always the big-endian byte representation of the
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    U8,
    U16,
    U32,
    I32,
    F32,
    U64,
    I64,
    F64,
    /// A block of `n` consecutive byte registers (1 byte per word, high
    /// byte zero-padded).
    BlockU8(u16),
    /// A block of `n` consecutive 16-bit word registers.
    BlockU16(u16),
}

impl RegisterType {
    /// Number of consecutive 16-bit register addresses this type occupies.
    #[must_use]
    pub const fn word_count(self) -> u16 {
        match self {
            Self::U8 | Self::U16 => 1,
            Self::U32 | Self::I32 | Self::F32 => 2,
            Self::U64 | Self::I64 | Self::F64 => 4,
            Self::BlockU8(n) => n,
            Self::BlockU16(n) => n,
        }
    }
}

/// How a register's current bytes are obtained. Bytes are always in
/// big-endian wire order, `word_count() * 2` long.
pub enum RegisterRead<'a> {
    None,
    /// Always reads as these constant big-endian bytes
    /// (`word_count() * 2` long).
    Constant(&'a [u8]),
    /// A host-owned byte cell array holding the current value.
    Cell(&'a [Cell<u8>]),
    /// Writes the register's big-endian bytes into the given buffer.
    Callback(fn(Address, &mut [u8]) -> Result<(), Exception>),
}

/// How a register may be written.
pub enum RegisterWrite<'a> {
    None,
    Cell(&'a [Cell<u8>]),
    /// Receives the big-endian bytes to store.
    Callback(fn(Address, &[u8]) -> Result<(), Exception>),
}

/// A single register (holding or input) binding, possibly spanning several
/// consecutive addresses.
pub struct RegisterDescriptor<'a> {
    pub address: Address,
    pub ty: RegisterType,
    pub read: RegisterRead<'a>,
    pub write: RegisterWrite<'a>,
    pub read_lock: Option<fn(Address) -> bool>,
    pub write_lock: Option<fn(Address) -> bool>,
    /// Allows a write whose range only partially overlaps this descriptor
    /// (e.g. one word out of a multi-word block).
    pub allow_partial_write: bool,
    pub post_write: Option<fn(Address)>,
}

impl<'a> RegisterDescriptor<'a> {
    #[must_use]
    pub const fn word_count(&self) -> u16 {
        self.ty.word_count()
    }

    #[must_use]
    pub const fn end_address(&self) -> u32 {
        self.address as u32 + self.word_count() as u32
    }
}

/// Find the descriptor in `table` that covers `addr`, along with `addr`'s
/// word offset into it. `table` must be sorted ascending by `address` with
/// non-overlapping ranges.
#[must_use]
pub fn find_covering<'a>(
    table: &'a [RegisterDescriptor<'a>],
    addr: Address,
) -> Option<(&'a RegisterDescriptor<'a>, u16)> {
    let idx = table.partition_point(|d| d.address <= addr);
    if idx == 0 {
        return None;
    }
    let desc = &table[idx - 1];
    if (addr as u32) < desc.end_address() {
        Some((desc, addr - desc.address))
    } else {
        None
    }
}

/// Read up to `remaining_count` words from `desc`, starting
/// `offset_words` words into the descriptor, into `out` (big-endian).
///
/// If `out` is `None`, only validates and returns the word count that would
/// be produced. Never produces more than
/// `min(word_count - offset_words, remaining_count)` words.
pub fn read_register(
    desc: &RegisterDescriptor<'_>,
    offset_words: u16,
    remaining_count: u16,
    out: Option<&mut [u8]>,
) -> Result<u16, Exception> {
    if let Some(lock) = desc.read_lock {
        if lock(desc.address) {
            return Err(Exception::IllegalDataAddress);
        }
    }
    let total = desc.word_count();
    if offset_words >= total {
        return Err(Exception::IllegalDataAddress);
    }
    let n = (total - offset_words).min(remaining_count);
    let Some(out) = out else {
        return Ok(n);
    };
    let byte_off = offset_words as usize * 2;
    let byte_len = n as usize * 2;
    if out.len() < byte_len {
        return Err(Exception::ServerDeviceFailure);
    }
    match &desc.read {
        RegisterRead::None => Err(Exception::IllegalDataAddress),
        RegisterRead::Constant(bytes) => {
            if bytes.len() != total as usize * 2 {
                return Err(Exception::ServerDeviceFailure);
            }
            out[..byte_len].copy_from_slice(&bytes[byte_off..byte_off + byte_len]);
            Ok(n)
        }
        RegisterRead::Cell(cells) => {
            if cells.len() < byte_off + byte_len {
                return Err(Exception::ServerDeviceFailure);
            }
            for (dst, cell) in out[..byte_len]
                .iter_mut()
                .zip(&cells[byte_off..byte_off + byte_len])
            {
                *dst = cell.get();
            }
            Ok(n)
        }
        RegisterRead::Callback(read) => {
            let mut full = [0u8; 16];
            let full_bytes = total as usize * 2;
            if full_bytes > full.len() {
                return Err(Exception::ServerDeviceFailure);
            }
            read(desc.address, &mut full[..full_bytes])?;
            out[..byte_len].copy_from_slice(&full[byte_off..byte_off + byte_len]);
            Ok(n)
        }
    }
}

/// Number of words of `desc` that a write touching
/// `[block_start, block_start + remaining_count)` may write, starting at
/// `offset_words` into the descriptor. `0` means the write is not allowed.
pub fn register_write_allowed(
    desc: &RegisterDescriptor<'_>,
    offset_words: u16,
    remaining_count: u16,
) -> u16 {
    if matches!(desc.write, RegisterWrite::None) {
        return 0;
    }
    if let Some(lock) = desc.write_lock {
        if lock(desc.address) {
            return 0;
        }
    }
    let total = desc.word_count();
    if offset_words >= total {
        return 0;
    }
    let n = (total - offset_words).min(remaining_count);
    if n < total && !desc.allow_partial_write {
        return 0;
    }
    n
}

/// Write `data` (big-endian, `n * 2` bytes) into `desc` at `offset_words`.
/// Caller must have checked [`register_write_allowed`] for the same range.
pub fn write_register(
    desc: &RegisterDescriptor<'_>,
    offset_words: u16,
    data: &[u8],
) -> Result<(), Exception> {
    let byte_off = offset_words as usize * 2;
    match &desc.write {
        RegisterWrite::None => return Err(Exception::ServerDeviceFailure),
        RegisterWrite::Cell(cells) => {
            if cells.len() < byte_off + data.len() {
                return Err(Exception::ServerDeviceFailure);
            }
            for (cell, byte) in cells[byte_off..byte_off + data.len()].iter().zip(data) {
                cell.set(*byte);
            }
        }
        RegisterWrite::Callback(write) => {
            if offset_words != 0 || data.len() != desc.word_count() as usize * 2 {
                // Partial callback writes would require read-modify-write
                // semantics the callback alone cannot provide atomically.
                return Err(Exception::ServerDeviceFailure);
            }
            write(desc.address, data)?;
        }
    }
    if let Some(hook) = desc.post_write {
        hook(desc.address);
    }
    Ok(())
}
