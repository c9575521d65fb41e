// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::Exception;
use byteorder::{BigEndian, ByteOrder};

/// A bounds-checked cursor over a PDU buffer.
///
/// Every read/write advances the cursor and fails with
/// [`Exception::IllegalDataValue`] rather than panicking once the buffer is
/// exhausted, replacing the manual pointer arithmetic of the reference
/// implementation with checked slice indexing.
pub struct ReadCursor<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> ReadCursor<'b> {
    #[must_use]
    pub const fn new(buf: &'b [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, Exception> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(Exception::IllegalDataValue)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, Exception> {
        let end = self.pos.checked_add(2).ok_or(Exception::IllegalDataValue)?;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(Exception::IllegalDataValue)?;
        self.pos = end;
        Ok(BigEndian::read_u16(bytes))
    }

    /// Take `len` raw bytes without interpreting them.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'b [u8], Exception> {
        let end = self.pos.checked_add(len).ok_or(Exception::IllegalDataValue)?;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(Exception::IllegalDataValue)?;
        self.pos = end;
        Ok(bytes)
    }

    /// All bytes from the current position to the end.
    #[must_use]
    pub fn rest(&self) -> &'b [u8] {
        &self.buf[self.pos..]
    }
}

/// A bounds-checked cursor for building a PDU response into a caller-owned
/// buffer.
pub struct WriteCursor<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> WriteCursor<'b> {
    #[must_use]
    pub fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), Exception> {
        let byte = self
            .buf
            .get_mut(self.pos)
            .ok_or(Exception::ServerDeviceFailure)?;
        *byte = value;
        self.pos += 1;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), Exception> {
        let end = self
            .pos
            .checked_add(2)
            .ok_or(Exception::ServerDeviceFailure)?;
        let bytes = self
            .buf
            .get_mut(self.pos..end)
            .ok_or(Exception::ServerDeviceFailure)?;
        BigEndian::write_u16(bytes, value);
        self.pos = end;
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), Exception> {
        let end = self
            .pos
            .checked_add(data.len())
            .ok_or(Exception::ServerDeviceFailure)?;
        let bytes = self
            .buf
            .get_mut(self.pos..end)
            .ok_or(Exception::ServerDeviceFailure)?;
        bytes.copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    /// Remaining writable tail of the buffer, for handlers that produce
    /// their payload directly (e.g. packed coil bits).
    pub fn rest_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.pos..]
    }

    /// Overwrite `data` at an already-written position `at`, without moving
    /// the cursor. Used to patch a length-prefix byte once the length of
    /// what follows becomes known.
    pub fn overwrite(&mut self, at: usize, data: &[u8]) {
        debug_assert!(at + data.len() <= self.pos);
        self.buf[at..at + data.len()].copy_from_slice(data);
    }

    pub fn advance(&mut self, len: usize) -> Result<(), Exception> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(Exception::ServerDeviceFailure)?;
        if end > self.buf.len() {
            return Err(Exception::ServerDeviceFailure);
        }
        self.pos = end;
        Ok(())
    }
}
