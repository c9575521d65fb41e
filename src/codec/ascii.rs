// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus ASCII framing: `:` + hex(addr) + hex(pdu) + hex(lrc) + CR + delim.

use crate::instance::{Callbacks, Instance};
use crate::pdu::{
    handle_req, note_comm_error, note_no_response, note_received_frame, note_recv_event,
    DataTables,
};
use crate::FramingError;

/// Smallest legal ASCII frame (`:` + 2 addr + 2 pdu + 2 lrc + CR + LF).
pub const MIN_FRAME_LEN: usize = 11;
/// Largest legal ASCII frame.
pub const MAX_FRAME_LEN: usize = 513;

const START: u8 = b':';
const CR: u8 = 0x0D;

/// Largest binary payload (`addr + pdu + lrc`) an ASCII frame can carry.
const MAX_BINARY_LEN: usize = (MAX_FRAME_LEN - 4) / 2;

fn hex_nibble(c: u8) -> Result<u8, FramingError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(FramingError::InvalidHexChar(c)),
    }
}

fn decode_hex(src: &[u8], dst: &mut [u8]) -> Result<(), FramingError> {
    if src.len() != dst.len() * 2 {
        return Err(FramingError::BufferSize);
    }
    for (pair, byte) in src.chunks_exact(2).zip(dst.iter_mut()) {
        *byte = (hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?;
    }
    Ok(())
}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

fn encode_hex(src: &[u8], dst: &mut [u8]) {
    debug_assert_eq!(dst.len(), src.len() * 2);
    for (byte, pair) in src.iter().zip(dst.chunks_exact_mut(2)) {
        pair[0] = HEX_DIGITS[(byte >> 4) as usize];
        pair[1] = HEX_DIGITS[(byte & 0x0F) as usize];
    }
}

fn lrc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Process a single ASCII character frame against `instance`, writing any
/// reply frame (including the trailing delimiter) into `res`.
///
/// Returns the number of bytes written into `res`; `0` means nothing
/// should be transmitted.
pub fn process<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    tables: &DataTables<'_>,
    frame: &[u8],
    res: &mut [u8],
) -> usize {
    if frame.len() < MIN_FRAME_LEN || frame.len() > MAX_FRAME_LEN {
        #[cfg(feature = "log")]
        log::warn!("Dropping ASCII frame of implausible length {}", frame.len());
        return 0;
    }
    if frame[0] != START || frame[frame.len() - 2] != CR {
        #[cfg(feature = "log")]
        log::warn!("Dropping ASCII frame with malformed envelope");
        return 0;
    }
    let hex_body = &frame[1..frame.len() - 2];
    if hex_body.len() % 2 != 0 {
        #[cfg(feature = "log")]
        log::warn!("Dropping ASCII frame with odd hex digit count");
        return 0;
    }
    let binary_len = hex_body.len() / 2;
    if binary_len < 2 || binary_len > MAX_BINARY_LEN {
        return 0;
    }

    let mut binary = [0u8; MAX_BINARY_LEN];
    if decode_hex(hex_body, &mut binary[..binary_len]).is_err() {
        #[cfg(feature = "log")]
        log::warn!("Dropping ASCII frame with non-hex characters");
        return 0;
    }

    note_received_frame(instance);

    let lrc_pos = binary_len - 1;
    let expected_lrc = lrc(&binary[..lrc_pos]);
    let actual_lrc = binary[lrc_pos];
    if expected_lrc != actual_lrc {
        note_comm_error(instance);
        return 0;
    }

    let addr = u16::from(binary[0]);
    let pdu = &binary[1..lrc_pos];
    let broadcast = addr == crate::BROADCAST_ADDR;
    if !instance.accepts_address(addr) {
        note_recv_event(instance, instance.is_listen_only(), false);
        return 0;
    }
    note_recv_event(instance, instance.is_listen_only(), broadcast);

    let mut body = [0u8; 253];
    let len = handle_req(instance, tables, pdu, &mut body);
    if broadcast {
        note_no_response(instance);
        return 0;
    }
    if len == 0 {
        return 0;
    }

    let delim = instance.ascii_delimiter();
    let response_binary_len = 1 + len + 1;
    let framed_len = 1 + response_binary_len * 2 + 2;
    if res.len() < framed_len {
        #[cfg(feature = "log")]
        log::warn!("Response buffer too small for ASCII reply ({framed_len} bytes needed)");
        return 0;
    }

    let mut response_binary = [0u8; MAX_BINARY_LEN];
    response_binary[0] = addr as u8;
    response_binary[1..1 + len].copy_from_slice(&body[..len]);
    response_binary[1 + len] = lrc(&response_binary[..1 + len]);

    res[0] = START;
    encode_hex(
        &response_binary[..response_binary_len],
        &mut res[1..1 + response_binary_len * 2],
    );
    res[1 + response_binary_len * 2] = CR;
    res[2 + response_binary_len * 2] = delim;
    framed_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::NoCallbacks;
    use crate::model::{RegisterDescriptor, RegisterRead, RegisterType, RegisterWrite};
    use core::cell::Cell;

    #[test]
    fn lrc_matches_manual_calculation() {
        // slave 0x11, FC 0x03, addr 0x006B, qty 0x0003
        let data = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        let sum: u8 = data.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        assert_eq!(lrc(&data), (!sum).wrapping_add(1));
    }

    #[test]
    fn hex_round_trips() {
        let src = [0x11, 0x03, 0xAB];
        let mut hex = [0u8; 6];
        encode_hex(&src, &mut hex);
        assert_eq!(&hex, b"1103AB");
        let mut back = [0u8; 3];
        decode_hex(&hex, &mut back).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn read_holding_registers_example() {
        // Three registers at 0x006B all holding 0x4242.
        let cells = [
            Cell::new(0x42u8),
            Cell::new(0x42),
            Cell::new(0x42),
            Cell::new(0x42),
            Cell::new(0x42),
            Cell::new(0x42),
        ];
        let regs = [
            RegisterDescriptor {
                address: 0x006B,
                ty: RegisterType::U16,
                read: RegisterRead::Cell(&cells[0..2]),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
            RegisterDescriptor {
                address: 0x006C,
                ty: RegisterType::U16,
                read: RegisterRead::Cell(&cells[2..4]),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
            RegisterDescriptor {
                address: 0x006D,
                ty: RegisterType::U16,
                read: RegisterRead::Cell(&cells[4..6]),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
        ];
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables {
            holding_registers: &regs,
            ..DataTables::empty()
        };
        let frame = b":1103006B00037E\r\n";
        let mut res = [0u8; 64];
        let n = process(&mut instance, &tables, frame, &mut res);
        assert_eq!(&res[..n], b":1103064242424242423C\r\n");
    }

    #[test]
    fn broadcast_request_is_processed_but_not_answered() {
        use crate::model::{CoilDescriptor, CoilRead, CoilWrite};
        let cell = Cell::new(0u8);
        let desc = CoilDescriptor {
            address: 0x00AC,
            read: CoilRead::Cell(&cell, 0),
            write: CoilWrite::Cell(&cell, 0),
            read_lock: None,
            write_lock: None,
            post_write: None,
        };
        let coils = [desc];
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(0x11, &mut cb);
        let tables = DataTables {
            coils: &coils,
            ..DataTables::empty()
        };
        // Write Single Coil, addr 0x00AC, ON, sent to the broadcast address.
        let frame = b":000500ACFF0050\r\n";
        let mut res = [0u8; 64];
        assert_eq!(process(&mut instance, &tables, frame, &mut res), 0);
        assert!(cell.get() & 1 != 0);
        assert_eq!(instance.counters().no_resp, 1);
    }
}
