// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU (binary serial) framing.

use crate::instance::{Callbacks, Instance};
use crate::pdu::{
    handle_req, note_comm_error, note_no_response, note_received_frame, note_recv_event,
    DataTables,
};

/// Smallest legal RTU frame: 1 address byte, 1 PDU byte, 2 CRC bytes.
pub const MIN_FRAME_LEN: usize = 4;
/// Largest legal RTU frame.
pub const MAX_FRAME_LEN: usize = 256;

/// Standard Modbus CRC-16 (polynomial 0xA001, initial value 0xFFFF).
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Process a single, already-delimited RTU frame (`[addr][pdu][crc16 LE]`)
/// against `instance`, writing any reply frame into `res`.
///
/// Returns the number of bytes written into `res`; `0` means nothing should
/// be transmitted (malformed/unaddressed/broadcast frame, listen-only
/// mode, or an oversized response buffer).
pub fn process<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    tables: &DataTables<'_>,
    frame: &[u8],
    res: &mut [u8],
) -> usize {
    if frame.len() < MIN_FRAME_LEN || frame.len() > MAX_FRAME_LEN {
        #[cfg(feature = "log")]
        log::warn!("Dropping RTU frame of implausible length {}", frame.len());
        return 0;
    }
    note_received_frame(instance);

    let crc_pos = frame.len() - 2;
    let expected = crc16(&frame[..crc_pos]);
    let actual = u16::from_le_bytes([frame[crc_pos], frame[crc_pos + 1]]);
    if expected != actual {
        #[cfg(feature = "log")]
        log::warn!("RTU frame CRC mismatch: expected {expected:#06x}, got {actual:#06x}");
        note_comm_error(instance);
        return 0;
    }

    let addr = u16::from(frame[0]);
    let pdu = &frame[1..crc_pos];
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
    let framed_len = 1 + len + 2;
    if res.len() < framed_len {
        #[cfg(feature = "log")]
        log::warn!("Response buffer too small for RTU reply ({framed_len} bytes needed)");
        return 0;
    }
    res[0] = frame[0];
    res[1..1 + len].copy_from_slice(&body[..len]);
    let crc = crc16(&res[..1 + len]);
    res[1 + len..framed_len].copy_from_slice(&crc.to_le_bytes());
    framed_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::NoCallbacks;

    #[test]
    fn crc16_matches_the_reference_example() {
        // The classic Modicon Modbus protocol reference example.
        let frame = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        assert_eq!(crc16(&frame).to_le_bytes(), [0x76, 0x87]);
    }

    #[test]
    fn drops_frame_with_bad_crc() {
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables::empty();
        let frame = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x00, 0x00];
        let mut res = [0u8; 16];
        assert_eq!(process(&mut instance, &tables, &frame, &mut res), 0);
        assert_eq!(instance.counters().bus_comm_err, 1);
    }

    #[test]
    fn drops_frame_out_of_size_bounds() {
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables::empty();
        let mut res = [0u8; 16];
        assert_eq!(process(&mut instance, &tables, &[0x11], &mut res), 0);
        assert_eq!(instance.counters().bus_msg, 0);
    }

    #[test]
    fn unaddressed_frame_is_silently_dropped() {
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables::empty();
        let body = [0x12, 0x03, 0x00, 0x6B, 0x00, 0x03];
        let crc = crc16(&body).to_le_bytes();
        let frame = [body[0], body[1], body[2], body[3], body[4], body[5], crc[0], crc[1]];
        let mut res = [0u8; 16];
        assert_eq!(process(&mut instance, &tables, &frame, &mut res), 0);
    }

    #[test]
    fn broadcast_request_is_processed_but_not_answered() {
        use crate::model::{CoilDescriptor, CoilRead, CoilWrite};
        let desc = CoilDescriptor {
            address: 0x00AC,
            read: CoilRead::Constant(false),
            write: CoilWrite::Cell(&core::cell::Cell::new(0), 0),
            read_lock: None,
            write_lock: None,
            post_write: None,
        };
        let coils = [desc];
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables {
            coils: &coils,
            ..DataTables::empty()
        };
        // Write Single Coil, addr 0x00AC, ON, to the broadcast address.
        let body = [0x00, 0x05, 0x00, 0xAC, 0xFF, 0x00];
        let crc = crc16(&body).to_le_bytes();
        let frame = [
            body[0], body[1], body[2], body[3], body[4], body[5], crc[0], crc[1],
        ];
        let mut res = [0u8; 16];
        assert_eq!(process(&mut instance, &tables, &frame, &mut res), 0);
        assert_eq!(instance.counters().bus_msg, 1);
        assert_eq!(instance.counters().no_resp, 1);
    }
}
