// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP (MBAP) framing.

use crate::instance::{Callbacks, Instance};
use crate::pdu::{handle_req, note_no_response, note_received_frame, note_recv_event, DataTables};
use byteorder::{BigEndian, ByteOrder};

/// Smallest legal MBAP frame: 7-byte header plus a 1-byte PDU.
pub const MIN_FRAME_LEN: usize = 8;
/// Largest legal MBAP frame.
pub const MAX_FRAME_LEN: usize = 260;

/// Process a single MBAP frame
/// (`[txn_id:u16][proto_id:u16=0][length:u16][unit_id:u8][pdu:...]`)
/// against `instance`, writing any reply frame into `res`.
///
/// Returns the number of bytes written into `res`; `0` means nothing
/// should be transmitted (malformed frame, unaddressed unit, broadcast, or
/// an oversized response buffer).
pub fn process<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    tables: &DataTables<'_>,
    frame: &[u8],
    res: &mut [u8],
) -> usize {
    if frame.len() < MIN_FRAME_LEN || frame.len() > MAX_FRAME_LEN {
        #[cfg(feature = "log")]
        log::warn!("Dropping TCP frame of implausible length {}", frame.len());
        return 0;
    }

    let transaction_id = BigEndian::read_u16(&frame[0..2]);
    let protocol_id = BigEndian::read_u16(&frame[2..4]);
    let length = BigEndian::read_u16(&frame[4..6]);
    let unit_id = frame[6];
    let pdu = &frame[7..];

    if protocol_id != 0 {
        #[cfg(feature = "log")]
        log::warn!("Dropping TCP frame with non-Modbus protocol id {protocol_id}");
        return 0;
    }
    if length as usize != 1 + pdu.len() {
        #[cfg(feature = "log")]
        log::warn!("Dropping TCP frame with inconsistent length field {length}");
        return 0;
    }

    note_received_frame(instance);

    let addr = u16::from(unit_id);
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
    let framed_len = 7 + len;
    if res.len() < framed_len {
        #[cfg(feature = "log")]
        log::warn!("Response buffer too small for TCP reply ({framed_len} bytes needed)");
        return 0;
    }
    BigEndian::write_u16(&mut res[0..2], transaction_id);
    res[2..4].fill(0);
    BigEndian::write_u16(&mut res[4..6], (1 + len) as u16);
    res[6] = unit_id;
    res[7..framed_len].copy_from_slice(&body[..len]);
    framed_len
}
