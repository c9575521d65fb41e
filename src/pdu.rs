// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The PDU dispatcher (§4.6) and the per-function-code handlers (§4.5) it
//! routes to.

use crate::instance::{other_event, recv_event, send_event, Callbacks, Instance};
use crate::model::{
    coil_write_allowed, file_read, file_write, file_write_allowed, find, find_covering,
    read_coil, read_register, register_write_allowed, write_coil, write_register,
    CoilDescriptor, FileDescriptor, RegisterDescriptor,
};
use crate::{Exception, FunctionCode, ReadCursor, WriteCursor};

/// The user-declared descriptor tables a [`Instance`] dispatches requests
/// against. Borrowed for the duration of a single `handle_req` call.
pub struct DataTables<'a> {
    pub coils: &'a [CoilDescriptor<'a>],
    pub discrete_inputs: &'a [CoilDescriptor<'a>],
    pub holding_registers: &'a [RegisterDescriptor<'a>],
    pub input_registers: &'a [RegisterDescriptor<'a>],
    pub files: &'a [FileDescriptor<'a>],
}

impl<'a> DataTables<'a> {
    /// An instance with no accessible data at all; every FC backed by an
    /// empty table here is treated as unimplemented and falls through to
    /// [`Callbacks::handle_fn`], reporting `ILLEGAL_FN` if there is no
    /// fallback either.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            coils: &[],
            discrete_inputs: &[],
            holding_registers: &[],
            input_registers: &[],
            files: &[],
        }
    }
}

fn exception_send_event(exception: Exception) -> u8 {
    use Exception::*;
    send_event::BASE
        | match exception {
            IllegalFunction | IllegalDataAddress | IllegalDataValue => send_event::READ_EX,
            ServerDeviceFailure => send_event::ABORT_EX,
            Acknowledge | ServerDeviceBusy => send_event::BUSY_EX,
            NegativeAcknowledge => send_event::NAK_EX,
            MemoryParityError => 0,
        }
}

/// Dispatch a single request PDU (starting at the function-code byte)
/// against `instance` and `tables`, writing the response PDU into `res`.
///
/// Returns the number of response bytes written; `0` means no reply should
/// be sent (broadcast, listen-only mode, or Force Listen Only itself).
pub fn handle_req<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    tables: &DataTables<'_>,
    req: &[u8],
    res: &mut [u8],
) -> usize {
    let Some(&fn_code_byte) = req.first() else {
        return 0;
    };

    if instance.is_listen_only() {
        let is_restart = fn_code_byte == FunctionCode::Diagnostics.value()
            && req.len() >= 3
            && req[1] == 0x00
            && req[2] == 0x01;
        if !is_restart {
            instance.push_event(send_event::BASE | send_event::LISTEN_ONLY);
            return 0;
        }
    }

    instance.counters.msg = instance.counters.msg.wrapping_add(1);

    if res.is_empty() {
        return 0;
    }
    res[0] = fn_code_byte;
    let fn_code = FunctionCode::new(fn_code_byte);

    // A Diagnostics/Restart Communications Option request with the
    // clear-event-log data value (0xFF00) wipes the event log as part of
    // its own handling; the generic SEND event logged below must not
    // re-populate the log it just cleared.
    let clears_event_log = fn_code == FunctionCode::Diagnostics
        && req.get(1..5) == Some([0x00, 0x01, 0xFF, 0x00].as_slice());

    let mut body = WriteCursor::new(&mut res[1..]);
    let outcome = dispatch(instance, tables, fn_code, &req[1..], &mut body);
    let mut res_len = 1 + body.position();

    match outcome {
        Ok(()) => {
            if !matches!(
                fn_code,
                FunctionCode::Diagnostics
                    | FunctionCode::GetCommEventCounter
                    | FunctionCode::GetCommEventLog
            ) {
                instance.counters.comm_event = instance.counters.comm_event.wrapping_add(1);
            }
            if !clears_event_log {
                instance.push_event(send_event::BASE);
            }
        }
        Err(exception) => {
            res[0] = fn_code_byte | 0x80;
            if res.len() < 2 {
                return 0;
            }
            res[1] = exception as u8;
            res_len = 2;
            instance.counters.exception = instance.counters.exception.wrapping_add(1);
            match exception {
                Exception::NegativeAcknowledge => {
                    instance.counters.nak = instance.counters.nak.wrapping_add(1);
                }
                Exception::ServerDeviceBusy => {
                    instance.counters.busy = instance.counters.busy.wrapping_add(1);
                }
                _ => {}
            }
            instance.push_event(exception_send_event(exception));
        }
    }

    // Force Listen Only leaves `is_listen_only` true after its own handler
    // runs, which squelches its own reply; a restart that clears
    // listen-only mode (FC 0x08/0x01) is still answered normally, matching
    // how a master learns the device has left listen-only mode.
    if instance.is_listen_only() {
        return 0;
    }
    res_len
}

/// Called by the framing layers before [`handle_req`] to account for every
/// received frame, regardless of addressing or integrity.
pub fn note_received_frame<C: Callbacks>(instance: &mut Instance<'_, C>) {
    instance.counters.bus_msg = instance.counters.bus_msg.wrapping_add(1);
}

pub fn note_comm_error<C: Callbacks>(instance: &mut Instance<'_, C>) {
    instance.counters.bus_comm_err = instance.counters.bus_comm_err.wrapping_add(1);
    instance.push_event(recv_event::BASE | recv_event::COMM_ERR);
}

/// Called by the framing layers once they've decided a processed request's
/// reply must be suppressed because it was addressed to the broadcast
/// address.
pub fn note_no_response<C: Callbacks>(instance: &mut Instance<'_, C>) {
    instance.counters.no_resp = instance.counters.no_resp.wrapping_add(1);
}

/// Append a RECV event for a frame that was accepted for dispatch, with
/// `LISTEN_MODE`/`BROADCAST` bits set as they apply.
pub fn note_recv_event<C: Callbacks>(instance: &mut Instance<'_, C>, listen_mode: bool, broadcast: bool) {
    let mut event = recv_event::BASE;
    if listen_mode {
        event |= recv_event::LISTEN_MODE;
    }
    if broadcast {
        event |= recv_event::BROADCAST;
    }
    instance.push_event(event);
}

fn dispatch<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    tables: &DataTables<'_>,
    fn_code: FunctionCode,
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    match fn_code {
        FunctionCode::ReadCoils if !tables.coils.is_empty() => read_bits(tables.coils, req, res),
        FunctionCode::ReadDiscreteInputs if !tables.discrete_inputs.is_empty() => {
            read_bits(tables.discrete_inputs, req, res)
        }
        FunctionCode::ReadHoldingRegisters if !tables.holding_registers.is_empty() => {
            read_registers(tables.holding_registers, req, res)
        }
        FunctionCode::ReadInputRegisters if !tables.input_registers.is_empty() => {
            read_registers(tables.input_registers, req, res)
        }
        FunctionCode::WriteSingleCoil if !tables.coils.is_empty() => {
            write_single_coil(tables.coils, req, res)
        }
        FunctionCode::WriteSingleRegister if !tables.holding_registers.is_empty() => {
            write_single_register(tables.holding_registers, req, res)
        }
        FunctionCode::ReadExceptionStatus => read_exception_status(instance, res),
        FunctionCode::Diagnostics => diagnostics(instance, req, res),
        FunctionCode::GetCommEventCounter => get_comm_event_counter(instance, res),
        FunctionCode::GetCommEventLog => get_comm_event_log(instance, res),
        FunctionCode::WriteMultipleCoils if !tables.coils.is_empty() => {
            write_multiple_coils(instance, tables.coils, req, res)
        }
        FunctionCode::WriteMultipleRegisters if !tables.holding_registers.is_empty() => {
            write_multiple_registers(instance, tables.holding_registers, req, res)
        }
        FunctionCode::ReadFileRecord if !tables.files.is_empty() => {
            read_file_record(tables.files, req, res)
        }
        FunctionCode::WriteFileRecord if !tables.files.is_empty() => {
            write_file_record(instance, tables.files, req, res)
        }
        FunctionCode::MaskWriteRegister if !tables.holding_registers.is_empty() => {
            mask_write_register(tables.holding_registers, req, res)
        }
        FunctionCode::ReadWriteMultipleRegisters if !tables.holding_registers.is_empty() => {
            read_write_multiple_registers(tables.holding_registers, req, res)
        }
        FunctionCode::ReportServerId | FunctionCode::Custom(_) => {
            fallback(instance, fn_code, req, res)
        }
        // A known FC whose backing table is empty is unimplemented on this
        // instance; route it through the same fallback as a genuinely
        // unknown FC rather than answering `ILLEGAL_DATA_ADDR`.
        _ => fallback(instance, fn_code, req, res),
    }
}

/// Reconstructs the full request PDU (fn code + body) and offers it to
/// [`Callbacks::handle_fn`]. Used both for FCs this engine never implements
/// (`ReportServerId`, `Custom`) and for known FCs left unconfigured (an
/// empty backing table).
fn fallback<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    fn_code: FunctionCode,
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let req_pdu_len = req.len() + 1;
    let fn_code_byte = fn_code.value();
    let mut req_buf = [0u8; 253];
    if req_pdu_len > req_buf.len() {
        return Err(Exception::IllegalDataValue);
    }
    req_buf[0] = fn_code_byte;
    req_buf[1..req_pdu_len].copy_from_slice(req);
    let mut res_buf = [0u8; 253];
    match instance.callbacks.handle_fn(&req_buf[..req_pdu_len], &mut res_buf) {
        Some(len) if len >= 1 => {
            res.write_bytes(&res_buf[1..len])?;
            Ok(())
        }
        _ => Err(Exception::IllegalFunction),
    }
}

fn read_bits(
    table: &[CoilDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let addr = cur.read_u16()?;
    let qty = cur.read_u16()?;
    if qty == 0 || qty > 2000 {
        return Err(Exception::IllegalDataValue);
    }
    let byte_count = (qty as usize).div_ceil(8);
    res.write_u8(byte_count as u8)?;
    let out = res.rest_mut();
    if out.len() < byte_count {
        return Err(Exception::ServerDeviceFailure);
    }
    out[..byte_count].fill(0);
    for i in 0..qty {
        let a = addr.wrapping_add(i);
        let value = find(table, a, |d| d.address).map(read_coil);
        match value {
            None | Some(Err(_)) if i == 0 => return Err(Exception::IllegalDataAddress),
            Some(Ok(true)) => out[(i / 8) as usize] |= 1 << (i % 8),
            _ => {}
        }
    }
    res.advance(byte_count)
}

fn read_registers(
    table: &[RegisterDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let addr = cur.read_u16()?;
    let qty = cur.read_u16()?;
    if qty == 0 || qty > 125 {
        return Err(Exception::IllegalDataValue);
    }
    res.write_u8((qty as usize * 2) as u8)?;
    let out = res.rest_mut();
    if out.len() < qty as usize * 2 {
        return Err(Exception::ServerDeviceFailure);
    }
    let mut pos: u16 = 0;
    let mut first = true;
    while pos < qty {
        let a = addr.wrapping_add(pos);
        let remaining = qty - pos;
        match find_covering(table, a) {
            None => {
                if first {
                    return Err(Exception::IllegalDataAddress);
                }
                out[pos as usize * 2..pos as usize * 2 + 2].fill(0);
                pos += 1;
            }
            Some((desc, offset)) => {
                match read_register(desc, offset, remaining, Some(&mut out[pos as usize * 2..])) {
                    Ok(n) => pos += n.max(1),
                    Err(e) => {
                        if first {
                            return Err(e);
                        }
                        out[pos as usize * 2..pos as usize * 2 + 2].fill(0);
                        pos += 1;
                    }
                }
            }
        }
        first = false;
    }
    res.advance(qty as usize * 2)
}

fn write_single_coil(
    table: &[CoilDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let addr = cur.read_u16()?;
    let raw = cur.read_u16()?;
    let value = match raw {
        0xFF00 => true,
        0x0000 => false,
        _ => return Err(Exception::IllegalDataValue),
    };
    let desc = find(table, addr, |d| d.address).ok_or(Exception::IllegalDataAddress)?;
    if !coil_write_allowed(desc) {
        return Err(Exception::IllegalDataAddress);
    }
    write_coil(desc, value)?;
    res.write_u16(addr)?;
    res.write_u16(raw)
}

fn write_single_register(
    table: &[RegisterDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let addr = cur.read_u16()?;
    let value = cur.read_u16()?;
    let (desc, offset) = find_covering(table, addr).ok_or(Exception::IllegalDataAddress)?;
    if register_write_allowed(desc, offset, 1) == 0 {
        return Err(Exception::IllegalDataAddress);
    }
    let bytes = value.to_be_bytes();
    write_register(desc, offset, &bytes)?;
    res.write_u16(addr)?;
    res.write_u16(value)
}

fn read_exception_status<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let status = instance
        .callbacks
        .read_exception_status()
        .ok_or(Exception::IllegalFunction)?;
    res.write_u8(status)
}

fn diagnostics<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let sub = cur.read_u16()?;
    if sub == 0x0000 {
        // Return Query Data: echo the entire request PDU (sub-fn + data +
        // whatever trailing bytes follow) byte for byte.
        return res.write_bytes(req);
    }
    if req.len() != 4 {
        return Err(Exception::IllegalDataValue);
    }
    let data = cur.read_u16()?;
    match sub {
        0x0001 => {
            if data != 0x0000 && data != 0xFF00 {
                return Err(Exception::IllegalDataValue);
            }
            instance.callbacks.request_restart()?;
            instance.restart(data == 0xFF00);
            res.write_u16(sub)?;
            res.write_u16(data)
        }
        0x0002 => {
            if data != 0 {
                return Err(Exception::IllegalDataValue);
            }
            let reg = instance.callbacks.read_diagnostic_register();
            res.write_u16(sub)?;
            res.write_u16(reg)
        }
        0x0003 => {
            let [hi, lo] = data.to_be_bytes();
            if hi > 127 || lo != 0 {
                return Err(Exception::IllegalDataValue);
            }
            #[cfg(feature = "ascii")]
            {
                instance.ascii_delimiter = hi;
            }
            res.write_u16(sub)?;
            res.write_u16(data)
        }
        0x0004 => {
            if data != 0 {
                return Err(Exception::IllegalDataValue);
            }
            // The dispatcher squelches the reply once `is_listen_only` is
            // observed true after this handler returns (step 9).
            instance.is_listen_only = true;
            instance.push_event(other_event::ENTERED_LISTEN_ONLY);
            res.write_u16(sub)?;
            res.write_u16(data)
        }
        0x000A => {
            if data != 0 {
                return Err(Exception::IllegalDataValue);
            }
            instance.reset_counters();
            instance.callbacks.reset_diagnostics();
            res.write_u16(sub)?;
            res.write_u16(0)
        }
        0x000B..=0x0012 => {
            if data != 0 {
                return Err(Exception::IllegalDataValue);
            }
            let value = match sub {
                0x000B => instance.counters.bus_msg,
                0x000C => instance.counters.bus_comm_err,
                0x000D => instance.counters.exception,
                0x000E => instance.counters.msg,
                0x000F => instance.counters.no_resp,
                0x0010 => instance.counters.nak,
                0x0011 => instance.counters.busy,
                0x0012 => instance.counters.bus_char_overrun,
                _ => unreachable!(),
            };
            res.write_u16(sub)?;
            res.write_u16(value)
        }
        0x0014 => {
            if data != 0 {
                return Err(Exception::IllegalDataValue);
            }
            instance.counters.bus_char_overrun = 0;
            res.write_u16(sub)?;
            res.write_u16(0)
        }
        _ => Err(Exception::IllegalFunction),
    }
}

fn get_comm_event_counter<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    res.write_u16(instance.status)?;
    res.write_u16(instance.counters.comm_event)
}

fn get_comm_event_log<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let count = instance.event_log.count();
    res.write_u8((6 + count) as u8)?;
    res.write_u16(instance.status)?;
    res.write_u16(instance.counters.comm_event)?;
    res.write_u16(instance.counters.bus_msg)?;
    for i in 0..count {
        res.write_u8(instance.event_log.get(i).unwrap_or(0))?;
    }
    Ok(())
}

fn write_multiple_coils<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    table: &[CoilDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let addr = cur.read_u16()?;
    let qty = cur.read_u16()?;
    let byte_count = cur.read_u8()?;
    if qty == 0 || qty > 1968 || byte_count as usize != (qty as usize).div_ceil(8) {
        return Err(Exception::IllegalDataValue);
    }
    let data = cur.read_bytes(byte_count as usize)?;

    for i in 0..qty {
        let a = addr.wrapping_add(i);
        let desc = find(table, a, |d| d.address).ok_or(Exception::IllegalDataAddress)?;
        if !coil_write_allowed(desc) {
            return Err(Exception::IllegalDataAddress);
        }
    }
    for i in 0..qty {
        let a = addr.wrapping_add(i);
        let desc = find(table, a, |d| d.address).ok_or(Exception::IllegalDataAddress)?;
        let bit = (data[(i / 8) as usize] >> (i % 8)) & 1 != 0;
        write_coil(desc, bit)?;
    }
    instance.callbacks.commit_coils_write();
    res.write_u16(addr)?;
    res.write_u16(qty)
}

fn write_multiple_registers<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    table: &[RegisterDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let addr = cur.read_u16()?;
    let qty = cur.read_u16()?;
    let byte_count = cur.read_u8()?;
    if qty == 0 || qty > 123 || byte_count as usize != qty as usize * 2 {
        return Err(Exception::IllegalDataValue);
    }
    let data = cur.read_bytes(byte_count as usize)?;

    let mut pos = 0u16;
    while pos < qty {
        let a = addr.wrapping_add(pos);
        let (desc, offset) = find_covering(table, a).ok_or(Exception::IllegalDataAddress)?;
        let n = register_write_allowed(desc, offset, qty - pos);
        if n == 0 {
            return Err(Exception::IllegalDataAddress);
        }
        pos += n;
    }
    let mut pos = 0u16;
    while pos < qty {
        let a = addr.wrapping_add(pos);
        let (desc, offset) = find_covering(table, a).ok_or(Exception::IllegalDataAddress)?;
        let n = register_write_allowed(desc, offset, qty - pos);
        let byte_off = pos as usize * 2;
        write_register(desc, offset, &data[byte_off..byte_off + n as usize * 2])?;
        pos += n;
    }
    instance.callbacks.commit_regs_write();
    res.write_u16(addr)?;
    res.write_u16(qty)
}

fn read_file_record(
    files: &[FileDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let byte_count = cur.read_u8()?;
    if !(7..=245).contains(&byte_count) || byte_count % 7 != 0 {
        return Err(Exception::IllegalDataValue);
    }
    let sub_reqs = cur.read_bytes(byte_count as usize)?;

    let count_pos = res.position();
    res.write_u8(0)?;
    let mut total_sub_len = 0usize;

    for chunk in sub_reqs.chunks_exact(7) {
        let mut c = ReadCursor::new(chunk);
        let reftype = c.read_u8()?;
        let file_no = c.read_u16()?;
        let record_no = c.read_u16()?;
        let record_len = c.read_u16()?;
        if reftype != 0x06 || file_no == 0 || record_no > 0x270F || record_len == 0 {
            return Err(Exception::IllegalDataValue);
        }
        let file = find(files, file_no, |f| f.file_no).ok_or(Exception::IllegalDataAddress)?;

        let sub_len = 1 + 2 * record_len as usize;
        total_sub_len += 1 + sub_len;
        if total_sub_len > 245 {
            return Err(Exception::IllegalDataValue);
        }

        res.write_u8(sub_len as u8)?;
        res.write_u8(0x06)?;
        let out = res.rest_mut();
        let data_len = record_len as usize * 2;
        if out.len() < data_len {
            return Err(Exception::ServerDeviceFailure);
        }
        file_read(file, record_no, record_len, &mut out[..data_len])?;
        res.advance(data_len)?;
    }

    let total_byte_count = 1 + total_sub_len;
    res.overwrite(count_pos, &[total_byte_count as u8]);
    Ok(())
}

struct WriteFileSubReq<'a> {
    file_no: u16,
    record_no: u16,
    record_len: u16,
    data: &'a [u8],
}

fn parse_write_file_sub_req(bytes: &[u8]) -> Result<WriteFileSubReq<'_>, Exception> {
    let mut c = ReadCursor::new(bytes);
    let reftype = c.read_u8()?;
    let file_no = c.read_u16()?;
    let record_no = c.read_u16()?;
    let record_len = c.read_u16()?;
    if reftype != 0x06 || file_no == 0 || record_no > 0x270F || record_len == 0 {
        return Err(Exception::IllegalDataValue);
    }
    let data = c.read_bytes(record_len as usize * 2)?;
    Ok(WriteFileSubReq {
        file_no,
        record_no,
        record_len,
        data,
    })
}

fn write_file_record<C: Callbacks>(
    instance: &mut Instance<'_, C>,
    files: &[FileDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let byte_count = cur.read_u8()?;
    let sub_reqs = cur.read_bytes(byte_count as usize)?;

    // Pre-validate every sub-request's writability before applying any.
    let mut remaining = sub_reqs;
    while !remaining.is_empty() {
        if remaining.len() < 7 {
            return Err(Exception::IllegalDataValue);
        }
        let sub = parse_write_file_sub_req(remaining)?;
        let file = find(files, sub.file_no, |f| f.file_no).ok_or(Exception::IllegalDataAddress)?;
        file_write_allowed(file, sub.record_no, sub.record_len)?;
        remaining = &remaining[7 + sub.data.len()..];
    }

    let mut remaining = sub_reqs;
    while !remaining.is_empty() {
        let sub = parse_write_file_sub_req(remaining)?;
        let file = find(files, sub.file_no, |f| f.file_no).ok_or(Exception::IllegalDataAddress)?;
        file_write(file, sub.record_no, sub.record_len, sub.data)?;
        remaining = &remaining[7 + sub.data.len()..];
    }
    instance.callbacks.commit_regs_write();

    res.write_u8(byte_count)?;
    res.write_bytes(sub_reqs)
}

fn mask_write_register(
    table: &[RegisterDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let addr = cur.read_u16()?;
    let and_mask = cur.read_u16()?;
    let or_mask = cur.read_u16()?;

    let (desc, offset) = find_covering(table, addr).ok_or(Exception::IllegalDataAddress)?;
    if register_write_allowed(desc, offset, 1) == 0 {
        return Err(Exception::IllegalDataAddress);
    }
    let mut current = [0u8; 2];
    read_register(desc, offset, 1, Some(&mut current))?;
    let current = u16::from_be_bytes(current);
    let updated = (current & and_mask) | (or_mask & !and_mask);
    write_register(desc, offset, &updated.to_be_bytes())?;

    res.write_u16(addr)?;
    res.write_u16(and_mask)?;
    res.write_u16(or_mask)
}

fn read_write_multiple_registers(
    table: &[RegisterDescriptor<'_>],
    req: &[u8],
    res: &mut WriteCursor<'_>,
) -> Result<(), Exception> {
    let mut cur = ReadCursor::new(req);
    let read_addr = cur.read_u16()?;
    let read_qty = cur.read_u16()?;
    let write_addr = cur.read_u16()?;
    let write_qty = cur.read_u16()?;
    let write_byte_count = cur.read_u8()?;
    if read_qty == 0
        || read_qty > 125
        || write_qty == 0
        || write_qty > 121
        || write_byte_count as usize != write_qty as usize * 2
    {
        return Err(Exception::IllegalDataValue);
    }
    let write_data = cur.read_bytes(write_byte_count as usize)?;

    let mut pos = 0u16;
    while pos < write_qty {
        let a = write_addr.wrapping_add(pos);
        let (desc, offset) = find_covering(table, a).ok_or(Exception::IllegalDataAddress)?;
        let n = register_write_allowed(desc, offset, write_qty - pos);
        if n == 0 {
            return Err(Exception::IllegalDataAddress);
        }
        pos += n;
    }
    let mut pos = 0u16;
    while pos < write_qty {
        let a = write_addr.wrapping_add(pos);
        let (desc, offset) = find_covering(table, a).ok_or(Exception::IllegalDataAddress)?;
        let n = register_write_allowed(desc, offset, write_qty - pos);
        let byte_off = pos as usize * 2;
        write_register(desc, offset, &write_data[byte_off..byte_off + n as usize * 2])?;
        pos += n;
    }

    res.write_u8((read_qty as usize * 2) as u8)?;
    let out = res.rest_mut();
    if out.len() < read_qty as usize * 2 {
        return Err(Exception::ServerDeviceFailure);
    }
    let mut pos = 0u16;
    let mut first = true;
    while pos < read_qty {
        let a = read_addr.wrapping_add(pos);
        let remaining = read_qty - pos;
        match find_covering(table, a) {
            None => {
                if first {
                    return Err(Exception::IllegalDataAddress);
                }
                out[pos as usize * 2..pos as usize * 2 + 2].fill(0);
                pos += 1;
            }
            Some((desc, offset)) => {
                match read_register(desc, offset, remaining, Some(&mut out[pos as usize * 2..])) {
                    Ok(n) => pos += n.max(1),
                    Err(e) => {
                        if first {
                            return Err(e);
                        }
                        out[pos as usize * 2..pos as usize * 2 + 2].fill(0);
                        pos += 1;
                    }
                }
            }
        }
        first = false;
    }
    res.advance(read_qty as usize * 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::NoCallbacks;
    use crate::model::{
        CoilDescriptor, CoilRead, CoilWrite, FileDescriptor, RegisterRead, RegisterType,
        RegisterWrite,
    };
    use core::cell::Cell;

    #[test]
    fn read_holding_registers_example() {
        // Three registers at 0x006B all holding 0x4242 (spec §8 scenario 1/3).
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
        let req = [0x03, 0x00, 0x6B, 0x00, 0x03];
        let mut res = [0u8; 64];
        let n = handle_req(&mut instance, &tables, &req, &mut res);
        assert_eq!(&res[..n], &[0x03, 0x06, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42]);
    }

    #[test]
    fn read_file_record_two_sub_requests() {
        // spec §8 scenario 4.
        let file4 = [
            RegisterDescriptor {
                address: 1,
                ty: RegisterType::U16,
                read: RegisterRead::Constant(&[0x12, 0x34]),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
            RegisterDescriptor {
                address: 2,
                ty: RegisterType::U16,
                read: RegisterRead::Constant(&[0xAB, 0xCD]),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
        ];
        let file3 = [
            RegisterDescriptor {
                address: 0x0009,
                ty: RegisterType::U16,
                read: RegisterRead::Constant(&[0xDE, 0xAD]),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
            RegisterDescriptor {
                address: 0x000A,
                ty: RegisterType::U16,
                read: RegisterRead::Constant(&[0xBE, 0xEF]),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
        ];
        let files = [
            FileDescriptor { file_no: 3, records: &file3 },
            FileDescriptor { file_no: 4, records: &file4 },
        ];
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables { files: &files, ..DataTables::empty() };
        let req = [
            0x14, 0x0E, 0x06, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x06, 0x00, 0x03, 0x00, 0x09,
            0x00, 0x02,
        ];
        let mut res = [0u8; 64];
        let n = handle_req(&mut instance, &tables, &req, &mut res);
        assert_eq!(
            &res[..n],
            &[
                0x14, 0x0C, 0x05, 0x06, 0x12, 0x34, 0xAB, 0xCD, 0x05, 0x06, 0xDE, 0xAD, 0xBE, 0xEF
            ]
        );
    }

    #[test]
    fn write_multiple_registers_pre_validates_atomically() {
        // spec §8 scenario 6: second of three targets is missing, so nothing
        // is written and the reply is the exception `90 02`.
        let cell0 = [Cell::new(0xAAu8), Cell::new(0xAA)];
        let cell2 = [Cell::new(0), Cell::new(0)];
        let regs = [
            RegisterDescriptor {
                address: 0,
                ty: RegisterType::U16,
                read: RegisterRead::Cell(&cell0),
                write: RegisterWrite::Cell(&cell0),
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
            RegisterDescriptor {
                address: 2,
                ty: RegisterType::U16,
                read: RegisterRead::Cell(&cell2),
                write: RegisterWrite::Cell(&cell2),
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
        ];
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables { holding_registers: &regs, ..DataTables::empty() };
        let req = [
            0x10, 0x00, 0x00, 0x00, 0x03, 0x06, 0x11, 0x11, 0x22, 0x22, 0x33, 0x33,
        ];
        let mut res = [0u8; 64];
        let n = handle_req(&mut instance, &tables, &req, &mut res);
        assert_eq!(&res[..n], &[0x90, 0x02]);
        assert_eq!(cell0[0].get(), 0xAA);
        assert_eq!(cell0[1].get(), 0xAA);
    }

    #[test]
    fn mask_write_register_identity_mask_leaves_value_unchanged() {
        let cell = [Cell::new(0x12u8), Cell::new(0x34)];
        let regs = [RegisterDescriptor {
            address: 0x10,
            ty: RegisterType::U16,
            read: RegisterRead::Cell(&cell),
            write: RegisterWrite::Cell(&cell),
            read_lock: None,
            write_lock: None,
            allow_partial_write: false,
            post_write: None,
        }];
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables { holding_registers: &regs, ..DataTables::empty() };
        let req = [0x16, 0x00, 0x10, 0xFF, 0xFF, 0x00, 0x00];
        let mut res = [0u8; 16];
        let n = handle_req(&mut instance, &tables, &req, &mut res);
        assert_eq!(&res[..n], &req);
        assert_eq!((cell[0].get(), cell[1].get()), (0x12, 0x34));
    }

    #[test]
    fn diagnostics_loopback_echoes_request() {
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables::empty();
        let req = [0x08, 0x00, 0x00, 0xAB, 0xCD];
        let mut res = [0u8; 16];
        let n = handle_req(&mut instance, &tables, &req, &mut res);
        assert_eq!(&res[..n], &req);
    }

    #[test]
    fn listen_only_restart_clears_event_log_without_repopulating() {
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables::empty();
        let mut res = [0u8; 16];

        // Force Listen Only Mode (sub 0x0004): squelched, logs an event.
        let force_listen = [0x08, 0x00, 0x04, 0x00, 0x00];
        assert_eq!(handle_req(&mut instance, &tables, &force_listen, &mut res), 0);
        assert!(instance.is_listen_only());
        assert!(instance.event_log().count() > 0);

        // Restart Communications Option with data=0xFF00: clears the log,
        // and must not immediately re-populate it with its own SEND event.
        let restart = [0x08, 0x00, 0x01, 0xFF, 0x00];
        let n = handle_req(&mut instance, &tables, &restart, &mut res);
        assert_eq!(&res[..n], &restart);
        assert!(!instance.is_listen_only());
        assert_eq!(instance.event_log().count(), 0);

        // FC 0x0C must report bytecount 6 (no events).
        let get_log = [0x0C];
        handle_req(&mut instance, &tables, &get_log, &mut res);
        assert_eq!(res[1], 6);
    }

    #[test]
    fn unimplemented_fc_with_no_fallback_is_illegal_function() {
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables::empty();
        let req = [0x11]; // Report Server ID, no handle_fn override
        let mut res = [0u8; 16];
        let n = handle_req(&mut instance, &tables, &req, &mut res);
        assert_eq!(&res[..n], &[0x91, 0x01]);
    }

    struct EchoFallback;

    impl Callbacks for EchoFallback {
        fn handle_fn(&mut self, req: &[u8], res: &mut [u8]) -> Option<usize> {
            res[..req.len()].copy_from_slice(req);
            Some(req.len())
        }
    }

    #[test]
    fn empty_table_falls_through_to_handle_fn_fallback() {
        // Read Coils with no coil table configured at all must be treated as
        // unimplemented, not as ILLEGAL_DATA_ADDR.
        let mut cb = EchoFallback;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables::empty();
        let req = [0x01, 0x00, 0x00, 0x00, 0x08];
        let mut res = [0u8; 16];
        let n = handle_req(&mut instance, &tables, &req, &mut res);
        assert_eq!(&res[..n], &req);
    }

    #[test]
    fn write_single_coil_with_no_write_binding_is_device_failure() {
        let desc = CoilDescriptor {
            address: 1,
            read: CoilRead::Constant(false),
            write: CoilWrite::None,
            read_lock: None,
            write_lock: None,
            post_write: None,
        };
        let coils = [desc];
        let mut cb = NoCallbacks;
        let mut instance = Instance::new(17, &mut cb);
        let tables = DataTables { coils: &coils, ..DataTables::empty() };
        let req = [0x05, 0x00, 0x01, 0xFF, 0x00];
        let mut res = [0u8; 16];
        let n = handle_req(&mut instance, &tables, &req, &mut res);
        assert_eq!(&res[..n], &[0x85, 0x04]);
    }
}
