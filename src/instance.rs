// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-server mutable state: counters, status word, the communication-event
//! ring buffer, and the host callback hooks a [`Instance`] is parameterized
//! over.

use crate::Address;

/// Host-supplied hooks invoked synchronously from inside `handle_req`.
///
/// Every method has a default no-op/unsupported implementation so a host
/// only needs to override the ones it actually backs. Implementors must
/// return quickly and must not re-enter the [`Instance`] that called them.
pub trait Callbacks {
    /// Requests a comms restart (FC 0x08/0x01). Returning `Err` aborts the
    /// restart with that exception.
    fn request_restart(&mut self) -> Result<(), crate::Exception> {
        Ok(())
    }

    /// FC 0x08/0x02: returns the host diagnostic register, or 0 if unused.
    fn read_diagnostic_register(&mut self) -> u16 {
        0
    }

    /// FC 0x08/0x0A: clear any host-side diagnostic state.
    fn reset_diagnostics(&mut self) {}

    /// FC 0x07: returns the exception status byte, or `None` if the host
    /// does not support it (maps to `ILLEGAL_FN`).
    fn read_exception_status(&mut self) -> Option<u8> {
        None
    }

    /// Invoked once after a successful `WRITE_MULTIPLE_COILS`.
    fn commit_coils_write(&mut self) {}

    /// Invoked once after a successful `WRITE_MULTIPLE_REGS` or
    /// `WRITE_FILE_RECORD`.
    fn commit_regs_write(&mut self) {}

    /// Fallback for function codes the engine does not implement
    /// internally (e.g. FC 0x11 Report Slave ID). Receives the request PDU
    /// and writes the response PDU (including the echoed function code)
    /// into `res`, returning the number of bytes written.
    fn handle_fn(&mut self, _req: &[u8], _res: &mut [u8]) -> Option<usize> {
        None
    }
}

/// A [`Callbacks`] implementation that supports nothing; every hook uses
/// its default (no-op/unsupported) behavior.
pub struct NoCallbacks;

impl Callbacks for NoCallbacks {}

/// A single communication-event log entry.
pub type EventByte = u8;

/// `RECV` event bits (bit 7 set). `BASE` marks the byte as a RECV event;
/// the others are ORed in as they apply.
pub mod recv_event {
    pub const BASE: u8 = 0b1000_0000;
    pub const COMM_ERR: u8 = 0b0000_0010;
    pub const CHAR_OVERRUN: u8 = 0b0001_0000;
    pub const LISTEN_MODE: u8 = 0b0010_0000;
    pub const BROADCAST: u8 = 0b0100_0000;
}

/// `SEND` event bits (bit 6 set, bit 7 clear).
pub mod send_event {
    pub const BASE: u8 = 0b0100_0000;
    pub const READ_EX: u8 = 0b0000_0001;
    pub const ABORT_EX: u8 = 0b0000_0010;
    pub const BUSY_EX: u8 = 0b0000_0100;
    pub const NAK_EX: u8 = 0b0000_1000;
    pub const WRITE_TIMEOUT: u8 = 0b0001_0000;
    pub const LISTEN_ONLY: u8 = 0b0010_0000;
}

/// Other, non-RECV/SEND event bytes.
pub mod other_event {
    pub const COMM_RESTART: u8 = 0x00;
    pub const ENTERED_LISTEN_ONLY: u8 = 0x04;
}

const EVENT_LOG_CAPACITY: usize = 64;

/// The 64-entry communication-event ring buffer (§4.8).
pub struct EventLog {
    buf: [EventByte; EVENT_LOG_CAPACITY],
    write_pos: usize,
    count: usize,
}

impl EventLog {
    const fn new() -> Self {
        Self {
            buf: [0; EVENT_LOG_CAPACITY],
            write_pos: 0,
            count: 0,
        }
    }

    fn push(&mut self, event: EventByte) {
        self.buf[self.write_pos] = event;
        self.write_pos = (self.write_pos + 1) % EVENT_LOG_CAPACITY;
        self.count = (self.count + 1).min(EVENT_LOG_CAPACITY);
    }

    fn clear(&mut self) {
        self.write_pos = 0;
        self.count = 0;
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// The `i`-th most recent entry (`0` = newest), or `None` if `i >= count()`.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<EventByte> {
        if i >= self.count {
            return None;
        }
        let idx = (self.write_pos + EVENT_LOG_CAPACITY - 1 - i) % EVENT_LOG_CAPACITY;
        Some(self.buf[idx])
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// All mutable counters mandated by the diagnostics/comm-event function
/// codes (§3, §6).
#[derive(Default)]
pub struct Counters {
    pub bus_msg: u16,
    pub bus_comm_err: u16,
    pub exception: u16,
    pub msg: u16,
    pub no_resp: u16,
    pub nak: u16,
    pub busy: u16,
    pub bus_char_overrun: u16,
    pub comm_event: u16,
}

impl Counters {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A single Modbus server instance: configuration plus all engine-owned
/// mutable state. Generic over the host's [`Callbacks`] implementation so
/// no dynamic dispatch or heap allocation is required.
pub struct Instance<'a, C: Callbacks> {
    pub(crate) slave_addr: Address,
    pub(crate) accept_default_response_addr: bool,
    #[cfg(feature = "ascii")]
    pub(crate) ascii_delimiter: u8,
    pub(crate) is_listen_only: bool,
    pub(crate) status: u16,
    pub(crate) counters: Counters,
    pub(crate) event_log: EventLog,
    pub(crate) callbacks: &'a mut C,
}

/// The address at which a server additionally answers when enabled (§6).
pub const DEFAULT_RESPONSE_ADDR: Address = 0xF8;

/// Broadcast address: requests sent here are processed but never answered.
pub const BROADCAST_ADDR: Address = 0x00;

impl<'a, C: Callbacks> Instance<'a, C> {
    /// Create a new instance bound to `slave_addr` (1-247).
    #[must_use]
    pub fn new(slave_addr: Address, callbacks: &'a mut C) -> Self {
        Self {
            slave_addr,
            accept_default_response_addr: false,
            #[cfg(feature = "ascii")]
            ascii_delimiter: 0x0A,
            is_listen_only: false,
            status: 0,
            counters: Counters::default(),
            event_log: EventLog::new(),
            callbacks,
        }
    }

    #[must_use]
    pub const fn slave_addr(&self) -> Address {
        self.slave_addr
    }

    pub fn set_accept_default_response_addr(&mut self, accept: bool) {
        self.accept_default_response_addr = accept;
    }

    #[must_use]
    pub const fn is_listen_only(&self) -> bool {
        self.is_listen_only
    }

    #[must_use]
    pub const fn counters(&self) -> &Counters {
        &self.counters
    }

    #[must_use]
    pub const fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    #[cfg(feature = "ascii")]
    #[must_use]
    pub const fn ascii_delimiter(&self) -> u8 {
        self.ascii_delimiter
    }

    /// Whether `addr` is accepted by this instance (its own address,
    /// broadcast, or the default-response address if enabled).
    #[must_use]
    pub fn accepts_address(&self, addr: Address) -> bool {
        addr == self.slave_addr
            || addr == BROADCAST_ADDR
            || (self.accept_default_response_addr && addr == DEFAULT_RESPONSE_ADDR)
    }

    pub(crate) fn push_event(&mut self, event: EventByte) {
        self.event_log.push(event);
    }

    pub(crate) fn reset_counters(&mut self) {
        self.counters.reset();
    }

    pub(crate) fn restart(&mut self, clear_log: bool) {
        self.is_listen_only = false;
        self.counters.reset();
        if clear_log {
            self.event_log.clear();
        } else {
            self.push_event(other_event::COMM_RESTART);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_own_and_broadcast() {
        let mut cb = NoCallbacks;
        let inst = Instance::new(17, &mut cb);
        assert!(inst.accepts_address(17));
        assert!(inst.accepts_address(0));
        assert!(!inst.accepts_address(18));
    }

    #[test]
    fn accepts_default_response_addr_when_enabled() {
        let mut cb = NoCallbacks;
        let mut inst = Instance::new(17, &mut cb);
        assert!(!inst.accepts_address(0xF8));
        inst.set_accept_default_response_addr(true);
        assert!(inst.accepts_address(0xF8));
    }

    #[test]
    fn event_log_wraps_after_64_and_reads_newest_first() {
        let mut log = EventLog::new();
        for i in 0..70u8 {
            log.push(i);
        }
        assert_eq!(log.count(), 64);
        assert_eq!(log.get(0), Some(69));
        assert_eq!(log.get(1), Some(68));
        assert_eq!(log.get(63), Some(6));
        assert_eq!(log.get(64), None);
    }

    #[test]
    fn event_log_clear_resets() {
        let mut log = EventLog::new();
        log.push(1);
        log.push(2);
        log.clear();
        assert_eq!(log.count(), 0);
        assert_eq!(log.get(0), None);
    }
}
