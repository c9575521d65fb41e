// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use core::fmt;

mod cursor;

pub use self::cursor::*;

/// A 16-bit coil/register/file address, as found on the wire.
pub type Address = u16;

/// A single coil's state.
pub type Coil = bool;

/// A register or coil quantity field.
pub type Quantity = u16;

/// A single 16-bit register value.
pub type Word = u16;

/// A borrowed slice of raw PDU payload bytes.
pub type RawData<'r> = &'r [u8];

/// The location of all bytes that belong to a decoded frame.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    /// The index where the frame starts.
    pub start: usize,
    /// Number of bytes that belong to the frame.
    pub size: usize,
}

impl FrameLocation {
    /// One past the last byte of the frame.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }
}

/// A Modbus function code.
///
/// It is represented by an unsigned 8 bit integer.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    /// `01` (`0x01`) Read Coils.
    ReadCoils,
    /// `02` (`0x02`) Read Discrete Inputs.
    ReadDiscreteInputs,
    /// `03` (`0x03`) Read Holding Registers.
    ReadHoldingRegisters,
    /// `04` (`0x04`) Read Input Registers.
    ReadInputRegisters,
    /// `05` (`0x05`) Write Single Coil.
    WriteSingleCoil,
    /// `06` (`0x06`) Write Single Register.
    WriteSingleRegister,
    /// `07` (`0x07`) Read Exception Status.
    ReadExceptionStatus,
    /// `08` (`0x08`) Diagnostics.
    Diagnostics,
    /// `11` (`0x0B`) Get Comm Event Counter.
    GetCommEventCounter,
    /// `12` (`0x0C`) Get Comm Event Log.
    GetCommEventLog,
    /// `15` (`0x0F`) Write Multiple Coils.
    WriteMultipleCoils,
    /// `16` (`0x10`) Write Multiple Registers.
    WriteMultipleRegisters,
    /// `17` (`0x11`) Report Server ID.
    ReportServerId,
    /// `20` (`0x14`) Read File Record.
    ReadFileRecord,
    /// `21` (`0x15`) Write File Record.
    WriteFileRecord,
    /// `22` (`0x16`) Mask Write Register.
    MaskWriteRegister,
    /// `23` (`0x17`) Read/Write Multiple Registers.
    ReadWriteMultipleRegisters,
    /// Any function code not enumerated above.
    Custom(u8),
}

impl FunctionCode {
    /// Create a new [`FunctionCode`] from its wire value.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        match value {
            0x01 => Self::ReadCoils,
            0x02 => Self::ReadDiscreteInputs,
            0x03 => Self::ReadHoldingRegisters,
            0x04 => Self::ReadInputRegisters,
            0x05 => Self::WriteSingleCoil,
            0x06 => Self::WriteSingleRegister,
            0x07 => Self::ReadExceptionStatus,
            0x08 => Self::Diagnostics,
            0x0B => Self::GetCommEventCounter,
            0x0C => Self::GetCommEventLog,
            0x0F => Self::WriteMultipleCoils,
            0x10 => Self::WriteMultipleRegisters,
            0x11 => Self::ReportServerId,
            0x14 => Self::ReadFileRecord,
            0x15 => Self::WriteFileRecord,
            0x16 => Self::MaskWriteRegister,
            0x17 => Self::ReadWriteMultipleRegisters,
            code => Self::Custom(code),
        }
    }

    /// Get the wire value of the current [`FunctionCode`].
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::ReadExceptionStatus => 0x07,
            Self::Diagnostics => 0x08,
            Self::GetCommEventCounter => 0x0B,
            Self::GetCommEventLog => 0x0C,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
            Self::ReportServerId => 0x11,
            Self::ReadFileRecord => 0x14,
            Self::WriteFileRecord => 0x15,
            Self::MaskWriteRegister => 0x16,
            Self::ReadWriteMultipleRegisters => 0x17,
            Self::Custom(code) => code,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value().fmt(f)
    }
}

/// A server (slave) exception, returned in byte 1 of an exception response.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    NegativeAcknowledge = 0x07,
    MemoryParityError = 0x08,
}

impl Exception {
    const fn get_name(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal function",
            Self::IllegalDataAddress => "Illegal data address",
            Self::IllegalDataValue => "Illegal data value",
            Self::ServerDeviceFailure => "Server device failure",
            Self::Acknowledge => "Acknowledge",
            Self::ServerDeviceBusy => "Server device busy",
            Self::NegativeAcknowledge => "Negative acknowledge",
            Self::MemoryParityError => "Memory parity error",
        }
    }

    /// Try to recover an [`Exception`] from its wire value.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x07 => Self::NegativeAcknowledge,
            0x08 => Self::MemoryParityError,
            _ => return None,
        })
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.get_name())
    }
}

#[cfg(all(feature = "defmt", target_os = "none"))]
impl defmt::Format for Exception {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.get_name())
    }
}

/// The result of a PDU handler: `Ok(())` means the response body already
/// written into the caller's buffer is ready to send, `Err(exception)`
/// means the dispatcher must overwrite it with an exception response.
pub type PduResult = Result<(), Exception>;
