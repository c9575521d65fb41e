// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use core::fmt;

/// A framing-layer decode failure.
///
/// These are distinct from [`crate::Exception`]: a `FramingError` means the
/// received bytes could not be turned into a PDU at all, so no Modbus
/// exception response is produced — the frame is silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// Invalid buffer size
    BufferSize,
    /// A non-hexadecimal character in an ASCII frame
    InvalidHexChar(u8),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BufferSize => write!(f, "Invalid buffer size"),
            Self::InvalidHexChar(c) => write!(f, "Invalid ASCII hex character: 0x{c:0>2X}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FramingError {}

#[cfg(all(feature = "defmt", target_os = "none"))]
impl defmt::Format for FramingError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::BufferSize => defmt::write!(f, "Invalid buffer size"),
            Self::InvalidHexChar(c) => defmt::write!(f, "Invalid ASCII hex character: {=u8:#04x}", c),
        }
    }
}
