// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{find, read_register, register_write_allowed, write_register, RegisterDescriptor};
use crate::Exception;

/// A file, addressed by its 16-bit file number, holding a sorted table of
/// register records.
pub struct FileDescriptor<'a> {
    pub file_no: u16,
    pub records: &'a [RegisterDescriptor<'a>],
}

fn lookup<'a>(file: &'a FileDescriptor<'a>, record_no: u16) -> Option<&'a RegisterDescriptor<'a>> {
    find(file.records, record_no, |r| r.address)
}

/// Read `record_len` words starting at `record_no` out of `file` into `out`
/// (big-endian). A missing first record is `ILLEGAL_DATA_ADDR`; a missing
/// later record is zero-filled.
pub fn file_read(
    file: &FileDescriptor<'_>,
    record_no: u16,
    record_len: u16,
    out: &mut [u8],
) -> Result<(), Exception> {
    if out.len() < record_len as usize * 2 {
        return Err(Exception::ServerDeviceFailure);
    }
    let mut pos: u16 = 0;
    let mut first = true;
    while pos < record_len {
        let addr = record_no + pos;
        let remaining = record_len - pos;
        let produced = match lookup(file, addr) {
            None => {
                if first {
                    return Err(Exception::IllegalDataAddress);
                }
                out[pos as usize * 2..pos as usize * 2 + 2].fill(0);
                1
            }
            Some(desc) => {
                match read_register(
                    desc,
                    0,
                    remaining,
                    Some(&mut out[pos as usize * 2..]),
                ) {
                    Ok(n) => n,
                    // A missing record is position-dependent: zero-filled
                    // once at least one record has already been produced.
                    // Any other failure (e.g. device failure) propagates
                    // unconditionally, regardless of position.
                    Err(Exception::IllegalDataAddress) if !first => {
                        out[pos as usize * 2..pos as usize * 2 + 2].fill(0);
                        1
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        pos += produced.max(1);
        first = false;
    }
    Ok(())
}

/// Whether every word in `[record_no, record_no + record_len)` may be
/// written.
pub fn file_write_allowed(
    file: &FileDescriptor<'_>,
    record_no: u16,
    record_len: u16,
) -> Result<(), Exception> {
    let mut pos: u16 = 0;
    while pos < record_len {
        let addr = record_no + pos;
        let remaining = record_len - pos;
        let Some(desc) = lookup(file, addr) else {
            return Err(Exception::IllegalDataAddress);
        };
        let n = register_write_allowed(desc, 0, remaining);
        if n == 0 {
            return Err(Exception::IllegalDataAddress);
        }
        pos += n;
    }
    Ok(())
}

/// Apply a write already confirmed by [`file_write_allowed`].
pub fn file_write(
    file: &FileDescriptor<'_>,
    record_no: u16,
    record_len: u16,
    data: &[u8],
) -> Result<(), Exception> {
    let mut pos: u16 = 0;
    while pos < record_len {
        let addr = record_no + pos;
        let remaining = record_len - pos;
        let Some(desc) = lookup(file, addr) else {
            return Err(Exception::IllegalDataAddress);
        };
        let n = register_write_allowed(desc, 0, remaining);
        if n == 0 {
            return Err(Exception::IllegalDataAddress);
        }
        let byte_off = pos as usize * 2;
        write_register(desc, 0, &data[byte_off..byte_off + n as usize * 2])?;
        pos += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RegisterRead, RegisterType, RegisterWrite};
    use core::cell::Cell;

    #[test]
    fn read_file_record_example() {
        // file 4 holds 0x1234 at record 1, 0xABCD at record 2
        let c1 = [Cell::new(0x12u8), Cell::new(0x34)];
        let c2 = [Cell::new(0xAB), Cell::new(0xCD)];
        let records = [
            RegisterDescriptor {
                address: 1,
                ty: RegisterType::U16,
                read: RegisterRead::Cell(&c1),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
            RegisterDescriptor {
                address: 2,
                ty: RegisterType::U16,
                read: RegisterRead::Cell(&c2),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
        ];
        let file = FileDescriptor {
            file_no: 4,
            records: &records,
        };
        let mut out = [0u8; 4];
        file_read(&file, 1, 2, &mut out).unwrap();
        assert_eq!(out, [0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn device_failure_on_later_record_propagates() {
        fn failing_read(_addr: crate::Address, _out: &mut [u8]) -> Result<(), Exception> {
            Err(Exception::ServerDeviceFailure)
        }
        let c1 = [Cell::new(0x12u8), Cell::new(0x34)];
        let records = [
            RegisterDescriptor {
                address: 1,
                ty: RegisterType::U16,
                read: RegisterRead::Cell(&c1),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
            RegisterDescriptor {
                address: 2,
                ty: RegisterType::U16,
                read: RegisterRead::Callback(failing_read),
                write: RegisterWrite::None,
                read_lock: None,
                write_lock: None,
                allow_partial_write: false,
                post_write: None,
            },
        ];
        let file = FileDescriptor {
            file_no: 4,
            records: &records,
        };
        let mut out = [0u8; 4];
        assert_eq!(
            file_read(&file, 1, 2, &mut out),
            Err(Exception::ServerDeviceFailure)
        );
    }

    #[test]
    fn missing_first_record_is_illegal_address() {
        let file = FileDescriptor {
            file_no: 1,
            records: &[],
        };
        let mut out = [0u8; 2];
        assert_eq!(
            file_read(&file, 1, 1, &mut out),
            Err(Exception::IllegalDataAddress)
        );
    }
}
