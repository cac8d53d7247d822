//! Common code for hosting a REPL module:
//! - The names of every import the host provides, per import module.
//! - An interface for handling memory access from inside a host call.
//! - The wire layout of the few WASI structures the shim decodes.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

#![allow(non_camel_case_types)]

use crate::error::{ErrNo, ShimResult};
use byteorder::{LittleEndian, ReadBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::{io::Cursor, mem::size_of, string::String, vec::Vec};
use strum_macros::{EnumString, IntoStaticStr};

////////////////////////////////////////////////////////////////////////////////
// Import names.
////////////////////////////////////////////////////////////////////////////////

/// The `wasi_snapshot_preview1` functions the syscall shim answers by name.
/// Any other WASI import the module declares is linked to a generic
/// not-implemented stub.
///
/// Convertible between lowercase str and enum values via `strum`, and between
/// primitive numbers and enum values via the `primitive` derives.
#[derive(
    IntoStaticStr,
    EnumString,
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum WasiAPIName {
    ARGS_GET = 1,
    ARGS_SIZES_GET,
    ENVIRON_GET,
    ENVIRON_SIZES_GET,
    CLOCK_RES_GET,
    CLOCK_TIME_GET,
    FD_CLOSE,
    FD_FDSTAT_GET,
    FD_FILESTAT_GET,
    FD_PRESTAT_GET,
    FD_PRESTAT_DIR_NAME,
    FD_READ,
    FD_SEEK,
    FD_WRITE,
    PATH_FILESTAT_GET,
    PATH_OPEN,
    POLL_ONEOFF,
    PROC_EXIT,
    SCHED_YIELD,
    RANDOM_GET,
}

/// The host functions offered in the `env` import module: cancellation,
/// cooperative sleep and the optional graphics and keyboard capabilities.
#[derive(
    IntoStaticStr,
    EnumString,
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum HostAPIName {
    CHECK_INTERRUPT = 1,
    IMPORT_CHECK_INTERRUPT,
    SLEEP,
    DRAW_SVG,
    GET_KEY_EVENT,
}

////////////////////////////////////////////////////////////////////////////////
// WASI structures.
////////////////////////////////////////////////////////////////////////////////

/// A scatter/gather buffer descriptor, as laid out in the module's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    /// Address of the buffer.
    pub buf: u32,
    /// Length of the buffer in bytes.
    pub len: u32,
}

/// Unpack a sequence of `bytes` and return a `T`.
pub trait Unpack: Sized {
    /// Size in bytes of the structure in the Wasm memory space.  This is
    /// independent of the host's pointer width.
    const SIZE: u32;

    /// Unpack the `T`
    fn unpack(bytes: &[u8]) -> ShimResult<Self>;
}

impl Unpack for IoVec {
    const SIZE: u32 = (2 * size_of::<u32>()) as u32;

    fn unpack(bytes: &[u8]) -> ShimResult<Self> {
        if bytes.len() != Self::SIZE as usize {
            return Err(ErrNo::Inval);
        }
        let mut rdr = Cursor::new(bytes);
        let buf = rdr.read_u32::<LittleEndian>()?;
        let len = rdr.read_u32::<LittleEndian>()?;
        Ok(IoVec { buf, len })
    }
}

/// WASI file type tag for a character device, reported for the standard
/// streams.
pub const FILETYPE_CHARACTER_DEVICE: u8 = 2;
/// `fd_read` right.
pub const RIGHTS_FD_READ: u64 = 1 << 1;
/// `fd_write` right.
pub const RIGHTS_FD_WRITE: u64 = 1 << 6;
/// Size of a WASI `fdstat` record.
pub const FDSTAT_SIZE: usize = 24;

////////////////////////////////////////////////////////////////////////////////
// Memory access.
////////////////////////////////////////////////////////////////////////////////

/// The memory handler for interacting with the module's linear memory from
/// inside a host call.  Every access re-resolves the memory, so growth
/// between two accesses is always observed.
///
/// NOTE: we purposely choose u32 here as the module passes addresses as i32.
pub trait MemoryHandler {
    /// Write the `buffer` to `address`.
    fn write_buffer(&mut self, address: u32, buffer: &[u8]) -> ShimResult<()>;

    /// Read `length` bytes from `address`.
    fn read_buffer(&mut self, address: u32, length: u32) -> ShimResult<Vec<u8>>;

    /// Reads a string at `address` of `length` from the module's memory.
    /// Fails with `IlSeq` if the bytes are not UTF-8.
    fn read_cstring(&mut self, address: u32, length: u32) -> ShimResult<String> {
        let bytes = self.read_buffer(address, length)?;
        String::from_utf8(bytes).map_err(|_e| ErrNo::IlSeq)
    }

    /// The default implementation for writing a u32 to `address`.
    fn write_u32(&mut self, address: u32, number: u32) -> ShimResult<()> {
        self.write_buffer(address, &u32::to_le_bytes(number))
    }

    /// The default implementation for writing a u64 to `address`.
    fn write_u64(&mut self, address: u32, number: u64) -> ShimResult<()> {
        self.write_buffer(address, &u64::to_le_bytes(number))
    }

    /// The default implementation for reading a u32 from `address`.
    fn read_u32(&mut self, address: u32) -> ShimResult<u32> {
        let bytes = self.read_buffer(address, size_of::<u32>() as u32)?;
        let mut rdr = Cursor::new(bytes);
        Ok(rdr.read_u32::<LittleEndian>()?)
    }

    /// Reads an array of `count` packed `T`s starting at `address`.
    fn unpack_array<T: Unpack>(&mut self, address: u32, count: u32) -> ShimResult<Vec<T>> {
        let total = count.checked_mul(T::SIZE).ok_or(ErrNo::Inval)?;
        let all_bytes = self.read_buffer(address, total)?;
        all_bytes
            .chunks(T::SIZE as usize)
            .map(T::unpack)
            .collect()
    }

    /// Performs a gathered read of every buffer named by `iovecs`.
    fn read_iovec_scattered(&mut self, iovecs: &[IoVec]) -> ShimResult<Vec<Vec<u8>>> {
        let mut rst = Vec::with_capacity(iovecs.len());
        for IoVec { buf, len } in iovecs.iter() {
            rst.push(self.read_buffer(*buf, *len)?);
        }
        Ok(rst)
    }

    /// Writes a list of NUL-terminated strings back to back at `buf_address`,
    /// and a pointer to each at consecutive slots starting at `buf_pointers`.
    /// --------------------------------------------------------------------
    ///    ^           ^
    ///   0x10        0x64
    /// buf_pointers: [0x10, 0x64, ...]
    ///
    fn write_string_list(
        &mut self,
        content: &[Vec<u8>],
        mut buf_address: u32,
        mut buf_pointers: u32,
    ) -> ShimResult<()> {
        for to_write in content {
            self.write_buffer(buf_address, to_write)?;
            self.write_u32(buf_pointers, buf_address)?;
            buf_address = buf_address
                .checked_add(to_write.len() as u32)
                .ok_or(ErrNo::Fault)?;
            buf_pointers = buf_pointers
                .checked_add(size_of::<u32>() as u32)
                .ok_or(ErrNo::Fault)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn api_names_are_lowercase_import_names() {
        let name: &'static str = WasiAPIName::FD_PRESTAT_DIR_NAME.into();
        assert_eq!(name, "fd_prestat_dir_name");
        assert_eq!(
            HostAPIName::from_str("import_check_interrupt").unwrap(),
            HostAPIName::IMPORT_CHECK_INTERRUPT
        );
        assert!(WasiAPIName::from_str("sock_accept").is_err());
    }

    #[test]
    fn iovec_unpacks_little_endian() {
        let bytes = [0x10, 0, 0, 0, 5, 0, 0, 0];
        assert_eq!(IoVec::unpack(&bytes).unwrap(), IoVec { buf: 16, len: 5 });
        assert_eq!(IoVec::unpack(&bytes[..7]), Err(ErrNo::Inval));
    }
}
