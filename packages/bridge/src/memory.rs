//! Little-endian accessors over a sandbox's linear memory.

use crate::error::{Error, Result};

fn range(mem: &[u8], addr: u32, len: usize) -> Result<std::ops::Range<usize>> {
    let start = addr as usize;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= mem.len())
        .ok_or(Error::OutOfBounds { addr, len })?;
    Ok(start..end)
}

/// `addr + delta`, failing instead of wrapping past the end of the
/// address space.
pub fn offset(addr: u32, delta: u32) -> Result<u32> {
    addr.checked_add(delta).ok_or(Error::OutOfBounds {
        addr,
        len: delta as usize,
    })
}

pub fn read_bytes(mem: &[u8], addr: u32, len: usize) -> Result<&[u8]> {
    Ok(&mem[range(mem, addr, len)?])
}

pub fn write_bytes(mem: &mut [u8], addr: u32, bytes: &[u8]) -> Result<()> {
    let r = range(mem, addr, bytes.len())?;
    mem[r].copy_from_slice(bytes);
    Ok(())
}

fn read_array<const N: usize>(mem: &[u8], addr: u32) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(read_bytes(mem, addr, N)?);
    Ok(out)
}

pub fn read_u8(mem: &[u8], addr: u32) -> Result<u8> {
    Ok(read_array::<1>(mem, addr)?[0])
}

pub fn read_u16(mem: &[u8], addr: u32) -> Result<u16> {
    read_array(mem, addr).map(u16::from_le_bytes)
}

pub fn read_u32(mem: &[u8], addr: u32) -> Result<u32> {
    read_array(mem, addr).map(u32::from_le_bytes)
}

pub fn read_i32(mem: &[u8], addr: u32) -> Result<i32> {
    read_array(mem, addr).map(i32::from_le_bytes)
}

pub fn read_i64(mem: &[u8], addr: u32) -> Result<i64> {
    read_array(mem, addr).map(i64::from_le_bytes)
}

pub fn read_u64(mem: &[u8], addr: u32) -> Result<u64> {
    read_array(mem, addr).map(u64::from_le_bytes)
}

pub fn write_u32(mem: &mut [u8], addr: u32, v: u32) -> Result<()> {
    write_bytes(mem, addr, &v.to_le_bytes())
}

pub fn write_i64(mem: &mut [u8], addr: u32, v: i64) -> Result<()> {
    write_bytes(mem, addr, &v.to_le_bytes())
}

/// Read a `u32`-length-prefixed buffer.
pub fn read_len_prefixed(mem: &[u8], addr: u32) -> Result<&[u8]> {
    let len = read_u32(mem, addr)? as usize;
    read_bytes(mem, offset(addr, 4)?, len)
}

/// Read a length-prefixed UTF-8 string, replacing invalid sequences.
pub fn read_string(mem: &[u8], addr: u32) -> Result<String> {
    Ok(String::from_utf8_lossy(read_len_prefixed(mem, addr)?).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut mem = vec![0u8; 32];
        write_u32(&mut mem, 4, 0xdead_beef).unwrap();
        write_i64(&mut mem, 8, -5).unwrap();
        assert_eq!(read_u32(&mem, 4).unwrap(), 0xdead_beef);
        assert_eq!(read_i64(&mem, 8).unwrap(), -5);
        assert_eq!(read_u16(&mem, 4).unwrap(), 0xbeef);
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let mem = vec![0u8; 8];
        assert_eq!(
            read_u64(&mem, 4),
            Err(Error::OutOfBounds { addr: 4, len: 8 })
        );
        assert!(read_bytes(&mem, u32::MAX, 2).is_err());
    }

    #[test]
    fn offsets_do_not_wrap() {
        assert_eq!(offset(8, 4).unwrap(), 12);
        assert_eq!(
            offset(0xFFFF_FFF8, 12),
            Err(Error::OutOfBounds {
                addr: 0xFFFF_FFF8,
                len: 12
            })
        );
    }

    #[test]
    fn length_prefixed_string() {
        let mut mem = vec![0u8; 16];
        write_u32(&mut mem, 0, 5).unwrap();
        write_bytes(&mut mem, 4, b"hello").unwrap();
        assert_eq!(read_string(&mem, 0).unwrap(), "hello");
    }
}
