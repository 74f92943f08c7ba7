use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Debug, Eq, PartialEq, Error)]
pub enum PacketError {
    #[error("read of {wanted} bytes at offset {pos} overruns a {size} byte payload")]
    Underflow {
        pos: usize,
        wanted: usize,
        size: usize,
    },
    #[error("payload string is not valid utf8")]
    BadString,
    #[error("{0} field exceeds its sanity bound")]
    FieldTooLarge(&'static str),
}

pub type PacketResult<T> = Result<T, PacketError>;

/// A single wire message: opcode discriminant plus payload bytes. Carries a
/// read cursor so handlers can consume fields sequentially, and a bit cursor
/// for the packed-field encoding some client messages use.
///
/// Bit reads consume whole payload bytes lazily and serve bits MSB first.
/// Byte reads are always byte aligned and ignore any partially consumed bit
/// staging byte.
pub struct Packet {
    opcode: u16,
    data: Vec<u8>,
    rpos: usize,
    rbitpos: u8,
    rcurbit: u8,
    wbitpos: u8,
    wcurbit: u8,
}

impl Packet {
    #[inline]
    pub fn new(opcode: u16) -> Packet {
        Packet::with_body(opcode, Vec::new())
    }

    #[inline]
    pub fn with_capacity(opcode: u16, capacity: usize) -> Packet {
        Packet::with_body(opcode, Vec::with_capacity(capacity))
    }

    #[inline]
    pub fn with_body(opcode: u16, data: Vec<u8>) -> Packet {
        Packet {
            opcode,
            data,
            rpos: 0,
            rbitpos: 8,
            rcurbit: 0,
            wbitpos: 0,
            wcurbit: 0,
        }
    }

    #[inline]
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    #[inline]
    pub fn set_opcode(&mut self, opcode: u16) {
        self.opcode = opcode;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn rpos(&self) -> usize {
        self.rpos
    }

    /// Bytes left to read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.rpos
    }
}

impl Packet {
    #[inline]
    fn take(&mut self, wanted: usize) -> PacketResult<&[u8]> {
        if self.rpos + wanted > self.data.len() {
            return Err(PacketError::Underflow {
                pos: self.rpos,
                wanted,
                size: self.data.len(),
            });
        }

        let slice = &self.data[self.rpos..self.rpos + wanted];
        self.rpos += wanted;
        Ok(slice)
    }

    #[inline]
    pub fn read_u8(&mut self) -> PacketResult<u8> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    pub fn read_u16(&mut self) -> PacketResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    #[inline]
    pub fn read_u32(&mut self) -> PacketResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    #[inline]
    pub fn read_u64(&mut self) -> PacketResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    #[inline]
    pub fn read_i32(&mut self) -> PacketResult<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    #[inline]
    pub fn read_f32(&mut self) -> PacketResult<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    #[inline]
    pub fn read_bytes(&mut self, count: usize) -> PacketResult<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    #[inline]
    pub fn skip(&mut self, count: usize) -> PacketResult<()> {
        self.take(count)?;
        Ok(())
    }

    /// Reads `count` bytes and interprets them as utf8.
    pub fn read_string(&mut self, count: usize) -> PacketResult<String> {
        let raw = self.take(count)?;
        String::from_utf8(raw.to_vec()).map_err(|_| PacketError::BadString)
    }

    /// Reads up to the next NUL byte (consumed, not returned).
    pub fn read_cstring(&mut self) -> PacketResult<String> {
        let start = self.rpos;
        let end = self.data[start..]
            .iter()
            .position(|&byte| byte == 0)
            .map(|offset| start + offset)
            .ok_or(PacketError::Underflow {
                pos: start,
                wanted: 1,
                size: self.data.len(),
            })?;

        let raw = self.data[start..end].to_vec();
        self.rpos = end + 1;
        String::from_utf8(raw).map_err(|_| PacketError::BadString)
    }

    /// Reads a single bit off the bit cursor, fetching the next payload byte
    /// when the staging byte is exhausted.
    pub fn read_bit(&mut self) -> PacketResult<bool> {
        if self.rbitpos == 8 {
            self.rcurbit = self.read_u8()?;
            self.rbitpos = 0;
        }

        let bit = (self.rcurbit >> (7 - self.rbitpos)) & 1;
        self.rbitpos += 1;
        Ok(bit != 0)
    }

    /// Reads `count` bits MSB first.
    pub fn read_bits(&mut self, count: u8) -> PacketResult<u32> {
        let mut value = 0u32;

        for _ in 0..count {
            value = (value << 1) | self.read_bit()? as u32;
        }

        Ok(value)
    }

    /// Resets the bit cursor so the next `read_bit` starts a fresh byte.
    #[inline]
    pub fn align_bits(&mut self) {
        self.rbitpos = 8;
    }
}

impl Packet {
    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Writes the string bytes followed by a NUL terminator.
    #[inline]
    pub fn write_cstring(&mut self, value: &str) {
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
    }

    /// Stages a single bit, flushing the staging byte once full.
    pub fn write_bit(&mut self, bit: bool) {
        self.wcurbit |= (bit as u8) << (7 - self.wbitpos);
        self.wbitpos += 1;

        if self.wbitpos == 8 {
            self.flush_bits();
        }
    }

    /// Stages the low `count` bits of `value`, MSB first.
    pub fn write_bits(&mut self, value: u32, count: u8) {
        for shift in (0..count).rev() {
            self.write_bit((value >> shift) & 1 != 0);
        }
    }

    /// Emits a partially filled staging byte, if any.
    pub fn flush_bits(&mut self) {
        if self.wbitpos == 0 {
            return;
        }

        self.data.push(self.wcurbit);
        self.wcurbit = 0;
        self.wbitpos = 0;
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Packet(opcode=0x{:04X}, len={}, rpos={})",
            self.opcode,
            self.data.len(),
            self.rpos
        )
    }
}
