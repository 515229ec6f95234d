//! Packet buffer implementation
//!
//! Provides a byte buffer with the mixer's wire encodings:
//! - Big-endian integers and IEEE-754 floats
//! - Smart encoding for small counts (1 or 2 bytes)
//! - NUL-terminated UTF-8 strings
//! - Vector and quaternion helpers
//!
//! Every read is bounds-checked and returns a [`ParseError`] instead of
//! yielding filler values, so a truncated packet can never be half-applied.

use bytes::{BufMut, Bytes, BytesMut};
use glam::{Quat, Vec3};

use crate::error::ParseError;

/// Maximum packet size (64KB)
pub const MAX_PACKET_SIZE: usize = 65535;

/// Packet buffer for reading and writing mixer protocol data
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    /// Internal byte buffer
    data: BytesMut,
    /// Current read position
    read_pos: usize,
}

type ReadResult<T> = std::result::Result<T, ParseError>;

impl PacketBuffer {
    /// Create a new empty packet buffer
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            read_pos: 0,
        }
    }

    /// Create a packet buffer with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Create a packet buffer from existing bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            read_pos: 0,
        }
    }

    // ============ Properties ============

    /// Get the current read position
    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Get the total length of the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the number of bytes remaining to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    /// Check if there are bytes remaining to read
    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Get a reference to the underlying bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Freeze the written bytes into an immutable, cheaply clonable handle
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Clear the buffer and reset the read position
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    #[inline]
    fn ensure(&self, needed: usize) -> ReadResult<()> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(ParseError::Truncated { needed, remaining });
        }
        Ok(())
    }

    // ============ Reading Methods ============

    /// Read an unsigned byte
    pub fn read_ubyte(&mut self) -> ReadResult<u8> {
        self.ensure(1)?;
        let value = self.data[self.read_pos];
        self.read_pos += 1;
        Ok(value)
    }

    /// Read an unsigned big-endian short (2 bytes)
    pub fn read_ushort(&mut self) -> ReadResult<u16> {
        self.ensure(2)?;
        let bytes = [self.data[self.read_pos], self.data[self.read_pos + 1]];
        self.read_pos += 2;
        Ok(u16::from_be_bytes(bytes))
    }

    /// Read an unsigned big-endian int (4 bytes)
    pub fn read_uint(&mut self) -> ReadResult<u32> {
        self.ensure(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[self.read_pos..self.read_pos + 4]);
        self.read_pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Read a big-endian IEEE-754 float, rejecting NaN and infinities
    pub fn read_float(&mut self, field: &'static str) -> ReadResult<f32> {
        let value = f32::from_bits(self.read_uint()?);
        if !value.is_finite() {
            return Err(ParseError::NonFiniteValue(field));
        }
        Ok(value)
    }

    /// Read three floats as a vector
    pub fn read_vec3(&mut self, field: &'static str) -> ReadResult<Vec3> {
        Ok(Vec3::new(
            self.read_float(field)?,
            self.read_float(field)?,
            self.read_float(field)?,
        ))
    }

    /// Read a quaternion (x, y, z, w), normalized on the way in
    pub fn read_quat(&mut self, field: &'static str) -> ReadResult<Quat> {
        let x = self.read_float(field)?;
        let y = self.read_float(field)?;
        let z = self.read_float(field)?;
        let w = self.read_float(field)?;
        let quat = Quat::from_xyzw(x, y, z, w);
        if quat.length_squared() == 0.0 {
            return Ok(Quat::IDENTITY);
        }
        Ok(quat.normalize())
    }

    /// Read a smart value (1 or 2 bytes depending on magnitude)
    pub fn read_smart(&mut self) -> ReadResult<u16> {
        let peek = self.peek_ubyte()?;
        if peek < 128 {
            Ok(self.read_ubyte()? as u16)
        } else {
            Ok(self.read_ushort()? - 32768)
        }
    }

    /// Peek at the next unsigned byte without advancing position
    fn peek_ubyte(&self) -> ReadResult<u8> {
        self.ensure(1)?;
        Ok(self.data[self.read_pos])
    }

    /// Read a NUL-terminated UTF-8 string
    pub fn read_string(&mut self) -> ReadResult<String> {
        let rest = &self.data[self.read_pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ParseError::UnterminatedString)?;
        let value = std::str::from_utf8(&rest[..end])
            .map_err(|_| ParseError::InvalidString)?
            .to_owned();
        self.read_pos += end + 1;
        Ok(value)
    }

    /// Read a specific number of bytes
    pub fn read_bytes(&mut self, length: usize) -> ReadResult<Vec<u8>> {
        self.ensure(length)?;
        let bytes = self.data[self.read_pos..self.read_pos + length].to_vec();
        self.read_pos += length;
        Ok(bytes)
    }

    // ============ Writing Methods ============

    /// Write an unsigned byte
    pub fn write_ubyte(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Write an unsigned big-endian short (2 bytes)
    pub fn write_ushort(&mut self, value: u16) {
        self.data.put_u16(value);
    }

    /// Write an unsigned big-endian int (4 bytes)
    pub fn write_uint(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    /// Write a big-endian IEEE-754 float
    pub fn write_float(&mut self, value: f32) {
        self.data.put_f32(value);
    }

    /// Write a vector as three floats
    pub fn write_vec3(&mut self, value: Vec3) {
        self.write_float(value.x);
        self.write_float(value.y);
        self.write_float(value.z);
    }

    /// Write a quaternion as (x, y, z, w)
    pub fn write_quat(&mut self, value: Quat) {
        self.write_float(value.x);
        self.write_float(value.y);
        self.write_float(value.z);
        self.write_float(value.w);
    }

    /// Write a smart value (1 or 2 bytes depending on magnitude).
    /// Values must be below 32768.
    pub fn write_smart(&mut self, value: u16) {
        if value < 128 {
            self.write_ubyte(value as u8);
        } else {
            self.write_ushort(value + 32768);
        }
    }

    /// Write a NUL-terminated string
    pub fn write_string(&mut self, value: &str) {
        self.data.extend_from_slice(value.as_bytes());
        self.write_ubyte(0);
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&[u8]> for PacketBuffer {
    fn from(slice: &[u8]) -> Self {
        Self::from_bytes(slice)
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_read_write() {
        let mut buf = PacketBuffer::new();

        buf.write_ubyte(255);
        buf.write_ushort(1234);
        buf.write_uint(987654);
        buf.write_float(-2.5);

        let mut buf = PacketBuffer::from_bytes(&buf.freeze());

        assert_eq!(buf.read_ubyte(), Ok(255));
        assert_eq!(buf.read_ushort(), Ok(1234));
        assert_eq!(buf.read_uint(), Ok(987654));
        assert_eq!(buf.read_float("test"), Ok(-2.5));
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_truncated_read_does_not_advance() {
        let mut buf = PacketBuffer::from_bytes(&[0x01, 0x02, 0x03]);

        assert_eq!(
            buf.read_uint(),
            Err(ParseError::Truncated {
                needed: 4,
                remaining: 3
            })
        );
        assert_eq!(buf.read_position(), 0);
        assert_eq!(buf.read_ushort(), Ok(0x0102));
    }

    #[test]
    fn test_non_finite_float_rejected() {
        let mut buf = PacketBuffer::new();
        buf.write_float(f32::NAN);
        buf.write_float(f32::INFINITY);

        assert_eq!(
            buf.read_float("position"),
            Err(ParseError::NonFiniteValue("position"))
        );
        assert_eq!(
            buf.read_float("scale"),
            Err(ParseError::NonFiniteValue("scale"))
        );
    }

    #[test]
    fn test_smart_encoding() {
        let mut buf = PacketBuffer::new();

        buf.write_smart(50);
        buf.write_smart(200);
        assert_eq!(buf.len(), 3);

        assert_eq!(buf.read_smart(), Ok(50));
        assert_eq!(buf.read_smart(), Ok(200));
    }

    #[test]
    fn test_string() {
        let mut buf = PacketBuffer::new();
        buf.write_string("Hello, World!");
        buf.write_string("");

        assert_eq!(buf.read_string().as_deref(), Ok("Hello, World!"));
        assert_eq!(buf.read_string().as_deref(), Ok(""));
    }

    #[test]
    fn test_unterminated_string() {
        let mut buf = PacketBuffer::from_bytes(b"no terminator");
        assert_eq!(buf.read_string(), Err(ParseError::UnterminatedString));
        assert_eq!(buf.read_position(), 0);
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut buf = PacketBuffer::from_bytes(&[0xff, 0xfe, 0x00]);
        assert_eq!(buf.read_string(), Err(ParseError::InvalidString));
    }

    #[test]
    fn test_quat_is_normalized() {
        let mut buf = PacketBuffer::new();
        buf.write_quat(Quat::from_xyzw(0.0, 0.0, 0.0, 2.0));
        buf.write_quat(Quat::from_xyzw(0.0, 0.0, 0.0, 0.0));

        assert_eq!(buf.read_quat("rotation"), Ok(Quat::IDENTITY));
        assert_eq!(buf.read_quat("rotation"), Ok(Quat::IDENTITY));
    }

    #[test]
    fn test_bytes() {
        let mut buf = PacketBuffer::new();
        let data = [1, 2, 3, 4, 5];

        buf.write_bytes(&data);

        assert_eq!(buf.read_bytes(5), Ok(data.to_vec()));
        assert!(buf.read_bytes(1).is_err());
    }
}
