//! Network byte order packing primitives.
//!
//! Every field on the wire is big-endian regardless of host architecture.
//! Writers implement [`Pack`] by supplying a single `put` method; all the
//! typed `pack_*` helpers are built on top of it. [`WireReader`] is the
//! mirror image: each `unpack_*` consumes exactly the bytes its `pack_*`
//! counterpart produced.
//!
//! Reading past the end of a buffer is not an error at this layer. The
//! reader yields zero values and raises an overrun flag that callers check
//! once after decoding a whole payload.

pub type Vec3 = [f32; 3];

/// Sink for packed fields.
pub trait Pack {
    /// Appends raw bytes.
    fn put(&mut self, bytes: &[u8]);

    fn pack_u8(&mut self, value: u8) -> &mut Self
    where
        Self: Sized,
    {
        self.put(&[value]);
        self
    }

    fn pack_i8(&mut self, value: i8) -> &mut Self
    where
        Self: Sized,
    {
        self.put(&value.to_be_bytes());
        self
    }

    fn pack_u16(&mut self, value: u16) -> &mut Self
    where
        Self: Sized,
    {
        self.put(&value.to_be_bytes());
        self
    }

    fn pack_i16(&mut self, value: i16) -> &mut Self
    where
        Self: Sized,
    {
        self.put(&value.to_be_bytes());
        self
    }

    fn pack_u32(&mut self, value: u32) -> &mut Self
    where
        Self: Sized,
    {
        self.put(&value.to_be_bytes());
        self
    }

    fn pack_i32(&mut self, value: i32) -> &mut Self
    where
        Self: Sized,
    {
        self.put(&value.to_be_bytes());
        self
    }

    fn pack_u64(&mut self, value: u64) -> &mut Self
    where
        Self: Sized,
    {
        self.put(&value.to_be_bytes());
        self
    }

    fn pack_f32(&mut self, value: f32) -> &mut Self
    where
        Self: Sized,
    {
        self.put(&value.to_bits().to_be_bytes());
        self
    }

    fn pack_f64(&mut self, value: f64) -> &mut Self
    where
        Self: Sized,
    {
        self.put(&value.to_bits().to_be_bytes());
        self
    }

    fn pack_vec3(&mut self, value: Vec3) -> &mut Self
    where
        Self: Sized,
    {
        for component in value {
            self.pack_f32(component);
        }
        self
    }

    /// Raw bytes with no length information.
    fn pack_bytes(&mut self, bytes: &[u8]) -> &mut Self
    where
        Self: Sized,
    {
        self.put(bytes);
        self
    }

    /// String with a one byte length prefix. Longer input is cut at 255 bytes.
    fn pack_string8(&mut self, value: &str) -> &mut Self
    where
        Self: Sized,
    {
        let bytes = &value.as_bytes()[..value.len().min(u8::MAX as usize)];
        self.pack_u8(bytes.len() as u8);
        self.put(bytes);
        self
    }

    /// String with a four byte length prefix.
    fn pack_std_string(&mut self, value: &str) -> &mut Self
    where
        Self: Sized,
    {
        self.pack_u32(value.len() as u32);
        self.put(value.as_bytes());
        self
    }

    /// String written into a fixed width field, NUL padded. At most
    /// `width - 1` bytes of the string are kept so the field always ends
    /// in a NUL.
    fn pack_fixed_str(&mut self, value: &str, width: usize) -> &mut Self
    where
        Self: Sized,
    {
        if width == 0 {
            return self;
        }
        let kept = value.len().min(width - 1);
        self.put(&value.as_bytes()[..kept]);
        for _ in kept..width {
            self.put(&[0]);
        }
        self
    }
}

impl Pack for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Cursor over a received payload.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    overrun: bool,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            overrun: false,
        }
    }

    /// True once any unpack asked for more bytes than were left.
    pub fn is_overrun(&self) -> bool {
        self.overrun
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            self.overrun = true;
            self.pos = self.buf.len();
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    fn take_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(slice) = self.take(N) {
            out.copy_from_slice(slice);
        }
        out
    }

    pub fn unpack_u8(&mut self) -> u8 {
        self.take_array::<1>()[0]
    }

    pub fn unpack_i8(&mut self) -> i8 {
        i8::from_be_bytes(self.take_array())
    }

    pub fn unpack_u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take_array())
    }

    pub fn unpack_i16(&mut self) -> i16 {
        i16::from_be_bytes(self.take_array())
    }

    pub fn unpack_u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take_array())
    }

    pub fn unpack_i32(&mut self) -> i32 {
        i32::from_be_bytes(self.take_array())
    }

    pub fn unpack_u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take_array())
    }

    pub fn unpack_f32(&mut self) -> f32 {
        f32::from_bits(self.unpack_u32())
    }

    pub fn unpack_f64(&mut self) -> f64 {
        f64::from_bits(self.unpack_u64())
    }

    pub fn unpack_vec3(&mut self) -> Vec3 {
        [self.unpack_f32(), self.unpack_f32(), self.unpack_f32()]
    }

    /// Exactly `len` raw bytes, or an empty slice on overrun.
    pub fn unpack_bytes(&mut self, len: usize) -> &'a [u8] {
        self.take(len).unwrap_or(&[])
    }

    pub fn unpack_string8(&mut self) -> String {
        let len = self.unpack_u8() as usize;
        String::from_utf8_lossy(self.unpack_bytes(len)).into_owned()
    }

    pub fn unpack_std_string(&mut self) -> String {
        let len = self.unpack_u32() as usize;
        String::from_utf8_lossy(self.unpack_bytes(len)).into_owned()
    }

    /// Reads a fixed width NUL padded field, returning the text before the
    /// first NUL.
    pub fn unpack_fixed_str(&mut self, width: usize) -> String {
        let field = self.unpack_bytes(width);
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_integers_are_big_endian() {
        let mut buf = Vec::new();
        buf.pack_u16(0x0102).pack_u32(0x0304_0506).pack_i16(-2);

        assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xff, 0xfe]);
    }

    #[test]
    fn test_float_layout() {
        let mut buf = Vec::new();
        buf.pack_f32(1.0);
        assert_eq!(buf, vec![0x3f, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_unpack_consumes_what_pack_produced() {
        let mut buf = Vec::new();
        buf.pack_u8(7)
            .pack_i32(-123_456)
            .pack_f64(2.5)
            .pack_vec3([1.0, -2.0, 3.5])
            .pack_string8("tank")
            .pack_std_string("a longer string")
            .pack_u16(0xbeef);

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.unpack_u8(), 7);
        assert_eq!(reader.unpack_i32(), -123_456);
        assert_approx_eq!(reader.unpack_f64(), 2.5);
        let v = reader.unpack_vec3();
        assert_approx_eq!(v[1], -2.0);
        assert_eq!(reader.unpack_string8(), "tank");
        assert_eq!(reader.unpack_std_string(), "a longer string");
        assert_eq!(reader.unpack_u16(), 0xbeef);
        assert_eq!(reader.remaining(), 0);
        assert!(!reader.is_overrun());
    }

    #[test]
    fn test_overrun_yields_zero_and_sets_flag() {
        let buf = [0x12u8];
        let mut reader = WireReader::new(&buf);

        assert_eq!(reader.unpack_u32(), 0);
        assert!(reader.is_overrun());
        assert_eq!(reader.unpack_u8(), 0);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_fixed_str_padding() {
        let mut buf = Vec::new();
        buf.pack_fixed_str("callsign", 12);
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[8..], &[0, 0, 0, 0]);

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.unpack_fixed_str(12), "callsign");
    }

    #[test]
    fn test_fixed_str_truncates_to_keep_terminator() {
        let mut buf = Vec::new();
        buf.pack_fixed_str("abcdef", 4);
        assert_eq!(buf, b"abc\0".to_vec());
    }

    #[test]
    fn test_string8_caps_length() {
        let long = "x".repeat(300);
        let mut buf = Vec::new();
        buf.pack_string8(&long);
        assert_eq!(buf[0], 255);
        assert_eq!(buf.len(), 256);
    }
}
