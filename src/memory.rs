//! Raw memory view: one contiguous growable byte buffer plus typed,
//! endian-aware accessors.
//!
//! Addresses are plain `u32` offsets into the buffer. There is no bounds
//! checking beyond what slice indexing enforces; out-of-range access is a
//! caller bug and panics, mirroring raw memory semantics.
//!
//! Two families of accessors exist on purpose. The `word`/`half`/`byte`
//! family is big-endian and is used for the allocator's own header fields
//! and bitsets, which makes dump images byte-stable across hosts. The
//! `get_*`/`set_*` family honors the configured [`Endian`] and carries
//! user data.

/// Byte order of the user-facing typed accessors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// The flat byte buffer backing a heap. Replaced wholesale on growth.
pub struct Memory {
    bytes: Vec<u8>,
    endian: Endian,
}

impl Memory {
    pub(crate) fn new(len: usize, endian: Endian) -> Self {
        Self {
            bytes: vec![0; len],
            endian,
        }
    }

    pub(crate) fn from_bytes(bytes: Vec<u8>, endian: Endian) -> Self {
        Self { bytes, endian }
    }

    /// Current buffer length in bytes.
    pub fn byte_size(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Replaces the buffer with a zero-filled one of `new_len` bytes and
    /// copies the old contents in. Returns false if the underlying
    /// allocation fails; the buffer is untouched in that case.
    pub(crate) fn grow(&mut self, new_len: usize) -> bool {
        let mut fresh: Vec<u8> = Vec::new();
        if fresh.try_reserve_exact(new_len).is_err() {
            return false;
        }
        fresh.resize(new_len, 0);
        fresh[..self.bytes.len()].copy_from_slice(&self.bytes);
        self.bytes = fresh;
        true
    }

    /// Copies `len` bytes from `src` to `dst`. Ranges may overlap.
    pub(crate) fn copy_within(&mut self, src: u32, dst: u32, len: u32) {
        let (src, len) = (src as usize, len as usize);
        self.bytes.copy_within(src..src + len, dst as usize);
    }

    fn array<const N: usize>(&self, address: u32) -> [u8; N] {
        let a = address as usize;
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.bytes[a..a + N]);
        buf
    }

    fn put(&mut self, address: u32, bytes: &[u8]) {
        let a = address as usize;
        self.bytes[a..a + bytes.len()].copy_from_slice(bytes);
    }

    // ---- internal accessors (header fields, bitsets; always big-endian) ----

    #[inline]
    pub(crate) fn word(&self, address: u32) -> u32 {
        u32::from_be_bytes(self.array(address))
    }

    #[inline]
    pub(crate) fn set_word(&mut self, address: u32, value: u32) {
        self.put(address, &value.to_be_bytes());
    }

    #[inline]
    pub(crate) fn half(&self, address: u32) -> u16 {
        u16::from_be_bytes(self.array(address))
    }

    #[inline]
    pub(crate) fn set_half(&mut self, address: u32, value: u16) {
        self.put(address, &value.to_be_bytes());
    }

    #[inline]
    pub(crate) fn byte(&self, address: u32) -> u8 {
        self.bytes[address as usize]
    }

    #[inline]
    pub(crate) fn set_byte(&mut self, address: u32, value: u8) {
        self.bytes[address as usize] = value;
    }

    // ---- user-facing typed accessors ----

    // The 8-bit accessors are only here for completeness, they don't have
    // an endianness.

    pub fn get_u8(&self, address: u32) -> u8 {
        self.bytes[address as usize]
    }

    pub fn set_u8(&mut self, address: u32, value: u8) {
        self.bytes[address as usize] = value;
    }

    pub fn get_i8(&self, address: u32) -> i8 {
        self.get_u8(address) as i8
    }

    pub fn set_i8(&mut self, address: u32, value: i8) {
        self.set_u8(address, value as u8);
    }

    pub fn get_u16(&self, address: u32) -> u16 {
        match self.endian {
            Endian::Little => u16::from_le_bytes(self.array(address)),
            Endian::Big => u16::from_be_bytes(self.array(address)),
        }
    }

    pub fn set_u16(&mut self, address: u32, value: u16) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.put(address, &bytes);
    }

    pub fn get_i16(&self, address: u32) -> i16 {
        self.get_u16(address) as i16
    }

    pub fn set_i16(&mut self, address: u32, value: i16) {
        self.set_u16(address, value as u16);
    }

    pub fn get_u32(&self, address: u32) -> u32 {
        match self.endian {
            Endian::Little => u32::from_le_bytes(self.array(address)),
            Endian::Big => u32::from_be_bytes(self.array(address)),
        }
    }

    pub fn set_u32(&mut self, address: u32, value: u32) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.put(address, &bytes);
    }

    pub fn get_i32(&self, address: u32) -> i32 {
        self.get_u32(address) as i32
    }

    pub fn set_i32(&mut self, address: u32, value: i32) {
        self.set_u32(address, value as u32);
    }

    pub fn get_f32(&self, address: u32) -> f32 {
        f32::from_bits(self.get_u32(address))
    }

    pub fn set_f32(&mut self, address: u32, value: f32) {
        self.set_u32(address, value.to_bits());
    }

    pub fn get_f64(&self, address: u32) -> f64 {
        f64::from_bits(self.get_i64(address) as u64)
    }

    pub fn set_f64(&mut self, address: u32, value: f64) {
        self.set_i64(address, value.to_bits() as i64);
    }

    /// 64-bit integer assembled from two endian-ordered 32-bit words, for
    /// targets without native 64-bit registers.
    pub fn get_i64(&self, address: u32) -> i64 {
        let (lo, hi) = match self.endian {
            Endian::Little => (self.get_u32(address), self.get_u32(address + 4)),
            Endian::Big => (self.get_u32(address + 4), self.get_u32(address)),
        };
        ((u64::from(hi) << 32) | u64::from(lo)) as i64
    }

    pub fn set_i64(&mut self, address: u32, value: i64) {
        let lo = value as u32;
        let hi = (value as u64 >> 32) as u32;
        match self.endian {
            Endian::Little => {
                self.set_u32(address, lo);
                self.set_u32(address + 4, hi);
            }
            Endian::Big => {
                self.set_u32(address + 4, lo);
                self.set_u32(address, hi);
            }
        }
    }
}
