//! MSB-first bit cursor used by the BITON codec.

/// Accumulates bits into bytes; a partial byte is held until 8 bits arrive.
#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Write the low `bits` bits of `value`, most significant first.
    pub(crate) fn write(&mut self, value: u64, bits: u8) {
        for shift in (0..bits).rev() {
            let bit = ((value >> shift) & 1) as u8;
            self.current = (self.current << 1) | bit;
            self.used += 1;
            if self.used == 8 {
                self.bytes.push(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }

    /// Pad the current byte with zero bits.
    pub(crate) fn align(&mut self) {
        if self.used > 0 {
            self.bytes.push(self.current << (8 - self.used));
            self.current = 0;
            self.used = 0;
        }
    }

    /// Byte-aligned raw run.
    pub(crate) fn write_bytes(&mut self, raw: &[u8]) {
        self.align();
        self.bytes.extend_from_slice(raw);
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        self.align();
        self.bytes
    }
}

/// Reads bits back in the order [`BitWriter`] wrote them.
#[derive(Debug)]
pub(crate) struct BitReader<'a> {
    bytes: &'a [u8],
    position: usize,
    /// Bits still unread in `bytes[position]`.
    remaining: u8,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
            remaining: 8,
        }
    }

    pub(crate) fn read(&mut self, bits: u8) -> Option<u64> {
        let mut value = 0u64;
        for _ in 0..bits {
            let byte = *self.bytes.get(self.position)?;
            let bit = (byte >> (self.remaining - 1)) & 1;
            value = (value << 1) | u64::from(bit);
            self.remaining -= 1;
            if self.remaining == 0 {
                self.position += 1;
                self.remaining = 8;
            }
        }
        Some(value)
    }

    /// Skip the padding bits of a partially read byte.
    pub(crate) fn align(&mut self) {
        if self.remaining < 8 {
            self.position += 1;
            self.remaining = 8;
        }
    }

    /// True when everything left is zero padding in the current byte.
    pub(crate) fn at_padding(&self) -> bool {
        let Some(&byte) = self.bytes.get(self.position) else {
            return true;
        };
        if self.remaining == 8 {
            return false;
        }
        let mask = (1u8 << self.remaining) - 1;
        byte & mask == 0 && self.position + 1 == self.bytes.len()
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        self.align();
        let end = self.position.checked_add(len)?;
        let raw = self.bytes.get(self.position..end)?;
        self.position = end;
        Some(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_across_byte_boundaries() {
        let mut writer = BitWriter::new();
        writer.write(0b101, 3);
        writer.write(0b11110000, 8);
        writer.write(1, 1);
        let bytes = writer.finish();
        assert_eq!(bytes, vec![0b1011_1110, 0b0001_0000]);

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read(3), Some(0b101));
        assert_eq!(reader.read(8), Some(0b11110000));
        assert_eq!(reader.read(1), Some(1));
    }

    #[test]
    fn raw_runs_are_byte_aligned() {
        let mut writer = BitWriter::new();
        writer.write(0b11, 2);
        writer.write_bytes(b"ok");
        writer.write(1, 1);
        let bytes = writer.finish();
        assert_eq!(bytes, vec![0b1100_0000, b'o', b'k', 0b1000_0000]);

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read(2), Some(0b11));
        assert_eq!(reader.read_bytes(2), Some(&b"ok"[..]));
        assert_eq!(reader.read(1), Some(1));
    }

    #[test]
    fn reading_past_the_end_fails() {
        let mut reader = BitReader::new(&[0xff]);
        assert_eq!(reader.read(8), Some(0xff));
        assert_eq!(reader.read(1), None);
        assert_eq!(reader.read_bytes(1), None);
    }

    #[test]
    fn padding_must_be_zero_and_final() {
        let mut reader = BitReader::new(&[0b1010_0000]);
        assert_eq!(reader.read(3), Some(0b101));
        assert!(reader.at_padding());

        let mut reader = BitReader::new(&[0b1010_0001]);
        reader.read(3);
        assert!(!reader.at_padding());

        let mut reader = BitReader::new(&[0b1010_0000, 0]);
        reader.read(3);
        assert!(!reader.at_padding());

        let mut reader = BitReader::new(&[0xff]);
        reader.read(8);
        assert!(reader.at_padding());
    }
}
