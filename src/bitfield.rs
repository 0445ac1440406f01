use bitvec::prelude::*;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BitfieldError {

    #[error("bit index {0} out of range")]
    IndexOutOfRange(usize),

    #[error("length {len} exceeds the {bytes} byte backing field")]
    LengthExceedsField { len: usize, bytes: usize },

}

// Set of piece indices, packed MSB-first so index 0 is the high bit of the
// first byte. The raw bytes are exactly what the wire bitfield message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    field: BitVec<u8, Msb0>,
}

impl Bitfield {

    // All-false field with ceil(len / 8) backing bytes; pad bits stay zero.
    pub fn new(len: usize) -> Self {
        Self { field: BitVec::repeat(false, len) }
    }

    // Adopts a wire payload. The logical length is 8 * bytes until the owner
    // shrinks it with set_length.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { field: BitVec::from_slice(bytes) }
    }

    // Shrinks the logical length of a parsed field to the real piece count.
    pub fn set_length(&mut self, len: usize) -> Result<(), BitfieldError> {
        let capacity = self.field.as_raw_slice().len() * 8;
        if len > capacity {
            return Err(BitfieldError::LengthExceedsField { len, bytes: capacity / 8 });
        }
        self.field.truncate(len);
        Ok(())
    }

    pub fn set(&mut self, index: usize) -> Result<(), BitfieldError> {
        if index >= self.field.len() {
            return Err(BitfieldError::IndexOutOfRange(index));
        }
        self.field.set(index, true);
        Ok(())
    }

    // Out-of-range reads are false, not an error.
    pub fn get(&self, index: usize) -> bool {
        self.field.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.field.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field.is_empty()
    }

    pub fn count_set(&self) -> usize {
        self.field.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.field.all()
    }

    pub fn byte_len(&self) -> usize {
        self.field.as_raw_slice().len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.field.as_raw_slice()
    }
}
