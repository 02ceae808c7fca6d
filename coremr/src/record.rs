use crate::helpe::*;

/// Fixed layout of one record: `dim` feature values followed by a label,
/// all `f64`, native byte order, packed back to back with no padding.
///
/// Reads and writes go through byte copies, so buffers carry no alignment
/// requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    dim: usize,
}

impl RecordLayout {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    #[inline(always)]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Bytes per record.
    #[inline(always)]
    pub fn stride(&self) -> usize {
        (self.dim + 1) * VALUE_BYTES
    }

    /// Number of whole records in `bytes` bytes. A trailing fragment is
    /// not a record.
    #[inline(always)]
    pub fn count(&self, bytes: usize) -> usize {
        bytes / self.stride()
    }

    pub fn view<'a>(&self, bytes: &'a [u8]) -> Records<'a> {
        Records { layout: *self, bytes }
    }

    pub fn view_mut<'a>(&self, bytes: &'a mut [u8]) -> RecordsMut<'a> {
        RecordsMut { layout: *self, bytes }
    }

    /// Appends one record to `out`.
    pub fn encode(&self, features: &[f64], label: f64, out: &mut Vec<u8>) {
        debug_assert_eq!(features.len(), self.dim);
        out.reserve(self.stride());
        for v in features.iter().chain(std::iter::once(&label)) {
            out.extend_from_slice(&v.to_ne_bytes());
        }
    }
}

#[inline(always)]
fn read_f64(bytes: &[u8], at: usize) -> f64 {
    let mut word = [0; VALUE_BYTES];
    word.copy_from_slice(&bytes[at..at + VALUE_BYTES]);
    f64::from_ne_bytes(word)
}

#[inline(always)]
fn write_f64(bytes: &mut [u8], at: usize, v: f64) {
    bytes[at..at + VALUE_BYTES].copy_from_slice(&v.to_ne_bytes());
}

/// Read-only view over a run of packed records.
#[derive(Clone, Copy)]
pub struct Records<'a> {
    layout: RecordLayout,
    bytes:  &'a [u8],
}

impl<'a> Records<'a> {
    pub fn len(&self) -> usize {
        self.layout.count(self.bytes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Record<'a> {
        let stride = self.layout.stride();
        Record {
            dim:    self.layout.dim,
            bytes:  &self.bytes[idx * stride..(idx + 1) * stride],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Record<'a>> {
        let this = *self;
        (0..this.len()).map(move |idx| this.get(idx))
    }
}

#[derive(Clone, Copy)]
pub struct Record<'a> {
    dim:    usize,
    bytes:  &'a [u8],
}

impl<'a> Record<'a> {
    #[inline(always)]
    pub fn value(&self, k: usize) -> f64 {
        debug_assert!(k < self.dim);
        read_f64(self.bytes, k * VALUE_BYTES)
    }

    pub fn features(&self) -> impl Iterator<Item = f64> + 'a {
        let bytes = self.bytes;
        (0..self.dim).map(move |k| read_f64(bytes, k * VALUE_BYTES))
    }

    #[inline(always)]
    pub fn label(&self) -> f64 {
        read_f64(self.bytes, self.dim * VALUE_BYTES)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Mutable view over a run of packed records.
pub struct RecordsMut<'a> {
    layout: RecordLayout,
    bytes:  &'a mut [u8],
}

impl RecordsMut<'_> {
    pub fn len(&self) -> usize {
        self.layout.count(self.bytes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_mut(&mut self, idx: usize) -> RecordMut<'_> {
        let stride = self.layout.stride();
        RecordMut {
            dim:    self.layout.dim,
            bytes:  &mut self.bytes[idx * stride..(idx + 1) * stride],
        }
    }
}

pub struct RecordMut<'a> {
    dim:    usize,
    bytes:  &'a mut [u8],
}

impl RecordMut<'_> {
    #[inline(always)]
    pub fn value(&self, k: usize) -> f64 {
        debug_assert!(k < self.dim);
        read_f64(self.bytes, k * VALUE_BYTES)
    }

    pub fn label(&self) -> f64 {
        read_f64(self.bytes, self.dim * VALUE_BYTES)
    }

    pub fn set_label(&mut self, label: f64) {
        write_f64(self.bytes, self.dim * VALUE_BYTES, label);
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }
}
