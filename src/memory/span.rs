//! Host views of guest byte ranges

use std::sync::Arc;

use super::Backing;

struct Segment {
    backing: Arc<Backing>,
    offset: usize,
    len: usize,
}

/// A guest range as a list of host storage segments. Pages that are
/// contiguous in one backing collapse into a single segment.
#[derive(Default)]
pub struct Span {
    segments: Vec<Segment>,
}

impl Span {
    pub(super) fn push(&mut self, backing: Arc<Backing>, offset: usize, len: usize) {
        if let Some(last) = self.segments.last_mut() {
            if Arc::ptr_eq(&last.backing, &backing) && last.offset + last.len == offset {
                last.len += len;
                return;
            }
        }
        self.segments.push(Segment { backing, offset, len });
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the whole range sits in one host allocation
    pub fn is_contiguous(&self) -> bool {
        self.segments.len() <= 1
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Copy the range into `out`, which must hold at least `len()` bytes
    pub fn copy_to(&self, out: &mut [u8]) {
        let mut done = 0;
        for segment in &self.segments {
            segment.backing.read_into(segment.offset, &mut out[done..done + segment.len]);
            done += segment.len;
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        self.copy_to(&mut out);
        out
    }
}
