use bytes::{Bytes, BytesMut};
use tracing::warn;

use super::types::{BoundaryId, SegmentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Completed,
    Flushed,
    Postponed,
    Aborted,
    Errored,
}

#[derive(Debug, Clone)]
pub enum SegmentPart {
    Chunk(Bytes),
    Child(SegmentId),
}

/// A run of rendered output interleaved with child segments that were still
/// pending when their position was reached. When `boundary` is set the
/// segment is the slot of that Boundary in its parent and its own parts are
/// the fallback.
#[derive(Debug)]
pub struct Segment {
    pub id: SegmentId,
    pub status: SegmentStatus,
    pub boundary: Option<BoundaryId>,
    parts: Vec<SegmentPart>,
    buffer: BytesMut,
    byte_size: usize,
}

impl Segment {
    pub fn new(id: SegmentId) -> Self {
        Self {
            id,
            status: SegmentStatus::Pending,
            boundary: None,
            parts: Vec::new(),
            buffer: BytesMut::new(),
            byte_size: 0,
        }
    }

    pub fn placeholder(id: SegmentId, boundary: BoundaryId) -> Self {
        Self { boundary: Some(boundary), ..Self::new(id) }
    }

    pub fn with_status(id: SegmentId, status: SegmentStatus) -> Self {
        Self { status, ..Self::new(id) }
    }

    pub fn is_pending(&self) -> bool {
        self.status == SegmentStatus::Pending
    }

    /// The open buffer of a pending segment. Sealed segments never change.
    pub fn writer(&mut self) -> Option<&mut BytesMut> {
        if self.is_pending() {
            Some(&mut self.buffer)
        } else {
            warn!("Ignoring write to segment {} with status {:?}", self.id, self.status);
            None
        }
    }

    pub fn push_child(&mut self, child: SegmentId) {
        if !self.is_pending() {
            warn!("Ignoring child {} for sealed segment {}", child, self.id);
            return;
        }
        self.seal_buffer();
        self.parts.push(SegmentPart::Child(child));
    }

    pub fn complete(&mut self) {
        if self.is_pending() {
            self.seal_buffer();
            self.status = SegmentStatus::Completed;
        }
    }

    /// Ends a pending segment without completing it. Whatever was already
    /// buffered is kept so a partially rendered fallback can still be shown.
    pub fn finish_with(&mut self, status: SegmentStatus) {
        if self.is_pending() {
            self.seal_buffer();
            self.status = status;
        }
    }

    pub fn children(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.parts.iter().filter_map(|part| match part {
            SegmentPart::Child(id) => Some(*id),
            SegmentPart::Chunk(_) => None,
        })
    }

    /// Hands the parts over for writing. A segment is written at most once.
    pub fn take_parts(&mut self) -> Vec<SegmentPart> {
        if self.status == SegmentStatus::Completed {
            self.status = SegmentStatus::Flushed;
        }
        self.seal_buffer();
        std::mem::take(&mut self.parts)
    }

    /// Bytes of this segment alone, excluding children.
    pub fn byte_size(&self) -> usize {
        self.byte_size + self.buffer.len()
    }

    fn seal_buffer(&mut self) {
        if !self.buffer.is_empty() {
            let chunk = self.buffer.split().freeze();
            self.byte_size += chunk.len();
            self.parts.push(SegmentPart::Chunk(chunk));
        }
    }
}
