use rustc_hash::FxHashSet;

use super::types::{BoundaryId, KeyPath, SegmentId, TaskId};
use crate::error::RillError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryStatus {
    Pending,
    Completed,
    ClientRendered,
    Postponed,
}

/// An asynchronously resolved subtree. Parents are referenced by id only.
#[derive(Debug)]
pub struct Boundary {
    pub id: BoundaryId,
    pub key_path: KeyPath,
    pub parent: Option<BoundaryId>,
    /// Boundary whose fallback rendered this one, if any.
    pub fallback_owner: Option<BoundaryId>,
    pub has_fallback: bool,
    pub status: BoundaryStatus,
    pub pending_count: usize,
    pub content_segment: SegmentId,
    /// The placeholder is already part of the emitted document.
    pub parent_flushed: bool,
    /// The final form of this boundary has been written.
    pub flushed: bool,
    pub postponed: bool,
    pub resumed: bool,
    pub error: Option<RillError>,
    pub digest: Option<String>,
    pub byte_size: usize,
    pub fallback_tasks: FxHashSet<TaskId>,
}

impl Boundary {
    pub fn new(
        id: BoundaryId,
        key_path: KeyPath,
        parent: Option<BoundaryId>,
        content_segment: SegmentId,
        has_fallback: bool,
    ) -> Self {
        Self {
            id,
            key_path,
            parent,
            fallback_owner: None,
            has_fallback,
            status: BoundaryStatus::Pending,
            pending_count: 0,
            content_segment,
            parent_flushed: false,
            flushed: false,
            postponed: false,
            resumed: false,
            error: None,
            digest: None,
            byte_size: 0,
            fallback_tasks: FxHashSet::default(),
        }
    }

    /// A boundary whose placeholder already lives in a previously emitted
    /// document.
    pub fn resumed(id: BoundaryId, key_path: KeyPath, content_segment: SegmentId) -> Self {
        Self {
            parent_flushed: true,
            resumed: true,
            ..Self::new(id, key_path, None, content_segment, true)
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == BoundaryStatus::Pending
    }

    /// Whether an error inside this boundary can be shown here rather than
    /// handed to the parent.
    pub fn can_contain_error(&self) -> bool {
        self.has_fallback || self.parent_flushed || self.resumed
    }

    pub fn mark_client_rendered(&mut self, error: RillError, digest: Option<String>) {
        self.status = BoundaryStatus::ClientRendered;
        self.error = Some(error);
        self.digest = digest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_boundary_is_pending() {
        let boundary = Boundary::new(5, KeyPath::new(), Some(1), 6, true);

        assert!(boundary.is_pending());
        assert!(boundary.can_contain_error());
        assert!(!boundary.parent_flushed);
        assert_eq!(boundary.pending_count, 0);
    }

    #[test]
    fn test_boundary_without_fallback_defers_errors() {
        let boundary = Boundary::new(5, KeyPath::new(), Some(1), 6, false);
        assert!(!boundary.can_contain_error());
    }

    #[test]
    fn test_resumed_boundary_already_in_document() {
        let boundary = Boundary::resumed(9, KeyPath::new(), 12);

        assert!(boundary.parent_flushed);
        assert!(boundary.can_contain_error());
        assert_eq!(boundary.parent, None);
    }

    #[test]
    fn test_mark_client_rendered_keeps_digest() {
        let mut boundary = Boundary::new(2, KeyPath::new(), None, 3, true);
        boundary.mark_client_rendered(RillError::render("boom"), Some("d1".to_string()));

        assert_eq!(boundary.status, BoundaryStatus::ClientRendered);
        assert_eq!(boundary.digest.as_deref(), Some("d1"));
        assert_eq!(boundary.error.as_ref().map(RillError::message).as_deref(), Some("boom"));
    }
}
