use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::boundary::{Boundary, BoundaryStatus};
use super::request::Request;
use super::types::{BoundaryId, KeyPath, RequestStatus};
use crate::config::ResumableConfig;
use crate::error::{RillError, UsageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostponedBoundary {
    pub id: BoundaryId,
    pub key_path: KeyPath,
}

/// What a later Request needs to finish a postponed render: the boundaries
/// left open in the emitted document, addressed by id and by position in
/// the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostponedState {
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub next_id: u64,
    #[serde(default)]
    pub root_postponed: bool,
    #[serde(default)]
    pub unresolved_boundaries: Vec<PostponedBoundary>,
    pub resumable_config: ResumableConfig,
}

impl PostponedState {
    pub fn unresolved_boundary_ids(&self) -> Vec<BoundaryId> {
        self.unresolved_boundaries.iter().map(|boundary| boundary.id).collect()
    }

    pub fn to_json(&self) -> Result<String, RillError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, RillError> {
        serde_json::from_str(json).map_err(|e| {
            RillError::deserialization(format!("Failed to parse postponed state: {e}"))
        })
    }
}

impl Request {
    /// Captures what is needed to resume this render later. `None` when
    /// nothing was postponed. Fails while tasks are still outstanding.
    pub fn snapshot_for_resume(&self) -> Result<Option<PostponedState>, RillError> {
        if self.all_pending_tasks > 0 && !self.status.is_terminal() {
            return Err(UsageError::WorkOutstanding(self.all_pending_tasks).into());
        }

        if self.status == RequestStatus::Errored {
            return Ok(None);
        }

        let unresolved_boundaries: Vec<PostponedBoundary> = if self.root_postponed {
            Vec::new()
        } else {
            self.boundaries
                .values()
                .filter(|boundary| boundary.status == BoundaryStatus::Postponed)
                .filter(|boundary| self.is_visible(boundary))
                .map(|boundary| PostponedBoundary { id: boundary.id, key_path: boundary.key_path.clone() })
                .collect()
        };

        if !self.root_postponed && unresolved_boundaries.is_empty() {
            return Ok(None);
        }

        debug!(
            "Request {} snapshot: {} unresolved boundaries (root postponed: {})",
            self.request_id,
            unresolved_boundaries.len(),
            self.root_postponed
        );

        Ok(Some(PostponedState {
            request_id: self.request_id,
            created_at: Utc::now(),
            next_id: self.next_id,
            root_postponed: self.root_postponed,
            unresolved_boundaries,
            resumable_config: self.config.resumable(),
        }))
    }

    /// Whether the boundary's pending marker ends up in the final document.
    /// Anything rendered as part of a fallback, or nested in a boundary that
    /// did not complete, is replaced before a reader could resume it.
    fn is_visible(&self, boundary: &Boundary) -> bool {
        let mut current = boundary;
        loop {
            if current.fallback_owner.is_some() {
                return false;
            }
            let Some(parent) = current.parent else {
                return true;
            };
            match self.boundaries.get(&parent) {
                Some(parent) if parent.status == BoundaryStatus::Completed => current = parent,
                _ => return false,
            }
        }
    }
}
