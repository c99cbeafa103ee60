use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type SegmentId = u64;
pub type BoundaryId = u64;
pub type TaskId = u64;

/// Structural position of a node: child indices from the root. Stable across
/// processes for the same tree, regardless of when dependencies settle.
pub type KeyPath = SmallVec<[usize; 8]>;

pub(crate) fn child_path(parent: &KeyPath, index: usize) -> KeyPath {
    let mut path = parent.clone();
    path.push(index);
    path
}

pub fn format_key_path(path: &KeyPath) -> String {
    if path.is_empty() {
        return "root".to_string();
    }
    path.iter().map(usize::to_string).collect::<Vec<_>>().join(".")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Flowing,
    Completed,
    Aborted,
    Errored,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Errored)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Flowing => write!(f, "flowing"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Context handed to `on_error` for every failing subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub boundary_id: Option<BoundaryId>,
    pub key_path: KeyPath,
    pub environment_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostponeInfo {
    pub boundary_id: Option<BoundaryId>,
    pub key_path: KeyPath,
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_child_path_extends_parent() {
        let root = KeyPath::new();
        let child = child_path(&root, 2);
        let grandchild = child_path(&child, 0);

        assert_eq!(grandchild.as_slice(), &[2, 0]);
        assert!(root.is_empty());
    }

    #[test]
    fn test_wide_child_indices_stay_distinct() {
        let root = KeyPath::new();
        let far = usize::MAX;

        assert_ne!(child_path(&root, far), child_path(&root, far - 1));
        assert_eq!(format_key_path(&child_path(&root, far)), far.to_string());
    }

    #[test]
    fn test_format_key_path() {
        assert_eq!(format_key_path(&KeyPath::new()), "root");
        let path: KeyPath = smallvec![1, 0, 3];
        assert_eq!(format_key_path(&path), "1.0.3");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Flowing.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Aborted.is_terminal());
        assert!(RequestStatus::Errored.is_terminal());
    }
}
