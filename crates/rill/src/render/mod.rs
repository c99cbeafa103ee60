pub mod boundary;
pub mod callbacks;
pub mod dependency;
pub mod flush;
pub mod node;
pub mod postponed;
pub mod request;
pub mod segment;
pub mod signal;
pub mod task;
pub mod types;

pub use boundary::{Boundary, BoundaryStatus};
pub use callbacks::{
    AllReadyCallback, ErrorCallback, PostponeCallback, RenderOptions, ShellErrorCallback,
    ShellReadyCallback,
};
pub use dependency::{Dependency, DependencyId, Settled, Settler};
pub use node::Node;
pub use postponed::{PostponedBoundary, PostponedState};
pub use request::Request;
pub use segment::{Segment, SegmentPart, SegmentStatus};
pub use signal::{Signal, SignalReceiver, SignalSender, signal_channel};
pub use task::{Scope, Task, TaskMode, TaskQueue};
pub use types::{
    BoundaryId, ErrorInfo, KeyPath, PostponeInfo, RequestStatus, SegmentId, TaskId, format_key_path,
};
