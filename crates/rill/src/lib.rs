pub mod config;
pub mod error;
pub mod render;
pub mod streaming;
pub mod tree;
pub mod wire_format;

pub use config::{Mode, RenderConfig, ResumableConfig};
pub use error::{RillError, UsageError};
pub use render::{
    Dependency, ErrorInfo, KeyPath, Node, PostponeInfo, PostponedState, RenderOptions, Request,
    RequestStatus, Settler,
};
pub use streaming::{
    ChannelDestination, Destination, IoDestination, MemoryDestination, RenderHandle, RenderStream,
    render_to_stream, resume_to_stream,
};
pub use tree::TreeDef;
pub use wire_format::{HtmlWireFormat, WireFormat, apply_patches};
