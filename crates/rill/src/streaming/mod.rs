pub mod channel;
pub mod destination;
pub mod driver;
pub mod stream;

pub use channel::{ChannelDestination, StreamItem};
pub use destination::{Destination, DestinationEvent, IoDestination, MemoryDestination, MemoryProbe};
pub use driver::{Progress, RenderHandle};
pub use stream::{RenderStream, render_to_stream, resume_to_stream};
