pub mod escape;
pub mod format;
pub mod outbox;
pub mod patcher;

pub use escape::{escape_attribute, escape_text, is_valid_tag_name};
pub use format::{HtmlWireFormat, WireFormat};
pub use outbox::Outbox;
pub use patcher::apply_patches;
