use bytes::{BufMut, BytesMut};

use super::escape::{escape_attribute, escape_script_string, escape_text};
use crate::render::{BoundaryId, SegmentId};

/// How rendered content and boundary bookkeeping are spelled on the wire.
/// The Request only decides what to write and when; implementations decide
/// the bytes.
pub trait WireFormat: Send {
    fn push_text(&self, buf: &mut BytesMut, text: &str);

    fn push_raw(&self, buf: &mut BytesMut, raw: &[u8]) {
        buf.put_slice(raw);
    }

    fn push_start_element(&self, buf: &mut BytesMut, tag: &str);

    fn push_end_element(&self, buf: &mut BytesMut, tag: &str);

    fn write_start_pending_boundary(&self, buf: &mut BytesMut, boundary: BoundaryId);

    fn write_start_completed_boundary(&self, buf: &mut BytesMut);

    fn write_start_client_rendered_boundary(
        &self,
        buf: &mut BytesMut,
        digest: Option<&str>,
        message: Option<&str>,
    );

    fn write_end_boundary(&self, buf: &mut BytesMut);

    fn write_start_segment(&self, buf: &mut BytesMut, segment: SegmentId);

    fn write_end_segment(&self, buf: &mut BytesMut);

    fn write_completed_boundary_instruction(
        &self,
        buf: &mut BytesMut,
        boundary: BoundaryId,
        segment: SegmentId,
    );

    fn write_client_render_instruction(
        &self,
        buf: &mut BytesMut,
        boundary: BoundaryId,
        digest: Option<&str>,
        message: Option<&str>,
    );
}

#[derive(Debug, Clone, Default)]
pub struct HtmlWireFormat {
    identifier_prefix: String,
}

impl HtmlWireFormat {
    pub fn new(identifier_prefix: impl Into<String>) -> Self {
        Self { identifier_prefix: identifier_prefix.into() }
    }

    pub fn boundary_id(&self, boundary: BoundaryId) -> String {
        format!("{}B:{}", self.identifier_prefix, boundary)
    }

    pub fn segment_id(&self, segment: SegmentId) -> String {
        format!("{}S:{}", self.identifier_prefix, segment)
    }
}

impl WireFormat for HtmlWireFormat {
    fn push_text(&self, buf: &mut BytesMut, text: &str) {
        buf.put_slice(escape_text(text).as_bytes());
    }

    fn push_start_element(&self, buf: &mut BytesMut, tag: &str) {
        buf.put_u8(b'<');
        buf.put_slice(tag.as_bytes());
        buf.put_u8(b'>');
    }

    fn push_end_element(&self, buf: &mut BytesMut, tag: &str) {
        buf.put_slice(b"</");
        buf.put_slice(tag.as_bytes());
        buf.put_u8(b'>');
    }

    fn write_start_pending_boundary(&self, buf: &mut BytesMut, boundary: BoundaryId) {
        buf.put_slice(b"<!--$?--><template id=\"");
        buf.put_slice(escape_attribute(&self.boundary_id(boundary)).as_bytes());
        buf.put_slice(b"\"></template>");
    }

    fn write_start_completed_boundary(&self, buf: &mut BytesMut) {
        buf.put_slice(b"<!--$-->");
    }

    fn write_start_client_rendered_boundary(
        &self,
        buf: &mut BytesMut,
        digest: Option<&str>,
        message: Option<&str>,
    ) {
        buf.put_slice(b"<!--$!--><template");
        if let Some(digest) = digest {
            buf.put_slice(b" data-dgst=\"");
            buf.put_slice(escape_attribute(digest).as_bytes());
            buf.put_u8(b'"');
        }
        if let Some(message) = message {
            buf.put_slice(b" data-msg=\"");
            buf.put_slice(escape_attribute(message).as_bytes());
            buf.put_u8(b'"');
        }
        buf.put_slice(b"></template>");
    }

    fn write_end_boundary(&self, buf: &mut BytesMut) {
        buf.put_slice(b"<!--/$-->");
    }

    fn write_start_segment(&self, buf: &mut BytesMut, segment: SegmentId) {
        buf.put_slice(b"<div hidden id=\"");
        buf.put_slice(escape_attribute(&self.segment_id(segment)).as_bytes());
        buf.put_slice(b"\">");
    }

    fn write_end_segment(&self, buf: &mut BytesMut) {
        buf.put_slice(b"</div>");
    }

    fn write_completed_boundary_instruction(
        &self,
        buf: &mut BytesMut,
        boundary: BoundaryId,
        segment: SegmentId,
    ) {
        buf.put_slice(b"<script>$RC(\"");
        buf.put_slice(escape_script_string(&self.boundary_id(boundary)).as_bytes());
        buf.put_slice(b"\",\"");
        buf.put_slice(escape_script_string(&self.segment_id(segment)).as_bytes());
        buf.put_slice(b"\")</script>");
    }

    fn write_client_render_instruction(
        &self,
        buf: &mut BytesMut,
        boundary: BoundaryId,
        digest: Option<&str>,
        message: Option<&str>,
    ) {
        buf.put_slice(b"<script>$RX(\"");
        buf.put_slice(escape_script_string(&self.boundary_id(boundary)).as_bytes());
        buf.put_u8(b'"');

        if digest.is_some() || message.is_some() {
            buf.put_slice(b",\"");
            buf.put_slice(escape_script_string(digest.unwrap_or_default()).as_bytes());
            buf.put_u8(b'"');
        }
        if let Some(message) = message {
            buf.put_slice(b",\"");
            buf.put_slice(escape_script_string(message).as_bytes());
            buf.put_u8(b'"');
        }

        buf.put_slice(b")</script>");
    }
}
