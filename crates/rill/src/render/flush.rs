use bytes::BytesMut;
use tracing::debug;

use super::boundary::BoundaryStatus;
use super::request::Request;
use super::segment::{SegmentPart, SegmentStatus};
use super::types::{BoundaryId, RequestStatus, SegmentId};

impl Request {
    /// Writes everything that became writable: the shell once, then late
    /// client-render instructions, then completed boundaries. Stops at the
    /// first write the destination refuses.
    pub(super) fn flush_completed_queues(&mut self) {
        if self.closed || self.destination.is_none() || self.fatal_error.is_some() || self.backpressured {
            return;
        }

        if !self.pump() {
            return;
        }

        if !self.root_flushed && self.shell_ready {
            if let Some(root) = self.root_segment {
                debug!("Request {} flushing shell", self.request_id);
                self.write_segment(root);
            }
            self.root_flushed = true;
            if !self.pump() {
                return;
            }
        }

        if self.root_flushed {
            while let Some(id) = self.client_rendered_boundaries.pop_front() {
                self.write_client_rendered_boundary(id);
                if !self.pump() {
                    return;
                }
            }

            while let Some(id) = self.completed_boundaries.pop_front() {
                self.write_completed_boundary(id);
                if !self.pump() {
                    return;
                }
            }
        }

        if self.all_pending_tasks == 0
            && (self.root_flushed || self.root_postponed)
            && self.client_rendered_boundaries.is_empty()
            && self.completed_boundaries.is_empty()
            && self.outbox.is_empty()
        {
            self.close_destination();
        }
    }

    /// Moves buffered bytes to the destination. Returns false once it
    /// pushes back.
    fn pump(&mut self) -> bool {
        self.outbox.seal();
        let Some(destination) = self.destination.as_mut() else {
            return false;
        };

        while let Some(chunk) = self.outbox.take_chunk() {
            if !destination.write(chunk) {
                debug!("Request {} destination applied backpressure", self.request_id);
                self.backpressured = true;
                return false;
            }
        }

        true
    }

    fn close_destination(&mut self) {
        if let Some(mut destination) = self.destination.take() {
            destination.close();
        }
        self.closed = true;
        if !self.status.is_terminal() {
            self.status = RequestStatus::Completed;
        }
        debug!("Request {} closed ({})", self.request_id, self.status);
    }

    fn write_segment(&mut self, id: SegmentId) {
        let Some(segment) = self.segments.get(&id) else {
            return;
        };

        let status = segment.status;
        if let Some(boundary) = segment.boundary {
            self.write_boundary_slot(id, boundary);
            return;
        }

        match status {
            SegmentStatus::Completed => self.write_parts(id),
            status => debug!("Request {} skipping segment {} ({:?})", self.request_id, id, status),
        }
    }

    fn write_parts(&mut self, id: SegmentId) {
        let parts = self.segments.get_mut(&id).map(|segment| segment.take_parts()).unwrap_or_default();

        for part in parts {
            match part {
                SegmentPart::Chunk(bytes) => self.outbox.push(&bytes),
                SegmentPart::Child(child) => self.write_segment(child),
            }
        }
    }

    /// Writes the spot a boundary occupies inside its parent: the content
    /// itself when it is already complete and small, otherwise a marker
    /// around the fallback.
    fn write_boundary_slot(&mut self, placeholder: SegmentId, id: BoundaryId) {
        let include_messages = self.config.include_error_messages();
        let chunk_limit = self.config.progressive_chunk_size;

        let Some(boundary) = self.boundaries.get_mut(&id) else {
            return;
        };
        boundary.parent_flushed = true;

        let status = boundary.status;
        let content = boundary.content_segment;
        let outlined = boundary.byte_size > chunk_limit;
        let digest = boundary.digest.clone();
        let message = boundary.error.as_ref().filter(|_| include_messages).map(|error| error.message());

        let mut buf = BytesMut::new();

        match status {
            BoundaryStatus::Completed if !outlined => {
                boundary.flushed = true;
                self.format.write_start_completed_boundary(&mut buf);
                self.outbox.push(&buf);
                self.write_segment(content);

                buf.clear();
                self.format.write_end_boundary(&mut buf);
                self.outbox.push(&buf);
            }
            BoundaryStatus::ClientRendered => {
                boundary.flushed = true;
                self.format.write_start_client_rendered_boundary(
                    &mut buf,
                    digest.as_deref(),
                    message.as_deref(),
                );
                self.outbox.push(&buf);
                self.write_parts(placeholder);

                buf.clear();
                self.format.write_end_boundary(&mut buf);
                self.outbox.push(&buf);
            }
            status => {
                if status == BoundaryStatus::Completed {
                    debug!("Request {} outlining boundary {}", self.request_id, id);
                    self.completed_boundaries.push_back(id);
                }
                self.format.write_start_pending_boundary(&mut buf, id);
                self.outbox.push(&buf);
                self.write_parts(placeholder);

                buf.clear();
                self.format.write_end_boundary(&mut buf);
                self.outbox.push(&buf);
            }
        }
    }

    fn write_client_rendered_boundary(&mut self, id: BoundaryId) {
        let include_messages = self.config.include_error_messages();
        let Some(boundary) = self.boundaries.get_mut(&id) else {
            return;
        };
        if boundary.status != BoundaryStatus::ClientRendered || boundary.flushed {
            return;
        }
        boundary.flushed = true;

        let digest = boundary.digest.clone();
        let message = boundary.error.as_ref().filter(|_| include_messages).map(|error| error.message());

        let mut buf = BytesMut::new();
        self.format
            .write_client_render_instruction(&mut buf, id, digest.as_deref(), message.as_deref());
        self.outbox.push(&buf);
        debug!("Request {} client-render instruction for boundary {}", self.request_id, id);
    }

    fn write_completed_boundary(&mut self, id: BoundaryId) {
        let Some(boundary) = self.boundaries.get_mut(&id) else {
            return;
        };
        if boundary.status != BoundaryStatus::Completed || boundary.flushed {
            return;
        }
        boundary.flushed = true;
        let content = boundary.content_segment;

        let mut buf = BytesMut::new();
        self.format.write_start_segment(&mut buf, content);
        self.outbox.push(&buf);
        self.write_segment(content);

        buf.clear();
        self.format.write_end_segment(&mut buf);
        self.format.write_completed_boundary_instruction(&mut buf, id, content);
        self.outbox.push(&buf);
        debug!("Request {} revealed boundary {}", self.request_id, id);
    }
}
