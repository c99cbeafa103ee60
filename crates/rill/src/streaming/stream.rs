use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use super::channel::{ChannelDestination, StreamItem};
use super::driver::RenderHandle;
use crate::error::{RillError, UsageError};
use crate::render::{Node, PostponedState, RenderOptions, Request};

type ReadySlot = Arc<Mutex<Option<oneshot::Sender<Result<(), RillError>>>>>;

/// Byte stream of one render. Dropping it before it ends aborts the render.
#[derive(Debug)]
pub struct RenderStream {
    receiver: mpsc::Receiver<StreamItem>,
    handle: RenderHandle,
    finished: bool,
}

impl RenderStream {
    pub fn handle(&self) -> &RenderHandle {
        &self.handle
    }

    pub fn request_id(&self) -> Uuid {
        self.handle.request_id()
    }

    pub async fn next_chunk(&mut self) -> Option<StreamItem> {
        let item = self.receiver.recv().await;
        if !matches!(item, Some(Ok(_))) {
            self.finished = true;
        }
        item
    }

    /// Reads the rest of the stream as UTF-8.
    pub async fn collect_text(mut self) -> Result<String, RillError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            bytes.extend_from_slice(&chunk?);
        }
        String::from_utf8(bytes).map_err(|e| RillError::serialization(format!("Render output is not UTF-8: {e}")))
    }
}

impl Stream for RenderStream {
    type Item = Result<Bytes, RillError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(error))) => {
                self.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RenderStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Render stream for request {} dropped early", self.handle.request_id());
            self.handle.abort_nowait(RillError::aborted("The render stream was cancelled."));
        }
    }
}

/// Starts a render on the current tokio runtime and resolves once its shell
/// is ready to read, or with the shell error. A render postponed at its
/// root resolves once all work is done; its stream is then empty.
pub async fn render_to_stream(node: Node, options: RenderOptions) -> Result<RenderStream, RillError> {
    options.config.validate()?;
    let capacity = options.config.stream_capacity;
    let (options, ready) = with_readiness(options);

    open_stream(RenderHandle::spawn(Request::new(node, options)), capacity, ready).await
}

/// Like [`render_to_stream`], for a render postponed by an earlier Request.
/// The stream carries only what comes after the earlier output.
pub async fn resume_to_stream(
    state: PostponedState,
    node: Node,
    options: RenderOptions,
) -> Result<RenderStream, RillError> {
    options.config.validate()?;
    let capacity = options.config.stream_capacity;
    let (options, ready) = with_readiness(options);

    open_stream(RenderHandle::spawn(Request::resume(state, node, options)), capacity, ready).await
}

async fn open_stream(
    handle: RenderHandle,
    capacity: usize,
    ready: oneshot::Receiver<Result<(), RillError>>,
) -> Result<RenderStream, RillError> {
    let (sender, receiver) = mpsc::channel(capacity);
    handle.attach_sink(ChannelDestination::new(sender)).await?;

    match ready.await {
        Ok(Ok(())) => Ok(RenderStream { receiver, handle, finished: false }),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(UsageError::DriverGone.into()),
    }
}

fn settle(slot: &ReadySlot, result: Result<(), RillError>) {
    if let Some(ready) = slot.lock().take() {
        let _ = ready.send(result);
    }
}

fn with_readiness(mut options: RenderOptions) -> (RenderOptions, oneshot::Receiver<Result<(), RillError>>) {
    let (ready, receiver) = oneshot::channel();
    let slot: ReadySlot = Arc::new(Mutex::new(Some(ready)));

    let on_shell_ready = options.on_shell_ready.take();
    let shell_slot = Arc::clone(&slot);
    options.on_shell_ready = Some(Box::new(move || {
        if let Some(callback) = on_shell_ready {
            callback();
        }
        settle(&shell_slot, Ok(()));
    }));

    let on_shell_error = options.on_shell_error.take();
    let error_slot = Arc::clone(&slot);
    options.on_shell_error = Some(Box::new(move |error: &RillError| {
        if let Some(callback) = on_shell_error {
            callback(error);
        }
        settle(&error_slot, Err(error.clone()));
    }));

    let on_all_ready = options.on_all_ready.take();
    options.on_all_ready = Some(Box::new(move || {
        if let Some(callback) = on_all_ready {
            callback();
        }
        settle(&slot, Ok(()));
    }));

    (options, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::render::{Dependency, RequestStatus};
    use crate::wire_format::apply_patches;
    use async_stream::stream;
    use futures::{StreamExt, pin_mut};
    use std::time::Duration;

    #[tokio::test]
    async fn test_static_render_streams_shell() {
        let stream = render_to_stream(
            Node::element("h1", vec![Node::text("Title")]),
            RenderOptions::new(RenderConfig::development()),
        )
        .await
        .expect("stream");

        assert_eq!(stream.collect_text().await.expect("text"), "<h1>Title</h1>");
    }

    #[tokio::test]
    async fn test_spawned_dependency_streams_in() {
        let slow = Dependency::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Node::text("slow"))
        });
        let node = Node::element("main", vec![Node::suspense(Node::text("..."), Node::deferred(slow))]);

        let render = render_to_stream(node, RenderOptions::default()).await.expect("stream");

        let texts = stream! {
            for await chunk in render {
                yield chunk.map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
            }
        };
        pin_mut!(texts);

        let mut document = String::new();
        while let Some(text) = texts.next().await {
            document.push_str(&text.expect("chunk"));
        }

        assert_eq!(
            apply_patches(&document).expect("patch"),
            "<main><!--$-->slow<!--/$--></main>"
        );
    }

    #[tokio::test]
    async fn test_shell_error_rejects_stream() {
        let node = Node::element("main", vec![Node::Fail(RillError::render("no shell"))]);

        let error = render_to_stream(node, RenderOptions::default()).await.expect_err("shell error");
        assert_eq!(error.message(), "no shell");
    }

    #[tokio::test]
    async fn test_small_channel_applies_backpressure() {
        let mut config = RenderConfig::development();
        config.view_size = 4;
        config.stream_capacity = 1;
        let text = "backpressure keeps every byte in order";

        let stream = render_to_stream(Node::text(text), RenderOptions::new(config)).await.expect("stream");

        assert_eq!(stream.collect_text().await.expect("text"), text);
    }

    #[tokio::test]
    async fn test_dropping_stream_aborts_render() {
        let (dependency, _settler) = Dependency::pending();
        let node = Node::suspense(Node::text("wait"), Node::deferred(dependency));

        let stream = render_to_stream(node, RenderOptions::default()).await.expect("stream");
        let handle = stream.handle().clone();
        drop(stream);

        assert_eq!(handle.finished().await.status, RequestStatus::Aborted);
    }

    #[tokio::test]
    async fn test_resume_to_stream() {
        let prerender = Node::suspense(Node::text("wait"), Node::postpone("dynamic"));
        let first = render_to_stream(prerender, RenderOptions::default()).await.expect("stream");
        let handle = first.handle().clone();
        let shell = first.collect_text().await.expect("shell");

        let state = handle.snapshot_for_resume().await.expect("snapshot").expect("postponed");
        let rest = resume_to_stream(state, Node::suspense(Node::text("wait"), Node::text("now")), RenderOptions::default())
            .await
            .expect("resume")
            .collect_text()
            .await
            .expect("rest");

        assert_eq!(
            apply_patches(&format!("{shell}{rest}")).expect("patch"),
            "<!--$-->now<!--/$-->"
        );
    }
}
