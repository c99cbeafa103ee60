use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error};
use uuid::Uuid;

use super::destination::Destination;
use crate::error::{RillError, UsageError};
use crate::render::{Node, PostponedState, RenderOptions, Request, RequestStatus};

/// Last observed state of a driven Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub status: RequestStatus,
    pub shell_ready: bool,
    pub pending_tasks: usize,
    pub closed: bool,
}

impl Progress {
    fn of(request: &Request) -> Self {
        Self {
            status: request.status(),
            shell_ready: request.is_shell_ready(),
            pending_tasks: request.pending_tasks(),
            closed: request.is_closed(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.closed || self.status.is_terminal()
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Control {
    Attach(Box<dyn Destination>, Reply<Result<(), RillError>>),
    Detach(Reply<Option<Box<dyn Destination>>>),
    Abort(RillError, Option<Reply<Result<(), RillError>>>),
    Snapshot(Reply<Result<Option<PostponedState>, RillError>>),
}

/// Owner-side handle of a Request running on its own tokio task. The task
/// is the only thread of control touching the Request; every call here is a
/// message to it.
#[derive(Debug, Clone)]
pub struct RenderHandle {
    control: mpsc::UnboundedSender<Control>,
    progress: watch::Receiver<Progress>,
    request_id: Uuid,
}

impl RenderHandle {
    pub fn start(node: Node, options: RenderOptions) -> Result<Self, RillError> {
        options.config.validate()?;
        Ok(Self::spawn(Request::new(node, options)))
    }

    pub fn resume(state: PostponedState, node: Node, options: RenderOptions) -> Result<Self, RillError> {
        options.config.validate()?;
        Ok(Self::spawn(Request::resume(state, node, options)))
    }

    pub fn spawn(request: Request) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress) = watch::channel(Progress::of(&request));
        let request_id = request.request_id();

        tokio::spawn(drive(request, control_rx, progress_tx));

        Self { control, progress, request_id }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn status(&self) -> RequestStatus {
        self.progress.borrow().status
    }

    pub async fn attach_sink(&self, destination: impl Destination + 'static) -> Result<(), RillError> {
        let (reply, response) = oneshot::channel();
        self.send(Control::Attach(Box::new(destination), reply))?;
        response.await.map_err(|_| UsageError::DriverGone)?
    }

    pub async fn detach_sink(&self) -> Result<Option<Box<dyn Destination>>, RillError> {
        let (reply, response) = oneshot::channel();
        self.send(Control::Detach(reply))?;
        Ok(response.await.map_err(|_| UsageError::DriverGone)?)
    }

    pub async fn abort(&self, reason: impl Into<RillError>) -> Result<(), RillError> {
        let (reply, response) = oneshot::channel();
        self.send(Control::Abort(reason.into(), Some(reply)))?;
        response.await.map_err(|_| UsageError::DriverGone)?
    }

    /// Requests an abort without waiting for it. Does nothing once the
    /// driver has exited.
    pub fn abort_nowait(&self, reason: impl Into<RillError>) {
        if self.send(Control::Abort(reason.into(), None)).is_err() {
            debug!("Request {} already finished; abort ignored", self.request_id);
        }
    }

    pub async fn snapshot_for_resume(&self) -> Result<Option<PostponedState>, RillError> {
        let (reply, response) = oneshot::channel();
        self.send(Control::Snapshot(reply))?;
        response.await.map_err(|_| UsageError::DriverGone)?
    }

    /// Resolves once the Request closed its output or reached a terminal
    /// status.
    pub async fn finished(&self) -> Progress {
        let mut progress = self.progress.clone();
        if let Ok(state) = progress.wait_for(Progress::is_finished).await {
            return *state;
        }
        *progress.borrow()
    }

    fn send(&self, command: Control) -> Result<(), RillError> {
        self.control.send(command).map_err(|_| UsageError::DriverGone.into())
    }
}

async fn drive(
    mut request: Request,
    mut control: mpsc::UnboundedReceiver<Control>,
    progress: watch::Sender<Progress>,
) {
    let Some(mut signals) = request.take_signal_receiver() else {
        error!("Request {} has no signal queue to drive", request.request_id());
        return;
    };

    debug!("Driving request {}", request.request_id());
    request.start_work();
    let mut control_open = true;

    loop {
        while let Ok(signal) = signals.try_recv() {
            request.handle_signal(signal);
        }

        while control_open {
            match control.try_recv() {
                Ok(command) => handle_control(&mut request, command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => control_open = false,
            }
        }

        let more = request.perform_work();
        progress.send_replace(Progress::of(&request));

        if more {
            tokio::task::yield_now().await;
            continue;
        }

        if !control_open {
            if request.is_closed() {
                break;
            }
            if !request.has_destination() {
                if !request.status().is_terminal() {
                    if let Err(e) = request.abort(RillError::aborted("The render was dropped before it finished.")) {
                        debug!("Request {} could not be aborted: {}", request.request_id(), e);
                    }
                }
                break;
            }
        }

        tokio::select! {
            biased;
            command = control.recv(), if control_open => match command {
                Some(command) => handle_control(&mut request, command),
                None => control_open = false,
            },
            signal = signals.recv() => match signal {
                Some(signal) => request.handle_signal(signal),
                None => break,
            },
        }
    }

    progress.send_replace(Progress::of(&request));
    debug!("Driver for request {} exiting ({})", request.request_id(), request.status());
}

fn handle_control(request: &mut Request, command: Control) {
    match command {
        Control::Attach(destination, reply) => {
            if let Err(Err(e)) = reply.send(request.start_flowing(destination)) {
                debug!("Attach to request {} failed after its caller left: {}", request.request_id(), e);
            }
        }
        Control::Detach(reply) => {
            if let Err(Some(_)) = reply.send(request.stop_flowing()) {
                debug!("Request {} detached a destination nobody collected", request.request_id());
            }
        }
        Control::Abort(reason, reply) => {
            let result = request.abort(reason);
            let unreported = match reply {
                Some(reply) => reply.send(result).err(),
                None => Some(result),
            };
            if let Some(Err(e)) = unreported {
                debug!("Abort of request {} ignored: {}", request.request_id(), e);
            }
        }
        Control::Snapshot(reply) => {
            if let Err(Err(e)) = reply.send(request.snapshot_for_resume()) {
                debug!("Snapshot of request {} failed after its caller left: {}", request.request_id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;
    use crate::render::Dependency;
    use crate::streaming::MemoryDestination;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_driver_renders_into_attached_sink() {
        let handle = RenderHandle::start(
            Node::element("p", vec![Node::text("driven")]),
            RenderOptions::new(RenderConfig::development()),
        )
        .expect("start");

        let (destination, probe) = MemoryDestination::new();
        handle.attach_sink(destination).await.expect("attach");

        let progress = handle.finished().await;
        assert!(progress.closed);
        assert_eq!(progress.status, RequestStatus::Completed);
        assert_eq!(probe.text(), "<p>driven</p>");
    }

    #[tokio::test]
    async fn test_driver_wakes_on_settled_dependency() {
        let (dependency, settler) = Dependency::pending();
        let handle = RenderHandle::start(
            Node::suspense(Node::text("wait"), Node::deferred(dependency)),
            RenderOptions::default(),
        )
        .expect("start");

        let (destination, probe) = MemoryDestination::new();
        handle.attach_sink(destination).await.expect("attach");
        settler.resolve("later");

        handle.finished().await;
        assert!(probe.text().ends_with("<script>$RC(\"B:1\",\"S:3\")</script>"));
    }

    #[tokio::test]
    async fn test_abort_through_handle() {
        let (dependency, _settler) = Dependency::pending();
        let handle = RenderHandle::start(
            Node::suspense(Node::text("wait"), Node::deferred(dependency)),
            RenderOptions::default(),
        )
        .expect("start");

        let (destination, probe) = MemoryDestination::new();
        handle.attach_sink(destination).await.expect("attach");
        handle.abort(RillError::aborted("stop")).await.expect("abort");

        assert_eq!(handle.finished().await.status, RequestStatus::Aborted);
        assert!(probe.text().contains("$RX(\"B:1\",\"\",\"stop\")"));

        let again = handle.abort("stop again").await.expect_err("already aborted");
        assert!(again.is_usage());
    }

    #[tokio::test]
    async fn test_snapshot_through_handle() {
        let handle = RenderHandle::start(
            Node::suspense(Node::text("wait"), Node::postpone("request data")),
            RenderOptions::default(),
        )
        .expect("start");

        let (destination, _probe) = MemoryDestination::new();
        handle.attach_sink(destination).await.expect("attach");
        handle.finished().await;

        let state = handle.snapshot_for_resume().await.expect("snapshot").expect("postponed");
        assert_eq!(state.unresolved_boundary_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = RenderConfig::development();
        config.view_size = 0;

        let error = RenderHandle::start(Node::empty(), RenderOptions::new(config)).expect_err("invalid");
        assert_eq!(error.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    #[traced_test]
    fn test_unclaimed_control_results_are_logged() {
        let mut request = Request::new(Node::text("done"), RenderOptions::default());
        request.abort(RillError::aborted("first")).expect("abort");

        handle_control(&mut request, Control::Abort(RillError::aborted("second"), None));
        assert!(logs_contain("ignored"));

        let (reply, response) = oneshot::channel();
        drop(response);
        let (destination, probe) = MemoryDestination::new();
        handle_control(&mut request, Control::Attach(Box::new(destination), reply));

        assert_eq!(request.status(), RequestStatus::Aborted);
        assert_eq!(probe.chunk_count(), 0);
    }
}
