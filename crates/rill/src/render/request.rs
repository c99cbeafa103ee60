use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::boundary::{Boundary, BoundaryStatus};
use super::callbacks::{Callbacks, RenderOptions};
use super::dependency::{Dependency, DependencyId, Settled};
use super::node::Node;
use super::postponed::PostponedState;
use super::segment::{Segment, SegmentStatus};
use super::signal::{Signal, SignalReceiver, SignalSender, signal_channel};
use super::task::{Scope, Task, TaskMode, TaskQueue};
use super::types::{
    BoundaryId, ErrorInfo, KeyPath, PostponeInfo, RequestStatus, SegmentId, TaskId, child_path,
    format_key_path,
};
use crate::config::RenderConfig;
use crate::error::{RillError, UsageError};
use crate::streaming::{Destination, DestinationEvent};
use crate::wire_format::{HtmlWireFormat, Outbox, WireFormat, is_valid_tag_name};

/// Why rendering of a task stopped before reaching its end.
#[derive(Debug)]
enum Interrupt {
    Fail(RillError, KeyPath),
    /// The whole request failed while this task was running.
    Fatal,
}

/// One top-level render. Owns every Segment, Boundary and Task of it in
/// id-indexed arenas and is driven from a single thread of control.
pub struct Request {
    pub(super) request_id: Uuid,
    pub(super) config: RenderConfig,
    pub(super) format: Box<dyn WireFormat>,
    pub(super) callbacks: Callbacks,
    pub(super) status: RequestStatus,
    pub(super) next_id: u64,
    next_task_id: TaskId,
    pub(super) root_segment: Option<SegmentId>,
    pub(super) segments: FxHashMap<SegmentId, Segment>,
    pub(super) boundaries: BTreeMap<BoundaryId, Boundary>,
    tasks: TaskQueue,
    waiting: FxHashMap<DependencyId, Vec<TaskId>>,
    signals: SignalSender,
    signal_receiver: Option<SignalReceiver>,
    pending_root_tasks: usize,
    pub(super) all_pending_tasks: usize,
    started: bool,
    pub(super) shell_ready: bool,
    all_ready: bool,
    pub(super) root_postponed: bool,
    pub(super) root_flushed: bool,
    pub(super) resumed: bool,
    replay_targets: FxHashMap<KeyPath, BoundaryId>,
    pub(super) client_rendered_boundaries: VecDeque<BoundaryId>,
    pub(super) completed_boundaries: VecDeque<BoundaryId>,
    pub(super) fatal_error: Option<RillError>,
    pub(super) destination: Option<Box<dyn Destination>>,
    /// Bumped by every `start_flowing`; sink events carry the value they
    /// were bound with.
    attachment: u64,
    pub(super) backpressured: bool,
    pub(super) outbox: Outbox,
    pub(super) closed: bool,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("request_id", &self.request_id)
            .field("status", &self.status)
            .field("next_id", &self.next_id)
            .field("pending_root_tasks", &self.pending_root_tasks)
            .field("all_pending_tasks", &self.all_pending_tasks)
            .field("boundaries", &self.boundaries.len())
            .field("shell_ready", &self.shell_ready)
            .field("root_postponed", &self.root_postponed)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn new(node: Node, options: RenderOptions) -> Self {
        let (config, format, callbacks) = Callbacks::split(options);
        let mut request = Self::build(config, format, callbacks);
        request.seed_root(node, TaskMode::Render);
        request
    }

    /// Continues a render that was postponed by an earlier Request. Only the
    /// postponed boundaries are rendered again; everything the first Request
    /// emitted is the caller's to carry forward.
    pub fn resume(state: PostponedState, node: Node, options: RenderOptions) -> Self {
        let (mut config, format, callbacks) = Callbacks::split(options);
        config.apply_resumable(&state.resumable_config);

        let mut request = Self::build(config, format, callbacks);
        request.next_id = state.next_id;
        request.resumed = true;

        debug!(
            "Request {} resumes postponed request {} ({} boundaries, root postponed: {})",
            request.request_id,
            state.request_id,
            state.unresolved_boundaries.len(),
            state.root_postponed
        );

        if state.root_postponed {
            request.seed_root(node, TaskMode::Render);
        } else {
            request.replay_targets = state
                .unresolved_boundaries
                .into_iter()
                .map(|boundary| (boundary.key_path, boundary.id))
                .collect();
            request.root_flushed = true;
            request.seed_root(node, TaskMode::Replay);
        }

        request
    }

    fn build(
        config: RenderConfig,
        format: Option<Box<dyn WireFormat>>,
        callbacks: Callbacks,
    ) -> Self {
        let (signals, signal_receiver) = signal_channel();
        let format = format.unwrap_or_else(|| {
            Box::new(HtmlWireFormat::new(config.identifier_prefix.clone())) as Box<dyn WireFormat>
        });
        let outbox = Outbox::new(config.view_size);

        Self {
            request_id: Uuid::new_v4(),
            config,
            format,
            callbacks,
            status: RequestStatus::Pending,
            next_id: 0,
            next_task_id: 0,
            root_segment: None,
            segments: FxHashMap::default(),
            boundaries: BTreeMap::new(),
            tasks: TaskQueue::new(),
            waiting: FxHashMap::default(),
            signals,
            signal_receiver: Some(signal_receiver),
            pending_root_tasks: 0,
            all_pending_tasks: 0,
            started: false,
            shell_ready: false,
            all_ready: false,
            root_postponed: false,
            root_flushed: false,
            resumed: false,
            replay_targets: FxHashMap::default(),
            client_rendered_boundaries: VecDeque::new(),
            completed_boundaries: VecDeque::new(),
            fatal_error: None,
            destination: None,
            attachment: 0,
            backpressured: false,
            outbox,
            closed: false,
        }
    }

    fn seed_root(&mut self, node: Node, mode: TaskMode) {
        let segment = match mode {
            TaskMode::Render => {
                let id = self.allocate_id();
                self.segments.insert(id, Segment::new(id));
                self.root_segment = Some(id);
                Some(id)
            }
            TaskMode::Replay => None,
        };

        let task = self.create_task(node, KeyPath::new(), segment, Scope::root(mode));
        self.tasks.schedule(task);
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_shell_ready(&self) -> bool {
        self.shell_ready
    }

    pub fn has_destination(&self) -> bool {
        self.destination.is_some()
    }

    pub fn pending_tasks(&self) -> usize {
        self.all_pending_tasks
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Hands the signal queue to an external driver. After this the Request
    /// only learns about settled dependencies and sink events through
    /// [`Request::handle_signal`].
    pub fn take_signal_receiver(&mut self) -> Option<SignalReceiver> {
        self.signal_receiver.take()
    }

    pub fn start_work(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        debug!("Request {} starting work", self.request_id);

        if self.root_segment.is_none() && self.resumed {
            self.complete_shell();
        }

        self.perform_work();
    }

    /// Runs ready tasks in FIFO order, at most `work_budget` of them, then
    /// flushes. Returns whether ready work remains.
    pub fn perform_work(&mut self) -> bool {
        if !self.started || self.is_halted() {
            return false;
        }

        let budget = self.config.work_budget.unwrap_or(usize::MAX);
        let mut performed = 0;

        while performed < budget {
            let Some(task) = self.tasks.next() else {
                break;
            };
            self.run_task(task);
            performed += 1;

            if self.is_halted() {
                break;
            }
        }

        self.flush_completed_queues();

        !self.is_halted() && self.tasks.has_ready()
    }

    /// Drives the Request synchronously until no ready work or queued signal
    /// remains.
    pub fn run_until_idle(&mut self) {
        if !self.started {
            self.start_work();
        }

        loop {
            while self.perform_work() {}

            if self.process_signals() == 0 {
                break;
            }
        }
    }

    /// Handles every signal already queued and returns how many there were.
    pub fn process_signals(&mut self) -> usize {
        let mut signals = Vec::new();
        if let Some(receiver) = self.signal_receiver.as_mut() {
            while let Ok(signal) = receiver.try_recv() {
                signals.push(signal);
            }
        }

        let count = signals.len();
        for signal in signals {
            self.handle_signal(signal);
        }
        count
    }

    pub fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Ping(dependency) => self.ping(dependency),
            Signal::Destination { attachment, event } => {
                if attachment == self.attachment && self.destination.is_some() {
                    self.handle_destination_event(event);
                } else {
                    debug!(
                        "Request {} ignoring {:?} from detached destination {}",
                        self.request_id, event, attachment
                    );
                }
            }
        }
    }

    pub fn ping(&mut self, dependency: DependencyId) {
        if let Some(waiters) = self.waiting.remove(&dependency) {
            for task in waiters {
                self.tasks.wake(task);
            }
        }
    }

    fn handle_destination_event(&mut self, event: DestinationEvent) {
        match event {
            DestinationEvent::Drain => {
                if self.backpressured {
                    debug!("Request {} destination drained", self.request_id);
                    self.backpressured = false;
                    self.flush_completed_queues();
                }
            }
            DestinationEvent::Error(cause) => {
                self.destination_lost("The destination stream errored while writing data.", Some(&cause));
            }
            DestinationEvent::Close => {
                self.destination_lost("The destination stream closed early.", None);
            }
        }
    }

    fn destination_lost(&mut self, message: &str, cause: Option<&RillError>) {
        if self.closed || self.status.is_terminal() {
            debug!("Request {} lost its destination after termination", self.request_id);
            self.destination = None;
            self.backpressured = false;
            self.closed = true;
            return;
        }

        warn!("Request {}: {}", self.request_id, message);
        self.destination = None;
        self.backpressured = false;

        let mut reason = RillError::destination(message);
        if let Some(cause) = cause {
            reason.set_property("cause", &cause.to_string());
        }

        if let Err(e) = self.abort(reason) {
            debug!("Request {} could not abort after losing its destination: {}", self.request_id, e);
        }
        self.closed = true;
    }

    pub fn start_flowing(&mut self, mut destination: Box<dyn Destination>) -> Result<(), RillError> {
        if self.destination.is_some() {
            return Err(UsageError::AlreadyFlowing.into());
        }

        if let Some(error) = &self.fatal_error {
            destination.close_with_error(error);
            self.closed = true;
            return Ok(());
        }

        if self.closed {
            return Err(UsageError::Closed.into());
        }

        self.attachment += 1;
        destination.bind(self.signals.for_attachment(self.attachment));
        self.destination = Some(destination);
        if self.status == RequestStatus::Pending {
            self.status = RequestStatus::Flowing;
        }
        debug!("Request {} attached a destination", self.request_id);

        self.flush_completed_queues();
        Ok(())
    }

    pub fn stop_flowing(&mut self) -> Option<Box<dyn Destination>> {
        let destination = self.destination.take();
        self.backpressured = false;
        if self.status == RequestStatus::Flowing {
            self.status = RequestStatus::Pending;
        }
        if destination.is_some() {
            debug!("Request {} detached its destination", self.request_id);
        }
        destination
    }

    /// Forces every pending boundary to its fallback with `reason` as the
    /// error. Irreversible; no task runs afterwards.
    pub fn abort(&mut self, reason: impl Into<RillError>) -> Result<(), RillError> {
        let reason = reason.into();
        if self.status.is_terminal() {
            return Err(UsageError::AlreadyTerminated(self.status).into());
        }

        warn!("Aborting request {}: {}", self.request_id, reason);
        self.status = RequestStatus::Aborted;

        for task in self.tasks.drain() {
            self.end_segment(task.segment, SegmentStatus::Aborted);
        }
        self.waiting.clear();

        if !self.shell_ready && !self.root_postponed {
            let info = self.error_info(None, &KeyPath::new());
            self.callbacks.error(&reason, &info);
            self.fail_shell(reason.clone());
        } else {
            let pending: Vec<BoundaryId> = self
                .boundaries
                .values()
                .filter(|boundary| boundary.is_pending())
                .map(|boundary| boundary.id)
                .collect();

            for id in pending {
                self.abort_boundary(id, &reason);
            }

            if !self.replay_targets.is_empty() {
                self.client_render_replay_targets(|_| true, &reason);
            }
        }

        for boundary in self.boundaries.values_mut() {
            boundary.pending_count = 0;
            boundary.fallback_tasks.clear();
        }
        self.pending_root_tasks = 0;
        self.all_pending_tasks = 0;

        self.complete_all();
        self.flush_completed_queues();
        Ok(())
    }

    fn abort_boundary(&mut self, id: BoundaryId, reason: &RillError) {
        let Some(boundary) = self.boundaries.get_mut(&id) else {
            return;
        };

        if boundary.postponed {
            boundary.status = BoundaryStatus::Postponed;
            return;
        }

        let key_path = boundary.key_path.clone();
        let info = self.error_info(Some(id), &key_path);
        let digest = self.callbacks.error(reason, &info);

        if let Some(boundary) = self.boundaries.get_mut(&id) {
            boundary.mark_client_rendered(reason.clone(), digest);
            if boundary.parent_flushed {
                self.client_rendered_boundaries.push_back(id);
            }
        }
    }

    pub(super) fn is_halted(&self) -> bool {
        matches!(self.status, RequestStatus::Aborted | RequestStatus::Errored)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn error_info(&self, boundary_id: Option<BoundaryId>, key_path: &KeyPath) -> ErrorInfo {
        ErrorInfo {
            boundary_id,
            key_path: key_path.clone(),
            environment_name: self.config.environment_name.clone(),
        }
    }

    fn create_task(
        &mut self,
        node: Node,
        key_path: KeyPath,
        segment: Option<SegmentId>,
        scope: Scope,
    ) -> Task {
        let id = self.next_task_id;
        self.next_task_id += 1;

        self.all_pending_tasks += 1;
        match scope.boundary {
            Some(boundary) => {
                if let Some(boundary) = self.boundaries.get_mut(&boundary) {
                    boundary.pending_count += 1;
                }
            }
            None if scope.blocks_shell() => self.pending_root_tasks += 1,
            None => {}
        }

        if let Some(owner) = scope.fallback_of {
            if let Some(owner) = self.boundaries.get_mut(&owner) {
                owner.fallback_tasks.insert(id);
            }
        }

        Task { id, node, key_path, segment, scope }
    }

    fn wait_on(&mut self, task: Task, dependency: &Dependency) {
        let dependency_id = dependency.id();
        let task_id = task.id;
        self.tasks.park(task);

        if let Some(waiters) = self.waiting.get_mut(&dependency_id) {
            waiters.push(task_id);
        } else if dependency.subscribe(self.signals.clone()) {
            self.waiting.insert(dependency_id, vec![task_id]);
        } else {
            self.tasks.wake(task_id);
        }
    }

    fn run_task(&mut self, task: Task) {
        if let Node::Async(dependency) = &task.node {
            if dependency.is_pending() {
                let dependency = dependency.clone();
                self.wait_on(task, &dependency);
                return;
            }
        }

        let result = match (task.scope.mode, task.segment) {
            (TaskMode::Render, Some(segment)) => {
                self.render_node(&task.scope, segment, &task.node, &task.key_path)
            }
            (TaskMode::Render, None) => Err(Interrupt::Fail(
                RillError::internal("Render task has no segment to write into"),
                task.key_path.clone(),
            )),
            (TaskMode::Replay, _) => self.replay_node(&task.scope, &task.node, &task.key_path),
        };

        match result {
            Ok(()) => {
                if let Some(segment) = task.segment.and_then(|id| self.segments.get_mut(&id)) {
                    segment.complete();
                }
                self.finish_task(&task);
            }
            Err(Interrupt::Fail(error, key_path)) => {
                self.error_task(&task, error, &key_path);
                self.finish_task(&task);
            }
            Err(Interrupt::Fatal) => {}
        }
    }

    fn finish_task(&mut self, task: &Task) {
        if let Some(owner) = task.scope.fallback_of {
            if let Some(owner) = self.boundaries.get_mut(&owner) {
                owner.fallback_tasks.remove(&task.id);
            }
        }
        self.finish_accounting(task.scope);
    }

    fn finish_accounting(&mut self, scope: Scope) {
        if self.is_halted() {
            return;
        }

        self.all_pending_tasks = self.all_pending_tasks.saturating_sub(1);

        match scope.boundary {
            Some(id) => {
                let settled = self.boundaries.get_mut(&id).is_some_and(|boundary| {
                    boundary.pending_count = boundary.pending_count.saturating_sub(1);
                    boundary.pending_count == 0
                });
                if settled {
                    self.boundary_settled(id);
                }
            }
            None if scope.blocks_shell() => {
                self.pending_root_tasks = self.pending_root_tasks.saturating_sub(1);
                if self.pending_root_tasks == 0 {
                    self.complete_shell();
                }
            }
            None => {}
        }

        if self.all_pending_tasks == 0 {
            self.complete_all();
        }
    }

    fn end_segment(&mut self, segment: Option<SegmentId>, status: SegmentStatus) {
        if let Some(segment) = segment.and_then(|id| self.segments.get_mut(&id)) {
            segment.finish_with(status);
        }
    }

    fn emit(&mut self, segment: SegmentId, write: impl FnOnce(&dyn WireFormat, &mut BytesMut)) {
        if let Some(writer) = self.segments.get_mut(&segment).and_then(Segment::writer) {
            write(self.format.as_ref(), writer);
        }
    }

    fn render_node(
        &mut self,
        scope: &Scope,
        segment: SegmentId,
        node: &Node,
        key_path: &KeyPath,
    ) -> Result<(), Interrupt> {
        match node {
            Node::Text(text) => {
                self.emit(segment, |format, buf| format.push_text(buf, text));
                Ok(())
            }
            Node::Raw(raw) => {
                self.emit(segment, |format, buf| format.push_raw(buf, raw));
                Ok(())
            }
            Node::Element { tag, children } => {
                if !is_valid_tag_name(tag) {
                    return Err(Interrupt::Fail(
                        RillError::render(format!("Invalid element tag: {tag}")),
                        key_path.clone(),
                    ));
                }
                self.emit(segment, |format, buf| format.push_start_element(buf, tag));
                self.render_children(scope, segment, children, key_path)?;
                self.emit(segment, |format, buf| format.push_end_element(buf, tag));
                Ok(())
            }
            Node::Fragment(children) => self.render_children(scope, segment, children, key_path),
            Node::Suspense { fallback, children } => {
                self.render_suspense(scope, segment, fallback.as_deref(), children, key_path)
            }
            Node::Async(dependency) => match dependency.settled() {
                None => {
                    self.spawn_suspended(scope, Some(segment), node, key_path, dependency);
                    Ok(())
                }
                Some(Settled::Resolved(value)) => self.render_node(scope, segment, &value, key_path),
                Some(Settled::Rejected(error)) => Err(Interrupt::Fail(error, key_path.clone())),
                Some(Settled::Postponed(reason)) => {
                    self.postpone_at(scope, Some(segment), &reason, key_path);
                    Ok(())
                }
            },
            Node::Postpone(reason) => {
                self.postpone_at(scope, Some(segment), reason, key_path);
                Ok(())
            }
            Node::Fail(error) => Err(Interrupt::Fail(error.clone(), key_path.clone())),
        }
    }

    fn render_children(
        &mut self,
        scope: &Scope,
        segment: SegmentId,
        children: &[Node],
        key_path: &KeyPath,
    ) -> Result<(), Interrupt> {
        for (index, child) in children.iter().enumerate() {
            self.render_node(scope, segment, child, &child_path(key_path, index))?;
        }
        Ok(())
    }

    fn spawn_suspended(
        &mut self,
        scope: &Scope,
        segment: Option<SegmentId>,
        node: &Node,
        key_path: &KeyPath,
        dependency: &Dependency,
    ) {
        let child = segment.map(|parent| {
            let child = self.allocate_id();
            self.segments.insert(child, Segment::new(child));
            if let Some(parent) = self.segments.get_mut(&parent) {
                parent.push_child(child);
            }
            child
        });

        let task = self.create_task(node.clone(), key_path.clone(), child, *scope);
        debug!(
            "Request {} task {} suspended on dependency {} at {}",
            self.request_id,
            task.id,
            dependency.id(),
            format_key_path(key_path)
        );
        self.wait_on(task, dependency);
    }

    fn render_suspense(
        &mut self,
        scope: &Scope,
        segment: SegmentId,
        fallback: Option<&Node>,
        children: &Node,
        key_path: &KeyPath,
    ) -> Result<(), Interrupt> {
        let boundary_id = self.allocate_id();
        let placeholder = self.allocate_id();
        let content = self.allocate_id();

        self.segments.insert(placeholder, Segment::placeholder(placeholder, boundary_id));
        self.segments.insert(content, Segment::new(content));
        if let Some(parent) = self.segments.get_mut(&segment) {
            parent.push_child(placeholder);
        }

        let mut boundary =
            Boundary::new(boundary_id, key_path.clone(), scope.boundary, content, fallback.is_some());
        boundary.fallback_owner = scope.fallback_of;
        self.boundaries.insert(boundary_id, boundary);

        self.render_boundary_content(boundary_id, children, &child_path(key_path, 0))?;

        let needs_fallback = self
            .boundaries
            .get(&boundary_id)
            .is_some_and(|boundary| boundary.status != BoundaryStatus::Completed);

        match fallback {
            Some(fallback) if needs_fallback => {
                let fallback_scope =
                    Scope { boundary: scope.boundary, fallback_of: Some(boundary_id), mode: scope.mode };
                let task = self.create_task(
                    fallback.clone(),
                    child_path(key_path, 1),
                    Some(placeholder),
                    fallback_scope,
                );
                self.tasks.schedule(task);
            }
            _ => {
                if let Some(placeholder) = self.segments.get_mut(&placeholder) {
                    placeholder.complete();
                }
            }
        }

        Ok(())
    }

    /// Renders the content of a boundary inline, as if by a task of its own.
    fn render_boundary_content(
        &mut self,
        boundary_id: BoundaryId,
        children: &Node,
        key_path: &KeyPath,
    ) -> Result<(), Interrupt> {
        let Some(boundary) = self.boundaries.get_mut(&boundary_id) else {
            return Ok(());
        };
        boundary.pending_count += 1;
        let content = boundary.content_segment;

        let scope = Scope { boundary: Some(boundary_id), fallback_of: None, mode: TaskMode::Render };

        match self.render_node(&scope, content, children, key_path) {
            Ok(()) => {
                if let Some(segment) = self.segments.get_mut(&content) {
                    segment.complete();
                }
            }
            Err(Interrupt::Fail(error, failed_at)) => {
                self.end_segment(Some(content), SegmentStatus::Errored);
                let info = self.error_info(Some(boundary_id), &failed_at);
                let digest = self.callbacks.error(&error, &info);
                self.client_render_boundary(boundary_id, error, digest);
                if self.is_halted() {
                    return Err(Interrupt::Fatal);
                }
            }
            Err(Interrupt::Fatal) => return Err(Interrupt::Fatal),
        }

        let settled = self.boundaries.get_mut(&boundary_id).is_some_and(|boundary| {
            boundary.pending_count = boundary.pending_count.saturating_sub(1);
            boundary.pending_count == 0
        });
        if settled {
            self.boundary_settled(boundary_id);
        }

        Ok(())
    }

    fn postpone_at(
        &mut self,
        scope: &Scope,
        segment: Option<SegmentId>,
        reason: &str,
        key_path: &KeyPath,
    ) {
        if let Some(parent) = segment {
            let hole = self.allocate_id();
            self.segments.insert(hole, Segment::with_status(hole, SegmentStatus::Postponed));
            if let Some(parent) = self.segments.get_mut(&parent) {
                parent.push_child(hole);
            }
        }

        let info = PostponeInfo { boundary_id: scope.boundary, key_path: key_path.clone() };
        self.callbacks.postpone(reason, &info);

        match scope.boundary {
            Some(id) => {
                if let Some(boundary) = self.boundaries.get_mut(&id) {
                    boundary.postponed = true;
                    if boundary.status == BoundaryStatus::ClientRendered && !boundary.flushed {
                        boundary.status = BoundaryStatus::Pending;
                        boundary.error = None;
                        boundary.digest = None;
                    }
                }
                debug!(
                    "Request {} boundary {} postponed at {}: {}",
                    self.request_id,
                    id,
                    format_key_path(key_path),
                    reason
                );
            }
            None => {
                if self.status == RequestStatus::Errored {
                    return;
                }
                if !self.root_postponed {
                    debug!(
                        "Request {} postponed at root level ({}): {}",
                        self.request_id,
                        format_key_path(key_path),
                        reason
                    );
                }
                self.root_postponed = true;
            }
        }
    }

    fn replay_node(&mut self, scope: &Scope, node: &Node, key_path: &KeyPath) -> Result<(), Interrupt> {
        if !self.has_targets_under(key_path) {
            return Ok(());
        }

        match node {
            Node::Text(_) | Node::Raw(_) => Ok(()),
            Node::Element { children, .. } | Node::Fragment(children) => {
                for (index, child) in children.iter().enumerate() {
                    self.replay_child(scope, child, &child_path(key_path, index))?;
                }
                Ok(())
            }
            Node::Suspense { fallback, children } => {
                if let Some(id) = self.replay_targets.remove(key_path) {
                    return self.resume_boundary(id, children, key_path);
                }
                self.replay_child(scope, children, &child_path(key_path, 0))?;
                if let Some(fallback) = fallback {
                    self.replay_child(scope, fallback, &child_path(key_path, 1))?;
                }
                Ok(())
            }
            Node::Async(dependency) => match dependency.settled() {
                None => {
                    self.spawn_suspended(scope, None, node, key_path, dependency);
                    Ok(())
                }
                Some(Settled::Resolved(value)) => self.replay_node(scope, &value, key_path),
                Some(Settled::Rejected(error)) => Err(Interrupt::Fail(error, key_path.clone())),
                Some(Settled::Postponed(reason)) => {
                    Err(Interrupt::Fail(RillError::postponed(reason), key_path.clone()))
                }
            },
            Node::Postpone(reason) => {
                Err(Interrupt::Fail(RillError::postponed(reason.clone()), key_path.clone()))
            }
            Node::Fail(error) => Err(Interrupt::Fail(error.clone(), key_path.clone())),
        }
    }

    /// Replays one child. A failure only gives up the postponed boundaries
    /// below the node that failed; its siblings keep replaying.
    fn replay_child(&mut self, scope: &Scope, node: &Node, key_path: &KeyPath) -> Result<(), Interrupt> {
        match self.replay_node(scope, node, key_path) {
            Err(Interrupt::Fail(error, failed_at)) => {
                self.replay_failed(&error, &failed_at);
                Ok(())
            }
            result => result,
        }
    }

    fn replay_failed(&mut self, error: &RillError, failed_at: &KeyPath) {
        warn!(
            "Request {} could not replay {}: {}",
            self.request_id,
            format_key_path(failed_at),
            error
        );
        self.client_render_replay_targets(|path| path.starts_with(failed_at), error);
    }

    fn has_targets_under(&self, key_path: &KeyPath) -> bool {
        self.replay_targets.keys().any(|target| target.starts_with(key_path))
    }

    fn resume_boundary(
        &mut self,
        id: BoundaryId,
        children: &Node,
        key_path: &KeyPath,
    ) -> Result<(), Interrupt> {
        let content = self.allocate_id();
        self.segments.insert(content, Segment::new(content));
        self.boundaries.insert(id, Boundary::resumed(id, key_path.clone(), content));

        debug!(
            "Request {} resuming boundary {} at {}",
            self.request_id,
            id,
            format_key_path(key_path)
        );

        self.render_boundary_content(id, children, &child_path(key_path, 0))
    }

    fn error_task(&mut self, task: &Task, error: RillError, failed_at: &KeyPath) {
        self.end_segment(task.segment, SegmentStatus::Errored);

        if task.scope.mode == TaskMode::Replay {
            self.replay_failed(&error, failed_at);
            return;
        }

        let info = self.error_info(task.scope.boundary, failed_at);
        let digest = self.callbacks.error(&error, &info);

        match task.scope.boundary {
            Some(id) => self.client_render_boundary(id, error, digest),
            None if self.root_postponed => {
                warn!(
                    "Request {} is already postponed at root level; ignoring error: {}",
                    self.request_id, error
                );
            }
            None => self.fatal_error(error),
        }
    }

    /// Hands `error` to the nearest boundary able to display it. Boundaries
    /// without a fallback pass it to their parent.
    fn client_render_boundary(&mut self, id: BoundaryId, error: RillError, digest: Option<String>) {
        let mut target = id;

        loop {
            let Some(boundary) = self.boundaries.get(&target) else {
                return;
            };
            if boundary.can_contain_error() {
                break;
            }

            match boundary.parent {
                Some(parent) if self.boundaries.get(&parent).is_some_and(Boundary::is_pending) => {
                    if let Some(boundary) = self.boundaries.get_mut(&target) {
                        if boundary.is_pending() && !boundary.postponed {
                            boundary.mark_client_rendered(error.clone(), digest.clone());
                        }
                    }
                    target = parent;
                }
                Some(_) => break,
                None => {
                    if !self.shell_ready && !self.root_postponed {
                        self.fatal_error(error);
                        return;
                    }
                    break;
                }
            }
        }

        let Some(boundary) = self.boundaries.get_mut(&target) else {
            return;
        };

        if boundary.postponed && !boundary.flushed {
            debug!(
                "Request {} boundary {} stays postponed despite error: {}",
                self.request_id, target, error
            );
            return;
        }

        if !boundary.is_pending() {
            return;
        }

        warn!(
            "Request {} boundary {} falls back to client rendering: {}",
            self.request_id, target, error
        );
        let parent_flushed = boundary.parent_flushed;
        boundary.mark_client_rendered(error, digest);
        if parent_flushed {
            self.client_rendered_boundaries.push_back(target);
        }
    }

    fn client_render_replay_targets(
        &mut self,
        matches: impl Fn(&KeyPath) -> bool,
        error: &RillError,
    ) {
        let mut targets: Vec<(KeyPath, BoundaryId)> = self
            .replay_targets
            .iter()
            .filter(|&(path, _)| matches(path))
            .map(|(path, id)| (path.clone(), *id))
            .collect();
        targets.sort_by_key(|(_, id)| *id);

        for (key_path, id) in targets {
            self.replay_targets.remove(&key_path);

            let info = self.error_info(Some(id), &key_path);
            let digest = self.callbacks.error(error, &info);

            let content = self.allocate_id();
            self.segments.insert(content, Segment::with_status(content, SegmentStatus::Aborted));
            let mut boundary = Boundary::resumed(id, key_path, content);
            boundary.mark_client_rendered(error.clone(), digest);
            self.boundaries.insert(id, boundary);
            self.client_rendered_boundaries.push_back(id);

            warn!(
                "Request {} postponed boundary {} falls back to client rendering: {}",
                self.request_id, id, error
            );
        }
    }

    fn boundary_settled(&mut self, id: BoundaryId) {
        let Some(boundary) = self.boundaries.get_mut(&id) else {
            return;
        };
        if !boundary.is_pending() {
            return;
        }

        if boundary.postponed {
            boundary.status = BoundaryStatus::Postponed;
            debug!("Request {} boundary {} settled as postponed", self.request_id, id);
            return;
        }

        boundary.status = BoundaryStatus::Completed;
        let content = boundary.content_segment;
        let parent_flushed = boundary.parent_flushed;
        let mut fallback_tasks: Vec<TaskId> = boundary.fallback_tasks.drain().collect();
        fallback_tasks.sort_unstable();

        let byte_size = self.subtree_size(content);
        if let Some(boundary) = self.boundaries.get_mut(&id) {
            boundary.byte_size = byte_size;
        }
        debug!("Request {} boundary {} completed ({} bytes)", self.request_id, id, byte_size);

        for task in fallback_tasks {
            self.abort_fallback_task(task);
        }

        if parent_flushed {
            self.completed_boundaries.push_back(id);
        }
    }

    fn subtree_size(&self, segment: SegmentId) -> usize {
        self.segments.get(&segment).map_or(0, |segment| {
            segment.byte_size() + segment.children().map(|child| self.subtree_size(child)).sum::<usize>()
        })
    }

    /// The fallback of a completed boundary will never be shown.
    fn abort_fallback_task(&mut self, id: TaskId) {
        let Some(task) = self.tasks.remove(id) else {
            return;
        };

        for waiters in self.waiting.values_mut() {
            waiters.retain(|waiter| *waiter != id);
        }
        self.waiting.retain(|_, waiters| !waiters.is_empty());

        self.end_segment(task.segment, SegmentStatus::Aborted);
        self.finish_accounting(task.scope);
    }

    fn complete_shell(&mut self) {
        if self.shell_ready || self.is_halted() {
            return;
        }
        if self.root_postponed {
            debug!("Request {} root is postponed; shell withheld", self.request_id);
            return;
        }

        self.shell_ready = true;
        debug!("Request {} shell ready", self.request_id);
        self.callbacks.shell_ready();
    }

    fn complete_all(&mut self) {
        if self.all_ready {
            return;
        }
        self.all_ready = true;

        if !self.replay_targets.is_empty() {
            let error = RillError::render("The postponed boundary could not be found while resuming.");
            self.client_render_replay_targets(|_| true, &error);
        }

        if self.status == RequestStatus::Errored {
            return;
        }

        debug!("Request {} all work complete", self.request_id);
        self.callbacks.all_ready();
    }

    fn fatal_error(&mut self, error: RillError) {
        if self.is_halted() {
            return;
        }

        self.status = RequestStatus::Errored;
        for task in self.tasks.drain() {
            self.end_segment(task.segment, SegmentStatus::Errored);
        }
        self.waiting.clear();
        self.pending_root_tasks = 0;
        self.all_pending_tasks = 0;

        self.fail_shell(error);
    }

    fn fail_shell(&mut self, error: RillError) {
        error!("Request {} failed before its shell was ready: {}", self.request_id, error);
        self.callbacks.shell_error(&error);
        self.outbox.clear();

        if let Some(mut destination) = self.destination.take() {
            destination.close_with_error(&error);
            self.closed = true;
        }
        self.fatal_error = Some(error);
    }
}
