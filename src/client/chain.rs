//! Per-exchange handler chain: read timeout, continuation and response assembly.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use actix_rt::time::{sleep_until, Instant, Sleep};
use actix_utils::future::poll_fn;
use bytes::Bytes;
use http::{StatusCode, Version};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::error::{PayloadError, ProtocolError, SendRequestError, TimeoutKind};
use crate::{
    continuation::{ContinuationHandler, ContinuationOutcome, ContinuationState, Verdict},
    response::{BodySender, ResponseBody, ResponseHead},
};

/// Transport event delivered to the chain.
#[derive(Debug)]
pub(crate) enum Event {
    StatusLine(Version, StatusCode),
    Head(ResponseHead),
    Chunk(Bytes),
    Terminal,
    Closed,
    TimedOut(TimeoutKind),
    Cancelled,
}

/// What the connection driver should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Continue,
    Finished,
    Close,
}

/// Time of the last inbound byte, shared with the I/O wrapper.
#[derive(Debug, Clone)]
pub(crate) struct Activity {
    base: Instant,
    last: Arc<AtomicU64>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Activity {
            base: Instant::now(),
            last: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn touch(&self) {
        let nanos = self.base.elapsed().as_nanos() as u64;
        self.last.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn last(&self) -> Instant {
        self.base + Duration::from_nanos(self.last.load(Ordering::Relaxed))
    }
}

/// Inactivity window plus an optional absolute deadline.
pub(crate) struct ReadTimeout {
    window: Option<Duration>,
    deadline: Option<Instant>,
    activity: Activity,
    sleep: Pin<Box<Sleep>>,
}

impl ReadTimeout {
    pub(crate) fn new(
        window: Option<Duration>,
        deadline: Option<Instant>,
        activity: Activity,
    ) -> Option<Self> {
        if window.is_none() && deadline.is_none() {
            return None;
        }

        let sleep = Box::pin(sleep_until(Instant::now()));
        Some(ReadTimeout {
            window,
            deadline,
            activity,
            sleep,
        })
    }

    pub(crate) fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<TimeoutKind> {
        loop {
            let now = Instant::now();

            let mut wake = None;

            if let Some(deadline) = self.deadline {
                if now >= deadline {
                    return Poll::Ready(TimeoutKind::Total);
                }
                wake = Some(deadline);
            }

            if let Some(window) = self.window {
                let idle_deadline = self.activity.last() + window;
                if now >= idle_deadline {
                    return Poll::Ready(TimeoutKind::Read);
                }
                wake = Some(wake.map_or(idle_deadline, |wake: Instant| wake.min(idle_deadline)));
            }

            let wake = match wake {
                Some(wake) => wake,
                None => return Poll::Pending,
            };

            if self.sleep.deadline() != wake {
                self.sleep.as_mut().reset(wake);
            }

            match self.sleep.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                // activity may have moved the idle deadline; re-evaluate
                Poll::Ready(()) => continue,
            }
        }
    }
}

/// Response head and body handed to the exchange once the header section is known.
pub(crate) struct AssembledResponse {
    pub(crate) head: ResponseHead,
    pub(crate) body: ResponseBody,
    pub(crate) continuation: ContinuationState,
}

pub(crate) type HeadSender = oneshot::Sender<Result<AssembledResponse, SendRequestError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblyState {
    AwaitingStatusLine,
    AwaitingHeaders,
    StreamingBody,
    Complete,
    Aborted,
}

impl AssemblyState {
    fn describe(self) -> &'static str {
        match self {
            AssemblyState::AwaitingStatusLine => "awaiting status line",
            AssemblyState::AwaitingHeaders => "awaiting headers",
            AssemblyState::StreamingBody => "streaming body",
            AssemblyState::Complete => "complete",
            AssemblyState::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum AbortCause {
    Timeout(TimeoutKind),
    Cancelled,
}

/// Turns transport events into a response and its body stream.
pub(crate) struct ResponseAssembler {
    state: AssemblyState,
    cause: Option<AbortCause>,
    head_tx: Option<HeadSender>,
    body_tx: Option<BodySender>,
    continuation: ContinuationState,
}

impl ResponseAssembler {
    pub(crate) fn new(head_tx: HeadSender) -> Self {
        ResponseAssembler {
            state: AssemblyState::AwaitingStatusLine,
            cause: None,
            head_tx: Some(head_tx),
            body_tx: None,
            continuation: ContinuationState::default(),
        }
    }

    fn out_of_order(&self, event: &'static str) -> SendRequestError {
        ProtocolError::OutOfOrder(event, self.state.describe()).into()
    }

    fn on_event(&mut self, event: Event) -> Result<Dispatch, SendRequestError> {
        match event {
            Event::StatusLine(..) => match self.state {
                AssemblyState::AwaitingStatusLine => {
                    self.state = AssemblyState::AwaitingHeaders;
                    Ok(Dispatch::Continue)
                }
                _ => Err(self.out_of_order("status line")),
            },

            Event::Head(head) => {
                if self.state != AssemblyState::AwaitingHeaders {
                    return Err(self.out_of_order("header section"));
                }

                if head.status().is_informational() {
                    log::trace!("skipping interim response {}", head.status());
                    self.state = AssemblyState::AwaitingStatusLine;
                    return Ok(Dispatch::Continue);
                }

                let (body_tx, body) = ResponseBody::channel();
                self.body_tx = Some(body_tx);
                self.state = AssemblyState::StreamingBody;

                if let Some(tx) = self.head_tx.take() {
                    let _ = tx.send(Ok(AssembledResponse {
                        head,
                        body,
                        continuation: self.continuation,
                    }));
                }
                Ok(Dispatch::Continue)
            }

            Event::Chunk(chunk) => match self.state {
                AssemblyState::StreamingBody => {
                    if let Some(tx) = &self.body_tx {
                        // a dropped body is drained so the connection stays usable
                        let _ = tx.send(Ok(chunk));
                    }
                    Ok(Dispatch::Continue)
                }
                _ => Err(self.out_of_order("body chunk")),
            },

            Event::Terminal => match self.state {
                AssemblyState::StreamingBody => {
                    self.state = AssemblyState::Complete;
                    self.body_tx = None;
                    Ok(Dispatch::Finished)
                }
                _ => Err(self.out_of_order("end of message")),
            },

            Event::TimedOut(kind) => {
                self.abort(AbortCause::Timeout(kind));
                Ok(Dispatch::Close)
            }

            Event::Cancelled => {
                self.abort(AbortCause::Cancelled);
                Ok(Dispatch::Close)
            }

            Event::Closed => match self.state {
                AssemblyState::Complete => Ok(Dispatch::Finished),
                _ => {
                    self.state = AssemblyState::Aborted;
                    Ok(Dispatch::Close)
                }
            },
        }
    }

    fn abort(&mut self, cause: AbortCause) {
        if self.state != AssemblyState::Complete {
            self.state = AssemblyState::Aborted;
            self.cause.get_or_insert(cause);
        }
    }

    /// Error for a connection that closed before the terminal marker.
    fn closed_error(&self) -> SendRequestError {
        match self.cause {
            Some(AbortCause::Timeout(kind)) => SendRequestError::Timeout(kind),
            Some(AbortCause::Cancelled) => SendRequestError::Canceled,
            None => SendRequestError::Closed,
        }
    }

    fn fail(&mut self, err: SendRequestError) -> Option<SendRequestError> {
        if self.state != AssemblyState::Complete {
            self.state = AssemblyState::Aborted;
        }

        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send(Err(err));
            return None;
        }

        if let Some(tx) = self.body_tx.take() {
            let _ = tx.send(Err(PayloadError::from(&err)));
        }
        Some(err)
    }
}

/// Ordered handlers attached to a connection for one exchange.
pub(crate) struct HandlerChain {
    read_timeout: Option<ReadTimeout>,
    continuation: Option<ContinuationHandler>,
    skip_head: bool,
    assembler: ResponseAssembler,
    activity: Activity,
}

impl HandlerChain {
    pub(crate) fn new(
        head_tx: HeadSender,
        read_window: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Self {
        let activity = Activity::new();
        HandlerChain {
            read_timeout: ReadTimeout::new(read_window, deadline, activity.clone()),
            continuation: None,
            skip_head: false,
            assembler: ResponseAssembler::new(head_tx),
            activity,
        }
    }

    pub(crate) fn activity(&self) -> &Activity {
        &self.activity
    }

    pub(crate) fn dispatch(&mut self, event: Event) -> Result<Dispatch, SendRequestError> {
        if let Event::TimedOut(kind) = event {
            log::debug!("{kind} timeout fired");
            self.detach_timeout();
        }

        if let Some(continuation) = self.continuation.as_mut() {
            match event {
                Event::StatusLine(_, status) => {
                    if continuation.on_status(status)? == Verdict::Consume {
                        self.skip_head = true;
                        return Ok(Dispatch::Continue);
                    }
                }
                Event::Head(_) if self.skip_head => {
                    self.skip_head = false;
                    return Ok(Dispatch::Continue);
                }
                Event::Head(_) => self.assembler.continuation = continuation.state(),
                _ => {}
            }
        }

        self.assembler.on_event(event)
    }

    pub(crate) fn attach_continuation(&mut self) {
        self.continuation = Some(ContinuationHandler::new());
    }

    pub(crate) fn continuation_outcome(&self) -> Option<ContinuationOutcome> {
        self.continuation.as_ref().and_then(ContinuationHandler::outcome)
    }

    pub(crate) fn continuation_timed_out(&mut self) {
        if let Some(continuation) = self.continuation.as_mut() {
            continuation.on_timeout();
        }
    }

    pub(crate) fn poll_timeout(&mut self, cx: &mut Context<'_>) -> Poll<TimeoutKind> {
        match self.read_timeout.as_mut() {
            Some(timeout) => timeout.poll_expired(cx),
            None => Poll::Pending,
        }
    }

    /// Resolves when the read or total timeout fires.
    pub(crate) async fn expired(&mut self) -> TimeoutKind {
        poll_fn(|cx| self.poll_timeout(cx)).await
    }

    pub(crate) fn detach_timeout(&mut self) {
        self.read_timeout = None;
    }

    /// Connection closed; returns the error matching whatever ended the exchange.
    pub(crate) fn closed(&mut self) -> SendRequestError {
        let _ = self.assembler.on_event(Event::Closed);
        self.assembler.closed_error()
    }

    /// Delivers a failure once: to the head if it is still pending, otherwise into the body.
    ///
    /// Returns the error when it still has to be reported on response-done.
    pub(crate) fn fail(&mut self, err: SendRequestError) -> Option<SendRequestError> {
        self.detach_timeout();
        self.assembler.fail(err)
    }
}

/// Runs `fut` unless the exchange is canceled or the total deadline passes first.
pub(crate) async fn guarded<F, T>(
    fut: F,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<T, SendRequestError>
where
    F: Future<Output = Result<T, SendRequestError>>,
{
    let deadline = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SendRequestError::Canceled),
        _ = deadline => Err(SendRequestError::Timeout(TimeoutKind::Total)),
        res = fut => res,
    }
}
