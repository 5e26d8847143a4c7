//! Completion signals of one submitted request.

use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use http::Uri;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ConnectError, SendRequestError},
    response::ClientResponse,
};

type AvailableResult = Result<ClientResponse, SendRequestError>;
type DoneResult = Result<(), SendRequestError>;

/// Connector side of an exchange.
///
/// Each signal is completed at most once; whatever completes it first wins.
pub(crate) struct Exchange {
    pub(crate) visited: HashSet<Uri>,
    pub(crate) cancel: CancellationToken,
    available_tx: Option<oneshot::Sender<AvailableResult>>,
    done_tx: Option<oneshot::Sender<DoneResult>>,
}

impl Exchange {
    pub(crate) fn new() -> (Exchange, ExchangeHandle) {
        let (available_tx, available_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let exchange = Exchange {
            visited: HashSet::new(),
            cancel: cancel.clone(),
            available_tx: Some(available_tx),
            done_tx: Some(done_tx),
        };

        let handle = ExchangeHandle {
            available: ResponseAvailable {
                rx: Some(available_rx),
            },
            done: ResponseDone { rx: Some(done_rx) },
            canceller: Canceller { token: cancel },
        };

        (exchange, handle)
    }

    pub(crate) fn complete_available(&mut self, res: ClientResponse) {
        if let Some(tx) = self.available_tx.take() {
            let _ = tx.send(Ok(res));
        }
    }

    pub(crate) fn complete_done(&mut self, res: DoneResult) {
        if let Some(tx) = self.done_tx.take() {
            let _ = tx.send(res);
        }
    }

    /// Reports a failure once.
    ///
    /// Before the response is available the cause goes to response-available and
    /// response-done resolves with [`SendRequestError::Aborted`].
    pub(crate) fn fail(&mut self, err: SendRequestError) {
        match self.available_tx.take() {
            Some(tx) => {
                log::debug!("exchange failed before response: {err}");
                let _ = tx.send(Err(err));
                self.complete_done(Err(SendRequestError::Aborted));
            }
            None => self.complete_done(Err(err)),
        }
    }
}

/// Caller side of a submitted request.
///
/// ```no_run
/// # async fn run(connector: courier::Connector) -> Result<(), Box<dyn std::error::Error>> {
/// let mut exchange = connector.submit(courier::ClientRequest::get("http://localhost/"));
///
/// let mut res = exchange.available().await?;
/// let body = res.bytes().await?;
/// exchange.done().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ExchangeHandle {
    available: ResponseAvailable,
    done: ResponseDone,
    canceller: Canceller,
}

impl ExchangeHandle {
    /// Resolves once the status line and headers of the final response are known.
    pub fn available(&mut self) -> &mut ResponseAvailable {
        &mut self.available
    }

    /// Resolves once the response body has been fully received or the exchange failed.
    pub fn done(&mut self) -> &mut ResponseDone {
        &mut self.done
    }

    /// Cancels the exchange. Pending signals resolve with [`SendRequestError::Canceled`].
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn into_parts(self) -> (ResponseAvailable, ResponseDone, Canceller) {
        (self.available, self.done, self.canceller)
    }
}

/// Future of the response head; the body streams through the returned response.
#[derive(Debug)]
pub struct ResponseAvailable {
    rx: Option<oneshot::Receiver<AvailableResult>>,
}

impl ResponseAvailable {
    /// Blocks the current thread until the response is available.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(mut self) -> AvailableResult {
        match self.rx.take() {
            Some(rx) => rx.blocking_recv().unwrap_or_else(|_| Err(disconnected())),
            None => Err(disconnected()),
        }
    }
}

impl Future for ResponseAvailable {
    type Output = AvailableResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_signal(&mut self.get_mut().rx, cx)
    }
}

/// Future of the exchange's terminal state.
#[derive(Debug)]
pub struct ResponseDone {
    rx: Option<oneshot::Receiver<DoneResult>>,
}

impl ResponseDone {
    /// Blocks the current thread until the exchange has finished.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(mut self) -> DoneResult {
        match self.rx.take() {
            Some(rx) => rx.blocking_recv().unwrap_or_else(|_| Err(disconnected())),
            None => Err(disconnected()),
        }
    }
}

impl Future for ResponseDone {
    type Output = DoneResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_signal(&mut self.get_mut().rx, cx)
    }
}

fn poll_signal<T>(
    rx: &mut Option<oneshot::Receiver<Result<T, SendRequestError>>>,
    cx: &mut Context<'_>,
) -> Poll<Result<T, SendRequestError>> {
    let res = match rx.as_mut() {
        Some(rx) => match Pin::new(rx).poll(cx) {
            Poll::Ready(res) => res.unwrap_or_else(|_| Err(disconnected())),
            Poll::Pending => return Poll::Pending,
        },
        // already resolved
        None => Err(disconnected()),
    };

    *rx = None;
    Poll::Ready(res)
}

fn disconnected() -> SendRequestError {
    SendRequestError::Connect(ConnectError::Disconnected)
}

/// Cancels an exchange from anywhere.
#[derive(Debug, Clone)]
pub struct Canceller {
    token: CancellationToken,
}

impl Canceller {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, StatusCode, Version};
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::response::{ResponseBody, ResponseHead};

    assert_impl_all!(ExchangeHandle: Send, Sync, Unpin);
    assert_impl_all!(Canceller: Send, Sync, Clone);

    fn response() -> ClientResponse {
        ClientResponse::new(
            ResponseHead::new(Version::HTTP_11, StatusCode::OK, HeaderMap::new()),
            ResponseBody::empty(),
            Uri::from_static("http://localhost/"),
        )
    }

    #[actix_rt::test]
    async fn failure_before_response_is_reported_once() {
        let (mut exchange, mut handle) = Exchange::new();
        exchange.fail(SendRequestError::Closed);

        assert!(matches!(handle.available().await, Err(SendRequestError::Closed)));
        assert!(matches!(handle.done().await, Err(SendRequestError::Aborted)));
    }

    #[actix_rt::test]
    async fn failure_after_response_goes_to_done() {
        let (mut exchange, mut handle) = Exchange::new();
        exchange.complete_available(response());
        exchange.fail(SendRequestError::Canceled);

        assert_eq!(handle.available().await.unwrap().status(), StatusCode::OK);
        assert!(matches!(handle.done().await, Err(SendRequestError::Canceled)));
    }

    #[actix_rt::test]
    async fn first_completion_wins() {
        let (mut exchange, handle) = Exchange::new();
        exchange.complete_done(Ok(()));
        exchange.fail(SendRequestError::Closed);

        let (available, done, _) = handle.into_parts();
        assert!(done.await.is_ok());
        assert!(matches!(available.await, Err(SendRequestError::Closed)));
    }

    #[actix_rt::test]
    async fn dropped_exchange_disconnects() {
        let (exchange, mut handle) = Exchange::new();
        drop(exchange);

        assert!(matches!(
            handle.available().await,
            Err(SendRequestError::Connect(ConnectError::Disconnected))
        ));
        // polling a resolved signal again does not panic
        assert!(handle.available().await.is_err());
    }

    #[actix_rt::test]
    async fn cancel_is_shared() {
        let (exchange, handle) = Exchange::new();
        let canceller = handle.canceller();
        assert!(!exchange.cancel.is_cancelled());

        canceller.cancel();
        assert!(exchange.cancel.is_cancelled());
        assert!(handle.canceller().is_cancelled());
    }

    #[test]
    fn blocking_wait() {
        let (mut exchange, handle) = Exchange::new();
        let (available, done, _) = handle.into_parts();

        let waiter = std::thread::spawn(move || available.wait().map(|res| res.status()));
        exchange.complete_available(response());
        exchange.complete_done(Ok(()));

        assert_eq!(waiter.join().unwrap().unwrap(), StatusCode::OK);
        assert!(done.wait().is_ok());
    }
}
