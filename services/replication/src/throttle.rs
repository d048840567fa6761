//! Rate limiting and cancelling blob transfers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use harbor_core::Error;
use http_body_util::BodyExt as _;
use pin_project::pin_project;
use registry_client::Body;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A byte stream limited to a fixed rate which fails once its token is
/// cancelled.
#[pin_project]
pub struct Throttle<S> {
    #[pin]
    inner: S,
    #[pin]
    sleep: Option<Sleep>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    bytes_per_second: Option<f64>,
    start: Option<Instant>,
    sent: u64,
}

impl<S> fmt::Debug for Throttle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("bytes_per_second", &self.bytes_per_second)
            .field("sent", &self.sent)
            .finish()
    }
}

impl<S> Throttle<S> {
    /// Limit `inner` to `limit_kb` KiB/s, or not at all.
    pub fn new(inner: S, limit_kb: Option<u32>, cancel: CancellationToken) -> Self {
        Throttle {
            inner,
            sleep: None,
            cancelled: Box::pin(cancel.cancelled_owned()),
            bytes_per_second: limit_kb
                .filter(|kb| *kb > 0)
                .map(|kb| f64::from(kb) * 1024.0),
            start: None,
            sent: 0,
        }
    }
}

impl<S, E> Stream for Throttle<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(Box::new(Error::cancelled()))));
        }

        if let Some(sleep) = this.sleep.as_mut().as_pin_mut() {
            ready!(sleep.poll(cx));
            this.sleep.set(None);
        }

        let item = ready!(this.inner.poll_next(cx));
        let Some(item) = item else {
            return Poll::Ready(None);
        };
        let bytes = item.map_err(Into::into)?;

        if let Some(rate) = *this.bytes_per_second {
            let start = *this.start.get_or_insert_with(Instant::now);
            *this.sent += bytes.len() as u64;
            let due = start + Duration::from_secs_f64(*this.sent as f64 / rate);
            if due > Instant::now() {
                this.sleep.set(Some(tokio::time::sleep_until(due)));
            }
        }
        Poll::Ready(Some(Ok(bytes)))
    }
}

/// Wrap a body in a [`Throttle`].
pub fn throttle(body: Body, limit_kb: Option<u32>, cancel: CancellationToken) -> Body {
    registry_client::stream(Throttle::new(body.into_data_stream(), limit_kb, cancel))
}
