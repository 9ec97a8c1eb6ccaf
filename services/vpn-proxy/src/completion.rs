//! Response body that releases its slot ticket when streaming ends.
//!
//! The ticket is dropped as soon as the upstream body reports its end or an
//! error. If the client goes away first, axum drops the body and the ticket
//! goes with it.

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use egress_pool::Ticket;
use futures_util::Stream;
use pin_project_lite::pin_project;
use tracing::debug;

pin_project! {
    pub struct TicketStream<S> {
        #[pin]
        inner: S,
        ticket: Option<Ticket>,
        started: Instant,
    }
}

impl<S> TicketStream<S> {
    pub fn new(inner: S, ticket: Ticket) -> Self {
        Self {
            inner,
            ticket: Some(ticket),
            started: Instant::now(),
        }
    }
}

impl<S, T, E> Stream for TicketStream<S>
where
    S: Stream<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.inner.poll_next(cx));
        if matches!(item, None | Some(Err(_))) {
            if let Some(ticket) = this.ticket.take() {
                debug!(
                    slot = ticket.key(),
                    elapsed_ms = this.started.elapsed().as_millis() as u64,
                    "response body finished"
                );
            }
        }
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
