use std::pin::Pin;
use std::task::{Context, Poll};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use super::event::{Completion, SequenceEvent, Token};

/// # SequenceStream
///
/// The caller-facing end of a sequence: an asynchronous stream over a Tokio
/// unbounded channel receiver.
///
/// `SequenceStream` implements the `Stream` trait from the `futures` crate,
/// so it can be consumed with `while let Some(event) = stream.next().await`
/// or any stream combinator.
///
/// ## Implementation Details
///
/// The sending half lives with the scheduler. Because the channel is
/// unbounded, emitting a token never blocks the control loop or the batch
/// processor, regardless of how slowly the consumer reads. The stream ends
/// once the terminal [`SequenceEvent::Finished`] has been delivered and the
/// scheduler has dropped its sender.
pub struct SequenceStream {
    /// The underlying channel receiver
    receiver: mpsc::UnboundedReceiver<SequenceEvent>
}

impl SequenceStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<SequenceEvent>) -> Self {
        Self {
            receiver,
        }
    }

    /// Consume the stream to its end, returning every token and the completion.
    ///
    /// The completion is `None` only if the scheduler went away without
    /// reporting a terminal state.
    pub async fn collect_all(mut self) -> (Vec<Token>, Option<Completion>) {
        let mut tokens = vec![];
        let mut completion = None;
        while let Some(event) = self.next().await {
            match event {
                SequenceEvent::Token(token) => tokens.push(token),
                SequenceEvent::Finished(done) => {
                    completion = Some(done);
                    break;
                }
            }
        }
        (tokens, completion)
    }
}

impl Stream for SequenceStream {
    type Item = SequenceEvent;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}
