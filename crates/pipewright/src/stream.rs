use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::SampleError;

/// One settled sample as seen by a [`ResultStream`].
pub type StreamItem<M, R> = (M, Result<R, SampleError>);

/// Async view of a pipeline's results.
///
/// Backed by an unbounded channel, so the pump threads never wait on the
/// consumer. The stream ends when the pipeline stops and drops the callback
/// feeding it.
pub struct ResultStream<M, R> {
    receiver: mpsc::UnboundedReceiver<StreamItem<M, R>>,
}

impl<M, R> Stream for ResultStream<M, R> {
    type Item = StreamItem<M, R>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}

/// Returns a result callback and the stream it feeds.
///
/// Install the callback with
/// [`Pipeline::set_result_callback`](crate::Pipeline::set_result_callback) or
/// [`PipelineBuilder::on_result`](crate::PipelineBuilder::on_result).
pub fn result_channel<M, R>() -> (
    impl Fn(M, Result<R, SampleError>) + Send + Sync + 'static,
    ResultStream<M, R>,
)
where
    M: Send + 'static,
    R: Send + 'static,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    let callback = move |meta: M, result: Result<R, SampleError>| {
        // A dropped stream just means nobody is listening.
        let _ = sender.send((meta, result));
    };
    (callback, ResultStream { receiver })
}
