use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;

use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, Stream, StreamExt};

use http_body::{Body, Frame};
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::{Message, ParseError, PayloadItem, RequestFrame};

/// The request body handed to a handler.
///
/// `ReqBody` is the consumer half of a per-request channel pair. It
/// implements `http_body::Body`, requesting chunks from the connection-side
/// [`ReqBodySender`] one at a time, so the payload is never buffered whole.
/// The producer half keeps reading from the connection's frame stream and
/// enforces the entity-body read budget; a read that exceeds it reaches the
/// handler as an I/O error on this body, not as a separate signal.
pub struct ReqBody {
    signal: mpsc::Sender<oneshot::Sender<PayloadItem>>,
    receiving: Option<oneshot::Receiver<PayloadItem>>,
}

impl ReqBody {
    fn new(signal: mpsc::Sender<oneshot::Sender<PayloadItem>>) -> Self {
        Self { signal, receiving: None }
    }

    /// Creates the consumer/producer pair for one request's body.
    ///
    /// The consumer goes into the `Request` given to the handler; the
    /// producer is driven by the connection concurrently with the handler
    /// so neither side deadlocks waiting for the other.
    pub fn body_channel<S>(payload_stream: &mut S, read_budget: Duration) -> (ReqBody, ReqBodySender<'_, S>)
    where
        S: Stream + Unpin,
    {
        let (tx, receiver) = mpsc::channel(16);

        let req_body = ReqBody::new(tx);
        let body_sender = ReqBodySender { payload_stream, receiver, eof: false, read_budget };

        (req_body, body_sender)
    }
}

impl std::fmt::Debug for ReqBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqBody").finish()
    }
}

/// Connection-side producer that feeds body chunks to a [`ReqBody`].
pub struct ReqBodySender<'conn, S>
where
    S: Stream + Unpin,
{
    payload_stream: &'conn mut S,
    receiver: mpsc::Receiver<oneshot::Sender<PayloadItem>>,
    eof: bool,
    read_budget: Duration,
}

impl<S: Stream + Unpin> std::fmt::Debug for ReqBodySender<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqBodySender").field("eof", &self.eof).finish()
    }
}

impl<S> ReqBodySender<'_, S>
where
    S: Stream<Item = Result<RequestFrame, ParseError>> + Unpin,
{
    /// Serves chunk requests from the handler until the payload reaches
    /// EOF or the handler drops its body.
    ///
    /// Each network read is bounded by the entity-body budget; exceeding it
    /// aborts the stream with a timed-out I/O error, which the waiting
    /// reader observes as a body failure.
    pub async fn send_body(&mut self) -> Result<(), ParseError> {
        loop {
            if self.eof {
                return Ok(());
            }

            match self.receiver.next().await {
                Some(sender) => {
                    let next = tokio::time::timeout(self.read_budget, self.payload_stream.next())
                        .await
                        .map_err(|_| ParseError::timed_out("entity body read timed out"))?;

                    match next {
                        Some(Ok(Message::Payload(payload_item))) => {
                            if payload_item.is_eof() {
                                self.eof = true;
                            }
                            // a dropped reader is fine; leftovers are drained later
                            let _ = sender.send(payload_item);
                        }

                        Some(Ok(Message::Header(_))) => {
                            return Err(ParseError::invalid_body("received a header inside a request body"));
                        }

                        Some(Err(e)) => return Err(e),

                        None => {
                            return Err(ParseError::invalid_body("connection closed inside a request body"));
                        }
                    }
                }

                // handler dropped its body without reading it all
                None => return Ok(()),
            }
        }
    }

    /// Whether the payload has been fully consumed.
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

/// Reads and discards whatever is left of the current request's payload,
/// within `budget`. Returns `true` when the payload reached EOF, meaning
/// the connection is positioned at the next request and safe to reuse.
pub(crate) async fn drain_payload<S>(stream: &mut S, already_eof: bool, budget: Duration) -> bool
where
    S: Stream<Item = Result<RequestFrame, ParseError>> + Unpin,
{
    if already_eof {
        return true;
    }

    let deadline = Instant::now() + budget;
    let mut skipped: usize = 0;

    loop {
        let next = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                debug!(skipped, "drain budget exhausted with request body unread");
                return false;
            }
        };

        match next {
            Some(Ok(Message::Payload(payload_item))) => {
                if payload_item.is_eof() {
                    if skipped > 0 {
                        debug!(skipped, "discarded unread request body");
                    }
                    return true;
                }
                if let Some(bytes) = payload_item.as_bytes() {
                    skipped += bytes.len();
                }
            }
            // a header mid-payload, a parse error or a peer close all leave
            // the connection unusable for another request
            _ => return false,
        }
    }
}

impl Body for ReqBody {
    type Data = Bytes;
    type Error = ParseError;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        loop {
            if let Some(oneshot_receiver) = &mut self.receiving {
                return match ready!(oneshot_receiver.poll_unpin(cx)) {
                    Ok(PayloadItem::Chunk(bytes)) => {
                        self.receiving.take();
                        Poll::Ready(Some(Ok(Frame::data(bytes))))
                    }
                    Ok(PayloadItem::Eof) => {
                        self.receiving.take();
                        Poll::Ready(None)
                    }
                    Err(_) => {
                        self.receiving.take();
                        Poll::Ready(Some(Err(ParseError::invalid_body("request body interrupted"))))
                    }
                };
            }

            match ready!(self.signal.poll_ready(cx)) {
                Ok(()) => {
                    let (tx, rx) = oneshot::channel();
                    match self.signal.start_send(tx) {
                        Ok(()) => {
                            self.receiving = Some(rx);
                            continue;
                        }
                        Err(e) => return Poll::Ready(Some(Err(ParseError::invalid_body(e)))),
                    }
                }
                Err(e) => return Poll::Ready(Some(Err(ParseError::invalid_body(e)))),
            }
        }
    }
}
