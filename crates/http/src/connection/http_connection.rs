use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use http::header::EXPECT;
use http::{Response, StatusCode};
use http_body::Body;
use http_body_util::{BodyExt, Empty};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::Http1Codec;
use crate::endpoint::EndPointListener;
use crate::protocol::body::{ReqBody, drain_payload};
use crate::protocol::{
    HttpError, Message, PayloadItem, PayloadSize, RequestHeader, ResponseFrame, SendError, header_contains_token,
};
use crate::server::HttpServer;
use crate::timer::ResumableTimer;
use crate::transport::BoxedStream;
use crate::upgrade::{self, UpgradeSender, Upgraded};

use super::phased_stream::{Phase, PhaseCell, PhasedStream};

/// Initial capacity of the read accumulation buffer.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Response bytes are coalesced in the write buffer up to this ceiling
/// before being flushed, so a small response leaves in one packet instead
/// of a guaranteed header/body round-trip pair.
const WRITE_HIGH_WATER: usize = 16 * 1024;

/// What to do with the connection once a request/response exchange ends.
enum Outcome {
    /// Keep-alive: reset in place and read the next request.
    Reuse,
    /// Shut the socket down and forget the connection.
    Close,
    /// Hand the raw stream to the upgraded protocol and step aside.
    Upgrade(UpgradeSender),
}

/// The protocol state machine for one accepted socket.
///
/// A connection owns its transport, its phase timer and its cancel token
/// for the whole of its life; keep-alive reuse re-enters the read loop
/// with fresh per-request state rather than constructing a new object.
/// The sequencing is strict: the next request head is not decoded until
/// the previous response has been fully written and any unread request
/// body drained.
///
/// Forced teardown (phase timeout, listener close, server stop) goes
/// through the cancel token; the serve loop observes it at its next
/// suspension point. To the peer an idle or header-wait expiry is
/// indistinguishable from a disconnect: the socket just closes.
pub struct HttpConnection {
    id: u64,
    framed: Framed<PhasedStream, Http1Codec>,
    remote_addr: SocketAddr,
    listener: Arc<EndPointListener>,
    timer: ResumableTimer,
    guard: CancellationToken,
    phase: PhaseCell,
    bound: Option<Arc<HttpServer>>,
    reuses: u32,
}

impl HttpConnection {
    pub(crate) fn new(id: u64, io: BoxedStream, remote_addr: SocketAddr, listener: Arc<EndPointListener>) -> Self {
        let guard = CancellationToken::new();
        let timer = ResumableTimer::new({
            let guard = guard.clone();
            move || guard.cancel()
        });
        let phase = PhaseCell::new();
        let stream = PhasedStream::new(io, timer.clone(), Arc::clone(listener.timeouts_arc()), phase.clone());

        Self {
            id,
            framed: Framed::with_capacity(stream, Http1Codec::new(), READ_BUFFER_SIZE),
            remote_addr,
            listener,
            timer,
            guard,
            phase,
            bound: None,
            reuses: 0,
        }
    }

    /// The cancel token that force-closes this connection.
    pub(crate) fn guard(&self) -> CancellationToken {
        self.guard.clone()
    }

    /// Times this connection was reused for another request.
    pub fn reuses(&self) -> u32 {
        self.reuses
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Runs the connection to completion: request cycles until the peer
    /// disconnects, a protocol error forces a close, a timeout fires, or
    /// an upgrade takes the stream away.
    pub(crate) async fn serve(mut self) {
        loop {
            // idle phase: one budget for the wait until the first byte of
            // the next request; the phased stream migrates it to the
            // header budget once data arrives
            self.phase.set(Phase::Idle);
            self.timer.start(self.listener.timeouts().idle_connection());

            let polled = tokio::select! {
                biased;
                _ = self.guard.cancelled() => None,
                next = self.framed.next() => Some(next),
            };
            self.timer.stop();
            self.phase.set(Phase::Inactive);

            let next = match polled {
                Some(next) => next,
                // timeout fire, listener close or server stop: to the peer
                // this is indistinguishable from a disconnect
                None => {
                    debug!(connection_id = self.id, "connection cancelled while awaiting a request");
                    self.teardown().await;
                    return;
                }
            };

            match next {
                Some(Ok(Message::Header((header, payload_size)))) => match self.dispatch(header, payload_size).await {
                    Ok(Outcome::Reuse) => {
                        self.reuses += 1;
                        debug!(connection_id = self.id, reuses = self.reuses, "connection kept alive");
                    }
                    Ok(Outcome::Close) => {
                        self.teardown().await;
                        return;
                    }
                    Ok(Outcome::Upgrade(upgrade_tx)) => {
                        self.hand_off(upgrade_tx);
                        return;
                    }
                    Err(e) => {
                        warn!(connection_id = self.id, cause = %e, "request dispatch failed");
                        self.teardown().await;
                        return;
                    }
                },

                Some(Ok(Message::Payload(_))) => {
                    error!(connection_id = self.id, "payload frame without a request in flight");
                    self.send_error_response(StatusCode::BAD_REQUEST).await;
                    self.teardown().await;
                    return;
                }

                Some(Err(e)) => {
                    // best-effort error answer, then close; parse failures
                    // never propagate past the connection
                    debug!(connection_id = self.id, cause = %e, "request parse failed");
                    self.send_error_response(StatusCode::BAD_REQUEST).await;
                    self.teardown().await;
                    return;
                }

                None => {
                    debug!(connection_id = self.id, "peer closed the connection");
                    self.teardown().await;
                    return;
                }
            }
        }
    }

    async fn dispatch(&mut self, mut header: RequestHeader, _payload_size: PayloadSize) -> Result<Outcome, HttpError> {
        // route before anything else; an unroutable request gets a 400 and
        // the connection is not trusted for another request
        let Some((server, prefix)) = self.listener.bind_request(&header) else {
            info!(connection_id = self.id, uri = %header.uri(), "no registered prefix matches the request");
            self.send_error_response(StatusCode::BAD_REQUEST).await;
            return Ok(Outcome::Close);
        };
        debug!(connection_id = self.id, prefix = %prefix, "request bound");

        self.listener.promote(self.id);
        // a reused connection may route to a different server this time
        if let Some(previous) = self.bound.take() {
            if !Arc::ptr_eq(&previous, &server) {
                previous.remove_connection(self.id);
            }
        }
        server.track_connection(self.id, self.guard.clone());
        self.bound = Some(Arc::clone(&server));

        let entity_budget = server.timeouts().entity_body();
        let drain_budget = server.timeouts().drain_entity_body();

        // interim answer for Expect: 100-continue, before the body starts
        if let Some(value) = header.headers().get(EXPECT) {
            let slice = value.as_bytes();
            if slice.len() >= 4 && &slice[0..4] == b"100-" {
                let writer = self.framed.get_mut();
                writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(SendError::io)?;
                writer.flush().await.map_err(SendError::io)?;
                debug!(connection_id = self.id, "sent interim continue response");
            }
        }

        let request_keep_alive = header.is_keep_alive();
        let upgrade_tx = if header.is_upgrade() {
            let (tx, on_upgrade) = upgrade::pair();
            header.extensions_mut().insert(on_upgrade);
            Some(tx)
        } else {
            None
        };

        let handler = server.handler();
        let guard = self.guard.clone();
        let connection_id = self.id;

        let (req_body, mut body_sender) = ReqBody::body_channel(&mut self.framed, entity_budget);
        let request = header.body(req_body);

        // The handler and the body producer run concurrently on this task:
        // the handler may block on body chunks the producer has not read
        // yet, so driving only one of them can deadlock.
        let mut body_failed = false;
        let response_result = {
            tokio::pin! {
                let handler_future = handler.call(request);
                let sender_future = body_sender.send_body();
            }
            let mut sender_done = false;

            loop {
                tokio::select! {
                    biased;
                    _ = guard.cancelled() => {
                        debug!(connection_id, "connection cancelled during dispatch");
                        return Ok(Outcome::Close);
                    }
                    response = &mut handler_future => break response,
                    result = &mut sender_future, if !sender_done => {
                        sender_done = true;
                        if let Err(e) = result {
                            // the handler sees this as a body read failure
                            warn!(connection_id, cause = %e, "request body stream failed");
                            body_failed = true;
                        }
                    }
                }
            }
        };

        let body_eof = body_sender.is_eof();
        drop(body_sender);

        let response = match response_result {
            Ok(response) => response,
            Err(e) => {
                error!(connection_id = self.id, cause = %e, "handler failed");
                self.send_error_response(StatusCode::INTERNAL_SERVER_ERROR).await;
                return Ok(Outcome::Close);
            }
        };

        let resp_close = header_contains_token(response.headers(), http::header::CONNECTION, "close");

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(upgrade_tx) = upgrade_tx {
                self.send_upgrade_head(response, drain_budget).await?;
                return Ok(Outcome::Upgrade(upgrade_tx));
            }
            warn!(connection_id = self.id, "101 response without an upgradable request");
            let _ = self.do_send_response(response, drain_budget).await;
            return Ok(Outcome::Close);
        }

        if let Err(e) = self.do_send_response(response, drain_budget).await {
            // possibly half-streamed: never retried, never reused
            warn!(connection_id = self.id, cause = %e, "response send failed");
            return Ok(Outcome::Close);
        }

        if !request_keep_alive || resp_close || body_failed {
            return Ok(Outcome::Close);
        }

        // the peer may not have finished sending a body the handler never
        // read; it has to be off the wire before the next head is parsed
        if !drain_payload(&mut self.framed, body_eof, drain_budget).await {
            debug!(connection_id = self.id, "request body could not be drained; closing");
            return Ok(Outcome::Close);
        }

        Ok(Outcome::Reuse)
    }

    /// Writes a response, deriving the payload framing from the body's
    /// size hint: exact size → Content-Length, unknown → chunked.
    async fn do_send_response<T>(&mut self, response: Response<T>, budget: Duration) -> Result<(), HttpError>
    where
        T: Body<Data = Bytes> + Unpin,
        T::Error: fmt::Display,
    {
        let (parts, mut body) = response.into_parts();

        let payload_size = {
            let size_hint = body.size_hint();
            match size_hint.exact() {
                Some(0) => PayloadSize::Empty,
                Some(length) => PayloadSize::Length(length),
                None => PayloadSize::Chunked,
            }
        };

        let head: ResponseFrame = Message::Header((Response::from_parts(parts, ()), payload_size));
        self.feed_frame(head, budget).await?;

        if payload_size.is_empty() {
            self.flush_frames(budget).await?;
            return Ok(());
        }

        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    let payload_item = frame
                        .into_data()
                        .map(PayloadItem::Chunk)
                        .map_err(|_| SendError::invalid_body("response trailers are not supported"))?;

                    self.feed_frame(Message::Payload(payload_item), budget).await?;
                    if self.framed.write_buffer().len() >= WRITE_HIGH_WATER {
                        self.flush_frames(budget).await?;
                    }
                }
                Some(Err(e)) => return Err(SendError::invalid_body(format!("response body failed: {e}")).into()),
                None => {
                    self.feed_frame(Message::Payload(PayloadItem::Eof), budget).await?;
                    self.flush_frames(budget).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Writes the 101 head; the body of an upgrade response is ignored,
    /// the sub-protocol owns every byte after the head.
    async fn send_upgrade_head<T>(&mut self, response: Response<T>, budget: Duration) -> Result<(), HttpError> {
        let (parts, _body) = response.into_parts();
        let head: ResponseFrame = Message::Header((Response::from_parts(parts, ()), PayloadSize::Empty));
        self.feed_frame(head, budget).await?;
        self.flush_frames(budget).await?;
        Ok(())
    }

    /// Best-effort error answer; failures only get logged, the connection
    /// is on its way out regardless.
    async fn send_error_response(&mut self, status: StatusCode) {
        let budget = self.listener.timeouts().drain_entity_body();
        let response = build_error_response(status);
        if let Err(e) = self.do_send_response(response, budget).await {
            debug!(connection_id = self.id, cause = %e, "error response could not be sent");
        }
    }

    async fn feed_frame(&mut self, frame: ResponseFrame, budget: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(budget, self.framed.feed(frame)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::timed_out("response write timed out")),
        }
    }

    async fn flush_frames(&mut self, budget: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(budget, self.framed.flush()).await {
            Ok(result) => result,
            Err(_) => Err(SendError::timed_out("response write timed out")),
        }
    }

    /// Surrenders the raw stream (plus read-ahead) to the upgrade handle.
    /// From here on the connection never touches the stream again, even
    /// during forced shutdown; the upgraded protocol owns its lifecycle.
    fn hand_off(mut self, upgrade_tx: UpgradeSender) {
        self.timer.stop();
        self.unbind();

        let parts = self.framed.into_parts();
        let upgraded = Upgraded::new(parts.io.into_inner(), parts.read_buf.freeze());

        if upgrade_tx.send(upgraded).is_err() {
            // no one kept the handle; dropping the stream closes the socket
            warn!(connection_id = self.id, "upgrade handle was dropped, closing connection");
            return;
        }
        info!(connection_id = self.id, "connection upgraded, http framing stopped");
    }

    async fn teardown(&mut self) {
        self.timer.stop();
        self.unbind();
        if let Err(e) = self.framed.get_mut().shutdown().await {
            debug!(connection_id = self.id, cause = %e, "socket shutdown failed");
        }
        info!(connection_id = self.id, remote_addr = %self.remote_addr, reuses = self.reuses, "connection closed");
    }

    fn unbind(&mut self) {
        self.listener.forget(self.id);
        if let Some(server) = self.bound.take() {
            server.remove_connection(self.id);
        }
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("reuses", &self.reuses)
            .finish()
    }
}

fn build_error_response(status_code: StatusCode) -> Response<Empty<Bytes>> {
    Response::builder().status(status_code).body(Empty::new()).unwrap()
}
