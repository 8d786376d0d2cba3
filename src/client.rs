// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use crate::consts::{OBSERVE_DEREGISTER, OBSERVE_REGISTER};
use crate::event::{ExchangeEvent, HandleEvent};
use crate::message::{Message, MsgId, MsgToken};
use crate::reliability::{Disposition, EventSink, ReliabilityEngine};
use crate::scheduler::Scheduler;
use crate::token_pool::TokenPool;
use crate::transport::MessageTransport;
use crate::{StandardCoapConstants, TransParams};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// The capability set through which an exchange reports back to its
/// originator.
///
/// Every method is invoked on a scheduler thread. [`on_response`] is the only
/// required method; the rest default to no-ops so simple callers implement
/// exactly what they care about.
///
/// Once a terminal event has been delivered (`on_response` for a final
/// response, `on_reset`, `on_timeout`, or `on_misc_error`), no further
/// methods are invoked for that exchange.
///
/// [`on_response`]: ResponseHandler::on_response
pub trait ResponseHandler: Send + Sync {
    /// A response for this exchange arrived. For observations this is called
    /// once per delivered notification.
    fn on_response(&self, response: &Message);

    /// The remote acknowledged the request without a response; the response
    /// will arrive separately under the same token.
    fn on_empty_ack(&self) {}

    /// The remote reset the exchange. Terminal. For a CoAP ping this is the
    /// expected "pong".
    fn on_reset(&self) {}

    /// The request exhausted its retransmissions unacknowledged. Terminal.
    fn on_timeout(&self) {}

    /// One retransmission of the request went out on the wire.
    fn on_retransmission(&self) {}

    /// A message id was assigned to the outbound request.
    fn on_message_id_assigned(&self, _msg_id: MsgId) {}

    /// The exchange failed for a reason described by `description`. Terminal.
    fn on_misc_error(&self, _description: &str) {}

    /// One block of a larger response arrived; more will follow under the
    /// same token.
    fn on_partial_content(&self, _response: &Message) {}

    /// The remote endpoint of this exchange moved to a new socket address.
    fn on_remote_socket_changed(&self, _current: SocketAddr, _previous: SocketAddr) {}

    /// Asked on each inbound update notification. Returning false signals
    /// that the originator is no longer interested, which triggers a lazy
    /// observation termination upstream.
    fn continue_observation(&self) -> bool {
        true
    }
}

/// Client-side CoAP message-exchange endpoint.
///
/// Owns the four cooperating pieces of the exchange layer: the per-remote
/// message-id pool, the token pool, the outbound reliability engine, and the
/// callback table mapping `(remote, token)` to the [`ResponseHandler`] that
/// issued the request.
///
/// The endpoint never reports exchange failures through return values; every
/// outcome, success or failure, reaches the originating handler as one of
/// its callback methods.
pub struct ClientEndpoint<T, TP = StandardCoapConstants>
where
    T: MessageTransport,
    TP: TransParams,
{
    inner: Arc<ClientEndpointInner<T, TP>>,
}

pub(crate) struct ClientEndpointInner<T, TP>
where
    T: MessageTransport,
    TP: TransParams,
{
    reliability: ReliabilityEngine<T, TP, ClientEndpointInner<T, TP>>,
    callbacks: RwLock<HashMap<(SocketAddr, MsgToken), Arc<dyn ResponseHandler>>>,
    tokens: TokenPool,
    transport: Arc<T>,
    scheduler: Scheduler,
    observer: RwLock<Option<Arc<dyn HandleEvent>>>,
}

impl<T: MessageTransport> ClientEndpoint<T> {
    /// Creates a new endpoint with the standard RFC 7252 transmission
    /// parameters.
    pub fn new(transport: T, scheduler: Scheduler) -> ClientEndpoint<T> {
        ClientEndpoint::with_params(transport, scheduler, StandardCoapConstants)
    }
}

impl<T, TP> ClientEndpoint<T, TP>
where
    T: MessageTransport,
    TP: TransParams,
{
    /// Creates a new endpoint with the given transmission parameters.
    pub fn with_params(transport: T, scheduler: Scheduler, params: TP) -> ClientEndpoint<T, TP> {
        let transport = Arc::new(transport);
        let inner = Arc::new_cyclic(|weak| ClientEndpointInner {
            reliability: ReliabilityEngine::new(
                transport.clone(),
                scheduler.clone(),
                params,
                weak.clone(),
            ),
            callbacks: RwLock::new(HashMap::new()),
            tokens: TokenPool::new(params.max_token_length()),
            transport,
            scheduler,
            observer: RwLock::new(None),
        });
        ClientEndpoint { inner }
    }

    /// Installs an observer that sees every pipeline event after the
    /// endpoint's own processing.
    pub fn set_event_observer(&self, observer: Arc<dyn HandleEvent>) {
        *self.inner.observer.write().expect("Lock failed") = Some(observer);
    }

    /// Borrows a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &*self.inner.transport
    }

    /// Sends a request and registers `handler` for everything that comes
    /// back under its token.
    ///
    /// The request's token is managed here: ordinary requests get a fresh
    /// one from the token pool, observation cancellations and refreshes keep
    /// the token of the observation they refer to, and pings use the empty
    /// token. Failures to even start the exchange (no token, a ping already
    /// in flight, a cancellation without a matching observation) are
    /// delivered synchronously through `handler.on_misc_error`.
    pub fn send_request(
        &self,
        mut request: Message,
        remote: SocketAddr,
        handler: Arc<dyn ResponseHandler>,
    ) {
        let inner = &self.inner;
        let token;

        if request.is_ping() {
            if !request.token().is_empty() {
                handler.on_misc_error("ping must use the empty token");
                return;
            }
            if inner
                .add_callback(remote, MsgToken::EMPTY, handler.clone())
                .is_err()
            {
                handler.on_misc_error("another ongoing PING");
                return;
            }
            token = MsgToken::EMPTY;
        } else if request.is_request() && request.observe() == Some(OBSERVE_DEREGISTER) {
            // A cancellation rides on the token of the observation it ends.
            if request.token().is_empty()
                || !inner.replace_callback(remote, request.token(), handler.clone())
            {
                handler.on_misc_error("no ongoing observation");
                return;
            }
            token = request.token();
        } else if request.is_request()
            && request.observe() == Some(OBSERVE_REGISTER)
            && !request.token().is_empty()
            && inner.replace_callback(remote, request.token(), handler.clone())
        {
            // Observation refresh: same token, new handler.
            token = request.token();
        } else {
            token = match inner.tokens.acquire() {
                Some(token) => token,
                None => {
                    handler.on_misc_error("no token available");
                    return;
                }
            };
            request.set_token(token);
            if inner.add_callback(remote, token, handler.clone()).is_err() {
                error!("Token collision on {} at {}", token, remote);
                inner.tokens.release(token);
                handler.on_misc_error("token collision");
                return;
            }
        }

        self.submit(request, remote, token);
    }

    /// Sends a CoAP ping to `remote`.
    ///
    /// The "pong" arrives as `handler.on_reset()`.
    pub fn send_ping(&self, remote: SocketAddr, handler: Arc<dyn ResponseHandler>) {
        self.send_request(Message::ping(), remote, handler);
    }

    /// Raw entry into the outbound pipeline, for messages whose correlation
    /// state is already established: retransmission-managed notifications, or
    /// replies produced by layers above this one.
    ///
    /// No handler is registered; events for the message's token go to
    /// whatever is already registered there, if anything.
    pub fn send_message(&self, message: Message, remote: SocketAddr) {
        let token = message.token();
        self.submit(message, remote, token);
    }

    /// Entry point for inbound datagrams, called by whatever drives the
    /// socket.
    pub fn handle_inbound(&self, message: Message, remote: SocketAddr) {
        debug!("INBOUND: {} {}", remote, message);

        match self.inner.reliability.handle_inbound(&message, remote) {
            Disposition::Drop => return,
            Disposition::Continue => {}
        }

        if message.is_response() {
            self.inner.dispatch_response(&message, remote);
        } else if message.is_request() {
            debug!("Inbound request on a client-only channel; ignoring");
        } else {
            debug!("Unhandled inbound message: {}", message);
        }
    }

    /// Entry point for pipeline events raised by neighboring stages, such as
    /// a remote socket change detected below this layer.
    pub fn handle_event(&self, event: ExchangeEvent) {
        self.inner.process_event(event);
    }

    fn submit(&self, request: Message, remote: SocketAddr, token: MsgToken) {
        let inner = self.inner.clone();
        self.inner.scheduler.spawn(async move {
            let mut request = request;
            match inner.reliability.handle_outbound(&mut request, remote) {
                Disposition::Drop => {}
                Disposition::Continue => {
                    debug!("OUTBOUND: {} {}", remote, request);
                    if let Err(e) = inner.transport.send_message(&request, remote) {
                        inner.process_event(ExchangeEvent::MiscError {
                            remote,
                            token,
                            msg_id: request.msg_id(),
                            description: format!("message could not be sent: {}", e),
                        });
                    }
                }
            }
        });
    }
}

impl<T, TP> std::fmt::Debug for ClientEndpoint<T, TP>
where
    T: MessageTransport,
    TP: TransParams,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let callbacks = self.inner.callbacks.read().expect("Lock failed");
        f.debug_struct("ClientEndpoint")
            .field("callbacks", &callbacks.keys())
            .finish()
    }
}

impl<T, TP> ClientEndpointInner<T, TP>
where
    T: MessageTransport,
    TP: TransParams,
{
    /// Routes one event through the endpoint: reliability bookkeeping first,
    /// then callback dispatch, then the external observer.
    fn process_event(&self, event: ExchangeEvent) {
        self.reliability.handle_event(&event);

        match &event {
            ExchangeEvent::MsgIdAssigned {
                remote,
                token,
                msg_id,
            } => {
                if let Some(handler) = self.callback_for(*remote, *token) {
                    handler.on_message_id_assigned(*msg_id);
                }
            }
            ExchangeEvent::MessageRetransmitted { remote, token, .. } => {
                if let Some(handler) = self.callback_for(*remote, *token) {
                    handler.on_retransmission();
                }
            }
            ExchangeEvent::EmptyAckReceived { remote, token, .. } => {
                // Separate-response mode: the registration stays.
                if let Some(handler) = self.callback_for(*remote, *token) {
                    handler.on_empty_ack();
                }
            }
            ExchangeEvent::ResetReceived { remote, token, .. } => {
                if let Some(handler) = self.take_callback(*remote, *token) {
                    handler.on_reset();
                }
            }
            ExchangeEvent::TransmissionTimeout { remote, token, .. } => {
                if let Some(handler) = self.take_callback(*remote, *token) {
                    handler.on_timeout();
                }
            }
            ExchangeEvent::MiscError {
                remote,
                token,
                description,
                ..
            } => {
                if let Some(handler) = self.take_callback(*remote, *token) {
                    handler.on_misc_error(description);
                }
            }
            ExchangeEvent::PartialContentReceived {
                remote,
                token,
                message,
            } => {
                if let Some(handler) = self.callback_for(*remote, *token) {
                    handler.on_partial_content(message);
                }
            }
            ExchangeEvent::RemoteSocketChanged {
                previous,
                current,
                token,
            } => {
                self.rekey_callback(*previous, *current, *token);
            }
            ExchangeEvent::LazyObservationTermination { .. } => {
                // Consumed by the observation terminator through the
                // observer seam below.
            }
        }

        let observer = self.observer.read().expect("Lock failed").clone();
        if let Some(observer) = observer {
            observer.handle_event(&event);
        }
    }

    fn dispatch_response(&self, response: &Message, remote: SocketAddr) {
        let token = response.token();

        if response.is_error_response() || !response.is_update_notification() {
            // Terminal response: tear the registration down before
            // delivery, so nothing can be invoked after it.
            match self.take_callback(remote, token) {
                Some(handler) => handler.on_response(response),
                None => debug!(
                    "Response with unknown token {} from {}; dropping",
                    token, remote
                ),
            }
            return;
        }

        // Non-terminal observe notification.
        let handler = match self.callback_for(remote, token) {
            Some(handler) => handler,
            None => return,
        };

        if !handler.continue_observation() {
            self.process_event(ExchangeEvent::LazyObservationTermination { remote, token });
        }

        handler.on_response(response);
    }

    /// Registers a callback, failing if the `(remote, token)` slot is taken.
    ///
    /// The collision test runs under the read lock first and is repeated
    /// under the write lock, since the table may have changed in between.
    fn add_callback(
        &self,
        remote: SocketAddr,
        token: MsgToken,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), crate::Error> {
        {
            let callbacks = self.callbacks.read().expect("Lock failed");
            if callbacks.contains_key(&(remote, token)) {
                return Err(crate::Error::InvalidArgument);
            }
        }

        let mut callbacks = self.callbacks.write().expect("Lock failed");
        if callbacks.contains_key(&(remote, token)) {
            return Err(crate::Error::InvalidArgument);
        }
        info!("Adding response callback for token {} at {}", token, remote);
        callbacks.insert((remote, token), handler);
        Ok(())
    }

    /// Swaps the handler of a live registration in place. Returns false if
    /// there is nothing registered at `(remote, token)`.
    fn replace_callback(
        &self,
        remote: SocketAddr,
        token: MsgToken,
        handler: Arc<dyn ResponseHandler>,
    ) -> bool {
        {
            let callbacks = self.callbacks.read().expect("Lock failed");
            if !callbacks.contains_key(&(remote, token)) {
                return false;
            }
        }

        let mut callbacks = self.callbacks.write().expect("Lock failed");
        match callbacks.get_mut(&(remote, token)) {
            Some(slot) => {
                *slot = handler;
                true
            }
            None => false,
        }
    }

    fn callback_for(
        &self,
        remote: SocketAddr,
        token: MsgToken,
    ) -> Option<Arc<dyn ResponseHandler>> {
        let callbacks = self.callbacks.read().expect("Lock failed");
        let handler = callbacks.get(&(remote, token)).cloned();
        if handler.is_none() {
            debug!("No callback registered for token {} at {}", token, remote);
        }
        handler
    }

    /// Removes a registration terminally, returning its token to the pool
    /// and clearing any transfer state still held for it.
    fn take_callback(
        &self,
        remote: SocketAddr,
        token: MsgToken,
    ) -> Option<Arc<dyn ResponseHandler>> {
        {
            let callbacks = self.callbacks.read().expect("Lock failed");
            if !callbacks.contains_key(&(remote, token)) {
                debug!("No callback registered for token {} at {}", token, remote);
                return None;
            }
        }

        let handler = {
            let mut callbacks = match self.callbacks.write() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    debug!("Recovering from lock poisoning");
                    poisoned.into_inner()
                }
            };
            callbacks.remove(&(remote, token))?
        };

        // The empty token belongs to ping and never came from the pool.
        if !token.is_empty() {
            self.tokens.release(token);
        }
        self.reliability.release_token(remote, token);

        Some(handler)
    }

    /// Atomically moves a registration from `(previous, token)` to
    /// `(current, token)` and notifies the handler.
    fn rekey_callback(&self, previous: SocketAddr, current: SocketAddr, token: MsgToken) {
        {
            let callbacks = self.callbacks.read().expect("Lock failed");
            if !callbacks.contains_key(&(previous, token)) {
                debug!(
                    "Socket change for unknown exchange (token {} at {})",
                    token, previous
                );
                return;
            }
        }

        let moved = {
            let mut callbacks = self.callbacks.write().expect("Lock failed");
            if callbacks.contains_key(&(current, token)) {
                error!(
                    "Cannot move token {} from {} to {}: target already registered",
                    token, previous, current
                );
                None
            } else {
                match callbacks.remove(&(previous, token)) {
                    Some(handler) => {
                        callbacks.insert((current, token), handler.clone());
                        Some(handler)
                    }
                    None => None,
                }
            }
        };

        if let Some(handler) = moved {
            handler.on_remote_socket_changed(current, previous);
        }
    }
}

impl<T, TP> EventSink for ClientEndpointInner<T, TP>
where
    T: MessageTransport,
    TP: TransParams,
{
    fn dispatch_event(&self, event: ExchangeEvent) {
        self.process_event(event);
    }
}
