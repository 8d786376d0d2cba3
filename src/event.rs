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

use crate::message::{Message, MsgId, MsgToken};
use std::net::SocketAddr;

/// Typed events flowing through the exchange pipeline.
///
/// Events originate in the reliability engine (retransmission progress,
/// ACK/RST matching, timeouts), in the callback manager (send failures), or
/// in neighboring pipeline stages outside this crate (socket changes). Every
/// event identifies its exchange by `(remote, token)`; events tied to a
/// specific datagram also carry the message id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExchangeEvent {
    /// A message id was assigned to an outbound message.
    MsgIdAssigned {
        /// The remote endpoint of the exchange.
        remote: SocketAddr,
        /// The token identifying the exchange.
        token: MsgToken,
        /// The assigned message id.
        msg_id: MsgId,
    },

    /// A confirmable message was retransmitted.
    MessageRetransmitted {
        /// The remote endpoint of the exchange.
        remote: SocketAddr,
        /// The token identifying the exchange.
        token: MsgToken,
        /// The id of the retransmitted message.
        msg_id: MsgId,
    },

    /// An empty acknowledgement arrived for an in-flight confirmable
    /// message. The response will follow separately under the same token.
    EmptyAckReceived {
        /// The remote endpoint of the exchange.
        remote: SocketAddr,
        /// The token identifying the exchange.
        token: MsgToken,
        /// The id of the acknowledged message.
        msg_id: MsgId,
    },

    /// A reset arrived for an in-flight confirmable message.
    ResetReceived {
        /// The remote endpoint of the exchange.
        remote: SocketAddr,
        /// The token identifying the exchange.
        token: MsgToken,
        /// The id of the reset message.
        msg_id: MsgId,
    },

    /// A confirmable message exhausted its retransmissions without being
    /// acknowledged or reset.
    TransmissionTimeout {
        /// The remote endpoint of the exchange.
        remote: SocketAddr,
        /// The token identifying the exchange.
        token: MsgToken,
        /// The id of the timed-out message.
        msg_id: MsgId,
    },

    /// An unrecoverable, exchange-terminating error.
    MiscError {
        /// The remote endpoint of the exchange.
        remote: SocketAddr,
        /// The token identifying the exchange.
        token: MsgToken,
        /// The id of the affected message, when one had been assigned.
        msg_id: Option<MsgId>,
        /// Human-readable description of what went wrong.
        description: String,
    },

    /// A block of a larger response arrived; more blocks will follow under
    /// the same token.
    PartialContentReceived {
        /// The remote endpoint of the exchange.
        remote: SocketAddr,
        /// The token identifying the exchange.
        token: MsgToken,
        /// The partial response.
        message: Message,
    },

    /// The remote endpoint of an ongoing exchange moved to a new socket
    /// address; its callback must follow.
    RemoteSocketChanged {
        /// The address the exchange was keyed under so far.
        previous: SocketAddr,
        /// The address the remote endpoint now answers from.
        current: SocketAddr,
        /// The token identifying the exchange.
        token: MsgToken,
    },

    /// The originator of an observation declined its latest notification;
    /// the observation should be cancelled by whoever manages observation
    /// teardown.
    LazyObservationTermination {
        /// The remote endpoint of the observation.
        remote: SocketAddr,
        /// The token identifying the observation.
        token: MsgToken,
    },
}

/// Receiver for exchange pipeline events.
///
/// The assembled client processes every event internally first; an observer
/// installed via
/// [`ClientEndpoint::set_event_observer`][crate::ClientEndpoint::set_event_observer]
/// then sees the event as well. This is the seam through which
/// [`LazyObservationTermination`][ExchangeEvent::LazyObservationTermination]
/// reaches the subsystem responsible for sending observation cancellations.
pub trait HandleEvent: Send + Sync {
    /// Called once per event, after the exchange layer's own processing.
    fn handle_event(&self, event: &ExchangeEvent);
}
