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

//! An experimental client-side message-exchange layer for the Constrained
//! Application Protocol (CoAP).
//!
//! This crate implements the part of a CoAP client that sits between the
//! user's request and the datagram socket: it assigns message ids and tokens,
//! retransmits confirmable messages with the RFC 7252 exponential back-off,
//! matches acknowledgements and resets to the transfers they confirm, and
//! routes responses (including RFC 7641 observe notifications) back to the
//! handler that issued the request.
//!
//! What it deliberately does *not* do: encode or decode wire bytes, own a
//! socket, or handle the server side of the protocol. Those live behind the
//! [`MessageTransport`] boundary on one side and the inbound entry point on
//! the other, so this layer composes with whatever codec and I/O stack the
//! embedding application already has.
//!
//! ## Usage
//!
//! Requests are fire-and-forget at the call site; everything that happens to
//! an exchange afterwards arrives through its [`ResponseHandler`]:
//!
//! ```
//! use std::sync::Arc;
//! use coap_exchange::{ClientEndpoint, ResponseHandler, Scheduler};
//! use coap_exchange::message::{Message, MsgCode, MsgType};
//! use coap_exchange::transport::RecordingTransport;
//!
//! struct PrintHandler;
//!
//! impl ResponseHandler for PrintHandler {
//!     fn on_response(&self, response: &Message) {
//!         println!("Got response: {}", response);
//!     }
//!
//!     fn on_timeout(&self) {
//!         println!("Request timed out");
//!     }
//! }
//!
//! let scheduler = Scheduler::new().expect("scheduler");
//! let client = ClientEndpoint::new(RecordingTransport::new(), scheduler);
//!
//! client.send_request(
//!     Message::request(MsgType::Con, MsgCode::MethodGet),
//!     "10.0.0.1:5683".parse().unwrap(),
//!     Arc::new(PrintHandler),
//! );
//! ```
//!
//! The code driving the socket feeds parsed inbound datagrams to
//! [`ClientEndpoint::handle_inbound`], which completes the loop: the layer
//! matches each datagram against its open exchanges and invokes the right
//! handler method, on a thread of the shared [`Scheduler`].

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

mod error;
pub use error::Error;

pub mod consts;
pub use consts::*;

pub mod message;

mod trans_params;
pub use trans_params::{StandardCoapConstants, TransParams};

mod scheduler;
pub use scheduler::{ScheduledTask, Scheduler};

pub mod transport;
pub use transport::MessageTransport;

mod event;
pub use event::{ExchangeEvent, HandleEvent};

mod msg_id_pool;
mod token_pool;

mod reliability;

mod client;
pub use client::{ClientEndpoint, ResponseHandler};
