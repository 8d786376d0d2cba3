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

//! The wire-facing boundary of the exchange layer.
//!
//! Downstream of this trait live the CoAP codec and the datagram socket,
//! which are deliberately outside this crate. The exchange layer hands fully
//! assembled [`Message`] descriptors to a [`MessageTransport`] and expects the
//! implementation to encode and emit them.
//!
//! Two trivial implementations are provided: [`NullTransport`], which
//! swallows everything (useful for exercising timeout paths), and
//! [`RecordingTransport`], which journals outbound traffic for inspection.

use crate::message::Message;
use crate::Error;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Boundary trait through which the exchange layer writes messages.
///
/// Implementations must be callable from multiple scheduler threads at once.
/// A send failure reported here surfaces to the originating callback as a
/// `MiscError`, so implementations should return `Err` only for failures
/// that are final for this particular message.
pub trait MessageTransport: Send + Sync + 'static {
    /// Hands one message to the underlying channel for delivery to `dest`.
    fn send_message(&self, message: &Message, dest: SocketAddr) -> Result<(), Error>;
}

/// A transport that implements a simple null interface, where all messages
/// that are sent are discarded.
#[derive(Debug, Default)]
pub struct NullTransport;

impl NullTransport {
    /// Creates a new instance of [`NullTransport`].
    pub fn new() -> NullTransport {
        NullTransport
    }
}

impl MessageTransport for NullTransport {
    fn send_message(&self, _message: &Message, _dest: SocketAddr) -> Result<(), Error> {
        Ok(())
    }
}

/// A transport that journals every outbound message.
///
/// Used by the integration tests to observe the exact sequence of frames the
/// exchange layer puts on the wire, and to simulate write failures.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Message, SocketAddr)>>,
    fail_writes: AtomicBool,
}

impl RecordingTransport {
    /// Creates a new instance of [`RecordingTransport`].
    pub fn new() -> RecordingTransport {
        RecordingTransport::default()
    }

    /// Returns a snapshot of every message sent so far, oldest first.
    pub fn sent(&self) -> Vec<(Message, SocketAddr)> {
        self.sent.lock().expect("Lock failed").clone()
    }

    /// Returns the number of messages sent so far.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("Lock failed").len()
    }

    /// When set, subsequent writes fail with [`Error::IOError`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl MessageTransport for RecordingTransport {
    fn send_message(&self, message: &Message, dest: SocketAddr) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(Error::IOError);
        }
        self.sent
            .lock()
            .expect("Lock failed")
            .push((message.clone(), dest));
        Ok(())
    }
}
