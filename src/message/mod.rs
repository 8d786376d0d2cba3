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

//! Message descriptors as observed by the exchange layer.
//!
//! The exchange layer never touches wire bytes: encoding and decoding happen
//! on the far side of the [`MessageTransport`][crate::MessageTransport]
//! boundary. What travels through this crate is the [`Message`] descriptor, an
//! owned, already-parsed view of a CoAP frame carrying exactly the fields the
//! exchange layer keys on.

mod msg_type;
pub use msg_type::MsgType;

mod msg_code;
pub use msg_code::{MsgCode, MsgCodeClass};

mod token;
pub use token::MsgToken;

/// Type for representing a CoAP message id.
pub type MsgId = u16;

/// An owned, already-parsed CoAP message.
///
/// A freshly built outbound message usually has no message id; the exchange
/// layer assigns one as the message enters the outbound pipeline.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    msg_type: MsgType,
    msg_code: MsgCode,
    msg_id: Option<MsgId>,
    token: MsgToken,
    observe: Option<u32>,
    payload: Vec<u8>,
}

impl Message {
    /// Creates a new request message of the given type and method code.
    pub fn request(msg_type: MsgType, msg_code: MsgCode) -> Message {
        debug_assert!(msg_code.is_method());
        Message {
            msg_type,
            msg_code,
            msg_id: None,
            token: MsgToken::EMPTY,
            observe: None,
            payload: Vec::new(),
        }
    }

    /// Creates a new response message of the given type and response code.
    pub fn response(msg_type: MsgType, msg_code: MsgCode) -> Message {
        debug_assert!(msg_code.is_response());
        Message {
            msg_type,
            msg_code,
            msg_id: None,
            token: MsgToken::EMPTY,
            observe: None,
            payload: Vec::new(),
        }
    }

    /// Creates a new CoAP ping: a confirmable message with the empty code
    /// and the empty token.
    pub fn ping() -> Message {
        Message {
            msg_type: MsgType::Con,
            msg_code: MsgCode::Empty,
            msg_id: None,
            token: MsgToken::EMPTY,
            observe: None,
            payload: Vec::new(),
        }
    }

    /// Creates an empty acknowledgement for the given message id.
    pub fn empty_ack(msg_id: MsgId) -> Message {
        Message {
            msg_type: MsgType::Ack,
            msg_code: MsgCode::Empty,
            msg_id: Some(msg_id),
            token: MsgToken::EMPTY,
            observe: None,
            payload: Vec::new(),
        }
    }

    /// Creates a reset message for the given message id.
    pub fn reset(msg_id: MsgId) -> Message {
        Message {
            msg_type: MsgType::Rst,
            msg_code: MsgCode::Empty,
            msg_id: Some(msg_id),
            token: MsgToken::EMPTY,
            observe: None,
            payload: Vec::new(),
        }
    }

    /// Consuming setter for the message id.
    pub fn with_msg_id(mut self, msg_id: MsgId) -> Message {
        self.msg_id = Some(msg_id);
        self
    }

    /// Consuming setter for the token.
    pub fn with_token(mut self, token: MsgToken) -> Message {
        self.token = token;
        self
    }

    /// Consuming setter for the observe sequence number.
    pub fn with_observe(mut self, observe: u32) -> Message {
        self.observe = Some(observe);
        self
    }

    /// Consuming setter for the payload.
    pub fn with_payload<P: Into<Vec<u8>>>(mut self, payload: P) -> Message {
        self.payload = payload.into();
        self
    }

    /// Returns the message type.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Returns the message code.
    pub fn msg_code(&self) -> MsgCode {
        self.msg_code
    }

    /// Returns the message id, or `None` if one has not yet been assigned.
    pub fn msg_id(&self) -> Option<MsgId> {
        self.msg_id
    }

    /// Assigns the message id.
    pub fn set_msg_id(&mut self, msg_id: MsgId) {
        self.msg_id = Some(msg_id);
    }

    /// Clears the message id, returning the message to the unassigned state.
    pub fn clear_msg_id(&mut self) {
        self.msg_id = None;
    }

    /// Returns the token.
    pub fn token(&self) -> MsgToken {
        self.token
    }

    /// Replaces the token.
    pub fn set_token(&mut self, token: MsgToken) {
        self.token = token;
    }

    /// Returns the observe sequence number, if the observe option is present.
    pub fn observe(&self) -> Option<u32> {
        self.observe
    }

    /// Replaces the observe sequence number.
    pub fn set_observe(&mut self, observe: Option<u32>) {
        self.observe = observe;
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns true if this message is a CoAP ping.
    pub fn is_ping(&self) -> bool {
        self.msg_type.is_con() && self.msg_code.is_empty()
    }

    /// Returns true if this message is a request.
    pub fn is_request(&self) -> bool {
        self.msg_code.is_method()
    }

    /// Returns true if this message is a response.
    pub fn is_response(&self) -> bool {
        self.msg_code.is_response()
    }

    /// Returns true if this message is an error response.
    pub fn is_error_response(&self) -> bool {
        self.msg_code.is_error()
    }

    /// Returns true if this message is an observe update notification: a
    /// response carrying an observe sequence number.
    pub fn is_update_notification(&self) -> bool {
        self.is_response() && self.observe.is_some()
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {:?}", self.msg_type, self.msg_code)?;
        match self.msg_id {
            Some(id) => write!(f, " id={:04X}", id)?,
            None => f.write_str(" id=?")?,
        }
        write!(f, " tok={}", self.token)?;
        if let Some(seq) = self.observe {
            write!(f, " obs={}", seq)?;
        }
        if !self.payload.is_empty() {
            write!(f, " ({} bytes)", self.payload.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_shape() {
        let ping = Message::ping();
        assert!(ping.is_ping());
        assert!(!ping.is_request());
        assert!(!ping.is_response());
        assert!(ping.token().is_empty());
        assert_eq!(ping.msg_id(), None);
    }

    #[test]
    fn update_notification_predicate() {
        let notif = Message::response(MsgType::Con, MsgCode::SuccessContent).with_observe(5);
        assert!(notif.is_update_notification());
        assert!(!notif.is_error_response());

        let plain = Message::response(MsgType::Ack, MsgCode::SuccessContent);
        assert!(!plain.is_update_notification());

        let request = Message::request(MsgType::Con, MsgCode::MethodGet).with_observe(0);
        assert!(!request.is_update_notification());
    }

    #[test]
    fn msg_id_lifecycle() {
        let mut msg = Message::request(MsgType::Con, MsgCode::MethodGet);
        assert_eq!(msg.msg_id(), None);
        msg.set_msg_id(0x1234);
        assert_eq!(msg.msg_id(), Some(0x1234));
        msg.clear_msg_id();
        assert_eq!(msg.msg_id(), None);
    }
}
