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

use crate::event::ExchangeEvent;
use crate::message::{Message, MsgId, MsgToken};
use crate::msg_id_pool::MsgIdPool;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::transport::MessageTransport;
use crate::TransParams;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};

/// What the pipeline should do with a message after a stage has seen it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Disposition {
    /// Hand the message to the next stage.
    Continue,

    /// The message has been consumed; do not process it further.
    Drop,
}

/// Receiver for events the reliability engine produces.
///
/// The assembled client implements this; its event processing feeds the
/// engine's own [`handle_event`][ReliabilityEngine::handle_event] before
/// dispatching to callbacks, which is how terminal events clear their table
/// entries.
pub(crate) trait EventSink: Send + Sync + 'static {
    fn dispatch_event(&self, event: ExchangeEvent);
}

/// One outbound message the engine is still interested in.
///
/// Confirmable messages get the full retransmission treatment; outbound NON
/// requests are recorded as bare entries so that their responses can still be
/// correlated later.
#[derive(Debug, Clone)]
pub(crate) enum OutboundTransfer {
    Non {
        token: MsgToken,
    },
    Reliable(Arc<ReliableTransfer>),
}

impl OutboundTransfer {
    fn token(&self) -> MsgToken {
        match self {
            OutboundTransfer::Non { token } => *token,
            OutboundTransfer::Reliable(transfer) => transfer.token,
        }
    }
}

/// An in-flight confirmable message.
#[derive(Debug)]
pub(crate) struct ReliableTransfer {
    remote: SocketAddr,
    msg_id: MsgId,
    token: MsgToken,
    state: Mutex<TransferState>,
}

/// Mutable half of a [`ReliableTransfer`].
///
/// The mutex serializes retransmit writes with notification folding, so the
/// retransmit task always puts a complete payload on the wire. `confirmed`
/// is the authoritative kill switch: the scheduled task re-checks it under
/// this lock before writing, making the scheduler-level cancel a hint rather
/// than a correctness requirement.
#[derive(Debug)]
struct TransferState {
    message: Message,
    retransmit_count: u32,
    confirmed: bool,
    retransmit_task: Option<ScheduledTask>,
}

#[derive(Debug, Default)]
struct TransferTable {
    by_id: HashMap<(SocketAddr, MsgId), OutboundTransfer>,
    // Values are keys into `by_id`; the transfer itself has a single owner.
    by_token: HashMap<(SocketAddr, MsgToken), MsgId>,
}

/// Outbound reliability engine.
///
/// Tracks every outbound message that may still matter: confirmable
/// transfers until they are acknowledged, reset, timed out, or fail, and
/// non-confirmable requests until their exchange ends. The table is read on
/// every inbound datagram and written comparatively rarely, hence the
/// reader/writer lock; mutations re-verify their precondition after
/// acquiring the write half.
pub(crate) struct ReliabilityEngine<T, TP, S>
where
    T: MessageTransport,
    TP: TransParams,
    S: EventSink,
{
    transport: Arc<T>,
    scheduler: Scheduler,
    params: TP,
    msg_ids: MsgIdPool,
    table: RwLock<TransferTable>,
    sink: Weak<S>,
}

impl<T, TP, S> ReliabilityEngine<T, TP, S>
where
    T: MessageTransport,
    TP: TransParams,
    S: EventSink,
{
    pub(crate) fn new(
        transport: Arc<T>,
        scheduler: Scheduler,
        params: TP,
        sink: Weak<S>,
    ) -> ReliabilityEngine<T, TP, S> {
        let msg_ids = MsgIdPool::new(params.coap_exchange_lifetime());
        ReliabilityEngine {
            transport,
            scheduler,
            params,
            msg_ids,
            table: RwLock::new(TransferTable::default()),
            sink,
        }
    }

    /// Outbound pipeline stage.
    ///
    /// Assigns a message id where one is missing, installs tracking state,
    /// and schedules the first retransmission for confirmable messages.
    /// Returns [`Disposition::Drop`] when the message must not reach the
    /// wire: either it was folded into an in-flight notification transfer,
    /// or no message id could be allocated.
    pub(crate) fn handle_outbound(
        &self,
        message: &mut Message,
        remote: SocketAddr,
    ) -> Disposition {
        if message.is_update_notification() {
            if self.fold_notification(message, remote) {
                // The in-flight transfer now carries this payload; its next
                // retransmission delivers it.
                return Disposition::Drop;
            }
            message.clear_msg_id();
        }

        let msg_id = match message.msg_id() {
            Some(msg_id) => msg_id,
            None => match self.msg_ids.next_id(remote) {
                Some(msg_id) => {
                    message.set_msg_id(msg_id);
                    self.emit(ExchangeEvent::MsgIdAssigned {
                        remote,
                        token: message.token(),
                        msg_id,
                    });
                    msg_id
                }
                None => {
                    self.emit(ExchangeEvent::MiscError {
                        remote,
                        token: message.token(),
                        msg_id: None,
                        description: "No message ID available".to_string(),
                    });
                    return Disposition::Drop;
                }
            },
        };

        if message.msg_type().is_con() {
            let transfer = Arc::new(ReliableTransfer {
                remote,
                msg_id,
                token: message.token(),
                state: Mutex::new(TransferState {
                    message: message.clone(),
                    retransmit_count: 0,
                    confirmed: false,
                    retransmit_task: None,
                }),
            });

            let delay = self.params.calc_retransmit_duration(1);
            let task = schedule_retransmit(
                &self.scheduler,
                &transfer,
                &self.transport,
                self.params,
                self.sink.clone(),
                delay,
            );
            transfer.state.lock().expect("Lock failed").retransmit_task = Some(task);

            let mut table = self.table.write().expect("Lock failed");
            table
                .by_id
                .insert((remote, msg_id), OutboundTransfer::Reliable(transfer));
            table.by_token.insert((remote, message.token()), msg_id);
        } else if message.is_request() {
            // NON requests are not retransmitted, but their responses still
            // need to find their way back by token.
            let mut table = self.table.write().expect("Lock failed");
            table.by_id.insert(
                (remote, msg_id),
                OutboundTransfer::Non {
                    token: message.token(),
                },
            );
            table.by_token.insert((remote, message.token()), msg_id);
        }

        Disposition::Continue
    }

    /// Inbound pipeline stage.
    ///
    /// Matches ACK and RST datagrams against in-flight confirmable
    /// transfers. Empty ACKs and resets are consumed here (after emitting
    /// the corresponding event); piggy-backed responses continue on to
    /// response dispatch.
    pub(crate) fn handle_inbound(&self, message: &Message, remote: SocketAddr) -> Disposition {
        if !message.msg_type().is_ack() && !message.msg_type().is_rst() {
            return Disposition::Continue;
        }

        let msg_id = match message.msg_id() {
            Some(msg_id) => msg_id,
            None => {
                warn!("{:?} without a message id from {}", message.msg_type(), remote);
                return Disposition::Drop;
            }
        };

        {
            let table = self.table.read().expect("Lock failed");
            if !table.by_id.contains_key(&(remote, msg_id)) {
                debug!(
                    "{:?} from {} matches no open transfer (id={:04X}); dropping",
                    message.msg_type(),
                    remote,
                    msg_id
                );
                return Disposition::Drop;
            }
        }

        let transfer = {
            let mut table = self.table.write().expect("Lock failed");
            match table.by_id.remove(&(remote, msg_id)) {
                Some(transfer) => {
                    remove_token_entry(&mut table, remote, transfer.token(), msg_id);
                    transfer
                }
                // Lost the race against another terminal event.
                None => return Disposition::Drop,
            }
        };

        if let OutboundTransfer::Reliable(reliable) = &transfer {
            let mut state = reliable.state.lock().expect("Lock failed");
            state.confirmed = true;
            if let Some(task) = state.retransmit_task.take() {
                task.cancel();
            }
        }

        if message.msg_type().is_rst() {
            // A reset is empty by definition; any code it carries is ignored.
            self.emit(ExchangeEvent::ResetReceived {
                remote,
                token: transfer.token(),
                msg_id,
            });
            return Disposition::Drop;
        }

        if message.msg_code().is_empty() {
            self.emit(ExchangeEvent::EmptyAckReceived {
                remote,
                token: transfer.token(),
                msg_id,
            });
            return Disposition::Drop;
        }

        // Piggy-backed response; the callback manager takes it from here.
        Disposition::Continue
    }

    /// Event pipeline stage.
    ///
    /// Terminal events produced downstream of the engine (timeouts from the
    /// retransmit task, write failures) clear the transfer they refer to.
    pub(crate) fn handle_event(&self, event: &ExchangeEvent) {
        match event {
            ExchangeEvent::TransmissionTimeout {
                remote, msg_id, ..
            } => {
                self.remove_transfer(*remote, *msg_id);
            }
            ExchangeEvent::MiscError {
                remote,
                msg_id: Some(msg_id),
                ..
            } => {
                self.remove_transfer(*remote, *msg_id);
            }
            _ => {}
        }
    }

    /// Drops whatever transfer state is still held for `(remote, token)`.
    ///
    /// Called when the exchange owning the token ends, which is what retires
    /// the bare entries left behind by NON requests.
    pub(crate) fn release_token(&self, remote: SocketAddr, token: MsgToken) {
        let msg_id = {
            let table = self.table.read().expect("Lock failed");
            match table.by_token.get(&(remote, token)) {
                Some(&msg_id) => msg_id,
                None => return,
            }
        };
        self.remove_transfer(remote, msg_id);
    }

    fn remove_transfer(&self, remote: SocketAddr, msg_id: MsgId) {
        {
            let table = self.table.read().expect("Lock failed");
            if !table.by_id.contains_key(&(remote, msg_id)) {
                return;
            }
        }

        let removed = {
            let mut table = self.table.write().expect("Lock failed");
            match table.by_id.remove(&(remote, msg_id)) {
                Some(transfer) => {
                    remove_token_entry(&mut table, remote, transfer.token(), msg_id);
                    Some(transfer)
                }
                None => None,
            }
        };

        if let Some(OutboundTransfer::Reliable(reliable)) = removed {
            let mut state = reliable.state.lock().expect("Lock failed");
            state.confirmed = true;
            if let Some(task) = state.retransmit_task.take() {
                task.cancel();
            }
        }
    }

    /// Attempts to replace the payload of a live, unacknowledged transfer
    /// for this notification's token. Returns true if the notification was
    /// absorbed.
    fn fold_notification(&self, message: &Message, remote: SocketAddr) -> bool {
        let transfer = {
            let table = self.table.read().expect("Lock failed");
            let msg_id = match table.by_token.get(&(remote, message.token())) {
                Some(&msg_id) => msg_id,
                None => return false,
            };
            match table.by_id.get(&(remote, msg_id)) {
                Some(OutboundTransfer::Reliable(transfer)) => transfer.clone(),
                _ => return false,
            }
        };

        let mut state = transfer.state.lock().expect("Lock failed");
        if state.confirmed {
            return false;
        }

        // Keep the id of the transfer we are replacing into; the exchange on
        // the wire stays the same one.
        let mut folded = message.clone();
        folded.set_msg_id(transfer.msg_id);
        debug!(
            "Folding notification {} into in-flight transfer id={:04X}",
            folded, transfer.msg_id
        );
        state.message = folded;
        true
    }

    fn emit(&self, event: ExchangeEvent) {
        if let Some(sink) = self.sink.upgrade() {
            sink.dispatch_event(event);
        } else {
            debug!("Event after endpoint teardown: {:?}", event);
        }
    }

    #[cfg(test)]
    fn msg_id_for_token(&self, remote: SocketAddr, token: MsgToken) -> Option<MsgId> {
        self.table
            .read()
            .expect("Lock failed")
            .by_token
            .get(&(remote, token))
            .copied()
    }

    #[cfg(test)]
    fn reliable_transfer(
        &self,
        remote: SocketAddr,
        msg_id: MsgId,
    ) -> Option<Arc<ReliableTransfer>> {
        match self
            .table
            .read()
            .expect("Lock failed")
            .by_id
            .get(&(remote, msg_id))
        {
            Some(OutboundTransfer::Reliable(transfer)) => Some(transfer.clone()),
            _ => None,
        }
    }

    #[cfg(test)]
    fn transfer_count(&self) -> usize {
        self.table.read().expect("Lock failed").by_id.len()
    }
}

impl<T, TP, S> Drop for ReliabilityEngine<T, TP, S>
where
    T: MessageTransport,
    TP: TransParams,
    S: EventSink,
{
    fn drop(&mut self) {
        let mut table = match self.table.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for transfer in table.by_id.values() {
            if let OutboundTransfer::Reliable(reliable) = transfer {
                let mut state = reliable.state.lock().expect("Lock failed");
                state.confirmed = true;
                if let Some(task) = state.retransmit_task.take() {
                    task.cancel();
                }
            }
        }
        table.by_id.clear();
        table.by_token.clear();
    }
}

impl<T, TP, S> std::fmt::Debug for ReliabilityEngine<T, TP, S>
where
    T: MessageTransport,
    TP: TransParams,
    S: EventSink,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let table = self.table.read().expect("Lock failed");
        f.debug_struct("ReliabilityEngine")
            .field("by_id", &table.by_id.keys())
            .field("by_token", &table.by_token.keys())
            .finish()
    }
}

fn remove_token_entry(
    table: &mut TransferTable,
    remote: SocketAddr,
    token: MsgToken,
    msg_id: MsgId,
) {
    // Only clear the token index if it still points at this transfer; a
    // newer exchange may have taken the token over.
    if table.by_token.get(&(remote, token)) == Some(&msg_id) {
        table.by_token.remove(&(remote, token));
    }
}

fn schedule_retransmit<T, TP, S>(
    scheduler: &Scheduler,
    transfer: &Arc<ReliableTransfer>,
    transport: &Arc<T>,
    params: TP,
    sink: Weak<S>,
    delay: std::time::Duration,
) -> ScheduledTask
where
    T: MessageTransport,
    TP: TransParams,
    S: EventSink,
{
    let transfer = transfer.clone();
    let transport = transport.clone();
    let scheduler_clone = scheduler.clone();
    scheduler.schedule(delay, move || {
        retransmit_fire(transfer, transport, scheduler_clone, params, sink);
    })
}

/// Body of the scheduled retransmit task.
///
/// Runs under the transfer's state lock so a concurrent fold cannot produce
/// a half-replaced payload on the wire. Exits silently if the transfer was
/// confirmed between scheduling and firing.
fn retransmit_fire<T, TP, S>(
    transfer: Arc<ReliableTransfer>,
    transport: Arc<T>,
    scheduler: Scheduler,
    params: TP,
    sink: Weak<S>,
) where
    T: MessageTransport,
    TP: TransParams,
    S: EventSink,
{
    let event;
    {
        let mut state = transfer.state.lock().expect("Lock failed");

        if state.confirmed {
            return;
        }

        if state.retransmit_count >= params.coap_max_retransmit() {
            // The post-retransmission grace period elapsed with no ACK or
            // RST: the exchange is dead.
            state.confirmed = true;
            state.retransmit_task = None;
            event = ExchangeEvent::TransmissionTimeout {
                remote: transfer.remote,
                token: transfer.token,
                msg_id: transfer.msg_id,
            };
        } else {
            if state.message.is_update_notification() {
                let next = state.message.observe().map(|seq| seq.wrapping_add(1));
                state.message.set_observe(next);
            }

            match transport.send_message(&state.message, transfer.remote) {
                Ok(()) => {
                    state.retransmit_count += 1;
                    debug!(
                        "OUTBOUND[{}]: {} {}",
                        state.retransmit_count, transfer.remote, state.message
                    );

                    let delay = params.calc_retransmit_duration(state.retransmit_count + 1);
                    state.retransmit_task = Some(schedule_retransmit(
                        &scheduler,
                        &transfer,
                        &transport,
                        params,
                        sink.clone(),
                        delay,
                    ));
                    event = ExchangeEvent::MessageRetransmitted {
                        remote: transfer.remote,
                        token: transfer.token,
                        msg_id: transfer.msg_id,
                    };
                }
                Err(e) => {
                    error!(
                        "send_message: {:?} (dest={}, id={:04X})",
                        e, transfer.remote, transfer.msg_id
                    );
                    state.confirmed = true;
                    state.retransmit_task = None;
                    event = ExchangeEvent::MiscError {
                        remote: transfer.remote,
                        token: transfer.token,
                        msg_id: Some(transfer.msg_id),
                        description: format!("message could not be sent: {}", e),
                    };
                }
            }
        }
    }

    if let Some(sink) = sink.upgrade() {
        sink.dispatch_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgCode, MsgType};
    use crate::transport::RecordingTransport;
    use std::sync::Mutex as StdMutex;
    use std::thread::sleep;
    use std::time::Duration;

    /// Transmission parameters shrunk so a whole retransmission cycle fits
    /// in a couple of seconds.
    #[derive(Debug, Default, Copy, Clone)]
    struct FastParams;

    impl TransParams for FastParams {
        const COAP_ACK_TIMEOUT: Duration = Duration::from_millis(50);
    }

    /// Parameters whose first retransmission is far enough out that a test
    /// can reliably act before it fires.
    #[derive(Debug, Default, Copy, Clone)]
    struct CalmParams;

    impl TransParams for CalmParams {
        const COAP_ACK_TIMEOUT: Duration = Duration::from_millis(500);
    }

    #[derive(Default)]
    struct TestSink {
        events: StdMutex<Vec<ExchangeEvent>>,
    }

    impl TestSink {
        fn events(&self) -> Vec<ExchangeEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for TestSink {
        fn dispatch_event(&self, event: ExchangeEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Fixture<TP: TransParams> {
        engine: ReliabilityEngine<RecordingTransport, TP, TestSink>,
        transport: Arc<RecordingTransport>,
        sink: Arc<TestSink>,
    }

    fn fixture<TP: TransParams>(params: TP) -> Fixture<TP> {
        let transport = Arc::new(RecordingTransport::new());
        let sink = Arc::new(TestSink::default());
        let engine = ReliabilityEngine::new(
            transport.clone(),
            Scheduler::new().expect("scheduler"),
            params,
            Arc::downgrade(&sink),
        );
        Fixture {
            engine,
            transport,
            sink,
        }
    }

    fn remote() -> SocketAddr {
        "10.0.0.1:5683".parse().unwrap()
    }

    fn con_get(token: &[u8]) -> Message {
        Message::request(MsgType::Con, MsgCode::MethodGet).with_token(MsgToken::new(token))
    }

    #[test]
    fn outbound_con_is_tracked_under_both_indices() {
        let f = fixture(CalmParams);
        let mut msg = con_get(&[0x42]);

        assert_eq!(f.engine.handle_outbound(&mut msg, remote()), Disposition::Continue);

        let msg_id = msg.msg_id().expect("no id assigned");
        assert_eq!(
            f.engine.msg_id_for_token(remote(), MsgToken::new(&[0x42])),
            Some(msg_id)
        );
        assert!(f.engine.reliable_transfer(remote(), msg_id).is_some());
        assert_eq!(
            f.sink.events(),
            vec![ExchangeEvent::MsgIdAssigned {
                remote: remote(),
                token: MsgToken::new(&[0x42]),
                msg_id,
            }]
        );
    }

    #[test]
    fn ack_confirms_and_clears_the_transfer() {
        let f = fixture(CalmParams);
        let mut msg = con_get(&[0x01]);
        f.engine.handle_outbound(&mut msg, remote());
        let msg_id = msg.msg_id().unwrap();

        let ack = Message::empty_ack(msg_id);
        assert_eq!(f.engine.handle_inbound(&ack, remote()), Disposition::Drop);

        assert_eq!(f.engine.transfer_count(), 0);
        assert_eq!(
            f.engine.msg_id_for_token(remote(), MsgToken::new(&[0x01])),
            None
        );
        assert!(f.sink.events().contains(&ExchangeEvent::EmptyAckReceived {
            remote: remote(),
            token: MsgToken::new(&[0x01]),
            msg_id,
        }));

        // No retransmission happens afterwards, even without the initial
        // write: the transfer is confirmed.
        sleep(Duration::from_millis(1200));
        assert_eq!(f.transport.sent_count(), 0);
    }

    #[test]
    fn piggy_backed_ack_continues_to_dispatch() {
        let f = fixture(CalmParams);
        let mut msg = con_get(&[0x02]);
        f.engine.handle_outbound(&mut msg, remote());
        let msg_id = msg.msg_id().unwrap();

        let response = Message::response(MsgType::Ack, MsgCode::SuccessContent)
            .with_msg_id(msg_id)
            .with_token(MsgToken::new(&[0x02]));
        assert_eq!(
            f.engine.handle_inbound(&response, remote()),
            Disposition::Continue
        );
        assert_eq!(f.engine.transfer_count(), 0);
    }

    #[test]
    fn unmatched_ack_is_dropped() {
        let f = fixture(CalmParams);
        let ack = Message::empty_ack(0x1234);
        assert_eq!(f.engine.handle_inbound(&ack, remote()), Disposition::Drop);
        assert!(f.sink.events().is_empty());
    }

    #[test]
    fn retransmissions_follow_until_timeout() {
        let f = fixture(FastParams);
        let mut msg = con_get(&[0x03]);
        f.engine.handle_outbound(&mut msg, remote());

        // ACK_TIMEOUT is 50ms: retransmits land around 50-75, 100-150,
        // 200-300, 400-600ms after start, with the final grace period
        // elapsing no later than 600ms after that.
        sleep(Duration::from_millis(2500));

        assert_eq!(f.transport.sent_count(), 4);
        let events = f.sink.events();
        let retransmits = events
            .iter()
            .filter(|e| matches!(e, ExchangeEvent::MessageRetransmitted { .. }))
            .count();
        assert_eq!(retransmits, 4);
        assert!(matches!(
            events.last(),
            Some(ExchangeEvent::TransmissionTimeout { .. })
        ));

        // Clearing the table is the event pipeline's job.
        f.engine.handle_event(events.last().unwrap());
        assert_eq!(f.engine.transfer_count(), 0);
    }

    #[test]
    fn write_failure_surfaces_as_misc_error() {
        let f = fixture(FastParams);
        f.transport.set_fail_writes(true);

        let mut msg = con_get(&[0x04]);
        f.engine.handle_outbound(&mut msg, remote());

        sleep(Duration::from_millis(200));

        let events = f.sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            ExchangeEvent::MiscError { description, .. }
                if description.starts_with("message could not be sent")
        )));
    }

    #[test]
    fn non_request_gets_a_bare_entry() {
        let f = fixture(CalmParams);
        let mut msg =
            Message::request(MsgType::Non, MsgCode::MethodGet).with_token(MsgToken::new(&[0x05]));
        assert_eq!(f.engine.handle_outbound(&mut msg, remote()), Disposition::Continue);

        let msg_id = msg.msg_id().unwrap();
        assert!(f.engine.reliable_transfer(remote(), msg_id).is_none());
        assert_eq!(
            f.engine.msg_id_for_token(remote(), MsgToken::new(&[0x05])),
            Some(msg_id)
        );

        // Nothing is ever retransmitted for it.
        sleep(Duration::from_millis(200));
        assert_eq!(f.transport.sent_count(), 0);

        f.engine.release_token(remote(), MsgToken::new(&[0x05]));
        assert_eq!(f.engine.transfer_count(), 0);
    }

    #[test]
    fn notification_folding_replaces_the_payload_in_place() {
        let f = fixture(CalmParams);

        let token = MsgToken::new(&[0x06]);
        let mut first = Message::response(MsgType::Con, MsgCode::SuccessContent)
            .with_token(token)
            .with_observe(5)
            .with_payload(&b"state-1"[..]);
        assert_eq!(
            f.engine.handle_outbound(&mut first, remote()),
            Disposition::Continue
        );
        let msg_id = first.msg_id().unwrap();

        let mut second = Message::response(MsgType::Con, MsgCode::SuccessContent)
            .with_token(token)
            .with_observe(6)
            .with_payload(&b"state-2"[..]);
        assert_eq!(
            f.engine.handle_outbound(&mut second, remote()),
            Disposition::Drop
        );

        // Same transfer, same id; the next retransmission carries the new
        // payload with a bumped observe value.
        assert_eq!(f.engine.msg_id_for_token(remote(), token), Some(msg_id));

        sleep(Duration::from_millis(1500));
        let sent = f.transport.sent();
        assert!(!sent.is_empty());
        let (retransmitted, _) = &sent[0];
        assert_eq!(retransmitted.msg_id(), Some(msg_id));
        assert_eq!(retransmitted.payload(), b"state-2");
        assert!(retransmitted.observe().unwrap() > 6);
    }

    #[test]
    fn folding_misses_once_the_transfer_is_confirmed() {
        let f = fixture(CalmParams);

        let token = MsgToken::new(&[0x07]);
        let mut first = Message::response(MsgType::Con, MsgCode::SuccessContent)
            .with_token(token)
            .with_observe(1);
        f.engine.handle_outbound(&mut first, remote());
        let first_id = first.msg_id().unwrap();

        let ack = Message::empty_ack(first_id);
        f.engine.handle_inbound(&ack, remote());

        let mut second = Message::response(MsgType::Con, MsgCode::SuccessContent)
            .with_token(token)
            .with_observe(2);
        assert_eq!(
            f.engine.handle_outbound(&mut second, remote()),
            Disposition::Continue
        );
        assert_ne!(second.msg_id(), Some(first_id));
    }
}
