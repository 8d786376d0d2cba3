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

use crate::message::MsgId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-remote message-id allocation.
///
/// Message ids are only required to be unique per remote endpoint and per
/// datagram lifetime: an id handed out for a remote must not be reissued for
/// that remote until `EXCHANGE_LIFETIME` has elapsed, at which point any
/// state about the exchange it identified may have been purged on both ends.
///
/// Retirement is lazy. Each allocation records a deadline; expired deadlines
/// are collected at the head of the queue on the next allocation for the same
/// remote, so the pool needs no timer of its own and callers never notify it
/// about completed exchanges.
#[derive(Debug)]
pub(crate) struct MsgIdPool {
    exchange_lifetime: Duration,
    spaces: Mutex<HashMap<SocketAddr, IdSpace>>,
}

#[derive(Debug, Default)]
struct IdSpace {
    next_candidate: MsgId,
    reserved: HashSet<MsgId>,
    // Deadlines are pushed in allocation order with a constant lifetime, so
    // the queue is always sorted.
    retirements: VecDeque<(Instant, MsgId)>,
}

impl IdSpace {
    fn retire_expired(&mut self, now: Instant) {
        while let Some(&(deadline, msg_id)) = self.retirements.front() {
            if deadline > now {
                break;
            }
            self.retirements.pop_front();
            self.reserved.remove(&msg_id);
        }
    }
}

impl MsgIdPool {
    pub(crate) fn new(exchange_lifetime: Duration) -> MsgIdPool {
        MsgIdPool {
            exchange_lifetime,
            spaces: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves and returns the next free message id for `remote`, or `None`
    /// if all 65536 ids for that remote are currently within their exchange
    /// lifetime.
    ///
    /// The candidate cursor rolls forward through the id space rather than
    /// reusing the lowest free value, so an id that just retired is not
    /// immediately handed out again.
    pub(crate) fn next_id(&self, remote: SocketAddr) -> Option<MsgId> {
        let now = Instant::now();
        let mut spaces = self.spaces.lock().expect("Lock failed");
        let space = spaces.entry(remote).or_default();

        space.retire_expired(now);

        if space.reserved.len() > MsgId::MAX as usize {
            warn!("Message id space for {} is saturated", remote);
            return None;
        }

        let mut candidate = space.next_candidate;
        while space.reserved.contains(&candidate) {
            candidate = candidate.wrapping_add(1);
        }

        space.reserved.insert(candidate);
        space
            .retirements
            .push_back((now + self.exchange_lifetime, candidate));
        space.next_candidate = candidate.wrapping_add(1);

        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn remote() -> SocketAddr {
        "10.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn ids_are_unique_and_rolling() {
        let pool = MsgIdPool::new(Duration::from_secs(247));

        let a = pool.next_id(remote()).unwrap();
        let b = pool.next_id(remote()).unwrap();
        let c = pool.next_id(remote()).unwrap();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(b, a.wrapping_add(1));
        assert_eq!(c, b.wrapping_add(1));
    }

    #[test]
    fn remotes_have_independent_spaces() {
        let pool = MsgIdPool::new(Duration::from_secs(247));
        let other: SocketAddr = "10.0.0.2:5683".parse().unwrap();

        let a = pool.next_id(remote()).unwrap();
        let b = pool.next_id(other).unwrap();

        // Both spaces start from the same cursor.
        assert_eq!(a, b);
    }

    #[test]
    fn every_id_is_issued_once_before_saturation() {
        // Lifetime far longer than the fill loop takes, so nothing retires
        // mid-test.
        let pool = MsgIdPool::new(Duration::from_secs(60));

        let mut seen = HashSet::new();
        for _ in 0..=MsgId::MAX as usize {
            let id = pool.next_id(remote()).expect("space exhausted early");
            assert!(seen.insert(id), "id reissued within lifetime");
        }
        assert_eq!(pool.next_id(remote()), None);
    }

    #[test]
    fn saturation_clears_after_retirement() {
        let pool = MsgIdPool::new(Duration::from_secs(2));

        for _ in 0..=MsgId::MAX as usize {
            assert!(pool.next_id(remote()).is_some());
        }
        assert_eq!(pool.next_id(remote()), None);

        sleep(Duration::from_millis(2500));
        assert!(pool.next_id(remote()).is_some());
    }
}
