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

use crate::message::MsgToken;
use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

/// Client-wide token allocation.
///
/// Tokens correlate a response with the request that caused it, so they must
/// be unique among all live exchanges of this client (tokens are not scoped
/// per remote). The pool prefers short tokens: it mints one-byte values
/// first and only grows the length once every shorter value is in use.
///
/// The empty token is reserved for CoAP ping and is never minted here.
#[derive(Debug)]
pub(crate) struct TokenPool {
    max_len: usize,
    inner: Mutex<TokenPoolInner>,
}

#[derive(Debug)]
struct TokenPoolInner {
    live: HashSet<MsgToken>,
    // Released tokens, kept sorted so the smallest is reused first. Every
    // entry sorts below the mint cursor.
    free: BTreeSet<MsgToken>,
    next_len: usize,
    next_value: u128,
}

fn encode_token(len: usize, value: u128) -> MsgToken {
    let mut bytes = [0u8; MsgToken::MAX_LENGTH];
    for (i, byte) in bytes[..len].iter_mut().enumerate() {
        *byte = (value >> (8 * (len - 1 - i))) as u8;
    }
    MsgToken::new(&bytes[..len])
}

impl TokenPool {
    pub(crate) fn new(max_len: usize) -> TokenPool {
        debug_assert!(max_len >= 1 && max_len <= MsgToken::MAX_LENGTH);
        TokenPool {
            max_len,
            inner: Mutex::new(TokenPoolInner {
                live: HashSet::new(),
                free: BTreeSet::new(),
                next_len: 1,
                next_value: 0,
            }),
        }
    }

    /// Returns an unused token, preferring the smallest available one, or
    /// `None` if every token up to the configured maximum length is live.
    pub(crate) fn acquire(&self) -> Option<MsgToken> {
        let mut inner = self.inner.lock().expect("Lock failed");

        let reusable = inner.free.iter().next().copied();
        if let Some(token) = reusable {
            inner.free.remove(&token);
            inner.live.insert(token);
            return Some(token);
        }

        while inner.next_len <= self.max_len {
            if inner.next_value >> (8 * inner.next_len as u32) != 0 {
                inner.next_len += 1;
                inner.next_value = 0;
                continue;
            }

            let token = encode_token(inner.next_len, inner.next_value);
            inner.next_value += 1;
            debug_assert!(!inner.live.contains(&token));
            inner.live.insert(token);
            return Some(token);
        }

        warn!("Token pool exhausted at maximum length {}", self.max_len);
        None
    }

    /// Returns `token` to the free pool.
    ///
    /// Releasing a token that is not currently live is a no-op; it indicates
    /// a benign race with another terminal event on the same exchange.
    pub(crate) fn release(&self, token: MsgToken) {
        let mut inner = self.inner.lock().expect("Lock failed");

        if !inner.live.remove(&token) {
            warn!("Released unknown token {}", token);
            return;
        }
        inner.free.insert(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_smallest_tokens_first() {
        let pool = TokenPool::new(8);

        assert_eq!(pool.acquire(), Some(MsgToken::new(&[0x00])));
        assert_eq!(pool.acquire(), Some(MsgToken::new(&[0x01])));
        assert_eq!(pool.acquire(), Some(MsgToken::new(&[0x02])));
    }

    #[test]
    fn released_tokens_are_reused_smallest_first() {
        let pool = TokenPool::new(8);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();

        pool.release(c);
        pool.release(a);

        // Both a and c are free; a is smaller and comes back first.
        assert_eq!(pool.acquire(), Some(a));
        assert_eq!(pool.acquire(), Some(c));

        // b is still live the whole time.
        let next = pool.acquire().unwrap();
        assert_ne!(next, b);
    }

    #[test]
    fn releasing_unknown_token_is_a_noop() {
        let pool = TokenPool::new(8);

        pool.release(MsgToken::new(&[0xAA]));
        assert_eq!(pool.acquire(), Some(MsgToken::new(&[0x00])));
    }

    #[test]
    fn grows_length_on_demand() {
        let pool = TokenPool::new(2);

        for _ in 0..256 {
            assert_eq!(pool.acquire().unwrap().len(), 1);
        }
        assert_eq!(pool.acquire(), Some(MsgToken::new(&[0x00, 0x00])));
        assert_eq!(pool.acquire(), Some(MsgToken::new(&[0x00, 0x01])));
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = TokenPool::new(1);

        for _ in 0..256 {
            assert!(pool.acquire().is_some());
        }
        assert_eq!(pool.acquire(), None);

        pool.release(MsgToken::new(&[0x7F]));
        assert_eq!(pool.acquire(), Some(MsgToken::new(&[0x7F])));
    }
}
