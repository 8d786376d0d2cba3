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

use std::time::Duration;

/// Trait defining [CoAP transmission parameters][tp].
///
/// The exchange layer is generic over this trait; substituting an
/// implementation with shortened timings is how the integration tests keep
/// retransmission scenarios in the millisecond range.
///
/// [tp]: https://tools.ietf.org/html/rfc7252#section-4.8
pub trait TransParams: Default + Copy + Sync + Send + Unpin + 'static {
    /// Number of retransmissions attempted before giving up on a confirmable message.
    fn coap_max_retransmit(&self) -> u32 {
        Self::COAP_MAX_RETRANSMIT
    }

    /// Base delay before the first retransmission.
    fn coap_ack_timeout(&self) -> Duration {
        Self::COAP_ACK_TIMEOUT
    }

    /// Upper bound of the retransmission jitter, as a factor of the base delay.
    fn coap_ack_random_factor(&self) -> f32 {
        Self::COAP_ACK_RANDOM_FACTOR
    }

    /// How long a message id stays reserved after being handed out.
    fn coap_exchange_lifetime(&self) -> Duration {
        Self::COAP_EXCHANGE_LIFETIME
    }

    /// The maximum token length the token pool will grow to.
    fn max_token_length(&self) -> usize {
        Self::MAX_TOKEN_LENGTH
    }

    /// `MAX_RETRANSMIT` from RFC 7252 §4.8.
    const COAP_MAX_RETRANSMIT: u32 = 4;

    /// `ACK_TIMEOUT` from RFC 7252 §4.8.
    const COAP_ACK_TIMEOUT: Duration = Duration::from_secs(2);

    /// `ACK_RANDOM_FACTOR` from RFC 7252 §4.8.
    const COAP_ACK_RANDOM_FACTOR: f32 = 1.5;

    /// The maximum number of bytes in a message token.
    const MAX_TOKEN_LENGTH: usize = 8;

    /// From RFC7252:
    ///
    /// > `MAX_LATENCY` is the maximum time a datagram is expected to take
    /// > from the start of its transmission to the completion of its
    /// > reception. [...] We, also arbitrarily, define `MAX_LATENCY` to be
    /// > 100 seconds.
    const COAP_MAX_LATENCY: Duration = Duration::from_secs(100);

    /// From RFC7252:
    ///
    /// > `PROCESSING_DELAY` is the time a node takes to turn around a
    /// > Confirmable message into an acknowledgement.  We assume the node
    /// > will attempt to send an ACK before having the sender time out, so as
    /// > a conservative assumption we set it equal to `ACK_TIMEOUT`.
    const COAP_PROCESSING_DELAY: Duration = Self::COAP_ACK_TIMEOUT;

    /// From RFC7252:
    ///
    /// > `MAX_TRANSMIT_SPAN` is the maximum time from the first transmission
    /// > of a Confirmable message to its last retransmission.  For the
    /// > default transmission parameters, the value is (2+4+8+16)*1.5 = 45
    /// > seconds, or more generally:
    /// >
    /// >> `ACK_TIMEOUT * ((2 ** MAX_RETRANSMIT) - 1) * ACK_RANDOM_FACTOR`
    const COAP_MAX_TRANSMIT_SPAN: Duration = Duration::from_millis(
        (Self::COAP_ACK_TIMEOUT.as_millis() as f32
            * ((1u64 << Self::COAP_MAX_RETRANSMIT) - 1) as f32
            * Self::COAP_ACK_RANDOM_FACTOR) as u64,
    );

    /// From RFC7252:
    ///
    /// > `EXCHANGE_LIFETIME` is the time from starting to send a Confirmable
    /// > message to the time when an acknowledgement is no longer expected,
    /// > i.e., message-layer information about the message exchange can be
    /// > purged.  `EXCHANGE_LIFETIME` includes a `MAX_TRANSMIT_SPAN`, a
    /// > `MAX_LATENCY` forward, `PROCESSING_DELAY`, and a `MAX_LATENCY` for
    /// > the way back. [...] In this case, `EXCHANGE_LIFETIME` simplifies to:
    /// >
    /// >> `MAX_TRANSMIT_SPAN + (2 * MAX_LATENCY) + PROCESSING_DELAY`
    /// >
    /// > or 247 seconds with the default transmission parameters.
    ///
    /// A message id handed out for a given remote must not be reissued for
    /// that remote until this much time has elapsed.
    const COAP_EXCHANGE_LIFETIME: Duration = Duration::from_millis(
        Self::COAP_MAX_TRANSMIT_SPAN.as_millis() as u64
            + 2 * Self::COAP_MAX_LATENCY.as_millis() as u64
            + Self::COAP_PROCESSING_DELAY.as_millis() as u64,
    );

    /// Calculates the delay between retransmissions. `attempt` is zero-based, so a value of
    /// 1 represents the duration to wait between the transmission of the first packet and the
    /// second packet.
    ///
    /// Attempts past `COAP_MAX_RETRANSMIT` clamp to the final backoff slot,
    /// which is also the wait observed after the last retransmission before
    /// the exchange is declared timed out.
    fn calc_retransmit_duration(&self, mut attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_secs(0);
        }

        if attempt > self.coap_max_retransmit() {
            attempt = self.coap_max_retransmit();
        }

        attempt -= 1;

        let ret = (self.coap_ack_timeout().as_millis() as u64) << attempt;

        const JDIV: u64 = 512u64;
        let rmod: u64 = (JDIV as f32 * (Self::COAP_ACK_RANDOM_FACTOR - 1.0)) as u64;
        let jmul = JDIV + rand::random::<u64>() % rmod;

        Duration::from_millis(ret * jmul / JDIV)
    }
}

/// Set of the standard transmission parameters as recommended by [IETF-RFC7252 Section 4.8].
///
/// [IETF-RFC7252 Section 4.8]: https://tools.ietf.org/html/rfc7252#section-4.8
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StandardCoapConstants;

impl TransParams for StandardCoapConstants {}

impl Default for StandardCoapConstants {
    fn default() -> Self {
        StandardCoapConstants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_constants() {
        assert_eq!(
            StandardCoapConstants::COAP_MAX_TRANSMIT_SPAN,
            Duration::from_secs(45)
        );
        assert_eq!(
            StandardCoapConstants::COAP_EXCHANGE_LIFETIME,
            Duration::from_secs(247)
        );
    }

    #[test]
    fn retransmit_durations_fall_in_jitter_window() {
        let params = StandardCoapConstants;

        assert_eq!(
            params.calc_retransmit_duration(0),
            Duration::from_secs(0)
        );

        for _ in 0..32 {
            let d1 = params.calc_retransmit_duration(1);
            assert!(d1 >= Duration::from_secs(2) && d1 < Duration::from_secs(3));

            let d2 = params.calc_retransmit_duration(2);
            assert!(d2 >= Duration::from_secs(4) && d2 < Duration::from_secs(6));

            // Past the last retransmission the delay clamps to the final slot.
            let d5 = params.calc_retransmit_duration(5);
            assert!(d5 >= Duration::from_secs(16) && d5 < Duration::from_secs(24));
        }
    }
}
