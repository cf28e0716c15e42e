//! Attribution of ICMP echo round trips to routes.
//!
//! When an echo request leaves through a single target, its fingerprint is
//! remembered together with that target. A matching reply (source and
//! destination swapped, same id and seq) yields the round trip time and a
//! hop count estimate, attributed to the peer which carried the reply back.
//! There is at most one outstanding fingerprint; a newer request simply
//! overwrites an unanswered one.

use tokio::time::Instant;

use crate::{data::MAX_TTL, inner_addr::InnerAddr, peer::Peer};

/// Identity of an ICMP echo exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoFingerprint {
    pub src: InnerAddr,
    pub dst: InnerAddr,
    pub id: u16,
    pub seq: u16,
}

/// A matched echo reply.
#[derive(Debug, Clone)]
pub struct PingMatch {
    /// The peer which delivered the reply.
    pub router: Peer,
    /// Hop count estimate derived from the reply's remaining TTL.
    pub hops: u8,
    /// Round trip time in milliseconds.
    pub rtt_ms: f64,
}

#[derive(Debug)]
struct Slot {
    fp: EchoFingerprint,
    router: Peer,
    at: Instant,
}

/// Single-slot cache of the last outstanding echo request.
#[derive(Debug, Default)]
pub struct PingCache {
    slot: Option<Slot>,
}

impl PingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an outgoing echo request and the router it was handed to.
    pub fn init(&mut self, fp: EchoFingerprint, router: Peer) {
        self.slot = Some(Slot {
            fp,
            router,
            at: Instant::now(),
        });
    }

    /// Try to match an incoming echo reply against the stored request.
    ///
    /// `fp` is the reply's fingerprint, `carrier` the peer it arrived from
    /// and `ttl` its remaining TTL. A reply matches when its source equals
    /// the stored destination and vice versa, with equal id and seq; the
    /// carrier does not have to be the router the request left through. On a
    /// match the slot is cleared; a mismatch leaves it untouched.
    pub fn match_reply(
        &mut self,
        fp: &EchoFingerprint,
        carrier: &Peer,
        ttl: u8,
    ) -> Option<PingMatch> {
        let slot = self.slot.as_ref()?;
        if fp.src != slot.fp.dst
            || fp.dst != slot.fp.src
            || fp.id != slot.fp.id
            || fp.seq != slot.fp.seq
        {
            return None;
        }

        let rtt_ms = slot.at.elapsed().as_secs_f64() * 1000.0;
        self.slot = None;
        Some(PingMatch {
            router: carrier.clone(),
            hops: MAX_TTL - ttl + 1,
            rtt_ms,
        })
    }

    /// The router the outstanding request was handed to, if any.
    #[cfg(test)]
    fn pending_router(&self) -> Option<&Peer> {
        self.slot.as_ref().map(|s| &s.router)
    }
}
