//! Per-connection reliability state.
//!
//! Pure bookkeeping: the driver feeds it datagrams and the clock, and it
//! answers with datagrams to put on the wire and frames to deliver. No
//! socket access happens here.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use skein_core::{BufferPool, Packet, PooledBuffer};

use super::datagram::{self, Kind, HEADER_SIZE};
use crate::connection::ConnectionId;
use crate::wire::now_micros;

/// Out-of-order datagrams buffered ahead of the next expected sequence.
pub const RECEIVE_WINDOW: usize = 256;

/// Resends of one datagram before the link is considered dead.
pub const MAX_RESENDS: u32 = 10;

/// Lower bound of the retransmit timeout.
pub const MIN_RTO: Duration = Duration::from_millis(50);

/// Upper bound of the retransmit timeout.
pub const MAX_RTO: Duration = Duration::from_millis(1000);

const INITIAL_RTO: Duration = Duration::from_millis(200);

struct InFlight {
    datagram: PooledBuffer,
    sent_at: Instant,
    resends: u32,
}

/// Reliable ordered channel to one remote address.
pub struct ReliableLink {
    id: ConnectionId,
    address: SocketAddr,
    next_send: u32,
    next_recv: u32,
    in_flight: BTreeMap<u32, InFlight>,
    window: Vec<Option<Packet>>,
    /// Smoothed ack round trip (Jacobson/Karels), `None` before the first sample.
    srtt: Option<Duration>,
    rttvar: Duration,
    /// Ping-measured round trip exposed to the application.
    rtt_ms: u32,
    last_heard: Instant,
    last_ping: Instant,
}

impl ReliableLink {
    /// Creates a link that has just been heard from.
    #[must_use]
    pub fn new(id: ConnectionId, address: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            address,
            next_send: 0,
            next_recv: 0,
            in_flight: BTreeMap::new(),
            window: (0..RECEIVE_WINDOW).map(|_| None).collect(),
            srtt: None,
            rttvar: Duration::ZERO,
            rtt_ms: 0,
            last_heard: now,
            last_ping: now,
        }
    }

    /// Connection id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Smoothed ping round trip in milliseconds, 0 before the first pong.
    #[inline]
    #[must_use]
    pub const fn round_trip_time(&self) -> u32 {
        self.rtt_ms
    }

    /// Datagrams sent but not yet acknowledged.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Current retransmit timeout.
    #[must_use]
    pub fn rto(&self) -> Duration {
        self.srtt
            .map_or(INITIAL_RTO, |srtt| srtt + self.rttvar * 4)
            .clamp(MIN_RTO, MAX_RTO)
    }

    /// Records that the remote was heard from.
    #[inline]
    pub fn heard(&mut self, now: Instant) {
        self.last_heard = now;
    }

    /// Returns true once the remote has been silent for `timeout`.
    #[must_use]
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heard) >= timeout
    }

    /// Sends `frame` as the next reliable datagram and keeps a copy for
    /// resends.
    pub fn send_data(
        &mut self,
        pool: &BufferPool,
        frame: &[u8],
        now: Instant,
        out: &mut impl FnMut(&[u8]),
    ) {
        let seq = self.next_send;
        self.next_send = self.next_send.wrapping_add(1);

        let mut datagram = pool.rent(HEADER_SIZE + frame.len());
        datagram::write_header(datagram.as_mut_vec(), Kind::Data, seq);
        datagram.extend_from_slice(frame);
        out(datagram.as_slice());

        self.in_flight.insert(
            seq,
            InFlight {
                datagram,
                sent_at: now,
                resends: 0,
            },
        );
    }

    /// Handles an acknowledgement.
    pub fn on_ack(&mut self, pool: &BufferPool, seq: u32, now: Instant) {
        let Some(acked) = self.in_flight.remove(&seq) else {
            return;
        };
        // Karn: resent datagrams give ambiguous samples.
        if acked.resends == 0 {
            self.sample_rtt(now.saturating_duration_since(acked.sent_at));
        }
        pool.give_back(acked.datagram);
    }

    fn sample_rtt(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if srtt > sample { srtt - sample } else { sample - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
    }

    /// Handles a `Data` datagram, delivering every frame that became
    /// in-order.
    ///
    /// Duplicates are re-acked; datagrams beyond the window are dropped
    /// unacked so the sender retries them later.
    pub fn on_data(
        &mut self,
        pool: &BufferPool,
        seq: u32,
        body: &[u8],
        out: &mut impl FnMut(&[u8]),
        deliver: &mut impl FnMut(Packet),
    ) {
        let ahead = seq.wrapping_sub(self.next_recv);
        if ahead >= u32::MAX / 2 {
            out(&datagram::control(Kind::Ack, seq, &[]));
            return;
        }
        if ahead as usize >= RECEIVE_WINDOW {
            tracing::trace!(id = %self.id, seq, "Datagram beyond receive window");
            return;
        }
        out(&datagram::control(Kind::Ack, seq, &[]));

        if ahead > 0 {
            let slot = &mut self.window[seq as usize % RECEIVE_WINDOW];
            if slot.is_none() {
                *slot = Some(Packet::copy_from(pool, body));
            }
            return;
        }

        deliver(Packet::copy_from(pool, body));
        self.next_recv = self.next_recv.wrapping_add(1);
        while let Some(packet) = self.window[self.next_recv as usize % RECEIVE_WINDOW].take() {
            deliver(packet);
            self.next_recv = self.next_recv.wrapping_add(1);
        }
    }

    /// Resends datagrams whose timeout elapsed.
    ///
    /// Returns false once a datagram has been resent [`MAX_RESENDS`] times
    /// without an ack.
    pub fn resend_due(&mut self, now: Instant, out: &mut impl FnMut(&[u8])) -> bool {
        let rto = self.rto();
        for entry in self.in_flight.values_mut() {
            let backoff = (rto * (1u32 << entry.resends.min(4))).min(MAX_RTO);
            if now.saturating_duration_since(entry.sent_at) < backoff {
                continue;
            }
            if entry.resends >= MAX_RESENDS {
                return false;
            }
            entry.resends += 1;
            entry.sent_at = now;
            out(entry.datagram.as_slice());
        }
        true
    }

    /// Sends a ping when `interval` has passed since the last one.
    pub fn ping_due(&mut self, now: Instant, interval: Duration, out: &mut impl FnMut(&[u8])) {
        if now.saturating_duration_since(self.last_ping) < interval {
            return;
        }
        self.last_ping = now;
        out(&datagram::control(Kind::Ping, 0, &now_micros().to_le_bytes()));
    }

    /// Folds a pong's echoed timestamp into the round-trip average.
    pub fn on_pong(&mut self, body: &[u8]) {
        let Ok(stamp) = <[u8; 8]>::try_from(body) else {
            return;
        };
        let sample = now_micros().saturating_sub(u64::from_le_bytes(stamp)) / 1000;
        let sample = u32::try_from(sample).unwrap_or(u32::MAX).max(1);
        self.rtt_ms = if self.rtt_ms == 0 {
            sample
        } else {
            ((u64::from(self.rtt_ms) * 7 + u64::from(sample)) / 8).max(1) as u32
        };
    }

    /// Returns every buffer held by the link to `pool`.
    pub fn release(self, pool: &BufferPool) {
        for (_, entry) in self.in_flight {
            pool.give_back(entry.datagram);
        }
        for packet in self.window.into_iter().flatten() {
            packet.release(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(now: Instant) -> ReliableLink {
        ReliableLink::new(ConnectionId(1), "127.0.0.1:9000".parse().unwrap(), now)
    }

    fn data(seq: u32, frame: &[u8]) -> (u32, Vec<u8>) {
        (seq, frame.to_vec())
    }

    #[test]
    fn test_in_order_delivery_with_reordering() {
        let pool = BufferPool::new();
        let mut link = link(Instant::now());
        let mut acks = Vec::new();
        let mut delivered = Vec::new();

        for (seq, frame) in [data(2, b"c"), data(0, b"a"), data(1, b"b"), data(3, b"d")] {
            link.on_data(
                &pool,
                seq,
                &frame,
                &mut |bytes| acks.push(datagram::parse(bytes).unwrap().1),
                &mut |packet| {
                    delivered.push(packet.as_slice().to_vec());
                    packet.release(&pool);
                },
            );
        }

        assert_eq!(delivered, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(acks, vec![2, 0, 1, 3]);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_duplicate_reacked_not_delivered() {
        let pool = BufferPool::new();
        let mut link = link(Instant::now());
        let mut acks = 0;
        let mut delivered = 0;

        for _ in 0..3 {
            link.on_data(&pool, 0, b"x", &mut |_| acks += 1, &mut |packet| {
                delivered += 1;
                packet.release(&pool);
            });
        }
        assert_eq!(delivered, 1);
        assert_eq!(acks, 3);
    }

    #[test]
    fn test_beyond_window_dropped() {
        let pool = BufferPool::new();
        let mut link = link(Instant::now());
        let mut acks = 0;
        link.on_data(&pool, RECEIVE_WINDOW as u32, b"far", &mut |_| acks += 1, &mut |packet| {
            packet.release(&pool);
        });
        assert_eq!(acks, 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_ack_clears_in_flight_and_samples_rtt() {
        let pool = BufferPool::new();
        let start = Instant::now();
        let mut link = link(start);
        let mut sent = Vec::new();

        link.send_data(&pool, b"\x01\x00hi", start, &mut |bytes| sent.push(bytes.to_vec()));
        assert_eq!(sent.len(), 1);
        assert_eq!(datagram::parse(&sent[0]), Some((Kind::Data, 0, &b"\x01\x00hi"[..])));
        assert_eq!(link.in_flight(), 1);

        link.on_ack(&pool, 0, start + Duration::from_millis(100));
        assert_eq!(link.in_flight(), 0);
        assert_eq!(pool.outstanding(), 0);
        // 100 ms + 4 * 50 ms
        assert_eq!(link.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_rto_clamped() {
        let pool = BufferPool::new();
        let start = Instant::now();
        let mut fast = link(start);
        fast.send_data(&pool, b"\x01\x00", start, &mut |_| {});
        fast.on_ack(&pool, 0, start);
        assert_eq!(fast.rto(), MIN_RTO);

        let mut slow = link(start);
        slow.send_data(&pool, b"\x01\x00", start, &mut |_| {});
        slow.on_ack(&pool, 0, start + Duration::from_secs(5));
        assert_eq!(slow.rto(), MAX_RTO);
    }

    #[test]
    fn test_link_dies_after_max_resends() {
        let pool = BufferPool::new();
        let mut now = Instant::now();
        let mut link = link(now);
        link.send_data(&pool, b"\x01\x00", now, &mut |_| {});

        let mut resends = 0;
        let mut alive = true;
        for _ in 0..=MAX_RESENDS {
            now += MAX_RTO;
            alive = link.resend_due(now, &mut |_| resends += 1);
        }
        assert!(!alive);
        assert_eq!(resends, MAX_RESENDS);

        link.release(&pool);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_idle_detection() {
        let start = Instant::now();
        let mut link = link(start);
        let timeout = Duration::from_secs(1);
        assert!(!link.is_idle(start + Duration::from_millis(999), timeout));
        assert!(link.is_idle(start + timeout, timeout));
        link.heard(start + timeout);
        assert!(!link.is_idle(start + timeout, timeout));
    }

    #[test]
    fn test_pong_updates_round_trip() {
        let mut link = link(Instant::now());
        assert_eq!(link.round_trip_time(), 0);
        link.on_pong(&now_micros().saturating_sub(20_000).to_le_bytes());
        assert!(link.round_trip_time() >= 20);
        link.on_pong(b"bad");
        assert!(link.round_trip_time() >= 20);
    }
}
