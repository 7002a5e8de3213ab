//! Sender half of a session: pulls stream data from the local source, keeps every
//!  unacknowledged packet (with its send timestamp) in a fixed-size circular buffer, and
//!  re-sends the oldest unacknowledged packet when its retransmission timeout expires.

use std::net::SocketAddr;
use std::sync::Arc;
use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::packet;
use crate::send_pipeline::SendPipeline;
use crate::stream_io::{DataSource, ReadOutcome};

struct InflightPacket {
    /// the exact wire bytes as originally sent - a retransmission repeats them unchanged
    wire_bytes: BytesMut,
    sent_at: Instant,
}

/// ```ascii
/// sender window
/// -------------------------
/// |  |  |  |  |  |  |  |  |
/// -------------------------
///  ^            ^
/// ack_rcvd     seq_sent
/// ```
///
/// `ack_rcvd` is the next sequence number the peer expects (initially 1), `seq_sent` the last
///  sequence number sent (initially 0). Inflight count is `seq_sent - ack_rcvd + 1`, and the
///  packet with sequence number `n` lives in slot `n mod window_size`.
pub struct SendWindow {
    config: Arc<SessionConfig>,
    peer_addr: SocketAddr,
    send_pipeline: Arc<SendPipeline>,
    source: Arc<dyn DataSource>,

    /// the highest cumulative ack received from the peer
    ack_rcvd: u32,
    /// the last sequence number handed to the wire
    seq_sent: u32,
    source_exhausted: bool,

    inflight: Vec<Option<InflightPacket>>,
}

impl SendWindow {
    pub fn new(
        config: Arc<SessionConfig>,
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        source: Arc<dyn DataSource>,
    ) -> SendWindow {
        let window_size = config.window_size as usize;
        SendWindow {
            config,
            peer_addr,
            send_pipeline,
            source,
            // the peer expects the first data packet to have sequence number 1
            ack_rcvd: 1,
            seq_sent: 0,
            source_exhausted: false,
            inflight: (0..window_size).map(|_| None).collect(),
        }
    }

    pub fn has_inflight(&self) -> bool {
        self.seq_sent >= self.ack_rcvd
    }

    pub fn reached_source_eof(&self) -> bool {
        self.source_exhausted
    }

    fn inflight_count(&self) -> u32 {
        self.seq_sent + 1 - self.ack_rcvd
    }

    fn slot(&self, sequence_number: u32) -> usize {
        (sequence_number % self.config.window_size) as usize
    }

    /// Apply a cumulative ack from the peer. Returns whether the window actually advanced -
    ///  stale and impossible ack numbers are ignored without any state change, so duplicated
    ///  acks are harmless.
    pub fn on_ack(&mut self, ack_number: u32) -> bool {
        if ack_number <= self.ack_rcvd {
            debug!("ignoring stale ack #{} from {:?} - already at #{}", ack_number, self.peer_addr, self.ack_rcvd);
            return false;
        }
        if ack_number > self.seq_sent + 1 {
            debug!("ignoring ack #{} from {:?} beyond anything sent (last sent #{})", ack_number, self.peer_addr, self.seq_sent);
            return false;
        }

        for acked in self.ack_rcvd..ack_number {
            let slot = self.slot(acked);
            self.inflight[slot] = None;
        }
        self.ack_rcvd = ack_number;
        trace!("ack advanced to #{} for {:?}", self.ack_rcvd, self.peer_addr);
        true
    }

    /// Pull from the data source while there is window space, sending one data packet per
    ///  chunk. When the source reports exhaustion, a zero-payload EOF marker takes the next
    ///  sequence number and the window stops pulling for good.
    ///
    /// `piggyback_ack` is the receiving side's current cumulative ack, carried in the ack
    ///  field of every outgoing data packet.
    pub async fn fill_window(&mut self, piggyback_ack: u32) -> anyhow::Result<()> {
        if self.source_exhausted {
            trace!("data source for {:?} already exhausted - nothing to pull", self.peer_addr);
            return Ok(());
        }

        while self.inflight_count() < self.config.window_size {
            match self.source.read_chunk(packet::MAX_PAYLOAD_LEN).await {
                ReadOutcome::NotReady => {
                    return Ok(());
                }
                ReadOutcome::Exhausted => {
                    debug!("data source for {:?} exhausted - sending EOF marker", self.peer_addr);
                    self.source_exhausted = true;
                    self.send_next_data_packet(&[], piggyback_ack).await?;
                    return Ok(());
                }
                ReadOutcome::Chunk(data) => {
                    if data.is_empty() {
                        // an empty chunk would go out as a spurious EOF marker
                        warn!("data source for {:?} returned an empty chunk - treating as not ready", self.peer_addr);
                        return Ok(());
                    }
                    self.send_next_data_packet(&data, piggyback_ack).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_next_data_packet(&mut self, payload: &[u8], piggyback_ack: u32) -> anyhow::Result<()> {
        let sequence_number = self.seq_sent + 1;
        let buf = packet::encode_data(sequence_number, piggyback_ack, payload)?;

        trace!("sending data packet #{} ({} payload bytes) to {:?}", sequence_number, payload.len(), self.peer_addr);

        let slot = self.slot(sequence_number);
        self.inflight[slot] = Some(InflightPacket {
            wire_bytes: buf,
            sent_at: Instant::now(),
        });
        self.seq_sent = sequence_number;

        let stored = self.inflight[slot].as_ref()
            .expect("packet was stored just above");
        self.send_pipeline.do_send_packet(self.peer_addr, &stored.wire_bytes).await
    }

    /// Timer-driven retransmission: if the oldest unacknowledged packet has been waiting for
    ///  at least the configured timeout, re-send exactly it and refresh its timestamp. At most
    ///  one packet is re-sent per tick.
    pub async fn retransmit_expired(&mut self) -> anyhow::Result<()> {
        if !self.has_inflight() {
            return Ok(());
        }

        let slot = self.slot(self.ack_rcvd);
        let Some(oldest) = &mut self.inflight[slot] else {
            warn!("inflight bookkeeping out of sync: no buffered packet for #{}", self.ack_rcvd);
            return Ok(());
        };

        if oldest.sent_at.elapsed() < self.config.retransmit_timeout {
            return Ok(());
        }

        debug!("retransmission timeout expired for packet #{} to {:?} - resending", self.ack_rcvd, self.peer_addr);
        oldest.sent_at = Instant::now();
        self.send_pipeline.do_send_packet(self.peer_addr, &oldest.wire_bytes).await
    }
}
