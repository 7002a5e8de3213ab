//! Receiver half of a session: buffers data packets that arrive out of order (within the
//!  window), reassembles the contiguous prefix, hands it to the consumer subject to
//!  backpressure, and acknowledges cumulatively.

use std::cmp::min;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::packet;
use crate::send_pipeline::SendPipeline;
use crate::stream_io::StreamConsumer;

/// ```ascii
/// receiver window
/// -------------------------
/// |  |  |  |  |  |  |  |  |
/// -------------------------
///  ^            ^
/// ack_sent     seq_rcvd
/// ```
///
/// `ack_sent` is the next sequence number expected from the peer (initially 1), `seq_rcvd`
///  the highest sequence number received so far (initially 0). Only sequence numbers in
///  `[ack_sent, ack_sent + window_size)` may be buffered, each payload in slot
///  `n mod window_size`, and `ack_sent` advances only past packets that were delivered to the
///  consumer completely.
pub struct ReceiveWindow {
    config: Arc<SessionConfig>,
    peer_addr: SocketAddr,
    send_pipeline: Arc<SendPipeline>,
    consumer: Arc<dyn StreamConsumer>,

    /// the highest sequence number received so far
    seq_rcvd: u32,
    /// the cumulative ack most recently sent to the peer, i.e. the next expected sequence number
    ack_sent: u32,
    eof_rcvd: bool,

    /// bytes of the packet at the front of the window already handed to the consumer by an
    ///  earlier, partial delivery
    front_bytes_delivered: usize,

    /// received-but-undelivered payloads; `Some` doubles as the validity flag
    buffered: Vec<Option<Vec<u8>>>,
}

impl ReceiveWindow {
    pub fn new(
        config: Arc<SessionConfig>,
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        consumer: Arc<dyn StreamConsumer>,
    ) -> ReceiveWindow {
        let window_size = config.window_size as usize;
        ReceiveWindow {
            config,
            peer_addr,
            send_pipeline,
            consumer,
            seq_rcvd: 0,
            // the first data packet is expected to have sequence number 1
            ack_sent: 1,
            eof_rcvd: false,
            front_bytes_delivered: 0,
            buffered: (0..window_size).map(|_| None).collect(),
        }
    }

    pub fn last_ack_sent(&self) -> u32 {
        self.ack_sent
    }

    pub fn eof_received(&self) -> bool {
        self.eof_rcvd
    }

    /// true while buffered packets exist that were not (fully) delivered to the consumer yet
    pub fn has_undelivered(&self) -> bool {
        self.ack_sent <= self.seq_rcvd
    }

    fn slot(&self, sequence_number: u32) -> usize {
        (sequence_number % self.config.window_size) as usize
    }

    /// Handle a validated inbound data packet.
    ///
    /// Out-of-window, duplicate and post-EOF packets are dropped without state change, but
    ///  answered with an ack of the current position so a peer whose ack got lost can
    ///  resynchronize. An EOF marker is only accepted once no gap precedes it; until then it
    ///  too is dropped (the peer's retransmission timer re-delivers it later).
    pub async fn on_data_packet(&mut self, sequence_number: u32, payload: &[u8]) -> anyhow::Result<()> {
        let window_end = self.ack_sent + self.config.window_size;
        if sequence_number < self.ack_sent || sequence_number >= window_end {
            debug!("dropping data packet #{} from {:?} - outside window [{}, {})", sequence_number, self.peer_addr, self.ack_sent, window_end);
            return self.send_current_ack().await;
        }
        if self.buffered[self.slot(sequence_number)].is_some() {
            debug!("ignoring duplicate data packet #{} from {:?}", sequence_number, self.peer_addr);
            return self.send_current_ack().await;
        }
        if self.eof_rcvd {
            debug!("ignoring data packet #{} from {:?} - EOF already received", sequence_number, self.peer_addr);
            return self.send_current_ack().await;
        }

        if payload.is_empty() {
            // EOF marker
            if self.ack_sent < self.seq_rcvd {
                debug!("holding back EOF marker #{} from {:?} - still waiting for #{}", sequence_number, self.peer_addr, self.ack_sent);
                return self.send_current_ack().await;
            }

            debug!("received EOF marker #{} from {:?}", sequence_number, self.peer_addr);
            self.eof_rcvd = true;
            self.consumer.on_end_of_stream().await?;

            let ack = self.ack_sent + 1;
            self.send_ack(ack).await?;
            self.ack_sent = ack;
            return Ok(());
        }

        trace!("buffering data packet #{} ({} payload bytes) from {:?}", sequence_number, payload.len(), self.peer_addr);
        let slot = self.slot(sequence_number);
        self.buffered[slot] = Some(payload.to_vec());
        if sequence_number > self.seq_rcvd {
            self.seq_rcvd = sequence_number;
        }

        self.flush_to_consumer().await
    }

    /// Hand the contiguous prefix of buffered packets to the consumer, bounded by the space
    ///  the consumer currently offers. A packet the consumer accepted only partially stays
    ///  buffered (with the delivered byte count recorded) and unacknowledged. All packets
    ///  fully delivered in one flush are covered by a single cumulative ack.
    pub async fn flush_to_consumer(&mut self) -> anyhow::Result<()> {
        let mut delivered_packets = 0u32;

        loop {
            let slot = self.slot(self.ack_sent + delivered_packets);
            let Some(payload) = self.buffered[slot].take() else {
                break;
            };

            let offset = self.front_bytes_delivered;
            let space = self.consumer.available_space().await;
            if space == 0 {
                self.buffered[slot] = Some(payload);
                break;
            }

            let attempt = min(space, payload.len() - offset);
            let accepted = self.consumer.accept(&payload[offset..offset + attempt]).await?;

            if offset + accepted < payload.len() {
                // partial delivery - the packet stays at the front of the window
                trace!("consumer accepted {} of {} remaining bytes of packet #{}", accepted, payload.len() - offset, self.ack_sent + delivered_packets);
                self.front_bytes_delivered = offset + accepted;
                self.buffered[slot] = Some(payload);
                break;
            }

            self.front_bytes_delivered = 0;
            delivered_packets += 1;
        }

        if delivered_packets > 0 {
            let ack = self.ack_sent + delivered_packets;
            trace!("delivered {} packet(s) to the consumer - acknowledging up to #{}", delivered_packets, ack);
            self.send_ack(ack).await?;
            self.ack_sent = ack;
        }
        Ok(())
    }

    /// Re-send the current cumulative ack without advancing it - the courtesy ack answering
    ///  dropped or invalid packets.
    pub async fn send_current_ack(&self) -> anyhow::Result<()> {
        self.send_ack(self.ack_sent).await
    }

    async fn send_ack(&self, ack_number: u32) -> anyhow::Result<()> {
        trace!("sending ack #{} to {:?}", ack_number, self.peer_addr);
        let buf = packet::encode_ack(ack_number);
        self.send_pipeline.do_send_packet(self.peer_addr, &buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_pipeline::MockSendSocket;
    use crate::stream_io::MockStreamConsumer;
    use mockall::Sequence;
    use rstest::*;
    use std::time::Duration;
    use tokio::runtime::Builder;

    const PEER: ([u8; 4], u16) = ([1, 2, 3, 4], 9);

    fn test_config() -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            window_size: 4,
            retransmit_timeout: Duration::from_millis(100),
            timer_tick_interval: Duration::from_millis(20),
        })
    }

    fn receive_window(send_socket: MockSendSocket, consumer: MockStreamConsumer) -> ReceiveWindow {
        ReceiveWindow::new(
            test_config(),
            SocketAddr::from(PEER),
            Arc::new(SendPipeline::new(Arc::new(send_socket))),
            Arc::new(consumer),
        )
    }

    fn expect_ack(send_socket: &mut MockSendSocket, seq: &mut Sequence, ack_number: u32) {
        let expected = packet::encode_ack(ack_number);
        send_socket.expect_do_send_packet()
            .once()
            .in_sequence(seq)
            .withf(move |addr, buf| addr == &SocketAddr::from(PEER) && buf == expected.as_ref())
            .returning(|_, _| Ok(()));
    }

    /// a consumer that accepts everything it is offered
    fn greedy_consumer() -> MockStreamConsumer {
        let mut consumer = MockStreamConsumer::new();
        consumer.expect_available_space().returning(|| usize::MAX);
        consumer.expect_accept().returning(|data| Ok(data.len()));
        consumer
    }

    #[rstest]
    #[case::below_window(5, 3)]
    #[case::at_window_end(5, 9)]
    #[case::far_beyond(5, 100)]
    fn test_drop_out_of_window_sends_courtesy_ack(#[case] ack_sent: u32, #[case] seq: u32) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sequence = Sequence::new();
            let mut send_socket = MockSendSocket::new();
            expect_ack(&mut send_socket, &mut sequence, ack_sent);

            let mut window = receive_window(send_socket, MockStreamConsumer::new());
            window.ack_sent = ack_sent;
            window.seq_rcvd = ack_sent - 1;

            window.on_data_packet(seq, &[1]).await.unwrap();
            assert_eq!(window.ack_sent, ack_sent);
        });
    }

    #[rstest]
    fn test_duplicate_is_dropped_with_courtesy_ack() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sequence = Sequence::new();
            let mut send_socket = MockSendSocket::new();
            expect_ack(&mut send_socket, &mut sequence, 1);

            // #2 buffered out of order, then #2 again
            let mut window = receive_window(send_socket, MockStreamConsumer::new());
            window.buffered[2] = Some(vec![1, 2]);
            window.seq_rcvd = 2;

            window.on_data_packet(2, &[1, 2]).await.unwrap();
            assert_eq!(window.ack_sent, 1);
        });
    }

    #[rstest]
    fn test_in_order_delivery_with_cumulative_ack() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            // #2 and #3 arrive first and are buffered silently except for the ack traffic;
            //  once #1 closes the gap, all three go out with one cumulative ack
            let mut sequence = Sequence::new();
            let mut send_socket = MockSendSocket::new();
            expect_ack(&mut send_socket, &mut sequence, 4);

            let mut consumer = MockStreamConsumer::new();
            consumer.expect_available_space().returning(|| usize::MAX);
            let mut consumer_seq = Sequence::new();
            for expected in [vec![1u8], vec![2, 2], vec![3, 3, 3]] {
                consumer.expect_accept()
                    .once()
                    .in_sequence(&mut consumer_seq)
                    .withf(move |data| data == expected.as_slice())
                    .returning(|data| Ok(data.len()));
            }

            let mut window = receive_window(send_socket, consumer);
            window.buffered[2] = Some(vec![2, 2]);
            window.buffered[3] = Some(vec![3, 3, 3]);
            window.seq_rcvd = 3;

            window.on_data_packet(1, &[1]).await.unwrap();

            assert_eq!(window.ack_sent, 4);
            assert!(!window.has_undelivered());
            assert!(window.buffered.iter().all(|slot| slot.is_none()));
        });
    }

    #[rstest]
    fn test_partial_drain_three_bytes_at_a_time() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            // consumer space is limited to 3 bytes per attempt; a 10-byte packet drains as
            //  3 + 3 + 3 + 1, and the ack goes out only after the fourth flush
            let mut sequence = Sequence::new();
            let mut send_socket = MockSendSocket::new();
            expect_ack(&mut send_socket, &mut sequence, 2);

            let payload: Vec<u8> = (0..10).collect();

            let mut consumer = MockStreamConsumer::new();
            consumer.expect_available_space().returning(|| 3);
            let mut consumer_seq = Sequence::new();
            for expected in [vec![0u8, 1, 2], vec![3, 4, 5], vec![6, 7, 8], vec![9]] {
                consumer.expect_accept()
                    .once()
                    .in_sequence(&mut consumer_seq)
                    .withf(move |data| data == expected.as_slice())
                    .returning(|data| Ok(data.len()));
            }

            let mut window = receive_window(send_socket, consumer);
            window.on_data_packet(1, &payload).await.unwrap();
            assert_eq!(window.ack_sent, 1);
            assert_eq!(window.front_bytes_delivered, 3);

            window.flush_to_consumer().await.unwrap();
            assert_eq!(window.ack_sent, 1);
            assert_eq!(window.front_bytes_delivered, 6);

            window.flush_to_consumer().await.unwrap();
            assert_eq!(window.ack_sent, 1);
            assert_eq!(window.front_bytes_delivered, 9);

            window.flush_to_consumer().await.unwrap();
            assert_eq!(window.ack_sent, 2);
            assert_eq!(window.front_bytes_delivered, 0);
            assert!(!window.has_undelivered());
        });
    }

    #[rstest]
    fn test_no_space_leaves_packet_untouched() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut consumer = MockStreamConsumer::new();
            consumer.expect_available_space().returning(|| 0);

            let mut window = receive_window(MockSendSocket::new(), consumer);
            window.on_data_packet(1, &[1, 2, 3]).await.unwrap();

            assert_eq!(window.ack_sent, 1);
            assert_eq!(window.front_bytes_delivered, 0);
            assert!(window.buffered[1].is_some());
        });
    }

    #[rstest]
    fn test_eof_marker_accepted_when_no_gap() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sequence = Sequence::new();
            let mut send_socket = MockSendSocket::new();
            expect_ack(&mut send_socket, &mut sequence, 2); // ack for #1
            expect_ack(&mut send_socket, &mut sequence, 3); // ack for the EOF marker

            let mut consumer = greedy_consumer();
            consumer.expect_on_end_of_stream()
                .once()
                .returning(|| Ok(()));

            let mut window = receive_window(send_socket, consumer);
            window.on_data_packet(1, &[42]).await.unwrap();
            window.on_data_packet(2, &[]).await.unwrap();

            assert!(window.eof_received());
            assert_eq!(window.ack_sent, 3);
            assert!(!window.has_undelivered());
        });
    }

    #[rstest]
    fn test_eof_marker_held_back_across_gap() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sequence = Sequence::new();
            let mut send_socket = MockSendSocket::new();
            expect_ack(&mut send_socket, &mut sequence, 1);

            // #2 was buffered (so seq_rcvd is ahead of ack_sent), #1 is still missing; the
            //  EOF marker #3 must not be accepted across that gap
            let mut window = receive_window(send_socket, MockStreamConsumer::new());
            window.buffered[2] = Some(vec![7]);
            window.seq_rcvd = 2;

            window.on_data_packet(3, &[]).await.unwrap();

            assert!(!window.eof_received());
            assert_eq!(window.ack_sent, 1);
        });
    }

    #[rstest]
    fn test_data_after_eof_is_ignored() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sequence = Sequence::new();
            let mut send_socket = MockSendSocket::new();
            expect_ack(&mut send_socket, &mut sequence, 2); // ack for the EOF marker
            expect_ack(&mut send_socket, &mut sequence, 2); // courtesy ack for the late data

            let mut consumer = MockStreamConsumer::new();
            consumer.expect_on_end_of_stream()
                .once()
                .returning(|| Ok(()));

            let mut window = receive_window(send_socket, consumer);
            window.on_data_packet(1, &[]).await.unwrap();
            assert!(window.eof_received());

            window.on_data_packet(2, &[1, 2]).await.unwrap();
            assert_eq!(window.ack_sent, 2);
            assert!(window.buffered.iter().all(|slot| slot.is_none()));
        });
    }

    #[rstest]
    fn test_consumer_failure_is_fatal() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut consumer = MockStreamConsumer::new();
            consumer.expect_available_space().returning(|| usize::MAX);
            consumer.expect_accept()
                .returning(|_| Err(anyhow::anyhow!("consumer went away")));

            let mut window = receive_window(MockSendSocket::new(), consumer);
            assert!(window.on_data_packet(1, &[1]).await.is_err());
        });
    }
}
