//! One session is one bidirectional reliable byte stream with one peer. The session owns the
//!  sender and receiver windows exclusively and orchestrates them in response to the three
//!  kinds of events the event loop delivers: an arrived datagram, a timer tick, and (at
//!  startup) source readiness.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::packet::{self, RawPacket, ACK_PACKET_LEN};
use crate::receive_window::ReceiveWindow;
use crate::send_pipeline::SendPipeline;
use crate::send_window::SendWindow;
use crate::stream_io::{DataSource, StreamConsumer};

/// What the event loop should do with the session after an event was handled. `Closed` means
///  both directions finished cleanly - the session is done and must be removed from the
///  registry (which releases its window buffers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Closed,
}

pub struct Session {
    peer_addr: SocketAddr,
    sender: SendWindow,
    receiver: ReceiveWindow,
}

impl Session {
    pub fn new(
        config: Arc<SessionConfig>,
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        source: Arc<dyn DataSource>,
        consumer: Arc<dyn StreamConsumer>,
    ) -> Session {
        Session {
            peer_addr,
            sender: SendWindow::new(config.clone(), peer_addr, send_pipeline.clone(), source),
            receiver: ReceiveWindow::new(config, peer_addr, send_pipeline, consumer),
        }
    }

    /// Handle an arrived datagram. Invalid packets are discarded (answered with a courtesy
    ///  ack unless they are runts); pure acks drive the sender window; data packets drive the
    ///  receiver window.
    ///
    /// NB: The piggy-backed ack number on inbound *data* packets is deliberately not fed into
    ///      the sender window - only pure ack packets acknowledge.
    pub async fn on_datagram(&mut self, datagram: &[u8]) -> anyhow::Result<SessionStatus> {
        match packet::parse(datagram) {
            Err(defect) => {
                debug!("discarding invalid packet from {:?}: {:?}", self.peer_addr, defect);
                if datagram.len() > ACK_PACKET_LEN {
                    // help the peer resynchronize in case our previous ack was what got lost
                    self.receiver.send_current_ack().await?;
                }
            }
            Ok(RawPacket::Ack { ack_number }) => {
                if self.sender.on_ack(ack_number) {
                    // window space freed - try to pull more data from the source
                    self.sender.fill_window(self.receiver.last_ack_sent()).await?;
                }
            }
            Ok(RawPacket::Data { sequence_number, payload, .. }) => {
                self.receiver.on_data_packet(sequence_number, payload).await?;
            }
        }
        Ok(self.status())
    }

    /// Kick off (or resume) pulling from the data source. Called once after the session is
    ///  registered, and from every timer tick thereafter.
    pub async fn on_source_ready(&mut self) -> anyhow::Result<SessionStatus> {
        self.sender.fill_window(self.receiver.last_ack_sent()).await?;
        Ok(self.status())
    }

    /// Periodic tick: retransmit the oldest unacknowledged packet if it expired, poll the
    ///  source for fresh data, and retry delivery of buffered packets in case the consumer
    ///  freed up space.
    pub async fn on_timer_tick(&mut self) -> anyhow::Result<SessionStatus> {
        self.sender.retransmit_expired().await?;
        self.sender.fill_window(self.receiver.last_ack_sent()).await?;
        if self.receiver.has_undelivered() {
            self.receiver.flush_to_consumer().await?;
        }
        Ok(self.status())
    }

    /// The session may close iff all four hold: the inbound EOF marker was accepted, no
    ///  buffered packet awaits delivery, the local source is exhausted, and nothing is
    ///  inflight anymore (the peer acknowledged everything including our EOF marker).
    pub fn should_close(&self) -> bool {
        self.receiver.eof_received()
            && !self.receiver.has_undelivered()
            && self.sender.reached_source_eof()
            && !self.sender.has_inflight()
    }

    fn status(&self) -> SessionStatus {
        if self.should_close() {
            info!("session with {:?}: both directions complete", self.peer_addr);
            SessionStatus::Closed
        }
        else {
            SessionStatus::Open
        }
    }
}
