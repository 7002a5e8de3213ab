//! The event loop harness around the protocol core. The `EndPoint` binds the UDP socket, owns
//!  the registry of live sessions keyed by peer address, and delivers events to them strictly
//!  one at a time: an arrived datagram to the session of its sender, and a periodic timer tick
//!  to every session. Session teardown *is* removal from the registry - a session never
//!  unlinks itself, which is what makes double-teardown impossible.

use std::net::SocketAddr;
use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, span, warn, Level};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::packet::MAX_PACKET_LEN;
use crate::send_pipeline::SendPipeline;
use crate::session::{Session, SessionStatus};
use crate::stream_io::{DataSource, StreamConsumer};

pub struct EndPoint {
    socket: Arc<UdpSocket>,
    send_pipeline: Arc<SendPipeline>,
    config: Arc<SessionConfig>,
    sessions: FxHashMap<SocketAddr, Session>,
}

impl EndPoint {
    pub async fn bind(self_addr: SocketAddr, config: Arc<SessionConfig>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(self_addr).await?);
        info!("bound receive socket to {:?}", socket.local_addr()?);

        Ok(EndPoint {
            send_pipeline: Arc::new(SendPipeline::new(Arc::new(socket.clone()))),
            socket,
            config,
            sessions: FxHashMap::default(),
        })
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.send_pipeline.local_addr()
    }

    /// Register a session with a peer, wiring it to its local data source and consumer. There
    ///  is no in-band session setup: both peers are expected to register each other
    ///  explicitly, with agreeing configurations.
    pub async fn add_peer(
        &mut self,
        peer_addr: SocketAddr,
        source: Arc<dyn DataSource>,
        consumer: Arc<dyn StreamConsumer>,
    ) -> anyhow::Result<()> {
        if self.sessions.contains_key(&peer_addr) {
            anyhow::bail!("a session with {:?} is already registered", peer_addr);
        }

        info!("registering session with {:?}", peer_addr);
        let mut session = Session::new(
            self.config.clone(),
            peer_addr,
            self.send_pipeline.clone(),
            source,
            consumer,
        );

        match session.on_source_ready().await {
            Ok(SessionStatus::Open) => {
                self.sessions.insert(peer_addr, session);
            }
            Ok(SessionStatus::Closed) => {
                // both directions were trivially complete - don't even register
                info!("session with {:?} completed immediately", peer_addr);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Run the event loop until every registered session has closed. Datagrams from addresses
    ///  without a registered session are dropped - this core does not accept sessions in-band.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!("starting event loop with {} session(s)", self.sessions.len());

        let mut tick = interval(self.config.timer_tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // headroom beyond the maximum packet size so oversized datagrams arrive untruncated
        //  and are rejected by the codec instead of being misparsed
        let mut buf = vec![0u8; 4 * MAX_PACKET_LEN];

        while !self.sessions.is_empty() {
            select! {
                recv_result = self.socket.recv_from(&mut buf) => {
                    let (num_read, from) = match recv_result {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };

                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);
                    let _entered = span.enter();

                    let Some(session) = self.sessions.get_mut(&from) else {
                        debug!("datagram from unknown peer {:?} - dropping", from);
                        continue;
                    };

                    match session.on_datagram(&buf[..num_read]).await {
                        Ok(SessionStatus::Open) => {}
                        Ok(SessionStatus::Closed) => self.teardown(from),
                        Err(e) => {
                            warn!("session with {:?} failed: {:#} - tearing down", from, e);
                            self.teardown(from);
                        }
                    }
                }
                _ = tick.tick() => {
                    let mut done = Vec::new();
                    for (&peer_addr, session) in self.sessions.iter_mut() {
                        match session.on_timer_tick().await {
                            Ok(SessionStatus::Open) => {}
                            Ok(SessionStatus::Closed) => done.push(peer_addr),
                            Err(e) => {
                                warn!("session with {:?} failed: {:#} - tearing down", peer_addr, e);
                                done.push(peer_addr);
                            }
                        }
                    }
                    for peer_addr in done {
                        self.teardown(peer_addr);
                    }
                }
            }
        }

        info!("all sessions closed - event loop done");
        Ok(())
    }

    fn teardown(&mut self, peer_addr: SocketAddr) {
        // removal drops the session and with it both window buffers; the guard against
        //  double-teardown is that a removed session can not be found again
        if self.sessions.remove(&peer_addr).is_some() {
            info!("session with {:?} torn down", peer_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_io::ReadOutcome;
    use async_trait::async_trait;
    use rstest::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::runtime::Builder;

    struct ScriptedSource {
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        async fn read_chunk(&self, _max_len: usize) -> ReadOutcome {
            let mut chunks = self.chunks.lock().unwrap();
            if chunks.is_empty() {
                ReadOutcome::Exhausted
            }
            else {
                ReadOutcome::Chunk(chunks.remove(0))
            }
        }
    }

    struct CollectingConsumer {
        received: Mutex<Vec<u8>>,
        eof_signals: Mutex<u32>,
    }

    impl CollectingConsumer {
        fn new() -> CollectingConsumer {
            CollectingConsumer {
                received: Mutex::new(Vec::new()),
                eof_signals: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl StreamConsumer for CollectingConsumer {
        async fn available_space(&self) -> usize {
            usize::MAX
        }

        async fn accept(&self, data: &[u8]) -> anyhow::Result<usize> {
            self.received.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        async fn on_end_of_stream(&self) -> anyhow::Result<()> {
            *self.eof_signals.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn localhost_config() -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            window_size: 4,
            retransmit_timeout: Duration::from_millis(200),
            timer_tick_interval: Duration::from_millis(20),
        })
    }

    #[rstest]
    fn test_add_peer_rejects_duplicate() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut end_point = EndPoint::bind(SocketAddr::from(([127, 0, 0, 1], 0)), localhost_config())
                .await.unwrap();

            let peer = SocketAddr::from(([127, 0, 0, 1], 1)); // nothing is sent to it yet
            let source = Arc::new(ScriptedSource { chunks: Mutex::new(vec![vec![1]]) });
            end_point.add_peer(peer, source.clone(), Arc::new(CollectingConsumer::new())).await.unwrap();
            assert_eq!(end_point.num_sessions(), 1);

            assert!(end_point.add_peer(peer, source, Arc::new(CollectingConsumer::new())).await.is_err());
        });
    }

    /// full loopback run over real UDP sockets: two endpoints, one stream in each direction
    #[rstest]
    fn test_loopback_transfer() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let config = localhost_config();

            let mut left = EndPoint::bind(SocketAddr::from(([127, 0, 0, 1], 0)), config.clone())
                .await.unwrap();
            let mut right = EndPoint::bind(SocketAddr::from(([127, 0, 0, 1], 0)), config)
                .await.unwrap();
            let left_addr = left.self_addr();
            let right_addr = right.self_addr();

            let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
            let left_chunks: Vec<Vec<u8>> = payload.chunks(500).map(|c| c.to_vec()).collect();

            let right_consumer = Arc::new(CollectingConsumer::new());
            let left_consumer = Arc::new(CollectingConsumer::new());

            left.add_peer(
                right_addr,
                Arc::new(ScriptedSource { chunks: Mutex::new(left_chunks) }),
                left_consumer.clone(),
            ).await.unwrap();
            right.add_peer(
                left_addr,
                Arc::new(ScriptedSource { chunks: Mutex::new(vec![]) }),
                right_consumer.clone(),
            ).await.unwrap();

            let left_run = tokio::spawn(async move { left.run().await });
            let right_run = tokio::spawn(async move { right.run().await });

            tokio::time::timeout(Duration::from_secs(10), async {
                left_run.await.unwrap().unwrap();
                right_run.await.unwrap().unwrap();
            }).await.expect("transfer did not complete in time");

            assert_eq!(*right_consumer.received.lock().unwrap(), payload);
            assert_eq!(*right_consumer.eof_signals.lock().unwrap(), 1);
            assert!(left_consumer.received.lock().unwrap().is_empty());
            assert_eq!(*left_consumer.eof_signals.lock().unwrap(), 1);
        });
    }
}
