//! A reliable, ordered byte-stream transport tunneled through an unreliable,
//!  unordered, lossy datagram channel - a sliding-window ARQ protocol in the
//!  spirit of a (much simplified) TCP.
//!
//! ## Design goals
//!
//! * The abstraction is a *byte stream* per direction of a session: bytes read
//!   from a local data source come out of the peer's consumer exactly once, in
//!   order, regardless of packet loss, duplication or reordering on the wire
//! * Reliability is ack-and-timeout based (go-back-N): the receiver sends
//!   cumulative acknowledgements, and the sender re-sends the oldest
//!   unacknowledged packet once its retransmission timeout expires
//! * Flow control is a fixed-size packet window, identical for sender and
//!   receiver and agreed upon out-of-band. The window bounds memory use on
//!   both sides: buffers are preallocated, and slot `n mod window_size` is the
//!   only place a packet with sequence number `n` can live
//! * The consumer may apply backpressure: delivery hands over as many bytes as
//!   the consumer currently accepts, and a partially delivered packet stays
//!   buffered (and unacknowledged) until it is drained completely
//! * End-of-stream is part of the protocol: a zero-payload data packet marks
//!   the end of the byte stream at its position in the sequence, and a session
//!   closes once both directions have delivered and acknowledged their EOF
//! * All operations are non-blocking; the protocol core is driven by an
//!   external event loop, one event at a time, with no internal locking
//!
//! Explicitly *not* goals: congestion control (the window does not adapt to
//!  observed loss), encryption, stream multiplexing, and accepting sessions
//!  from unknown peers (sessions are registered explicitly).
//!
//! ## Wire format
//!
//! One packet per UDP datagram, all multi-byte fields in network byte order:
//!
//! ```ascii
//! 0:  length (u16) - total packet size in bytes, including this header
//! 2:  checksum (u16) - over the first `length` bytes with this field zeroed
//! 4:  sequence number (u32) - data packets only, starts at 1
//! 8:  ack number (u32) - cumulative: "next expected sequence number"
//! 12: payload (up to 500 bytes) - data packets only
//! ```
//!
//! An ack-only packet is 8 bytes (length, checksum, ack number - the ack
//!  number sits at offset 4 there). A data packet is 12..=512 bytes; a data
//!  packet of exactly 12 bytes (empty payload) is the EOF marker. Anything
//!  else - lengths in the 'dead zone' (8, 12) exclusive, truncated packets,
//!  checksum mismatches - is dropped on arrival.
//!
//! ## Related
//!
//! * TCP: same cumulative-ack idea, but TCP acks byte offsets, negotiates its
//!   window and does congestion control - none of which exists here
//! * Classic go-back-N as taught: this implementation retransmits only the
//!   *oldest* unacknowledged packet per timer tick rather than the whole
//!   window, trading recovery latency for less duplicate traffic

mod packet;
mod send_window;
mod receive_window;
pub mod session;
pub mod end_point;
pub mod stream_io;
pub mod send_pipeline;
pub mod config;
pub mod safe_converter;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
