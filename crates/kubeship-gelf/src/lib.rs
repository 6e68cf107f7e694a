//! GELF forwarding for kubeship
//!
//! This crate provides the bounded channel tail sessions push serialized
//! messages into, the single consumer that drains it, and the UDP transport
//! that delivers messages to Graylog.

mod channel;
mod sender;
mod udp;

pub use channel::{ForwardError, ForwardingChannel, ForwardingReceiver, MessageForwarder, bounded};
pub use sender::{MessageSink, SinkError, spawn_sender};
pub use udp::{MAX_CHUNKS, MAX_DATAGRAM_SIZE, UdpGelfSink, chunk_message};
