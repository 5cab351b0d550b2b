//! Signal bus and message patterns
//!
//! Signals are ephemeral tagged messages addressed to a task
//! identifier. The local bus delivers them into bounded per-
//! subscription buffers (latest-wins on overflow); the Redis bus fans
//! them out over pub/sub; the router picks local or remote delivery by
//! consulting an ownership resolver. Steer, interrupt, and collect are
//! the three patterns built on top.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod bus;
pub mod error;
pub mod patterns;
pub mod redis_bus;
pub mod ring;
pub mod router;
pub mod signal;

pub use bus::{LocalSignalBus, SignalBus, DEFAULT_SIGNAL_BUFFER};
pub use error::{SignalError, SignalResult};
pub use patterns::{
    collect_channel, collect_result, decode_collect, decode_interrupt, decode_steer, interrupt,
    signal_from_wire, steer, Collected, CollectPayload, Collector, InterruptPayload, SteerPayload,
};
pub use redis_bus::{NodeSignalListener, RedisRemotePublisher, RedisSignalBus, RedisSignalSettings};
pub use ring::{signal_channel, SignalReceiver, SignalSender};
pub use router::{PublisherRegistry, RemotePublisher, SignalRouter};
pub use signal::{Signal, SignalKind};
