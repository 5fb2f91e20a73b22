//! C2/C3: the AMQP-backed control-plane link.
//!
//! `lapin` is the enrichment pick here: no example in the retrieval pack
//! talks to a message broker, so this is built the way `vcontrol`'s HTTP
//! layer is built (a thin trait seam with one real backend behind it) but
//! pointed at the protocol the original Python manager actually speaks
//! (`pika`/AMQP 0-9-1), per `spec.md` §6.

pub mod command_queue;
pub mod result_publisher;

pub use command_queue::{AmqpCommandQueueSubscriber, CommandQueueSubscriber};
pub use result_publisher::{AmqpResultPublisher, ResultPublisher};
