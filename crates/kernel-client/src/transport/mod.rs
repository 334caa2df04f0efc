//! The send/receive boundary between the dispatcher and a kernel.
//!
//! A transport accepts outbound messages per channel without blocking and
//! pushes whatever the kernel emits into an inbox handed to it at
//! construction. Socket framing and heartbeating live behind this trait.

mod echo;
mod zmq;

pub use echo::EchoKernel;
pub use zmq::{from_jupyter, to_jupyter, ZmqTransport};

use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::error::Result;
use crate::message::Message;

/// A message that arrived on `Channel`.
pub type Inbound = (Channel, Message);

pub type InboxSender = mpsc::UnboundedSender<Inbound>;
pub type InboxReceiver = mpsc::UnboundedReceiver<Inbound>;

/// Create the inbox a transport feeds and a dispatcher drains.
pub fn inbox() -> (InboxSender, InboxReceiver) {
    mpsc::unbounded_channel()
}

pub trait Transport: Send + Sync {
    /// Queue `message` for `channel`. Must not wait on the kernel.
    fn send(&self, channel: Channel, message: Message) -> Result<()>;

    /// Stop background work. Further sends fail with `Disconnected`.
    fn close(&self);

    /// Short label for logs.
    fn name(&self) -> &'static str;
}
