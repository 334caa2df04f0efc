//! Logical channels and the dispatcher that routes messages across them.
//!
//! Outbound requests are handed to the transport for the named channel and
//! `send` returns immediately. Inbound messages arrive in the transport's
//! inbox and a pump task delivers them, in arrival order, to the handler
//! registered for the channel they came in on.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::{Inbound, Transport};

/// One of the fixed Jupyter message lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "shell")]
    Shell,
    #[serde(rename = "iopub")]
    Iopub,
    #[serde(rename = "stdin")]
    Stdin,
    #[serde(rename = "control")]
    Control,
    #[serde(rename = "hb")]
    Heartbeat,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Shell,
        Channel::Iopub,
        Channel::Stdin,
        Channel::Control,
        Channel::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Iopub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
            Channel::Heartbeat => "hb",
        }
    }

    /// The channel a request of `msg_type` is sent on.
    pub fn for_type(msg_type: &str) -> Channel {
        match msg_type {
            "shutdown_request" | "interrupt_request" | "debug_request" => Channel::Control,
            "input_reply" => Channel::Stdin,
            _ => Channel::Shell,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shell" => Ok(Channel::Shell),
            "iopub" => Ok(Channel::Iopub),
            "stdin" => Ok(Channel::Stdin),
            "control" => Ok(Channel::Control),
            "hb" => Ok(Channel::Heartbeat),
            other => Err(Error::UnknownChannel(other.to_string())),
        }
    }
}

/// Receives inbound messages for the channels it is registered on.
///
/// Implementations own whatever state the message mutates; the dispatcher
/// only guarantees per-channel arrival order.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, channel: Channel, message: Message);
}

pub struct ChannelDispatcher {
    transport: Arc<dyn Transport>,
    handlers: RwLock<HashMap<Channel, Arc<dyn MessageHandler>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChannelDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            handlers: RwLock::new(HashMap::new()),
            pump: StdMutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn register(&self, channel: Channel, handler: Arc<dyn MessageHandler>) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(channel, handler);
    }

    /// Register `handler` on every channel.
    pub fn register_all(&self, handler: Arc<dyn MessageHandler>) {
        for channel in Channel::ALL {
            self.register(channel, handler.clone());
        }
    }

    pub fn unregister(&self, channel: Channel) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.remove(&channel);
    }

    fn handler_for(&self, channel: Channel) -> Option<Arc<dyn MessageHandler>> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(&channel).cloned()
    }

    /// Hand `message` to the transport for `channel`. Never waits for a reply.
    pub fn send(&self, channel: Channel, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }
        debug!(
            "[dispatcher] send {} on {}: msg_id={}",
            message.msg_type(),
            channel,
            message.id()
        );
        self.transport.send(channel, message)
    }

    /// Like `send`, for a channel given by its wire name.
    pub fn send_named(&self, channel: &str, message: Message) -> Result<()> {
        let channel = channel.parse::<Channel>()?;
        self.send(channel, message)
    }

    /// Invoke the handler registered for `channel`.
    ///
    /// Messages for a channel with no handler, or arriving after shutdown,
    /// are dropped.
    pub fn deliver(&self, channel: Channel, message: Message) {
        if self.is_closed() {
            debug!(
                "[dispatcher] dropping {} on {} after shutdown",
                message.msg_type(),
                channel
            );
            return;
        }
        match self.handler_for(channel) {
            Some(handler) => handler.handle_message(channel, message),
            None => debug!(
                "[dispatcher] no handler for {}; dropping {}",
                channel,
                message.msg_type()
            ),
        }
    }

    /// Start delivering everything that arrives in `inbox`.
    ///
    /// Replaces any pump started earlier.
    pub fn start(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        let dispatcher = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some((channel, message)) = inbox.recv().await {
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                if dispatcher.is_closed() {
                    break;
                }
                dispatcher.deliver(channel, message);
            }
            debug!("[dispatcher] inbox closed");
        });

        let mut pump = match self.pump.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = pump.replace(task) {
            previous.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop delivery and close the transport. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = match self.pump.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
        self.transport.close();
        info!("[dispatcher] shut down {} transport", self.transport.name());
    }
}

impl Drop for ChannelDispatcher {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("[dispatcher] dropped without shutdown");
            self.shutdown();
        }
    }
}
