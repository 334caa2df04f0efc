//! kernel-client - Request correlation and channel dispatch for Jupyter kernels.
//!
//! This crate is the client-side core used by `runt` to drive a compute
//! kernel that speaks the Jupyter messaging protocol. It covers:
//!
//! - Kernelspec discovery and caching (`jupyter kernelspec list` + `kernel.json`)
//! - Message construction with parent linkage and protocol bookkeeping
//! - Routing of requests onto the logical channels (shell, iopub, stdin,
//!   control, hb) and delivery of inbound messages to handlers
//! - Per-request tracking of the busy → reply → idle sequence
//! - A client façade that ties these together over a pluggable transport
//!
//! Two transports ship with the crate: an in-memory echo kernel used in
//! tests and demos, and a ZeroMQ transport over `runtimelib` for real kernels.
//!
//! ```ignore
//! use kernel_client::{ClientConfig, KernelClient};
//!
//! let client = KernelClient::echo(ClientConfig::default());
//! let request = client.execute("1+1")?;
//! request.await_idle(std::time::Duration::from_secs(5)).await?;
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod history;
pub mod kernelspec;
pub mod launch;
pub mod message;
pub mod request;
pub mod transport;

pub use channel::{Channel, ChannelDispatcher, MessageHandler};
pub use client::{plain_text, HandledMessage, KernelClient};
pub use config::{ClientConfig, EchoConfig, KernelspecStoreConfig};
pub use error::{Error, Result};
pub use history::HistoryRing;
pub use kernelspec::{Kernelspec, KernelspecSnapshot, KernelspecStore};
pub use launch::{launch_kernel, LaunchedKernel};
pub use message::{content_from, derive_reply_type, Content, Message, MessageFactory};
pub use request::{Request, RequestState};
pub use transport::{EchoKernel, Inbound, Transport, ZmqTransport};
