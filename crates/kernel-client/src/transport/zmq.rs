//! ZeroMQ transport for real kernels, over `runtimelib` connections.
//!
//! Each channel gets its own task: shell is split into a writer and a
//! reader, iopub is read-only, control and stdin multiplex reads and writes
//! with `select!`. Heartbeat sends perform a single ping and log the result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use jupyter_protocol::{ConnectionInfo, Header, JupyterMessage, JupyterMessageContent};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{InboxSender, Transport};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::message::{Content, Message};

const PROTOCOL_VERSION: &str = "5.3";
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ZmqTransport {
    outbound: HashMap<Channel, mpsc::UnboundedSender<Message>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn transport_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Transport(format!("{}: {}", context, e))
}

impl ZmqTransport {
    /// Open every channel of the kernel described by `connection_info`.
    pub async fn connect(
        connection_info: &ConnectionInfo,
        session_id: &str,
        inbox: InboxSender,
    ) -> Result<Self> {
        let identity = runtimelib::peer_identity_for_session(session_id)
            .map_err(|e| transport_error("peer identity", e))?;

        let shell = runtimelib::create_client_shell_connection_with_identity(
            connection_info,
            session_id,
            identity.clone(),
        )
        .await
        .map_err(|e| transport_error("shell connect", e))?;
        let (mut shell_writer, mut shell_reader) = shell.split();

        let mut iopub =
            runtimelib::create_client_iopub_connection(connection_info, "", session_id)
                .await
                .map_err(|e| transport_error("iopub connect", e))?;

        let mut control =
            runtimelib::create_client_control_connection(connection_info, session_id)
                .await
                .map_err(|e| transport_error("control connect", e))?;

        let mut stdin = runtimelib::create_client_stdin_connection_with_identity(
            connection_info,
            session_id,
            identity,
        )
        .await
        .map_err(|e| transport_error("stdin connect", e))?;

        let mut outbound = HashMap::new();
        let mut tasks = Vec::new();

        // shell: writer + reader
        let (shell_tx, mut shell_rx) = mpsc::unbounded_channel::<Message>();
        outbound.insert(Channel::Shell, shell_tx);
        tasks.push(tokio::spawn(async move {
            while let Some(message) = shell_rx.recv().await {
                let Some(wire) = encode(&message) else {
                    continue;
                };
                if let Err(e) = shell_writer.send(wire).await {
                    error!("[zmq] shell send error: {}", e);
                    break;
                }
            }
        }));
        let shell_inbox = inbox.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(wire) => {
                        if !forward(&shell_inbox, Channel::Shell, wire) {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[zmq] shell read error: {}", e);
                        break;
                    }
                }
            }
        }));

        // iopub: read-only
        let iopub_inbox = inbox.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(wire) => {
                        if !forward(&iopub_inbox, Channel::Iopub, wire) {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[zmq] iopub read error: {}", e);
                        break;
                    }
                }
            }
        }));

        // control: requests out, replies in
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();
        outbound.insert(Channel::Control, control_tx);
        let control_inbox = inbox.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = control_rx.recv() => {
                        let Some(message) = outgoing else { break };
                        let Some(wire) = encode(&message) else { continue };
                        if let Err(e) = control.send(wire).await {
                            error!("[zmq] control send error: {}", e);
                            break;
                        }
                    }
                    incoming = control.read() => match incoming {
                        Ok(wire) => {
                            if !forward(&control_inbox, Channel::Control, wire) {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("[zmq] control read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }));

        // stdin: input_request in, input_reply out
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Message>();
        outbound.insert(Channel::Stdin, stdin_tx);
        let stdin_inbox = inbox;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = stdin_rx.recv() => {
                        let Some(message) = outgoing else { break };
                        let Some(wire) = encode(&message) else { continue };
                        if let Err(e) = stdin.send(wire).await {
                            error!("[zmq] stdin send error: {}", e);
                            break;
                        }
                    }
                    incoming = stdin.read() => match incoming {
                        Ok(wire) => {
                            if !forward(&stdin_inbox, Channel::Stdin, wire) {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("[zmq] stdin read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }));

        // hb: one ping per send
        let (hb_tx, mut hb_rx) = mpsc::unbounded_channel::<Message>();
        outbound.insert(Channel::Heartbeat, hb_tx);
        let hb_info = connection_info.clone();
        tasks.push(tokio::spawn(async move {
            while hb_rx.recv().await.is_some() {
                let result = tokio::time::timeout(HEARTBEAT_TIMEOUT, async {
                    let mut hb = runtimelib::create_client_heartbeat_connection(&hb_info).await?;
                    hb.single_heartbeat().await
                })
                .await;
                match result {
                    Ok(Ok(())) => debug!("[zmq] heartbeat ok"),
                    Ok(Err(e)) => warn!("[zmq] heartbeat failed: {}", e),
                    Err(_) => warn!("[zmq] heartbeat timed out after {:?}", HEARTBEAT_TIMEOUT),
                }
            }
        }));

        info!(
            "[zmq] connected to kernel {:?} (session {})",
            connection_info.kernel_name, session_id
        );

        Ok(Self {
            outbound,
            tasks: StdMutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }
}

impl Transport for ZmqTransport {
    fn send(&self, channel: Channel, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        let sender = self
            .outbound
            .get(&channel)
            .ok_or_else(|| Error::Transport(format!("{} is receive-only", channel)))?;
        sender
            .send(message)
            .map_err(|_| Error::Transport(format!("{} connection closed", channel)))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }

    fn name(&self) -> &'static str {
        "zmq"
    }
}

impl Drop for ZmqTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn encode(message: &Message) -> Option<JupyterMessage> {
    match to_jupyter(message) {
        Ok(wire) => Some(wire),
        Err(e) => {
            warn!(
                "[zmq] cannot encode {} (msg_id={}): {}",
                message.msg_type(),
                message.id(),
                e
            );
            None
        }
    }
}

/// Push a decoded message into the inbox. Returns false once the inbox is gone.
fn forward(inbox: &InboxSender, channel: Channel, wire: JupyterMessage) -> bool {
    let message = match from_jupyter(wire) {
        Ok(message) => message,
        Err(e) => {
            warn!("[zmq] cannot decode message on {}: {}", channel, e);
            return true;
        }
    };
    debug!(
        "[zmq] {}: type={} parent_msg_id={:?}",
        channel,
        message.msg_type(),
        message.parent_id()
    );
    inbox.send((channel, message)).is_ok()
}

fn header(msg_id: &str, msg_type: &str, session: &str) -> Result<Header> {
    Ok(serde_json::from_value(json!({
        "msg_id": msg_id,
        "username": "runt",
        "session": session,
        "date": chrono::Utc::now().to_rfc3339(),
        "msg_type": msg_type,
        "version": PROTOCOL_VERSION,
    }))?)
}

/// Convert a core message into a `jupyter_protocol` message for the wire.
pub fn to_jupyter(message: &Message) -> Result<JupyterMessage> {
    let content = JupyterMessageContent::from_type_and_content(
        message.msg_type(),
        Value::Object(message.content().clone()),
    )
    .map_err(|e| transport_error(message.msg_type(), e))?;

    let parent_header = if message.has_parent() {
        Some(header(message.parent_id(), "", message.session())?)
    } else {
        None
    };

    Ok(JupyterMessage {
        zmq_identities: Vec::new(),
        header: header(message.id(), message.msg_type(), message.session())?,
        parent_header,
        metadata: json!({}),
        content,
        buffers: Vec::new(),
        channel: None,
    })
}

/// Convert a wire message into a core message.
pub fn from_jupyter(wire: JupyterMessage) -> Result<Message> {
    let content = flatten_content(serde_json::to_value(&wire.content)?);
    Ok(Message::from_parts(
        wire.header.msg_id,
        wire.header.msg_type,
        wire.parent_header.map(|h| h.msg_id).unwrap_or_default(),
        wire.header.session,
        content,
    ))
}

/// `JupyterMessageContent` may serialize wrapped in its variant name
/// (`{"ExecuteResult": {...}}`). Protocol fields are snake_case, so a lone
/// capitalised key holding an object is unwrapped.
fn flatten_content(value: Value) -> Content {
    match value {
        Value::Object(map) => {
            let wrapped = map.len() == 1
                && map
                    .iter()
                    .next()
                    .map(|(key, inner)| {
                        key.starts_with(|c: char| c.is_ascii_uppercase()) && inner.is_object()
                    })
                    .unwrap_or(false);
            if !wrapped {
                return map;
            }
            match map.into_iter().next() {
                Some((_, Value::Object(inner))) => inner,
                _ => Content::new(),
            }
        }
        _ => Content::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{content_from, MessageFactory};

    #[test]
    fn test_flatten_unwraps_variant_name() {
        let content = flatten_content(json!({"Status": {"execution_state": "idle"}}));
        assert_eq!(content.get("execution_state"), Some(&json!("idle")));
    }

    #[test]
    fn test_flatten_keeps_plain_content() {
        let content = flatten_content(json!({"data": {"text/plain": "2"}}));
        assert!(content.contains_key("data"));

        let content = flatten_content(json!({"execution_state": "busy"}));
        assert_eq!(content.get("execution_state"), Some(&json!("busy")));
    }

    #[test]
    fn test_to_jupyter_preserves_ids() {
        let factory = MessageFactory::with_session("s-1");
        let request = factory.build(None, "execute_request", content_from(json!({"code": "1+1"})));
        let wire = to_jupyter(&request).unwrap();

        assert_eq!(wire.header.msg_id, request.id());
        assert_eq!(wire.header.msg_type, "execute_request");
        assert_eq!(wire.header.session, "s-1");
        assert!(wire.parent_header.is_none());
    }

    #[test]
    fn test_wire_roundtrip_keeps_parent_linkage() {
        let factory = MessageFactory::new();
        let request = factory.build(None, "kernel_info_request", Content::new());
        let idle = factory.status(&request, "idle");

        let back = from_jupyter(to_jupyter(&idle).unwrap()).unwrap();
        assert_eq!(back.id(), idle.id());
        assert_eq!(back.parent_id(), request.id());
        assert!(back.is_idle_status());
    }
}
