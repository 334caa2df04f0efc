//! The client façade.
//!
//! `KernelClient` sends typed requests, registers a `Request` for each one
//! before it leaves, and folds every inbound message into its state through
//! a single entry point (`handle_message`): the message is appended to a
//! bounded history ring and, when it is the idle status for a tracked
//! request, that request is marked idle and dropped from the registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use jupyter_protocol::ConnectionInfo;
use log::{debug, info};
use serde::Serialize;
use serde_json::{json, Value};

use crate::channel::{Channel, ChannelDispatcher, MessageHandler};
use crate::config::{ClientConfig, EchoConfig};
use crate::error::{Error, Result};
use crate::history::HistoryRing;
use crate::kernelspec::KernelspecStore;
use crate::launch::{self, LaunchedKernel};
use crate::message::{content_from, Content, Message, MessageFactory};
use crate::request::Request;
use crate::transport::{self, EchoKernel, InboxReceiver, Transport, ZmqTransport};

/// An inbound message as the client saw it.
#[derive(Debug, Clone, Serialize)]
pub struct HandledMessage {
    pub channel: Channel,
    pub message: Message,
}

struct ClientState {
    history: HistoryRing<HandledMessage>,
    in_flight: HashMap<String, Request>,
    closed: bool,
}

/// State shared with the dispatcher's pump. Every mutation goes through the
/// one mutex, so messages arriving on different channels are folded in one
/// at a time.
struct ClientCore {
    config: ClientConfig,
    state: StdMutex<ClientState>,
}

impl ClientCore {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MessageHandler for ClientCore {
    fn handle_message(&self, channel: Channel, message: Message) {
        let mut state = self.lock();
        if state.closed {
            debug!(
                "[client] dropping {} on {} after close",
                message.msg_type(),
                channel
            );
            return;
        }

        state.history.push(HandledMessage {
            channel,
            message: message.clone(),
        });

        if !message.has_parent() {
            return;
        }
        let Some(request) = state.in_flight.get(message.parent_id()).cloned() else {
            debug!(
                "[client] {} for untracked parent {}",
                message.msg_type(),
                message.parent_id()
            );
            return;
        };

        request.record(&message);
        if message.is_idle_status() {
            request.on_idle_message_observed();
            state.in_flight.remove(message.parent_id());
        }
    }
}

pub struct KernelClient {
    kernel_id: String,
    factory: MessageFactory,
    core: Arc<ClientCore>,
    dispatcher: Arc<ChannelDispatcher>,
    connection_info: Option<ConnectionInfo>,
    kernel: Option<LaunchedKernel>,
}

impl KernelClient {
    /// Attach a client to an already-constructed transport.
    ///
    /// `inbox` must be the receiving half of the inbox the transport feeds.
    /// Must be called within a tokio runtime.
    pub fn from_transport(
        kernel_id: impl Into<String>,
        config: ClientConfig,
        factory: MessageFactory,
        transport: Arc<dyn Transport>,
        inbox: InboxReceiver,
    ) -> Self {
        let core = Arc::new(ClientCore {
            state: StdMutex::new(ClientState {
                history: HistoryRing::new(config.history_capacity),
                in_flight: HashMap::new(),
                closed: false,
            }),
            config,
        });

        let dispatcher = Arc::new(ChannelDispatcher::new(transport));
        dispatcher.register_all(core.clone());
        dispatcher.start(inbox);

        Self {
            kernel_id: kernel_id.into(),
            factory,
            core,
            dispatcher,
            connection_info: None,
            kernel: None,
        }
    }

    /// A client wired to the in-memory echo kernel.
    ///
    /// Must be called within a tokio runtime.
    pub fn echo(config: ClientConfig) -> Self {
        Self::echo_with(config, EchoConfig::default())
    }

    /// Like `echo`, with explicit echo kernel timing.
    ///
    /// Must be called within a tokio runtime.
    pub fn echo_with(config: ClientConfig, echo: EchoConfig) -> Self {
        let (tx, rx) = transport::inbox();
        let kernel = Arc::new(EchoKernel::new(echo, tx));
        Self::from_transport("echo", config, MessageFactory::new(), kernel, rx)
    }

    /// Connect to a running kernel.
    pub async fn connect(connection_info: ConnectionInfo, config: ClientConfig) -> Result<Self> {
        let factory = MessageFactory::new();
        let (tx, rx) = transport::inbox();
        let transport = ZmqTransport::connect(&connection_info, factory.session(), tx).await?;
        let kernel_id = connection_info
            .kernel_name
            .clone()
            .unwrap_or_else(|| "kernel".to_string());

        let mut client = Self::from_transport(kernel_id, config, factory, Arc::new(transport), rx);
        client.connection_info = Some(connection_info);
        Ok(client)
    }

    /// Connect to a running kernel through its connection file.
    pub async fn connect_file(path: &Path, config: ClientConfig) -> Result<Self> {
        let connection_info = launch::read_connection_info(path).await?;
        Self::connect(connection_info, config).await
    }

    /// Resolve `name` in `store`, start that kernel and connect to it.
    pub async fn launch(store: &KernelspecStore, name: &str, config: ClientConfig) -> Result<Self> {
        let kernelspec = store.resolve(name).await?;
        let kernel = launch::launch_kernel(&kernelspec, None).await?;

        // Small delay to let the kernel bind its sockets
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut client = Self::connect(kernel.connection_info.clone(), config).await?;
        client.kernel_id = kernel.kernel_id.clone();
        client.kernel = Some(kernel);
        info!("[client] launched {} as {}", kernelspec.name, client.kernel_id);
        Ok(client)
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn session_id(&self) -> &str {
        self.factory.session()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.connection_info.as_ref()
    }

    /// The kernel process this client started, if any.
    pub fn launched_kernel(&self) -> Option<&LaunchedKernel> {
        self.kernel.as_ref()
    }

    /// Send a request of `msg_type` on the channel its type implies.
    ///
    /// Returns as soon as the message is handed to the transport.
    pub fn send(&self, msg_type: &str, content: Content) -> Result<Request> {
        self.send_on(Channel::for_type(msg_type), msg_type, content)
    }

    /// Send a request on an explicit channel.
    pub fn send_on(&self, channel: Channel, msg_type: &str, content: Content) -> Result<Request> {
        let message = self.factory.build(None, msg_type, content);
        let request = Request::new(
            message.clone(),
            channel,
            self.core.config.request_history_capacity,
        );

        // Register before sending so the idle status can never race ahead.
        {
            let mut state = self.core.lock();
            if state.closed {
                return Err(Error::Disconnected);
            }
            state
                .in_flight
                .insert(request.id().to_string(), request.clone());
        }

        if let Err(e) = self.dispatcher.send(channel, message) {
            self.core.lock().in_flight.remove(request.id());
            return Err(e);
        }
        Ok(request)
    }

    /// Fold an inbound message into client state.
    pub fn handle_message(&self, channel: Channel, message: Message) {
        self.core.handle_message(channel, message);
    }

    /// Handled messages, oldest first.
    pub fn history(&self) -> Vec<HandledMessage> {
        self.core.lock().history.to_vec()
    }

    /// The most recent `n` handled messages, oldest first.
    pub fn recent(&self, n: usize) -> Vec<HandledMessage> {
        self.core.lock().history.last_n(n).cloned().collect()
    }

    /// Number of requests still waiting for their idle status.
    pub fn in_flight(&self) -> usize {
        self.core.lock().in_flight.len()
    }

    pub fn request(&self, id: &str) -> Option<Request> {
        self.core.lock().in_flight.get(id).cloned()
    }

    pub fn execute(&self, code: &str) -> Result<Request> {
        self.send("execute_request", content_from(json!({ "code": code })))
    }

    /// Execute `code` and wait for its idle status.
    pub async fn execute_and_wait(&self, code: &str, timeout: Option<Duration>) -> Result<Request> {
        let request = self.execute(code)?;
        request
            .await_idle(timeout.unwrap_or(self.core.config.default_timeout))
            .await?;
        Ok(request)
    }

    pub fn kernel_info(&self) -> Result<Request> {
        self.send("kernel_info_request", Content::new())
    }

    pub fn complete(&self, code: &str, cursor_pos: usize) -> Result<Request> {
        self.send(
            "complete_request",
            content_from(json!({ "code": code, "cursor_pos": cursor_pos })),
        )
    }

    pub fn inspect(&self, code: &str, cursor_pos: usize, detail_level: u8) -> Result<Request> {
        self.send(
            "inspect_request",
            content_from(json!({
                "code": code,
                "cursor_pos": cursor_pos,
                "detail_level": detail_level,
            })),
        )
    }

    pub fn is_complete(&self, code: &str) -> Result<Request> {
        self.send("is_complete_request", content_from(json!({ "code": code })))
    }

    /// Ask for the last `n` entries of the kernel's input history.
    pub fn kernel_history(&self, n: usize) -> Result<Request> {
        self.send(
            "history_request",
            content_from(json!({
                "output": false,
                "raw": true,
                "hist_access_type": "tail",
                "n": n,
            })),
        )
    }

    pub fn comm_info(&self, target_name: Option<&str>) -> Result<Request> {
        let content = match target_name {
            Some(target) => json!({ "target_name": target }),
            None => json!({}),
        };
        self.send("comm_info_request", content_from(content))
    }

    pub fn shutdown(&self, restart: bool) -> Result<Request> {
        self.send("shutdown_request", content_from(json!({ "restart": restart })))
    }

    pub fn interrupt(&self) -> Result<Request> {
        self.send("interrupt_request", Content::new())
    }

    /// Answer an `input_request` on stdin. Replies are not tracked.
    pub fn input_reply(&self, input_request: &Message, value: &str) -> Result<()> {
        let reply = self.factory.build(
            Some(input_request),
            "input_reply",
            content_from(json!({ "value": value, "status": "ok" })),
        );
        self.dispatcher.send(Channel::Stdin, reply)
    }

    /// Ping the kernel's heartbeat channel.
    pub fn heartbeat(&self) -> Result<()> {
        let ping = self.factory.build(None, "ping", Content::new());
        self.dispatcher.send(Channel::Heartbeat, ping)
    }

    /// Tear the session down.
    ///
    /// Every in-flight request is abandoned and its waiters fail with
    /// `Disconnected`; nothing further is delivered to this client.
    pub fn close(&self) {
        let abandoned: Vec<Request> = {
            let mut state = self.core.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.in_flight.drain().map(|(_, request)| request).collect()
        };

        for request in &abandoned {
            request.abandon();
        }
        self.dispatcher.shutdown();
        info!(
            "[client] closed {} ({} request(s) abandoned)",
            self.kernel_id,
            abandoned.len()
        );
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Text of an `execute_result`/`display_data` `text/plain` bundle, if any.
pub fn plain_text(message: &Message) -> Option<&str> {
    message
        .get("data")
        .and_then(|data| data.get("text/plain"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestState;

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _channel: Channel, _message: Message) -> Result<()> {
            Ok(())
        }

        fn close(&self) {}

        fn name(&self) -> &'static str {
            "null"
        }
    }

    fn quiet_client(config: ClientConfig) -> KernelClient {
        let (_tx, rx) = transport::inbox();
        KernelClient::from_transport(
            "test",
            config,
            MessageFactory::new(),
            Arc::new(NullTransport),
            rx,
        )
    }

    #[tokio::test]
    async fn test_send_registers_before_returning() {
        let client = quiet_client(ClientConfig::default());
        let request = client.execute("1+1").unwrap();

        assert_eq!(client.in_flight(), 1);
        assert_eq!(request.state(), RequestState::Pending);
        assert!(client.request(request.id()).is_some());
        assert_eq!(request.message().get("code"), Some(&json!("1+1")));
    }

    #[tokio::test]
    async fn test_handle_message_marks_idle_and_unregisters() {
        let client = quiet_client(ClientConfig::default());
        let request = client.kernel_info().unwrap();
        let kernel = MessageFactory::with_session("kernel");

        client.handle_message(Channel::Iopub, kernel.status(request.message(), "busy"));
        client.handle_message(
            Channel::Shell,
            kernel.reply(request.message(), Content::new()).unwrap(),
        );
        assert!(!request.is_idle());

        client.handle_message(Channel::Iopub, kernel.status(request.message(), "idle"));
        assert!(request.is_idle());
        assert_eq!(client.in_flight(), 0);
        assert_eq!(request.reply().unwrap().msg_type(), "kernel_info_reply");
        assert_eq!(request.history().len(), 3);
    }

    #[tokio::test]
    async fn test_late_messages_do_not_reach_idle_request() {
        let client = quiet_client(ClientConfig::default());
        let request = client.execute("x").unwrap();
        let kernel = MessageFactory::new();

        client.handle_message(Channel::Iopub, kernel.status(request.message(), "idle"));
        let stray = kernel.build(Some(request.message()), "stream", Content::new());
        client.handle_message(Channel::Iopub, stray);

        assert_eq!(request.history().len(), 1);
        // The client itself still records it.
        assert_eq!(client.history().len(), 2);
    }

    #[tokio::test]
    async fn test_history_ring_evicts_oldest() {
        let client = quiet_client(ClientConfig::default().with_history_capacity(3));
        let kernel = MessageFactory::new();
        let origin = kernel.build(None, "execute_request", Content::new());
        let ids: Vec<String> = (0..5)
            .map(|_| {
                let msg = kernel.status(&origin, "busy");
                let id = msg.id().to_string();
                client.handle_message(Channel::Iopub, msg);
                id
            })
            .collect();

        let kept: Vec<String> = client
            .history()
            .iter()
            .map(|h| h.message.id().to_string())
            .collect();
        assert_eq!(kept, ids[2..].to_vec());
    }

    #[tokio::test]
    async fn test_close_abandons_in_flight() {
        let client = quiet_client(ClientConfig::default());
        let request = client.execute("while True: pass").unwrap();
        let waiter = {
            let request = request.clone();
            tokio::spawn(async move { request.await_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        client.close();

        assert!(matches!(
            waiter.await.unwrap().unwrap_err(),
            Error::Disconnected
        ));
        assert_eq!(request.state(), RequestState::Abandoned);
        assert_eq!(client.in_flight(), 0);
        assert!(matches!(client.execute("1"), Err(Error::Disconnected)));

        // Nothing is folded in after close.
        client.handle_message(
            Channel::Iopub,
            MessageFactory::new().status(request.message(), "idle"),
        );
        assert!(client.history().is_empty());
        assert_eq!(request.state(), RequestState::Abandoned);
    }

    #[tokio::test]
    async fn test_typed_requests_pick_channels() {
        let client = quiet_client(ClientConfig::default());
        assert_eq!(client.shutdown(false).unwrap().channel(), Channel::Control);
        assert_eq!(client.interrupt().unwrap().channel(), Channel::Control);
        assert_eq!(client.complete("pri", 3).unwrap().channel(), Channel::Shell);
        assert_eq!(
            client.inspect("print", 5, 0).unwrap().msg_type(),
            "inspect_request"
        );
        assert_eq!(
            client.kernel_history(10).unwrap().message().get("hist_access_type"),
            Some(&json!("tail"))
        );
        assert_eq!(
            client.comm_info(None).unwrap().msg_type(),
            "comm_info_request"
        );
        assert_eq!(client.in_flight(), 6);
    }

    #[test]
    #[should_panic]
    fn test_echo_requires_runtime() {
        let _client = KernelClient::echo(ClientConfig::default());
    }

    #[test]
    fn test_plain_text() {
        let msg = MessageFactory::new().build(
            None,
            "execute_result",
            content_from(json!({"data": {"text/plain": "2"}})),
        );
        assert_eq!(plain_text(&msg), Some("2"));
    }
}
