//! In-memory stand-in kernel.
//!
//! For every request it receives, the echo kernel asynchronously emits the
//! sequence a real kernel would: `status: busy` on iopub, one reply of the
//! derived reply type on the request's channel, then `status: idle` on
//! iopub. Requests are handled concurrently, so messages of different
//! requests interleave freely while each request's own sequence stays ordered.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use serde_json::{json, Value};

use super::{InboxSender, Transport};
use crate::channel::Channel;
use crate::config::EchoConfig;
use crate::error::{Error, Result};
use crate::message::{content_from, execution_state, Content, Message, MessageFactory};

pub struct EchoKernel {
    inner: Arc<EchoInner>,
}

struct EchoInner {
    config: EchoConfig,
    factory: MessageFactory,
    inbox: InboxSender,
    execution_count: AtomicU32,
    closed: AtomicBool,
}

impl EchoKernel {
    pub fn new(config: EchoConfig, inbox: InboxSender) -> Self {
        Self {
            inner: Arc::new(EchoInner {
                config,
                factory: MessageFactory::with_session("echo-kernel"),
                inbox,
                execution_count: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Transport for EchoKernel {
    fn send(&self, channel: Channel, message: Message) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        if channel == Channel::Heartbeat || !message.is_request() {
            debug!(
                "[echo-kernel] ignoring {} on {}",
                message.msg_type(),
                channel
            );
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Transport(format!("echo kernel needs a tokio runtime: {}", e)))?;
        let inner = self.inner.clone();
        handle.spawn(async move {
            inner.respond(channel, message).await;
        });
        Ok(())
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

impl EchoInner {
    async fn respond(&self, channel: Channel, request: Message) {
        let reply_content = self.reply_content(&request);
        let reply = match self.factory.reply(&request, reply_content) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("[echo-kernel] no reply for {}: {}", request.msg_type(), e);
                return;
            }
        };

        self.emit(Channel::Iopub, self.factory.status(&request, execution_state::BUSY))
            .await;

        let execute_code = (request.msg_type() == "execute_request")
            .then(|| request.get("code").cloned().unwrap_or(Value::Null));
        let execution_count = reply.get("execution_count").cloned();

        if self.config.emit_execute_io {
            if let Some(code) = &execute_code {
                let input = self.factory.build(
                    Some(&request),
                    "execute_input",
                    content_from(json!({ "code": code, "execution_count": execution_count })),
                );
                self.emit(Channel::Iopub, input).await;
            }
        }

        self.emit(channel, reply).await;

        if self.config.emit_execute_io {
            if let Some(code) = &execute_code {
                let result = self.factory.build(
                    Some(&request),
                    "execute_result",
                    content_from(json!({
                        "execution_count": execution_count,
                        "data": { "text/plain": code },
                        "metadata": {},
                    })),
                );
                self.emit(Channel::Iopub, result).await;
            }
        }

        self.emit(Channel::Iopub, self.factory.status(&request, execution_state::IDLE))
            .await;
    }

    async fn emit(&self, channel: Channel, message: Message) {
        tokio::time::sleep(self.config.step_delay).await;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // The receiving client may already be gone.
        let _ = self.inbox.send((channel, message));
    }

    fn reply_content(&self, request: &Message) -> Content {
        let value = match request.msg_type() {
            "execute_request" => {
                let count = self.execution_count.fetch_add(1, Ordering::AcqRel) + 1;
                json!({
                    "status": "ok",
                    "execution_count": count,
                    "user_expressions": {},
                    "payload": [],
                })
            }
            "kernel_info_request" => json!({
                "status": "ok",
                "protocol_version": "5.3",
                "implementation": "echo",
                "implementation_version": env!("CARGO_PKG_VERSION"),
                "language_info": {
                    "name": "echo",
                    "version": env!("CARGO_PKG_VERSION"),
                    "mimetype": "text/plain",
                    "file_extension": ".txt",
                },
                "banner": "echo kernel",
                "help_links": [],
            }),
            "complete_request" => {
                let cursor = request.get("cursor_pos").cloned().unwrap_or(json!(0));
                json!({
                    "status": "ok",
                    "matches": [],
                    "cursor_start": cursor,
                    "cursor_end": cursor,
                    "metadata": {},
                })
            }
            "is_complete_request" => json!({ "status": "complete" }),
            "shutdown_request" => json!({
                "status": "ok",
                "restart": request.get("restart").cloned().unwrap_or(json!(false)),
            }),
            _ => Value::Object(request.content().clone()),
        };
        content_from(value)
    }
}
