//! Lifecycle tracking for one outstanding request.
//!
//! A request starts `Pending` and becomes `Idle` exactly once, when the
//! `status: idle` message carrying its id is observed. There is no error
//! state: a request whose idle never arrives stays pending and waiters time
//! out. The only other exit is `Abandoned`, reached when the owning client
//! is torn down.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::debug;
use serde::Serialize;
use tokio::sync::watch;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::history::HistoryRing;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Sent, idle status not yet seen
    Pending,
    /// Terminal idle status observed
    Idle,
    /// Client torn down before idle
    Abandoned,
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Pending => write!(f, "pending"),
            RequestState::Idle => write!(f, "idle"),
            RequestState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Handle to a sent request. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

struct RequestInner {
    message: Message,
    channel: Channel,
    state: watch::Sender<RequestState>,
    activity: StdMutex<Activity>,
}

struct Activity {
    log: HistoryRing<Message>,
    reply: Option<Message>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id())
            .field("type", &self.msg_type())
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .finish()
    }
}

impl Request {
    /// Track `message`, sent on `channel`, keeping up to `history_capacity`
    /// messages of activity.
    pub fn new(message: Message, channel: Channel, history_capacity: usize) -> Self {
        let (state, _) = watch::channel(RequestState::Pending);
        Self {
            inner: Arc::new(RequestInner {
                message,
                channel,
                state,
                activity: StdMutex::new(Activity {
                    log: HistoryRing::new(history_capacity),
                    reply: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.message.id()
    }

    pub fn msg_type(&self) -> &str {
        self.inner.message.msg_type()
    }

    pub fn channel(&self) -> Channel {
        self.inner.channel
    }

    /// The initiating message.
    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    pub fn state(&self) -> RequestState {
        *self.inner.state.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == RequestState::Idle
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Activity> {
        match self.inner.activity.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The reply message, once it has arrived.
    pub fn reply(&self) -> Option<Message> {
        self.activity().reply.clone()
    }

    /// Messages addressed to this request, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.activity().log.to_vec()
    }

    /// Note a message whose `parent_id` is this request's id.
    pub(crate) fn record(&self, message: &Message) {
        let mut activity = self.activity();
        if message.is_reply() && activity.reply.is_none() {
            activity.reply = Some(message.clone());
        }
        activity.log.push(message.clone());
    }

    /// Mark the request idle. Returns whether this call made the transition;
    /// repeated calls leave the state alone and wake nobody.
    pub fn on_idle_message_observed(&self) -> bool {
        let transitioned = self.inner.state.send_if_modified(|state| {
            if *state == RequestState::Pending {
                *state = RequestState::Idle;
                true
            } else {
                false
            }
        });
        if transitioned {
            debug!("[request] {} {} is idle", self.msg_type(), self.id());
        }
        transitioned
    }

    /// Give up on the request. Pending waiters fail with `Disconnected`.
    pub(crate) fn abandon(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == RequestState::Pending {
                *state = RequestState::Abandoned;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the request is idle.
    ///
    /// Fails with `Timeout` if `timeout` elapses first (the request may
    /// still become idle later) and with `Disconnected` if the client was
    /// torn down. Holds no lock while waiting.
    pub async fn await_idle(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != RequestState::Pending),
        )
        .await;

        match waited {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(Err(_)) => Err(Error::Disconnected),
            Ok(Ok(state)) => match *state {
                RequestState::Idle => Ok(()),
                _ => Err(Error::Disconnected),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{content_from, Content, MessageFactory};
    use serde_json::json;

    fn tracked(capacity: usize) -> (MessageFactory, Request) {
        let factory = MessageFactory::new();
        let message = factory.build(None, "execute_request", content_from(json!({"code": "1"})));
        (factory, Request::new(message, Channel::Shell, capacity))
    }

    #[test]
    fn test_starts_pending() {
        let (_, request) = tracked(4);
        assert_eq!(request.state(), RequestState::Pending);
        assert!(!request.is_idle());
        assert!(request.reply().is_none());
        assert_eq!(request.channel(), Channel::Shell);
        assert_eq!(request.msg_type(), "execute_request");
    }

    #[test]
    fn test_idle_transition_is_idempotent() {
        let (_, request) = tracked(4);
        assert!(request.on_idle_message_observed());
        assert!(!request.on_idle_message_observed());
        assert_eq!(request.state(), RequestState::Idle);
    }

    #[test]
    fn test_idle_is_never_abandoned() {
        let (_, request) = tracked(4);
        request.on_idle_message_observed();
        assert!(!request.abandon());
        assert!(request.is_idle());
    }

    #[test]
    fn test_record_captures_first_reply_and_bounds_log() {
        let (factory, request) = tracked(2);
        let busy = factory.status(request.message(), "busy");
        let reply = factory.reply(request.message(), Content::new()).unwrap();
        let idle = factory.status(request.message(), "idle");

        request.record(&busy);
        request.record(&reply);
        request.record(&idle);

        assert_eq!(request.reply().unwrap().id(), reply.id());
        let log: Vec<String> = request.history().iter().map(|m| m.id().to_string()).collect();
        assert_eq!(log, vec![reply.id().to_string(), idle.id().to_string()]);
    }

    #[tokio::test]
    async fn test_await_idle_already_idle() {
        let (_, request) = tracked(4);
        request.on_idle_message_observed();
        request.await_idle(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_await_idle_releases_all_waiters() {
        let (_, request) = tracked(4);
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let request = request.clone();
                tokio::spawn(async move { request.await_idle(Duration::from_secs(5)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        request.on_idle_message_observed();
        request.on_idle_message_observed();

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_timeout_leaves_request_pending() {
        let (_, request) = tracked(4);
        let err = request
            .await_idle(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(request.state(), RequestState::Pending);

        // A later idle still completes a retried wait.
        request.on_idle_message_observed();
        request.await_idle(Duration::from_millis(20)).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandon_fails_waiters_with_disconnected() {
        let (_, request) = tracked(4);
        let waiter = {
            let request = request.clone();
            tokio::spawn(async move { request.await_idle(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(request.abandon());

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Disconnected));
        assert_eq!(request.state(), RequestState::Abandoned);
        assert!(!request.on_idle_message_observed());
    }
}
