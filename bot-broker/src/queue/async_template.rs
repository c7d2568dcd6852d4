//! Non-blocking façade over a [`BrokerClient`].
//!
//! Every operation returns a pending handle as soon as the payload is
//! encoded. Publishing and waiting for replies happen on the runtime the
//! template was built on, so callers never wait on the broker unless they
//! await the handle.
//!
//! ## Request/response
//!
//! ```text
//! send_and_receive ──► publish(reply_to, correlation_id) ──► broker
//!        │                                                      │
//!   PendingReply ◄── waiter[correlation_id] ◄── dispatcher ◄── replies()
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::BrokerClient;
use super::types::REQUESTS;
use crate::codec::JsonCodec;
use crate::error::{BrokerError, Result};
use crate::message::Message;

type ReplySender = oneshot::Sender<Result<Message>>;

/// Outstanding requests keyed by correlation id.
///
/// `None` once the reply stream has ended; no new requests are accepted.
struct Waiters {
    inner: Mutex<Option<HashMap<String, ReplySender>>>,
}

impl Waiters {
    fn open() -> Self {
        Self {
            inner: Mutex::new(Some(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<HashMap<String, ReplySender>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, correlation_id: String, tx: ReplySender) -> Result<()> {
        match self.lock().as_mut() {
            Some(map) => {
                map.insert(correlation_id, tx);
                Ok(())
            }
            None => Err(BrokerError::ReplyChannelClosed),
        }
    }

    fn take(&self, correlation_id: &str) -> Option<ReplySender> {
        self.lock().as_mut()?.remove(correlation_id)
    }

    fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Stop accepting requests and fail everything still waiting.
    fn close(&self) {
        let Some(map) = self.lock().take() else {
            return;
        };
        for (correlation_id, tx) in map {
            debug!(correlation_id = %correlation_id, "reply_waiter_failed");
            let _ = tx.send(Err(BrokerError::ReplyChannelClosed));
        }
    }
}

/// Async wrapper around a synchronous broker client.
pub struct AsyncTemplate<C: BrokerClient> {
    client: Arc<C>,
    codec: Arc<JsonCodec>,
    runtime: Handle,
    waiters: Arc<Waiters>,
    receive_timeout: Duration,
    /// Used by the `*_default` operations
    routing_key: String,
    dispatcher: JoinHandle<()>,
}

impl<C: BrokerClient> AsyncTemplate<C> {
    /// Wrap an already-connected client.
    ///
    /// Fails immediately with [`BrokerError::ClientUnavailable`] if the client
    /// is not open, rather than on first use.
    pub async fn new(
        client: Arc<C>,
        codec: Arc<JsonCodec>,
        receive_timeout: Duration,
    ) -> Result<Self> {
        if !client.is_open() {
            warn!("async_template_client_unavailable");
            return Err(BrokerError::ClientUnavailable);
        }

        let replies = client.replies().await?;
        let waiters = Arc::new(Waiters::open());
        let runtime = Handle::current();
        let dispatcher = runtime.spawn(dispatch_replies(replies, Arc::clone(&waiters)));

        info!(
            reply_address = client.reply_address(),
            receive_timeout_ms = receive_timeout.as_millis() as u64,
            "async_template_ready"
        );

        Ok(Self {
            client,
            codec,
            runtime,
            waiters,
            receive_timeout,
            routing_key: REQUESTS.to_string(),
            dispatcher,
        })
    }

    /// Replace the default routing key, [`REQUESTS`] unless set.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// [`send`](Self::send) to the default routing key.
    pub fn send_default<T: Serialize + ?Sized>(&self, payload: &T) -> Result<PendingSend> {
        self.send(&self.routing_key, payload)
    }

    /// [`send_and_receive`](Self::send_and_receive) to the default routing key.
    pub fn send_and_receive_default<Req, Resp>(&self, request: &Req) -> Result<PendingReply<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.send_and_receive(&self.routing_key, request)
    }

    /// Publish a payload to a queue on the default exchange.
    ///
    /// Returns as soon as the publish is scheduled; await the handle to learn
    /// whether the broker confirmed it.
    pub fn send<T: Serialize + ?Sized>(&self, routing_key: &str, payload: &T) -> Result<PendingSend> {
        let message = self.codec.encode(payload)?;
        let client = Arc::clone(&self.client);
        let routing_key = routing_key.to_string();

        let handle = self
            .runtime
            .spawn(async move { client.publish("", &routing_key, message).await });

        Ok(PendingSend { handle })
    }

    /// Publish a request and return a handle resolving to the decoded reply.
    ///
    /// The handle fails with [`BrokerError::ReplyTimeout`] if no reply
    /// arrives within the receive timeout. Dropping it abandons the request.
    pub fn send_and_receive<Req, Resp>(
        &self,
        routing_key: &str,
        request: &Req,
    ) -> Result<PendingReply<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut message = self.codec.encode(request)?;
        let correlation_id = Uuid::new_v4().to_string();
        message.properties.correlation_id = Some(correlation_id.clone());
        message.properties.reply_to = Some(self.client.reply_address().to_string());

        let (tx, rx) = oneshot::channel();
        self.waiters.register(correlation_id.clone(), tx)?;

        let client = Arc::clone(&self.client);
        let waiters = Arc::clone(&self.waiters);
        let routing_key = routing_key.to_string();
        let id = correlation_id.clone();

        self.runtime.spawn(async move {
            if let Err(e) = client.publish("", &routing_key, message).await {
                warn!(
                    correlation_id = %id,
                    routing_key = %routing_key,
                    error = %e,
                    "async_template_request_publish_failed"
                );
                if let Some(tx) = waiters.take(&id) {
                    let _ = tx.send(Err(e));
                }
            }
        });

        Ok(PendingReply {
            correlation_id,
            rx,
            deadline: Instant::now() + self.receive_timeout,
            timeout: self.receive_timeout,
            sleep: None,
            codec: Arc::clone(&self.codec),
            waiters: Arc::clone(&self.waiters),
            _reply: PhantomData,
        })
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.waiters.len()
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }
}

impl<C: BrokerClient> Drop for AsyncTemplate<C> {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.waiters.close();
    }
}

/// Route replies to their waiters until the stream ends.
async fn dispatch_replies(mut replies: BoxStream<'static, Message>, waiters: Arc<Waiters>) {
    while let Some(reply) = replies.next().await {
        let Some(correlation_id) = reply.properties.correlation_id.clone() else {
            warn!(body_length = reply.body.len(), "reply_missing_correlation_id");
            continue;
        };

        match waiters.take(&correlation_id) {
            Some(tx) => {
                debug!(correlation_id = %correlation_id, "reply_dispatched");
                let _ = tx.send(Ok(reply));
            }
            // Late reply for a request that timed out or was dropped
            None => warn!(correlation_id = %correlation_id, "reply_unmatched"),
        }
    }

    warn!("reply_stream_closed");
    waiters.close();
}

/// Handle for a scheduled publish.
#[must_use = "a PendingSend does nothing unless awaited or checked"]
pub struct PendingSend {
    handle: JoinHandle<Result<()>>,
}

impl PendingSend {
    /// Whether the publish has completed, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for PendingSend {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(BrokerError::TaskFailed(e.to_string())),
        })
    }
}

/// Handle for an outstanding request, resolving to the decoded reply.
#[must_use = "dropping a PendingReply abandons the request"]
pub struct PendingReply<T> {
    correlation_id: String,
    rx: oneshot::Receiver<Result<Message>>,
    deadline: Instant,
    timeout: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    codec: Arc<JsonCodec>,
    waiters: Arc<Waiters>,
    _reply: PhantomData<fn() -> T>,
}

impl<T> PendingReply<T> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl<T: DeserializeOwned> Future for PendingReply<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Poll::Ready(received) = Pin::new(&mut this.rx).poll(cx) {
            return Poll::Ready(match received {
                Ok(Ok(reply)) => this.codec.decode(&reply).map_err(BrokerError::from),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(BrokerError::ReplyChannelClosed),
            });
        }

        // The timer is created on first poll so the handle can be built
        // outside a runtime context
        let deadline = this.deadline;
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));

        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.waiters.take(&this.correlation_id);
                warn!(
                    correlation_id = %this.correlation_id,
                    timeout_ms = this.timeout.as_millis() as u64,
                    "reply_timeout"
                );
                Poll::Ready(Err(BrokerError::ReplyTimeout {
                    correlation_id: this.correlation_id.clone(),
                    timeout: this.timeout,
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        self.waiters.take(&self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryClient;
    use crate::queue::types::{EVENTS, REQUESTS};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        #[serde(rename = "type")]
        kind: String,
        id: i32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        id: i32,
        latency_ms: u64,
    }

    fn ping(id: i32) -> Ping {
        Ping {
            kind: "PING".to_string(),
            id,
        }
    }

    async fn template(client: Arc<MemoryClient>) -> AsyncTemplate<MemoryClient> {
        AsyncTemplate::new(client, Arc::new(JsonCodec::new()), Duration::from_secs(30))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_fails_fast_on_closed_client() {
        let client = Arc::new(MemoryClient::closed());
        let result =
            AsyncTemplate::new(client, Arc::new(JsonCodec::new()), Duration::from_secs(1)).await;

        assert!(matches!(result, Err(BrokerError::ClientUnavailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_returns_before_publish_completes() {
        let client = Arc::new(MemoryClient::new().with_publish_delay(Duration::from_secs(3600)));
        let template = template(Arc::clone(&client)).await;

        let pending = template.send(EVENTS, &ping(1)).unwrap();
        assert!(!pending.is_finished());
        assert!(client.published().is_empty());

        pending.await.unwrap();

        let published = client.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "");
        assert_eq!(published[0].routing_key, EVENTS);
    }

    #[tokio::test]
    async fn test_default_routing_key() {
        let client = Arc::new(MemoryClient::new());
        let template = template(Arc::clone(&client)).await;
        assert_eq!(template.routing_key(), REQUESTS);

        let template = template.with_routing_key("bot-commands");
        template.send_default(&ping(8)).unwrap().await.unwrap();
        let pending = template.send_and_receive_default::<_, Pong>(&ping(9)).unwrap();

        let published = client.wait_for_published(2).await;
        assert!(published.iter().all(|p| p.routing_key == "bot-commands"));
        assert_eq!(
            published[1].message.properties.correlation_id.as_deref(),
            Some(pending.correlation_id())
        );
    }

    #[tokio::test]
    async fn test_send_reports_publish_failure() {
        let client = Arc::new(MemoryClient::new());
        let template = template(Arc::clone(&client)).await;

        client.close().await.unwrap();

        let result = template.send(EVENTS, &ping(2)).unwrap().await;
        assert!(matches!(result, Err(BrokerError::ClientUnavailable)));
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let client = Arc::new(MemoryClient::new());
        let template = template(Arc::clone(&client)).await;
        let codec = JsonCodec::new();

        let pending = template
            .send_and_receive::<_, Pong>(REQUESTS, &ping(42))
            .unwrap();
        assert_eq!(template.pending_replies(), 1);

        let request = client.wait_for_published(1).await.remove(0);
        assert_eq!(request.routing_key, REQUESTS);
        assert_eq!(
            request.message.properties.correlation_id.as_deref(),
            Some(pending.correlation_id())
        );
        assert_eq!(
            request.message.properties.reply_to.as_deref(),
            Some(client.reply_address())
        );

        let received: Ping = codec.decode(&request.message).unwrap();
        assert_eq!(received, ping(42));

        let reply = codec
            .encode(&Pong {
                id: 42,
                latency_ms: 12,
            })
            .unwrap();
        client.reply_to(&request.message, reply).unwrap();

        let pong = pending.await.unwrap();
        assert_eq!(
            pong,
            Pong {
                id: 42,
                latency_ms: 12
            }
        );
        assert_eq!(template.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_replies_routed_by_correlation_id() {
        let client = Arc::new(MemoryClient::new());
        let template = template(Arc::clone(&client)).await;
        let codec = JsonCodec::new();

        let first = template.send_and_receive::<_, Pong>(REQUESTS, &ping(1)).unwrap();
        let second = template.send_and_receive::<_, Pong>(REQUESTS, &ping(2)).unwrap();

        let requests = client.wait_for_published(2).await;
        // Answer in reverse order
        for request in requests.iter().rev() {
            let ping: Ping = codec.decode(&request.message).unwrap();
            let reply = codec
                .encode(&Pong {
                    id: ping.id,
                    latency_ms: 0,
                })
                .unwrap();
            client.reply_to(&request.message, reply).unwrap();
        }

        assert_eq!(first.await.unwrap().id, 1);
        assert_eq!(second.await.unwrap().id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_timeout() {
        let client = Arc::new(MemoryClient::new());
        let template =
            AsyncTemplate::new(Arc::clone(&client), Arc::new(JsonCodec::new()), Duration::from_secs(5))
                .await
                .unwrap();

        let pending = template
            .send_and_receive::<_, Pong>(REQUESTS, &ping(3))
            .unwrap();
        let correlation_id = pending.correlation_id().to_string();

        let err = pending.await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::ReplyTimeout { correlation_id: id, timeout }
                if id == correlation_id && timeout == Duration::from_secs(5)
        ));
        assert_eq!(template.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_dropping_pending_reply_removes_waiter() {
        let client = Arc::new(MemoryClient::new());
        let template = template(Arc::clone(&client)).await;

        let pending = template
            .send_and_receive::<_, Pong>(REQUESTS, &ping(4))
            .unwrap();
        assert_eq!(template.pending_replies(), 1);

        drop(pending);
        assert_eq!(template.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_outstanding_requests_fail_when_replies_close() {
        let client = Arc::new(MemoryClient::new());
        let template = template(Arc::clone(&client)).await;

        let pending = template
            .send_and_receive::<_, Pong>(REQUESTS, &ping(5))
            .unwrap();
        client.wait_for_published(1).await;
        client.close().await.unwrap();

        assert!(matches!(pending.await, Err(BrokerError::ReplyChannelClosed)));
        assert!(matches!(
            template.send_and_receive::<_, Pong>(REQUESTS, &ping(6)),
            Err(BrokerError::ReplyChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_ignored() {
        let client = Arc::new(MemoryClient::new());
        let template = template(Arc::clone(&client)).await;
        let codec = JsonCodec::new();

        let pending = template
            .send_and_receive::<_, Pong>(REQUESTS, &ping(7))
            .unwrap();
        let request = client.wait_for_published(1).await.remove(0);

        let mut stray = codec.encode(&Pong { id: 0, latency_ms: 0 }).unwrap();
        stray.properties.correlation_id = Some("not-a-request".to_string());
        client.inject_reply(stray).unwrap();
        client.inject_reply(Message::default()).unwrap();

        let reply = codec.encode(&Pong { id: 7, latency_ms: 1 }).unwrap();
        client.reply_to(&request.message, reply).unwrap();

        assert_eq!(pending.await.unwrap().id, 7);
    }
}
