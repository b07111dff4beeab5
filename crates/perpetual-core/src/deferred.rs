//! Channel handle usable before its channel exists
//!
//! Components are often wired together before the channel they will talk to
//! has been built. A `DeferredChannel` accepts sends right away, buffers them
//! in memory, and flushes them in order once a channel is bound and connected.
//! Once the buffer is drained, sends are forwarded directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::{self, FutureExt};
use tracing::debug;

use crate::channel::PerpetualChannel;
use crate::connection::SendFuture;
use crate::errors::SocketError;
use crate::message::Message;
use crate::scheduler::Scheduler;
use crate::worker::SequentialWorker;

/// Late-bound handle to a perpetual channel
#[derive(Clone)]
pub struct DeferredChannel {
    shared: Arc<DeferredShared>,
}

struct DeferredShared {
    channel: OnceLock<PerpetualChannel>,
    /// Disabled until bound; holds sends made before binding
    buffer: SequentialWorker<()>,
    drained: AtomicBool,
}

impl DeferredChannel {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            shared: Arc::new(DeferredShared {
                channel: OnceLock::new(),
                buffer: SequentialWorker::new(scheduler, "deferred-channel", (), false),
                drained: AtomicBool::new(false),
            }),
        }
    }

    /// Bind the channel and start flushing; only the first bind wins
    pub fn bind(&self, channel: PerpetualChannel) -> bool {
        let name = channel.name().to_string();
        if self.shared.channel.set(channel).is_err() {
            return false;
        }

        debug!(channel = %name, "Deferred channel bound");
        self.shared.buffer.enable(true);
        let shared = Arc::clone(&self.shared);
        let _ = self.shared.buffer.submit(move |_: &mut ()| {
            shared.drained.store(true, Ordering::Release);
        });
        true
    }

    pub fn is_bound(&self) -> bool {
        self.shared.channel.get().is_some()
    }

    /// The bound channel, if any
    pub fn channel(&self) -> Option<PerpetualChannel> {
        self.shared.channel.get().cloned()
    }

    /// False until bound, then mirrors the channel
    pub fn is_connected(&self) -> bool {
        self.shared
            .channel
            .get()
            .is_some_and(PerpetualChannel::is_connected)
    }

    /// Send now if the channel is ready, otherwise once it is
    pub fn send_message(&self, message: impl Into<Message>) -> SendFuture {
        let message = message.into();
        if self.shared.drained.load(Ordering::Acquire) {
            if let Some(channel) = self.shared.channel.get() {
                return channel.send_message(message);
            }
        }

        let shared = Arc::clone(&self.shared);
        let task = self.shared.buffer.submit_async(move |_: &mut ()| async move {
            let Some(channel) = shared.channel.get().cloned() else {
                return future::ready(Err(SocketError::illegal_state("Channel not bound"))).boxed();
            };
            wait_until_connected(&channel).await;
            channel.send_message(message)
        });

        async move {
            match task.await {
                Ok(sent) => sent.await,
                Err(err) => Err(SocketError::illegal_state(err.to_string())),
            }
        }
        .boxed()
    }
}

async fn wait_until_connected(channel: &PerpetualChannel) {
    let mut connections = channel.subscribe_connections();
    while !channel.is_connected() && !channel.is_closed() {
        if connections.changed().await.is_err() {
            break;
        }
    }
}

impl std::fmt::Debug for DeferredChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredChannel")
            .field("bound", &self.is_bound())
            .field("drained", &self.shared.drained.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbound_is_not_connected() {
        let deferred = DeferredChannel::new(&Scheduler::current());
        assert!(!deferred.is_bound());
        assert!(!deferred.is_connected());
        assert!(deferred.channel().is_none());

        let pending = deferred.send_message("queued");
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(20), pending).await;
        assert!(outcome.is_err(), "send must wait for a channel");
    }
}
