use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{trace, warn};

use crate::models::ChatFragment;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub chat_id: String,
    /// Which request produced the fragment; see [`ResponseEvents::next_stream_id`].
    pub stream_id: u64,
    pub fragment: ChatFragment,
}

/// Process-wide channel that the model backend publishes response fragments on.
#[derive(Clone)]
pub struct ResponseEvents {
    tx: broadcast::Sender<ResponseEvent>,
    next_stream_id: Arc<AtomicU64>,
}

impl ResponseEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, next_stream_id: Arc::new(AtomicU64::new(1)) }
    }

    /// Fresh id for one streaming request, unique for the life of the process.
    pub fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn emit(&self, chat_id: &str, stream_id: u64, fragment: ChatFragment) {
        let event = ResponseEvent { chat_id: chat_id.to_string(), stream_id, fragment };
        if self.tx.send(event).is_err() {
            trace!(chat_id, stream_id, "response fragment dropped: no subscribers");
        }
    }

    /// Starts listening for fragments addressed to `chat_id`.
    pub fn subscribe(&self, chat_id: impl Into<String>) -> Subscription {
        Subscription { chat_id: chat_id.into(), stream_id: None, rx: Some(self.tx.subscribe()) }
    }
}

impl Default for ResponseEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one view's interest in one chat's fragments.
///
/// Released by [`Subscription::unsubscribe`] or by dropping it; after that no
/// fragment is delivered through it.
pub struct Subscription {
    chat_id: String,
    stream_id: Option<u64>,
    rx: Option<broadcast::Receiver<ResponseEvent>>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    /// Narrows delivery to fragments of `stream_id` and discards everything
    /// queued before, including other views' streams on the same chat.
    pub fn follow(&mut self, stream_id: u64) {
        let mut stale = 0usize;
        if let Some(rx) = self.rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => stale += 1,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Closed) => {
                        self.rx = None;
                        break;
                    }
                }
            }
        }
        if stale > 0 {
            trace!(chat_id = %self.chat_id, stream_id, stale, "discarded queued fragments");
        }
        self.stream_id = Some(stream_id);
    }

    fn wants(&self, event: &ResponseEvent) -> bool {
        event.chat_id == self.chat_id && self.stream_id.map_or(true, |id| id == event.stream_id)
    }

    /// Next fragment for this chat. `None` once released or the channel is closed.
    pub async fn recv(&mut self) -> Option<ChatFragment> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event.fragment),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(chat_id = %self.chat_id, skipped, "subscriber lagged; fragments lost");
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Like [`recv`](Self::recv) but only takes what is already queued.
    pub fn try_recv(&mut self) -> Option<ChatFragment> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event.fragment),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(chat_id = %self.chat_id, skipped, "subscriber lagged; fragments lost");
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn fragment(text: &str) -> ChatFragment {
        ChatFragment { role: Role::Assistant, content: text.to_string() }
    }

    #[tokio::test]
    async fn subscription_only_sees_its_chat() {
        let events = ResponseEvents::new();
        let mut sub = events.subscribe("a");
        events.emit("b", 1, fragment("other"));
        events.emit("a", 2, fragment("mine"));
        assert_eq!(sub.recv().await, Some(fragment("mine")));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn following_a_stream_drops_backlog_and_other_streams() {
        let events = ResponseEvents::new();
        let mut sub = events.subscribe("a");
        events.emit("a", 7, fragment("queued while idle"));

        let mine = events.next_stream_id();
        sub.follow(mine);
        events.emit("a", mine + 100, fragment("another view"));
        events.emit("a", mine, fragment("mine"));

        assert_eq!(sub.recv().await, Some(fragment("mine")));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn stream_ids_are_unique_across_clones() {
        let events = ResponseEvents::new();
        let other = events.clone();
        let a = events.next_stream_id();
        let b = other.next_stream_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn released_subscription_receives_nothing() {
        let events = ResponseEvents::new();
        let mut sub = events.subscribe("a");
        sub.unsubscribe();
        events.emit("a", 1, fragment("late"));
        assert!(!sub.is_active());
        assert_eq!(sub.recv().await, None);
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        ResponseEvents::new().emit("a", 1, fragment("nobody"));
    }
}
