//! Append-only merged view of local and remote messages
//!
//! Messages are kept in the order the log observes them, not in timestamp
//! order. A subscriber always starts from the full accumulated history and
//! then sees every later append.

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::Message;

// ----------------------------------------------------------------------------
// Message Log
// ----------------------------------------------------------------------------

/// Shared, append-only message history
#[derive(Debug, Clone)]
pub struct MessageLog {
    history: watch::Sender<Vec<Message>>,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    pub fn new() -> Self {
        let (history, _) = watch::channel(Vec::new());
        Self { history }
    }

    /// Append one message at the end of the log
    pub fn append(&self, message: Message) {
        self.history.send_modify(|history| history.push(message));
    }

    /// Copy of the current history
    pub fn snapshot(&self) -> Vec<Message> {
        self.history.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.history.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.borrow().is_empty()
    }

    /// Subscribe to the log; the view starts at the full history
    pub fn subscribe(&self) -> MessageLogView {
        MessageLogView {
            receiver: self.history.subscribe(),
        }
    }

    /// Fold two message sources into the log in arrival order
    ///
    /// The task ends once both sources are closed.
    pub fn merge(
        &self,
        mut local: broadcast::Receiver<Message>,
        mut remote: broadcast::Receiver<Message>,
    ) -> JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            let mut local_open = true;
            let mut remote_open = true;

            while local_open || remote_open {
                tokio::select! {
                    received = local.recv(), if local_open => {
                        local_open = log.absorb("local", received);
                    }
                    received = remote.recv(), if remote_open => {
                        remote_open = log.absorb("remote", received);
                    }
                }
            }
            debug!("Message log merge finished");
        })
    }

    /// Append a received message; returns whether the source is still open
    fn absorb(
        &self,
        source: &str,
        received: Result<Message, broadcast::error::RecvError>,
    ) -> bool {
        match received {
            Ok(message) => {
                self.append(message);
                true
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Message log lagged behind {} source, {} skipped", source, skipped);
                true
            }
            Err(broadcast::error::RecvError::Closed) => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Message Log View
// ----------------------------------------------------------------------------

/// A subscriber's view of the log
#[derive(Debug, Clone)]
pub struct MessageLogView {
    receiver: watch::Receiver<Vec<Message>>,
}

impl MessageLogView {
    /// Current full history
    pub fn current(&self) -> Vec<Message> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next append and return the full history after it
    ///
    /// Returns `None` once the log has been dropped.
    pub async fn changed(&mut self) -> Option<Vec<Message>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Author;
    use crate::types::{PeerDevice, Timestamp};

    #[test]
    fn test_append_keeps_arrival_order() {
        let log = MessageLog::new();
        let peer = PeerDevice::new(None, "AA");

        let late = Message::new(Author::Local, "late".to_string(), Timestamp::new(100));
        let early = Message::new(Author::Peer(peer), "early".to_string(), Timestamp::new(1));
        log.append(late);
        log.append(early);

        let texts: Vec<_> = log.snapshot().iter().map(|m| m.text().to_string()).collect();
        assert_eq!(texts, vec!["late", "early"]);
    }

    #[tokio::test]
    async fn test_fresh_subscriber_sees_history() {
        let log = MessageLog::new();
        log.append(Message::local("one"));
        log.append(Message::local("two"));

        let mut view = log.subscribe();
        assert_eq!(view.current().len(), 2);

        log.append(Message::local("three"));
        let history = view.changed().await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].text(), "three");
    }

    #[tokio::test]
    async fn test_merge_two_sources() {
        let log = MessageLog::new();
        let (local_tx, local_rx) = broadcast::channel(8);
        let (remote_tx, remote_rx) = broadcast::channel(8);
        let merge = log.merge(local_rx, remote_rx);

        let peer = PeerDevice::new(Some("Pixel".to_string()), "AA");
        local_tx.send(Message::local("hello")).unwrap();
        while log.len() < 1 {
            tokio::task::yield_now().await;
        }
        remote_tx.send(Message::from_peer(peer, "hi back")).unwrap();

        drop(local_tx);
        drop(remote_tx);
        merge.await.unwrap();

        let history = log.snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "hello");
        assert!(!history[1].author().is_local());
    }
}
