// SPDX-License-Identifier: MIT OR Apache-2.0

//! Boundary to the message store which persists ciphertexts and pushes new ones to recipients.
//!
//! The store only ever sees opaque blobs (serialized envelopes).
use std::sync::Arc;

use cinder_core::{ConversationId, MessageId, UserId};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};

/// Capacity of the push channel, slow subscribers miss older notifications and need to poll.
const PUSH_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub blob: String,
}

pub trait MessageTransport {
    /// Appends a ciphertext blob to a conversation.
    fn put(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        blob: String,
    ) -> impl Future<Output = Result<MessageId, TransportError>>;

    /// All messages of a conversation in the order they were appended.
    fn messages(
        &self,
        conversation_id: &ConversationId,
    ) -> impl Future<Output = Result<Vec<StoredMessage>, TransportError>>;

    /// Push notifications for every newly appended message.
    fn subscribe(&self) -> broadcast::Receiver<StoredMessage>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default)]
struct InnerMemoryTransport {
    messages: Vec<StoredMessage>,
    next_id: u64,
}

/// Append-only in-memory message store with push.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    inner: Arc<RwLock<InnerMemoryTransport>>,
    push: broadcast::Sender<StoredMessage>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        let (push, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::default(),
            push,
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageTransport for MemoryTransport {
    async fn put(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        blob: String,
    ) -> Result<MessageId, TransportError> {
        let mut inner = self.inner.write().await;
        let id = MessageId::new(format!("{:08}", inner.next_id));
        inner.next_id += 1;

        let message = StoredMessage {
            id: id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            blob,
        };
        inner.messages.push(message.clone());

        // Nobody listening is fine.
        let _ = self.push.send(message);

        Ok(id)
    }

    async fn messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<StoredMessage>, TransportError> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .filter(|message| &message.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoredMessage> {
        self.push.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryTransport, MessageTransport};

    #[tokio::test]
    async fn append_and_push() {
        let transport = MemoryTransport::new();
        let mut rx = transport.subscribe();

        let id_1 = transport
            .put(&"conv1".into(), &"alice".into(), "blob-1".into())
            .await
            .unwrap();
        let id_2 = transport
            .put(&"conv2".into(), &"bob".into(), "blob-2".into())
            .await
            .unwrap();
        assert_ne!(id_1, id_2);

        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.id, id_1);
        assert_eq!(pushed.blob, "blob-1");

        let conv1 = transport.messages(&"conv1".into()).await.unwrap();
        assert_eq!(conv1.len(), 1);
        assert_eq!(conv1[0].sender_id.as_str(), "alice");
    }
}
