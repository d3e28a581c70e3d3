// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local cache of message contents which were shown to the user before.
//!
//! Message keys are deleted right after use, so a ciphertext can only ever be decrypted once.
//! Applications which render a conversation again (after a restart, when scrolling back) read the
//! plaintext from this cache instead. The cache lives in its own storage namespace and never
//! touches session state: a cache hit is not a successful decryption and a miss never falls back
//! to anything but a real decryption attempt.
use std::borrow::Cow;

use cinder_core::{ConversationId, MessageId, UserId};
use cinder_store::{SecureStorage, WriteOp};

use crate::error::StorageError;

/// Prefix of all cache entries in secure storage.
pub const DISPLAY_PREFIX: &str = "display/";

/// Text shown in place of a message which can not be decrypted anymore.
pub const DESTROYED_MESSAGE_PLACEHOLDER: &str = "This message can no longer be decrypted.";

/// What to show for a stored message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageContent {
    /// Decrypted just now.
    Decrypted(Vec<u8>),

    /// Decrypted (or written) on this device before.
    Cached(Vec<u8>),

    /// Can not be decrypted, render a placeholder.
    Destroyed,
}

impl MessageContent {
    pub fn plaintext(&self) -> Option<&[u8]> {
        match self {
            MessageContent::Decrypted(bytes) | MessageContent::Cached(bytes) => Some(bytes),
            MessageContent::Destroyed => None,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, MessageContent::Destroyed)
    }

    /// Text to render, lossy for non UTF-8 payloads.
    pub fn display_text(&self) -> Cow<'_, str> {
        match self.plaintext() {
            Some(bytes) => String::from_utf8_lossy(bytes),
            None => Cow::Borrowed(DESTROYED_MESSAGE_PLACEHOLDER),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DisplayCache<S> {
    storage: S,
}

impl<S> DisplayCache<S>
where
    S: SecureStorage,
{
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage_key(
        local_user_id: &UserId,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> String {
        format!(
            "{DISPLAY_PREFIX}{}/{}/{}",
            local_user_id.to_hex(),
            conversation_id.to_hex(),
            message_id.to_hex()
        )
    }

    pub async fn get(
        &self,
        local_user_id: &UserId,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.storage
            .get(&Self::storage_key(
                local_user_id,
                conversation_id,
                message_id,
            ))
            .await
            .map_err(StorageError::new)
    }

    pub async fn insert(
        &self,
        local_user_id: &UserId,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        plaintext: &[u8],
    ) -> Result<(), StorageError> {
        self.storage
            .set(
                &Self::storage_key(local_user_id, conversation_id, message_id),
                plaintext.to_vec(),
            )
            .await
            .map_err(StorageError::new)
    }

    /// Write operation caching a plaintext, to be committed together with session state.
    pub fn insert_op(
        local_user_id: &UserId,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        plaintext: &[u8],
    ) -> WriteOp {
        WriteOp::Set(
            Self::storage_key(local_user_id, conversation_id, message_id),
            plaintext.to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use cinder_store::MemoryStorage;

    use super::{DESTROYED_MESSAGE_PLACEHOLDER, DisplayCache, MessageContent};

    #[tokio::test]
    async fn cache_per_conversation() {
        let cache = DisplayCache::new(MemoryStorage::new());

        cache
            .insert(&"bob".into(), &"conv1".into(), &"1".into(), b"hello")
            .await
            .unwrap();

        assert_eq!(
            cache
                .get(&"bob".into(), &"conv1".into(), &"1".into())
                .await
                .unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(
            cache
                .get(&"bob".into(), &"conv2".into(), &"1".into())
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            cache
                .get(&"alice".into(), &"conv1".into(), &"1".into())
                .await
                .unwrap(),
            None
        );
    }

    #[test]
    fn display_text() {
        assert_eq!(MessageContent::Cached(b"hi".to_vec()).display_text(), "hi");
        assert_eq!(
            MessageContent::Destroyed.display_text(),
            DESTROYED_MESSAGE_PLACEHOLDER
        );
        assert!(MessageContent::Destroyed.plaintext().is_none());
    }
}
