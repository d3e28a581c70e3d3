// SPDX-License-Identifier: MIT OR Apache-2.0

use assert_matches::assert_matches;
use cinder_core::{ConversationId, UserId};
use cinder_encryption::test_utils::{TestPeer, setup_logging, test_config};
use cinder_encryption::{
    Config, HandshakeError, KeyDirectory, MemoryDirectory, Rng, SessionError, SessionManager,
};
use cinder_store::MemoryStorage;
use serde_json::Value;

async fn first_contact(from: &TestPeer, to: &TestPeer) -> String {
    let conversation_id = ConversationId::new(format!("{}-{}", from.user_id, to.user_id));
    let blob = from
        .manager
        .encrypt_for_peer(&from.user_id, &to.user_id, &conversation_id, b"hello")
        .await
        .unwrap();
    let plaintext = to
        .manager
        .decrypt_from_peer(&to.user_id, &from.user_id, &conversation_id, &blob)
        .await
        .unwrap();
    assert_eq!(plaintext, b"hello");
    blob
}

async fn published_prekey_ids(directory: &MemoryDirectory, peer: &TestPeer) -> Vec<u64> {
    // The returned bundle still lists the key claimed by this fetch.
    let bundle = directory.fetch(&peer.user_id).await.unwrap().unwrap();
    bundle
        .onetime_prekeys()
        .iter()
        .map(|prekey| prekey.id())
        .collect()
}

#[tokio::test]
async fn prekeys_are_consumed_and_refilled() {
    setup_logging();

    let directory = MemoryDirectory::new();
    let bob = TestPeer::new("bob", 1, &directory);
    bob.ensure_identity().await.unwrap();

    let senders = [
        TestPeer::new("alice", 2, &directory),
        TestPeer::new("carol", 3, &directory),
        TestPeer::new("dave", 4, &directory),
    ];
    for sender in &senders {
        sender.ensure_identity().await.unwrap();
    }

    // Every sender gets its own prekey.
    first_contact(&senders[0], &bob).await;
    first_contact(&senders[1], &bob).await;
    let identity = bob.manager.identity().await.unwrap().unwrap();
    assert_eq!(identity.onetime_prekey_count(), 2);

    // Dropping to the threshold tops the pool up and republishes it.
    let blob = first_contact(&senders[2], &bob).await;
    let value: Value = serde_json::from_str(&blob).unwrap();
    assert_eq!(value["handshake"]["oneTimePrekeyId"], "2");

    let identity = bob.manager.identity().await.unwrap().unwrap();
    assert_eq!(identity.onetime_prekey_count(), 4);
    assert!(identity.is_published());
    assert_eq!(published_prekey_ids(&directory, &bob).await, vec![3, 4, 5, 6]);
}

#[tokio::test]
async fn answering_handshakes_keeps_initiator_prekeys() {
    setup_logging();

    let directory = MemoryDirectory::new();
    let alice = TestPeer::new("alice", 1, &directory);
    alice.ensure_identity().await.unwrap();

    let peers = [
        TestPeer::new("bob", 2, &directory),
        TestPeer::new("carol", 3, &directory),
        TestPeer::new("dave", 4, &directory),
        TestPeer::new("erin", 5, &directory),
    ];
    for peer in &peers {
        peer.ensure_identity().await.unwrap();
        first_contact(&alice, peer).await;
    }

    // Verifying Alice's handshakes never handed out her one-time prekeys.
    let bundle = directory
        .fetch_identity(&alice.user_id)
        .await
        .unwrap()
        .unwrap();
    let ids: Vec<u64> = bundle
        .onetime_prekeys()
        .iter()
        .map(|prekey| prekey.id())
        .collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);

    let identity = alice.manager.identity().await.unwrap().unwrap();
    assert_eq!(identity.onetime_prekey_count(), 4);

    // The next initiator still gets one.
    let frank = TestPeer::new("frank", 6, &directory);
    frank.ensure_identity().await.unwrap();
    let blob = first_contact(&frank, &alice).await;
    let value: Value = serde_json::from_str(&blob).unwrap();
    assert_eq!(value["handshake"]["oneTimePrekeyId"], "0");
}

#[tokio::test]
async fn handshake_without_prekey() {
    setup_logging();

    let directory = MemoryDirectory::new();
    let alice = TestPeer::new("alice", 1, &directory);
    let bob = TestPeer::new("bob", 2, &directory);
    alice.ensure_identity().await.unwrap();
    bob.ensure_identity().await.unwrap();

    // Someone drained the pool in the directory.
    for _ in 0..4 {
        directory.fetch(&bob.user_id).await.unwrap();
    }

    let blob = first_contact(&alice, &bob).await;
    let value: Value = serde_json::from_str(&blob).unwrap();
    assert!(value["handshake"].get("oneTimePrekeyId").is_none());

    // No prekey was consumed locally.
    let identity = bob.manager.identity().await.unwrap().unwrap();
    assert_eq!(identity.onetime_prekey_count(), 4);
}

#[tokio::test]
async fn replayed_handshake_without_prekey() {
    setup_logging();

    let directory = MemoryDirectory::new();
    let alice = TestPeer::new("alice", 1, &directory);
    let bob = TestPeer::new("bob", 2, &directory);
    alice.ensure_identity().await.unwrap();
    bob.ensure_identity().await.unwrap();

    for _ in 0..4 {
        directory.fetch(&bob.user_id).await.unwrap();
    }

    let conversation_id = ConversationId::new("conv1");
    let first = first_contact(&alice, &bob).await;

    // Alice starts a new session which replaces the first one on Bob's side.
    alice
        .manager
        .end_session(&alice.user_id, &bob.user_id)
        .await
        .unwrap();
    let second = alice
        .manager
        .encrypt_for_peer(&alice.user_id, &bob.user_id, &conversation_id, b"again")
        .await
        .unwrap();
    bob.manager
        .decrypt_from_peer(&bob.user_id, &alice.user_id, &conversation_id, &second)
        .await
        .unwrap();

    // The first handshake can not be answered a second time.
    let result = bob
        .manager
        .decrypt_from_peer(
            &bob.user_id,
            &alice.user_id,
            &ConversationId::new("alice-bob"),
            &first,
        )
        .await;
    assert_matches!(
        result,
        Err(SessionError::HandshakeVerification(
            HandshakeError::ReplayedHandshake
        ))
    );
}

#[tokio::test]
async fn replay_window_is_kept_per_peer() {
    setup_logging();

    let directory = MemoryDirectory::new();
    let storage = MemoryStorage::new();
    let bob = TestPeer {
        user_id: UserId::new("bob"),
        storage: storage.clone(),
        manager: SessionManager::with_rng(
            storage,
            directory.clone(),
            Config {
                handshake_replay_window: 2,
                ..test_config()
            },
            Rng::from_seed([2; 32]),
        ),
    };
    let alice = TestPeer::new("alice", 1, &directory);
    let carol = TestPeer::new("carol", 3, &directory);
    bob.ensure_identity().await.unwrap();
    alice.ensure_identity().await.unwrap();
    carol.ensure_identity().await.unwrap();

    // Handshakes without one-time prekey can only be recognized by their ephemeral key.
    for _ in 0..4 {
        directory.fetch(&bob.user_id).await.unwrap();
    }

    let first = first_contact(&alice, &bob).await;
    alice
        .manager
        .end_session(&alice.user_id, &bob.user_id)
        .await
        .unwrap();
    first_contact(&alice, &bob).await;

    // Carol starts over more often than the window is long.
    for _ in 0..3 {
        carol
            .manager
            .end_session(&carol.user_id, &bob.user_id)
            .await
            .unwrap();
        first_contact(&carol, &bob).await;
    }

    let result = bob
        .manager
        .decrypt_from_peer(
            &bob.user_id,
            &alice.user_id,
            &ConversationId::new("alice-bob"),
            &first,
        )
        .await;
    assert_matches!(
        result,
        Err(SessionError::HandshakeVerification(
            HandshakeError::ReplayedHandshake
        ))
    );
}
