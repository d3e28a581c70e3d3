// SPDX-License-Identifier: MIT OR Apache-2.0

//! Boundary to the key directory service which stores published key bundles.
//!
//! The directory is untrusted for confidentiality: it only ever sees public keys and bundles are
//! verified by whoever fetches them. Network or storage failures surface as
//! [`DirectoryError::Unavailable`] and must never be read as "this user has no keys".
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cinder_core::{DeviceLabel, UserId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::backoff::Backoff;
use crate::key_bundle::KeyBundle;

/// HTTP routes of the directory service.
pub struct DirectoryRoute;

impl DirectoryRoute {
    /// `PUT` route to upsert the bundle of one device.
    pub fn publish_path(user_id: &UserId, device_label: &DeviceLabel) -> String {
        format!(
            "/devices/{}/{}/bundle",
            encode_segment(user_id.as_str()),
            encode_segment(device_label.as_str())
        )
    }

    /// `GET` route returning the current bundle of a user, claiming one of its one-time prekeys.
    pub fn fetch_path(user_id: &UserId) -> String {
        format!("/devices/{}/bundle", encode_segment(user_id.as_str()))
    }

    /// `GET` route returning the current bundle of a user without claiming a one-time prekey.
    pub fn identity_path(user_id: &UserId) -> String {
        format!("/devices/{}/identity", encode_segment(user_id.as_str()))
    }
}

/// Percent-encodes everything except unreserved characters (RFC 3986).
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Client of the key directory.
pub trait KeyDirectory {
    /// Upserts the bundle for its `(user_id, device_label)`.
    fn publish(&self, bundle: &KeyBundle) -> impl Future<Output = Result<(), DirectoryError>>;

    /// Returns the current bundle of a user or `None` if they never published one.
    ///
    /// Used by initiators. The first one-time prekey of the returned bundle is handed out to this
    /// caller only.
    fn fetch(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Option<KeyBundle>, DirectoryError>>;

    /// Returns the current bundle of a user like [`KeyDirectory::fetch`], but leaves the
    /// published one-time prekeys untouched.
    ///
    /// Used by responders which only need the sender's identity and signed keys for verification.
    fn fetch_identity(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Option<KeyBundle>, DirectoryError>>;
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("key directory unavailable: {0}")]
    Unavailable(String),
}

/// Fetches a bundle, retrying with backoff while the directory is unavailable.
///
/// Gives up after `attempts` tries and returns the last error. "Not found" is an answer and
/// returned right away.
pub async fn fetch_with_backoff<D: KeyDirectory>(
    directory: &D,
    user_id: &UserId,
    attempts: usize,
    backoff: &mut Backoff,
) -> Result<Option<KeyBundle>, DirectoryError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match directory.fetch(user_id).await {
            Ok(bundle) => {
                backoff.reset();
                return Ok(bundle);
            }
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                trace!(%user_id, attempt, %err, "retry fetching key bundle");
                backoff.increment();
                backoff.sleep().await;
            }
        }
    }
}

#[derive(Debug, Default)]
struct InnerMemoryDirectory {
    /// Bundles per user, ordered by publication.
    bundles: HashMap<UserId, Vec<KeyBundle>>,
    requests: Vec<String>,
}

/// In-memory key directory.
///
/// Clones share the same state. Fetching a bundle claims its first one-time prekey, so every
/// initiator gets a different one. Identity lookups never claim.
#[derive(Clone, Debug)]
pub struct MemoryDirectory {
    inner: Arc<RwLock<InnerMemoryDirectory>>,
    online: Arc<AtomicBool>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            online: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate (un)reachability of the directory.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Routes requested so far, in order.
    pub async fn requests(&self) -> Vec<String> {
        self.inner.read().await.requests.clone()
    }

    fn check_online(&self) -> Result<(), DirectoryError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DirectoryError::Unavailable("directory is offline".into()))
        }
    }
}

impl KeyDirectory for MemoryDirectory {
    async fn publish(&self, bundle: &KeyBundle) -> Result<(), DirectoryError> {
        self.check_online()?;

        let mut inner = self.inner.write().await;
        inner.requests.push(format!(
            "PUT {}",
            DirectoryRoute::publish_path(bundle.user_id(), bundle.device_label())
        ));

        let devices = inner.bundles.entry(bundle.user_id().clone()).or_default();
        devices.retain(|existing| existing.device_label() != bundle.device_label());
        devices.push(bundle.clone());

        debug!(
            user_id = %bundle.user_id(),
            device_label = %bundle.device_label(),
            onetime_prekeys = bundle.onetime_prekeys().len(),
            "published key bundle"
        );

        Ok(())
    }

    async fn fetch(&self, user_id: &UserId) -> Result<Option<KeyBundle>, DirectoryError> {
        self.check_online()?;

        let mut inner = self.inner.write().await;
        inner
            .requests
            .push(format!("GET {}", DirectoryRoute::fetch_path(user_id)));

        let Some(latest) = inner
            .bundles
            .get_mut(user_id)
            .and_then(|devices| devices.last_mut())
        else {
            return Ok(None);
        };

        let bundle = latest.clone();
        latest.claim_onetime_prekey();
        Ok(Some(bundle))
    }

    async fn fetch_identity(&self, user_id: &UserId) -> Result<Option<KeyBundle>, DirectoryError> {
        self.check_online()?;

        let mut inner = self.inner.write().await;
        inner
            .requests
            .push(format!("GET {}", DirectoryRoute::identity_path(user_id)));

        Ok(inner
            .bundles
            .get(user_id)
            .and_then(|devices| devices.last())
            .cloned())
    }
}
