// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared building blocks for the cinder crates.
//!
//! `cinder-core` holds the identifiers every layer agrees on (users, devices, conversations and
//! stored messages) together with the encoding helpers used to persist state (CBOR) and to render
//! public data in human-readable wire formats (hex strings in JSON).
pub mod cbor;
pub mod ids;
pub mod serde;

pub use ids::{ConversationId, DeviceLabel, MessageId, UserId};
