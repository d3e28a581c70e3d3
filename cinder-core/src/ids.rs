// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifiers handed to us by the authentication and message layers.
//!
//! These are opaque strings, the engine never interprets them beyond equality and using them as
//! storage keys.
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }

            /// Hex representation, safe to use inside storage keys and URL paths.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0.as_bytes())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a user as established by the authentication layer.
    UserId
);

string_id!(
    /// Label of one of the user's devices, for example "primary".
    DeviceLabel
);

string_id!(
    /// Identifier of a conversation, used as associated data to bind ciphertexts to it.
    ConversationId
);

string_id!(
    /// Identifier the message store assigned to a stored ciphertext.
    MessageId
);
