#![deny(missing_docs)]
//! Ferret API contains the scheduler module traits and the basic types
//! required to define the api of those traits.
//!
//! If you want to use the production scheduler itself, please see the
//! ferret_core crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub(crate) mod serde_bytes_base64 {
    pub fn serialize<S>(
        b: &bytes::Bytes,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use base64::prelude::*;
        serializer.serialize_str(&BASE64_URL_SAFE_NO_PAD.encode(b))
    }

    pub fn deserialize<'de, D, T: From<bytes::Bytes>>(
        deserializer: D,
    ) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use base64::prelude::*;
        let s: &'de str = serde::Deserialize::deserialize(deserializer)?;
        BASE64_URL_SAFE_NO_PAD
            .decode(s)
            .map(|v| bytes::Bytes::copy_from_slice(&v).into())
            .map_err(serde::de::Error::custom)
    }
}

pub mod config;

mod error;
pub use error::*;

pub mod id;
pub use id::{Key, RecordId, RequesterId};

mod timestamp;
pub use timestamp::*;

pub mod request;
pub use request::*;

pub mod listener;
pub use listener::*;

pub mod record_store;
pub use record_store::*;

pub mod scheduler;
pub use scheduler::*;
