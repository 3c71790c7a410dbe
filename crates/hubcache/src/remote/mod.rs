//! # Remote
//!
//! The hub as seen by the cache, and its HTTP implementation.

pub mod http;
#[cfg(test)]
pub(crate) mod mock;
pub mod provider;

pub use http::HttpRemote;
pub use provider::{
    ByteRange, FetchResponse, HubRemote, RemoteError, RemoteFile, RemoteMetadata, normalize_etag,
};
