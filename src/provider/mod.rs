//! Remote server list provider
//!
//! Downloads the signed list, authenticates it and merges the entries into
//! the server store.

mod fetcher;
mod verifier;

pub use fetcher::{
    HttpDownloader, ListDownloader, RemoteListFetcher, CONNECTIVITY_POLL_INTERVAL,
    FETCH_INTERVAL_ON_FAILURE, FETCH_INTERVAL_ON_SUCCESS, MAX_CONNECTIVITY_WAIT,
};
pub use verifier::{RsaSha256Verifier, SignedListVerifier};

#[cfg(test)]
pub(crate) use verifier::tests as verifier_fixtures;
