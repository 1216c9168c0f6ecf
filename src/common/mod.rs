//! Common utilities and types

pub mod error;
pub mod dialer;
pub mod net;
pub mod socks;

pub use error::{Error, Result};
