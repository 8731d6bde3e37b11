//! Small shared helpers.

pub mod debounce;

use std::pin::Pin;

/// Owned, sendable future type used at trait and callback boundaries.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
