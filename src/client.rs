//! Client-side state shared across operations: sessions and the cluster clock.

pub(crate) mod session;
