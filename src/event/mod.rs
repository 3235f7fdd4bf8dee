//! Channel plumbing used for cancellation and cross-thread signalling.

pub mod cancellation;
pub mod channel;
