//! Request policy shared by every transport.
//!
//! ```text
//! Request → [MethodFilter] → [RetryPolicy + per-attempt timeout] → [Transport]
//! ```

pub mod retry;

pub use retry::RetryPolicy;
