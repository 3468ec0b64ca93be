//! Cooperative cancellation.
//!
//! This module provides:
//! - CancellationToken, shared between a run and every step it calls
//! - child tokens that follow their parent, optionally with a deadline

mod token;

pub use token::{CancelCallback, CancellationToken, DeadlineGuard};
