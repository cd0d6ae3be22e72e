//! HTTP service wiring around the verification pool.
//!
//! ## Structure
//!
//! - [`handler`] - axum router, handlers and error mapping (`AppState`).

pub mod handler;
