// SPDX-License-Identifier: Apache-2.0

//! Input adapters: each one decodes a transport into [`LogEvent`]s pushed
//! onto the pipeline channel, and stops when its cancellation token trips.
//! A fatal startup fault (bad address, missing parent directory) is
//! returned as an error from `start`; runtime faults are logged and
//! monitoring continues.
//!
//! [`LogEvent`]: crate::event::LogEvent

pub mod error_window;
pub mod file;
pub mod gelf;
pub mod redis;
pub mod tcp;

pub use error_window::ErrorWindow;
pub use file::{FileInput, FileInputConfig};
pub use gelf::{GelfInput, GelfInputConfig};
pub use redis::{RedisQueueInput, RedisQueueInputConfig};
pub use tcp::{TcpInput, TcpInputConfig};
