// SPDX-License-Identifier: Apache-2.0

//! Output adapters: each consumes its own envelope channel, forwards every
//! event to a sink, and stops on cancellation or when the pipeline hangs up.

pub mod redis;
pub mod stdout;

pub use redis::{RedisQueueOutput, RedisQueueOutputConfig};
pub use stdout::StdoutOutput;
