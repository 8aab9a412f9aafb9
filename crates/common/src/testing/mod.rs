//! Testing utilities and helpers
//!
//! - **[`async_utils`]**: condition polling for async tests
//! - **[`mocks`]**: scripted operation outcomes and call counters
//! - **[`tracing`](mod@self::tracing)**: one-shot subscriber setup for tests
//!
//! ```rust
//! use maplink_common::testing::Script;
//!
//! let script: Script<u32, &str> = Script::new(vec![Err("reset"), Ok(7)]);
//! assert_eq!(script.next(), Err("reset"));
//! assert_eq!(script.next(), Ok(7));
//! assert_eq!(script.calls(), 2);
//! ```

pub mod async_utils;
pub mod mocks;
pub mod tracing;

pub use async_utils::poll_until;
pub use mocks::{CallCounter, Script};

pub use self::tracing::init_test_tracing;
pub use crate::time::{Clock, MockClock, SystemClock, TokioClock};
