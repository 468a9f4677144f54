// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test utilities shared by every crate in the workspace
//!
//! - Each test writes its full diagnostic output to a unique log file
//! - On success a test prints a single line
//! - On failure it prints the log path and size for investigation

// Lets the attribute macros refer to `::msd_test_utils` from inside this crate.
extern crate self as msd_test_utils;

pub mod guard;
pub mod logging;
pub mod macros;

pub use guard::TestLoggerGuard;
pub use logging::{TestLogError, TestLogger, create_unique_test_log};
pub use msd_test_utils_macros::{logged_test, logged_tokio_test};
