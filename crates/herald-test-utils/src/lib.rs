// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for Herald integration tests.
//!
//! Provides scriptable doubles for the engine and downstream seams plus a
//! harness that wires them into a [`SessionRegistry`](herald_session::SessionRegistry),
//! so the session core can be driven deterministically without a real client.
//!
//! # Components
//!
//! - [`MockEngine`] / [`MockEngineFactory`] - engine double with event injection
//! - [`MockSender`] - downstream double with scripted failures and batch capture
//! - [`TestHarness`] - registry assembled over the two doubles

pub mod harness;
pub mod mock_engine;
pub mod mock_sender;

pub use harness::{TestHarness, TestHarnessBuilder, text_message};
pub use mock_engine::{EngineScript, MockEngine, MockEngineFactory};
pub use mock_sender::MockSender;
