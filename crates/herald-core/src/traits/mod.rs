// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Seam traits between the session core and its external collaborators.
//!
//! All traits use `#[async_trait]` for dynamic dispatch compatibility.

pub mod engine;
pub mod identity;
pub mod sender;

pub use engine::{ClientEngine, EngineEvent, EngineEventSender, EngineFactory};
pub use identity::SessionIdentityStore;
pub use sender::DownstreamSender;
