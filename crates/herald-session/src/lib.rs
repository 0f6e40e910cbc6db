// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session lifecycle core for Herald.
//!
//! The [`SessionRegistry`] owns every live [`Session`](session::Session):
//! - Binds each session to a client engine and drives its state machine
//! - Buffers inbound messages per chat and delivers them in chunks
//! - Schedules reconnects with exponential backoff
//! - Tracks boot-time restorations and sweeps expired sessions
//! - Fans status changes out to subscribers

pub mod fanout;
pub mod filter;
pub mod identity;
pub mod pipeline;
pub mod reconnect;
pub mod registry;
pub mod restoration;
pub mod session;
pub mod shutdown;

pub use fanout::{SessionSubscription, StatusFanout};
pub use filter::MessageFilter;
pub use identity::DiskIdentityStore;
pub use pipeline::{DeliveryPipeline, DeliverySettings, DeliveryStats, FlushOutcome, FlushReport};
pub use reconnect::{DisconnectClass, ReconnectDecision, ReconnectPolicy};
pub use registry::{
    CreateOptions, CreateOutcome, CreateStatus, ExpiredSession, ExpiryReason, RegistryStats,
    RestoreFailure, RestoreSummary, SessionRegistry, SweepError, SweepReport,
};
pub use restoration::{RestorationRegistry, RestorationWaiter, RestoreSuccess};
pub use session::{ListenOutcome, ReconnectOutcome, SessionInfo, StopOutcome, TeardownReport};
