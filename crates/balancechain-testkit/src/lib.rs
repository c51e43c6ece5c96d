//! # BalanceChain Testkit
//!
//! Testing utilities for BalanceChain.
//!
//! - **Fixtures**: a [`TestFixture`] bundling a manual clock, a seeded
//!   identity, and a chain over an in-memory store
//! - **Generators**: proptest strategies for segments and payloads
//!
//! ```rust,ignore
//! use balancechain_testkit::TestFixture;
//!
//! let fixture = TestFixture::new().await;
//! fixture.commit_chat("hakim", "hello").await?;
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{multi_party_fixtures, seed_identity, ManualClock, TestFixture, T0};
pub use generators::{segment_from_params, SegmentParams};
