//! # Chronicle: ledger history publication and catchup
//!
//! Chronicle is the history subsystem of a replicated ledger node. It cuts
//! the closed ledger stream into fixed-frequency *checkpoints*, publishes
//! them to external archives through a durable queue, and lets a node that
//! has fallen behind *catch up* by downloading, verifying, and applying
//! archived checkpoints.
//!
//! ## Core Concepts
//!
//! - **Checkpoint**: a contiguous run of `F` ledgers ending on a boundary
//!   (`k·F − 1`); the unit of publication and verification
//! - **HAS** (history archive state): the snapshot descriptor for one
//!   checkpoint — ledger sequence plus bucket-list manifest
//! - **Bucket**: a content-addressed, immutable blob of account entries at
//!   one level of the bucket list
//! - **Work**: a unit of the cooperative scheduler with run/reset/abort and
//!   child composition; all blocking history operations are Works
//!
//! ## Data Flow
//!
//! ```text
//! LedgerManager ──close──▶ PublishQueue ──▶ PublishWork ──▶ Archive
//!
//! CatchupPlan ──▶ Archive ──▶ verify chain ──▶ apply ──▶ LedgerManager
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chronicle::app::App;
//! use chronicle::archive::{local::LocalDirArchive, Archive};
//! use chronicle::config::Config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = Config::default();
//! config.artificially_accelerate_time_for_testing = true;
//!
//! let archive: Arc<dyn Archive> = Arc::new(LocalDirArchive::new("main", "/tmp/archive", true));
//! let mut app = App::build(config, vec![archive]).await?;
//!
//! // Catch up to ledger 39, replaying the most recent checkpoint only.
//! let caught_up = app
//!     .catchup_offline(39, Some(0), std::time::Duration::from_secs(30))
//!     .await?;
//! assert!(caught_up);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`checkpoint`] - Checkpoint arithmetic and ledger/checkpoint ranges
//! - [`ledger`] - Ledger headers, transaction sets, and the ledger manager
//! - [`buckets`] - Content-addressed bucket store and the levelled list
//! - [`history`] - Archive state (HAS) and history file codecs
//! - [`archive`] - The narrow archive capability set and implementations
//! - [`publish`] - Durable publish queue and the publish pipeline
//! - [`catchup`] - Catchup planner, work oracle, verifier, and applier
//! - [`work`] - Cooperative work scheduler (`crank`/`crank_until`)
//! - [`status`] - Event bus for operator-visible status and diagnostics
//! - [`metrics`] - Success/failure meters and catchup counter snapshots

pub mod app;
pub mod archive;
pub mod buckets;
pub mod catchup;
pub mod checkpoint;
pub mod config;
pub mod hash;
pub mod history;
pub mod ledger;
pub mod metrics;
pub mod publish;
pub mod status;
pub mod telemetry;
pub mod tmp;
pub mod work;
