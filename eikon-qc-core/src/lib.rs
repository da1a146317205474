//! # Eikon QC Core
//!
//! Change detection and QC state reconciliation for media assets on shared
//! storage.
//!
//! ## Overview
//!
//! Every media file, and every frame sequence, gets a small JSON sidecar
//! recording its last QC verdict, the content hash it was given for, and the
//! audit trail linking successive QC events. Each crawl decides per asset
//! whether that stored state is still valid:
//!
//! - **Fingerprints**: a stat-only cheap fingerprint for sequences, a tagged
//!   per-file content hash with a per-directory cache, and a manifest hash
//!   over ordered frames ([`fingerprint`]).
//! - **Sidecars**: placement, schema migration, atomic writes and the re-QC
//!   predicate ([`sidecar`]).
//! - **Mutation detection**: frame-level change thresholds for sequences
//!   ([`mutation`]).
//! - **Reconciliation**: the per-asset state machine ([`reconcile`]).
//! - **Runs**: bounded fan-out over a root plus the missing-media sweep
//!   ([`run`]).
//!
//! Media discovery ([`media`]), the asset tracker client ([`tracker`]) and
//! platform tagging ([`tagging`]) are the collaborators around that core;
//! [`summary`], [`cleanup`] and [`fakeseq`] back the operator tooling.
//!
//! ## Feature Flags
//!
//! - `blake3` (default): hash file contents with BLAKE3. Without it, files
//!   are hashed with SHA-256. Hashes are tagged, so caches and sidecars from
//!   either build are never confused.
//!
//! ## Example
//!
//! ```no_run
//! use std::{path::Path, sync::Arc};
//!
//! use eikon_qc_core::{
//!     config::{QcSettings, RunConfig},
//!     run::RunCoordinator,
//!     tracker::tracker_from_settings,
//! };
//!
//! async fn nightly() -> eikon_qc_core::Result<()> {
//!     let settings = QcSettings::default();
//!     let tracker = tracker_from_settings(&settings.tracker)?;
//!     let config = Arc::new(RunConfig::new(settings, "nightly-bot"));
//!
//!     let summary = RunCoordinator::new(config, tracker)
//!         .run(Path::new("/mnt/san/jobs"), None)
//!         .await?;
//!     println!("{} marked, {} skipped", summary.marked.len(), summary.skipped.len());
//!     Ok(())
//! }
//! ```

pub mod cleanup;
pub mod config;
pub mod error;
pub mod fakeseq;
pub mod fingerprint;
pub mod media;
pub mod mutation;
pub mod reconcile;
pub mod run;
pub mod sidecar;
pub mod summary;
pub mod tagging;
pub mod tracker;

pub use error::{QcError, Result};
