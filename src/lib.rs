//! Atomic DRM/KMS presentation backend for Wayland compositors.
//!
//! This crate is the piece of a compositor that talks to the kernel's
//! display hardware: it batches per-frame hardware state into atomic
//! commits, tracks their asynchronous completion, manages hardware
//! cursor planes, hands buffers across GPUs, and leases display
//! resources to external clients.
//!
//! ## Structure
//!
//! - [`control`] — the kernel contract: object ids, property tuples and
//!   the [`DeviceControl`](control::DeviceControl) collaborator, with a
//!   real implementation over an open DRM node in
//!   [`control::fd`] and a calloop event source in [`control::event`].
//! - [`device`] — per-GPU topology model: CRTCs, planes, connectors,
//!   deduplicated modes, primary GPU selection.
//! - [`update`] / [`commit`] — single-use batches of property writes
//!   and the engine submitting them synchronously, asynchronously or as
//!   test-only validation.
//! - [`pipeline`] — per-CRTC frame queue with direct scanout and the
//!   multi-GPU hand-off ladder.
//! - [`cursor`] — hardware cursor plane management with triple-buffered
//!   cursor images.
//! - [`lease`] — DRM resource leasing.
//!
//! ## Flow
//!
//! The renderer submits a finished buffer to an
//! [`Onscreen`](pipeline::Onscreen); the pipeline extends the device's
//! pending [`Update`](update::Update) (the cursor manager contributes
//! its plane writes), the commit engine flushes it, and page flip
//! feedback drives both the frame queue and the cursor buffer rings.

#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod buffer;
pub mod commit;
pub mod control;
pub mod cursor;
pub mod device;
pub mod error;
pub mod format;
#[cfg(feature = "backend_gbm")]
#[cfg_attr(docsrs, doc(cfg(feature = "backend_gbm")))]
pub mod gbm;
pub mod lease;
pub mod pipeline;
pub mod update;
pub mod utils;

pub use error::Error;
