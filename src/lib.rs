#![warn(missing_docs)]

//! # pcmflow
//!
//! A user-space PCM pipeline. Applications get one uniform handle —
//! open/configure/start/stop/transfer — while the crate internally chains
//! interchangeable conversion stages (sample format, sample rate, channel
//! routing, companding) between the format the application speaks and the
//! format the underlying *slave* backend accepts.
//!
//! The moving parts:
//!
//! - [`area`]: strided channel views over sample memory, the unit every
//!   copy, silence fill, and conversion stage operates on.
//! - [`ring`]: the `hw_ptr`/`appl_ptr` boundary arithmetic that makes the
//!   shared ring buffer lock-free.
//! - [`params`]: interval/mask configuration-space negotiation.
//! - [`pcm`]: the abstract PCM handle, its state machine, and the backend
//!   operations trait every slave implements.
//! - [`transfer`]: the generic blocking/non-blocking read/write engine.
//! - [`plugin`]: the conversion-stage chain and the decorator PCM that owns
//!   one.
//! - [`backend`]: software slaves — the null device, the file tee, and the
//!   mixing share device.
//!
//! Backends compose recursively: a plugin-chain PCM is just another backend
//! wrapping a slave of the same trait, so `app → rate → format → null` and
//! `app → share client → mix thread → null` are built from the same pieces.

use thiserror::Error as ThisError;

pub mod area;
pub mod backend;
pub mod format;
pub mod mask;
pub mod params;
pub mod pcm;
pub mod plugin;
pub mod poll;
pub mod prelude;
pub mod ring;
pub mod timestamp;
pub mod transfer;

use pcm::State;

/// Errors surfaced by PCM operations.
///
/// The variants map one-to-one onto the failure kinds of the protocol:
/// xrun and suspend are stream conditions recovered by explicit `prepare`
/// (or `resume`), would-block is an expected no-progress signal, bad-state
/// is a caller bug reported softly, and negotiation failures are retried by
/// the caller with different constraints.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Operation is illegal in the handle's current state.
    #[error("operation illegal in state {0:?}")]
    BadState(State),
    /// Playback underrun or capture overrun; recover with prepare or drop.
    #[error("stream xrun (underrun/overrun)")]
    Xrun,
    /// Backend entered a power-management suspend; resume or re-prepare.
    #[error("stream suspended")]
    Suspended,
    /// Non-blocking handle has no space/data right now.
    #[error("operation would block")]
    WouldBlock,
    /// The configuration space was refined to empty.
    #[error("parameter negotiation failed: {0}")]
    Negotiation(&'static str),
    /// The backend cannot do this at all (e.g. pause support).
    #[error("not supported by backend: {0}")]
    Unsupported(&'static str),
    /// Malformed argument outside of negotiation.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Error bubbled up from a backend's I/O.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shorthand result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
