// src/core/errors.rs

//! Defines the primary error type for the entire crate.

use thiserror::Error;

/// The main error enum, representing all failures a roster API call can
/// surface to its caller.
///
/// Accessing an unknown scope is deliberately *not* represented here: it is
/// a programming error and panics at the call site instead of being returned
/// as a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("Process is not alive on its owner node")]
    NotAlive,

    #[error("Name is already registered to a different process")]
    Taken,

    #[error("A different process currently holds the name (concurrent re-registration)")]
    RaceCondition,

    #[error("Nothing registered under that name")]
    Undefined,

    #[error("Transport failure: {0}")]
    Transport(String),
}
