// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use thiserror::Error;

/// Errors surfaced by the protocols in this crate.
///
/// Only a two-valued OK/ERROR flag ever crosses a process boundary; the
/// variants here are local diagnostics for the immediate caller. Recovered
/// conditions (text truncation, merging without a merge helper) are logged
/// and never reach this type.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A collective call required a controller and none was resolvable.
    /// Raised before the collective is attempted; attempting a collective
    /// with a missing communicator would hang the peers.
    #[error("no controller available for {0}")]
    MissingController(&'static str),

    /// Values that must match across all participating ranks did not.
    #[error("{what} not equal on all nodes")]
    Disagreement { what: String },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("write error: {0}")]
    Write(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
