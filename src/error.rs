// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error types shared by every subsystem of the pipeline core.

use std::{fmt, io, time::Duration};
use thiserror::Error;

/// Status code taxonomy reported to collaborators.
///
/// Every [`Error`] maps onto exactly one code so callers that only care
/// about the class of failure (retry on `TimedOut`, give up on `BadValue`)
/// do not need to match on the full enum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Malformed or missing input.
    BadValue,
    /// The call is forbidden in the current state.
    InvalidOperation,
    /// An allocation failed.
    NoMemory,
    /// A bounded wait expired.
    TimedOut,
    /// Unexpected low-level failure.
    UnknownError,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::BadValue => "BAD_VALUE",
            StatusCode::InvalidOperation => "INVALID_OPERATION",
            StatusCode::NoMemory => "NO_MEMORY",
            StatusCode::TimedOut => "TIMED_OUT",
            StatusCode::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(name)
    }
}

/// Errors produced by the buffer pool, poller, store, graph and policy
/// stages.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad value: {0}")]
    BadValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("internal error: {0}")]
    Unknown(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn code(&self) -> StatusCode {
        match self {
            Error::BadValue(_) => StatusCode::BadValue,
            Error::InvalidOperation(_) => StatusCode::InvalidOperation,
            Error::NoMemory(_) => StatusCode::NoMemory,
            Error::TimedOut(_) => StatusCode::TimedOut,
            Error::Unknown(_) | Error::Io(_) => StatusCode::UnknownError,
        }
    }

    pub(crate) fn bad_value(msg: impl Into<String>) -> Self {
        Error::BadValue(msg.into())
    }

    pub(crate) fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    pub(crate) fn no_memory(msg: impl Into<String>) -> Self {
        Error::NoMemory(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
