// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid root key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Certificate generation failed: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Failed to parse certificate: {0}")]
    CertParse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error(transparent)]
    Rejected(#[from] Rejection),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome delivered to every waiter of a listener that never became ready,
/// or that was torn down before its waiters were answered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("No free port for {hostname}: {reason}")]
    PortUnavailable { hostname: String, reason: String },

    #[error("Listener for {hostname} failed: {reason}")]
    ListenerFault { hostname: String, reason: String },

    #[error("Could not issue certificate for {hostname}: {reason}")]
    Certificate { hostname: String, reason: String },

    #[error("Listener for {hostname} was removed ({cause})")]
    Evicted {
        hostname: String,
        cause: RemovalCause,
    },
}

impl Rejection {
    pub fn hostname(&self) -> &str {
        match self {
            Self::PortUnavailable { hostname, .. }
            | Self::ListenerFault { hostname, .. }
            | Self::Certificate { hostname, .. }
            | Self::Evicted { hostname, .. } => hostname,
        }
    }
}

/// Why a listener left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// `remove` was called for the hostname.
    Explicit,
    /// No secure handshake completed within the idle window.
    IdleTimeout,
    /// The listening socket reported an error.
    ListenerFault,
    /// A client failed the TLS handshake.
    HandshakeFault,
    /// A capacity sweep found the listener without connections.
    CapacitySweep,
    /// The whole pool was cleared.
    Cleared,
    /// Issuing, port discovery or binding failed.
    CreationFailed,
}

impl RemovalCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::IdleTimeout => "idle_timeout",
            Self::ListenerFault => "listener_fault",
            Self::HandshakeFault => "handshake_fault",
            Self::CapacitySweep => "capacity_sweep",
            Self::Cleared => "cleared",
            Self::CreationFailed => "creation_failed",
        }
    }
}

impl fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
