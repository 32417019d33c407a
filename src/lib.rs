// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! On-demand leaf certificates and pooled loopback TLS listeners for
//! intercepting HTTPS traffic.
//!
//! ```rust,no_run
//! use certpool::{CaSubject, Handlers, ListenerPool, PoolConfig};
//!
//! # async fn run() -> certpool::Result<()> {
//! let pool = ListenerPool::new(PoolConfig {
//!     ca: CaSubject::new("certpool local CA"),
//!     ..PoolConfig::default()
//! })?;
//!
//! // Trust this root in the client before connecting.
//! let _root_pem = pool.authority().cert_pem();
//!
//! let port = pool.get_port("www.example.com", Handlers::None, None).await?;
//! println!("www.example.com is served on 127.0.0.1:{port}");
//!
//! pool.clear();
//! # Ok(())
//! # }
//! ```

/// Root certificate authority.
pub mod ca;
/// Leaf certificate issuance.
pub mod cert;
/// Configuration handling.
pub mod config;
/// Error types.
pub mod error;
/// Filesystem utilities.
pub mod fs;
/// TLS listener primitive.
pub mod listener;
/// Listener pool keyed by hostname.
pub mod pool;
/// Free port discovery.
pub mod port;
/// X.509 certificate parsing.
pub mod x509;

pub use ca::RootAuthority;
pub use cert::LeafCertificate;
pub use config::{CaSubject, PoolConfig, DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_LISTENERS};
pub use error::{Error, Rejection, RemovalCause, Result};
pub use listener::{Handlers, ListenerEvents, RequestHandler, TlsListener};
pub use pool::{ListenerPool, PortResult, ReadyCallback};
pub use port::{BoxFuture, LoopbackPortFinder, PortFinder};
pub use x509::{parse_cert_der, parse_cert_pem, CertInfo, SubjectAltName};
