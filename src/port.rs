// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Free loopback port discovery.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use tokio::net::TcpListener;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Finds a TCP port on the loopback interface that is currently free.
pub trait PortFinder: Send + Sync + 'static {
    fn find_port(&self) -> BoxFuture<'_, io::Result<u16>>;
}

/// Asks the OS for an ephemeral port by binding `127.0.0.1:0`.
///
/// The scratch socket is closed before the port is returned, so another
/// process may still grab it before the listener binds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackPortFinder;

impl PortFinder for LoopbackPortFinder {
    fn find_port(&self) -> BoxFuture<'_, io::Result<u16>> {
        Box::pin(async {
            let scratch = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
            Ok::<_, io::Error>(scratch.local_addr()?.port())
        })
    }
}
