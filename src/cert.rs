// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::ca::{validity_window, RootAuthority};
use crate::error::Result;
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, SanType, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use time::OffsetDateTime;

/// Longest serial number allowed by RFC 5280.
const MAX_SERIAL_LEN: usize = 20;

/// Leaf certificate for a single hostname, signed by the pool's root.
///
/// The leaf certifies the root's own public key, so it is served with the
/// root private key.
pub struct LeafCertificate {
    /// Hostname exactly as requested.
    pub hostname: String,
    /// The certificate in PEM format.
    pub pem: String,
    pub der: CertificateDer<'static>,
}

impl LeafCertificate {
    /// Issue a leaf for `hostname`.
    ///
    /// IP literals get an IP address SAN, everything else a DNS name SAN.
    /// The check is purely syntactic.
    pub fn issue(hostname: &str, root: &RootAuthority) -> Result<Self> {
        Self::issue_at(hostname, root, OffsetDateTime::now_utc())
    }

    pub fn issue_at(hostname: &str, root: &RootAuthority, now: OffsetDateTime) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.serial_number = Some(leaf_serial(hostname, now));
        params.is_ca = IsCa::NoCa;

        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, hostname);
        params.distinguished_name = name;

        let san = match hostname.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(hostname.try_into()?),
        };
        params.subject_alt_names = vec![san];

        let (not_before, not_after) = validity_window(now);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params.signed_by(root.key_pair(), root.issuer())?;

        Ok(Self {
            hostname: hostname.to_string(),
            pem: cert.pem(),
            der: cert.der().clone(),
        })
    }

    /// rustls server config presenting this leaf followed by the root.
    pub fn server_config(&self, root: &RootAuthority) -> Result<Arc<ServerConfig>> {
        let chain = vec![self.der.clone(), root.cert_der().clone()];
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(root.key_pair().serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

/// Hash of `hostname.<unix millis>.<0..10000>`; only needs to avoid collisions.
fn leaf_serial(hostname: &str, now: OffsetDateTime) -> SerialNumber {
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    let salt: u32 = rand::rng().random_range(0..10_000);
    let digest = Sha256::digest(format!("{}.{}.{}", hostname, millis, salt).as_bytes());
    let mut serial = digest[..MAX_SERIAL_LEN].to_vec();
    // A set top bit would need a 0x00 pad octet to stay positive
    serial[0] &= 0x7f;
    SerialNumber::from_slice(&serial)
}
