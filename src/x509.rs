// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Parse issued X.509 certificates without shelling out to openssl.

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use x509_parser::prelude::*;

const NETSCAPE_CERT_TYPE_OID: &str = "2.16.840.1.113730.1.1";

/// One subject alternative name entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
}

/// Extended key usages present on a certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedKeyUsages {
    pub server_auth: bool,
    pub client_auth: bool,
    pub code_signing: bool,
    pub email_protection: bool,
    pub time_stamping: bool,
}

#[derive(Debug, Clone)]
pub struct CertInfo {
    pub not_before_timestamp: i64,
    pub not_after_timestamp: i64,
    pub common_name: Option<String>,
    pub issuer_common_name: Option<String>,
    /// DER encoding of the subject name
    pub subject_der: Vec<u8>,
    /// DER encoding of the issuer name
    pub issuer_der: Vec<u8>,
    /// Lowercase hex of the serial number as encoded
    pub serial_hex: String,
    pub subject_alt_names: Vec<SubjectAltName>,
    pub is_ca: bool,
    pub key_cert_sign: bool,
    pub extended_key_usages: ExtendedKeyUsages,
    /// Raw value of the legacy Netscape cert-type extension
    pub netscape_cert_type: Option<Vec<u8>>,
    /// DER of the subject public key info
    pub public_key_der: Vec<u8>,
}

impl CertInfo {
    pub fn dns_names(&self) -> impl Iterator<Item = &str> {
        self.subject_alt_names.iter().filter_map(|san| match san {
            SubjectAltName::Dns(name) => Some(name.as_str()),
            SubjectAltName::Ip(_) => None,
        })
    }

    pub fn ip_addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.subject_alt_names.iter().filter_map(|san| match san {
            SubjectAltName::Ip(ip) => Some(*ip),
            SubjectAltName::Dns(_) => None,
        })
    }
}

pub fn parse_cert_pem(pem_str: &str) -> Result<CertInfo> {
    let pem = ::pem::parse(pem_str)
        .map_err(|e| Error::CertParse(format!("Failed to parse PEM: {}", e)))?;

    if pem.tag() != "CERTIFICATE" {
        return Err(Error::CertParse(format!(
            "Expected CERTIFICATE, got {}",
            pem.tag()
        )));
    }

    parse_cert_der(pem.contents())
}

pub fn parse_cert_der(der: &[u8]) -> Result<CertInfo> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(String::from);
    let issuer_common_name = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(String::from);

    let serial_hex = cert
        .raw_serial()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();

    let mut subject_alt_names = Vec::new();
    let mut is_ca = false;
    let mut key_cert_sign = false;
    let mut extended_key_usages = ExtendedKeyUsages::default();
    let mut netscape_cert_type = None;

    for ext in cert.extensions() {
        if ext.oid.to_id_string() == NETSCAPE_CERT_TYPE_OID {
            netscape_cert_type = Some(ext.value.to_vec());
            continue;
        }
        match ext.parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => {
                            subject_alt_names.push(SubjectAltName::Dns(dns.to_string()))
                        }
                        GeneralName::IPAddress(ip_bytes) => {
                            if let Some(ip) = ip_from_bytes(ip_bytes) {
                                subject_alt_names.push(SubjectAltName::Ip(ip));
                            }
                        }
                        _ => {}
                    }
                }
            }
            ParsedExtension::BasicConstraints(bc) => {
                is_ca = bc.ca;
            }
            ParsedExtension::KeyUsage(ku) => {
                key_cert_sign = ku.key_cert_sign();
            }
            ParsedExtension::ExtendedKeyUsage(eku) => {
                extended_key_usages = ExtendedKeyUsages {
                    server_auth: eku.server_auth,
                    client_auth: eku.client_auth,
                    code_signing: eku.code_signing,
                    email_protection: eku.email_protection,
                    time_stamping: eku.time_stamping,
                };
            }
            _ => {}
        }
    }

    Ok(CertInfo {
        not_before_timestamp: cert.validity().not_before.timestamp(),
        not_after_timestamp: cert.validity().not_after.timestamp(),
        common_name,
        issuer_common_name,
        subject_der: cert.subject().as_raw().to_vec(),
        issuer_der: cert.issuer().as_raw().to_vec(),
        serial_hex,
        subject_alt_names,
        is_ca,
        key_cert_sign,
        extended_key_usages,
        netscape_cert_type,
        public_key_der: cert.public_key().raw.to_vec(),
    })
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes)
            .ok()
            .map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes)
            .ok()
            .map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}
