// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::config::CaSubject;
use crate::error::{Error, Result};
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use std::path::Path;
use time::OffsetDateTime;

/// Netscape certificate type (2.16.840.1.113730.1.1).
const NETSCAPE_CERT_TYPE_OID: &[u64] = &[2, 16, 840, 1, 113730, 1, 1];

/// BIT STRING with client, server, email, objsign, sslCA, emailCA and objCA set.
const NETSCAPE_CERT_TYPE_ALL_ROLES: [u8; 4] = [0x03, 0x02, 0x00, 0xF7];

/// Root serial number; leaves get hashed serials instead.
const ROOT_SERIAL: u8 = 0x01;

/// Self-signed root that signs every leaf issued by a pool.
pub struct RootAuthority {
    key_pair: KeyPair,
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

impl RootAuthority {
    /// Build the root from `subject`, importing `subject.key_pem` when set.
    ///
    /// # Errors
    /// Returns [`Error::InvalidKeyMaterial`] when the imported key cannot be parsed.
    pub fn build(subject: &CaSubject) -> Result<Self> {
        Self::build_at(subject, OffsetDateTime::now_utc())
    }

    /// Same as [`RootAuthority::build`] with a fixed clock.
    pub fn build_at(subject: &CaSubject, now: OffsetDateTime) -> Result<Self> {
        let key_pair = match subject.key_pem.as_deref() {
            Some(key_pem) => KeyPair::from_pem(key_pem)
                .map_err(|e| Error::InvalidKeyMaterial(e.to_string()))?,
            None => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?,
        };

        let params = Self::create_ca_params(subject, now);
        let cert = params.self_signed(&key_pair)?;

        // Issuer owns its signing key, so it gets its own copy
        let signing_key = KeyPair::from_pem(&key_pair.serialize_pem())?;
        let issuer = Issuer::new(params, signing_key);

        Ok(Self {
            key_pair,
            issuer,
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
        })
    }

    fn create_ca_params(subject: &CaSubject, now: OffsetDateTime) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject_name(subject);
        params.serial_number = Some(SerialNumber::from(vec![ROOT_SERIAL]));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::ContentCommitment,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::CodeSigning,
            ExtendedKeyUsagePurpose::EmailProtection,
            ExtendedKeyUsagePurpose::TimeStamping,
        ];
        params.custom_extensions = vec![CustomExtension::from_oid_content(
            NETSCAPE_CERT_TYPE_OID,
            NETSCAPE_CERT_TYPE_ALL_ROLES.to_vec(),
        )];

        let (not_before, not_after) = validity_window(now);
        params.not_before = not_before;
        params.not_after = not_after;

        params
    }

    /// Root private key in PKCS#8 PEM format.
    pub fn key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// Root certificate in PEM format, for client trust stores.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// Export the root so it can be installed into a trust store.
    /// The key file is written with owner-only permissions.
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        crate::fs::ensure_parent_dir(cert_path)?;
        crate::fs::ensure_parent_dir(key_path)?;
        crate::fs::atomic_write_secret(key_path, self.key_pem().as_bytes())?;
        crate::fs::atomic_write(cert_path, self.cert_pem.as_bytes())?;
        Ok(())
    }
}

fn subject_name(subject: &CaSubject) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, subject.common_name.as_str());
    name.push(DnType::CountryName, subject.country.as_str());
    name.push(DnType::StateOrProvinceName, subject.state.as_str());
    name.push(DnType::LocalityName, subject.locality.as_str());
    name.push(DnType::OrganizationName, subject.organization.as_str());
    name.push(
        DnType::OrganizationalUnitName,
        subject.organizational_unit.as_str(),
    );
    name
}

/// One year back and ten years ahead of `now`, shared by roots and leaves.
pub(crate) fn validity_window(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    (shift_years(now, -1), shift_years(now, 10))
}

fn shift_years(at: OffsetDateTime, years: i32) -> OffsetDateTime {
    // Feb 29 has no counterpart in most years
    at.replace_year(at.year() + years)
        .unwrap_or_else(|_| at + time::Duration::days(365 * i64::from(years)))
}
