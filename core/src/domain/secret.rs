// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Classification and validation of TLS material.
//!
//! A Kubernetes Secret is usable as a server keypair only when it carries
//! non-empty `tls.crt` and `tls.key` entries and the leaf certificate names
//! at least one identity (common name or subject-alternative-name). A secret
//! carrying only `ca.crt` is a CA bundle. Anything else is rejected and is
//! never published through the secret cache, referenced or not.

use k8s_openapi::api::core::v1::Secret;
use x509_parser::pem::Pem;

use super::kubernetes::FullName;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";

/// A validated secret, ready for the DAG and the secret cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidSecret {
    /// Server keypair: PEM certificate chain plus PEM private key.
    Keypair {
        name: FullName,
        cert_chain: Vec<u8>,
        private_key: Vec<u8>,
    },
    /// CA bundle used for upstream or client-certificate validation.
    CaBundle { name: FullName, bundle: Vec<u8> },
}

impl ValidSecret {
    pub fn name(&self) -> &FullName {
        match self {
            ValidSecret::Keypair { name, .. } => name,
            ValidSecret::CaBundle { name, .. } => name,
        }
    }

    /// Cache entry name, `namespace/name`.
    pub fn cache_name(&self) -> String {
        self.name().to_string()
    }

    pub fn is_keypair(&self) -> bool {
        matches!(self, ValidSecret::Keypair { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    #[error("secret contains neither a tls.crt/tls.key pair nor a ca.crt bundle")]
    MissingKeys,
    #[error("{0} is empty")]
    EmptyEntry(&'static str),
    #[error("tls.crt is not parseable PEM: {0}")]
    MalformedPem(String),
    #[error("leaf certificate carries no common name or subject alternative name")]
    NoIdentity,
    #[error("tls.key is not a PEM-encoded private key")]
    MalformedKey,
}

/// Classify a Secret per the rules above. Returns `Ok` only for secrets
/// that may enter the DAG.
pub fn validate(name: FullName, secret: &Secret) -> Result<ValidSecret, SecretError> {
    let data = secret.data.as_ref();
    let entry = |key: &str| -> Option<&[u8]> {
        data.and_then(|d| d.get(key)).map(|b| b.0.as_slice())
    };

    let cert = entry(TLS_CERT_KEY);
    let key = entry(TLS_PRIVATE_KEY_KEY);
    let ca = entry(CA_CERT_KEY);

    match (cert, key) {
        (Some(cert), Some(key)) => {
            if cert.is_empty() {
                return Err(SecretError::EmptyEntry(TLS_CERT_KEY));
            }
            if key.is_empty() {
                return Err(SecretError::EmptyEntry(TLS_PRIVATE_KEY_KEY));
            }
            validate_leaf_identity(cert)?;
            validate_private_key(key)?;
            Ok(ValidSecret::Keypair {
                name,
                cert_chain: cert.to_vec(),
                private_key: key.to_vec(),
            })
        }
        (None, None) => match ca {
            Some(bundle) if !bundle.is_empty() => {
                Ok(ValidSecret::CaBundle { name, bundle: bundle.to_vec() })
            }
            Some(_) => Err(SecretError::EmptyEntry(CA_CERT_KEY)),
            None => Err(SecretError::MissingKeys),
        },
        // One half of the keypair present: unusable either way.
        _ => Err(SecretError::MissingKeys),
    }
}

/// The first certificate in the chain must name an identity: a subject CN
/// or at least one SAN entry.
fn validate_leaf_identity(pem: &[u8]) -> Result<(), SecretError> {
    let first = Pem::iter_from_buffer(pem)
        .next()
        .ok_or_else(|| SecretError::MalformedPem("no certificate blocks".to_string()))?
        .map_err(|e| SecretError::MalformedPem(e.to_string()))?;
    let cert = first
        .parse_x509()
        .map_err(|e| SecretError::MalformedPem(e.to_string()))?;

    let has_cn = cert
        .subject()
        .iter_common_name()
        .next()
        .is_some();
    let has_san = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|san| !san.value.general_names.is_empty())
        .unwrap_or(false);

    if has_cn || has_san {
        Ok(())
    } else {
        Err(SecretError::NoIdentity)
    }
}

fn validate_private_key(pem: &[u8]) -> Result<(), SecretError> {
    let block = Pem::iter_from_buffer(pem)
        .next()
        .ok_or(SecretError::MalformedKey)?
        .map_err(|_| SecretError::MalformedKey)?;
    match block.label.as_str() {
        "PRIVATE KEY" | "RSA PRIVATE KEY" | "EC PRIVATE KEY" => Ok(()),
        _ => Err(SecretError::MalformedKey),
    }
}
