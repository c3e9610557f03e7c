// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Secret (SDS) translation.

use envoy_types::pb::envoy::config::core::v3 as envoy_core;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3 as envoy_tls;
use envoy_types::pb::google::protobuf::Any;

use crate::domain::dag::Dag;
use crate::domain::secret::ValidSecret;

use super::{any_resource, type_urls};

/// All validated secrets of a DAG as cache entries. Malformed secrets never
/// reach the DAG, so everything here is publishable.
pub fn from_dag(dag: &Dag) -> Vec<(String, Any)> {
    dag.secrets
        .values()
        .map(|secret| {
            let name = secret.cache_name();
            (name.clone(), any_resource(type_urls::SECRET, &translate(&name, secret)))
        })
        .collect()
}

fn translate(name: &str, secret: &ValidSecret) -> envoy_tls::Secret {
    let secret_type = match secret {
        ValidSecret::Keypair { cert_chain, private_key, .. } => {
            envoy_tls::secret::Type::TlsCertificate(envoy_tls::TlsCertificate {
                certificate_chain: Some(inline_bytes(cert_chain)),
                private_key: Some(inline_bytes(private_key)),
                ..Default::default()
            })
        }
        ValidSecret::CaBundle { bundle, .. } => {
            envoy_tls::secret::Type::ValidationContext(envoy_tls::CertificateValidationContext {
                trusted_ca: Some(inline_bytes(bundle)),
                ..Default::default()
            })
        }
    };
    envoy_tls::Secret {
        name: name.to_string(),
        r#type: Some(secret_type),
    }
}

fn inline_bytes(data: &[u8]) -> envoy_core::DataSource {
    envoy_core::DataSource {
        specifier: Some(envoy_core::data_source::Specifier::InlineBytes(data.to_vec())),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::kubernetes::FullName;
    use prost::Message;

    #[test]
    fn keypair_translates_to_tls_certificate() {
        let secret = ValidSecret::Keypair {
            name: FullName::new("certs", "web"),
            cert_chain: b"CERT".to_vec(),
            private_key: b"KEY".to_vec(),
        };
        let translated = translate("certs/web", &secret);
        assert_eq!(translated.name, "certs/web");
        match translated.r#type.unwrap() {
            envoy_tls::secret::Type::TlsCertificate(cert) => {
                let chain = cert.certificate_chain.unwrap();
                assert_eq!(
                    chain.specifier,
                    Some(envoy_core::data_source::Specifier::InlineBytes(b"CERT".to_vec()))
                );
            }
            other => panic!("unexpected secret type: {other:?}"),
        }
    }

    #[test]
    fn ca_bundle_translates_to_validation_context() {
        let secret = ValidSecret::CaBundle {
            name: FullName::new("certs", "ca"),
            bundle: b"CA".to_vec(),
        };
        let translated = translate("certs/ca", &secret);
        let packed = any_resource(type_urls::SECRET, &translated);
        let decoded = envoy_tls::Secret::decode(packed.value.as_slice()).unwrap();
        assert!(matches!(
            decoded.r#type,
            Some(envoy_tls::secret::Type::ValidationContext(_))
        ));
    }
}
