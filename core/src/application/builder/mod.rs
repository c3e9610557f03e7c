// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! The DAG builder.
//!
//! A pure function from an object-store snapshot to a routing graph plus a
//! condition set per observed routing resource. No I/O happens here; the
//! builder is deterministic and safe to re-run against the same snapshot.
//!
//! Processing order is fixed: HTTPProxy roots claim FQDNs first, Ingress
//! rules merge into whatever is left, then Gateway API routes attach. The
//! order makes I1 conflicts deterministic rather than informer-timing
//! dependent.

mod gateway;
mod httpproxy;
mod ingress;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tracing::debug;

use crate::domain::conditions::{
    ConditionType, Reason, ResourceCondition, StatusReport,
};
use crate::domain::config::IsthmusConfig;
use crate::domain::dag::{
    cluster_name, load_assignment_name, Cluster, Dag, Listener, ServicePortId,
    UpstreamValidation, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME,
};
use crate::domain::kubernetes::{FullName, ObjectKind};
use crate::domain::policy::{
    circuit_breakers_from_annotations, lb_strategy_from_annotations,
    upstream_protocols_from_annotations, HealthCheckPolicy, LbStrategy, PolicyParseError,
    UpstreamProtocol,
};
use crate::domain::secret::{self, ValidSecret};
use crate::infrastructure::object_store::Snapshot;

/// Upper bound on accepted regex match programs; anything larger is
/// rejected with `RegexProgramTooLarge` before it can blow up the data
/// plane's regex engine.
pub const MAX_REGEX_PROGRAM_LEN: usize = 1024;

/// Result of one build: the graph, plus the conditions to report.
#[derive(Debug)]
pub struct BuildResult {
    pub dag: Dag,
    pub report: StatusReport,
}

/// Builds the DAG from snapshots. Stateless between invocations.
#[derive(Debug, Clone)]
pub struct DagBuilder {
    config: Arc<IsthmusConfig>,
}

impl DagBuilder {
    pub fn new(config: Arc<IsthmusConfig>) -> Self {
        Self { config }
    }

    pub fn build(&self, snapshot: &Snapshot) -> BuildResult {
        let mut ctx = BuildContext {
            snapshot,
            config: &self.config,
            dag: Dag {
                listeners: vec![
                    Listener::new(
                        HTTP_LISTENER_NAME,
                        self.config.listener.address.as_str(),
                        self.config.listener.http_port,
                    ),
                    Listener::new(
                        HTTPS_LISTENER_NAME,
                        self.config.listener.address.as_str(),
                        self.config.listener.https_port,
                    ),
                ],
                ..Default::default()
            },
            report: StatusReport::new(),
            claimed_fqdns: HashMap::new(),
            included_by: HashMap::new(),
        };

        httpproxy::process(&mut ctx);
        ingress::process(&mut ctx);
        gateway::process(&mut ctx);
        process_extension_services(&mut ctx);

        ctx.finalize();

        debug!(
            listeners = ctx.dag.listeners.len(),
            clusters = ctx.dag.clusters.len(),
            secrets = ctx.dag.secrets.len(),
            statuses = ctx.report.len(),
            "dag built"
        );

        BuildResult { dag: ctx.dag, report: ctx.report }
    }
}

/// Which surface claimed an FQDN, for conflict messages.
#[derive(Debug, Clone)]
pub(crate) struct FqdnClaim {
    pub kind: ObjectKind,
    pub owner: FullName,
}

/// Mutable state threaded through the per-surface processors.
pub(crate) struct BuildContext<'a> {
    pub snapshot: &'a Snapshot,
    pub config: &'a IsthmusConfig,
    pub dag: Dag,
    pub report: StatusReport,
    /// Lowercased FQDN → first claimant (I1).
    pub claimed_fqdns: HashMap<String, FqdnClaim>,
    /// Included HTTPProxy → the root that first claimed it (I2).
    pub included_by: HashMap<FullName, FullName>,
}

/// A resolved backend service port.
pub(crate) struct ResolvedService {
    pub service: Arc<Service>,
    pub name: FullName,
    pub port_id: ServicePortId,
    pub port_number: u16,
    pub external_name: Option<String>,
}

/// Why a backend could not be resolved.
pub(crate) struct ResolveFailure {
    pub reason: Reason,
    pub message: String,
}

impl ResolveFailure {
    fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into() }
    }
}

impl<'a> BuildContext<'a> {
    /// Sort every virtual host's routes into their final priority order and
    /// drop hosts that ended up with no routes at all.
    fn finalize(&mut self) {
        for listener in &mut self.dag.listeners {
            for vhost in &mut listener.virtual_hosts {
                vhost.routes.sort_by(crate::domain::dag::Route::compare);
            }
            listener.virtual_hosts.retain(|v| !v.routes.is_empty());
            for secure in &mut listener.secure_virtual_hosts {
                secure.virtual_host.routes.sort_by(crate::domain::dag::Route::compare);
            }
            listener
                .secure_virtual_hosts
                .retain(|v| !v.virtual_host.routes.is_empty() || v.tcp_proxy.is_some());
        }
    }

    /// Claim an FQDN for a root resource (I1, case-insensitive). On
    /// conflict the caller receives the prior claim and must emit
    /// `DuplicateFQDN`.
    pub fn claim_fqdn(
        &mut self,
        fqdn: &str,
        kind: ObjectKind,
        owner: &FullName,
    ) -> Result<(), FqdnClaim> {
        let key = fqdn.to_ascii_lowercase();
        match self.claimed_fqdns.get(&key) {
            Some(existing) if existing.owner != *owner || existing.kind != kind => {
                Err(existing.clone())
            }
            Some(_) => Ok(()),
            None => {
                self.claimed_fqdns
                    .insert(key, FqdnClaim { kind, owner: owner.clone() });
                Ok(())
            }
        }
    }

    /// Resolve a service reference by port number or name, applying the
    /// external-name mitigation (I6).
    pub fn resolve_service(
        &self,
        namespace: &str,
        name: &str,
        port: ServicePortRef,
    ) -> Result<ResolvedService, ResolveFailure> {
        let full_name = FullName::new(namespace, name);
        let service = self.snapshot.services.get(&full_name).ok_or_else(|| {
            ResolveFailure::new(
                Reason::BackendNotFound,
                format!("service {full_name} not found"),
            )
        })?;

        let spec = service.spec.as_ref().ok_or_else(|| {
            ResolveFailure::new(Reason::BackendNotFound, format!("service {full_name} has no spec"))
        })?;

        let external_name = if spec.type_.as_deref() == Some("ExternalName") {
            let target = spec.external_name.clone().unwrap_or_default();
            if !self.config.enable_external_name_service {
                return Err(ResolveFailure::new(
                    Reason::BackendNotFound,
                    format!(
                        "service {full_name} is an ExternalName service and external-name \
                         processing is disabled"
                    ),
                ));
            }
            if is_loopback_name(&target) {
                return Err(ResolveFailure::new(
                    Reason::BackendNotFound,
                    format!("service {full_name} resolves to the loopback address {target:?}"),
                ));
            }
            Some(target)
        } else {
            None
        };

        let ports = spec.ports.as_deref().unwrap_or_default();
        let matched = ports.iter().find(|p| match &port {
            ServicePortRef::Number(number) => p.port == i32::from(*number),
            ServicePortRef::Name(port_name) => p.name.as_deref() == Some(port_name.as_str()),
        });
        let matched = matched.ok_or_else(|| {
            ResolveFailure::new(
                Reason::BackendNotFound,
                format!("service {full_name} has no port {port}"),
            )
        })?;

        let port_id = match matched.name.as_deref() {
            Some(name) if !name.is_empty() => ServicePortId::Named(name.to_string()),
            _ => ServicePortId::Numbered(matched.port as u16),
        };

        Ok(ResolvedService {
            service: service.clone(),
            name: full_name,
            port_id,
            port_number: matched.port as u16,
            external_name,
        })
    }

    /// Construct (and register) a cluster for a resolved service, deriving
    /// annotation-driven policies. Returns the cluster name.
    #[allow(clippy::too_many_arguments)]
    pub fn cluster_for(
        &mut self,
        resolved: &ResolvedService,
        protocol_override: Option<UpstreamProtocol>,
        lb_override: Option<LbStrategy>,
        health_check: Option<HealthCheckPolicy>,
        upstream_validation: Option<UpstreamValidation>,
        sni: Option<String>,
        notes: &mut Vec<PolicyParseError>,
    ) -> String {
        let annotations = resolved
            .service
            .metadata
            .annotations
            .clone()
            .unwrap_or_default();

        let (mut breakers, mut breaker_notes) = circuit_breakers_from_annotations(&annotations);
        notes.append(&mut breaker_notes);
        breakers = breakers.with_defaults(self.config.default_circuit_breakers());

        let lb_strategy = match lb_override {
            Some(strategy) => strategy,
            None => {
                let (strategy, mut lb_notes) = lb_strategy_from_annotations(&annotations);
                notes.append(&mut lb_notes);
                strategy
            }
        };

        let protocol = protocol_override.or_else(|| {
            let hints = upstream_protocols_from_annotations(&annotations);
            hints
                .get(&resolved.port_id.to_string())
                .or_else(|| hints.get(&resolved.port_number.to_string()))
                .copied()
        });

        let name = cluster_name(
            &resolved.name,
            &resolved.port_id,
            lb_strategy,
            health_check.as_ref(),
            sni.as_deref(),
            protocol,
            upstream_validation.as_ref(),
        );

        let cluster = Cluster {
            name: name.clone(),
            service: resolved.name.clone(),
            port_name: match &resolved.port_id {
                ServicePortId::Named(port_name) => Some(port_name.clone()),
                ServicePortId::Numbered(_) => None,
            },
            port_number: resolved.port_number,
            eds_name: load_assignment_name(&resolved.name, &resolved.port_id),
            lb_strategy,
            health_check,
            circuit_breakers: breakers,
            protocol,
            upstream_validation,
            sni,
            external_name: resolved.external_name.clone(),
            external_port: resolved.port_number,
            max_requests_per_connection: None,
            dns_lookup_family: self.config.cluster.dns_lookup_family,
            connect_timeout: self.config.timeouts.connect_timeout,
        };
        self.dag.add_cluster(cluster)
    }

    /// Resolve a TLS keypair reference, enforcing cross-namespace
    /// delegation (I3) and content validity (I4). On success the secret is
    /// registered in the DAG and its cache name returned.
    pub fn resolve_keypair(
        &mut self,
        from_namespace: &str,
        reference: &str,
    ) -> Result<String, ResolveFailure> {
        let target = parse_secret_reference(from_namespace, reference);
        if target.namespace != from_namespace
            && !self.delegation_permits(&target, from_namespace)
        {
            return Err(ResolveFailure::new(
                Reason::RefNotPermitted,
                format!(
                    "secret {target} is not delegated to namespace {from_namespace:?}"
                ),
            ));
        }
        self.load_secret(&target, true)
    }

    /// Resolve a CA bundle reference within the owning namespace.
    pub fn resolve_ca_bundle(
        &mut self,
        from_namespace: &str,
        reference: &str,
    ) -> Result<String, ResolveFailure> {
        let target = parse_secret_reference(from_namespace, reference);
        if target.namespace != from_namespace
            && !self.delegation_permits(&target, from_namespace)
        {
            return Err(ResolveFailure::new(
                Reason::RefNotPermitted,
                format!(
                    "secret {target} is not delegated to namespace {from_namespace:?}"
                ),
            ));
        }
        self.load_secret(&target, false)
    }

    /// Load a keypair whose cross-namespace access was already authorized
    /// by a ReferenceGrant (Gateway API path). `reference` must be
    /// namespace-qualified.
    pub fn resolve_keypair_unchecked(&mut self, reference: &str) -> Result<String, ResolveFailure> {
        let target = parse_secret_reference("default", reference);
        self.load_secret(&target, true)
    }

    /// Load a CA bundle without delegation checks (policy-owned refs).
    pub fn resolve_ca_unchecked(&mut self, reference: &str) -> Result<String, ResolveFailure> {
        let target = parse_secret_reference("default", reference);
        self.load_secret(&target, false)
    }

    fn load_secret(
        &mut self,
        target: &FullName,
        want_keypair: bool,
    ) -> Result<String, ResolveFailure> {
        let stored = self.snapshot.secrets.get(target).ok_or_else(|| {
            ResolveFailure::new(Reason::SecretNotValid, format!("secret {target} not found"))
        })?;
        let validated = secret::validate(target.clone(), stored).map_err(|error| {
            ResolveFailure::new(Reason::SecretNotValid, format!("secret {target}: {error}"))
        })?;
        match (&validated, want_keypair) {
            (ValidSecret::Keypair { .. }, true) | (ValidSecret::CaBundle { .. }, false) => {
                Ok(self.dag.add_secret(validated))
            }
            (ValidSecret::CaBundle { .. }, true) => Err(ResolveFailure::new(
                Reason::SecretNotValid,
                format!("secret {target} is a CA bundle, not a server keypair"),
            )),
            (ValidSecret::Keypair { .. }, false) => Err(ResolveFailure::new(
                Reason::SecretNotValid,
                format!("secret {target} is a server keypair, not a CA bundle"),
            )),
        }
    }

    /// Whether a TLSCertificateDelegation in the secret's namespace permits
    /// `consumer_namespace` to use it.
    fn delegation_permits(&self, secret: &FullName, consumer_namespace: &str) -> bool {
        self.snapshot
            .delegations
            .values()
            .filter(|delegation| {
                delegation.metadata.namespace.as_deref() == Some(secret.namespace.as_str())
            })
            .flat_map(|delegation| delegation.spec.delegations.iter())
            .any(|grant| {
                grant.secret_name == secret.name
                    && grant
                        .target_namespaces
                        .iter()
                        .any(|ns| ns == "*" || ns == consumer_namespace)
            })
    }

    /// Validate a regex condition (content rule `RegexProgramTooLarge`).
    pub fn check_regex(&self, pattern: &str) -> Result<(), ResolveFailure> {
        if pattern.len() > MAX_REGEX_PROGRAM_LEN {
            return Err(ResolveFailure::new(
                Reason::RegexProgramTooLarge,
                format!("regex program is {} bytes, limit {MAX_REGEX_PROGRAM_LEN}", pattern.len()),
            ));
        }
        regex::Regex::new(pattern).map(|_| ()).map_err(|error| {
            ResolveFailure::new(
                Reason::RegexProgramTooLarge,
                format!("regex does not compile: {error}"),
            )
        })
    }

    /// Record annotation parse notes as a warning condition without
    /// invalidating the resource.
    pub fn note_policy_errors(
        &mut self,
        kind: ObjectKind,
        owner: &FullName,
        notes: &[PolicyParseError],
    ) {
        if notes.is_empty() {
            return;
        }
        let message = notes
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        self.report.condition(
            kind,
            owner.clone(),
            ResourceCondition::positive(ConditionType::PartiallyInvalid, Reason::SpecError, message),
        );
    }
}

/// Emit clusters for ExtensionServices. Authorization and rate-limit
/// filters dial these as ordinary gRPC upstreams; the endpoint translator
/// supplies their load assignments like any other service port.
fn process_extension_services(ctx: &mut BuildContext) {
    let extensions: Vec<(FullName, Arc<crate::domain::httpproxy::ExtensionService>)> = ctx
        .snapshot
        .extension_services
        .iter()
        .map(|(name, extension)| (name.clone(), extension.clone()))
        .collect();

    for (name, extension) in extensions {
        let validation = match &extension.spec.validation {
            None => None,
            Some(validation) => match ctx.resolve_ca_bundle(&name.namespace, &validation.ca_secret)
            {
                Ok(ca_secret) => Some(UpstreamValidation {
                    ca_secret,
                    subject_name: validation.subject_name.clone(),
                }),
                Err(failure) => {
                    ctx.report.condition(
                        ObjectKind::ExtensionService,
                        name.clone(),
                        ResourceCondition::negative(
                            ConditionType::Valid,
                            failure.reason,
                            failure.message,
                        ),
                    );
                    continue;
                }
            },
        };

        let lb_override = extension
            .spec
            .load_balancer_policy
            .as_ref()
            .and_then(|p| LbStrategy::parse(&p.strategy));

        let mut failed = false;
        for target in &extension.spec.services {
            match ctx.resolve_service(
                &name.namespace,
                &target.name,
                ServicePortRef::Number(target.port),
            ) {
                Ok(resolved) => {
                    let mut notes = Vec::new();
                    // Extension upstreams are gRPC and therefore HTTP/2.
                    let sni = validation.as_ref().map(|v| v.subject_name.clone());
                    let protocol = if validation.is_some() {
                        UpstreamProtocol::H2
                    } else {
                        UpstreamProtocol::H2c
                    };
                    ctx.cluster_for(
                        &resolved,
                        Some(protocol),
                        lb_override,
                        None,
                        validation.clone(),
                        sni,
                        &mut notes,
                    );
                    ctx.note_policy_errors(ObjectKind::ExtensionService, &name, &notes);
                }
                Err(failure) => {
                    failed = true;
                    ctx.report.condition(
                        ObjectKind::ExtensionService,
                        name.clone(),
                        ResourceCondition::negative(
                            ConditionType::Valid,
                            failure.reason,
                            failure.message,
                        ),
                    );
                }
            }
        }
        if !failed {
            ctx.report.mark_valid_if_unset(ObjectKind::ExtensionService, name);
        }
    }
}

/// Port selector used by the different routing surfaces.
#[derive(Debug, Clone)]
pub(crate) enum ServicePortRef {
    Number(u16),
    Name(String),
}

impl std::fmt::Display for ServicePortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServicePortRef::Number(n) => write!(f, "{n}"),
            ServicePortRef::Name(n) => write!(f, "{n:?}"),
        }
    }
}

fn parse_secret_reference(default_namespace: &str, reference: &str) -> FullName {
    match reference.split_once('/') {
        Some((namespace, name)) => FullName::new(namespace, name),
        None => FullName::new(default_namespace, reference),
    }
}

/// Names refusing the external-name gate even when enabled (I6).
fn is_loopback_name(name: &str) -> bool {
    let bare = name.trim_end_matches('.');
    if bare.eq_ignore_ascii_case("localhost") || bare.ends_with(".localhost") {
        return true;
    }
    match bare.parse::<std::net::IpAddr>() {
        Ok(address) => address.is_loopback(),
        Err(_) => false,
    }
}

/// Condition prefix bookkeeping shared by HTTPProxy includes: an include is
/// a duplicate iff its full condition set equals an earlier sibling's,
/// except for the empty set and the bare `prefix: /` which are exempt.
pub(crate) fn is_exempt_from_duplicate_check(
    conditions: &[crate::domain::httpproxy::MatchCondition],
) -> bool {
    match conditions {
        [] => true,
        [only] => {
            only.prefix.as_deref() == Some("/")
                && only.exact.is_none()
                && only.regex.is_none()
                && only.header.is_none()
                && only.query_parameter.is_none()
                && only.method.is_none()
        }
        _ => false,
    }
}

/// Track seen condition sets per including proxy.
pub(crate) struct IncludeConditionSet {
    seen: HashSet<String>,
}

impl IncludeConditionSet {
    pub fn new() -> Self {
        Self { seen: HashSet::new() }
    }

    /// Returns `false` when the set was already presented by an earlier
    /// sibling.
    pub fn first_occurrence(
        &mut self,
        conditions: &[crate::domain::httpproxy::MatchCondition],
    ) -> bool {
        if is_exempt_from_duplicate_check(conditions) {
            return true;
        }
        let key = serde_json::to_string(conditions).unwrap_or_default();
        self.seen.insert(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::httpproxy::MatchCondition;

    #[test]
    fn loopback_names_are_refused() {
        assert!(is_loopback_name("localhost"));
        assert!(is_loopback_name("LOCALHOST."));
        assert!(is_loopback_name("foo.localhost"));
        assert!(is_loopback_name("127.0.0.1"));
        assert!(is_loopback_name("::1"));
        assert!(!is_loopback_name("app.example.com"));
    }

    #[test]
    fn duplicate_exemptions() {
        assert!(is_exempt_from_duplicate_check(&[]));
        let root_prefix = MatchCondition { prefix: Some("/".into()), ..Default::default() };
        assert!(is_exempt_from_duplicate_check(std::slice::from_ref(&root_prefix)));
        let narrower = MatchCondition { prefix: Some("/api".into()), ..Default::default() };
        assert!(!is_exempt_from_duplicate_check(std::slice::from_ref(&narrower)));
    }

    #[test]
    fn include_condition_set_flags_second_occurrence() {
        let mut set = IncludeConditionSet::new();
        let conditions = vec![MatchCondition { prefix: Some("/api".into()), ..Default::default() }];
        assert!(set.first_occurrence(&conditions));
        assert!(!set.first_occurrence(&conditions));
        // Exempt sets never count as duplicates.
        assert!(set.first_occurrence(&[]));
        assert!(set.first_occurrence(&[]));
    }
}
