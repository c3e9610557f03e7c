// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Status condition vocabulary.
//!
//! Every routing resource the builder inspects receives a set of conditions
//! describing whether it was admitted and, if not, why. The reason tags form
//! a closed set so that operators and tests can match on them; free-form
//! detail goes into the message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::kubernetes::{FullName, ObjectKind};

/// Condition types written to status subresources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Accepted,
    Valid,
    Programmed,
    ResolvedRefs,
    PartiallyInvalid,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Accepted => "Accepted",
            ConditionType::Valid => "Valid",
            ConditionType::Programmed => "Programmed",
            ConditionType::ResolvedRefs => "ResolvedRefs",
            ConditionType::PartiallyInvalid => "PartiallyInvalid",
        }
    }
}

/// Closed reason taxonomy. The serialized form of each variant is the tag
/// carried in status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    // Admission
    DuplicateFqdn,
    DuplicateMatchConditions,
    RootIncludesRoot,
    Orphaned,
    IngressClassMismatch,
    InvalidKind,
    BackendNotFound,
    RefNotPermitted,
    NoIntersectingHostnames,
    RuleMatchConflict,
    RuleMatchPartiallyConflict,
    RootNamespaceMismatch,
    SpecError,
    // Content
    SecretNotValid,
    TlsParametersInvalid,
    CipherSuiteNotAllowed,
    RegexProgramTooLarge,
    // Lifecycle
    NotReconciled,
    Ambiguous,
    Valid,
    Accepted,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::DuplicateFqdn => "DuplicateFQDN",
            Reason::DuplicateMatchConditions => "DuplicateMatchConditions",
            Reason::RootIncludesRoot => "RootIncludesRoot",
            Reason::Orphaned => "Orphaned",
            Reason::IngressClassMismatch => "IngressClassMismatch",
            Reason::InvalidKind => "InvalidKind",
            Reason::BackendNotFound => "BackendNotFound",
            Reason::RefNotPermitted => "RefNotPermitted",
            Reason::NoIntersectingHostnames => "NoIntersectingHostnames",
            Reason::RuleMatchConflict => "RuleMatchConflict",
            Reason::RuleMatchPartiallyConflict => "RuleMatchPartiallyConflict",
            Reason::RootNamespaceMismatch => "RootNamespaceMismatch",
            Reason::SpecError => "SpecError",
            Reason::SecretNotValid => "SecretNotValid",
            Reason::TlsParametersInvalid => "TLSParametersInvalid",
            Reason::CipherSuiteNotAllowed => "CipherSuiteNotAllowed",
            Reason::RegexProgramTooLarge => "RegexProgramTooLarge",
            Reason::NotReconciled => "NotReconciled",
            Reason::Ambiguous => "Ambiguous",
            Reason::Valid => "Valid",
            Reason::Accepted => "Accepted",
        }
    }
}

/// A single condition as written to a status subresource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    pub reason: Reason,
    pub message: String,
}

impl ResourceCondition {
    pub fn positive(condition_type: ConditionType, reason: Reason, message: impl Into<String>) -> Self {
        Self { condition_type, status: true, reason, message: message.into() }
    }

    pub fn negative(condition_type: ConditionType, reason: Reason, message: impl Into<String>) -> Self {
        Self { condition_type, status: false, reason, message: message.into() }
    }
}

/// The full set of conditions the builder produced for one resource in one
/// rebuild cycle. Collected by the event handler and handed to the status
/// recorder; the builder itself never talks to the API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub kind: ObjectKind,
    pub target: FullName,
    pub conditions: Vec<ResourceCondition>,
    pub observed_at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(kind: ObjectKind, target: FullName) -> Self {
        Self { kind, target, conditions: Vec::new(), observed_at: Utc::now() }
    }

    /// The placeholder status a freshly observed resource carries until the
    /// builder has classified it.
    pub fn not_reconciled(kind: ObjectKind, target: FullName) -> Self {
        let mut update = Self::new(kind, target);
        update.conditions.push(ResourceCondition::negative(
            ConditionType::Valid,
            Reason::NotReconciled,
            "Waiting for controller",
        ));
        update
    }

    pub fn push(&mut self, condition: ResourceCondition) {
        self.conditions.push(condition);
    }

    pub fn valid(&self) -> bool {
        self.conditions
            .iter()
            .filter(|c| c.condition_type == ConditionType::Valid)
            .all(|c| c.status)
    }
}

/// Accumulates one [`StatusUpdate`] per resource during a rebuild, keyed by
/// (kind, namespace/name). Order of accumulation does not influence the
/// reported set.
#[derive(Debug, Default)]
pub struct StatusReport {
    updates: std::collections::BTreeMap<(ObjectKind, FullName), StatusUpdate>,
}

impl StatusReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch-or-create the update slot for a resource.
    pub fn entry(&mut self, kind: ObjectKind, target: FullName) -> &mut StatusUpdate {
        self.updates
            .entry((kind, target.clone()))
            .or_insert_with(|| StatusUpdate::new(kind, target))
    }

    pub fn condition(
        &mut self,
        kind: ObjectKind,
        target: FullName,
        condition: ResourceCondition,
    ) {
        self.entry(kind, target).push(condition);
    }

    /// Mark a resource valid unless an earlier step already recorded a
    /// negative `Valid` condition for it.
    pub fn mark_valid_if_unset(&mut self, kind: ObjectKind, target: FullName) {
        let update = self.entry(kind, target);
        let has_valid = update
            .conditions
            .iter()
            .any(|c| c.condition_type == ConditionType::Valid);
        if !has_valid {
            update.push(ResourceCondition::positive(
                ConditionType::Valid,
                Reason::Valid,
                "Valid",
            ));
        }
    }

    pub fn get(&self, kind: ObjectKind, target: &FullName) -> Option<&StatusUpdate> {
        self.updates.get(&(kind, target.clone()))
    }

    pub fn into_updates(self) -> Vec<StatusUpdate> {
        self.updates.into_values().collect()
    }

    pub fn updates(&self) -> impl Iterator<Item = &StatusUpdate> {
        self.updates.values()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_tags_render_expected_strings() {
        assert_eq!(Reason::DuplicateFqdn.as_str(), "DuplicateFQDN");
        assert_eq!(Reason::TlsParametersInvalid.as_str(), "TLSParametersInvalid");
        assert_eq!(Reason::RuleMatchPartiallyConflict.as_str(), "RuleMatchPartiallyConflict");
    }

    #[test]
    fn mark_valid_does_not_override_negative_condition() {
        let mut report = StatusReport::new();
        let target = FullName::new("default", "proxy");
        report.condition(
            ObjectKind::HttpProxy,
            target.clone(),
            ResourceCondition::negative(ConditionType::Valid, Reason::DuplicateFqdn, "fqdn taken"),
        );
        report.mark_valid_if_unset(ObjectKind::HttpProxy, target.clone());

        let update = report.get(ObjectKind::HttpProxy, &target).unwrap();
        assert_eq!(update.conditions.len(), 1);
        assert!(!update.valid());
    }
}
