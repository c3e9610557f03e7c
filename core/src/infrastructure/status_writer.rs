// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Writes condition sets back to status subresources.
//!
//! The recorder in the application layer decides *what* to write and when a
//! write is redundant; this module only knows how to deliver one update to
//! the API server, with bounded retry on optimistic-concurrency conflicts.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::ApiResource;
use kube::Client;
use tracing::{debug, warn};

use crate::domain::conditions::StatusUpdate;
use crate::domain::kubernetes::ObjectKind;

/// Field manager recorded on status patches.
const FIELD_MANAGER: &str = "isthmus";

/// Attempts per update before giving up; the next rebuild re-emits the same
/// conditions anyway.
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("kind {0} has no status subresource")]
    UnsupportedKind(ObjectKind),
    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// Destination for status updates. The production implementation talks to
/// the API server; tests plug in an in-memory sink.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn apply(&self, update: &StatusUpdate) -> Result<(), StatusError>;
}

/// Kube-backed sink patching the status subresource with a merge patch.
pub struct KubeStatusSink {
    client: Client,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, update: &StatusUpdate) -> Result<Api<DynamicObject>, StatusError> {
        let resource = api_resource(update.kind).ok_or(StatusError::UnsupportedKind(update.kind))?;
        // GatewayClass is the only cluster-scoped kind with status here.
        if update.kind == ObjectKind::GatewayClass {
            return Ok(Api::all_with(self.client.clone(), &resource));
        }
        Ok(Api::namespaced_with(
            self.client.clone(),
            &update.target.namespace,
            &resource,
        ))
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn apply(&self, update: &StatusUpdate) -> Result<(), StatusError> {
        let api = self.api_for(update)?;
        let patch = Patch::Merge(status_patch(update));
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match api.patch_status(&update.target.name, &params, &patch).await {
                Ok(_) => {
                    debug!(kind = %update.kind, resource = %update.target, "status written");
                    return Ok(());
                }
                Err(kube::Error::Api(response)) if response.code == 409 && attempt < MAX_ATTEMPTS => {
                    debug!(
                        kind = %update.kind,
                        resource = %update.target,
                        attempt,
                        "status write conflicted, retrying"
                    );
                }
                Err(error) => {
                    warn!(
                        kind = %update.kind,
                        resource = %update.target,
                        %error,
                        "status write failed"
                    );
                    return Err(error.into());
                }
            }
        }
    }
}

fn api_resource(kind: ObjectKind) -> Option<ApiResource> {
    use crate::domain::gateway;
    use crate::domain::httpproxy;

    let resource = match kind {
        ObjectKind::HttpProxy => ApiResource::erase::<httpproxy::HTTPProxy>(&()),
        ObjectKind::ExtensionService => ApiResource::erase::<httpproxy::ExtensionService>(&()),
        ObjectKind::Ingress => {
            ApiResource::erase::<k8s_openapi::api::networking::v1::Ingress>(&())
        }
        ObjectKind::GatewayClass => ApiResource::erase::<gateway::GatewayClass>(&()),
        ObjectKind::Gateway => ApiResource::erase::<gateway::Gateway>(&()),
        ObjectKind::HttpRoute => ApiResource::erase::<gateway::HTTPRoute>(&()),
        ObjectKind::TlsRoute => ApiResource::erase::<gateway::TLSRoute>(&()),
        ObjectKind::TcpRoute => ApiResource::erase::<gateway::TCPRoute>(&()),
        ObjectKind::GrpcRoute => ApiResource::erase::<gateway::GRPCRoute>(&()),
        _ => return None,
    };
    Some(resource)
}

/// The merge-patch body for one update.
fn status_patch(update: &StatusUpdate) -> serde_json::Value {
    let valid = update.valid();
    let conditions: Vec<serde_json::Value> = update
        .conditions
        .iter()
        .map(|condition| {
            serde_json::json!({
                "type": condition.condition_type.as_str(),
                "status": if condition.status { "True" } else { "False" },
                "reason": condition.reason.as_str(),
                "message": condition.message,
                "lastTransitionTime": update.observed_at.to_rfc3339(),
            })
        })
        .collect();

    serde_json::json!({
        "status": {
            "currentStatus": if valid { "valid" } else { "invalid" },
            "description": update
                .conditions
                .iter()
                .find(|c| !c.status)
                .map(|c| c.message.as_str())
                .unwrap_or("Valid"),
            "conditions": conditions,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::conditions::{ConditionType, Reason, ResourceCondition};
    use crate::domain::kubernetes::FullName;

    #[test]
    fn patch_reflects_validity() {
        let mut update =
            StatusUpdate::new(ObjectKind::HttpProxy, FullName::new("default", "proxy"));
        update.push(ResourceCondition::negative(
            ConditionType::Valid,
            Reason::DuplicateFqdn,
            "fqdn already claimed",
        ));
        let patch = status_patch(&update);
        assert_eq!(patch["status"]["currentStatus"], "invalid");
        assert_eq!(patch["status"]["conditions"][0]["reason"], "DuplicateFQDN");
        assert_eq!(patch["status"]["conditions"][0]["status"], "False");
    }
}
