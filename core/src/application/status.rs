// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! The status recorder.
//!
//! Collects condition sets from the builder and reconciles them against the
//! API server through a [`StatusSink`]. The recorder remembers the last
//! condition set it successfully wrote per resource and skips writes that
//! would be identical, which is what keeps a steady-state cluster free of
//! status churn.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::conditions::{ResourceCondition, StatusUpdate};
use crate::domain::kubernetes::{FullName, ObjectKind};
use crate::infrastructure::status_writer::StatusSink;

/// Messages accepted by the recorder task.
#[derive(Debug)]
pub enum StatusMessage {
    /// Placeholder for a resource the builder has not classified yet.
    /// Ignored once anything has been written for the resource.
    Default(StatusUpdate),
    /// Full condition report from one rebuild.
    Report(Vec<StatusUpdate>),
}

pub struct StatusRecorder {
    sink: Arc<dyn StatusSink>,
    last_written: HashMap<(ObjectKind, FullName), Vec<ResourceCondition>>,
}

impl StatusRecorder {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink, last_written: HashMap::new() }
    }

    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<StatusMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            match message {
                StatusMessage::Default(update) => {
                    let key = (update.kind, update.target.clone());
                    if !self.last_written.contains_key(&key) {
                        self.write(update).await;
                    }
                }
                StatusMessage::Report(updates) => {
                    for update in updates {
                        self.write(update).await;
                    }
                }
            }
        }
        info!("status recorder stopped");
    }

    /// Write one update unless it matches what was last written.
    async fn write(&mut self, update: StatusUpdate) {
        let key = (update.kind, update.target.clone());
        if self.last_written.get(&key) == Some(&update.conditions) {
            debug!(kind = %update.kind, resource = %update.target, "status unchanged, skipping write");
            return;
        }
        // On failure the map is left untouched: the next rebuild re-emits
        // the same conditions and the write is retried then.
        if self.sink.apply(&update).await.is_ok() {
            self.last_written.insert(key, update.conditions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::conditions::{ConditionType, Reason};
    use crate::infrastructure::status_writer::StatusError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<StatusUpdate>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn apply(&self, update: &StatusUpdate) -> Result<(), StatusError> {
            self.applied.lock().push(update.clone());
            Ok(())
        }
    }

    fn update(reason: Reason) -> StatusUpdate {
        let mut update =
            StatusUpdate::new(ObjectKind::HttpProxy, FullName::new("default", "proxy"));
        update.push(ResourceCondition::negative(ConditionType::Valid, reason, "x"));
        update
    }

    #[tokio::test]
    async fn identical_condition_sets_are_written_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut recorder = StatusRecorder::new(sink.clone());
        recorder.write(update(Reason::DuplicateFqdn)).await;
        recorder.write(update(Reason::DuplicateFqdn)).await;
        assert_eq!(sink.applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn changed_conditions_are_written_again() {
        let sink = Arc::new(RecordingSink::default());
        let mut recorder = StatusRecorder::new(sink.clone());
        recorder.write(update(Reason::DuplicateFqdn)).await;
        recorder.write(update(Reason::Orphaned)).await;
        assert_eq!(sink.applied.lock().len(), 2);
    }

    #[tokio::test]
    async fn default_status_is_suppressed_after_first_report() {
        let sink = Arc::new(RecordingSink::default());
        let recorder = StatusRecorder::new(sink.clone());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(recorder.run(rx, cancel.clone()));

        tx.send(StatusMessage::Report(vec![update(Reason::DuplicateFqdn)]))
            .await
            .unwrap();
        tx.send(StatusMessage::Default(StatusUpdate::not_reconciled(
            ObjectKind::HttpProxy,
            FullName::new("default", "proxy"),
        )))
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let applied = sink.applied.lock();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].conditions[0].reason, Reason::DuplicateFqdn);
    }
}
