use std::collections::HashMap;

use tracing::{debug, warn};

use crate::pipeline::PipelineTask;

/// A registration waiting for the hub to confirm one of our outbound messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub task: PipelineTask,
    pub pipeline_id: String,
}

/// Maps replies back to the pipeline that asked for them.
///
/// Outbound requests are first recorded under their local token. When the hub
/// echoes the message back with its real id, that id becomes the key replies
/// quote, in the table of the request's task. Entries live until their
/// reply is consumed, or until their pipeline finishes or is aborted.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    tables: [HashMap<String, String>; 4],
    pending: HashMap<String, PendingDelivery>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_delivery(&mut self, local_id: &str, task: PipelineTask, pipeline_id: &str) {
        self.pending.insert(
            local_id.to_string(),
            PendingDelivery { task, pipeline_id: pipeline_id.to_string() },
        );
    }

    /// Drop a pending registration whose message never left.
    pub fn forget_delivery(&mut self, local_id: &str) -> Option<PendingDelivery> {
        self.pending.remove(local_id)
    }

    /// Consume the pending entry for `local_id` and register `message_id`
    /// as the key replies to that message will quote.
    pub fn confirm_delivery(&mut self, local_id: &str, message_id: &str) -> Option<PendingDelivery> {
        let pending = self.pending.remove(local_id)?;
        let table = &mut self.tables[pending.task.index()];
        // one key per pipeline per task
        table.retain(|_, pipeline| pipeline != &pending.pipeline_id);
        if let Some(previous) = table.insert(message_id.to_string(), pending.pipeline_id.clone()) {
            warn!(
                "message id {} was already registered for pipeline {} ({})",
                message_id, previous, pending.task
            );
        }
        debug!(
            "registered {} request {} for pipeline {}",
            pending.task, message_id, pending.pipeline_id
        );
        Some(pending)
    }

    pub fn lookup(&self, task: PipelineTask, key: &str) -> Option<&str> {
        self.tables[task.index()].get(key).map(String::as_str)
    }

    /// Remove `key` from the `task` table, returning the pipeline it belonged to.
    pub fn take(&mut self, task: PipelineTask, key: &str) -> Option<String> {
        self.tables[task.index()].remove(key)
    }

    /// Consume the interpreter request `key` answers, checking rewrite, route,
    /// then completion.
    pub fn take_interpreted(&mut self, key: &str) -> Option<(PipelineTask, String)> {
        PipelineTask::INTERPRETED
            .into_iter()
            .find_map(|task| self.take(task, key).map(|id| (task, id)))
    }

    /// Remove every entry that belongs to `pipeline_id`. Returns how many went.
    pub fn purge(&mut self, pipeline_id: &str) -> usize {
        let mut removed = 0;
        for table in self.tables.iter_mut() {
            let before = table.len();
            table.retain(|_, id| id != pipeline_id);
            removed += before - table.len();
        }
        let before = self.pending.len();
        self.pending.retain(|_, p| p.pipeline_id != pipeline_id);
        removed + before - self.pending.len()
    }

    pub fn len(&self, task: PipelineTask) -> usize {
        self.tables[task.index()].len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.tables.iter().all(HashMap::is_empty)
    }
}
