// src/interpreter.rs

use std::{collections::HashMap, sync::Arc, time::{Duration, Instant}};

use hub_client::{Directives, HubEvent, HubMessage, HubSender, OutgoingMessage, StateSnapshot};
use moka::sync::Cache;
use tracing::{debug, error, info, trace, warn};

use crate::{
    correlation::CorrelationTable,
    error::PipelineError,
    history::{HistoryBuffer, HistoryEntry},
    logger::PIPELINE_TARGET,
    pipeline::{PipelineInstance, PipelineStage, PipelineTask},
    registry::ParticipantRegistry,
    settings::{InterpreterSettings, MAX_RETENTION_SECS},
    template::{PromptContext, PromptRenderer},
};

/// Prefix of every debug echo. Echoes come back as our own messages and are
/// only confirmed, never classified as pipeline traffic.
pub const DEBUG_MARKER: &str = "#DEBUG";

/// How a pipeline left the live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Delivered,
    Aborted,
}

/// Drives every user question through rewrite → route → answer → completion.
///
/// Events are handled one at a time, each to completion, so the shared
/// history and registry need no locking. Sends only queue on the hub
/// connection.
pub struct Interpreter {
    settings: InterpreterSettings,
    renderer: Box<dyn PromptRenderer>,
    hub: Arc<dyn HubSender>,
    registry: ParticipantRegistry,
    interpreter_ids: HashMap<PipelineTask, String>,
    history: HistoryBuffer,
    pipelines: HashMap<String, PipelineInstance>,
    finished: Cache<String, PipelineOutcome>,
    correlations: CorrelationTable,
}

impl Interpreter {
    pub fn new(
        settings: InterpreterSettings,
        renderer: Box<dyn PromptRenderer>,
        hub: Arc<dyn HubSender>,
    ) -> Self {
        let history = HistoryBuffer::new(settings.effective_history_size());
        let retention = settings.completed_retention_secs.min(MAX_RETENTION_SECS);
        let finished = Cache::builder()
            .time_to_live(Duration::from_secs(retention))
            .build();
        Self {
            settings,
            renderer,
            hub,
            registry: ParticipantRegistry::new(),
            interpreter_ids: HashMap::new(),
            history,
            pipelines: HashMap::new(),
            finished,
            correlations: CorrelationTable::new(),
        }
    }

    /// True once every interpreter participant has been resolved at least once.
    pub fn is_ready(&self) -> bool {
        PipelineTask::INTERPRETED
            .iter()
            .all(|task| self.interpreter_ids.contains_key(task))
    }

    pub fn pipeline(&self, id: &str) -> Option<&PipelineInstance> {
        self.pipelines.get(id)
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn outcome(&self, id: &str) -> Option<PipelineOutcome> {
        self.finished.get(id)
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn correlations(&self) -> &CorrelationTable {
        &self.correlations
    }

    /// Feed one inbound hub event.
    ///
    /// Only configuration errors come back; everything else is logged here.
    pub fn handle_event(&mut self, event: HubEvent) -> Result<(), PipelineError> {
        match event {
            HubEvent::State(snapshot) => self.on_state(&snapshot),
            HubEvent::Message(message) => {
                self.on_message(message);
                Ok(())
            }
        }
    }

    /// Replace the registry and re-resolve the interpreter participants.
    ///
    /// When a configured name is missing the previous interpreter mapping is kept.
    #[tracing::instrument(name = "state", skip_all)]
    pub fn on_state(&mut self, snapshot: &StateSnapshot) -> Result<(), PipelineError> {
        if !self.registry.replace(snapshot) {
            return Ok(());
        }
        let mut resolved = HashMap::new();
        for task in PipelineTask::INTERPRETED {
            let Some(name) = self.settings.interpreter_names.name_for(task) else { continue };
            match self.registry.id_of(name) {
                Some(id) => {
                    resolved.insert(task, id.to_string());
                }
                None => {
                    return Err(PipelineError::UnknownInterpreter {
                        task,
                        name: name.to_string(),
                    });
                }
            }
        }
        debug!("interpreters resolved: {:?}", resolved);
        self.interpreter_ids = resolved;
        Ok(())
    }

    #[tracing::instrument(name = "dispatch", skip_all, fields(message_id = %message.id))]
    pub fn on_message(&mut self, message: HubMessage) {
        if let Err(err) = self.dispatch(message) {
            warn!(error = %err, "dropped inbound message");
        }
    }

    fn dispatch(&mut self, message: HubMessage) -> Result<(), PipelineError> {
        if !message.is_text() {
            trace!("ignoring {} message", message.message_type);
            return Ok(());
        }
        if self.is_own(&message) {
            self.confirm_delivery(&message);
            return Ok(());
        }
        if message.sent_by_human {
            self.start_pipeline(message);
            return Ok(());
        }
        let from_interpreter = self.is_interpreter(&message.sender_id);
        if from_interpreter {
            let found = message
                .quoted_message_id
                .as_deref()
                .and_then(|q| self.correlations.take_interpreted(q));
            if let Some((task, pipeline_id)) = found {
                let result = match task {
                    PipelineTask::Rewrite => self.handle_rewrite(&pipeline_id, message),
                    PipelineTask::Route => self.handle_route(&pipeline_id, message),
                    PipelineTask::Completion => self.handle_completion(&pipeline_id, message),
                    PipelineTask::Answer => self.handle_answer(&pipeline_id, message),
                };
                self.settle(&pipeline_id, result);
                return Ok(());
            }
        }
        // an interpreter may also be listed as an answerer
        let answer_for = message
            .quoted_message_id
            .as_deref()
            .and_then(|q| self.correlations.take(PipelineTask::Answer, q));
        match answer_for {
            Some(pipeline_id) => {
                let result = self.handle_answer(&pipeline_id, message);
                self.settle(&pipeline_id, result);
            }
            None if from_interpreter => {
                return Err(PipelineError::CorrelationMiss {
                    quoted: message.quoted_message_id,
                });
            }
            None => trace!("message from {} is not pipeline traffic", message.sender_id),
        }
        Ok(())
    }

    /// The hub only attaches a local id to messages we sent.
    fn is_own(&self, message: &HubMessage) -> bool {
        message.local_id.is_some() || self.registry.is_self(&message.sender_id)
    }

    fn is_interpreter(&self, participant_id: &str) -> bool {
        self.interpreter_ids.values().any(|id| id == participant_id)
    }

    fn confirm_delivery(&mut self, message: &HubMessage) {
        if message.text.starts_with(DEBUG_MARKER) {
            trace!("debug echo delivered as {}", message.id);
            return;
        }
        let Some(local_id) = message.local_id.as_deref() else { return };
        match self.correlations.confirm_delivery(local_id, &message.id) {
            Some(pending) => trace!(
                "{} request for pipeline {} delivered as {}",
                pending.task, pending.pipeline_id, message.id
            ),
            None => trace!("untracked own message {}", local_id),
        }
    }

    fn start_pipeline(&mut self, message: HubMessage) {
        if self.pipelines.contains_key(&message.id) || self.finished.contains_key(&message.id) {
            debug!("message {} already has a pipeline", message.id);
            return;
        }
        self.echo("message from user", &message.text, None);
        let id = message.id.clone();
        self.history.push(HistoryEntry::from(&message));
        self.pipelines.insert(id.clone(), PipelineInstance::new(message));
        tracing::event!(target: PIPELINE_TARGET, tracing::Level::INFO, pipeline = %id, event = "started");
        let result = self.request_rewrite(&id);
        self.settle(&id, result);
    }

    /// `New` → `RewriteRequested`
    fn request_rewrite(&mut self, pipeline_id: &str) -> Result<(), PipelineError> {
        self.guard(pipeline_id, PipelineStage::New)?;
        let recipient = self.interpreter_id(PipelineTask::Rewrite)?;
        let context = PromptContext::with_history(self.history.snapshot());
        let prompt = self.renderer.render(PipelineTask::Rewrite, &context)?;
        self.send_request(PipelineTask::Rewrite, pipeline_id, prompt, &recipient)?;
        self.live_mut(pipeline_id)?.advance();
        Ok(())
    }

    /// `RewriteRequested` → `RoutingRequested`
    fn handle_rewrite(&mut self, pipeline_id: &str, reply: HubMessage) -> Result<(), PipelineError> {
        self.guard(pipeline_id, PipelineTask::Rewrite.awaiting_stage())?;
        self.echo("rewrite from interpreter", &reply.text, None);
        let instance = self.live_mut(pipeline_id)?;
        instance.capture(PipelineTask::Rewrite, reply);
        let rewritten = instance.rewritten_text().unwrap_or_default();

        let recipient = self.interpreter_id(PipelineTask::Route)?;
        let context = PromptContext::for_routing(rewritten, &self.settings.answerers);
        let prompt = self.renderer.render(PipelineTask::Route, &context)?;
        self.send_request(PipelineTask::Route, pipeline_id, prompt, &recipient)?;
        self.live_mut(pipeline_id)?.advance();
        Ok(())
    }

    /// `RoutingRequested` → `AnswerRequested`
    fn handle_route(&mut self, pipeline_id: &str, reply: HubMessage) -> Result<(), PipelineError> {
        self.guard(pipeline_id, PipelineTask::Route.awaiting_stage())?;
        let reply_text = reply.text.clone();
        let instance = self.live_mut(pipeline_id)?;
        instance.capture(PipelineTask::Route, reply);
        let number = instance.chosen_answerer_number().unwrap_or(0);

        let count = self.settings.answerers.len();
        if number == 0 || number > count {
            self.echo("routing from interpreter", &reply_text, Some("no answerer"));
            return Err(PipelineError::UnroutableSelection {
                pipeline_id: pipeline_id.to_string(),
                number,
                count,
            });
        }
        let name = self.settings.answerers[number - 1].name.clone();
        self.echo("routing from interpreter", &reply_text, Some(&name));
        let answerer_id = self
            .registry
            .id_of(&name)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::UnknownParticipant(name.clone()))?;

        let question = self.live(pipeline_id)?.rewritten_text().unwrap_or_default();
        self.send_request(PipelineTask::Answer, pipeline_id, question, &answerer_id)?;
        let instance = self.live_mut(pipeline_id)?;
        instance.set_answerer(answerer_id);
        instance.advance();
        Ok(())
    }

    /// `AnswerRequested` → `CompletionRequested`
    fn handle_answer(&mut self, pipeline_id: &str, reply: HubMessage) -> Result<(), PipelineError> {
        self.guard(pipeline_id, PipelineTask::Answer.awaiting_stage())?;
        self.echo("answer from answerer", &reply.text, None);
        let mut history = self.history.snapshot();
        history.push(HistoryEntry::from(&reply));
        self.live_mut(pipeline_id)?.capture(PipelineTask::Answer, reply);

        let recipient = self.interpreter_id(PipelineTask::Completion)?;
        let prompt = self
            .renderer
            .render(PipelineTask::Completion, &PromptContext::with_history(history))?;
        self.send_request(PipelineTask::Completion, pipeline_id, prompt, &recipient)?;
        self.live_mut(pipeline_id)?.advance();
        Ok(())
    }

    /// `CompletionRequested` → `Done`: publish the polished answer.
    fn handle_completion(&mut self, pipeline_id: &str, reply: HubMessage) -> Result<(), PipelineError> {
        self.guard(pipeline_id, PipelineTask::Completion.awaiting_stage())?;
        self.echo("completion from interpreter", &reply.text, None);
        let instance = self.live_mut(pipeline_id)?;
        instance.capture(PipelineTask::Completion, reply);
        let final_text = instance.final_text().unwrap_or_default();
        let answerer_id = instance
            .reply(PipelineTask::Answer)
            .map(|m| m.sender_id.clone())
            .or_else(|| instance.answerer_id().map(str::to_string))
            .unwrap_or_default();

        let msg = OutgoingMessage::text(final_text.clone(), self.hub.generate_local_id())
            .with_directives(&Directives::approved().on_behalf_of(&answerer_id))?;
        self.hub.enqueue(msg)?;

        self.history.push(HistoryEntry {
            sender_id: answerer_id,
            text: final_text,
            sent_by_human: false,
        });
        self.live_mut(pipeline_id)?.advance();
        self.retire(pipeline_id, PipelineOutcome::Delivered);
        Ok(())
    }

    /// Abort every pipeline that has been waiting in one stage for longer than
    /// the configured timeout. Returns how many were aborted.
    #[tracing::instrument(skip(self))]
    pub fn sweep_stale(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.settings.stage_timeout() else { return 0 };
        let stale: Vec<(String, PipelineStage)> = self
            .pipelines
            .values()
            .filter(|p| p.stage_age(now) >= timeout)
            .map(|p| (p.id().to_string(), p.stage()))
            .collect();
        for (pipeline_id, stage) in &stale {
            let err = PipelineError::Stale { pipeline_id: pipeline_id.clone(), stage: *stage };
            self.settle(pipeline_id, Err(err));
        }
        stale.len()
    }

    /// Log a handler result; end the pipeline when it cannot go on.
    fn settle(&mut self, pipeline_id: &str, result: Result<(), PipelineError>) {
        match result {
            Ok(()) => {}
            Err(err) if err.aborts_pipeline() => {
                error!(pipeline = %pipeline_id, error = %err, "aborting pipeline");
                self.abort(pipeline_id);
            }
            Err(err) => warn!(pipeline = %pipeline_id, error = %err, "ignored pipeline event"),
        }
    }

    fn abort(&mut self, pipeline_id: &str) {
        if self.pipelines.contains_key(pipeline_id) {
            self.retire(pipeline_id, PipelineOutcome::Aborted);
            self.send_fallback();
        }
    }

    fn retire(&mut self, pipeline_id: &str, outcome: PipelineOutcome) {
        self.pipelines.remove(pipeline_id);
        let freed = self.correlations.purge(pipeline_id);
        self.finished.insert(pipeline_id.to_string(), outcome);
        tracing::event!(
            target: PIPELINE_TARGET,
            tracing::Level::INFO,
            pipeline = %pipeline_id,
            event = ?outcome,
            freed_entries = freed,
        );
        info!("pipeline {} finished: {:?}", pipeline_id, outcome);
    }

    fn send_fallback(&self) {
        let Some(text) = self.settings.fallback_message.as_deref() else { return };
        if let Err(e) = self.send_approved(text.to_string()) {
            error!("could not send fallback message: {}", e);
        }
    }

    /// Mirror an internal exchange into the conversation when debugging.
    fn echo(&self, what: &str, text: &str, choice: Option<&str>) {
        if !self.settings.debug {
            return;
        }
        let mut body = format!("{DEBUG_MARKER}\n{what}:\n«{text}»");
        if let Some(choice) = choice {
            body.push_str(&format!("\n→ {choice}"));
        }
        if let Err(e) = self.send_approved(body) {
            warn!("could not send debug echo: {}", e);
        }
    }

    fn send_approved(&self, text: String) -> Result<(), PipelineError> {
        let msg = OutgoingMessage::text(text, self.hub.generate_local_id())
            .with_directives(&Directives::approved())?;
        self.hub.enqueue(msg)?;
        Ok(())
    }

    /// Queue a prompt for `recipient` and remember which pipeline awaits its reply.
    fn send_request(
        &mut self,
        task: PipelineTask,
        pipeline_id: &str,
        text: String,
        recipient: &str,
    ) -> Result<(), PipelineError> {
        let local_id = self.hub.generate_local_id();
        let msg = OutgoingMessage::text(text, local_id.clone())
            .with_directives(&Directives::redirect_to(recipient))?;
        self.correlations.expect_delivery(&local_id, task, pipeline_id);
        if let Err(e) = self.hub.enqueue(msg) {
            self.correlations.forget_delivery(&local_id);
            return Err(e.into());
        }
        debug!("sent {} request {} for pipeline {}", task, local_id, pipeline_id);
        Ok(())
    }

    fn interpreter_id(&self, task: PipelineTask) -> Result<String, PipelineError> {
        self.interpreter_ids
            .get(&task)
            .cloned()
            .ok_or(PipelineError::InterpreterUnresolved(task))
    }

    fn guard(&self, pipeline_id: &str, expected: PipelineStage) -> Result<(), PipelineError> {
        self.live(pipeline_id)?.expect_stage(expected)
    }

    fn live(&self, pipeline_id: &str) -> Result<&PipelineInstance, PipelineError> {
        self.pipelines
            .get(pipeline_id)
            .ok_or_else(|| PipelineError::UnknownPipeline(pipeline_id.to_string()))
    }

    fn live_mut(&mut self, pipeline_id: &str) -> Result<&mut PipelineInstance, PipelineError> {
        self.pipelines
            .get_mut(pipeline_id)
            .ok_or_else(|| PipelineError::UnknownPipeline(pipeline_id.to_string()))
    }
}
