use std::{
    fmt,
    time::{Duration, Instant},
};

use hub_client::HubMessage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Characters stripped from both ends of interpreter replies.
pub const QUOTES: &[char] = &['«', '»', '“', '”', '"'];

// `\d` is Unicode-aware: full-width and other script digits count too.
static FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));
static ONE_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\A\d\z").expect("valid regex"));

/// Where a pipeline instance is in its lifecycle.
///
/// Stages only ever move forward, one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    New,
    RewriteRequested,
    RoutingRequested,
    AnswerRequested,
    CompletionRequested,
    Done,
}

impl PipelineStage {
    pub fn next(self) -> Self {
        match self {
            PipelineStage::New => PipelineStage::RewriteRequested,
            PipelineStage::RewriteRequested => PipelineStage::RoutingRequested,
            PipelineStage::RoutingRequested => PipelineStage::AnswerRequested,
            PipelineStage::AnswerRequested => PipelineStage::CompletionRequested,
            PipelineStage::CompletionRequested => PipelineStage::Done,
            PipelineStage::Done => PipelineStage::Done,
        }
    }
}

/// The external capability an outbound request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineTask {
    Rewrite = 0,
    Route = 1,
    Answer = 2,
    Completion = 3,
}

impl PipelineTask {
    /// Tasks served by fixed interpreter participants, in reply-lookup priority order.
    pub const INTERPRETED: [PipelineTask; 3] = [
        PipelineTask::Rewrite,
        PipelineTask::Route,
        PipelineTask::Completion,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The stage an instance sits in while a reply for this task is outstanding.
    pub fn awaiting_stage(self) -> PipelineStage {
        match self {
            PipelineTask::Rewrite => PipelineStage::RewriteRequested,
            PipelineTask::Route => PipelineStage::RoutingRequested,
            PipelineTask::Answer => PipelineStage::AnswerRequested,
            PipelineTask::Completion => PipelineStage::CompletionRequested,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineTask::Rewrite => "rewrite",
            PipelineTask::Route => "route",
            PipelineTask::Answer => "answer",
            PipelineTask::Completion => "completion",
        }
    }
}

impl fmt::Display for PipelineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trim whitespace, then strip surrounding quote characters.
pub fn clean_text(text: &str) -> String {
    text.trim().trim_matches(QUOTES).to_string()
}

/// First run of digits in `text` as a 1-based answerer number; 0 when there is
/// none or it does not fit.
pub fn parse_answerer_number(text: &str) -> usize {
    let Some(m) = FIRST_NUMBER.find(text) else { return 0 };
    m.as_str()
        .chars()
        .try_fold(0usize, |n, c| {
            n.checked_mul(10)?.checked_add(digit_value(c) as usize)
        })
        .unwrap_or(0)
}

fn is_decimal(c: char) -> bool {
    let mut buf = [0u8; 4];
    ONE_DIGIT.is_match(c.encode_utf8(&mut buf))
}

/// Decimal digits come in contiguous runs of ten starting at zero, and a
/// block of adjacent runs always starts on a zero.
fn digit_value(c: char) -> u32 {
    if let Some(d) = c.to_digit(10) {
        return d;
    }
    let mut zero = c as u32;
    while let Some(prev) = zero.checked_sub(1).and_then(char::from_u32) {
        if !is_decimal(prev) {
            break;
        }
        zero -= 1;
    }
    (c as u32 - zero) % 10
}

/// One user question travelling through rewrite, route, answer and completion.
#[derive(Debug, Clone)]
pub struct PipelineInstance {
    user_message: HubMessage,
    stage: PipelineStage,
    replies: [Option<HubMessage>; 4],
    answerer_id: Option<String>,
    stage_entered_at: Instant,
}

impl PipelineInstance {
    pub fn new(user_message: HubMessage) -> Self {
        Self {
            user_message,
            stage: PipelineStage::New,
            replies: Default::default(),
            answerer_id: None,
            stage_entered_at: Instant::now(),
        }
    }

    /// Identity is the id of the user message that started the pipeline.
    pub fn id(&self) -> &str {
        &self.user_message.id
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn reply(&self, task: PipelineTask) -> Option<&HubMessage> {
        self.replies[task.index()].as_ref()
    }

    /// The answerer the question was forwarded to.
    pub fn answerer_id(&self) -> Option<&str> {
        self.answerer_id.as_deref()
    }

    pub fn expect_stage(&self, expected: PipelineStage) -> Result<(), PipelineError> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(PipelineError::StageGuard {
                pipeline_id: self.id().to_string(),
                expected,
                actual: self.stage,
            })
        }
    }

    pub(crate) fn capture(&mut self, task: PipelineTask, reply: HubMessage) {
        self.replies[task.index()] = Some(reply);
    }

    pub(crate) fn set_answerer(&mut self, participant_id: String) {
        self.answerer_id = Some(participant_id);
    }

    pub(crate) fn advance(&mut self) {
        self.stage = self.stage.next();
        self.stage_entered_at = Instant::now();
    }

    pub fn stage_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stage_entered_at)
    }

    pub fn rewritten_text(&self) -> Option<String> {
        self.reply(PipelineTask::Rewrite).map(|m| clean_text(&m.text))
    }

    pub fn chosen_answerer_number(&self) -> Option<usize> {
        self.reply(PipelineTask::Route)
            .map(|m| parse_answerer_number(&m.text))
    }

    pub fn final_text(&self) -> Option<String> {
        self.reply(PipelineTask::Completion).map(|m| clean_text(&m.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, text: &str) -> HubMessage {
        HubMessage {
            id: id.into(),
            sender_id: "someone".into(),
            message_type: "T".into(),
            text: text.into(),
            ..HubMessage::default()
        }
    }

    #[test]
    fn test_clean_text_strips_whitespace_then_quotes() {
        assert_eq!(clean_text("  «What is the capital of France?» \n"), "What is the capital of France?");
        assert_eq!(clean_text("“Paris”"), "Paris");
        assert_eq!(clean_text("\"\"quoted\"\""), "quoted");
        assert_eq!(clean_text("plain"), "plain");
        // inner whitespace left by the quotes is kept
        assert_eq!(clean_text("« Paris »"), " Paris ");
    }

    #[test]
    fn test_parse_answerer_number() {
        assert_eq!(parse_answerer_number("2) Beta is the best fit"), 2);
        assert_eq!(parse_answerer_number("bot 12, maybe 3"), 12);
        assert_eq!(parse_answerer_number("none of them"), 0);
        assert_eq!(parse_answerer_number("0"), 0);
        assert_eq!(parse_answerer_number(""), 0);
        assert_eq!(parse_answerer_number("99999999999999999999999999"), 0);
    }

    #[test]
    fn test_parse_answerer_number_non_ascii_digits() {
        assert_eq!(parse_answerer_number("２"), 2);
        assert_eq!(parse_answerer_number("bot ３) fits"), 3);
        assert_eq!(parse_answerer_number("١٢"), 12);
        // mathematical bold two, then double-struck two in the next run
        assert_eq!(parse_answerer_number("\u{1D7D0}"), 2);
        assert_eq!(parse_answerer_number("\u{1D7DA}"), 2);
        assert_eq!(parse_answerer_number("1２"), 12);
    }

    #[test]
    fn test_stage_order_is_total_and_terminal() {
        let mut stage = PipelineStage::New;
        let mut seen = vec![stage];
        while stage != PipelineStage::Done {
            let next = stage.next();
            assert!(next > stage);
            stage = next;
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                PipelineStage::New,
                PipelineStage::RewriteRequested,
                PipelineStage::RoutingRequested,
                PipelineStage::AnswerRequested,
                PipelineStage::CompletionRequested,
                PipelineStage::Done,
            ]
        );
        assert_eq!(PipelineStage::Done.next(), PipelineStage::Done);
    }

    #[test]
    fn test_task_awaiting_stages() {
        for (i, task) in PipelineTask::INTERPRETED.into_iter().enumerate() {
            assert!(task.index() <= PipelineTask::Completion.index());
            assert!(i == 0 || task.awaiting_stage() > PipelineTask::INTERPRETED[i - 1].awaiting_stage());
        }
        assert_eq!(PipelineTask::Route.awaiting_stage(), PipelineStage::RoutingRequested);
        assert_eq!(PipelineTask::Completion.to_string(), "completion");
    }

    #[test]
    fn test_derived_views() {
        let mut p = PipelineInstance::new(msg("u1", "whats the capial of france"));
        assert_eq!(p.id(), "u1");
        assert_eq!(p.rewritten_text(), None);
        assert_eq!(p.chosen_answerer_number(), None);

        p.capture(PipelineTask::Rewrite, msg("r1", "«What is the capital of France?»"));
        p.capture(PipelineTask::Route, msg("r2", "1"));
        p.capture(PipelineTask::Completion, msg("r3", " «The capital of France is Paris.» "));

        assert_eq!(p.rewritten_text().as_deref(), Some("What is the capital of France?"));
        assert_eq!(p.chosen_answerer_number(), Some(1));
        assert_eq!(p.final_text().as_deref(), Some("The capital of France is Paris."));
    }

    #[test]
    fn test_expect_stage_reports_mismatch() {
        let mut p = PipelineInstance::new(msg("u1", "q"));
        assert!(p.expect_stage(PipelineStage::New).is_ok());
        p.advance();
        match p.expect_stage(PipelineStage::New) {
            Err(PipelineError::StageGuard { pipeline_id, expected, actual }) => {
                assert_eq!(pipeline_id, "u1");
                assert_eq!(expected, PipelineStage::New);
                assert_eq!(actual, PipelineStage::RewriteRequested);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
