// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Rule evaluation
//!
//! [`RuleEvaluator`] turns rule/scope pairs into binary [`Violation`]
//! verdicts. The decision itself is delegated to a [`RuleJudge`]:
//! - [`HeuristicRuleJudge`]: deterministic checks recognized from the rule
//!   wording (length limits, required or forbidden content, questions,
//!   greetings, tool usage, latency)
//! - [`LlmRuleJudge`]: LLM-as-judge for arbitrary natural-language rules
//!
//! Each rule/scope pair is judged independently, so verdict sets do not
//! depend on evaluation order. A judge error never drops a rule: it is
//! recorded as a non-violation carrying a diagnostic.

use crate::llm_client::LLMClient;
use crate::text;
use crate::EvalError;
use agentsim_core::{AgentOutput, Rule, RuleScope, ToolEvent, Turn, VerdictScope, Violation};
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// What a rule is judged against
#[derive(Debug, Clone, Copy)]
pub enum RuleTarget<'a> {
    Turn {
        index: usize,
        user_message: &'a str,
        output: &'a AgentOutput,
        tool_events: &'a [ToolEvent],
        latency_ms: u64,
    },
    ToolEvent {
        turn: usize,
        index: usize,
        event: &'a ToolEvent,
    },
    Conversation {
        turns: &'a [Turn],
    },
}

impl<'a> RuleTarget<'a> {
    pub fn scope(&self) -> VerdictScope {
        match self {
            RuleTarget::Turn { index, .. } => VerdictScope::Turn { index: *index },
            RuleTarget::ToolEvent { turn, index, .. } => VerdictScope::ToolEvent {
                turn: *turn,
                event: *index,
            },
            RuleTarget::Conversation { .. } => VerdictScope::Conversation,
        }
    }

    /// Plain-text transcript and tool-call listing for prompts
    pub fn render(&self) -> (String, String) {
        match self {
            RuleTarget::Turn {
                user_message,
                output,
                tool_events,
                ..
            } => (
                format!("USER: {}\nAGENT: {}", user_message, output.text),
                render_events(tool_events.iter()),
            ),
            RuleTarget::ToolEvent { event, .. } => {
                (String::new(), render_events(std::iter::once(*event)))
            }
            RuleTarget::Conversation { turns } => (
                turns
                    .iter()
                    .map(|t| {
                        format!(
                            "[turn {}]\nUSER: {}\nAGENT: {}",
                            t.index, t.user_message, t.agent_output.text
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                render_events(turns.iter().flat_map(|t| t.tool_events.iter())),
            ),
        }
    }
}

fn render_events<'e>(events: impl Iterator<Item = &'e ToolEvent>) -> String {
    let lines: Vec<String> = events
        .map(|e| {
            format!(
                "- {}({}) -> {} [{:?}, {} ms]",
                e.name,
                e.input,
                e.error
                    .clone()
                    .or_else(|| e.output.as_ref().map(|o| o.to_string()))
                    .unwrap_or_else(|| "(no output)".to_string()),
                e.status,
                e.duration_ms().unwrap_or(-1)
            )
        })
        .collect();
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Binary decision for one rule against one target
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub violated: bool,
    pub explanation: String,
}

impl Judgment {
    pub fn pass(explanation: impl Into<String>) -> Self {
        Self {
            violated: false,
            explanation: explanation.into(),
        }
    }

    pub fn fail(explanation: impl Into<String>) -> Self {
        Self {
            violated: true,
            explanation: explanation.into(),
        }
    }
}

/// Decides whether a target violates a rule
#[async_trait]
pub trait RuleJudge: Send + Sync {
    async fn judge(&self, rule: &Rule, target: &RuleTarget<'_>) -> Result<Judgment, EvalError>;
}

/// Applies a judge across scopes and records verdicts
#[derive(Clone)]
pub struct RuleEvaluator {
    judge: Arc<dyn RuleJudge>,
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicRuleJudge))
    }
}

impl RuleEvaluator {
    pub fn new(judge: Arc<dyn RuleJudge>) -> Self {
        Self { judge }
    }

    /// Verdict for one rule against one target
    pub async fn evaluate(&self, rule: &Rule, target: &RuleTarget<'_>) -> Violation {
        let scope = target.scope();
        match self.judge.judge(rule, target).await {
            Ok(j) => Violation::verdict(rule, scope, j.violated, j.explanation),
            Err(e) => {
                tracing::warn!(rule = %rule.id, ?scope, error = %e, "rule could not be evaluated");
                Violation::undetermined(rule, scope, e.to_string())
            }
        }
    }

    /// Turn-scoped rules against one turn, in rule order
    pub async fn evaluate_turn(
        &self,
        rules: &[Rule],
        index: usize,
        user_message: &str,
        output: &AgentOutput,
        tool_events: &[ToolEvent],
        latency_ms: u64,
    ) -> Vec<Violation> {
        let target = RuleTarget::Turn {
            index,
            user_message,
            output,
            tool_events,
            latency_ms,
        };
        join_all(
            rules
                .iter()
                .filter(|r| r.scope == RuleScope::Turn)
                .map(|r| self.evaluate(r, &target)),
        )
        .await
    }

    /// Rules attached to tool events at record time, stored on each event
    pub async fn evaluate_tool_events(&self, turn: usize, events: &mut [ToolEvent]) {
        let verdicts: Vec<Vec<Violation>> = join_all(events.iter().enumerate().map(
            |(index, event)| async move {
                let target = RuleTarget::ToolEvent { turn, index, event };
                join_all(event.rules.iter().map(|r| self.evaluate(r, &target))).await
            },
        ))
        .await;

        for (event, v) in events.iter_mut().zip(verdicts) {
            event.verdicts = v;
        }
    }

    /// Conversation-scoped rules against the full transcript
    pub async fn evaluate_conversation(&self, rules: &[Rule], turns: &[Turn]) -> Vec<Violation> {
        let target = RuleTarget::Conversation { turns };
        join_all(
            rules
                .iter()
                .filter(|r| r.scope == RuleScope::Conversation)
                .map(|r| self.evaluate(r, &target)),
        )
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Unit {
    Words,
    Characters,
    Sentences,
}

impl Unit {
    fn parse(raw: &str) -> Self {
        let raw = raw.to_ascii_lowercase();
        if raw.starts_with("char") {
            Unit::Characters
        } else if raw.starts_with("sentence") {
            Unit::Sentences
        } else {
            Unit::Words
        }
    }

    fn count(self, text: &str) -> usize {
        match self {
            Unit::Words => text.split_whitespace().count(),
            Unit::Characters => text.chars().count(),
            Unit::Sentences => text::sentences(text).len(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Unit::Words => "words",
            Unit::Characters => "characters",
            Unit::Sentences => "sentences",
        }
    }
}

/// Checks the heuristic judge recognizes in rule wording
#[derive(Debug, Clone, PartialEq)]
enum Check {
    /// Count must stay `<= limit`, or `< limit` when `strict`
    MaxCount { limit: usize, unit: Unit, strict: bool },
    MinCount { limit: usize, unit: Unit },
    MustMention(String),
    MustNotMention(String),
    NoSensitiveData,
    AskQuestion,
    NoQuestion,
    Greet,
    Apologize,
    MustCall(String),
    MustNotCall(String),
    ToolSucceeds(Option<String>),
    Within { ms: u64, tool: Option<String>, tools: bool },
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($re).expect("static regex"))
        }
    };
}

const UNIT: &str = r"(words?|characters?|chars?|sentences?)";

pattern!(
    max_count,
    &format!(
        r"(?i)\b(?:not|never)\s+(?:exceed|be longer than|be more than|go over|use more than)\s+(\d+)\s+{}",
        UNIT
    )
);
pattern!(
    at_most,
    &format!(r"(?i)\b(?:at most|no more than|maximum of|up to|within)\s+(\d+)\s+{}", UNIT)
);
pattern!(
    under,
    &format!(r"(?i)\b(?:under|fewer than|less than|below|shorter than)\s+(\d+)\s+{}", UNIT)
);
pattern!(
    at_least,
    &format!(r"(?i)\b(?:at least|no fewer than|no less than|minimum of)\s+(\d+)\s+{}", UNIT)
);
pattern!(
    negative_call,
    r"(?i)\b(?:must not|should not|shall not|must never|never|do not|don't)\s+(?:call|invoke|trigger|use)\s+(.*)$"
);
pattern!(
    positive_call,
    r"(?i)\b(?:must|should|shall|always)\s+(?:always\s+)?(?:call|invoke|trigger|use)\s+(.*)$"
);
pattern!(
    tool_name,
    r#"(?i)^(?:the\s+|a\s+)?(?:(?:tool|function)\s+[`'"]?([A-Za-z_][\w.-]*)|[`'"]([A-Za-z_][\w.-]*)[`'"]|([A-Za-z_][\w.-]*)\(\)|([A-Za-z_][\w.-]*)\s+(?:tool|function))"#
);
pattern!(
    negative_mention,
    r"(?i)\b(?:must not|should not|shall not|must never|never|do not|don't|cannot|can't)\s+(?:mention|include|contain|say|reveal|share|disclose|use|discuss|recommend|promise|give out|expose)\b\s*(.*)$"
);
pattern!(
    positive_mention,
    r"(?i)\b(?:must|should|shall|always)\s+(?:always\s+)?(?:mention|include|contain|say|reference|cite|provide|offer|state)\b\s*(.*)$"
);
pattern!(
    negative_ask,
    r"(?i)\b(?:must not|should not|never|do not|don't)\s+ask\b"
);
pattern!(positive_ask, r"(?i)\b(?:must|should|always)\s+(?:always\s+)?ask\b");
pattern!(greet, r"(?i)\b(?:must|should|always)\s+(?:always\s+)?greet\b");
pattern!(
    apologize,
    r"(?i)\b(?:must|should|always)\s+(?:always\s+)?apologi[sz]e\b"
);
pattern!(
    succeed,
    r"(?i)\b(?:must|should)\s+(?:not\s+fail|never\s+fail|succeed|complete successfully)"
);
pattern!(
    within_time,
    r"(?i)\b(?:within|under|in less than|faster than)\s+(\d+)\s*(ms|milliseconds?|s|secs?|seconds?)\b"
);
pattern!(quoted, r#"["“'`]([^"”'`]+)["”'`]"#);
pattern!(
    sensitive_kind,
    r"(?i)\b(?:account numbers?|card numbers?|credit cards?|social security|ssn|passwords?|pins?|personal data|pii)\b"
);
pattern!(
    sensitive_value,
    r"(?i)\b(?:\d[ -]?){8,19}\b|\b\d{3}-\d{2}-\d{4}\b|\bpassword\s*(?:is|:)\s*\S+"
);

const GREETINGS: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "welcome",
    "greetings",
    "good morning",
    "good afternoon",
    "good evening",
    "thanks for reaching out",
];

fn extract_tool_name(rest: &str) -> Option<String> {
    let caps = tool_name().captures(rest.trim())?;
    (1..=4)
        .find_map(|i| caps.get(i))
        .map(|m| m.as_str().to_string())
}

/// Object phrase of a mention rule: quoted text when present, otherwise
/// the remainder without leading articles and trailing punctuation
fn mention_phrase(rest: &str) -> Option<String> {
    if let Some(caps) = quoted().captures(rest) {
        return Some(caps[1].trim().to_string());
    }
    let mut phrase = rest.trim().trim_end_matches(['.', '!', ';']).trim();
    for article in ["the ", "any ", "a ", "an "] {
        if let Some(stripped) = phrase.strip_prefix(article) {
            phrase = stripped;
        }
    }
    (!phrase.is_empty()).then(|| phrase.to_string())
}

fn count_check(caps: regex::Captures<'_>) -> Option<(usize, Unit)> {
    let limit = caps[1].parse().ok()?;
    Some((limit, Unit::parse(&caps[2])))
}

impl Check {
    fn parse(rule: &str) -> Option<Check> {
        if let Some((limit, unit)) = max_count().captures(rule).and_then(count_check) {
            return Some(Check::MaxCount { limit, unit, strict: false });
        }
        if let Some((limit, unit)) = at_most().captures(rule).and_then(count_check) {
            return Some(Check::MaxCount { limit, unit, strict: false });
        }
        if let Some((limit, unit)) = under().captures(rule).and_then(count_check) {
            return Some(Check::MaxCount { limit, unit, strict: true });
        }
        if let Some((limit, unit)) = at_least().captures(rule).and_then(count_check) {
            return Some(Check::MinCount { limit, unit });
        }
        if let Some(caps) = within_time().captures(rule) {
            let n: u64 = caps[1].parse().ok()?;
            let ms = if caps[2].to_ascii_lowercase().starts_with('m') {
                n
            } else {
                n.saturating_mul(1000)
            };
            let tools = rule.to_ascii_lowercase().contains("tool")
                || rule.to_ascii_lowercase().contains("function");
            let tool = quoted().captures(rule).map(|c| c[1].to_string());
            return Some(Check::Within {
                ms,
                tools: tools || tool.is_some(),
                tool,
            });
        }
        if let Some(caps) = negative_call().captures(rule) {
            if let Some(name) = extract_tool_name(&caps[1]) {
                return Some(Check::MustNotCall(name));
            }
        }
        if let Some(caps) = positive_call().captures(rule) {
            if let Some(name) = extract_tool_name(&caps[1]) {
                return Some(Check::MustCall(name));
            }
        }
        if succeed().is_match(rule) {
            return Some(Check::ToolSucceeds(
                quoted().captures(rule).map(|c| c[1].to_string()),
            ));
        }
        if negative_ask().is_match(rule) {
            return Some(Check::NoQuestion);
        }
        if positive_ask().is_match(rule) {
            return Some(Check::AskQuestion);
        }
        if greet().is_match(rule) {
            return Some(Check::Greet);
        }
        if apologize().is_match(rule) {
            return Some(Check::Apologize);
        }
        if let Some(caps) = negative_mention().captures(rule) {
            if sensitive_kind().is_match(&caps[1]) {
                return Some(Check::NoSensitiveData);
            }
            return mention_phrase(&caps[1]).map(Check::MustNotMention);
        }
        if let Some(caps) = positive_mention().captures(rule) {
            return mention_phrase(&caps[1]).map(Check::MustMention);
        }
        None
    }

    fn is_tool_check(&self) -> bool {
        matches!(
            self,
            Check::MustCall(_) | Check::MustNotCall(_) | Check::ToolSucceeds(_)
        ) || matches!(self, Check::Within { tools: true, .. })
    }

    /// Verdict on a single agent response. `None` when the check is not
    /// about response text.
    fn on_text(&self, text: &str) -> Option<Judgment> {
        let lower = text.to_lowercase();
        let judgment = match self {
            Check::MaxCount { limit, unit, strict } => {
                let n = unit.count(text);
                let over = if *strict { n >= *limit } else { n > *limit };
                let msg = format!("response has {} {}, limit {}", n, unit.name(), limit);
                if over {
                    Judgment::fail(msg)
                } else {
                    Judgment::pass(msg)
                }
            }
            Check::MinCount { limit, unit } => {
                let n = unit.count(text);
                let msg = format!("response has {} {}, minimum {}", n, unit.name(), limit);
                if n < *limit {
                    Judgment::fail(msg)
                } else {
                    Judgment::pass(msg)
                }
            }
            Check::MustMention(phrase) => {
                if mentions(&lower, phrase) {
                    Judgment::pass(format!("response mentions '{}'", phrase))
                } else {
                    Judgment::fail(format!("response does not mention '{}'", phrase))
                }
            }
            Check::MustNotMention(phrase) => {
                if mentions(&lower, phrase) {
                    Judgment::fail(format!("response mentions '{}'", phrase))
                } else {
                    Judgment::pass(format!("response does not mention '{}'", phrase))
                }
            }
            Check::NoSensitiveData => match sensitive_value().find(text) {
                Some(m) => Judgment::fail(format!(
                    "response exposes sensitive value '{}'",
                    text::excerpt(m.as_str(), 24)
                )),
                None => Judgment::pass("no sensitive values in response"),
            },
            Check::AskQuestion => {
                if text.contains('?') {
                    Judgment::pass("response asks a question")
                } else {
                    Judgment::fail("response asks no question")
                }
            }
            Check::NoQuestion => {
                if text.contains('?') {
                    Judgment::fail("response asks a question")
                } else {
                    Judgment::pass("response asks no question")
                }
            }
            Check::Greet => {
                let opening = text::sentences(text)
                    .into_iter()
                    .next()
                    .unwrap_or_default()
                    .to_lowercase();
                let words: Vec<String> = text::tokenize(&opening);
                let greeted = GREETINGS.iter().any(|g| {
                    if g.contains(' ') {
                        opening.contains(g)
                    } else {
                        words.iter().any(|w| w == g)
                    }
                });
                if greeted {
                    Judgment::pass("response opens with a greeting")
                } else {
                    Judgment::fail("response does not open with a greeting")
                }
            }
            Check::Apologize => {
                if lower.contains("sorry") || lower.contains("apolog") {
                    Judgment::pass("response apologizes")
                } else {
                    Judgment::fail("response does not apologize")
                }
            }
            _ => return None,
        };
        Some(judgment)
    }

    /// Verdict on a set of tool events
    fn on_events(&self, events: &[&ToolEvent]) -> Result<Judgment, EvalError> {
        match self {
            Check::MustCall(name) => {
                if !named_events(events, name).is_empty() {
                    Ok(Judgment::pass(format!("'{}' was called", name)))
                } else if events.is_empty() {
                    Err(EvalError::MissingContext(format!(
                        "no tool events recorded to check for '{}'",
                        name
                    )))
                } else {
                    Ok(Judgment::fail(format!("'{}' was never called", name)))
                }
            }
            Check::MustNotCall(name) => {
                let calls = named_events(events, name).len();
                if calls > 0 {
                    Ok(Judgment::fail(format!("'{}' was called {} time(s)", name, calls)))
                } else {
                    Ok(Judgment::pass(format!("'{}' was not called", name)))
                }
            }
            Check::ToolSucceeds(name) => {
                let relevant = match name {
                    Some(n) => named_events(events, n),
                    None => events.to_vec(),
                };
                if relevant.is_empty() {
                    return Err(EvalError::MissingContext(format!(
                        "no tool event matches {}",
                        name.as_deref().unwrap_or("the rule")
                    )));
                }
                let failed: Vec<&str> = relevant
                    .iter()
                    .filter(|e| e.is_error())
                    .map(|e| e.name.as_str())
                    .collect();
                if failed.is_empty() {
                    Ok(Judgment::pass(format!("{} call(s) succeeded", relevant.len())))
                } else {
                    Ok(Judgment::fail(format!("failed call(s): {}", failed.join(", "))))
                }
            }
            Check::Within { ms, tool, .. } => {
                let relevant = match tool {
                    Some(n) => named_events(events, n),
                    None => events.to_vec(),
                };
                if relevant.is_empty() {
                    return Err(EvalError::MissingContext(
                        "no tool event to time".to_string(),
                    ));
                }
                let slow: Vec<String> = relevant
                    .iter()
                    .filter(|e| e.duration_ms().map_or(true, |d| d > *ms as i64))
                    .map(|e| match e.duration_ms() {
                        Some(d) => format!("{} took {} ms", e.name, d),
                        None => format!("{} never finished", e.name),
                    })
                    .collect();
                if slow.is_empty() {
                    Ok(Judgment::pass(format!("all calls within {} ms", ms)))
                } else {
                    Ok(Judgment::fail(slow.join("; ")))
                }
            }
            _ => Err(EvalError::InvalidInput(
                "check does not apply to tool events".to_string(),
            )),
        }
    }
}

fn named_events<'e>(events: &[&'e ToolEvent], name: &str) -> Vec<&'e ToolEvent> {
    events
        .iter()
        .copied()
        .filter(|e| e.name.eq_ignore_ascii_case(name))
        .collect()
}

fn mentions(lower_text: &str, phrase: &str) -> bool {
    let phrase = phrase.to_lowercase();
    if lower_text.contains(&phrase) {
        return true;
    }
    text::coverage(&phrase, lower_text) >= 1.0
}

fn event_text(event: &ToolEvent) -> String {
    let output = match &event.output {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    match &event.error {
        Some(e) => format!("{} {}", output, e),
        None => output,
    }
}

/// Deterministic judge for rules whose wording it recognizes.
///
/// Unrecognized rules yield an error, which the evaluator records as an
/// undetermined non-violation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicRuleJudge;

impl HeuristicRuleJudge {
    fn judge_turn(
        check: &Check,
        output: &AgentOutput,
        tool_events: &[ToolEvent],
        latency_ms: u64,
    ) -> Result<Judgment, EvalError> {
        if let Check::Within { ms, tools: false, .. } = check {
            let msg = format!("agent responded in {} ms, limit {} ms", latency_ms, ms);
            return Ok(if latency_ms > *ms {
                Judgment::fail(msg)
            } else {
                Judgment::pass(msg)
            });
        }
        if check.is_tool_check() {
            let events: Vec<&ToolEvent> = tool_events.iter().collect();
            return check.on_events(&events);
        }
        check
            .on_text(&output.text)
            .ok_or_else(|| EvalError::InvalidInput("check does not apply to a turn".to_string()))
    }

    fn judge_event(check: &Check, event: &ToolEvent) -> Result<Judgment, EvalError> {
        match check {
            Check::MustCall(_) | Check::Greet | Check::Apologize | Check::AskQuestion => {
                Err(EvalError::MissingContext(
                    "rule needs an agent response, not a tool event".to_string(),
                ))
            }
            c if c.is_tool_check() => c.on_events(&[event]),
            Check::Within { ms, .. } => Check::Within {
                ms: *ms,
                tool: None,
                tools: true,
            }
            .on_events(&[event]),
            c => c.on_text(&event_text(event)).ok_or_else(|| {
                EvalError::InvalidInput("check does not apply to tool events".to_string())
            }),
        }
    }

    fn judge_conversation(check: &Check, turns: &[Turn]) -> Result<Judgment, EvalError> {
        if turns.is_empty() {
            return Err(EvalError::MissingContext(
                "conversation has no turns".to_string(),
            ));
        }

        if let Check::Within { ms, tools: false, .. } = check {
            let slow: Vec<String> = turns
                .iter()
                .filter(|t| t.agent_latency_ms > *ms)
                .map(|t| format!("turn {} took {} ms", t.index, t.agent_latency_ms))
                .collect();
            return Ok(if slow.is_empty() {
                Judgment::pass(format!("every response within {} ms", ms))
            } else {
                Judgment::fail(slow.join("; "))
            });
        }
        if check.is_tool_check() {
            let events: Vec<&ToolEvent> = turns.iter().flat_map(|t| t.tool_events.iter()).collect();
            return check.on_events(&events);
        }

        match check {
            Check::Greet => Self::judge_turn(check, &turns[0].agent_output, &[], 0),
            // Satisfied once anywhere in the conversation
            Check::MustMention(_) | Check::AskQuestion | Check::Apologize => {
                let hit = turns.iter().find_map(|t| {
                    check
                        .on_text(&t.agent_output.text)
                        .filter(|j| !j.violated)
                        .map(|j| (t.index, j))
                });
                Ok(match hit {
                    Some((index, j)) => Judgment::pass(format!("turn {}: {}", index, j.explanation)),
                    None => Judgment::fail(format!(
                        "no response satisfies the rule across {} turn(s)",
                        turns.len()
                    )),
                })
            }
            // Must hold for every response
            _ => {
                let mut failures = Vec::new();
                for turn in turns {
                    let j = check.on_text(&turn.agent_output.text).ok_or_else(|| {
                        EvalError::InvalidInput("check does not apply to a conversation".into())
                    })?;
                    if j.violated {
                        failures.push(format!("turn {}: {}", turn.index, j.explanation));
                    }
                }
                Ok(if failures.is_empty() {
                    Judgment::pass(format!("holds for all {} turn(s)", turns.len()))
                } else {
                    Judgment::fail(failures.join("; "))
                })
            }
        }
    }
}

#[async_trait]
impl RuleJudge for HeuristicRuleJudge {
    async fn judge(&self, rule: &Rule, target: &RuleTarget<'_>) -> Result<Judgment, EvalError> {
        let check = Check::parse(&rule.text).ok_or_else(|| {
            EvalError::InvalidInput(format!(
                "no built-in check recognizes '{}'; configure an LLM judge",
                rule.text
            ))
        })?;

        match target {
            RuleTarget::Turn {
                output,
                tool_events,
                latency_ms,
                ..
            } => Self::judge_turn(&check, output, tool_events, *latency_ms),
            RuleTarget::ToolEvent { event, .. } => Self::judge_event(&check, event),
            RuleTarget::Conversation { turns } => Self::judge_conversation(&check, turns),
        }
    }
}

/// LLM-as-judge for arbitrary natural-language rules
pub struct LlmRuleJudge {
    llm_client: Arc<dyn LLMClient>,
    prompt_template: String,
}

impl LlmRuleJudge {
    pub fn new(llm_client: Arc<dyn LLMClient>) -> Self {
        Self {
            llm_client,
            prompt_template: Self::default_prompt(),
        }
    }

    pub fn with_prompt_template(mut self, template: String) -> Self {
        self.prompt_template = template;
        self
    }

    fn default_prompt() -> String {
        r#"You are an expert compliance reviewer. Decide whether the agent violated the rule below.
Judge only this rule. A rule is either violated or not; there is no partial credit.

RULE ({scope}):
{rule}

TRANSCRIPT:
{transcript}

TOOL CALLS:
{tools}

Respond in JSON format:
{
  "violated": true | false,
  "explanation": "one or two sentences citing the transcript"
}"#
        .to_string()
    }
}

#[async_trait]
impl RuleJudge for LlmRuleJudge {
    async fn judge(&self, rule: &Rule, target: &RuleTarget<'_>) -> Result<Judgment, EvalError> {
        let (transcript, tools) = target.render();
        let scope = match target {
            RuleTarget::Turn { .. } => "single turn",
            RuleTarget::ToolEvent { .. } => "single tool call",
            RuleTarget::Conversation { .. } => "whole conversation",
        };
        let prompt = self
            .prompt_template
            .replace("{scope}", scope)
            .replace("{rule}", &rule.text)
            .replace("{transcript}", &transcript)
            .replace("{tools}", &tools);

        let response = self.llm_client.evaluate(prompt).await?;
        let json = response.as_json().map_err(|e| {
            EvalError::LLMClientError(format!("Failed to parse verdict JSON: {}", e))
        })?;

        let violated = json["violated"]
            .as_bool()
            .ok_or_else(|| EvalError::LLMClientError("Missing violated flag".to_string()))?;
        let explanation = json["explanation"]
            .as_str()
            .unwrap_or("no explanation given")
            .to_string();

        Ok(Judgment {
            violated,
            explanation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::mock::ScriptedLLM;
    use agentsim_core::ToolEventStatus;
    use chrono::Utc;

    fn event(name: &str, status: ToolEventStatus) -> ToolEvent {
        ToolEvent {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            input: serde_json::json!({}),
            output: Some(serde_json::json!("done")),
            error: (status == ToolEventStatus::Failed).then(|| "boom".to_string()),
            status,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            rules: Vec::new(),
            verdicts: Vec::new(),
        }
    }

    fn turn(index: usize, text: &str) -> Turn {
        Turn {
            index,
            user_message: "hi".to_string(),
            agent_output: AgentOutput::text(text),
            tool_events: Vec::new(),
            verdicts: Vec::new(),
            claims: Vec::new(),
            diagnostics: Vec::new(),
            started_at: Utc::now(),
            agent_latency_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_word_limit_violation_references_turn() {
        let rule = Rule::parse("rule-1", "Must not exceed 10 words").unwrap();
        let output = AgentOutput::text(
            "one two three four five six seven eight nine ten eleven twelve thirteen fourteen fifteen",
        );
        let evaluator = RuleEvaluator::default();

        let verdicts = evaluator
            .evaluate_turn(&[rule], 3, "hello", &output, &[], 10)
            .await;

        assert_eq!(verdicts.len(), 1);
        assert!(verdicts[0].violated);
        assert_eq!(verdicts[0].scope, VerdictScope::Turn { index: 3 });
        assert!(verdicts[0].explanation.contains("15 words"));
    }

    #[test]
    fn test_patterns_compile() {
        for pattern in [
            max_count(),
            at_most(),
            under(),
            at_least(),
            negative_call(),
            positive_call(),
            tool_name(),
            negative_mention(),
            positive_mention(),
            negative_ask(),
            positive_ask(),
            greet(),
            apologize(),
            succeed(),
            within_time(),
            quoted(),
            sensitive_kind(),
            sensitive_value(),
        ] {
            assert!(!pattern.as_str().is_empty());
        }
    }

    #[test]
    fn test_check_parsing() {
        assert_eq!(
            Check::parse("Responses should be under 50 characters"),
            Some(Check::MaxCount { limit: 50, unit: Unit::Characters, strict: true })
        );
        assert_eq!(
            Check::parse("Never call the tool `delete_account`"),
            Some(Check::MustNotCall("delete_account".to_string()))
        );
        assert_eq!(
            Check::parse("Must use lookup_order() before answering"),
            Some(Check::MustCall("lookup_order".to_string()))
        );
        assert_eq!(
            Check::parse("Never share card numbers"),
            Some(Check::NoSensitiveData)
        );
        assert_eq!(
            Check::parse("Must mention \"refund policy\""),
            Some(Check::MustMention("refund policy".to_string()))
        );
        assert_eq!(
            Check::parse("Never use slang."),
            Some(Check::MustNotMention("slang".to_string()))
        );
        assert_eq!(Check::parse("Be nice"), None);
        assert_eq!(
            Check::parse("Must respond within 18446744073709552 seconds"),
            Some(Check::Within { ms: u64::MAX, tool: None, tools: false })
        );
    }

    #[tokio::test]
    async fn test_unrecognized_rule_is_undetermined_not_dropped() {
        let rule = Rule::new("r", "Be emotionally intelligent");
        let output = AgentOutput::text("ok");
        let verdicts = RuleEvaluator::default()
            .evaluate_turn(&[rule], 0, "hi", &output, &[], 1)
            .await;
        assert_eq!(verdicts.len(), 1);
        assert!(!verdicts[0].violated);
        assert!(verdicts[0].diagnostic.is_some());
    }

    #[tokio::test]
    async fn test_function_rule_without_tool_events_is_undetermined() {
        let rule = Rule::new("r", "Must call the tool `lookup_order`");
        let output = AgentOutput::text("Your order shipped.");
        let verdicts = RuleEvaluator::default()
            .evaluate_turn(&[rule.clone()], 0, "hi", &output, &[], 1)
            .await;
        assert!(!verdicts[0].violated);
        assert!(verdicts[0].diagnostic.as_deref().unwrap().contains("lookup_order"));

        let events = vec![event("search_faq", ToolEventStatus::Succeeded)];
        let verdicts = RuleEvaluator::default()
            .evaluate_turn(&[rule], 0, "hi", &output, &events, 1)
            .await;
        assert!(verdicts[0].violated);
    }

    #[tokio::test]
    async fn test_tool_event_rules_stored_on_event() {
        let mut failing = event("payment_api", ToolEventStatus::Failed);
        failing.rules = vec![Rule::new("t1", "The call must not fail")];
        let mut events = vec![event("search", ToolEventStatus::Succeeded), failing];

        RuleEvaluator::default()
            .evaluate_tool_events(2, &mut events)
            .await;

        assert!(events[0].verdicts.is_empty());
        assert_eq!(events[1].verdicts.len(), 1);
        assert!(events[1].verdicts[0].violated);
        assert_eq!(
            events[1].verdicts[0].scope,
            VerdictScope::ToolEvent { turn: 2, event: 1 }
        );
    }

    #[tokio::test]
    async fn test_conversation_rules() {
        let turns = vec![
            turn(0, "Hello! How can I help?"),
            turn(1, "Your card 4111 1111 1111 1111 is on file."),
        ];
        let rules = vec![
            Rule::parse("greet", "[conversation] Must greet the user").unwrap(),
            Rule::parse("pii", "[conversation][safety] Never share card numbers").unwrap(),
            Rule::parse("turn-only", "Must not exceed 3 words").unwrap(),
        ];

        let verdicts = RuleEvaluator::default()
            .evaluate_conversation(&rules, &turns)
            .await;

        assert_eq!(verdicts.len(), 2);
        assert!(!verdicts[0].violated);
        assert!(verdicts[1].violated);
        assert!(verdicts[1].explanation.contains("turn 1"));
        assert!(verdicts.iter().all(|v| v.scope == VerdictScope::Conversation));
    }

    #[tokio::test]
    async fn test_verdicts_independent_of_rule_order() {
        let output = AgentOutput::text("Sorry, I cannot help with that today, but call us.");
        let rules = vec![
            Rule::new("a", "Must not exceed 5 words"),
            Rule::new("b", "Must apologize"),
            Rule::new("c", "Must ask a clarifying question"),
            Rule::new("d", "Never mention competitors"),
        ];
        let mut reversed = rules.clone();
        reversed.reverse();

        let evaluator = RuleEvaluator::default();
        let mut forward = evaluator.evaluate_turn(&rules, 0, "hi", &output, &[], 1).await;
        let mut backward = evaluator
            .evaluate_turn(&reversed, 0, "hi", &output, &[], 1)
            .await;
        forward.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        backward.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));

        assert_eq!(forward, backward);
        let violated: Vec<_> = forward.iter().filter(|v| v.violated).map(|v| v.rule_id.as_str()).collect();
        assert_eq!(violated, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_llm_rule_judge() {
        let llm = Arc::new(ScriptedLLM::new(vec![(
            "Be empathetic",
            r#"{"violated": true, "explanation": "The agent dismissed the user's frustration."}"#
                .to_string(),
        )]));
        let evaluator = RuleEvaluator::new(Arc::new(LlmRuleJudge::new(llm.clone())));
        let output = AgentOutput::text("Whatever.");

        let verdicts = evaluator
            .evaluate_turn(&[Rule::new("r", "Be empathetic")], 0, "I'm upset", &output, &[], 1)
            .await;

        assert!(verdicts[0].violated);
        assert!(llm.prompts.lock()[0].contains("AGENT: Whatever."));
    }
}
