//! Tiered request routing.
//!
//! A request is sized, optionally graded for difficulty by a short side call,
//! mapped to a tier through a fixed decision table and dispatched. Failures
//! walk the escalation table in [`Tier::fallback`]; only a failure of the last
//! tier reaches the caller. Every successful call is charged to the cost
//! ledger before its text is returned.

use super::client::{Backend, OracleError, OracleRequest, OracleResponse};
use super::models::Tier;
use super::tokens::{estimate_tokens, leading_words, truncate_to_tokens};
use crate::ledger::CostLedger;
use crate::parse::{parse_difficulty, parse_json_object};
use crate::prompts;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufRead, Write};

/// Difficulty side calls: one attempt plus this many retries on malformed output.
const DIFFICULTY_RETRIES: usize = 4;

/// Words of the payload shown to the difficulty grader.
const DIFFICULTY_SAMPLE_WORDS: usize = 200;

/// Thresholds of the tier decision table, in estimated tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Below this, unstructured easy/moderate prompts stay on the local tier.
    pub small_ceiling: usize,
    /// Easy prompts below this go to the mid tier.
    pub easy_mid_ceiling: usize,
    /// Prompts below this may use the strong tier; above it, large-context.
    pub strong_ceiling: usize,
    /// Prompts above this are offered for truncation.
    pub absolute_ceiling: usize,
    /// Lower truncation ceiling applied in verbose mode.
    pub debug_ceiling: usize,
    /// Size a truncated prompt is cut down to.
    pub truncate_target: usize,
    pub verbose: bool,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            small_ceiling: 8_000,
            easy_mid_ceiling: 15_500,
            strong_ceiling: 30_000,
            absolute_ceiling: 100_000,
            debug_ceiling: 10_000,
            truncate_target: 8_000,
            verbose: false,
        }
    }
}

impl RoutingPolicy {
    fn needs_truncation(&self, tokens: usize) -> bool {
        tokens > self.absolute_ceiling || (self.verbose && tokens > self.debug_ceiling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difficulty {
    Easy,
    Moderate,
    Hard,
    /// The grader never produced a usable verdict.
    Unknown,
}

impl Difficulty {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "easy" => Some(Difficulty::Easy),
            "moderate" => Some(Difficulty::Moderate),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Difficulty::Easy => "easy",
            Difficulty::Moderate => "moderate",
            Difficulty::Hard => "hard",
            Difficulty::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Pick a tier from difficulty, size and whether a JSON object is required.
pub fn select_tier(difficulty: Difficulty, tokens: usize, structured: bool, policy: &RoutingPolicy) -> Tier {
    let small_unstructured = tokens < policy.small_ceiling && !structured;
    match difficulty {
        Difficulty::Unknown => Tier::Local,
        Difficulty::Easy => {
            if small_unstructured {
                Tier::Local
            } else if tokens < policy.easy_mid_ceiling {
                Tier::Mid
            } else if tokens < policy.strong_ceiling {
                Tier::Strong
            } else {
                Tier::LargeContext
            }
        }
        Difficulty::Moderate => {
            if small_unstructured {
                Tier::Local
            } else if tokens < policy.strong_ceiling {
                Tier::Strong
            } else {
                Tier::LargeContext
            }
        }
        Difficulty::Hard => {
            if tokens < policy.strong_ceiling {
                Tier::Strong
            } else {
                Tier::LargeContext
            }
        }
    }
}

/// What to do when a prompt is over the size ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationMode {
    /// Ask on the terminal, defaulting to yes.
    Ask,
    Always,
    Never,
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AskOptions<'a> {
    pub system_role: Option<&'a str>,
    /// Skip difficulty grading and start on this tier.
    pub tier: Option<Tier>,
    pub json_mode: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no tier could answer; last attempt on {tier} failed: {source}")]
    Exhausted {
        tier: Tier,
        #[source]
        source: OracleError,
    },
}

pub struct Router<B> {
    backend: B,
    ledger: CostLedger,
    project: String,
    policy: RoutingPolicy,
    truncation: TruncationMode,
}

impl<B: Backend> Router<B> {
    pub fn new(
        backend: B,
        ledger: CostLedger,
        project: impl Into<String>,
        policy: RoutingPolicy,
        truncation: TruncationMode,
    ) -> Self {
        Self {
            backend,
            ledger,
            project: project.into(),
            policy,
            truncation,
        }
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Route a prompt to a tier and return the response text.
    pub async fn ask(&self, content: &str, options: AskOptions<'_>) -> Result<String, RouterError> {
        let tokens = estimate_tokens(content);
        let (tier, difficulty) = match options.tier {
            Some(tier) => (tier, None),
            None => {
                let difficulty = self.estimate_difficulty(content).await;
                (select_tier(difficulty, tokens, options.json_mode, &self.policy), Some(difficulty))
            }
        };

        let mut payload = content.to_string();
        let mut tokens = tokens;
        if self.policy.needs_truncation(tokens) && self.confirm_truncation(tokens) {
            payload = truncate_to_tokens(content, self.policy.truncate_target);
            tokens = estimate_tokens(&payload);
        }

        tracing::debug!(
            tier = tier.id(),
            tokens,
            difficulty = %difficulty.map(|d| d.to_string()).unwrap_or_else(|| "pinned".to_string()),
            "dispatching prompt"
        );

        if options.json_mode && !tier.supports_json_mode() {
            tracing::debug!(tier = tier.id(), "no JSON mode on this provider; relying on the prompt");
        }
        let request = OracleRequest {
            system: options.system_role,
            user: &payload,
            json_mode: options.json_mode,
        };
        self.dispatch(tier, &request).await
    }

    /// Grade the opening of a prompt; gives up after a bounded number of tries.
    async fn estimate_difficulty(&self, content: &str) -> Difficulty {
        let sample = leading_words(content, DIFFICULTY_SAMPLE_WORDS);
        let request = OracleRequest {
            system: Some(prompts::DIFFICULTY_ROLE),
            user: &sample,
            json_mode: true,
        };

        for attempt in 0..=DIFFICULTY_RETRIES {
            match self.backend.complete(Tier::Mid, &request).await {
                Ok(response) => {
                    self.record(Tier::Mid, &response);
                    if let Some(difficulty) = parse_difficulty(&response.content) {
                        return difficulty;
                    }
                    tracing::debug!(attempt, "difficulty verdict was malformed");
                }
                Err(err) => tracing::debug!(attempt, error = %err, "difficulty call failed"),
            }
        }
        Difficulty::Unknown
    }

    /// Call `tier`, walking the escalation table on failure.
    async fn dispatch(&self, tier: Tier, request: &OracleRequest<'_>) -> Result<String, RouterError> {
        let mut tier = tier;
        loop {
            let result = self
                .backend
                .complete(tier, request)
                .await
                .and_then(|response| check_response(response, request.json_mode));

            match result {
                Ok(response) => {
                    self.record(tier, &response);
                    return Ok(response.content);
                }
                Err(err) => match tier.fallback() {
                    Some(next) => {
                        tracing::warn!(from = tier.id(), to = next.id(), error = %err, "tier failed; escalating");
                        tier = next;
                    }
                    None => return Err(RouterError::Exhausted { tier, source: err }),
                },
            }
        }
    }

    /// Charge by tier: providers report dated model variants the price table does not list.
    fn record(&self, tier: Tier, response: &OracleResponse) {
        tracing::trace!(model = %response.model, "charging usage");
        if let Err(err) = self.ledger.record(&self.project, tier.id(), &response.usage) {
            tracing::warn!(error = %err, "failed to record usage in cost ledger");
        }
    }

    fn confirm_truncation(&self, tokens: usize) -> bool {
        let target = self.policy.truncate_target;
        match self.truncation {
            TruncationMode::Always => true,
            TruncationMode::Never => false,
            TruncationMode::Ask => {
                let question = format!(
                    "The prompt length is {} tokens. Would you like to shorten it to {} tokens?",
                    tokens, target
                );
                ask_yes_no(&question, true)
            }
        }
    }
}

/// Reject replies no caller can use: blank text, or prose where a JSON object was requested.
fn check_response(response: OracleResponse, json_mode: bool) -> Result<OracleResponse, OracleError> {
    if response.content.trim().is_empty() {
        return Err(OracleError::Empty);
    }
    if json_mode {
        if let Err(err) = parse_json_object(&response.content) {
            return Err(OracleError::Malformed(err.to_string()));
        }
    }
    Ok(response)
}

fn ask_yes_no(question: &str, default: bool) -> bool {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    let stdin = io::stdin();
    loop {
        print!("{}\n{}: ", question, hint);
        let _ = io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            return default;
        }
        match line.trim() {
            "" => return default,
            "y" | "Y" | "1" => return true,
            "n" | "N" | "0" => return false,
            _ => println!("Incorrect input. Please try again."),
        }
    }
}
