//! Coordinator decision format.
//!
//! The coordinating role replies to every orchestration round with one JSON
//! action object. The coordinator is a free-text-producing agent, not a
//! strict protocol peer, so [`parse_decision`] tolerates prose and markdown
//! around the JSON. Parsing failure is not a third decision variant: the
//! orchestrator answers it with a repair round.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// One coordination decision.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Decision {
    /// Assign a piece of work to a team member.
    Delegate { role: String, instruction: String },
    /// The task is done; deliver the final report.
    Complete { summary: String },
}

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").expect("valid regex"));

static BRACE_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("valid regex"));

/// Recover a [`Decision`] from the coordinator's raw output.
///
/// Three strategies are tried in strict order, short-circuiting on the
/// first success:
///
/// 1. direct JSON parse of the trimmed text
/// 2. JSON parse of the first fenced code block's contents
/// 3. JSON parse of the first brace-delimited substring
///
/// Anything else returns `None`.
pub fn parse_decision(text: &str) -> Option<Decision> {
    let trimmed = text.trim();

    if let Ok(decision) = serde_json::from_str(trimmed) {
        return Some(decision);
    }

    if let Some(caps) = FENCED_BLOCK.captures(trimmed)
        && let Ok(decision) = serde_json::from_str(caps[1].trim())
    {
        return Some(decision);
    }

    if let Some(found) = BRACE_OBJECT.find(trimmed)
        && let Ok(decision) = serde_json::from_str(found.as_str())
    {
        return Some(decision);
    }

    None
}
