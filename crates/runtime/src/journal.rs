//! Per-request journal: phase transitions, errors, and the plain-language
//! failure report the user sees on terminal failure. Raw provider payloads
//! and backtraces stop here.

use chrono::{DateTime, Utc};
use dotbot_llm::LlmError;
use tracing::debug;

/// Retries budgeted across a whole user request, not per phase.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
enum JournalEntry {
    Phase {
        name: String,
        at: DateTime<Utc>,
    },
    Error {
        phase: String,
        hint: &'static str,
        message: String,
        at: DateTime<Utc>,
    },
}

/// Records what happened to one request. Cheap to carry; everything is
/// in-memory and dropped with the request.
pub struct RequestJournal {
    request_id: String,
    entries: Vec<JournalEntry>,
    recovery_attempts: u32,
    current_phase: String,
}

impl RequestJournal {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            entries: Vec::new(),
            recovery_attempts: 0,
            current_phase: "start".to_string(),
        }
    }

    pub fn phase(&mut self, name: &str) {
        debug!(request_id = %self.request_id, phase = name, "phase transition");
        self.current_phase = name.to_string();
        self.entries.push(JournalEntry::Phase {
            name: name.to_string(),
            at: Utc::now(),
        });
    }

    pub fn record_error(&mut self, err: &LlmError) {
        self.entries.push(JournalEntry::Error {
            phase: self.current_phase.clone(),
            hint: err.user_hint(),
            message: err.to_string(),
            at: Utc::now(),
        });
    }

    /// Returns whether another recovery attempt is within budget, counting it.
    pub fn try_recover(&mut self) -> bool {
        if self.recovery_attempts >= MAX_RECOVERY_ATTEMPTS {
            return false;
        }
        self.recovery_attempts += 1;
        true
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }

    /// Assemble the user-facing failure report: plain language, the last
    /// error's short hint, the attempt count (omitted when 0), and a
    /// category-specific next step. Never includes raw payloads.
    pub fn failure_report(&self) -> String {
        let last_error = self.entries.iter().rev().find_map(|e| match e {
            JournalEntry::Error { phase, hint, .. } => Some((phase.clone(), *hint)),
            _ => None,
        });

        let mut report = String::from("I couldn't finish that request.");
        if let Some((phase, hint)) = last_error {
            report.push_str(&format!(" It failed during {phase}. Suggestion: {hint}."));
        }
        if self.recovery_attempts > 0 {
            report.push_str(&format!(
                " I tried to recover {} time{}.",
                self.recovery_attempts,
                if self.recovery_attempts == 1 { "" } else { "s" }
            ));
        }
        report
    }

    /// Internal trace for logs — includes error messages, never shown to the
    /// user.
    pub fn trace(&self) -> String {
        self.entries
            .iter()
            .map(|e| match e {
                JournalEntry::Phase { name, at } => format!("{at} phase={name}"),
                JournalEntry::Error { phase, message, at, .. } => {
                    format!("{at} error phase={phase}: {message}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limit_error() -> LlmError {
        LlmError::RateLimited {
            provider: "deepseek".to_string(),
            message: "429 body with raw provider payload {secret}".to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn report_names_phase_and_hint_without_raw_payload() {
        let mut journal = RequestJournal::new("req-1");
        journal.phase("tailor");
        journal.phase("tool_loop");
        journal.record_error(&rate_limit_error());

        let report = journal.failure_report();
        assert!(report.contains("tool_loop"));
        assert!(report.contains("rate limits"));
        assert!(!report.contains("secret"));
        assert!(!report.contains("429 body"));
    }

    #[test]
    fn attempt_count_omitted_when_zero() {
        let mut journal = RequestJournal::new("req-1");
        journal.record_error(&rate_limit_error());
        assert!(!journal.failure_report().contains("tried to recover"));

        assert!(journal.try_recover());
        assert!(journal.failure_report().contains("tried to recover 1 time."));
    }

    #[test]
    fn recovery_budget_is_bounded() {
        let mut journal = RequestJournal::new("req-1");
        for _ in 0..MAX_RECOVERY_ATTEMPTS {
            assert!(journal.try_recover());
        }
        assert!(!journal.try_recover());
        assert_eq!(journal.recovery_attempts(), MAX_RECOVERY_ATTEMPTS);
    }

    #[test]
    fn trace_keeps_full_detail_for_logs() {
        let mut journal = RequestJournal::new("req-1");
        journal.phase("dot");
        journal.record_error(&rate_limit_error());
        let trace = journal.trace();
        assert!(trace.contains("phase=dot"));
        assert!(trace.contains("429"));
    }
}
