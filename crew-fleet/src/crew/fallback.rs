//! Texts sent to chat users when a crew could not produce an answer.

use std::time::Duration;

pub const EMPTY_RESPONSE: &str =
    "🤔 I couldn't process that request. Try `/help` to see what I can do.";

pub const ITERATION_LIMIT: &str = "🔄 I went round in circles trying to answer that. \
Please rephrase it more specifically, or try `/help` for the available commands.";

pub const SYSTEM_ERROR: &str =
    "🚨 A system error occurred while handling your request. Please contact an administrator.";

/// Error-text fragments that mean the crew hit its iteration/step budget.
const ITERATION_SIGNATURES: &[&str] = &[
    "max_iter",
    "max iterations",
    "maximum iterations",
    "iteration limit",
    "step limit",
];

pub fn timed_out(timeout: Duration) -> String {
    format!(
        "⏱️ That request took longer than {} and was stopped. \
Try a simpler command, or `/help` to see what I can do.",
        describe(timeout)
    )
}

fn describe(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 {
        format!("{} seconds", timeout.as_secs())
    } else {
        format!("{} ms", timeout.as_millis())
    }
}

pub fn task_error(error: &anyhow::Error) -> String {
    format!("❌ Sorry, something went wrong while processing your request: {error}. Please try again.")
}

pub fn is_iteration_limit(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    ITERATION_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Pick the text for a failed crew invocation.
pub fn for_error(error: &anyhow::Error) -> String {
    if is_iteration_limit(&format!("{error:#}")) {
        ITERATION_LIMIT.to_string()
    } else {
        task_error(error)
    }
}
