//! Keyword table that classifies node error text.
//!
//! The same table answers two questions: whether a failure is transient and
//! worth retrying, and which user-facing message describes it. Matching is a
//! case-insensitive substring search; for messages the first matching rule wins.

/// One row of the classification table
#[derive(Debug, Clone, Copy)]
pub struct ErrorRule {
    pub keywords: &'static [&'static str],
    pub retryable: bool,
    pub message: &'static str,
}

pub const DEFAULT_FRIENDLY_MESSAGE: &str =
    "Something went wrong while running this step. Please try again or contact your administrator.";

pub const ERROR_RULES: &[ErrorRule] = &[
    ErrorRule {
        keywords: &["no form configured"],
        retryable: false,
        message: "This step needs a form, but no form has been configured for it.",
    },
    ErrorRule {
        keywords: &["unknown node type"],
        retryable: false,
        message: "This workflow contains a step type the engine does not support.",
    },
    ErrorRule {
        keywords: &["nesting level"],
        retryable: false,
        message: "Too many nested subprocesses. Simplify the workflow or flatten a level.",
    },
    ErrorRule {
        keywords: &["timeout"],
        retryable: true,
        message: "The operation timed out. The external service may be slow; please try again.",
    },
    ErrorRule {
        keywords: &["connection", "network"],
        retryable: true,
        message: "Could not reach the external service. Check the network connection and try again.",
    },
    ErrorRule {
        keywords: &["429"],
        retryable: true,
        message: "The external service is rate limiting requests. Please wait and try again.",
    },
    ErrorRule {
        keywords: &["500", "502", "503", "504", "unavailable", "temporarily", "transient"],
        retryable: true,
        message: "The external service is having problems right now. Please try again later.",
    },
    ErrorRule {
        keywords: &["401", "403", "unauthorized", "forbidden"],
        retryable: false,
        message: "Access was denied. Check the credentials configured for this step.",
    },
    ErrorRule {
        keywords: &["404", "not found"],
        retryable: false,
        message: "The requested resource could not be found.",
    },
];

fn matches(rule: &ErrorRule, lowered: &str) -> bool {
    rule.keywords.iter().any(|k| lowered.contains(k))
}

/// First rule whose keywords occur in `error`
pub fn classify(error: &str) -> Option<&'static ErrorRule> {
    let lowered = error.to_lowercase();
    ERROR_RULES.iter().find(|rule| matches(rule, &lowered))
}

/// True when any retryable rule matches `error`
pub fn is_retryable(error: &str) -> bool {
    let lowered = error.to_lowercase();
    ERROR_RULES
        .iter()
        .any(|rule| rule.retryable && matches(rule, &lowered))
}

pub fn friendly_message(error: &str) -> &'static str {
    classify(error)
        .map(|rule| rule.message)
        .unwrap_or(DEFAULT_FRIENDLY_MESSAGE)
}
