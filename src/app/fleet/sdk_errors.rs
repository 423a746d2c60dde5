//! AWS SDK error categorization for unit-level access failures.
//!
//! SDK errors reach this module as text (the adapters render them with
//! `DisplayErrorContext`, which includes the service error code). Categorization is by
//! known AWS error-code patterns, and every category carries an operator-facing
//! remediation hint so discovery responses are actionable.

use super::error::{AccessError, AccessErrorKind};
use super::state::TargetUnit;

/// Render an `anyhow::Error` including its context chain.
pub fn error_text(error: &anyhow::Error) -> String {
    format!("{:#}", error)
}

/// Categorize an error based on its string representation
pub fn classify_error_string(error_str: &str) -> AccessErrorKind {
    // Throttling errors (most common transient error)
    if error_str.contains("ThrottlingException")
        || error_str.contains("Throttling")
        || error_str.contains("TooManyRequestsException")
        || error_str.contains("RequestLimitExceeded")
        || error_str.contains("RateExceeded")
    {
        return AccessErrorKind::Throttled;
    }

    // Missing role in the target account
    if error_str.contains("NoSuchEntity")
        || error_str.contains("RoleNotFound")
        || error_str.contains("role does not exist")
        || (error_str.contains("role with name") && error_str.contains("cannot be found"))
    {
        return AccessErrorKind::RoleNotFound;
    }

    if error_str.contains("AccessDenied")
        || error_str.contains("AccessDeniedException")
        || error_str.contains("UnauthorizedOperation")
        || error_str.contains("AuthFailure")
        || error_str.contains("InvalidClientTokenId")
        || error_str.contains("ExpiredToken")
        || error_str.contains("not authorized")
    {
        return AccessErrorKind::AccessDenied;
    }

    if error_str.contains("TimeoutError")
        || error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("DispatchFailure")
        || error_str.contains("deadline exceeded")
    {
        return AccessErrorKind::Timeout;
    }

    AccessErrorKind::ServiceError
}

/// Operator-facing next step for a failed unit.
pub fn remediation(kind: AccessErrorKind, unit: &TargetUnit, role_name: &str) -> String {
    match kind {
        AccessErrorKind::AccessDenied => format!(
            "Verify that the trust policy of role '{}' in account {} allows the home account \
             and that the configured external id matches, and that the role grants \
             rds:DescribeDBInstances.",
            role_name, unit.account_id
        ),
        AccessErrorKind::RoleNotFound => format!(
            "Deploy role '{}' to account {} and re-run discovery.",
            role_name, unit.account_id
        ),
        AccessErrorKind::Throttled => format!(
            "Requests to {} were throttled; lower discovery.max_concurrent_units or retry later.",
            unit.region
        ),
        AccessErrorKind::Timeout => format!(
            "Check network connectivity to the {} endpoints or raise discovery.unit_timeout_secs.",
            unit.region
        ),
        AccessErrorKind::ServiceError => {
            "Inspect the error message; the unit is skipped and retried on the next run."
                .to_string()
        }
    }
}

/// Build a classified [`AccessError`] for a unit from raw error text.
pub fn access_error(unit: &TargetUnit, role_name: &str, error_str: &str) -> AccessError {
    let kind = classify_error_string(error_str);
    access_error_of_kind(kind, unit, role_name, error_str)
}

pub fn access_error_of_kind(
    kind: AccessErrorKind,
    unit: &TargetUnit,
    role_name: &str,
    error_str: &str,
) -> AccessError {
    AccessError {
        kind,
        account_id: unit.account_id.clone(),
        region: unit.region.clone(),
        message: truncate_message(error_str, 400),
        remediation: remediation(kind, unit, role_name),
    }
}

/// Truncate a message to max length on a character boundary
fn truncate_message(msg: &str, max_len: usize) -> String {
    if msg.chars().count() <= max_len {
        msg.to_string()
    } else {
        let truncated: String = msg.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
