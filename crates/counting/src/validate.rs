//! Input normalisation shared by every entry point that accepts user input.

use tally_core::{DomainError, DomainResult};

/// Longest accepted item code (after trimming).
pub const MAX_CODE_LEN: usize = 50;

/// Largest quantity a single submission may carry.
pub const MAX_QUANTITY: f64 = 999_999.0;

/// Longest accepted session/team/product name.
pub const MAX_NAME_LEN: usize = 100;

/// Trim and upper-case an item code; codes are compared in this form everywhere.
pub fn normalize_code(raw: &str) -> DomainResult<String> {
    let code = raw.trim().to_uppercase();
    if code.is_empty() {
        return Err(DomainError::validation("item code cannot be empty"));
    }
    if code.chars().count() > MAX_CODE_LEN {
        return Err(DomainError::validation(format!(
            "item code longer than {MAX_CODE_LEN} characters"
        )));
    }
    Ok(code)
}

/// Counted quantities must be finite, non-negative and bounded.
pub fn validate_quantity(quantity: f64) -> DomainResult<f64> {
    if !quantity.is_finite() {
        return Err(DomainError::validation("quantity must be a finite number"));
    }
    if quantity < 0.0 {
        return Err(DomainError::validation("quantity cannot be negative"));
    }
    if quantity > MAX_QUANTITY {
        return Err(DomainError::validation(format!(
            "quantity cannot exceed {MAX_QUANTITY}"
        )));
    }
    Ok(quantity)
}

/// Trim a human-entered name and check its length.
pub fn validate_name(raw: &str, what: &str) -> DomainResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(DomainError::validation(format!("{what} cannot be empty")));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::validation(format!(
            "{what} longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}
