use crate::error::{AppError, AppResult};

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum length for account identifiers.
pub const MAX_ACCOUNT_LENGTH: usize = 64;

/// Largest single top-up, in cents.
pub const MAX_TOPUP_CENTS: u64 = 100_000_000;

/// Validate an account identifier.
///
/// Rules:
/// - Must be between 1 and 64 characters
/// - Must start and end with an alphanumeric character
/// - Can contain alphanumeric characters, dots, underscores, and hyphens
/// - Cannot contain consecutive dots, underscores, or hyphens
pub fn validate_account(account: &str) -> AppResult<()> {
    if account.is_empty() {
        return Err(AppError::BadRequest("Account cannot be empty".to_string()));
    }

    if account.len() > MAX_ACCOUNT_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Account cannot exceed {MAX_ACCOUNT_LENGTH} characters"
        )));
    }

    if !account.starts_with(|c: char| c.is_ascii_alphanumeric())
        || !account.ends_with(|c: char| c.is_ascii_alphanumeric())
    {
        return Err(AppError::BadRequest(
            "Account must start and end with an alphanumeric character".to_string(),
        ));
    }

    let mut prev_special = false;
    for (i, c) in account.chars().enumerate() {
        let is_special = matches!(c, '.' | '_' | '-');

        if !c.is_ascii_alphanumeric() && !is_special {
            return Err(AppError::BadRequest(format!(
                "Account contains invalid character '{c}' at position {i}. \
                 Only alphanumeric characters, dots, underscores, and hyphens are allowed"
            )));
        }

        if is_special && prev_special {
            return Err(AppError::BadRequest(format!(
                "Account cannot contain consecutive special characters at position {i}"
            )));
        }

        prev_special = is_special;
    }

    Ok(())
}

/// Validate a top-up amount.
pub fn validate_amount(amount_cents: u64) -> AppResult<()> {
    if amount_cents == 0 {
        return Err(AppError::BadRequest(
            "Amount must be greater than 0".to_string(),
        ));
    }

    if amount_cents > MAX_TOPUP_CENTS {
        return Err(AppError::BadRequest(format!(
            "Amount cannot exceed {MAX_TOPUP_CENTS} cents"
        )));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_accounts() {
        assert!(validate_account("acct-1").is_ok());
        assert!(validate_account("user.42_eu").is_ok());
        assert!(validate_account("A").is_ok());
        assert!(validate_account(&"a".repeat(MAX_ACCOUNT_LENGTH)).is_ok());
    }

    #[test]
    fn test_invalid_accounts() {
        assert!(validate_account("").is_err());
        assert!(validate_account(&"a".repeat(MAX_ACCOUNT_LENGTH + 1)).is_err());
        assert!(validate_account("-acct").is_err());
        assert!(validate_account("acct.").is_err());
        assert!(validate_account("ac..ct").is_err());
        assert!(validate_account("ac ct").is_err());
        assert!(validate_account("ácct").is_err());
    }

    #[test]
    fn test_amount_bounds() {
        assert!(validate_amount(1).is_ok());
        assert!(validate_amount(MAX_TOPUP_CENTS).is_ok());
        assert!(validate_amount(0).is_err());
        assert!(validate_amount(MAX_TOPUP_CENTS + 1).is_err());
    }
}
