//! Input validation for registration details.

use crate::error::RegistrationError;
use registration_store::{Platform, RegistrationDetails};
use secrecy::ExposeSecret;
use std::collections::BTreeSet;

/// Subdomains that can never belong to a tenant.
pub const RESERVED_SUBDOMAINS: &[&str] = &[
    "admin", "api", "app", "assets", "auth", "billing", "cdn", "dashboard", "help", "login",
    "mail", "static", "status", "support", "www",
];

pub const MIN_PASSWORD_LEN: usize = 8;
const MAX_NAME_LEN: usize = 100;
const MAX_COMPANY_LEN: usize = 255;

/// Normalize and check a tenant subdomain.
///
/// 3 to 63 characters of `[a-z0-9-]`, no leading or trailing hyphen.
pub fn normalize_subdomain(input: &str) -> Result<String, String> {
    let subdomain = input.trim().to_ascii_lowercase();

    if subdomain.len() < 3 || subdomain.len() > 63 {
        return Err("Subdomain must be 3 to 63 characters".into());
    }
    if !subdomain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("Subdomain may only contain letters, digits and hyphens".into());
    }
    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return Err("Subdomain must not start or end with a hyphen".into());
    }
    if RESERVED_SUBDOMAINS.contains(&subdomain.as_str()) {
        return Err(format!("Subdomain {} is reserved", subdomain));
    }

    Ok(subdomain)
}

/// Normalize and check an email address.
pub fn normalize_email(input: &str) -> Result<String, String> {
    let email = input.trim().to_ascii_lowercase();

    let Some((local, domain)) = email.split_once('@') else {
        return Err("Email must contain @".into());
    };

    let valid = !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace);

    if !valid {
        return Err(format!("Invalid email address: {}", input.trim()));
    }

    Ok(email)
}

fn required(field: &str, value: &str, max: usize) -> Result<String, RegistrationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RegistrationError::Validation(format!("{} is required", field)));
    }
    if value.chars().count() > max {
        return Err(RegistrationError::Validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(value.to_string())
}

/// Validate registration details, returning a normalized copy.
pub fn validate_details(
    details: RegistrationDetails,
) -> Result<RegistrationDetails, RegistrationError> {
    let company_name = required("company_name", &details.company_name, MAX_COMPANY_LEN)?;
    let admin_first_name = required("admin_first_name", &details.admin_first_name, MAX_NAME_LEN)?;
    let admin_last_name = required("admin_last_name", &details.admin_last_name, MAX_NAME_LEN)?;
    let subdomain =
        normalize_subdomain(&details.subdomain).map_err(RegistrationError::Validation)?;
    let admin_email =
        normalize_email(&details.admin_email).map_err(RegistrationError::Validation)?;

    if details.admin_password.expose_secret().chars().count() < MIN_PASSWORD_LEN {
        return Err(RegistrationError::Validation(format!(
            "admin_password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    Ok(RegistrationDetails {
        company_name,
        subdomain,
        admin_first_name,
        admin_last_name,
        admin_email,
        admin_password: details.admin_password,
    })
}

/// Parse the platform names a client selected.
pub fn parse_platforms(names: &[String]) -> Result<BTreeSet<Platform>, RegistrationError> {
    let platforms = names
        .iter()
        .map(|name| name.trim().parse::<Platform>())
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(RegistrationError::Validation)?;

    if platforms.is_empty() {
        return Err(RegistrationError::Validation(
            "Select at least one integration".into(),
        ));
    }

    Ok(platforms)
}
