//! Tenant and workload name validation
//!
//! Both kinds of name share one rule set: bounded length, lowercase ASCII letters
//! and digits only, leading letter. Tenant names are additionally checked
//! against the reserved list because they become part of a namespace name.

use crate::{Error, ProvisionerConfig};

const TENANT_FIELD: &str = "tenant name";
const WORKLOAD_FIELD: &str = "workload name";

/// Validate a tenant name, including the reserved-name check
pub fn validate_tenant_name(name: &str, config: &ProvisionerConfig) -> Result<(), Error> {
    validate_name(TENANT_FIELD, name, config)?;
    if config.reserved_names.iter().any(|r| r == name) {
        return Err(Error::validation(
            TENANT_FIELD,
            format!("'{name}' is reserved"),
        ));
    }
    Ok(())
}

/// Validate a workload name
pub fn validate_workload_name(name: &str, config: &ProvisionerConfig) -> Result<(), Error> {
    validate_name(WORKLOAD_FIELD, name, config)
}

fn validate_name(field: &str, name: &str, config: &ProvisionerConfig) -> Result<(), Error> {
    let len = name.chars().count();
    if len < config.name_min_len || len > config.name_max_len {
        return Err(Error::validation(
            field,
            format!(
                "must be {}-{} characters long",
                config.name_min_len, config.name_max_len
            ),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(Error::validation(
            field,
            "must only contain lowercase letters and numbers",
        ));
    }

    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(Error::validation(
            field,
            "must start with a lowercase letter",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::minimum_length("abc")]
    #[case::maximum_length("abcdefghijklmnop")]
    #[case::with_digits("alice42")]
    #[case::letter_then_digits("a12")]
    fn accepts_valid_tenant_names(#[case] name: &str) {
        validate_tenant_name(name, &ProvisionerConfig::default()).unwrap();
    }

    #[rstest]
    #[case::too_short("ab", "3-16 characters")]
    #[case::too_long("abcdefghijklmnopq", "3-16 characters")]
    #[case::empty("", "3-16 characters")]
    #[case::uppercase("Alice", "lowercase letters and numbers")]
    #[case::hyphen("al-ice", "lowercase letters and numbers")]
    #[case::underscore("al_ice", "lowercase letters and numbers")]
    #[case::unicode("alicé", "lowercase letters and numbers")]
    #[case::leading_digit("1alice", "start with a lowercase letter")]
    #[case::reserved_admin("admin", "reserved")]
    #[case::reserved_root("root", "reserved")]
    #[case::reserved_kubecraft("kubecraft", "reserved")]
    fn rejects_invalid_tenant_names(#[case] name: &str, #[case] rule: &str) {
        let err = validate_tenant_name(name, &ProvisionerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains(rule), "{err} should mention {rule}");
    }

    #[test]
    fn workload_names_skip_the_reserved_list() {
        validate_workload_name("admin", &ProvisionerConfig::default()).unwrap();
    }

    #[test]
    fn workload_errors_name_the_workload_field() {
        let err = validate_workload_name("9lives", &ProvisionerConfig::default()).unwrap_err();
        assert!(err.to_string().starts_with("invalid workload name"));
    }

    #[test]
    fn length_bounds_follow_configuration() {
        let config = ProvisionerConfig {
            name_min_len: 5,
            ..Default::default()
        };
        assert!(validate_tenant_name("abcd", &config).is_err());
        validate_tenant_name("abcde", &config).unwrap();
    }
}
