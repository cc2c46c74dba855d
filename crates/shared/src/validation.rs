//! Common validation utilities.

use validator::ValidationError;

/// Maximum length of a single archive entry name.
const MAX_ASSET_NAME_LENGTH: usize = 128;

/// Maximum length of a generated file-name slug.
const MAX_SLUG_LENGTH: usize = 64;

/// Validates that an asset name is a plain relative file name.
///
/// Names end up as archive entries under `assets/`, so separators, parent
/// references and hidden files are rejected.
pub fn validate_asset_name(name: &str) -> Result<(), ValidationError> {
    let invalid = name.is_empty()
        || name.len() > MAX_ASSET_NAME_LENGTH
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.contains("..");

    if invalid {
        let mut err = ValidationError::new("asset_name");
        err.message = Some(format!("Invalid asset name: {:?}", name).into());
        return Err(err);
    }

    Ok(())
}

/// Validates that a tool name contains at least one visible character.
pub fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("Value must not be blank".into());
        Err(err)
    } else {
        Ok(())
    }
}

/// Turns an arbitrary display name into a lowercase file-name slug.
///
/// Runs of non-alphanumeric characters collapse into a single `-`. Falls back
/// to `"tool"` when nothing usable remains.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_dash = true;

    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= MAX_SLUG_LENGTH {
            break;
        }
    }

    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "tool".to_string()
    } else {
        trimmed.to_string()
    }
}
