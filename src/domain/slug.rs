//! Logical identifiers recovered from slug-like fields.
//!
//! Catalog assets are named after the entity that owns them plus a trailing
//! disambiguator, e.g. `buche-25cm-hauptbild` belongs to `buche`. The helpers
//! normalise the raw field with the `slug` crate and then peel disambiguating
//! segments off the end.

use slug::slugify;
use thiserror::Error;

/// Role words that never name an entity on their own.
pub const DEFAULT_ROLE_SUFFIXES: &[&str] = &[
    "hauptbild",
    "detail",
    "galerie",
    "thumbnail",
    "vorschau",
    "main",
    "thumb",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugError {
    #[error("slug source text is empty")]
    EmptyInput,
    #[error("failed to derive an identifier from `{input}`")]
    Unrepresentable { input: String },
}

/// Normalise free text into its slug form.
pub fn normalize(input: &str) -> Result<String, SlugError> {
    if input.trim().is_empty() {
        return Err(SlugError::EmptyInput);
    }

    let candidate = slugify(input);
    if candidate.is_empty() {
        return Err(SlugError::Unrepresentable {
            input: input.to_string(),
        });
    }

    Ok(candidate)
}

/// Recover the owning entity's identifier from a disambiguated slug.
///
/// Trailing segments are dropped while they contain a digit (`25cm`, `2`) or
/// match one of `role_suffixes`. The first segment always survives.
pub fn logical_identifier<S>(raw: &str, role_suffixes: &[S]) -> Result<String, SlugError>
where
    S: AsRef<str>,
{
    let normalized = normalize(raw)?;
    let segments: Vec<&str> = normalized
        .split('-')
        .filter(|segment| !segment.is_empty())
        .collect();

    let mut end = segments.len();
    while end > 1 && is_disambiguator(segments[end - 1], role_suffixes) {
        end -= 1;
    }

    Ok(segments[..end].join("-"))
}

fn is_disambiguator<S: AsRef<str>>(segment: &str, role_suffixes: &[S]) -> bool {
    segment.chars().any(|ch| ch.is_ascii_digit())
        || role_suffixes
            .iter()
            .any(|role| role.as_ref().eq_ignore_ascii_case(segment))
}
