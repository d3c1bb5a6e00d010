// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Template rendering.
//!
//! Configuration templates are plain text bodies containing __placeholders__
//! of the form `%(name)s`. Rendering substitutes every placeholder with the
//! value that a caller supplied lookup function returns for its name.
//!
//! # Literal Percent Signs
//!
//! Target configuration files frequently contain printf-style format strings
//! of their own, e.g., `%h %l %u %t` in an access log format. Only exact
//! `%(name)s` sequences are treated as placeholders. Every other occurrence of
//! `%` is kept verbatim, so no escaping is required inside template bodies.
//!
//! # Failure Mode
//!
//! Rendering fails closed. A placeholder that the lookup cannot resolve is
//! never left in the output. Instead, all unresolved names are collected and
//! reported together through [`RenderError::Unresolved`].

use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%\((\w+)\)s").expect("placeholder pattern is valid")
});

/// List unique placeholder names in order of first appearance.
pub fn placeholders(body: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for captures in PLACEHOLDER.captures_iter(body) {
        let name = &captures[1];
        if !names.iter().any(|known| known == name) {
            names.push(name.to_owned());
        }
    }

    names
}

/// Render template body through a lookup function.
///
/// # Errors
///
/// - Return [`RenderError::Unresolved`] listing every placeholder that
///   `lookup` could not provide a value for.
pub fn render<F>(body: &str, mut lookup: F) -> Result<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut missing: Vec<String> = Vec::new();
    let rendered = PLACEHOLDER.replace_all(body, |captures: &Captures<'_>| {
        let name = &captures[1];
        match lookup(name) {
            Some(value) => value,
            None => {
                if !missing.iter().any(|known| known == name) {
                    missing.push(name.to_owned());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(RenderError::Unresolved { keys: missing });
    }

    Ok(rendered.into_owned())
}

/// Normalize text for change detection.
///
/// Removes every line-ending character, then trims surrounding whitespace.
/// Two bodies that differ only in line-ending convention, or in trailing
/// newlines, normalize to the same string.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect::<String>()
        .trim()
        .to_owned()
}

/// Template rendering error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// Placeholders have no value in the environment context.
    #[error("unresolved placeholders: {}", keys.join(", "))]
    Unresolved { keys: Vec<String> },

    /// Secret placeholder could not be resolved.
    #[error("failed to resolve secret {key:?}: {message}")]
    Secret { key: String, message: String },
}

/// Friendly result alias :3
pub type Result<T, E = RenderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl FnMut(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key: &str| map.get(key).map(|value| value.to_string())
    }

    #[test]
    fn render_substitutes_placeholders() -> anyhow::Result<()> {
        let body = indoc! {r#"
            bind = "127.0.0.1:%(gunicorn_port)s"
            proc_name = "%(proj_name)s"
            errorlog = "/home/%(user)s/logs/%(proj_name)s_error.log"
        "#};
        let result = render(
            body,
            lookup_from(&[("gunicorn_port", "8000"), ("proj_name", "blog"), ("user", "alice")]),
        )?;
        let expect = indoc! {r#"
            bind = "127.0.0.1:8000"
            proc_name = "blog"
            errorlog = "/home/alice/logs/blog_error.log"
        "#};
        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn render_keeps_literal_percent_verbatim() -> anyhow::Result<()> {
        let body = "LogFormat \"%h %l %u %t\" 100%% done %(name) %s %(user)s %()s";
        let result = render(body, lookup_from(&[("user", "alice")]))?;
        assert_eq!(
            result,
            "LogFormat \"%h %l %u %t\" 100%% done %(name) %s alice %()s"
        );

        Ok(())
    }

    #[test]
    fn render_reports_every_missing_key_once() {
        let body = "%(a)s %(b)s %(a)s %(c)s";
        let result = render(body, lookup_from(&[("b", "ok")]));
        assert_eq!(
            result,
            Err(RenderError::Unresolved {
                keys: vec!["a".into(), "c".into()]
            })
        );
    }

    #[test]
    fn placeholders_listed_in_first_use_order() {
        let result = placeholders("%(port)s %(user)s %(port)s 50% %(db_pass)s");
        assert_eq!(result, vec!["port", "user", "db_pass"]);
    }

    #[test]
    fn normalize_ignores_line_endings_and_edges() {
        assert_eq!(normalize("workers = 4\r\n"), normalize("workers = 4"));
        assert_eq!(normalize("  a\nb\r\n  "), "ab");
        assert_eq!(normalize("\n\n"), "");
        assert_ne!(normalize("workers = 4"), normalize("workers = 5"));
    }
}
