//! Environment rewriting for script source.
//!
//! Appends an environment suffix to the string literal naming the app, its
//! volumes, and its secrets so one script can be deployed to several isolated
//! environments without touching the file on disk.
//!
//! Matching is lexical. Comments, escaped quotes, and names reached through
//! variables are not understood; the scripts this targets declare their names
//! inline.

use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::OnceLock;

/// Separator every suffix starts with.
pub const SUFFIX_SEPARATOR: char = '-';

/// `modal.App("x")` and `modal.App(name="x")`.
const APP_NAME_PATTERN: &str = r#"(modal\.App\s*\(\s*(?:name\s*=\s*)?["'])([^"']+)(["'])"#;
/// `modal.Volume.from_name("x")`.
const VOLUME_PATTERN: &str = r#"(modal\.Volume\.from_name\s*\(\s*["'])([^"']+)(["'])"#;
/// `modal.Secret.from_name("x")`.
const SECRET_PATTERN: &str = r#"(modal\.Secret\.from_name\s*\(\s*["'])([^"']+)(["'])"#;

fn patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [APP_NAME_PATTERN, VOLUME_PATTERN, SECRET_PATTERN].map(|p| {
            Regex::new(p).unwrap_or_else(|e| panic!("invalid rewrite pattern {p}: {e}"))
        })
    })
}

/// Prefix the suffix with `-` unless it already has one.
pub fn normalize_suffix(suffix: &str) -> Cow<'_, str> {
    if suffix.starts_with(SUFFIX_SEPARATOR) {
        Cow::Borrowed(suffix)
    } else {
        Cow::Owned(format!("{SUFFIX_SEPARATOR}{suffix}"))
    }
}

/// Rewrite declared resource names in `source` for the environment `suffix`.
///
/// An empty suffix returns the input untouched. Names already ending with the
/// suffix are left alone, so applying the same suffix twice is a no-op.
pub fn rewrite_for_environment<'a>(source: &'a str, suffix: &str) -> Cow<'a, str> {
    if suffix.is_empty() {
        return Cow::Borrowed(source);
    }
    let suffix = normalize_suffix(suffix);

    let mut current = Cow::Borrowed(source);
    for pattern in patterns() {
        let replaced = pattern.replace_all(&current, |caps: &Captures<'_>| {
            let name = &caps[2];
            if name.ends_with(&*suffix) {
                caps[0].to_string()
            } else {
                format!("{}{}{}{}", &caps[1], name, suffix, &caps[3])
            }
        });
        if let Cow::Owned(text) = replaced {
            current = Cow::Owned(text);
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"import modal

app = modal.App(name="comfy-ui")
volume = modal.Volume.from_name("models", create_if_missing=True)
secret = modal.Secret.from_name('hf-token')

@app.function(volumes={"/models": volume}, secrets=[secret])
def main():
    pass
"#;

    #[test]
    fn empty_suffix_is_identity() {
        let out = rewrite_for_environment(SCRIPT, "");
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out, SCRIPT);
    }

    #[test]
    fn appends_suffix_to_each_declaration() {
        let out = rewrite_for_environment(SCRIPT, "-test");
        assert!(out.contains(r#"modal.App(name="comfy-ui-test")"#));
        assert!(out.contains(r#"modal.Volume.from_name("models-test", create_if_missing=True)"#));
        assert!(out.contains("modal.Secret.from_name('hf-token-test')"));
        // Unrelated literals are untouched.
        assert!(out.contains(r#"volumes={"/models": volume}"#));
    }

    #[test]
    fn suffix_without_separator_is_normalized() {
        let out = rewrite_for_environment(r#"app = modal.App("svc")"#, "prod");
        assert_eq!(out, r#"app = modal.App("svc-prod")"#);
        assert_eq!(normalize_suffix("-prod"), "-prod");
        assert_eq!(normalize_suffix("prod"), "-prod");
    }

    #[test]
    fn rewriting_twice_is_a_no_op() {
        for suffix in ["-test", "test", "-a-b", "x"] {
            let once = rewrite_for_environment(SCRIPT, suffix).into_owned();
            let twice = rewrite_for_environment(&once, suffix).into_owned();
            assert_eq!(once, twice, "suffix {suffix:?} is not idempotent");
        }
    }

    #[test]
    fn already_suffixed_names_are_left_alone() {
        let src = r#"app = modal.App(name="svc-test")"#;
        let out = rewrite_for_environment(src, "-test");
        assert_eq!(out, src);
    }

    #[test]
    fn positional_and_spaced_forms_match() {
        let src = "a = modal.App( 'one' )\nb = modal.App(name = \"two\")\n";
        let out = rewrite_for_environment(src, "-dev");
        assert_eq!(out, "a = modal.App( 'one-dev' )\nb = modal.App(name = \"two-dev\")\n");
    }

    #[test]
    fn every_occurrence_is_rewritten() {
        let src = concat!(
            "v1 = modal.Volume.from_name(\"data\")\n",
            "v2 = modal.Volume.from_name(\"data\")\n",
        );
        let out = rewrite_for_environment(src, "-stage");
        assert_eq!(out.matches("\"data-stage\"").count(), 2);
        assert!(!out.contains("\"data\""));
    }

    #[test]
    fn source_without_declarations_is_unchanged() {
        let src = "print('hello')\n";
        let out = rewrite_for_environment(src, "-test");
        assert_eq!(out, src);
    }
}
