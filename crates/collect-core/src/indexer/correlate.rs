//! Instance-to-form correlation by file name.
//!
//! Instance manifests are named `<form>_<tag>_<YYYY-MM-DD>_<HH-MM-SS>.xml`
//! where `<tag>` is a bracketed respondent id (`[AB1234]`, `[AB12345]`) or the
//! test marker `[TEST]`. Stripping that suffix yields the form's base name.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// Form definition extensions, in lookup priority order.
pub const FORM_EXTENSIONS: &[&str] = &["xml", "xhtml"];

static INSTANCE_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"_(\[[a-zA-Z]{2}[0-9]{4,5}\]|\[TEST\])_[0-9]{4}-[0-9]{2}-[0-9]{2}_[0-9]{2}-[0-9]{2}-[0-9]{2}\.xml$",
    )
    .unwrap()
});

/// Whether `name` ends with a respondent-tag/timestamp suffix.
pub fn has_instance_suffix(name: &str) -> bool {
    INSTANCE_SUFFIX_RE.is_match(name)
}

/// Strip the instance suffix and keep only the final path segment.
///
/// Names without the suffix pass through unchanged (extension included), so
/// they normally fail to resolve to any form.
pub fn form_basename(instance_path: &str) -> &str {
    let stem = match INSTANCE_SUFFIX_RE.find(instance_path) {
        Some(m) => &instance_path[..m.start()],
        None => instance_path,
    };
    match stem.rfind(|c| c == '/' || c == '\\') {
        Some(idx) => &stem[idx + 1..],
        None => stem,
    }
}

/// Form definition an instance was generated from: `<forms_dir>/<base>.xml`,
/// else `<forms_dir>/<base>.xhtml`, else `None` (the form is gone).
///
/// Only reads file metadata.
pub fn resolve_form_path(instance_path: &Path, forms_dir: &Path) -> Option<PathBuf> {
    let raw = instance_path.to_string_lossy();
    let base = form_basename(&raw);
    if base.is_empty() {
        return None;
    }
    FORM_EXTENSIONS
        .iter()
        .map(|ext| forms_dir.join(format!("{base}.{ext}")))
        .find(|candidate| candidate.exists())
}
