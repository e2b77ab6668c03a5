//! Package reference directives.
//!
//! Scripts reference packages with `#r` lines at the top of the source:
//!
//! ```text
//! #r "nuget: Newtonsoft.Json, 13.0.3"
//! #r "nuget: Foo/1.0.0"
//! #r "nuget: Bar@2.1.0"
//! ```
//!
//! Only `nuget:` references with an explicit version are package references;
//! other `#r` forms (assembly paths and the like) are left alone.

use std::fmt;

/// A package id and version requested by a script.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageReference {
    pub id: String,
    pub version: String,
}

impl PackageReference {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Case-insensitive identity of the reference.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.id.to_lowercase(),
            self.version.to_lowercase()
        )
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

const DIRECTIVE_PREFIX: &str = "#r";
const NUGET_SCHEME: &str = "nuget:";

/// Raw `#r` directive bodies in source order, without their quotes.
pub fn reference_directives(source: &str) -> Vec<String> {
    source.lines().filter_map(directive_body).collect()
}

/// Whether a source line is an `#r` directive.
pub fn is_directive_line(line: &str) -> bool {
    line.trim_start().starts_with(DIRECTIVE_PREFIX)
        && line
            .trim_start()
            .get(DIRECTIVE_PREFIX.len()..)
            .is_some_and(|rest| rest.starts_with(char::is_whitespace) || rest.starts_with('"'))
}

fn directive_body(line: &str) -> Option<String> {
    if !is_directive_line(line) {
        return None;
    }
    let rest = line.trim_start()[DIRECTIVE_PREFIX.len()..].trim();
    let inner = rest.strip_prefix('"')?;
    let end = inner.find('"')?;
    Some(inner[..end].to_string())
}

/// Parse one directive body such as `nuget: Foo, 1.0.0`.
///
/// Returns `None` for anything that is not a versioned `nuget:` reference.
pub fn parse_reference(directive: &str) -> Option<PackageReference> {
    let directive = directive.trim();
    let scheme = directive.get(..NUGET_SCHEME.len())?;
    if !scheme.eq_ignore_ascii_case(NUGET_SCHEME) {
        return None;
    }
    let spec = directive[NUGET_SCHEME.len()..].trim();

    let (id, version) = [',', '/', '@']
        .iter()
        .find_map(|sep| spec.split_once(*sep))?;
    let id = id.trim();
    let version = version.trim();

    if id.is_empty() || version.is_empty() || id.contains(char::is_whitespace) {
        return None;
    }
    Some(PackageReference::new(id, version))
}

/// Package references of a script, de-duplicated case-insensitively in order
/// of first occurrence.
pub fn extract_references<S: AsRef<str>>(directives: &[S]) -> Vec<PackageReference> {
    let mut seen = rustc_hash::FxHashSet::default();
    let mut references = Vec::new();

    for directive in directives {
        match parse_reference(directive.as_ref()) {
            Some(reference) => {
                if seen.insert(reference.key()) {
                    references.push(reference);
                }
            }
            None => tracing::trace!("ignoring directive: {}", directive.as_ref()),
        }
    }

    references
}
