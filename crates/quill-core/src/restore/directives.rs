//! Reference directives: the external packages a script declares.
//!
//! Scripts declare crate dependencies in a `cargo` fenced block inside
//! their leading doc comments:
//!
//! ```text
//! //! ```cargo
//! //! [dependencies]
//! //! anyhow = "1.0"
//! //! rand = { version = "0.9", features = ["small_rng"] }
//! //! ```
//! ```
//!
//! The parsed request list is ordered as written; its hash drives
//! staleness detection and restore caching.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// One declared external package reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRequest {
    /// Crate name.
    pub name: String,

    /// Version requirement as written (e.g., `1.0`, `^2.0`).
    pub version: Option<String>,

    /// Requested features.
    pub features: Vec<String>,

    /// Filesystem path for local crates.
    pub path: Option<PathBuf>,
}

impl PackageRequest {
    /// Request a version from the registry.
    pub fn simple(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
            features: Vec::new(),
            path: None,
        }
    }

    /// Request a crate by local path.
    pub fn path_dep(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: None,
            features: Vec::new(),
            path: Some(path.into()),
        }
    }

    /// Enable features on the request.
    pub fn with_features(mut self, features: Vec<String>) -> Self {
        self.features = features;
        self
    }
}

/// Stable hash of a request list, for staleness and cache checks.
///
/// Hashes the ordered list, so reordering declarations counts as a change
/// (the generated dependency crate would change too).
pub fn requests_hash(requests: &[PackageRequest]) -> u64 {
    let mut hasher = DefaultHasher::new();
    requests.hash(&mut hasher);
    hasher.finish()
}

/// Where the scanner is relative to the fenced `cargo` block.
#[derive(Clone, Copy)]
enum Section {
    /// Before the block, after it closed, or between blocks.
    Outside,
    /// Inside the block, in a section other than `[dependencies]`.
    Other,
    /// Inside `[dependencies]`.
    Dependencies,
}

/// Parser for script reference directives.
pub struct DirectiveParser;

impl DirectiveParser {
    /// Parse the declared package requests out of script source.
    ///
    /// Absence of a `cargo` block means zero requests. Unknown sections
    /// inside the block are ignored.
    pub fn parse(source: &str) -> Vec<PackageRequest> {
        let mut requests = Vec::new();
        let mut section = Section::Outside;

        for line in source.lines() {
            let Some(content) = line.trim().strip_prefix("//!") else {
                continue;
            };
            let content = content.trim();

            section = match (section, content) {
                (Section::Outside, "```cargo") => Section::Other,
                (Section::Outside, _) => Section::Outside,
                (_, "```") => Section::Outside,
                (_, "[dependencies]") => Section::Dependencies,
                (_, heading) if heading.starts_with('[') => Section::Other,
                (Section::Dependencies, entry) => {
                    if let Some(request) = Self::parse_request_line(entry) {
                        requests.push(request);
                    }
                    Section::Dependencies
                }
                (section, _) => section,
            };
        }

        requests
    }

    /// One `name = spec` line. Comments and lines that do not declare a
    /// package yield `None`.
    fn parse_request_line(line: &str) -> Option<PackageRequest> {
        if line.starts_with('#') {
            return None;
        }
        let (name, spec) = line.split_once('=')?;
        let name = name.trim();
        let spec = spec.trim();

        if let Some(version) = Self::quoted(spec) {
            Some(PackageRequest::simple(name, version))
        } else if spec.starts_with('{') {
            Some(Self::parse_inline_table(name.to_string(), spec))
        } else {
            None
        }
    }

    /// `name = { version = "...", features = [...], path = "..." }`.
    fn parse_inline_table(name: String, spec: &str) -> PackageRequest {
        let mut request = PackageRequest {
            name,
            version: None,
            features: Vec::new(),
            path: None,
        };

        // The features array must come out whole before the comma split,
        // or its own commas would tear the table apart.
        let mut body = spec.trim_start_matches('{').trim_end_matches('}').to_string();
        if let Some(open) = body.find('[')
            && let Some(close) = body[open..].find(']')
        {
            request.features = body[open + 1..open + close]
                .split(',')
                .map(|feature| feature.trim().trim_matches('"'))
                .filter(|feature| !feature.is_empty())
                .map(str::to_string)
                .collect();
            body.replace_range(open..=open + close, "");
        }

        for entry in body.split(',') {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            match (key.trim(), value.trim()) {
                ("version", value) => request.version = Some(value.trim_matches('"').to_string()),
                ("path", value) => request.path = Some(PathBuf::from(value.trim_matches('"'))),
                _ => {}
            }
        }

        request
    }

    fn quoted(spec: &str) -> Option<&str> {
        spec.strip_prefix('"')?.strip_suffix('"')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_request() {
        let source = r#"
//! # Scratch
//!
//! ```cargo
//! [dependencies]
//! serde = "1.0"
//! ```

let value = 42;
"#;

        let requests = DirectiveParser::parse(source);

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "serde");
        assert_eq!(requests[0].version, Some("1.0".to_string()));
    }

    #[test]
    fn test_parse_table_request() {
        let source = r#"
//! ```cargo
//! [dependencies]
//! rand = { version = "0.9", features = ["small_rng"] }
//! ```
"#;

        let requests = DirectiveParser::parse(source);

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "rand");
        assert_eq!(requests[0].version, Some("0.9".to_string()));
        assert_eq!(requests[0].features, vec!["small_rng"]);
    }

    #[test]
    fn test_feature_array_kept_whole() {
        let source = r#"
//! ```cargo
//! [dependencies]
//! rand = { version = "0.9", features = ["small_rng", "std_rng"] }
//! ```
"#;

        let requests = DirectiveParser::parse(source);

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].version, Some("0.9".to_string()));
        assert_eq!(requests[0].features, vec!["small_rng", "std_rng"]);
    }

    #[test]
    fn test_parse_path_request() {
        let source = r#"
//! ```cargo
//! [dependencies]
//! mylib = { path = "../mylib" }
//! ```
"#;

        let requests = DirectiveParser::parse(source);

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "mylib");
        assert_eq!(requests[0].version, None);
        assert_eq!(requests[0].path, Some(PathBuf::from("../mylib")));
    }

    #[test]
    fn test_parse_multiple_requests_preserves_order() {
        let source = r#"
//! ```cargo
//! [dependencies]
//! serde = "1.0"
//! serde_json = "1.0"
//! rand = { version = "0.9", features = ["small_rng", "std_rng"] }
//! ```
"#;

        let requests = DirectiveParser::parse(source);

        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].name, "serde");
        assert_eq!(requests[1].name, "serde_json");
        assert_eq!(requests[2].name, "rand");
    }

    #[test]
    fn test_no_block_means_no_requests() {
        assert!(DirectiveParser::parse("1 + 1").is_empty());
        assert!(DirectiveParser::parse("//! just a doc comment").is_empty());
        // Section headers only count inside a fenced cargo block.
        assert!(DirectiveParser::parse("//! [dependencies]\n//! serde = \"1.0\"").is_empty());
    }

    #[test]
    fn test_other_sections_and_comments_ignored() {
        let source = r#"
//! ```cargo
//! [package]
//! name = "ignored"
//! [dependencies]
//! # pulled in for the derive macro
//! serde = "1.0"
//! [features]
//! extra = []
//! ```
"#;

        let requests = DirectiveParser::parse(source);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "serde");
    }

    #[test]
    fn test_hash_changes_with_requests() {
        let none = DirectiveParser::parse("");
        let one = DirectiveParser::parse(
            r#"
//! ```cargo
//! [dependencies]
//! serde = "1.0"
//! ```
"#,
        );

        assert_ne!(requests_hash(&none), requests_hash(&one));
        assert_eq!(requests_hash(&none), requests_hash(&[]));
    }

    #[test]
    fn test_hash_sensitive_to_order() {
        let a = vec![
            PackageRequest::simple("serde", "1.0"),
            PackageRequest::simple("rand", "0.9"),
        ];
        let b = vec![
            PackageRequest::simple("rand", "0.9"),
            PackageRequest::simple("serde", "1.0"),
        ];
        assert_ne!(requests_hash(&a), requests_hash(&b));
    }

    #[test]
    fn test_request_builders() {
        let request =
            PackageRequest::simple("serde", "1.0").with_features(vec!["derive".to_string()]);

        assert_eq!(request.name, "serde");
        assert_eq!(request.version, Some("1.0".to_string()));
        assert_eq!(request.features, vec!["derive"]);
    }
}
