//! Static marker library for plan input scanning.
//!
//! Markers are organised by [`MarkerCategory`]; [`builtin_markers`]
//! returns the full set. Matching is intentionally literal — the
//! sandbox cannot disambiguate intent, so anything that looks like an
//! injection is a violation, never a warning.

use std::fmt;

/// High-level classification of an injection marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MarkerCategory {
    /// Shell metacharacters in a command position.
    ShellInjection,
    /// SQL injection markers.
    SqlInjection,
    /// Repeated parent-directory traversal.
    PathTraversal,
    /// Template expansion syntax in literal values.
    TemplateInjection,
}

impl fmt::Display for MarkerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShellInjection => write!(f, "shell_injection"),
            Self::SqlInjection => write!(f, "sql_injection"),
            Self::PathTraversal => write!(f, "path_traversal"),
            Self::TemplateInjection => write!(f, "template_injection"),
        }
    }
}

/// How a marker matches a candidate string.
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    /// Case-insensitive substring.
    Substring(&'static str),
    /// Substring occurring at least `min` times.
    Repeated { needle: &'static str, min: usize },
}

/// One entry in the marker table.
#[derive(Debug, Clone, Copy)]
pub struct InjectionMarker {
    /// Stable identifier (e.g. `"SH-001"`), quoted in violations.
    pub id: &'static str,
    pub category: MarkerCategory,
    pub matcher: Matcher,
    pub description: &'static str,
}

impl InjectionMarker {
    /// Whether the marker fires on `value`.
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        let lowered = value.to_lowercase();
        match self.matcher {
            Matcher::Substring(needle) => lowered.contains(&needle.to_lowercase()),
            Matcher::Repeated { needle, min } => lowered.matches(needle).count() >= min,
        }
    }
}

/// The built-in marker table.
#[must_use]
pub fn builtin_markers() -> &'static [InjectionMarker] {
    const MARKERS: &[InjectionMarker] = &[
        InjectionMarker {
            id: "SH-001",
            category: MarkerCategory::ShellInjection,
            matcher: Matcher::Substring("; rm "),
            description: "command chain into rm",
        },
        InjectionMarker {
            id: "SH-002",
            category: MarkerCategory::ShellInjection,
            matcher: Matcher::Substring("| cat "),
            description: "pipe into cat",
        },
        InjectionMarker {
            id: "SH-003",
            category: MarkerCategory::ShellInjection,
            matcher: Matcher::Substring("&& rm "),
            description: "conditional chain into rm",
        },
        InjectionMarker {
            id: "SH-004",
            category: MarkerCategory::ShellInjection,
            matcher: Matcher::Substring("$(",),
            description: "command substitution",
        },
        InjectionMarker {
            id: "SQL-001",
            category: MarkerCategory::SqlInjection,
            matcher: Matcher::Substring("'; drop table"),
            description: "statement break into DROP TABLE",
        },
        InjectionMarker {
            id: "SQL-002",
            category: MarkerCategory::SqlInjection,
            matcher: Matcher::Substring("\" or \"1\"=\"1"),
            description: "tautology predicate",
        },
        InjectionMarker {
            id: "SQL-003",
            category: MarkerCategory::SqlInjection,
            matcher: Matcher::Substring("' or '1'='1"),
            description: "tautology predicate (single-quoted)",
        },
        InjectionMarker {
            id: "PT-001",
            category: MarkerCategory::PathTraversal,
            matcher: Matcher::Repeated {
                needle: "../",
                min: 2,
            },
            description: "repeated parent-directory traversal",
        },
        InjectionMarker {
            id: "TI-001",
            category: MarkerCategory::TemplateInjection,
            matcher: Matcher::Substring("{{"),
            description: "mustache-style template open",
        },
        InjectionMarker {
            id: "TI-002",
            category: MarkerCategory::TemplateInjection,
            matcher: Matcher::Substring("${"),
            description: "dollar-brace template open",
        },
    ];
    MARKERS
}
