// Tag filters
// Ordered include/exclude tag expressions handed to the external test harness.

use std::fmt;

/// Tags used by the built-in phase sequence.
pub mod tags {
    /// Tests independent of any code generation target.
    pub const CODEGEN_INDEPENDENT: &str = "codegen-independent";
    /// Tests that only work on a standalone device.
    pub const STANDALONE_ONLY: &str = "standalone-only";
    /// Tests that also work on a standalone device.
    pub const STANDALONE_COMPATIBLE: &str = "standalone-compatible";
    /// Slow tests, excluded unless the run asks for them.
    pub const LONG: &str = "long";
    /// Tests that issue more than one run statement.
    pub const MULTIPLE_RUNS: &str = "multiple-runs";
    /// Tests exercising OpenMP code paths.
    pub const OPENMP: &str = "openmp";
}

/// Tag expression selecting a subset of the test tree.
///
/// Renders as a comma separated list with exclusions prefixed by `!`, for
/// example `standalone-compatible,!long,!multiple-runs`. The harness treats
/// the expression as opaque; the runner only composes and forwards it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterExpr {
    terms: Vec<String>,
}

impl FilterExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, tag: &str) -> Self {
        self.terms.push(tag.to_string());
        self
    }

    pub fn exclude(mut self, tag: &str) -> Self {
        self.terms.push(format!("!{}", tag));
        self
    }

    /// Adds the exclusion only when `condition` holds.
    pub fn exclude_if(self, condition: bool, tag: &str) -> Self {
        if condition {
            self.exclude(tag)
        } else {
            self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.terms.join(","))
    }
}
