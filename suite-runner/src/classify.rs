// Unimplemented-feature classification
// Policy deciding whether tests that hit unimplemented backend features fail or skip.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a test that raises an unimplemented-feature error is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnimplementedPolicy {
    /// Unimplemented features count as failures, the default for
    /// full-featured targets.
    Strict,
    /// Unimplemented features are recorded as labelled skips, for targets
    /// that deliberately support a subset of the simulator.
    Lenient,
}

impl UnimplementedPolicy {
    pub fn from_flag(strict: bool) -> Self {
        if strict {
            UnimplementedPolicy::Strict
        } else {
            UnimplementedPolicy::Lenient
        }
    }

    pub fn is_strict(self) -> bool {
        matches!(self, UnimplementedPolicy::Strict)
    }

    /// Wire value handed to workers through the environment.
    pub fn env_value(self) -> &'static str {
        match self {
            UnimplementedPolicy::Strict => "fail",
            UnimplementedPolicy::Lenient => "skip",
        }
    }

    /// Label attached to tests skipped under the lenient policy.
    pub fn skip_label() -> &'static str {
        "not-implemented"
    }
}

impl Default for UnimplementedPolicy {
    fn default() -> Self {
        UnimplementedPolicy::Strict
    }
}

impl fmt::Display for UnimplementedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnimplementedPolicy::Strict => "strict",
            UnimplementedPolicy::Lenient => "lenient",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for UnimplementedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" | "fail" => Ok(UnimplementedPolicy::Strict),
            "lenient" | "skip" => Ok(UnimplementedPolicy::Lenient),
            other => Err(format!("unknown unimplemented policy '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_selects_the_policy() {
        assert_eq!(UnimplementedPolicy::from_flag(true), UnimplementedPolicy::Strict);
        assert_eq!(UnimplementedPolicy::from_flag(false), UnimplementedPolicy::Lenient);
    }

    #[test]
    fn env_values_round_trip() {
        for policy in [UnimplementedPolicy::Strict, UnimplementedPolicy::Lenient] {
            let parsed: UnimplementedPolicy = policy.env_value().parse().unwrap();
            assert_eq!(parsed, policy);
        }
    }

    #[test]
    fn unknown_spellings_are_rejected() {
        assert!("maybe".parse::<UnimplementedPolicy>().is_err());
    }
}
