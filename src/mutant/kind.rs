//! The closed catalog of mutation kinds.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A category of mutation, as reported by the analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MutantType {
    /// `+` <-> `-`, `*` <-> `/`, `%` -> `*`
    ArithmeticBase,
    /// `<` <-> `<=`, `>` <-> `>=`
    ConditionalsBoundary,
    /// `==` <-> `!=`, `<` <-> `>=`, `>` <-> `<=`
    ConditionalsNegation,
    /// `++` <-> `--`
    IncrementDecrement,
    /// `&&` <-> `||`
    InvertLogical,
    /// `-x` -> `+x`
    InvertNegatives,
}

impl MutantType {
    /// Every catalog entry, in display order.
    pub const ALL: [MutantType; 6] = [
        MutantType::ArithmeticBase,
        MutantType::ConditionalsBoundary,
        MutantType::ConditionalsNegation,
        MutantType::IncrementDecrement,
        MutantType::InvertLogical,
        MutantType::InvertNegatives,
    ];

    /// Stable display name used in logs and result files.
    pub fn name(&self) -> &'static str {
        match self {
            MutantType::ArithmeticBase => "ARITHMETIC_BASE",
            MutantType::ConditionalsBoundary => "CONDITIONALS_BOUNDARY",
            MutantType::ConditionalsNegation => "CONDITIONALS_NEGATION",
            MutantType::IncrementDecrement => "INCREMENT_DECREMENT",
            MutantType::InvertLogical => "INVERT_LOGICAL",
            MutantType::InvertNegatives => "INVERT_NEGATIVES",
        }
    }

    /// Built-in enablement when the configuration says nothing about this type.
    ///
    /// Adding a variant without deciding here is a compile error.
    pub fn is_default_enabled(&self) -> bool {
        match self {
            MutantType::ArithmeticBase => true,
            MutantType::ConditionalsBoundary => true,
            MutantType::ConditionalsNegation => true,
            MutantType::IncrementDecrement => true,
            MutantType::InvertLogical => false,
            MutantType::InvertNegatives => true,
        }
    }

    /// Kebab-case form of the display name (`ARITHMETIC_BASE` -> `arithmetic-base`).
    pub fn config_name(&self) -> String {
        self.name().to_lowercase().replace('_', "-")
    }

    /// Configuration key holding an explicit override for this type.
    pub fn enabled_key(&self) -> String {
        format!("mutants.{}.enabled", self.config_name())
    }
}

impl std::fmt::Display for MutantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

/// Returned when a name does not belong to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mutant type: {0:?}")]
pub struct UnknownMutantType(pub String);

impl FromStr for MutantType {
    type Err = UnknownMutantType;

    /// Accepts both the display name and the kebab-case config name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        MutantType::ALL
            .into_iter()
            .find(|mt| mt.name() == normalized)
            .ok_or_else(|| UnknownMutantType(s.to_string()))
    }
}

impl TryFrom<String> for MutantType {
    type Error = UnknownMutantType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MutantType> for String {
    fn from(value: MutantType) -> Self {
        value.name().to_string()
    }
}
