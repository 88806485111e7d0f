//! Per-run decision of which mutant types are executed.

use crate::mutant::MutantType;
use std::collections::{BTreeMap, HashMap};

/// Resolved enablement for one run.
///
/// Built once from the loaded configuration; explicit overrides win over the
/// catalog defaults.
#[derive(Debug, Clone, Default)]
pub struct Enablement {
    overrides: HashMap<MutantType, bool>,
    unknown_keys: Vec<String>,
}

impl Enablement {
    /// Capture overrides keyed by [`MutantType::enabled_key`].
    pub fn new(overrides: &BTreeMap<String, bool>) -> Self {
        let mut resolved = HashMap::new();
        let mut unknown_keys = Vec::new();

        for (key, enabled) in overrides {
            match MutantType::ALL.iter().find(|mt| mt.enabled_key() == *key) {
                Some(mt) => {
                    resolved.insert(*mt, *enabled);
                }
                None => unknown_keys.push(key.clone()),
            }
        }

        Self {
            overrides: resolved,
            unknown_keys,
        }
    }

    pub fn is_enabled(&self, mutant_type: MutantType) -> bool {
        self.overrides
            .get(&mutant_type)
            .copied()
            .unwrap_or_else(|| mutant_type.is_default_enabled())
    }

    /// Override keys that do not name any catalog entry.
    pub fn unknown_keys(&self) -> &[String] {
        &self.unknown_keys
    }

    /// Types enabled for this run, in catalog order.
    pub fn enabled_types(&self) -> Vec<MutantType> {
        MutantType::ALL
            .into_iter()
            .filter(|mt| self.is_enabled(*mt))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_overrides_uses_defaults() {
        let enablement = Enablement::new(&BTreeMap::new());
        for mt in MutantType::ALL {
            assert_eq!(enablement.is_enabled(mt), mt.is_default_enabled());
        }
        assert!(enablement.unknown_keys().is_empty());
    }

    #[test]
    fn test_overrides_win_both_ways() {
        let overrides = BTreeMap::from([
            ("mutants.invert-logical.enabled".to_string(), true),
            ("mutants.arithmetic-base.enabled".to_string(), false),
        ]);
        let enablement = Enablement::new(&overrides);

        assert!(enablement.is_enabled(MutantType::InvertLogical));
        assert!(!enablement.is_enabled(MutantType::ArithmeticBase));
        assert!(enablement.is_enabled(MutantType::ConditionalsBoundary));
    }

    #[test]
    fn test_unknown_keys_are_collected() {
        let overrides = BTreeMap::from([
            ("mutants.remove-calls.enabled".to_string(), true),
            ("mutants.invert-negatives.enabled".to_string(), false),
        ]);
        let enablement = Enablement::new(&overrides);

        assert_eq!(enablement.unknown_keys(), ["mutants.remove-calls.enabled"]);
        assert!(!enablement.is_enabled(MutantType::InvertNegatives));
    }

    #[test]
    fn test_enabled_types_in_catalog_order() {
        let enablement = Enablement::default();
        assert_eq!(
            enablement.enabled_types(),
            vec![
                MutantType::ArithmeticBase,
                MutantType::ConditionalsBoundary,
                MutantType::ConditionalsNegation,
                MutantType::IncrementDecrement,
                MutantType::InvertNegatives,
            ]
        );
    }
}
