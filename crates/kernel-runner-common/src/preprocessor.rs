//! Preprocessor definitions passed to the kernel compiler.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{trace, warn};

/// Finalized preprocessor definitions; immutable once the kernel is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessorDefinitions {
    /// `-D NAME`
    pub valueless: BTreeSet<String>,
    /// `-D NAME=VALUE`
    pub valued: BTreeMap<String, String>,
}

impl PreprocessorDefinitions {
    /// Merge kernel-specific valued definitions with generic `-D` items.
    ///
    /// Items take the form `NAME` or `NAME=VALUE` (`NAME=` defines an empty
    /// value). An item starting with `=` names nothing; it is reported and
    /// skipped. Kernel-specific values win over a `-D` item for the same name.
    pub fn finalize<'a>(
        items: impl IntoIterator<Item = &'a String>,
        kernel_specific: &BTreeMap<String, String>,
    ) -> Self {
        let mut defs = Self { valueless: BTreeSet::new(), valued: kernel_specific.clone() };
        for item in items {
            match item.find('=') {
                None => {
                    defs.valueless.insert(item.clone());
                }
                Some(0) => {
                    warn!(definition = %item, "ignoring preprocessor definition with an empty name");
                }
                Some(pos) => {
                    let (term, value) = (&item[..pos], &item[pos + 1..]);
                    defs.valued.entry(term.to_string()).or_insert_with(|| value.to_string());
                }
            }
        }
        for (term, value) in &defs.valued {
            trace!("finalized valued preprocessor definition: {term}={value}");
        }
        for term in &defs.valueless {
            trace!("finalized valueless preprocessor definition: {term}");
        }
        defs
    }

    /// Whether `name` is defined, with or without a value.
    pub fn defines(&self, name: &str) -> bool {
        self.valueless.contains(name) || self.valued.contains_key(name)
    }

    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.valued.get(name).map(String::as_str)
    }

    /// `-DNAME` / `-DNAME=VALUE` compiler flags, valueless first.
    pub fn compiler_flags(&self) -> Vec<String> {
        self.valueless
            .iter()
            .map(|term| format!("-D{term}"))
            .chain(self.valued.iter().map(|(term, value)| format!("-D{term}={value}")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_valueless_and_valued() {
        let raw = items(&["DEBUG", "TILE=16", "EMPTY="]);
        let defs = PreprocessorDefinitions::finalize(&raw, &BTreeMap::new());
        assert!(defs.valueless.contains("DEBUG"));
        assert_eq!(defs.value_of("TILE"), Some("16"));
        assert_eq!(defs.value_of("EMPTY"), Some(""));
        assert!(defs.defines("EMPTY"));
    }

    #[test]
    fn malformed_items_are_skipped() {
        let raw = items(&["=5", "OK"]);
        let defs = PreprocessorDefinitions::finalize(&raw, &BTreeMap::new());
        assert_eq!(defs.valueless.len(), 1);
        assert!(defs.valued.is_empty());
    }

    #[test]
    fn kernel_specific_values_take_precedence() {
        let raw = items(&["FILL_VALUE=1"]);
        let specific = BTreeMap::from([("FILL_VALUE".to_string(), "7".to_string())]);
        let defs = PreprocessorDefinitions::finalize(&raw, &specific);
        assert_eq!(defs.value_of("FILL_VALUE"), Some("7"));
    }

    #[test]
    fn compiler_flags_render_both_kinds() {
        let raw = items(&["A", "B=2"]);
        let defs = PreprocessorDefinitions::finalize(&raw, &BTreeMap::new());
        assert_eq!(defs.compiler_flags(), vec!["-DA".to_string(), "-DB=2".to_string()]);
    }

}
