#![forbid(unsafe_code)]

mod error;
mod policy;
mod trace;

pub use error::Error;
pub use policy::{OnViolation, Policy};
pub use trace::Trace;

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub trace: Trace,
    pub policy: Policy,
}

impl Config {
    /// Load configuration from a TOML file. Missing fields are filled with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml_edit::de::from_str(&text)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let toml = toml_edit::ser::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    /// Load configuration from multiple TOML files. Later files override earlier ones.
    pub fn load_multiple<T, U>(paths: U) -> Result<Self, Error>
    where
        T: AsRef<Path>,
        U: IntoIterator<Item = T>,
    {
        let mut merged = toml_edit::DocumentMut::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(path)?;
            let doc: toml_edit::DocumentMut = text.parse()?;
            merge_document(&mut merged, doc);
        }
        let config: Config = toml_edit::de::from_str(&merged.to_string())?;
        Ok(config)
    }
}

fn merge_document(target: &mut toml_edit::DocumentMut, source: toml_edit::DocumentMut) {
    for (key, item) in source.iter() {
        merge_item(
            target.entry(key).or_insert(toml_edit::Item::None),
            item.clone(),
        );
    }
}

fn merge_item(target: &mut toml_edit::Item, source: toml_edit::Item) {
    use toml_edit::Item;
    match (target, source) {
        (Item::Table(target_table), Item::Table(source_table)) => {
            for (key, item) in source_table.iter() {
                merge_item(target_table.entry(key).or_insert(Item::None), item.clone());
            }
        }
        (Item::ArrayOfTables(target_array), Item::ArrayOfTables(source_array)) => {
            for table in source_array.iter() {
                target_array.push(table.clone());
            }
        }
        (target_item, source_item) => {
            *target_item = source_item;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert!(config.trace.follow_threads);
        assert!(config.trace.follow_children);
        assert!(!config.trace.jail);
        assert!(config.trace.backtrace);
        assert!(config.policy.learn);
        assert!(!config.policy.authorizer);
        assert_eq!(config.policy.on_violation, OnViolation::Prompt);
    }

    #[test]
    fn load_multiple_merges() {
        let dir = tempdir().unwrap();
        let path1 = dir.path().join("a.toml");
        let path2 = dir.path().join("b.toml");

        std::fs::write(&path1, "[trace]\njail = true\n[policy]\nlearn = false\n").unwrap();
        std::fs::write(&path2, "[policy]\nnfa = \"/var/lib/ptracer/nfa.bin\"\n").unwrap();

        let cfg = Config::load_multiple([path1, path2]).unwrap();
        assert!(cfg.trace.jail);
        assert!(!cfg.policy.learn);
        assert_eq!(cfg.policy.nfa, PathBuf::from("/var/lib/ptracer/nfa.bin"));
        // untouched fields keep their defaults
        assert!(cfg.trace.follow_children);
    }

    #[test]
    fn later_file_wins() {
        let dir = tempdir().unwrap();
        let path1 = dir.path().join("a.toml");
        let path2 = dir.path().join("b.toml");

        std::fs::write(&path1, "[policy]\non_violation = \"prompt\"\n").unwrap();
        std::fs::write(&path2, "[policy]\non_violation = \"kill\"\n").unwrap();

        let cfg = Config::load_multiple([path1, path2]).unwrap();
        assert_eq!(cfg.policy.on_violation, OnViolation::Kill);
    }
}
