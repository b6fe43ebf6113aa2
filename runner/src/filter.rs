use crate::config::{ConfigError, FilterConfig};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fs, path::Path};
use tracing::{debug, warn};

/// Compare only one field of each individual id, e.g. `sample_12` -> `12` for `_` and index 1
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SplitRule {
    pub separator: char,
    pub index: usize,
}

impl SplitRule {
    pub fn apply<'a>(&self, name: &'a str) -> Result<&'a str, ConfigError> {
        name.split(self.separator)
            .nth(self.index)
            .ok_or_else(|| ConfigError::SplitField {
                name: name.to_owned(),
                separator: self.separator,
                index: self.index,
            })
    }
}

/// Resolved individual selection, shipped verbatim to every worker
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FilterSpec {
    /// keys to keep; everything is kept when absent
    pub keep: Option<BTreeSet<String>>,
    #[serde(default)]
    pub exclude: BTreeSet<String>,
    pub split: Option<SplitRule>,
}

/// Outcome of matching a filter against the individuals present in the data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub kept: Vec<String>,
    pub not_found: BTreeSet<String>,
}

/// read names from a newline separated file when `raw` names one, otherwise split on commas
pub fn build_keep_set(raw: &str) -> Result<BTreeSet<String>, ConfigError> {
    let path = Path::new(raw);

    let names: BTreeSet<String> = if path.is_file() {
        debug!(path = ?path, "Reading individual names from file");

        fs::read_to_string(path)
            .map_err(|source| ConfigError::NameList {
                path: path.to_path_buf(),
                source,
            })?
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect()
    } else {
        raw.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect()
    };

    if names.is_empty() {
        warn!("Individual list '{raw}' did not contain any names");
    }

    Ok(names)
}

impl FilterSpec {
    /// validate the raw filter flags and load the name lists
    pub fn build(config: &FilterConfig) -> Result<Self, ConfigError> {
        let split = match (config.split_char, config.split_index) {
            (Some(separator), Some(index)) => Some(SplitRule { separator, index }),
            (None, None) => None,
            (None, Some(_)) => return Err(ConfigError::SplitIndexWithoutSeparator),
            (Some(_), None) => return Err(ConfigError::SeparatorWithoutSplitIndex),
        };

        let keep = config.keep.as_deref().map(build_keep_set).transpose()?;

        if split.is_some() && keep.is_none() {
            return Err(ConfigError::SplitWithoutKeepList);
        }

        Ok(Self {
            keep,
            exclude: match config.exclude.as_deref() {
                Some(raw) => build_keep_set(raw)?,
                None => BTreeSet::new(),
            },
            split,
        })
    }

    /// the value compared against the name lists
    pub fn key<'a>(&self, name: &'a str) -> Result<&'a str, ConfigError> {
        match self.split {
            Some(rule) => rule.apply(name),
            None => Ok(name),
        }
    }

    pub fn includes(&self, name: &str) -> Result<bool, ConfigError> {
        let key = self.key(name)?;

        Ok(!self.exclude.contains(key)
            && self
                .keep
                .as_ref()
                .map_or(true, |keep| keep.contains(key)))
    }

    /// split `observed` into the kept individuals and the requested names never observed
    pub fn resolve<S: AsRef<str>>(&self, observed: &[S]) -> Result<Resolution, ConfigError> {
        let mut kept = Vec::new();
        let mut seen = BTreeSet::new();

        for name in observed {
            let name = name.as_ref();

            if self.includes(name)? {
                kept.push(name.to_owned());
            }

            seen.insert(self.key(name)?.to_owned());
        }

        let not_found = match &self.keep {
            Some(keep) => keep.difference(&seen).cloned().collect(),
            None => BTreeSet::new(),
        };

        Ok(Resolution { kept, not_found })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    fn config(keep: Option<&str>, split_char: Option<char>, split_index: Option<usize>) -> FilterConfig {
        FilterConfig {
            keep: keep.map(str::to_owned),
            exclude: None,
            split_char,
            split_index,
        }
    }

    #[test]
    fn resolve_reports_missing_requests() {
        let filter = FilterSpec::build(&config(Some("B,C,D"), None, None)).unwrap();
        let resolution = filter.resolve(&["A", "B", "C"]).unwrap();

        assert_eq!(resolution.kept, vec!["B", "C"]);
        assert_eq!(resolution.not_found, names(&["D"]));
    }

    #[test]
    fn no_filter_keeps_everything() {
        let filter = FilterSpec::build(&FilterConfig::default()).unwrap();
        let resolution = filter.resolve(&["A", "B"]).unwrap();

        assert_eq!(resolution.kept, vec!["A", "B"]);
        assert!(resolution.not_found.is_empty());
    }

    #[test]
    fn split_rule_compares_selected_field() {
        let filter = FilterSpec::build(&config(Some("12"), Some('_'), Some(1))).unwrap();

        assert_eq!(filter.key("sample_12").unwrap(), "12");
        assert!(filter.includes("sample_12").unwrap());
        assert!(!filter.includes("sample_13").unwrap());
        assert!(matches!(
            filter.key("sample"),
            Err(ConfigError::SplitField { index: 1, .. })
        ));
    }

    #[test]
    fn keys_borrow_from_the_matrix_id() {
        let name = String::from("sample_12");

        let plain = FilterSpec::build(&config(Some("sample_12"), None, None)).unwrap();
        assert!(std::ptr::eq(plain.key(&name).unwrap(), name.as_str()));

        let split = FilterSpec::build(&config(Some("12"), Some('_'), Some(1))).unwrap();
        assert!(std::ptr::eq(split.key(&name).unwrap(), &name[7..]));
    }

    #[test]
    fn incomplete_split_rules_are_rejected() {
        assert!(matches!(
            FilterSpec::build(&config(Some("12"), None, Some(1))),
            Err(ConfigError::SplitIndexWithoutSeparator)
        ));
        assert!(matches!(
            FilterSpec::build(&config(Some("12"), Some('_'), None)),
            Err(ConfigError::SeparatorWithoutSplitIndex)
        ));
        assert!(matches!(
            FilterSpec::build(&config(None, Some('_'), Some(1))),
            Err(ConfigError::SplitWithoutKeepList)
        ));
    }

    #[test]
    fn file_lists_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("keep.txt");
        std::fs::write(&list, "s1\n\n  s2 \n").unwrap();

        assert_eq!(
            build_keep_set(list.to_str().unwrap()).unwrap(),
            names(&["s1", "s2"])
        );
        assert_eq!(build_keep_set("s1, s3,").unwrap(), names(&["s1", "s3"]));
    }

    #[test]
    fn exclusion_wins_over_keep() {
        let filter = FilterSpec::build(&FilterConfig {
            keep: Some("A,B".to_owned()),
            exclude: Some("B".to_owned()),
            split_char: None,
            split_index: None,
        })
        .unwrap();
        let resolution = filter.resolve(&["A", "B"]).unwrap();

        assert_eq!(resolution.kept, vec!["A"]);
        assert!(resolution.not_found.is_empty());
    }
}
