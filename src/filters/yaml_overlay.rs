//! Reference out-filter: augments each search result entry with attributes
//! sourced from DN-keyed and attribute/value-keyed YAML side files.
//!
//! Overlay files are re-read from disk on every applicable response — a
//! deliberate correctness simplification so operators can edit them live.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ldap3_proto::proto::{LdapPartialAttribute, LdapSearchResultEntry};
use serde::Deserialize;

use crate::error::FilterError;

use super::OutFilter;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YamlValue {
    Scalar(String),
    Sequence(Vec<String>),
}

impl YamlValue {
    fn into_values(self) -> Vec<Vec<u8>> {
        match self {
            YamlValue::Scalar(s) => vec![s.into_bytes()],
            YamlValue::Sequence(vals) => vals.into_iter().map(String::into_bytes).collect(),
        }
    }
}

pub struct YamlOverlay {
    yaml_dir: PathBuf,
    overlay_prefix: String,
}

impl YamlOverlay {
    pub fn new(yaml_dir: PathBuf, overlay_prefix: String) -> Self {
        Self {
            yaml_dir,
            overlay_prefix,
        }
    }

    /// Replaces every run of characters outside `[A-Za-z0-9_-]` with a
    /// single underscore and truncates to 64 octets. All characters this
    /// can ever emit are single-byte ASCII, so a 64-char truncation is also
    /// a 64-octet one.
    pub fn sanitize(value: &str) -> String {
        let mut out = String::with_capacity(value.len().min(64));
        let mut in_run = false;
        for ch in value.chars() {
            if out.len() >= 64 {
                break;
            }
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                out.push(ch);
                in_run = false;
            } else if !in_run {
                out.push('_');
                in_run = true;
            }
        }
        out
    }

    fn candidates(entry: &LdapSearchResultEntry) -> Vec<String> {
        let mut candidates = vec![entry.dn.clone()];
        for attr in &entry.attributes {
            for val in &attr.vals {
                let val_str = String::from_utf8_lossy(val);
                candidates.push(format!("{}/{}", attr.atype, Self::sanitize(&val_str)));
            }
        }
        candidates
    }

    fn load(&self, candidate: &str) -> Result<Option<BTreeMap<String, YamlValue>>, FilterError> {
        let path = self.yaml_dir.join(format!("{candidate}.yaml"));
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| FilterError::new(format!("reading {}: {e}", path.display())))?;
        let parsed = serde_yaml::from_str(&contents)
            .map_err(|e| FilterError::new(format!("parsing {}: {e}", path.display())))?;
        Ok(Some(parsed))
    }
}

impl OutFilter for YamlOverlay {
    fn name(&self) -> &'static str {
        super::YAML_OVERLAY
    }

    fn filter(&mut self, entry: &mut LdapSearchResultEntry, _msgid: i32) -> Result<(), FilterError> {
        for candidate in Self::candidates(entry) {
            match self.load(&candidate) {
                Ok(Some(data)) => {
                    for (atype, value) in data {
                        entry.attributes.push(LdapPartialAttribute {
                            atype: format!("{}{}", self.overlay_prefix, atype),
                            vals: value.into_values(),
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(candidate, error = %e, "overlay file malformed, skipping candidate");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_runs_and_truncates() {
        assert_eq!(YamlOverlay::sanitize("555-1234"), "555-1234");
        assert_eq!(YamlOverlay::sanitize("a b  c"), "a_b_c");
        assert_eq!(YamlOverlay::sanitize("héllo"), "h_llo");
        let long = "a".repeat(100);
        assert_eq!(YamlOverlay::sanitize(&long).len(), 64);
    }

    #[test]
    fn candidates_include_dn_and_attr_value_pairs() {
        let entry = LdapSearchResultEntry {
            dn: "uid=bob,dc=x".to_string(),
            attributes: vec![LdapPartialAttribute {
                atype: "uid".to_string(),
                vals: vec![b"bob".to_vec()],
            }],
        };
        let candidates = YamlOverlay::candidates(&entry);
        assert!(candidates.contains(&"uid=bob,dc=x".to_string()));
        assert!(candidates.contains(&"uid/bob".to_string()));
    }

    #[test]
    fn injects_attributes_from_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("uid=bob,dc=x.yaml"),
            "phone:\n  - \"555-1234\"\nrole: admin\n",
        )
        .unwrap();

        let mut overlay = YamlOverlay::new(dir.path().to_path_buf(), "my_".to_string());
        let mut entry = LdapSearchResultEntry {
            dn: "uid=bob,dc=x".to_string(),
            attributes: vec![LdapPartialAttribute {
                atype: "cn".to_string(),
                vals: vec![b"Bob".to_vec()],
            }],
        };

        overlay.filter(&mut entry, 1).unwrap();

        let names: Vec<_> = entry.attributes.iter().map(|a| a.atype.clone()).collect();
        assert!(names.contains(&"my_phone".to_string()));
        assert!(names.contains(&"my_role".to_string()));
    }

    #[test]
    fn empty_yaml_dir_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut overlay = YamlOverlay::new(dir.path().to_path_buf(), "my_".to_string());
        let mut entry = LdapSearchResultEntry {
            dn: "uid=bob,dc=x".to_string(),
            attributes: vec![LdapPartialAttribute {
                atype: "cn".to_string(),
                vals: vec![b"Bob".to_vec()],
            }],
        };
        let before = entry.attributes.clone();
        overlay.filter(&mut entry, 1).unwrap();
        assert_eq!(entry.attributes, before);
    }
}
