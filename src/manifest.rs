//! Resource manifest and core shell list.
//!
//! A build step emits one [`Deployment`] per release: the full map of
//! logical paths to content fingerprints, plus the ordered list of paths that
//! must be present before the application can render its first frame.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::ROOT_KEY;

/// Mapping from logical path to content fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceManifest(BTreeMap<String, String>);

impl ResourceManifest {
    /// Creates an empty manifest.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Parses a manifest from its JSON object form.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a JSON object of strings.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(json)?)
    }

    /// Serializes the manifest to its JSON object form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Returns the fingerprint for `key`, if present.
    #[must_use]
    pub fn fingerprint(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns true if `key` is part of this manifest.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Returns true if `key` exists here with the same fingerprint it had in
    /// `previous`. A cached copy of such a resource can be reused as is.
    #[must_use]
    pub fn is_unchanged(&self, key: &str, previous: &Self) -> bool {
        match (self.fingerprint(key), previous.fingerprint(key)) {
            (Some(current), Some(old)) => current == old,
            _ => false,
        }
    }

    /// Iterates over logical keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the manifest lists no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds or replaces a resource.
    pub fn insert(&mut self, key: impl Into<String>, fingerprint: impl Into<String>) {
        self.0.insert(key.into(), fingerprint.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResourceManifest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One deployed version of the application: its manifest and core shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Every resource in this version.
    pub resources: ResourceManifest,
    /// Resources fetched eagerly during install, in order.
    pub core: Vec<String>,
}

impl Deployment {
    /// Creates a deployment, validating that the core shell is drawn from
    /// the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] if a core entry is missing from the
    /// manifest or the root key is core without being a resource.
    pub fn new(resources: ResourceManifest, core: Vec<String>) -> Result<Self> {
        let deployment = Self { resources, core };
        deployment.validate()?;
        Ok(deployment)
    }

    /// Loads a deployment from a JSON file of the form
    /// `{"resources": {"path": "hash"}, "core": ["path"]}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read(path)?;
        let deployment: Self = serde_json::from_slice(&contents)?;
        deployment.validate()?;
        log::debug!(
            "Loaded deployment from {}: {} resources, {} core",
            path.display(),
            deployment.resources.len(),
            deployment.core.len()
        );
        Ok(deployment)
    }

    fn validate(&self) -> Result<()> {
        if let Some(missing) = self.core.iter().find(|k| !self.resources.contains(k)) {
            return Err(Error::Manifest(format!(
                "core resource {missing:?} is not listed in the manifest"
            )));
        }
        if self.resources.keys().any(str::is_empty) {
            return Err(Error::Manifest(format!(
                "empty resource key; use {ROOT_KEY:?} for the root document"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(entries: &[(&str, &str)]) -> ResourceManifest {
        entries.iter().copied().collect()
    }

    #[test]
    fn parses_flat_json_object() {
        let m = ResourceManifest::from_json(
            br#"{"index.html": "a884", "/": "a884", "main.dart.js": "0d0e"}"#,
        )
        .unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m.fingerprint("/"), Some("a884"));
        assert_eq!(m.fingerprint("main.dart.js"), Some("0d0e"));
        assert_eq!(m.fingerprint("missing.js"), None);
    }

    #[test]
    fn json_form_is_a_flat_object() {
        let m = manifest(&[("a.js", "1"), ("b.js", "2")]);
        let json = m.to_json().unwrap();
        assert_eq!(json, br#"{"a.js":"1","b.js":"2"}"#);
        assert_eq!(ResourceManifest::from_json(&json).unwrap(), m);
    }

    #[test]
    fn rejects_non_string_fingerprints() {
        assert!(ResourceManifest::from_json(br#"{"a.js": 1}"#).is_err());
        assert!(ResourceManifest::from_json(br#"["a.js"]"#).is_err());
    }

    #[test]
    fn unchanged_requires_both_sides_to_match() {
        let old = manifest(&[("kept.js", "1"), ("changed.js", "1"), ("removed.js", "1")]);
        let new = manifest(&[("kept.js", "1"), ("changed.js", "2"), ("added.js", "1")]);

        assert!(new.is_unchanged("kept.js", &old));
        assert!(!new.is_unchanged("changed.js", &old));
        assert!(!new.is_unchanged("removed.js", &old));
        assert!(!new.is_unchanged("added.js", &old));
    }

    #[test]
    fn deployment_rejects_core_outside_manifest() {
        let resources = manifest(&[("index.html", "1")]);
        let err = Deployment::new(resources, vec!["main.dart.js".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Manifest(_)));
    }

    #[test]
    fn deployment_rejects_empty_key() {
        let resources = manifest(&[("", "1")]);
        assert!(matches!(
            Deployment::new(resources, vec![]),
            Err(Error::Manifest(_))
        ));
    }

    #[test]
    fn deployment_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("deployment.json");
        std::fs::write(
            &path,
            r#"{
                "resources": {"index.html": "a8", "/": "a8", "main.dart.js": "0d"},
                "core": ["main.dart.js", "index.html"]
            }"#,
        )
        .unwrap();

        let deployment = Deployment::load(&path).unwrap();
        assert_eq!(deployment.resources.len(), 3);
        assert_eq!(deployment.core, vec!["main.dart.js", "index.html"]);
    }
}
