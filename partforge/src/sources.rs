//! Source declarations and handlers. The engine only fetches local
//! sources itself; handlers for remote schemes (git, http, deb, snap) are
//! provided by the embedding application through the registry. What the
//! engine does own is the identity snapshot recorded in pull state and the
//! freshness check used by outdated detection.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use walkdir::WalkDir;

use crate::errors::{Error, Result};

/// The source declaration of a part, straight from its properties.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source: String,
    pub source_type: Option<String>,
    pub source_branch: Option<String>,
    pub source_tag: Option<String>,
    pub source_commit: Option<String>,
    pub source_depth: Option<u64>,
    pub source_checksum: Option<String>,
}

/// What actually got fetched, persisted in pull state and diffed by the
/// dirty detector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub url: String,
    pub source_type: String,
    pub revision: Option<String>,
    pub digest: Option<String>,
}

impl SourceSpec {
    /// Extract the `source*` keys from a part's properties. Returns `None`
    /// when the part declares no source at all.
    pub fn from_properties(properties: &serde_json::Map<String, Value>) -> Result<Option<SourceSpec>> {
        let source = match properties.get("source") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "source must be a string, not {}",
                    other
                )));
            }
            None => return Ok(None),
        };

        let string_option = |key: &str| -> Result<Option<String>> {
            match properties.get(key) {
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(Error::InvalidInput(format!(
                    "{} must be a string, not {}",
                    key, other
                ))),
                None => Ok(None),
            }
        };

        let spec = SourceSpec {
            source,
            source_type: string_option("source-type")?,
            source_branch: string_option("source-branch")?,
            source_tag: string_option("source-tag")?,
            source_commit: string_option("source-commit")?,
            source_depth: properties.get("source-depth").and_then(Value::as_u64),
            source_checksum: string_option("source-checksum")?,
        };

        if spec.source_tag.is_some() && spec.source_branch.is_some() {
            return Err(Error::InvalidInput(
                "can't specify both source-tag and source-branch for a source".to_string(),
            ));
        }
        if spec.source_commit.is_some()
            && (spec.source_tag.is_some() || spec.source_branch.is_some())
        {
            return Err(Error::InvalidInput(
                "can't specify source-tag or source-branch together with source-commit"
                    .to_string(),
            ));
        }

        Ok(Some(spec))
    }

    /// The URL scheme of the source, or the empty string for plain paths.
    pub fn scheme(&self) -> String {
        match Url::parse(&self.source) {
            Ok(url) => url.scheme().to_string(),
            Err(_) => String::new(),
        }
    }

    /// Decide the source type from the explicit declaration, the URL
    /// scheme, or well-known suffixes.
    pub fn detect_type(&self) -> Result<String> {
        if let Some(ref declared) = self.source_type {
            return Ok(declared.clone());
        }

        let scheme = self.scheme();
        if scheme.is_empty() || scheme == "file" {
            return Ok("local".to_string());
        }
        if scheme == "git" || scheme.starts_with("git+") || self.source.ends_with(".git") {
            return Ok("git".to_string());
        }
        for (suffix, name) in
            &[(".zip", "zip"), (".tar", "tar"), (".tar.gz", "tar"), (".tar.xz", "tar"), (".deb", "deb"), (".snap", "snap")]
        {
            if self.source.ends_with(suffix) {
                return Ok(name.to_string());
            }
        }

        Err(Error::SourceUnhandled(self.source.clone()))
    }
}

/// A resolved fetcher for one part's source.
pub trait SourceHandler {
    /// Fetch the source into `target_dir`.
    fn pull(&self, target_dir: &Path) -> Result<()>;

    /// Identity of what `pull` would fetch right now.
    fn identity(&self) -> SourceIdentity;

    /// Whether the source changed on disk (or upstream) since `since`.
    fn is_outdated_since(&self, since: SystemTime) -> Result<bool>;

    /// Build tool the package repository must provide for this source
    /// type, if any (e.g. `git`).
    fn required_build_tool(&self) -> Option<&'static str> {
        None
    }
}

/// Factory signature for externally registered source handlers, keyed by
/// source type.
pub type SourceFactory =
    Box<dyn Fn(&SourceSpec, &Path) -> Result<Box<dyn SourceHandler>> + Send + Sync>;

/// Sources that are plain directories on disk. Pulling copies the tree,
/// hard-linking file content where the filesystem allows it.
pub struct LocalSource {
    source_dir: PathBuf,
}

impl LocalSource {
    pub fn new(spec: &SourceSpec, base_dir: &Path) -> LocalSource {
        let path = PathBuf::from(&spec.source);
        let source_dir = if path.is_absolute() { path } else { base_dir.join(path) };
        LocalSource { source_dir }
    }
}

impl SourceHandler for LocalSource {
    fn pull(&self, target_dir: &Path) -> Result<()> {
        debug!("copying local source {:?} -> {:?}", self.source_dir, target_dir);
        copy_tree(&self.source_dir, target_dir)
    }

    fn identity(&self) -> SourceIdentity {
        SourceIdentity {
            url: self.source_dir.to_string_lossy().into_owned(),
            source_type: "local".to_string(),
            revision: None,
            digest: None,
        }
    }

    fn is_outdated_since(&self, since: SystemTime) -> Result<bool> {
        Ok(newest_mtime(&self.source_dir)?.map(|newest| newest > since).unwrap_or(false))
    }
}

/// Resolve a source declaration to a handler: local sources are built in,
/// anything else must come from the registered factories.
pub fn resolve_handler(
    spec: &SourceSpec,
    base_dir: &Path,
    factories: &std::collections::HashMap<String, SourceFactory>,
) -> Result<Box<dyn SourceHandler>> {
    let source_type = spec.detect_type()?;
    if source_type == "local" {
        return Ok(Box::new(LocalSource::new(spec, base_dir)));
    }
    match factories.get(&source_type) {
        Some(factory) => factory(spec, base_dir),
        None => Err(Error::SourceUnhandled(spec.source.clone())),
    }
}

/// Recursively copy `from` into `to`, preserving symlinks and attempting
/// hard links for regular files before falling back to a copy.
pub fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| {
            Error::InvalidInput(format!("cannot read source {:?}: {}", from, e))
        })?;
        let relative = entry.path().strip_prefix(from).unwrap();
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            if fs::hard_link(entry.path(), &target).is_err() {
                fs::copy(entry.path(), &target)?;
            }
        }
    }
    Ok(())
}

/// The newest modification time of any file under `root`, or `None` when
/// the tree is missing or empty.
pub fn newest_mtime(root: &Path) -> Result<Option<SystemTime>> {
    if !root.exists() {
        return Ok(None);
    }
    let mut newest = None;
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let mtime = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(mtime) => mtime,
            None => continue,
        };
        if newest.map(|n| mtime > n).unwrap_or(true) {
            newest = Some(mtime);
        }
    }
    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn no_source_key_means_no_spec() {
        assert!(SourceSpec::from_properties(&props(&[])).unwrap().is_none());
    }

    #[test]
    fn plain_paths_are_local() {
        let spec = SourceSpec { source: "./src".to_string(), ..Default::default() };
        assert_eq!(spec.detect_type().unwrap(), "local");
    }

    #[test]
    fn git_sources_are_detected() {
        let spec =
            SourceSpec { source: "https://example.com/x.git".to_string(), ..Default::default() };
        assert_eq!(spec.detect_type().unwrap(), "git");
    }

    #[test]
    fn tag_and_branch_conflict() {
        let result = SourceSpec::from_properties(&props(&[
            ("source", Value::String("./src".to_string())),
            ("source-tag", Value::String("v1".to_string())),
            ("source-branch", Value::String("main".to_string())),
        ]));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn unknown_remote_type_is_unhandled() {
        let spec = SourceSpec {
            source: "https://example.com/blob".to_string(),
            ..Default::default()
        };
        assert!(matches!(spec.detect_type(), Err(Error::SourceUnhandled(_))));
    }

    #[test]
    fn copy_tree_preserves_layout() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(from.path().join("sub")).unwrap();
        std::fs::write(from.path().join("sub/file"), b"content").unwrap();

        copy_tree(from.path(), to.path()).unwrap();
        assert_eq!(std::fs::read(to.path().join("sub/file")).unwrap(), b"content");
    }
}
