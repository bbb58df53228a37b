//! Package manager adapter. Installing build prerequisites is host policy
//! and lives outside the engine; the lifecycle only needs the interface
//! and a null adapter for hosts that manage packages out of band.

use std::collections::BTreeSet;

use log::debug;

use crate::errors::Result;

pub trait PackageRepository {
    /// Install the given packages, returning the names (with versions
    /// where known) of everything newly installed.
    fn install_build_packages(&self, packages: &[String]) -> Result<Vec<String>>;

    /// Install the given snaps, returning what was newly installed.
    fn install_build_snaps(&self, snaps: &[String]) -> Result<Vec<String>>;

    /// Packages required to fetch a given source type (e.g. `git` sources
    /// need the `git` package).
    fn packages_for_source_type(&self, source_type: &str) -> BTreeSet<String> {
        let mut packages = BTreeSet::new();
        match source_type {
            "git" => {
                packages.insert("git".to_string());
            }
            "bzr" => {
                packages.insert("bzr".to_string());
            }
            "hg" | "mercurial" => {
                packages.insert("mercurial".to_string());
            }
            "svn" | "subversion" => {
                packages.insert("subversion".to_string());
            }
            _ => {}
        }
        packages
    }
}

/// Adapter that installs nothing and reports every request as satisfied.
#[derive(Debug, Default)]
pub struct NullRepository;

impl PackageRepository for NullRepository {
    fn install_build_packages(&self, packages: &[String]) -> Result<Vec<String>> {
        debug!("assuming build packages are installed: {:?}", packages);
        Ok(packages.to_vec())
    }

    fn install_build_snaps(&self, snaps: &[String]) -> Result<Vec<String>> {
        debug!("assuming build snaps are installed: {:?}", snaps);
        Ok(snaps.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_types_map_to_packages() {
        let repo = NullRepository::default();
        assert!(repo.packages_for_source_type("git").contains("git"));
        assert!(repo.packages_for_source_type("local").is_empty());
    }
}
