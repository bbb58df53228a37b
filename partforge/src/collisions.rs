//! Pre-stage overlay check: no two parts may contribute different content
//! at the same relative path. Runs over every part that has build output,
//! before any part stages.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::errors::{Error, Result};
use crate::part::Part;

/// Verify the staged filesets of all parts overlay cleanly. Directories
/// merge; regular files must be byte-equal; symlinks must share a target;
/// anything else is a collision naming both parts and the path.
pub fn check_for_collisions<'a, I>(parts: I) -> Result<()>
where
    I: Iterator<Item = &'a Part>,
{
    let mut claimed: HashMap<PathBuf, (String, PathBuf)> = HashMap::new();

    for part in parts {
        if !part.install_dir().exists() {
            continue;
        }
        debug!("checking staged files of part {:?} for collisions", part.name());
        let resolved = part.stage_files()?;
        for relative in resolved.files.iter().chain(resolved.dirs.iter()) {
            let this_path = part.install_dir().join(relative);
            match claimed.get(relative) {
                None => {
                    claimed.insert(relative.clone(), (part.name().to_string(), this_path));
                }
                Some((other_name, other_path)) => {
                    if !paths_compatible(other_path, &this_path)? {
                        return Err(Error::Collision {
                            part_a: other_name.clone(),
                            part_b: part.name().to_string(),
                            path: relative.clone(),
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

fn paths_compatible(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = a.symlink_metadata()?;
    let meta_b = b.symlink_metadata()?;

    if meta_a.file_type().is_symlink() || meta_b.file_type().is_symlink() {
        if !(meta_a.file_type().is_symlink() && meta_b.file_type().is_symlink()) {
            return Ok(false);
        }
        return Ok(fs::read_link(a)? == fs::read_link(b)?);
    }

    if meta_a.is_dir() != meta_b.is_dir() {
        return Ok(false);
    }
    if meta_a.is_dir() {
        return Ok(true);
    }

    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    Ok(fs::read(a)? == fs::read(b)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::Registry;
    use crate::project::ProjectOptions;
    use serde_json::json;

    fn part_in(work_dir: &Path, name: &str) -> Part {
        let options = ProjectOptions::new(work_dir).unwrap();
        let registry = Registry::new();
        let properties = match json!({ "plugin": "nil" }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        Part::new(name, properties, &options, &registry).unwrap()
    }

    fn install(part: &Part, relative: &str, content: &[u8]) {
        let path = part.install_dir().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn identical_files_merge() {
        let work = tempfile::tempdir().unwrap();
        let a = part_in(work.path(), "a");
        let b = part_in(work.path(), "b");
        install(&a, "etc/x", b"same");
        install(&b, "etc/x", b"same");
        check_for_collisions(vec![&a, &b].into_iter()).unwrap();
    }

    #[test]
    fn different_content_collides() {
        let work = tempfile::tempdir().unwrap();
        let a = part_in(work.path(), "a");
        let b = part_in(work.path(), "b");
        install(&a, "etc/x", b"one");
        install(&b, "etc/x", b"two");

        match check_for_collisions(vec![&a, &b].into_iter()) {
            Err(Error::Collision { part_a, part_b, path }) => {
                assert_eq!(part_a, "a");
                assert_eq!(part_b, "b");
                assert_eq!(path, PathBuf::from("etc/x"));
            }
            other => panic!("expected a collision, got {:?}", other),
        }
    }

    #[test]
    fn file_against_directory_collides() {
        let work = tempfile::tempdir().unwrap();
        let a = part_in(work.path(), "a");
        let b = part_in(work.path(), "b");
        install(&a, "thing", b"file");
        fs::create_dir_all(b.install_dir().join("thing")).unwrap();

        assert!(matches!(
            check_for_collisions(vec![&a, &b].into_iter()),
            Err(Error::Collision { .. })
        ));
    }

    #[test]
    fn symlinks_with_equal_targets_merge() {
        let work = tempfile::tempdir().unwrap();
        let a = part_in(work.path(), "a");
        let b = part_in(work.path(), "b");
        for part in &[&a, &b] {
            fs::create_dir_all(part.install_dir()).unwrap();
            std::os::unix::fs::symlink("target", part.install_dir().join("link")).unwrap();
        }
        check_for_collisions(vec![&a, &b].into_iter()).unwrap();

        let work2 = tempfile::tempdir().unwrap();
        let c = part_in(work2.path(), "c");
        let d = part_in(work2.path(), "d");
        fs::create_dir_all(c.install_dir()).unwrap();
        fs::create_dir_all(d.install_dir()).unwrap();
        std::os::unix::fs::symlink("one", c.install_dir().join("link")).unwrap();
        std::os::unix::fs::symlink("two", d.install_dir().join("link")).unwrap();
        assert!(matches!(
            check_for_collisions(vec![&c, &d].into_iter()),
            Err(Error::Collision { .. })
        ));
    }

    #[test]
    fn parts_without_build_output_are_skipped() {
        let work = tempfile::tempdir().unwrap();
        let a = part_in(work.path(), "a");
        let b = part_in(work.path(), "b");
        check_for_collisions(vec![&a, &b].into_iter()).unwrap();
    }
}
