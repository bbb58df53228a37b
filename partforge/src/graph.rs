//! Dependency graph over parts: resolves `after` references, orders parts
//! so dependencies are executed before their dependents, and rejects
//! cycles. Ordering is deterministic across runs with the same input.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::errors::{Error, Result};

#[derive(Debug, Default)]
pub struct PartGraph {
    /// Direct dependencies, keyed by part name.
    after: BTreeMap<String, Vec<String>>,
    /// Execution order: every part appears after all of its dependencies.
    order: Vec<String>,
}

impl PartGraph {
    /// Build the graph from each part's `after` list. Fails if a reference
    /// does not resolve or if the induced graph has a cycle; nothing is
    /// touched on disk either way.
    pub fn new(after_requests: BTreeMap<String, Vec<String>>) -> Result<PartGraph> {
        for (part, deps) in &after_requests {
            for dep in deps {
                if !after_requests.contains_key(dep) {
                    return Err(Error::MissingDependency {
                        part: part.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }

        let order = sort_parts(&after_requests)?;
        debug!("part execution order: {:?}", order);
        Ok(PartGraph { after: after_requests, order })
    }

    /// Part names in execution order (dependencies first).
    pub fn ordered_names(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, name: &str) -> bool {
        self.after.contains_key(name)
    }

    /// Direct dependency names of `name`, in declaration order.
    pub fn direct_dependencies(&self, name: &str) -> &[String] {
        self.after.get(name).map(|d| d.as_slice()).unwrap_or(&[])
    }

    /// The set of parts `name` depends upon.
    pub fn get_dependencies(&self, name: &str, recursive: bool) -> BTreeSet<String> {
        let mut dependencies: BTreeSet<String> =
            self.direct_dependencies(name).iter().cloned().collect();

        if recursive {
            for dep in self.direct_dependencies(name).to_vec() {
                dependencies.extend(self.get_dependencies(&dep, true));
            }
        }

        dependencies
    }

    /// The set of parts that depend upon `name`.
    pub fn get_reverse_dependencies(&self, name: &str, recursive: bool) -> BTreeSet<String> {
        let mut reverse: BTreeSet<String> = self
            .after
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == name))
            .map(|(part, _)| part.clone())
            .collect();

        if recursive {
            for dependent in reverse.clone() {
                reverse.extend(self.get_reverse_dependencies(&dependent, true));
            }
        }

        reverse
    }
}

/// Straightforward topological sort matching the reference behavior: sort
/// names descending, then repeatedly take the first part no other pooled
/// part depends on and prepend it to the output. The resulting list runs
/// dependencies before dependents.
fn sort_parts(after: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    let mut pool: Vec<&String> = after.keys().collect();
    pool.sort_by(|a, b| b.cmp(a));

    let mut sorted: Vec<String> = Vec::with_capacity(pool.len());
    while !pool.is_empty() {
        let top = pool
            .iter()
            .position(|part| {
                !pool.iter().any(|other| after[other.as_str()].contains(*part))
            })
            .ok_or(Error::CircularDependency)?;
        sorted.insert(0, pool.remove(top).clone());
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(entries: &[(&str, &[&str])]) -> Result<PartGraph> {
        let after = entries
            .iter()
            .map(|(name, deps)| {
                (name.to_string(), deps.iter().map(|d| d.to_string()).collect())
            })
            .collect();
        PartGraph::new(after)
    }

    #[test]
    fn dependencies_come_before_dependents() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]).unwrap();
        assert_eq!(g.ordered_names(), &["c", "b", "a"]);
    }

    #[test]
    fn ordering_is_deterministic() {
        let entries: &[(&str, &[&str])] =
            &[("x", &[]), ("m", &["x"]), ("a", &["x"]), ("k", &[])];
        let first = graph(entries).unwrap();
        for _ in 0..10 {
            let again = graph(entries).unwrap();
            assert_eq!(first.ordered_names(), again.ordered_names());
        }
    }

    #[test]
    fn transitive_order_holds_for_every_part() {
        let g = graph(&[
            ("app", &["libs", "data"]),
            ("libs", &["base"]),
            ("data", &["base"]),
            ("base", &[]),
        ])
        .unwrap();
        let position = |name: &str| {
            g.ordered_names().iter().position(|n| n == name).unwrap()
        };
        for part in &["app", "libs", "data", "base"] {
            for dep in g.get_dependencies(part, true) {
                assert!(position(&dep) < position(part), "{} should precede {}", dep, part);
            }
        }
    }

    #[test]
    fn missing_dependency_is_rejected() {
        match graph(&[("a", &["ghost"])]) {
            Err(Error::MissingDependency { part, missing }) => {
                assert_eq!(part, "a");
                assert_eq!(missing, "ghost");
            }
            other => panic!("expected MissingDependency, got {:?}", other),
        }
    }

    #[test]
    fn cycle_is_rejected() {
        match graph(&[("a", &["b"]), ("b", &["a"])]) {
            Err(Error::CircularDependency) => {}
            other => panic!("expected CircularDependency, got {:?}", other),
        }
    }

    #[test]
    fn self_cycle_is_rejected() {
        assert!(matches!(graph(&[("a", &["a"])]), Err(Error::CircularDependency)));
    }

    #[test]
    fn dependency_queries() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]).unwrap();
        let names = |set: BTreeSet<String>| set.into_iter().collect::<Vec<_>>();

        assert_eq!(names(g.get_dependencies("a", false)), vec!["b"]);
        assert_eq!(names(g.get_dependencies("a", true)), vec!["b", "c"]);
        assert_eq!(names(g.get_reverse_dependencies("c", false)), vec!["b"]);
        assert_eq!(names(g.get_reverse_dependencies("c", true)), vec!["a", "b"]);
    }
}
