//! Static situation registry with dependency ordering.
//!
//! Order is Kahn's algorithm; among situations that are ready at the same
//! time, the one registered first goes first. Unknown dependencies and
//! cycles are reported before anything runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::Situation;
use crate::error::{ProbeError, Result};

/// Registry of situations, kept in declaration order.
#[derive(Default, Clone)]
pub struct SituationRegistry {
    situations: Vec<Arc<dyn Situation>>,
    index: HashMap<&'static str, usize>,
}

impl SituationRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a situation. Ids must be unique.
    pub fn register(&mut self, situation: impl Situation) -> Result<()> {
        self.register_arc(Arc::new(situation))
    }

    fn register_arc(&mut self, situation: Arc<dyn Situation>) -> Result<()> {
        let id = situation.id();
        if self.index.contains_key(id) {
            return Err(ProbeError::DuplicateSituation(id.to_string()));
        }
        self.index.insert(id, self.situations.len());
        self.situations.push(situation);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.situations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.situations.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Situation>> {
        self.index.get(id).map(|&i| &self.situations[i])
    }

    /// Situations in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Situation>> {
        self.situations.iter()
    }

    pub(crate) fn at(&self, index: usize) -> &Arc<dyn Situation> {
        &self.situations[index]
    }

    /// Indices of the dependencies of the situation at `index`.
    pub(crate) fn dependency_indices(&self, index: usize) -> Result<Vec<usize>> {
        let situation = &self.situations[index];
        situation
            .dependencies()
            .iter()
            .map(|dep| {
                self.index
                    .get(dep)
                    .copied()
                    .ok_or_else(|| ProbeError::UnknownDependency {
                        situation: situation.id().to_string(),
                        dependency: dep.to_string(),
                    })
            })
            .collect()
    }

    /// Topological order as registry indices.
    pub(crate) fn order_indices(&self) -> Result<Vec<usize>> {
        let n = self.situations.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for dep in self.dependency_indices(i)? {
                indegree[i] += 1;
                dependents[dep].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() < n {
            let members = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.situations[i].id().to_string())
                .collect();
            return Err(ProbeError::DependencyCycle(members));
        }
        Ok(order)
    }

    /// Situation ids in execution order.
    pub fn order(&self) -> Result<Vec<&'static str>> {
        Ok(self
            .order_indices()?
            .into_iter()
            .map(|i| self.situations[i].id())
            .collect())
    }

    /// A registry holding `ids` plus everything they transitively depend on.
    pub fn closure(&self, ids: &[&str]) -> Result<SituationRegistry> {
        let mut selected = vec![false; self.situations.len()];
        let mut stack = Vec::new();
        for id in ids {
            let &i = self
                .index
                .get(id)
                .ok_or_else(|| ProbeError::Config(format!("unknown situation {}", id)))?;
            stack.push(i);
        }
        while let Some(i) = stack.pop() {
            if selected[i] {
                continue;
            }
            selected[i] = true;
            stack.extend(self.dependency_indices(i)?);
        }

        let mut subset = SituationRegistry::new();
        for (i, situation) in self.situations.iter().enumerate() {
            if selected[i] {
                subset.register_arc(Arc::clone(situation))?;
            }
        }
        Ok(subset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::situation::{Outcome, SituationContext};
    use crate::BoxFuture;

    struct Fixed {
        id: &'static str,
        deps: &'static [&'static str],
    }

    impl Situation for Fixed {
        fn id(&self) -> &'static str {
            self.id
        }

        fn name(&self) -> &'static str {
            self.id
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }

        fn diagnostic<'a>(&'a self, _ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
            Box::pin(async { Outcome::conformant("ok") })
        }
    }

    fn registry(items: &[(&'static str, &'static [&'static str])]) -> SituationRegistry {
        let mut registry = SituationRegistry::new();
        for &(id, deps) in items {
            registry.register(Fixed { id, deps }).unwrap();
        }
        registry
    }

    #[test]
    fn test_dependencies_run_first_regardless_of_registration_order() {
        let registry = registry(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        assert_eq!(registry.order().unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn test_stable_tie_break_by_declaration() {
        let registry = registry(&[
            ("z", &[]),
            ("y", &["root"]),
            ("root", &[]),
            ("x", &["root"]),
        ]);
        assert_eq!(registry.order().unwrap(), ["z", "root", "y", "x"]);
    }

    #[test]
    fn test_cycle_detected() {
        let registry = registry(&[("free", &[]), ("a", &["b"]), ("b", &["a"])]);
        let err = registry.order().unwrap_err();
        match err {
            ProbeError::DependencyCycle(members) => assert_eq!(members, ["a", "b"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let registry = registry(&[("a", &["missing"])]);
        assert!(matches!(
            registry.order(),
            Err(ProbeError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = registry(&[("a", &[])]);
        let err = registry.register(Fixed { id: "a", deps: &[] }).unwrap_err();
        assert!(matches!(err, ProbeError::DuplicateSituation(id) if id == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_closure_pulls_in_dependencies() {
        let registry = registry(&[
            ("auth", &[]),
            ("other", &[]),
            ("proceed", &["auth"]),
            ("echo", &["proceed"]),
        ]);
        let subset = registry.closure(&["echo"]).unwrap();
        assert_eq!(subset.order().unwrap(), ["auth", "proceed", "echo"]);
        assert!(registry.closure(&["nope"]).is_err());
    }
}
