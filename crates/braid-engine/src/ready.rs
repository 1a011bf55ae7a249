use std::collections::{HashMap, HashSet};

type OnReady = Box<dyn FnMut(&str) + Send>;

/// Incremental readiness detector over a static dependency graph.
///
/// Keeps a pending-dependency count per node. A completion only looks at the
/// completed node's direct successors, and a node becomes ready exactly when
/// its count drops to zero. Since a count can only reach zero once from a
/// positive value, `on_ready` fires at most once per node.
pub struct IncrementalReadyTracker {
    pending: HashMap<String, usize>,
    successors: HashMap<String, Vec<String>>,
    /// Declaration order, so seeding is deterministic.
    order: Vec<String>,
    completed: HashSet<String>,
    on_ready: Option<OnReady>,
}

impl IncrementalReadyTracker {
    /// Build from edges keyed by target (`to -> [from, ...]`) and the node set.
    ///
    /// Edges are assumed validated: every endpoint is in `node_ids`.
    pub fn new(edges: &HashMap<String, Vec<String>>, node_ids: &[String]) -> Self {
        let mut pending: HashMap<String, usize> =
            node_ids.iter().map(|id| (id.clone(), 0)).collect();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();

        for (to, sources) in edges {
            let mut seen = HashSet::new();
            for from in sources {
                // Duplicate edges count once
                if !seen.insert(from.as_str()) {
                    continue;
                }
                *pending.entry(to.clone()).or_insert(0) += 1;
                successors.entry(from.clone()).or_default().push(to.clone());
            }
        }

        // Stable successor order follows declaration order
        let position: HashMap<&str, usize> = node_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for succ in successors.values_mut() {
            succ.sort_by_key(|id| position.get(id.as_str()).copied().unwrap_or(usize::MAX));
        }

        Self {
            pending,
            successors,
            order: node_ids.to_vec(),
            completed: HashSet::new(),
            on_ready: None,
        }
    }

    /// Register a callback fired whenever a node becomes ready.
    pub fn with_on_ready(mut self, on_ready: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(on_ready));
        self
    }

    /// Fire for every node with no dependencies; returns them in declaration order.
    pub fn seed_initial_ready(&mut self) -> Vec<String> {
        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|id| !self.completed.contains(*id) && self.pending.get(*id) == Some(&0))
            .cloned()
            .collect();
        for id in &ready {
            self.fire(id);
        }
        ready
    }

    /// Record a completion and return the successors that just became ready.
    ///
    /// Completing the same node twice is a no-op, so each dependency is
    /// counted exactly once.
    pub fn mark_completed(&mut self, node_id: &str) -> Vec<String> {
        if !self.completed.insert(node_id.to_string()) {
            return Vec::new();
        }

        let mut ready = Vec::new();
        let Some(successors) = self.successors.get(node_id) else {
            return ready;
        };

        for succ in successors {
            if let Some(count) = self.pending.get_mut(succ) {
                if *count == 0 {
                    continue;
                }
                *count -= 1;
                if *count == 0 {
                    ready.push(succ.clone());
                }
            }
        }

        for id in &ready {
            self.fire(id);
        }
        ready
    }

    pub fn pending_count(&self, node_id: &str) -> Option<usize> {
        self.pending.get(node_id).copied()
    }

    pub fn is_completed(&self, node_id: &str) -> bool {
        self.completed.contains(node_id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Copy of the pending-count map, for checkpointing.
    pub fn snapshot(&self) -> HashMap<String, usize> {
        self.pending.clone()
    }

    /// Restore pending counts and completions from a checkpoint.
    ///
    /// Returns the nodes that are ready (count zero) but not yet completed,
    /// in declaration order. `on_ready` fires for each of them.
    pub fn restore_from(
        &mut self,
        pending: &HashMap<String, usize>,
        completed: impl IntoIterator<Item = String>,
    ) -> Vec<String> {
        for (id, count) in pending {
            if let Some(slot) = self.pending.get_mut(id) {
                *slot = *count;
            }
        }
        self.completed = completed.into_iter().collect();

        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|id| !self.completed.contains(*id) && self.pending.get(*id) == Some(&0))
            .cloned()
            .collect();
        for id in &ready {
            self.fire(id);
        }
        ready
    }

    fn fire(&mut self, node_id: &str) {
        if let Some(cb) = self.on_ready.as_mut() {
            cb(node_id);
        }
    }
}
