use std::collections::{HashMap, HashSet};

use crate::types::XactId;

/// The waits-for relation between transactions, rebuilt from the lock
/// table each time a request has to queue.
pub(crate) struct WaitForGraph {
    // key: transaction id, value: the transactions that the key transaction is waiting for
    graph: HashMap<XactId, HashSet<XactId>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self {
            graph: HashMap::new(),
        }
    }

    pub(crate) fn add_edge(&mut self, from: XactId, to: XactId) {
        self.graph
            .entry(from)
            .or_insert_with(HashSet::new)
            .insert(to);
    }

    /// Whether some path starting at `start` leads back to `start`.
    pub(crate) fn cycle_through(&self, start: XactId) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<XactId> = match self.graph.get(&start) {
            Some(next) => next.iter().cloned().collect(),
            None => return false,
        };

        while let Some(xid) = stack.pop() {
            if xid == start {
                return true;
            }
            if !visited.insert(xid) {
                continue;
            }
            if let Some(next) = self.graph.get(&xid) {
                stack.extend(next.iter().cloned());
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);

        assert!(!graph.cycle_through(1));
        assert!(!graph.cycle_through(3));
    }

    #[test]
    fn test_two_party_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);

        assert!(graph.cycle_through(1));
        assert!(graph.cycle_through(2));
    }

    #[test]
    fn test_cycle_not_through_start() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(3, 2);

        // 2 <-> 3 loops, but no path returns to 1
        assert!(!graph.cycle_through(1));
        assert!(graph.cycle_through(2));
    }
}
