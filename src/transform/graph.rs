//! Measure dependency graph: impact propagation, ordering and cycle detection.
//!
//! Nodes are measure paths; edges are kept as adjacency maps over those strings.

use crate::measure::{Measure, SourceType};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug)]
pub struct DependencyGraph<'a> {
    measures: BTreeMap<&'a str, &'a Measure>,
    /// measure -> upstream measures
    depends_on: HashMap<&'a str, Vec<&'a str>>,
    /// channel -> measures reading it
    channel_consumers: HashMap<&'a str, Vec<&'a str>>,
    /// measure -> measures reading it
    measure_consumers: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(measures: &'a [Measure]) -> Self {
        let mut graph = DependencyGraph {
            measures: BTreeMap::new(),
            depends_on: HashMap::new(),
            channel_consumers: HashMap::new(),
            measure_consumers: HashMap::new(),
        };
        for measure in measures {
            let path = measure.path.as_str();
            graph.measures.insert(path, measure);
            let deps = graph.depends_on.entry(path).or_default();
            for upstream in &measure.upstreams {
                let up = upstream.path.as_str();
                match upstream.source_type {
                    SourceType::Channel => {
                        graph.channel_consumers.entry(up).or_default().push(path);
                    }
                    SourceType::Measure => {
                        deps.push(up);
                        graph.measure_consumers.entry(up).or_default().push(path);
                    }
                }
            }
        }
        graph
    }

    pub fn measure(&self, path: &str) -> Option<&'a Measure> {
        self.measures.get(path).copied()
    }

    /// Measures that must be recomputed when `changed_channels` got new values: the
    /// direct consumers of those channels plus everything downstream of them.
    pub fn impacted<I, S>(&self, changed_channels: I) -> BTreeSet<&'a str>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut impacted = BTreeSet::new();
        let mut queue = VecDeque::new();
        for channel in changed_channels {
            if let Some(consumers) = self.channel_consumers.get(channel.as_ref()) {
                queue.extend(consumers.iter().copied());
            }
        }
        while let Some(path) = queue.pop_front() {
            if !self.measures.contains_key(path) || !impacted.insert(path) {
                continue;
            }
            if let Some(consumers) = self.measure_consumers.get(path) {
                queue.extend(consumers.iter().copied());
            }
        }
        impacted
    }

    /// Kahn ordering of `nodes`, considering only edges between members of `nodes`.
    ///
    /// Nodes on a cycle never reach zero in-degree and are left out of the result.
    pub fn topological_order(&self, nodes: &BTreeSet<&'a str>) -> Vec<&'a str> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for &node in nodes {
            let deps: BTreeSet<&str> = self
                .depends_on
                .get(node)
                .into_iter()
                .flatten()
                .copied()
                .filter(|d| nodes.contains(d))
                .collect();
            in_degree.insert(node, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut ready: VecDeque<&'a str> = nodes
            .iter()
            .copied()
            .filter(|n| in_degree.get(n) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(node) = ready.pop_front() {
            order.push(node);
            for &next in dependents.get(node).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        if let Some(&n) = nodes.get(next) {
                            ready.push_back(n);
                        }
                    }
                }
            }
        }
        order
    }

    /// First node of `nodes` that can reach itself through the full dependency map.
    pub fn find_cycle(&self, nodes: &BTreeSet<&'a str>) -> Option<&'a str> {
        nodes.iter().copied().find(|&n| self.reaches(n, n))
    }

    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = self.depends_on.get(from).cloned().unwrap_or_default();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if seen.insert(node) {
                if let Some(deps) = self.depends_on.get(node) {
                    stack.extend(deps.iter().copied());
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::TransformType;
    use crate::types::DataType;

    fn m(path: &str) -> Measure {
        Measure::new(path, TransformType::AvgLatest, DataType::Double)
    }

    fn six() -> Vec<Measure> {
        vec![
            m("F").with_measure("E"),
            m("E").with_measure("C").with_measure("D"),
            m("D").with_measure("B").with_channel("ch1"),
            m("C").with_measure("A").with_channel("ch2"),
            m("B").with_channel("ch2"),
            m("A").with_channel("ch1"),
            m("idle").with_channel("ch9"),
        ]
    }

    #[test]
    fn test_impacted_follows_measure_edges() {
        let measures = six();
        let graph = DependencyGraph::new(&measures);

        let all = graph.impacted(["ch1", "ch2"]);
        assert_eq!(all.into_iter().collect::<Vec<_>>(), vec!["A", "B", "C", "D", "E", "F"]);

        let from_ch1 = graph.impacted(["ch1"]);
        assert_eq!(from_ch1.into_iter().collect::<Vec<_>>(), vec!["A", "C", "D", "E", "F"]);

        assert!(graph.impacted(["unknown"]).is_empty());
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let measures = six();
        let graph = DependencyGraph::new(&measures);
        let impacted = graph.impacted(["ch1", "ch2"]);
        let order = graph.topological_order(&impacted);

        assert_eq!(order.len(), 6);
        let pos = |p: &str| order.iter().position(|x| *x == p).unwrap();
        assert!(pos("A") < pos("C"));
        assert!(pos("B") < pos("D"));
        assert!(pos("C") < pos("E") && pos("D") < pos("E"));
        assert!(pos("E") < pos("F"));
        assert!(graph.find_cycle(&impacted).is_none());
    }

    #[test]
    fn test_mutual_dependency_is_a_cycle() {
        let measures = vec![
            m("X").with_channel("ch1").with_measure("Y"),
            m("Y").with_measure("X"),
        ];
        let graph = DependencyGraph::new(&measures);
        let impacted = graph.impacted(["ch1"]);

        assert_eq!(impacted.len(), 2);
        assert!(graph.topological_order(&impacted).is_empty());
        assert_eq!(graph.find_cycle(&impacted), Some("X"));
    }
}
