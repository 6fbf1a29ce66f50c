use std::collections::{HashMap, HashSet, VecDeque};

use dqs_common::{DqsError, Result, SetIdentifier};
use serde::{Deserialize, Serialize};

/// Compiled query DAG handed to the scheduler.
///
/// Nodes reference their inputs by logical name: either a declared source or
/// another node's name (each node produces exactly one output set named after
/// itself). The scheduler reads the plan and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalPlan {
    /// Database that hosts scheduler-created sets for this plan.
    pub database: String,
    #[serde(default)]
    pub sources: Vec<SourceSet>,
    pub nodes: Vec<PlanNode>,
}

/// Storage-owned input of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSet {
    pub name: String,
    pub set: SetIdentifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub name: String,
    pub op: Operator,
    pub inputs: Vec<String>,
    /// Storage set receiving this node's output. Terminal nodes without a
    /// sink write to a job-scoped set named after the node.
    #[serde(default)]
    pub sink: Option<SetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operator {
    Filter {
        predicate: String,
    },
    Project {
        columns: Vec<String>,
    },
    Apply {
        function: String,
    },
    Aggregate {
        group_keys: Vec<String>,
        aggregates: Vec<String>,
    },
    Join {
        left_keys: Vec<String>,
        right_keys: Vec<String>,
    },
}

impl Operator {
    /// Row-at-a-time operators that can share one pipeline.
    pub fn is_pipelined(&self) -> bool {
        matches!(
            self,
            Operator::Filter { .. } | Operator::Project { .. } | Operator::Apply { .. }
        )
    }

    pub fn arity(&self) -> usize {
        match self {
            Operator::Join { .. } => 2,
            _ => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Filter { .. } => "Filter",
            Operator::Project { .. } => "Project",
            Operator::Apply { .. } => "Apply",
            Operator::Aggregate { .. } => "Aggregate",
            Operator::Join { .. } => "Join",
        }
    }
}

impl PlanNode {
    pub fn filter(name: &str, input: &str, predicate: &str) -> Self {
        Self::unary(
            name,
            input,
            Operator::Filter {
                predicate: predicate.to_string(),
            },
        )
    }

    pub fn project(name: &str, input: &str, columns: &[&str]) -> Self {
        Self::unary(
            name,
            input,
            Operator::Project {
                columns: to_strings(columns),
            },
        )
    }

    pub fn apply(name: &str, input: &str, function: &str) -> Self {
        Self::unary(
            name,
            input,
            Operator::Apply {
                function: function.to_string(),
            },
        )
    }

    pub fn aggregate(name: &str, input: &str, group_keys: &[&str], aggregates: &[&str]) -> Self {
        Self::unary(
            name,
            input,
            Operator::Aggregate {
                group_keys: to_strings(group_keys),
                aggregates: to_strings(aggregates),
            },
        )
    }

    pub fn join(
        name: &str,
        left: &str,
        right: &str,
        left_keys: &[&str],
        right_keys: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            op: Operator::Join {
                left_keys: to_strings(left_keys),
                right_keys: to_strings(right_keys),
            },
            inputs: vec![left.to_string(), right.to_string()],
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: SetIdentifier) -> Self {
        self.sink = Some(sink);
        self
    }

    fn unary(name: &str, input: &str, op: Operator) -> Self {
        Self {
            name: name.to_string(),
            op,
            inputs: vec![input.to_string()],
            sink: None,
        }
    }
}

fn to_strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

impl LogicalPlan {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            sources: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_source(mut self, name: &str, set: SetIdentifier) -> Self {
        self.sources.push(SourceSet {
            name: name.to_string(),
            set,
        });
        self
    }

    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn source(&self, name: &str) -> Option<&SourceSet> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Node indexes consuming each logical name, in plan order.
    pub fn consumers(&self) -> HashMap<&str, Vec<usize>> {
        let mut out: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            for input in &node.inputs {
                let list = out.entry(input.as_str()).or_default();
                if !list.contains(&idx) {
                    list.push(idx);
                }
            }
        }
        out
    }

    /// Structural checks run before anything is scheduled.
    ///
    /// # Errors
    /// [`DqsError::Plan`] naming the offending node or missing set.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(DqsError::Plan("plan has no computation nodes".to_string()));
        }
        let mut seen = HashSet::new();
        for s in &self.sources {
            if !seen.insert(s.name.as_str()) {
                return Err(DqsError::Plan(format!("duplicate source '{}'", s.name)));
            }
        }
        for n in &self.nodes {
            if self.source(&n.name).is_some() {
                return Err(DqsError::Plan(format!(
                    "node '{}' shadows a source of the same name",
                    n.name
                )));
            }
            if !seen.insert(n.name.as_str()) {
                return Err(DqsError::Plan(format!("duplicate node '{}'", n.name)));
            }
        }
        for n in &self.nodes {
            if n.inputs.len() != n.op.arity() {
                return Err(DqsError::Plan(format!(
                    "node '{}' ({}) expects {} input(s), got {}",
                    n.name,
                    n.op.name(),
                    n.op.arity(),
                    n.inputs.len()
                )));
            }
            for input in &n.inputs {
                if self.source(input).is_none() && self.node_index(input).is_none() {
                    return Err(DqsError::Plan(format!(
                        "node '{}' consumes set '{input}' which is neither a source nor produced by any node",
                        n.name
                    )));
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Kahn ordering of node indexes; errors on cycles.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let consumers = self.consumers();
        let mut pending = self
            .nodes
            .iter()
            .map(|n| {
                n.inputs
                    .iter()
                    .filter(|i| self.node_index(i).is_some())
                    .count()
            })
            .collect::<Vec<_>>();
        let mut queue = pending
            .iter()
            .enumerate()
            .filter(|(_, p)| **p == 0)
            .map(|(i, _)| i)
            .collect::<VecDeque<_>>();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            let name = self.nodes[idx].name.as_str();
            for c in consumers.get(name).into_iter().flatten() {
                // A join reading the same node twice counts it once per input.
                let hits = self.nodes[*c].inputs.iter().filter(|i| *i == name).count();
                pending[*c] -= hits;
                if pending[*c] == 0 {
                    queue.push_back(*c);
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !order.contains(i))
                .map(|(_, n)| n.name.as_str())
                .collect::<Vec<_>>();
            return Err(DqsError::Plan(format!(
                "plan contains a dependency cycle through: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> LogicalPlan {
        LogicalPlan::new("db").with_source("s", SetIdentifier::new("d", "s"))
    }

    #[test]
    fn valid_chain_orders_topologically() {
        let plan = base()
            .with_node(PlanNode::project("p", "f", &["a"]))
            .with_node(PlanNode::filter("f", "s", "a > 1"));
        plan.validate().expect("valid");
        assert_eq!(plan.topological_order().expect("order"), vec![1, 0]);
    }

    #[test]
    fn missing_input_names_the_set() {
        let plan = base().with_node(PlanNode::filter("f", "ghost", "true"));
        let err = plan.validate().expect_err("missing");
        assert_eq!(err.kind(), "plan");
        assert!(err.to_string().contains("'ghost'"));
    }

    #[test]
    fn cycles_are_rejected() {
        let plan = base()
            .with_node(PlanNode::filter("a", "b", "true"))
            .with_node(PlanNode::filter("b", "a", "true"));
        let err = plan.validate().expect_err("cycle");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn arity_and_duplicates_are_checked() {
        let mut bad_join = PlanNode::join("j", "s", "s", &["k"], &["k"]);
        bad_join.inputs.pop();
        assert!(base().with_node(bad_join).validate().is_err());

        let dup = base()
            .with_node(PlanNode::filter("f", "s", "true"))
            .with_node(PlanNode::filter("f", "s", "false"));
        assert!(dup.validate().is_err());

        let shadow = base().with_node(PlanNode::filter("s", "s", "true"));
        assert!(shadow.validate().is_err());
        assert!(LogicalPlan::new("db").validate().is_err());
    }

    #[test]
    fn self_join_on_one_node_is_ordered() {
        let plan = base()
            .with_node(PlanNode::filter("f", "s", "true"))
            .with_node(PlanNode::join("j", "f", "f", &["k"], &["k"]));
        assert_eq!(plan.topological_order().expect("order"), vec![0, 1]);
    }

    #[test]
    fn plan_json_is_stable() {
        let json = r#"{
            "database": "db",
            "sources": [{"name": "s", "set": {"database": "d", "set_name": "s"}}],
            "nodes": [
                {"name": "f", "op": {"kind": "filter", "predicate": "x > 1"}, "inputs": ["s"]}
            ]
        }"#;
        let plan: LogicalPlan = serde_json::from_str(json).expect("decode");
        plan.validate().expect("valid");
        assert!(plan.nodes[0].op.is_pipelined());
        assert!(plan.nodes[0].sink.is_none());
    }
}
