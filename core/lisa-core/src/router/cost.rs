//! Topology graphs and per-step cost estimates for routed runs.

use crate::error::{LisaError, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopologyRole {
    Planner,
    Workers,
    Reviewer,
}

impl TopologyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Workers => "workers",
            Self::Reviewer => "reviewer",
        }
    }

    /// Added to the 1.0 base multiplier when the role is present.
    fn cost_weight(&self) -> f64 {
        match self {
            Self::Planner => 0.2,
            Self::Workers => 0.6,
            Self::Reviewer => 0.25,
        }
    }
}

impl Serialize for TopologyRole {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Comma-separated roles, deduplicated in order. Empty input is no topology.
pub fn parse_topology_roles(raw: &str) -> Result<Vec<TopologyRole>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut roles = Vec::new();
    for part in raw.split(',') {
        let role = match part.trim().to_ascii_lowercase().as_str() {
            "" => continue,
            "planner" => TopologyRole::Planner,
            "workers" => TopologyRole::Workers,
            "reviewer" => TopologyRole::Reviewer,
            other => {
                return Err(LisaError::invalid(
                    "invalid_topology",
                    format!("invalid --topology role: {other} (expected planner|workers|reviewer)"),
                ))
            }
        };
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    if roles.is_empty() {
        return Err(LisaError::invalid(
            "invalid_topology",
            "invalid --topology: expected comma-separated roles",
        ));
    }
    Ok(roles)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyNode {
    pub id: &'static str,
    pub role: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyEdge {
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyGraph {
    pub roles: Vec<TopologyRole>,
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
}

/// Planner fans out to two workers, workers feed the reviewer. Without
/// workers the planner feeds the reviewer directly.
pub fn build_topology_graph(roles: &[TopologyRole]) -> TopologyGraph {
    let has = |role| roles.contains(&role);
    let (planner, workers, reviewer) = (
        has(TopologyRole::Planner),
        has(TopologyRole::Workers),
        has(TopologyRole::Reviewer),
    );
    let node = |id, role| TopologyNode { id, role };
    let edge = |from, to| TopologyEdge { from, to };

    let mut nodes = Vec::new();
    if planner {
        nodes.push(node("planner", "planner"));
    }
    if workers {
        nodes.push(node("worker-1", "worker"));
        nodes.push(node("worker-2", "worker"));
    }
    if reviewer {
        nodes.push(node("reviewer", "reviewer"));
    }

    let mut edges = Vec::new();
    if planner && workers {
        edges.push(edge("planner", "worker-1"));
        edges.push(edge("planner", "worker-2"));
    }
    if workers && reviewer {
        edges.push(edge("worker-1", "reviewer"));
        edges.push(edge("worker-2", "reviewer"));
    }
    if planner && reviewer && !workers {
        edges.push(edge("planner", "reviewer"));
    }
    TopologyGraph {
        roles: roles.to_vec(),
        nodes,
        edges,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cost Estimate
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepCost {
    pub step: &'static str,
    pub tokens: i64,
    pub seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub goal: String,
    pub mode: String,
    /// Two-decimal string, e.g. `"1.80"`.
    pub topology_multiplier: String,
    pub total_tokens: i64,
    pub total_seconds: i64,
    pub steps: Vec<StepCost>,
}

/// Base costs for the routed step sequence.
const BASE_STEPS: [(&str, i64, i64); 6] = [
    ("preflight", 60, 1),
    ("spawn", 140, 2),
    ("monitor", 180, 35),
    ("capture", 220, 3),
    ("handoff", 90, 1),
    ("cleanup", 40, 1),
];

pub fn topology_multiplier(roles: &[TopologyRole]) -> f64 {
    [TopologyRole::Workers, TopologyRole::Planner, TopologyRole::Reviewer]
        .iter()
        .filter(|role| roles.contains(role))
        .fold(1.0, |acc, role| acc + role.cost_weight())
}

pub fn estimate_route_cost(goal: &str, mode: &str, budget: i64, roles: &[TopologyRole]) -> CostEstimate {
    let mut steps: Vec<StepCost> = BASE_STEPS
        .iter()
        .map(|&(step, tokens, seconds)| StepCost { step, tokens, seconds })
        .collect();
    if mode == "interactive" {
        steps[2].tokens = 220;
        steps[2].seconds = 50;
    }
    if goal == "nested" {
        steps[1].tokens = 180;
        steps[2].tokens = 260;
        steps[2].seconds = 65;
    }
    if budget > 0 {
        steps[3].tokens = (budget / 2).clamp(80, 220);
    }

    let multiplier = topology_multiplier(roles);
    for step in &mut steps {
        step.tokens = (step.tokens as f64 * multiplier) as i64;
        step.seconds = (step.seconds as f64 * multiplier) as i64;
    }
    CostEstimate {
        goal: goal.to_string(),
        mode: mode.to_string(),
        topology_multiplier: format!("{multiplier:.2}"),
        total_tokens: steps.iter().map(|s| s.tokens).sum(),
        total_seconds: steps.iter().map(|s| s.seconds).sum(),
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roles_dedupes_and_validates() {
        let roles = parse_topology_roles("Planner, workers,planner").unwrap();
        assert_eq!(roles, vec![TopologyRole::Planner, TopologyRole::Workers]);
        assert!(parse_topology_roles("").unwrap().is_empty());
        assert_eq!(parse_topology_roles(" , ").unwrap_err().code(), "invalid_topology");
        assert_eq!(parse_topology_roles("boss").unwrap_err().code(), "invalid_topology");
    }

    #[test]
    fn test_graph_edges() {
        let full = build_topology_graph(&[TopologyRole::Planner, TopologyRole::Workers, TopologyRole::Reviewer]);
        assert_eq!(full.nodes.len(), 4);
        assert_eq!(full.edges.len(), 4);

        let direct = build_topology_graph(&[TopologyRole::Planner, TopologyRole::Reviewer]);
        assert_eq!(
            direct.edges,
            vec![TopologyEdge {
                from: "planner",
                to: "reviewer"
            }]
        );
    }

    #[test]
    fn test_cost_base_and_budget_cap() {
        let est = estimate_route_cost("analysis", "exec", 0, &[]);
        assert_eq!(est.topology_multiplier, "1.00");
        assert_eq!(est.total_tokens, 60 + 140 + 180 + 220 + 90 + 40);
        assert_eq!(estimate_route_cost("exec", "exec", 100, &[]).steps[3].tokens, 80);
        assert_eq!(estimate_route_cost("exec", "exec", 300, &[]).steps[3].tokens, 150);
        assert_eq!(estimate_route_cost("exec", "exec", 1000, &[]).steps[3].tokens, 220);
    }

    #[test]
    fn test_cost_topology_and_goal_adjustments() {
        let roles = [TopologyRole::Planner, TopologyRole::Workers, TopologyRole::Reviewer];
        let est = estimate_route_cost("nested", "interactive", 0, &roles);
        assert_eq!(est.topology_multiplier, "2.05");
        let m = topology_multiplier(&roles);
        let monitor = &est.steps[2];
        assert_eq!(monitor.tokens, (260.0 * m) as i64);
        assert_eq!(monitor.seconds, (65.0 * m) as i64);
        assert_eq!(est.steps[1].tokens, (180.0 * m) as i64);
    }
}
