use crate::core::workflow::schema::{
    Condition, ErrorRoute, StateDefinition, StateKind, Transition, WorkflowDocument,
};
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeRef, NodeRef};
use std::collections::HashMap;
use std::fmt;

/// Node weight carrying state display information.
pub(crate) struct StateNode {
    pub name: String,
    pub kind: StateKind,
    detail: String,
}

impl fmt::Display for StateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.detail.is_empty() {
            write!(f, " [{}]", self.detail)?;
        }
        Ok(())
    }
}

/// Edge weight: a transition or an error route.
pub(crate) struct EdgeData {
    label: String,
    pub error_route: bool,
}

impl fmt::Display for EdgeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

fn state_detail(state: &StateDefinition) -> String {
    let mut parts = Vec::new();
    if let Some(unit) = &state.unit {
        parts.push(unit.unit_type.clone());
    }
    if let Some(peer) = &state.peer {
        parts.push(format!("peer:{}", peer.targets().join(",")));
    }
    if let Some(launch) = &state.launch {
        parts.push(format!("launch:{}", launch.workflow));
    }
    parts.join(" ")
}

pub(crate) fn build_graph(
    document: &WorkflowDocument,
) -> (DiGraph<StateNode, EdgeData>, HashMap<String, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut node_map: HashMap<String, NodeIndex> = HashMap::new();

    for (name, state) in &document.states {
        let idx = graph.add_node(StateNode {
            name: name.clone(),
            kind: state.kind,
            detail: state_detail(state),
        });
        node_map.insert(name.clone(), idx);
    }

    for (name, state) in &document.states {
        let from = node_map[name];
        for transition in &state.transitions {
            if let Some(&to) = node_map.get(&transition.to) {
                let label = format_transition_label(transition);
                graph.add_edge(
                    from,
                    to,
                    EdgeData {
                        label,
                        error_route: false,
                    },
                );
            }
        }
        match &state.on_error {
            Some(ErrorRoute::Fallback(target)) => {
                if let Some(&to) = node_map.get(target) {
                    graph.add_edge(
                        from,
                        to,
                        EdgeData {
                            label: "on_error".to_string(),
                            error_route: true,
                        },
                    );
                }
            }
            Some(ErrorRoute::ByKind(routes)) => {
                for (kind, target) in routes {
                    if let Some(&to) = node_map.get(target) {
                        graph.add_edge(
                            from,
                            to,
                            EdgeData {
                                label: format!("on_error:{}", kind),
                                error_route: true,
                            },
                        );
                    }
                }
            }
            None => {}
        }
    }

    (graph, node_map)
}

/// Render the state machine as a Graphviz DOT string using petgraph.
///
/// Error routes are dashed; the initial state is a box and final states are double circles.
pub fn workflow_to_dot(document: &WorkflowDocument) -> String {
    let (graph, _) = build_graph(document);
    let dot = Dot::with_attr_getters(
        &graph,
        &[],
        &|_, edge| {
            if edge.weight().error_route {
                "style=dashed".to_string()
            } else {
                String::new()
            }
        },
        &|_, node| match node.weight().kind {
            StateKind::Initial => "shape=box".to_string(),
            StateKind::Final => "shape=doublecircle".to_string(),
            StateKind::Normal => String::new(),
        },
    );
    format!("{}", dot)
}

fn format_transition_label(transition: &Transition) -> String {
    let base = if let Some(label) = &transition.label {
        label.clone()
    } else {
        match &transition.when {
            None | Some(Condition::Bool(true)) => String::new(),
            Some(Condition::Bool(false)) => "never".to_string(),
            Some(Condition::Text(expr)) | Some(Condition::Expr { expr }) => {
                format!("when: {}", truncate(expr, 60))
            }
        }
    };
    truncate(&base, 80)
}

fn truncate(value: &str, limit: usize) -> String {
    match value.char_indices().nth(limit) {
        None => value.to_string(),
        Some((cut, _)) => format!("{}...", &value[..cut]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
name: review
states:
  start:
    kind: initial
    unit: { type: echo }
    on_error: done
    transitions:
      - when: "score >= 8"
        to: done
      - to: start
  done:
    kind: final
"#;

    #[test]
    fn renders_states_transitions_and_error_routes() {
        let doc = WorkflowDocument::from_yaml_str(DOC).unwrap();
        let dot = workflow_to_dot(&doc);
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("start"));
        assert!(dot.contains("when: score >= 8"));
        assert!(dot.contains("on_error"));
        assert!(dot.contains("style=dashed"));
        assert!(dot.contains("shape=doublecircle"));

        let (graph, _) = build_graph(&doc);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate("ééééé", 2), "éé...");
        assert_eq!(truncate("abc", 5), "abc");
    }
}
