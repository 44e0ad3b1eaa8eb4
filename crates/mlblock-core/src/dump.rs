//! Graphviz DOT export of a scheduled graph.
//!
//! Parameters are drawn as blue boxes, inputs as green boxes and ops as
//! rounded boxes. When a backend assignment is given, ops are grouped into
//! one cluster per backend.
//!
//! ```ignore
//! let dot = to_dot(&graph, &schedule.order, None);
//! std::fs::write("graph.dot", dot)?;
//! // Render with: dot -Tsvg graph.dot -o graph.svg
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;

use crate::Result;
use crate::graph::{Graph, LeafKind, NodeId, OpKind};

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Render the nodes in `order` (and the edges between them) as DOT.
///
/// `assignment`, when given, is parallel to `order` and names the backend
/// index of every node.
pub fn to_dot(graph: &Graph, order: &[NodeId], assignment: Option<&[usize]>) -> String {
    let mut dot = String::new();
    dot.push_str("digraph mlblock {\n");
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box, style=rounded, fontname=monospace];\n\n");

    let mut clusters: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (i, &id) in order.iter().enumerate() {
        let Some(node) = graph.get(id) else { continue };
        let title = if node.name.is_empty() {
            format!("{} {}", node.op.name(), id)
        } else {
            format!("{}\\n{}", escape(&node.name), node.op.name())
        };
        let style = match node.op {
            OpKind::Leaf(LeafKind::Param) => ", style=filled, fillcolor=lightblue",
            OpKind::Leaf(LeafKind::Input) => ", style=filled, fillcolor=palegreen",
            _ => "",
        };
        let line = format!(
            "  {id} [label=\"{title}\\n{} {}\"{style}];\n",
            node.meta.dtype, node.meta.shape
        );
        match assignment.and_then(|a| a.get(i)) {
            Some(&backend) if !node.is_leaf() => clusters.entry(backend).or_default().push(line),
            _ => dot.push_str(&line),
        }
    }

    for (backend, lines) in &clusters {
        let _ = writeln!(dot, "  subgraph cluster_{backend} {{");
        let _ = writeln!(dot, "    label=\"backend {backend}\";");
        for line in lines {
            dot.push_str("  ");
            dot.push_str(line);
        }
        dot.push_str("  }\n");
    }

    dot.push('\n');
    for &id in order {
        let Some(node) = graph.get(id) else { continue };
        for &inp in node.inputs.iter() {
            let _ = writeln!(dot, "  {inp} -> {id};");
        }
    }
    dot.push_str("}\n");
    dot
}

/// Write [`to_dot`] output to `out`.
pub fn write_dot(
    graph: &Graph,
    order: &[NodeId],
    assignment: Option<&[usize]>,
    out: &mut dyn Write,
) -> Result<()> {
    out.write_all(to_dot(graph, order, assignment).as_bytes())?;
    Ok(())
}
