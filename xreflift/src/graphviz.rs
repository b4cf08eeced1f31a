//! GraphViz rendering of a module's reference graph: which functions call which, and which
//! globals are initialized with which function or global.

use crate::ir::{FuncId, GlobalId, Module, Value};
use itertools::Itertools;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Node {
    Function(FuncId),
    Global(GlobalId),
}

type Edge = (Node, Node, String);

struct Graph<'a> {
    module: &'a Module,
}

fn value_node(v: &Value) -> Option<Node> {
    match v {
        Value::Function(f) => Some(Node::Function(*f)),
        Value::Global(g) | Value::GlobalAddr(g) => Some(Node::Global(*g)),
        _ => None,
    }
}

fn get_nodes_and_edges(m: &Module) -> (Vec<Node>, Vec<Edge>) {
    let mut nodes: Vec<Node> = m.function_ids().into_iter().map(Node::Function).collect();
    nodes.extend(m.global_ids().into_iter().map(Node::Global));

    let mut edges: Vec<Edge> = vec![];
    for f in m.function_ids() {
        let func = m.function(f);
        for i in func.instructions() {
            let kind = &func.inst(i).kind;
            let callee = kind.called_function();
            if let Some(callee) = callee {
                edges.push((Node::Function(f), Node::Function(callee), "calls".into()));
            }
            kind.for_each_operand(|v| match value_node(v) {
                Some(Node::Function(x)) if Some(x) == callee => {}
                Some(n) => edges.push((Node::Function(f), n, "refers_to".into())),
                None => {}
            });
        }
    }
    for g in m.global_ids() {
        if let Some(n) = m.global(g).initializer.as_ref().and_then(value_node) {
            edges.push((Node::Global(g), n, "initializer".into()));
        }
    }
    // One edge per (source, target, kind), however many times the reference appears
    let edges = edges.into_iter().sorted().dedup().collect();
    (nodes, edges)
}

impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        dot::Id::new("References").unwrap()
    }
    fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
        dot::Id::new(match n {
            Node::Function(f) => format!("f{}", f.index()),
            Node::Global(g) => format!("g{}", g.index()),
        })
        .unwrap()
    }
    fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
        match n {
            Node::Function(f) => {
                let func = self.module.function(*f);
                if func.is_declaration() {
                    dot::LabelText::label(func.name.clone())
                } else {
                    dot::LabelText::escaped(format!(
                        "{}\\n{} instructions",
                        func.name,
                        func.num_instructions()
                    ))
                }
            }
            Node::Global(g) => dot::LabelText::label(format!("@{}", self.module.global(*g).name)),
        }
    }
    fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
        match n {
            Node::Function(f) if self.module.function(*f).is_declaration() => {
                Some(dot::LabelText::label("plaintext"))
            }
            Node::Function(_) => None,
            Node::Global(_) => Some(dot::LabelText::label("note")),
        }
    }
    fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
        dot::LabelText::label(e.2.clone())
    }
}

impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
    fn nodes(&self) -> dot::Nodes<'a, Node> {
        get_nodes_and_edges(self.module).0.into()
    }
    fn edges(&'a self) -> dot::Edges<'a, Edge> {
        get_nodes_and_edges(self.module).1.into()
    }
    fn source(&self, e: &Edge) -> Node {
        e.0
    }
    fn target(&self, e: &Edge) -> Node {
        e.1
    }
}

impl Module {
    /// Write a `.dot` rendering of the reference graph of this module to `w`
    pub fn write_dot<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        dot::render(&Graph { module: self }, w)
    }

    /// Generate a `.dot` file representing the reference graph of this module
    pub fn generate_dot(&self) -> String {
        let mut s: Vec<u8> = vec![];
        self.write_dot(&mut s).unwrap();
        String::from_utf8(s).unwrap()
    }
}
