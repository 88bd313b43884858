use crate::{
    analysis::ast::tree::{Ast, NodeId, NodeKind},
    core::diagnostic::Diagnostic,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Descend,
    Skip,
}

/// Per-kind handlers run over a translation unit. Unhandled kinds descend.
pub trait Visitor {
    fn enter(&mut self, ast: &Ast, node: NodeId) -> Flow;

    /// Only called for kinds where `has_exit` is true, after all children.
    fn exit(&mut self, _ast: &Ast, _node: NodeId) {}

    fn has_exit(&self, _kind: NodeKind) -> bool {
        false
    }

    /// Drains the diagnostics found so far.
    fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        Vec::new()
    }
}

enum Work {
    Visit(NodeId),
    Exit(NodeId),
}

/// Depth-first traversal with an explicit work list, so deeply nested code
/// cannot exhaust the call stack. Nodes are entered in document order.
pub fn walk(ast: &Ast, roots: &[NodeId], visitor: &mut dyn Visitor) {
    let mut pending: Vec<Work> = roots.iter().rev().map(|&id| Work::Visit(id)).collect();

    while let Some(work) = pending.pop() {
        match work {
            Work::Exit(id) => visitor.exit(ast, id),
            Work::Visit(id) => {
                if visitor.enter(ast, id) == Flow::Skip {
                    continue;
                }

                if visitor.has_exit(ast.node(id).kind) {
                    pending.push(Work::Exit(id));
                }

                pending.extend(ast.children(id).iter().rev().map(|&child| Work::Visit(child)));
            }
        }
    }
}
