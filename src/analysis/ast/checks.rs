use std::collections::HashSet;

use crate::{
    analysis::ast::issue,
    analysis::ast::tree::{is_reference, Ast, DeclIndex, Location, NodeId, NodeKind},
    analysis::ast::walk::{Flow, Visitor},
    core::diagnostic::Diagnostic,
    core::knowledge::KnowledgeBase,
};

const NONPOD_BY_VALUE: &str = "nonpod-by-value";
const NONPOD_BY_VALUE_REC: &str = "nonpod-by-value-rec";

/// Flags parameters of non-trivial types passed by value. Copies in code
/// that may run recursively get the more severe variant.
pub struct CommonBugs<'a> {
    index: &'a DeclIndex,
    kb: &'a KnowledgeBase,
    reachable: &'a HashSet<Location>,
    issues: Vec<Diagnostic>,
}

impl<'a> CommonBugs<'a> {
    pub fn new(index: &'a DeclIndex, kb: &'a KnowledgeBase, reachable: &'a HashSet<Location>) -> Self {
        Self {
            index,
            kb,
            reachable,
            issues: Vec::new(),
        }
    }

    fn check_function(&mut self, ast: &Ast, id: NodeId) -> Flow {
        if self.index.definition(ast, &ast.node(id).clang_id) != Some(id) {
            return Flow::Skip;
        }

        let Some(loc) = &ast.node(id).loc else {
            return Flow::Descend;
        };

        let variant = if self.reachable.contains(loc) {
            NONPOD_BY_VALUE_REC
        } else {
            NONPOD_BY_VALUE
        };

        for &child in ast.children(id) {
            let param = ast.node(child);
            if param.kind != NodeKind::ParmVarDecl {
                continue;
            }

            let spelling = param.qual_type.as_deref().unwrap_or_default();
            if is_reference(spelling) || self.index.is_pod(param) {
                continue;
            }

            if let Some(template) = self.kb.custom.get(variant) {
                self.issues
                    .push(issue(loc, variant, template, &[("arg_type", spelling)]));
            }
        }

        // Nested classes may define more functions.
        Flow::Descend
    }
}

impl Visitor for CommonBugs<'_> {
    fn enter(&mut self, ast: &Ast, node: NodeId) -> Flow {
        match ast.node(node).kind {
            NodeKind::FunctionDecl | NodeKind::CxxMethodDecl => self.check_function(ast, node),
            _ => Flow::Descend,
        }
    }

    fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.issues)
    }
}
