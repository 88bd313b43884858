use std::collections::{BTreeSet, HashMap, HashSet};

use crate::{
    analysis::ast::tree::{Ast, DeclIndex, Location, NodeId, NodeKind, UserFiles},
    analysis::ast::walk::{Flow, Visitor},
};

/// Calls between functions defined in user files, keyed by definition location.
///
/// A call site whose target is ambiguous at the AST level (overloads, virtual
/// dispatch) contributes every candidate, so recursion can be over-reported.
#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    pub edges: HashMap<Location, BTreeSet<Location>>,
    pub names: HashMap<Location, String>,
    pub main: Option<Location>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recursion {
    /// Functions on some call cycle reachable from `main`.
    pub recursive: HashSet<Location>,
    /// Functions that may run inside a recursive call.
    pub reachable: HashSet<Location>,
    /// Functions never called, directly or not, from `main`. Sorted.
    pub unreachable: Vec<Location>,
}

impl CallGraph {
    pub fn add_function(&mut self, loc: Location, name: &str) {
        if name == "main" {
            self.main = Some(loc.clone());
        }
        self.names.insert(loc, name.to_string());
    }

    pub fn add_call(&mut self, caller: Location, callee: Location) {
        self.edges.entry(caller).or_default().insert(callee);
    }

    fn callees<'a>(&'a self, func: &'a Location) -> impl Iterator<Item = &'a Location> + 'a {
        self.edges.get(func).into_iter().flatten()
    }

    /// Two depth-first passes from `main`. Without `main` nothing is reported.
    pub fn find_recursive(&self) -> Recursion {
        let mut result = Recursion::default();
        let Some(main) = &self.main else {
            return result;
        };

        let others = || {
            self.names
                .keys()
                .filter(|f| *f != main)
                .collect::<HashSet<_>>()
        };

        // Every function from a back edge's target up to the top of the
        // stack belongs to the cycle.
        let mut pending = others();
        let mut stack = vec![(main, self.callees(main))];
        let mut stack_index: HashMap<&Location, usize> = HashMap::from([(main, 0)]);

        while let Some((func, mut children)) = stack.pop() {
            let Some(child) = children.next() else {
                stack_index.remove(func);
                continue;
            };
            stack.push((func, children));

            if pending.remove(child) {
                stack_index.insert(child, stack.len());
                stack.push((child, self.callees(child)));
            } else if let Some(&index) = stack_index.get(child) {
                result
                    .recursive
                    .extend(stack[index..].iter().map(|(f, _)| (*f).clone()));
            }
        }

        let mut unreachable: Vec<Location> = pending.into_iter().cloned().collect();
        unreachable.sort();
        result.unreachable = unreachable;

        // Reachability through recursion is propagated while walking.
        let mut pending = others();
        let mut stack = vec![(main, self.callees(main))];

        if result.recursive.contains(main) {
            result.reachable.insert(main.clone());
        }

        while let Some((func, mut children)) = stack.pop() {
            let Some(child) = children.next() else {
                continue;
            };
            stack.push((func, children));

            if result.reachable.contains(func) || result.recursive.contains(child) {
                result.reachable.insert(child.clone());
            }

            if pending.remove(child) {
                stack.push((child, self.callees(child)));
            }
        }

        result
    }
}

/// Builds the call graph of one translation unit.
pub struct CallGraphBuilder<'a> {
    index: &'a DeclIndex,
    user: &'a UserFiles,
    current: Vec<Location>,
    graph: CallGraph,
}

impl<'a> CallGraphBuilder<'a> {
    pub fn new(index: &'a DeclIndex, user: &'a UserFiles) -> Self {
        Self {
            index,
            user,
            current: Vec::new(),
            graph: CallGraph::default(),
        }
    }

    pub fn finish(self) -> CallGraph {
        self.graph
    }

    fn enter_function(&mut self, ast: &Ast, id: NodeId) -> Flow {
        let node = ast.node(id);

        // Declarations without a body here are not part of the graph.
        if self.index.definition(ast, &node.clang_id) != Some(id) {
            return Flow::Skip;
        }

        let Some(loc) = node.loc.clone() else {
            return Flow::Skip;
        };

        self.graph
            .add_function(loc.clone(), node.name.as_deref().unwrap_or_default());
        self.current.push(loc);
        Flow::Descend
    }

    fn enter_call(&mut self, ast: &Ast, id: NodeId) {
        let Some(caller) = self.current.last() else {
            return;
        };

        let callee = self
            .index
            .callee(ast, id)
            .and_then(|definition| ast.node(definition).loc.as_ref())
            .filter(|loc| self.user.contains(&loc.file));

        if let Some(callee) = callee {
            self.graph.add_call(caller.clone(), callee.clone());
        }
    }
}

impl Visitor for CallGraphBuilder<'_> {
    fn enter(&mut self, ast: &Ast, node: NodeId) -> Flow {
        match ast.node(node).kind {
            NodeKind::FunctionDecl | NodeKind::CxxMethodDecl => self.enter_function(ast, node),
            kind if kind.is_call() => {
                self.enter_call(ast, node);
                Flow::Descend
            }
            _ => Flow::Descend,
        }
    }

    fn exit(&mut self, _ast: &Ast, _node: NodeId) {
        self.current.pop();
    }

    fn has_exit(&self, kind: NodeKind) -> bool {
        kind.is_function()
    }
}
