//! Arena representation of clang's `-ast-dump=json` output.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub type NodeId = usize;

/// AST node kinds the analyzer dispatches on. Everything else is `Other`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum NodeKind {
    TranslationUnitDecl,
    FunctionDecl,
    #[serde(rename = "CXXMethodDecl")]
    CxxMethodDecl,
    ParmVarDecl,
    CompoundStmt,
    #[serde(rename = "CXXTryStmt")]
    CxxTryStmt,
    CallExpr,
    #[serde(rename = "CXXMemberCallExpr")]
    CxxMemberCallExpr,
    #[serde(rename = "CXXOperatorCallExpr")]
    CxxOperatorCallExpr,
    DeclRefExpr,
    MemberExpr,
    #[serde(rename = "CXXRecordDecl")]
    CxxRecordDecl,
    ClassTemplateSpecializationDecl,
    EnumDecl,
    #[default]
    #[serde(other)]
    Other,
}

impl NodeKind {
    pub fn is_function(self) -> bool {
        matches!(self, NodeKind::FunctionDecl | NodeKind::CxxMethodDecl)
    }

    pub fn is_call(self) -> bool {
        matches!(
            self,
            NodeKind::CallExpr | NodeKind::CxxMemberCallExpr | NodeKind::CxxOperatorCallExpr
        )
    }

    pub fn is_body(self) -> bool {
        matches!(self, NodeKind::CompoundStmt | NodeKind::CxxTryStmt)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Files written by the submitter, as opposed to system and library headers.
#[derive(Clone, Debug)]
pub struct UserFiles {
    root: PathBuf,
}

impl UserFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn contains(&self, file: &str) -> bool {
        Path::new(file).starts_with(&self.root)
    }

    pub fn contains_loc(&self, loc: Option<&Location>) -> bool {
        loc.is_some_and(|loc| self.contains(&loc.file))
    }
}

#[derive(Debug, Default, Deserialize)]
struct BareLoc {
    file: Option<String>,
    line: Option<u32>,
    col: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoc {
    #[serde(flatten)]
    bare: BareLoc,
    spelling_loc: Option<BareLoc>,
    expansion_loc: Option<BareLoc>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRange {
    #[serde(default)]
    begin: RawLoc,
    #[serde(default)]
    end: RawLoc,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawType {
    qual_type: Option<String>,
    desugared_qual_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDeclRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawDefinitionData {
    #[serde(rename = "isPOD", default)]
    is_pod: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    #[serde(default)]
    id: String,
    #[serde(default)]
    kind: NodeKind,
    #[serde(default)]
    loc: RawLoc,
    #[serde(default)]
    range: RawRange,
    name: Option<String>,
    previous_decl: Option<String>,
    #[serde(rename = "type")]
    ty: Option<RawType>,
    referenced_decl: Option<RawDeclRef>,
    referenced_member_decl: Option<String>,
    definition_data: Option<RawDefinitionData>,
    #[serde(default)]
    inner: Vec<RawNode>,
}

#[derive(Clone, Debug, Default)]
pub struct AstNode {
    pub kind: NodeKind,
    /// Clang's own node identifier, e.g. `0x55d0c1a2b3c4`.
    pub clang_id: String,
    pub loc: Option<Location>,
    pub name: Option<String>,
    pub previous_decl: Option<String>,
    pub qual_type: Option<String>,
    pub desugared_qual_type: Option<String>,
    /// Declaration named by a `DeclRefExpr` or a `MemberExpr`.
    pub referenced_decl: Option<String>,
    /// `Some` for record definitions only.
    pub is_pod: Option<bool>,
    pub children: Vec<NodeId>,
}

/// Clang omits `file` and `line` when they repeat the previously printed
/// location, so both are carried over in document order.
#[derive(Default)]
struct LocTracker {
    file: Option<String>,
    line: u32,
}

impl LocTracker {
    fn advance(&mut self, loc: &BareLoc) -> Option<Location> {
        if let Some(file) = &loc.file {
            self.file = Some(file.clone());
        }
        if let Some(line) = loc.line {
            self.line = line;
        }

        let column = loc.col?;
        Some(Location {
            file: self.file.clone()?,
            line: self.line,
            column,
        })
    }

    /// Macro locations come as a spelling/expansion pair. The expansion wins.
    fn resolve(&mut self, loc: &RawLoc) -> Option<Location> {
        if loc.spelling_loc.is_none() && loc.expansion_loc.is_none() {
            return self.advance(&loc.bare);
        }

        let spelling = loc.spelling_loc.as_ref().and_then(|l| self.advance(l));
        let expansion = loc.expansion_loc.as_ref().and_then(|l| self.advance(l));
        expansion.or(spelling)
    }
}

/// Flattened translation unit; node 0 is the root.
#[derive(Clone, Debug, Default)]
pub struct Ast {
    nodes: Vec<AstNode>,
}

impl Ast {
    /// Nesting depth is unbounded. Deeply nested expressions grow the
    /// deserializer's stack on the heap instead of failing.
    pub fn from_json(json: &[u8]) -> Result<Self, serde_json::Error> {
        let mut de = serde_json::Deserializer::from_slice(json);
        de.disable_recursion_limit();
        let root = RawNode::deserialize(serde_stacker::Deserializer::new(&mut de))?;
        de.end()?;
        Ok(Self::from_raw(root))
    }

    fn from_raw(root: RawNode) -> Self {
        let mut nodes: Vec<AstNode> = Vec::new();
        let mut tracker = LocTracker::default();
        let mut pending: Vec<(RawNode, Option<NodeId>)> = vec![(root, None)];

        while let Some((mut raw, parent)) = pending.pop() {
            let id = nodes.len();

            let loc = tracker.resolve(&raw.loc);
            tracker.resolve(&raw.range.begin);
            tracker.resolve(&raw.range.end);

            let inner = std::mem::take(&mut raw.inner);
            let (qual_type, desugared_qual_type) = raw
                .ty
                .map(|ty| (ty.qual_type, ty.desugared_qual_type))
                .unwrap_or_default();

            nodes.push(AstNode {
                kind: raw.kind,
                clang_id: raw.id,
                loc,
                name: raw.name,
                previous_decl: raw.previous_decl,
                qual_type,
                desugared_qual_type,
                referenced_decl: raw
                    .referenced_decl
                    .map(|decl| decl.id)
                    .or(raw.referenced_member_decl),
                is_pod: raw.definition_data.map(|data| data.is_pod),
                children: Vec::with_capacity(inner.len()),
            });

            if let Some(parent) = parent {
                nodes[parent].children.push(id);
            }

            pending.extend(inner.into_iter().rev().map(|child| (child, Some(id))));
        }

        Self { nodes }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &AstNode {
        &self.nodes[id]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &AstNode)> {
        self.nodes.iter().enumerate()
    }

    /// Top-level declarations located in user files.
    pub fn user_roots(&self, user: &UserFiles) -> Vec<NodeId> {
        if self.nodes.is_empty() {
            return Vec::new();
        }

        self.children(self.root())
            .iter()
            .copied()
            .filter(|&id| user.contains_loc(self.node(id).loc.as_ref()))
            .collect()
    }
}

const MAX_REDECLARATIONS: usize = 64;

/// Cross-references needed to resolve calls to definitions and types to records.
#[derive(Debug, Default)]
pub struct DeclIndex {
    functions: HashMap<String, NodeId>,
    definitions: HashMap<String, NodeId>,
    records: HashMap<String, bool>,
}

impl DeclIndex {
    pub fn build(ast: &Ast) -> Self {
        let mut index = DeclIndex::default();

        for (id, node) in ast.iter() {
            match node.kind {
                kind if kind.is_function() => {
                    index.functions.insert(node.clang_id.clone(), id);
                }
                NodeKind::CxxRecordDecl | NodeKind::ClassTemplateSpecializationDecl => {
                    if let (Some(name), Some(is_pod)) = (&node.name, node.is_pod) {
                        index
                            .records
                            .entry(name.clone())
                            .and_modify(|pod| *pod &= is_pod)
                            .or_insert(is_pod);
                    }
                }
                NodeKind::EnumDecl => {
                    if let Some(name) = &node.name {
                        index.records.insert(name.clone(), true);
                    }
                }
                _ => {}
            }
        }

        // Declarations precede definitions in the document, so the whole
        // function table must exist before canonical ids are computed.
        let defined: Vec<_> = index
            .functions
            .values()
            .copied()
            .filter(|&id| {
                ast.children(id)
                    .iter()
                    .any(|&child| ast.node(child).kind.is_body())
            })
            .collect();

        for id in defined {
            let canonical = index.canonical(ast, &ast.node(id).clang_id).to_string();
            index.definitions.insert(canonical, id);
        }

        index
    }

    /// First declaration of the entity declared by `clang_id`.
    fn canonical<'a>(&self, ast: &'a Ast, clang_id: &'a str) -> &'a str {
        let mut current = clang_id;

        for _ in 0..MAX_REDECLARATIONS {
            let Some(&id) = self.functions.get(current) else {
                break;
            };
            match &ast.node(id).previous_decl {
                Some(previous) => current = previous.as_str(),
                None => break,
            }
        }

        current
    }

    /// Node holding the body of the function declared by `clang_id`.
    pub fn definition(&self, ast: &Ast, clang_id: &str) -> Option<NodeId> {
        self.definitions.get(self.canonical(ast, clang_id)).copied()
    }

    /// Function declaration referenced by a call expression.
    pub fn callee(&self, ast: &Ast, call: NodeId) -> Option<NodeId> {
        let mut current = *ast.children(call).first()?;

        loop {
            if let Some(decl) = &ast.node(current).referenced_decl {
                return self.definition(ast, decl);
            }
            current = *ast.children(current).first()?;
        }
    }

    pub fn is_pod(&self, node: &AstNode) -> bool {
        let Some(ty) = node
            .desugared_qual_type
            .as_deref()
            .or(node.qual_type.as_deref())
        else {
            return true;
        };

        is_pod_type(ty, &self.records)
    }
}

const BUILTIN_WORDS: [&str; 18] = [
    "unsigned", "signed", "short", "long", "int", "char", "bool", "float", "double", "wchar_t",
    "char8_t", "char16_t", "char32_t", "__int128", "void", "size_t", "_Bool", "auto",
];

/// Whether a parameter of this type is a reference.
pub fn is_reference(ty: &str) -> bool {
    strip_qualifiers(ty).ends_with('&')
}

fn strip_qualifiers(ty: &str) -> &str {
    let mut ty = ty.trim();
    loop {
        let stripped = ty
            .strip_prefix("const ")
            .or_else(|| ty.strip_prefix("volatile "))
            .or_else(|| ty.strip_suffix(" const"))
            .or_else(|| ty.strip_suffix(" volatile"));
        match stripped {
            Some(rest) => ty = rest.trim(),
            None => return ty,
        }
    }
}

fn is_pod_type(ty: &str, records: &HashMap<String, bool>) -> bool {
    let ty = strip_qualifiers(ty);

    if ty.ends_with('*') || ty.contains("(*") || ty.ends_with('&') {
        return true;
    }
    if ty.split_whitespace().all(|word| BUILTIN_WORDS.contains(&word)) {
        return true;
    }
    if ty.starts_with("enum ") {
        return true;
    }

    let ty = ["struct ", "class ", "union "]
        .iter()
        .find_map(|keyword| ty.strip_prefix(keyword))
        .unwrap_or(ty);
    let unqualified = ty.split('<').next().unwrap_or(ty);
    let name = unqualified.rsplit("::").next().unwrap_or(unqualified).trim();

    records.get(name).copied().unwrap_or(true)
}
