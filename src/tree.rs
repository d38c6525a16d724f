// This module defines the resolved syntax tree the lowering engine consumes. The resolver that
// produces it is an external collaborator: by the time a Function reaches lowering, every
// expression carries its numeric format, every variable its storage category and
// predictability, and every call its callee signature. The engine trusts this contract and does
// not re-validate it. Nodes optionally carry a source position which becomes a debug marker in
// the instruction stream when position markers are enabled.

//! Resolved input tree.

use crate::core::value::Format;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub u32);

impl std::fmt::Display for VariableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a variable is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCategory {
    Local,
    Parameter,
    /// Field of an object, addressed relative to a pointer.
    Member,
    /// Static data.
    Global,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub format: Format,
    pub category: StorageCategory,
    /// The location of the variable can be tracked statically.
    pub predictable: bool,
    /// Byte offset of a member inside its object.
    pub offset: i32,
}

impl Variable {
    pub fn local(name: &str, format: Format) -> Self {
        Self {
            name: name.to_string(),
            format,
            category: StorageCategory::Local,
            predictable: true,
            offset: 0,
        }
    }

    pub fn parameter(name: &str, format: Format) -> Self {
        Self {
            category: StorageCategory::Parameter,
            ..Self::local(name, format)
        }
    }

    pub fn member(name: &str, format: Format, offset: i32) -> Self {
        Self {
            category: StorageCategory::Member,
            predictable: false,
            offset,
            ..Self::local(name, format)
        }
    }

    pub fn global(name: &str, format: Format) -> Self {
        Self {
            category: StorageCategory::Global,
            predictable: false,
            ..Self::local(name, format)
        }
    }

    pub fn unpredictable(mut self) -> Self {
        self.predictable = false;
        self
    }
}

/// Shape of a value: a scalar or a pack of members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    Scalar(Format),
    Pack(Vec<ValueType>),
}

impl ValueType {
    /// Scalar members in declaration order, nested packs flattened.
    pub fn flatten(&self) -> Vec<Format> {
        match self {
            ValueType::Scalar(format) => vec![*format],
            ValueType::Pack(members) => members.iter().flat_map(ValueType::flatten).collect(),
        }
    }

    pub fn size(&self) -> u32 {
        self.flatten().iter().map(|format| format.bytes().max(8)).sum()
    }
}

/// Declared parameter, possibly a pack whose members are separate variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterShape {
    Scalar(VariableId),
    Pack(Vec<ParameterShape>),
}

impl ParameterShape {
    pub fn flatten(&self) -> Vec<VariableId> {
        match self {
            ParameterShape::Scalar(variable) => vec![*variable],
            ParameterShape::Pack(members) => {
                members.iter().flat_map(ParameterShape::flatten).collect()
            }
        }
    }
}

/// Callee signature as seen from a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub parameters: Vec<ValueType>,
    pub returns: Option<ValueType>,
    /// The callee takes an implicit receiver pointer.
    pub has_self: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    ShiftLeft,
    ShiftRight,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub position: Option<SourcePosition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Integer { value: i64, format: Format },
    Decimal(f64),
    Variable(VariableId),
    /// Member of the object `object` points to.
    Access { object: Box<Node>, member: VariableId },
    /// Element `index` of the array `object` points to, `stride` bytes apart.
    Element {
        object: Box<Node>,
        index: Box<Node>,
        stride: u8,
        format: Format,
    },
    Binary {
        operator: BinaryOperator,
        left: Box<Node>,
        right: Box<Node>,
        format: Format,
    },
    Negate(Box<Node>),
    Assign { target: Box<Node>, value: Box<Node> },
    Compare {
        comparison: Comparison,
        left: Box<Node>,
        right: Box<Node>,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    If {
        condition: Box<Node>,
        body: Vec<Node>,
        otherwise: Option<Vec<Node>>,
    },
    Loop {
        initialization: Vec<Node>,
        condition: Option<Box<Node>>,
        action: Vec<Node>,
        body: Vec<Node>,
    },
    Call {
        signature: Signature,
        receiver: Option<Box<Node>>,
        arguments: Vec<Node>,
    },
    Pack(Vec<Node>),
    Return(Option<Box<Node>>),
    Stop,
    Continue,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            position: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.position = Some(SourcePosition { line, column });
        self
    }

    pub fn integer(value: i64, format: Format) -> Self {
        Self::new(NodeKind::Integer { value, format })
    }

    pub fn decimal(value: f64) -> Self {
        Self::new(NodeKind::Decimal(value))
    }

    pub fn variable(variable: VariableId) -> Self {
        Self::new(NodeKind::Variable(variable))
    }

    pub fn binary(operator: BinaryOperator, left: Node, right: Node, format: Format) -> Self {
        Self::new(NodeKind::Binary {
            operator,
            left: Box::new(left),
            right: Box::new(right),
            format,
        })
    }

    pub fn assign(target: Node, value: Node) -> Self {
        Self::new(NodeKind::Assign {
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    pub fn compare(comparison: Comparison, left: Node, right: Node) -> Self {
        Self::new(NodeKind::Compare {
            comparison,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn element(object: Node, index: Node, stride: u8, format: Format) -> Self {
        Self::new(NodeKind::Element {
            object: Box::new(object),
            index: Box::new(index),
            stride,
            format,
        })
    }

    pub fn ret(value: Option<Node>) -> Self {
        Self::new(NodeKind::Return(value.map(Box::new)))
    }

    /// Call `visit` on every node of this subtree, this one first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Node)) {
        self.traverse(visit, false);
    }

    /// Like [`Node::walk`], but skips variables that are only assigned, not read.
    pub fn walk_reads<'a>(&'a self, visit: &mut dyn FnMut(&'a Node)) {
        self.traverse(visit, true);
    }

    fn traverse<'a>(&'a self, visit: &mut dyn FnMut(&'a Node), reads_only: bool) {
        visit(self);
        match &self.kind {
            NodeKind::Integer { .. }
            | NodeKind::Decimal(_)
            | NodeKind::Variable(_)
            | NodeKind::Stop
            | NodeKind::Continue => {}
            NodeKind::Access { object, .. } => object.traverse(visit, reads_only),
            NodeKind::Element { object, index, .. } => {
                object.traverse(visit, reads_only);
                index.traverse(visit, reads_only);
            }
            NodeKind::Negate(inner) | NodeKind::Not(inner) => inner.traverse(visit, reads_only),
            NodeKind::Binary { left, right, .. }
            | NodeKind::Compare { left, right, .. }
            | NodeKind::And(left, right)
            | NodeKind::Or(left, right) => {
                left.traverse(visit, reads_only);
                right.traverse(visit, reads_only);
            }
            NodeKind::Assign { target, value } => {
                if !(reads_only && matches!(target.kind, NodeKind::Variable(_))) {
                    target.traverse(visit, reads_only);
                }
                value.traverse(visit, reads_only);
            }
            NodeKind::If {
                condition,
                body,
                otherwise,
            } => {
                condition.traverse(visit, reads_only);
                traverse_all(body, visit, reads_only);
                if let Some(otherwise) = otherwise {
                    traverse_all(otherwise, visit, reads_only);
                }
            }
            NodeKind::Loop {
                initialization,
                condition,
                action,
                body,
            } => {
                traverse_all(initialization, visit, reads_only);
                if let Some(condition) = condition {
                    condition.traverse(visit, reads_only);
                }
                traverse_all(action, visit, reads_only);
                traverse_all(body, visit, reads_only);
            }
            NodeKind::Call {
                receiver,
                arguments,
                ..
            } => {
                if let Some(receiver) = receiver {
                    receiver.traverse(visit, reads_only);
                }
                traverse_all(arguments, visit, reads_only);
            }
            NodeKind::Pack(members) => traverse_all(members, visit, reads_only),
            NodeKind::Return(value) => {
                if let Some(value) = value {
                    value.traverse(visit, reads_only);
                }
            }
        }
    }
}

/// Walk a list of nodes in order.
pub fn walk_all<'a>(nodes: &'a [Node], visit: &mut dyn FnMut(&'a Node)) {
    traverse_all(nodes, visit, false);
}

fn traverse_all<'a>(nodes: &'a [Node], visit: &mut dyn FnMut(&'a Node), reads_only: bool) {
    for node in nodes {
        node.traverse(visit, reads_only);
    }
}

/// A function ready for lowering.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    /// Variables indexed by `VariableId`.
    pub variables: Vec<Variable>,
    pub parameters: Vec<ParameterShape>,
    /// The function receives an implicit receiver pointer.
    pub has_self: bool,
    pub returns: Option<ValueType>,
    pub body: Vec<Node>,
}

impl Function {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            variables: Vec::new(),
            parameters: Vec::new(),
            has_self: false,
            returns: None,
            body: Vec::new(),
        }
    }

    pub fn declare(&mut self, variable: Variable) -> VariableId {
        let is_parameter = variable.category == StorageCategory::Parameter;
        self.variables.push(variable);
        let id = VariableId(self.variables.len() as u32 - 1);
        if is_parameter {
            self.parameters.push(ParameterShape::Scalar(id));
        }
        id
    }

    pub fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.variables.get(id.0 as usize)
    }

    pub fn signature(&self) -> Signature {
        let parameter_type = |shape: &ParameterShape| -> ValueType {
            fn shape_type(function: &Function, shape: &ParameterShape) -> ValueType {
                match shape {
                    ParameterShape::Scalar(id) => ValueType::Scalar(
                        function.variable(*id).map_or(Format::I64, |variable| variable.format),
                    ),
                    ParameterShape::Pack(members) => ValueType::Pack(
                        members.iter().map(|member| shape_type(function, member)).collect(),
                    ),
                }
            }
            shape_type(self, shape)
        };
        Signature {
            name: self.name.clone(),
            parameters: self.parameters.iter().map(parameter_type).collect(),
            returns: self.returns.clone(),
            has_self: self.has_self,
        }
    }
}
