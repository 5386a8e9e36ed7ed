//! Syntax tree produced by the parser

use std::fmt;
use std::rc::Rc;

use crate::script::diagnostic::Span;

/// Literal values
#[derive(Clone, Debug, PartialEq)]
pub enum LiteralValue {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
}

/// Prefix operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

/// Postfix `++` / `--`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOp {
    Increment,
    Decrement,
}

/// Binary operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add, Sub, Mul, Div, Mod, Pow,
    Eq, Ne, Lt, Le, Gt, Ge,
    And, Or,
    BitAnd, BitOr, BitXor, Shl, Shr,
    In, InstanceOf,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::In => "in",
            BinOp::InstanceOf => "instanceof",
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Assignment operators; `Compound` carries the arithmetic/bitwise operator of `op=`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Compound(BinOp),
}

/// Expression node
#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Path segments of an identifier or a property-access chain rooted at
    /// an identifier (`a.b.c` gives `["a", "b", "c"]`).
    pub fn property_path(&self) -> Option<Vec<&str>> {
        match &self.kind {
            ExprKind::Identifier(name) => Some(vec![name.as_str()]),
            ExprKind::PropertyAccess { object, property } => {
                let mut path = object.property_path()?;
                path.push(property.as_str());
                Some(path)
            }
            _ => None,
        }
    }

    /// Whether the expression may appear on the left of an assignment.
    pub fn is_assignable(&self) -> bool {
        match &self.kind {
            ExprKind::Index { .. } => true,
            _ => self.property_path().is_some(),
        }
    }
}

/// Expression types
#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Literal(LiteralValue),
    /// `[a, b, c]`
    Array(Vec<Expr>),
    Identifier(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// Postfix `x++` / `x--`
    Update {
        op: UpdateOp,
        target: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Assignment {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    PropertyAccess {
        object: Box<Expr>,
        property: String,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
}

/// Function definition, shared between the tree and the bindings that refer to it
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Block,
    pub span: Span,
}

/// Ordered statements between braces
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub statements: Vec<Stmt>,
    pub span: Span,
}

/// One `case` (or `default` when `test` is `None`) of a switch
#[derive(Clone, Debug, PartialEq)]
pub struct SwitchCase {
    pub test: Option<Expr>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// Statement node
#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// Statement types
#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    /// `let name [= value];`
    Let {
        name: String,
        value: Option<Expr>,
    },
    Expression(Expr),
    Block(Block),
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    Switch {
        subject: Expr,
        cases: Vec<SwitchCase>,
    },
    /// C-style `for (init; condition; update) body`
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    /// `for name in iterable body`
    ForIn {
        binding: String,
        iterable: Expr,
        body: Box<Stmt>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        condition: Expr,
    },
    FunctionDef(Rc<FunctionDef>),
    Return(Option<Expr>),
    Break,
    Continue,
}

/// A parsed script: top-level statements in source order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Stmt> {
        self.statements.get(index)
    }
}
