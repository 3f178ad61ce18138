use super::types::Type;

/// Abstract syntax tree node handed to the compiler by the parser.
///
/// Every node carries its 1-based source position so compile errors can
/// point back at the contract text.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub line: u32,
    pub column: u32,
}

/// A declared variable, function parameter or contract data field.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDef {
    pub name: String,
    pub ty: Type,
    /// Initializer expression (`int a = 5`); always `None` for parameters.
    pub init: Option<Node>,
}

/// `elif cond { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct ElifBranch {
    pub cond: Node,
    pub body: Node,
}

/// `case v1, v2 { body }` inside a `switch`.
#[derive(Debug, Clone, PartialEq)]
pub struct Case {
    pub values: Vec<Node>,
    pub body: Node,
}

/// `key: value` member of a map or object literal, or a named argument of a
/// contract call.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub value: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Bool(bool),
    Str(String),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Assign => "=",
            BinaryOp::AddAssign => "+=",
            BinaryOp::SubAssign => "-=",
            BinaryOp::MulAssign => "*=",
            BinaryOp::DivAssign => "/=",
            BinaryOp::ModAssign => "%=",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// Operators whose left operand is a place to write through.
    pub fn is_assign(self) -> bool {
        matches!(
            self,
            BinaryOp::Assign
                | BinaryOp::AddAssign
                | BinaryOp::SubAssign
                | BinaryOp::MulAssign
                | BinaryOp::DivAssign
                | BinaryOp::ModAssign
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    // =========================================================================
    // Structure
    // =========================================================================
    /// `contract Name { ... }`, optionally marked read-only.
    Contract {
        name: String,
        read: bool,
        body: Box<Node>,
    },

    /// `{ ... }`. Only the outermost block of a contract has `params`
    /// (its `data` section).
    Block {
        params: Vec<VarDef>,
        statements: Vec<Node>,
    },

    /// `int a, str b = "x"`
    Vars(Vec<VarDef>),

    /// `func name(params) result { body }`
    Func {
        name: String,
        params: Vec<VarDef>,
        result: Option<Type>,
        body: Box<Node>,
    },

    /// `return` / `return expr`
    Return(Option<Box<Node>>),

    // =========================================================================
    // Expressions
    // =========================================================================
    Literal(Literal),

    /// Variable read, or the target of an assignment when it is the left
    /// operand of an assigning [`BinaryOp`].
    Var(String),

    /// `name[i][j]...`
    Index {
        name: String,
        indexes: Vec<Node>,
    },

    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },

    /// `cond ? left : right`
    Question {
        cond: Box<Node>,
        left: Box<Node>,
        right: Box<Node>,
    },

    /// `Name(args)` resolving to a contract function, a built-in or a host
    /// function.
    Call {
        name: String,
        args: Vec<Node>,
    },

    /// `@Name(par: value, ...)`
    CallContract {
        name: String,
        args: Vec<Entry>,
    },

    /// `$name`
    Env(String),

    // =========================================================================
    // Composites
    // =========================================================================
    /// `[a, b, c]` with one element type.
    Array(Vec<Node>),

    /// `{"k": v, ...}` with one value type.
    Map(Vec<Entry>),

    /// `obj{k: v, ...}` with heterogeneous values.
    Object(Vec<Entry>),

    /// `obj[a, b, ...]`
    ObjectList(Vec<Node>),

    /// `obj2list(expr)` splits an object into a list of single-key objects.
    ObjToList(Box<Node>),

    // =========================================================================
    // Control flow
    // =========================================================================
    If {
        cond: Box<Node>,
        body: Box<Node>,
        elifs: Vec<ElifBranch>,
        otherwise: Option<Box<Node>>,
    },

    While {
        cond: Box<Node>,
        body: Box<Node>,
    },

    /// `for value, index in collection { body }`
    For {
        value: String,
        index: Option<String>,
        collection: Box<Node>,
        body: Box<Node>,
    },

    /// `for var in from..to { body }`, inclusive of `to`.
    ForRange {
        var: String,
        from: Box<Node>,
        to: Box<Node>,
        body: Box<Node>,
    },

    Switch {
        subject: Box<Node>,
        cases: Vec<Case>,
        default: Option<Box<Node>>,
    },

    Break,
    Continue,
}

impl Node {
    pub fn new(kind: NodeKind, line: u32, column: u32) -> Self {
        Self { kind, line, column }
    }

    /// Sets the source position.
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    fn bare(kind: NodeKind) -> Self {
        Self::new(kind, 1, 1)
    }

    pub fn contract(name: &str, read: bool, params: Vec<VarDef>, statements: Vec<Node>) -> Self {
        Self::bare(NodeKind::Contract {
            name: name.to_string(),
            read,
            body: Box::new(Self::bare(NodeKind::Block { params, statements })),
        })
    }

    pub fn block(statements: Vec<Node>) -> Self {
        Self::bare(NodeKind::Block {
            params: Vec::new(),
            statements,
        })
    }

    pub fn int(value: i64) -> Self {
        Self::bare(NodeKind::Literal(Literal::Int(value)))
    }

    pub fn boolean(value: bool) -> Self {
        Self::bare(NodeKind::Literal(Literal::Bool(value)))
    }

    pub fn float(value: f64) -> Self {
        Self::bare(NodeKind::Literal(Literal::Float(value)))
    }

    pub fn str(value: &str) -> Self {
        Self::bare(NodeKind::Literal(Literal::Str(value.to_string())))
    }

    pub fn var(name: &str) -> Self {
        Self::bare(NodeKind::Var(name.to_string()))
    }

    pub fn declare(name: &str, ty: Type, init: Option<Node>) -> Self {
        Self::bare(NodeKind::Vars(vec![VarDef::new(name, ty, init)]))
    }

    pub fn binary(op: BinaryOp, left: Node, right: Node) -> Self {
        Self::bare(NodeKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn assign(name: &str, value: Node) -> Self {
        Self::binary(BinaryOp::Assign, Self::var(name), value)
    }

    /// `name[i]... = value`
    pub fn assign_index(name: &str, indexes: Vec<Node>, value: Node) -> Self {
        Self::binary(BinaryOp::Assign, Self::index(name, indexes), value)
    }

    pub fn unary(op: UnaryOp, operand: Node) -> Self {
        Self::bare(NodeKind::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    pub fn ret(expr: Option<Node>) -> Self {
        Self::bare(NodeKind::Return(expr.map(Box::new)))
    }

    pub fn call(name: &str, args: Vec<Node>) -> Self {
        Self::bare(NodeKind::Call {
            name: name.to_string(),
            args,
        })
    }

    pub fn index(name: &str, indexes: Vec<Node>) -> Self {
        Self::bare(NodeKind::Index {
            name: name.to_string(),
            indexes,
        })
    }

    pub fn func(name: &str, params: Vec<VarDef>, result: Option<Type>, body: Vec<Node>) -> Self {
        Self::bare(NodeKind::Func {
            name: name.to_string(),
            params,
            result,
            body: Box::new(Self::block(body)),
        })
    }

    pub fn while_loop(cond: Node, body: Vec<Node>) -> Self {
        Self::bare(NodeKind::While {
            cond: Box::new(cond),
            body: Box::new(Self::block(body)),
        })
    }

    pub fn if_else(cond: Node, body: Vec<Node>, otherwise: Option<Vec<Node>>) -> Self {
        Self::bare(NodeKind::If {
            cond: Box::new(cond),
            body: Box::new(Self::block(body)),
            elifs: Vec::new(),
            otherwise: otherwise.map(|stmts| Box::new(Self::block(stmts))),
        })
    }

    pub fn question(cond: Node, left: Node, right: Node) -> Self {
        Self::bare(NodeKind::Question {
            cond: Box::new(cond),
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn array(items: Vec<Node>) -> Self {
        Self::bare(NodeKind::Array(items))
    }

    pub fn map(entries: Vec<(&str, Node)>) -> Self {
        Self::bare(NodeKind::Map(
            entries.into_iter().map(|(k, v)| Entry::new(k, v)).collect(),
        ))
    }

    pub fn call_contract(name: &str, args: Vec<(&str, Node)>) -> Self {
        Self::bare(NodeKind::CallContract {
            name: name.to_string(),
            args: args.into_iter().map(|(k, v)| Entry::new(k, v)).collect(),
        })
    }

    pub fn env(name: &str) -> Self {
        Self::bare(NodeKind::Env(name.to_string()))
    }

    pub fn brk() -> Self {
        Self::bare(NodeKind::Break)
    }

    pub fn cont() -> Self {
        Self::bare(NodeKind::Continue)
    }

    pub fn with_kind(kind: NodeKind) -> Self {
        Self::bare(kind)
    }
}

impl VarDef {
    pub fn new(name: &str, ty: Type, init: Option<Node>) -> Self {
        Self {
            name: name.to_string(),
            ty,
            init,
        }
    }

    pub fn param(name: &str, ty: Type) -> Self {
        Self::new(name, ty, None)
    }
}

impl Entry {
    pub fn new(key: &str, value: Node) -> Self {
        Self {
            key: key.to_string(),
            value,
        }
    }
}
