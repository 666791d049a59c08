//! Script AST consumed by the evaluator.
//!
//! The parser that produces these nodes lives outside this crate; the types
//! here only describe what the evaluator understands.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Source location of a statement, used for error context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

// リテラル
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    /// `raw` literals resolve `{{name}}` placeholders leniently when evaluated.
    String { value: String, raw: bool },
    Boolean(bool),
    Null,
}

impl Literal {
    pub fn string(value: impl Into<String>) -> Self {
        Literal::String {
            value: value.into(),
            raw: false,
        }
    }

    pub fn raw_string(value: impl Into<String>) -> Self {
        Literal::String {
            value: value.into(),
            raw: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessThanEqual,
    GreaterThanEqual,
    And,
    Or,
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Equal => "==",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::LessThan => "<",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::LessThanEqual => "<=",
            BinaryOperator::GreaterThanEqual => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
        };
        write!(f, "{}", symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Negate,
    Not,
}

// 式
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Literal),
    Variable(String),
    /// The implicit result of the most recent call or emit.
    LastResult,
    List(Vec<Expression>),
    /// Keys are literal strings; values are evaluated in declared order.
    Map(Vec<(String, Expression)>),
    ElementAccess {
        collection: Box<Expression>,
        accessor: Box<Expression>,
    },
    /// `EVAL(expr)`: strict placeholder resolution of the evaluated string.
    Eval(Box<Expression>),
    /// Target is `tool.<namespace>.<name>`, the reserved `LLM`, a built-in,
    /// or a procedure name.
    Call {
        target: String,
        arguments: Vec<Expression>,
    },
    BinaryOp {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
}

impl Expression {
    pub fn int(value: i64) -> Self {
        Expression::Literal(Literal::Integer(value))
    }

    pub fn float(value: f64) -> Self {
        Expression::Literal(Literal::Float(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expression::Literal(Literal::string(value))
    }

    pub fn raw_string(value: impl Into<String>) -> Self {
        Expression::Literal(Literal::raw_string(value))
    }

    pub fn boolean(value: bool) -> Self {
        Expression::Literal(Literal::Boolean(value))
    }

    pub fn null() -> Self {
        Expression::Literal(Literal::Null)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expression::Variable(name.into())
    }

    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Self {
        Expression::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn index(collection: Expression, accessor: Expression) -> Self {
        Expression::ElementAccess {
            collection: Box::new(collection),
            accessor: Box::new(accessor),
        }
    }

    pub fn call(target: impl Into<String>, arguments: Vec<Expression>) -> Self {
        Expression::Call {
            target: target.into(),
            arguments,
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(Literal::Integer(i)) => write!(f, "{}", i),
            Expression::Literal(Literal::Float(v)) => write!(f, "{}", v),
            Expression::Literal(Literal::String { value, .. }) => write!(f, "{:?}", value),
            Expression::Literal(Literal::Boolean(b)) => write!(f, "{}", b),
            Expression::Literal(Literal::Null) => write!(f, "nil"),
            Expression::Variable(name) => write!(f, "{}", name),
            Expression::LastResult => write!(f, "LAST"),
            Expression::List(items) => {
                let items: Vec<String> = items.iter().map(|e| e.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Expression::Map(entries) => {
                let entries: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{:?}: {}", k, v))
                    .collect();
                write!(f, "{{{}}}", entries.join(", "))
            }
            Expression::ElementAccess {
                collection,
                accessor,
            } => write!(f, "{}[{}]", collection, accessor),
            Expression::Eval(inner) => write!(f, "EVAL({})", inner),
            Expression::Call { target, arguments } => {
                let args: Vec<String> = arguments.iter().map(|e| e.to_string()).collect();
                write!(f, "{}({})", target, args.join(", "))
            }
            Expression::BinaryOp { op, left, right } => write!(f, "{} {} {}", left, op, right),
            Expression::UnaryOp { op, operand } => match op {
                UnaryOperator::Negate => write!(f, "-{}", operand),
                UnaryOperator::Not => write!(f, "NOT {}", operand),
            },
        }
    }
}

pub type Statements = Vec<Statement>;

#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    // Error variable name to be bound in the catch scope
    pub binding: Option<String>,
    pub statements: Statements,
}

// 文
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Set {
        target: String,
        value: Expression,
    },
    /// A call whose result becomes the last call result.
    Call(Expression),
    Return(Vec<Expression>),
    Emit(Expression),
    Must(Expression),
    MustBe {
        check: String,
        argument: Expression,
    },
    Fail(Option<Expression>),
    // control flow
    If {
        condition: Expression,
        then_block: Statements,
        else_block: Option<Statements>,
    },
    While {
        condition: Expression,
        body: Statements,
    },
    ForEach {
        variable: String,
        collection: Expression,
        body: Statements,
    },
    // error handling
    OnError(Statements),
    ClearError,
    Try {
        try_block: Statements,
        catch: Option<CatchClause>,
        finally_block: Option<Statements>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub position: Position,
    pub kind: StatementKind,
}

impl Statement {
    pub fn new(kind: StatementKind) -> Self {
        Self {
            position: Position::default(),
            kind,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.position = Position::new(line, column);
        self
    }

    pub fn set(target: impl Into<String>, value: Expression) -> Self {
        Self::new(StatementKind::Set {
            target: target.into(),
            value,
        })
    }

    pub fn emit(value: Expression) -> Self {
        Self::new(StatementKind::Emit(value))
    }

    pub fn ret(values: Vec<Expression>) -> Self {
        Self::new(StatementKind::Return(values))
    }
}

impl From<StatementKind> for Statement {
    fn from(kind: StatementKind) -> Self {
        Statement::new(kind)
    }
}

/// A user-defined procedure.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Procedure {
    pub name: String,
    pub required_params: Vec<String>,
    pub optional_params: Vec<String>,
    pub body: Statements,
}

impl Procedure {
    pub fn new(name: impl Into<String>, required_params: Vec<String>, body: Statements) -> Self {
        Self {
            name: name.into(),
            required_params,
            optional_params: vec![],
            body,
        }
    }
}

pub type ProcedureTable = HashMap<String, Procedure>;
