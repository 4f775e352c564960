use std::cell::RefCell;
use std::fmt;

/// 1-based source position of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Pos {
    pub line: usize,
    pub column: usize,
}

impl Pos {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Ident {
    pub pos: Pos,
    pub name: String,
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Parameter {
    pub name: Ident,
    pub ty: Option<Ident>,
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ty {
            Some(ty) => write!(f, "{}: {}", self.name, ty),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PrefixOp {
    Minus,
    Bang,
}

impl fmt::Display for PrefixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixOp::Minus => f.write_str("-"),
            PrefixOp::Bang => f.write_str("!"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    And,
    Or,
    In,
}

impl fmt::Display for InfixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InfixOp::Add => "+",
            InfixOp::Sub => "-",
            InfixOp::Mul => "*",
            InfixOp::Div => "/",
            InfixOp::Eq => "==",
            InfixOp::NotEq => "!=",
            InfixOp::Lt => "<",
            InfixOp::Gt => ">",
            InfixOp::LtEq => "<=",
            InfixOp::GtEq => ">=",
            InfixOp::And => "&&",
            InfixOp::Or => "||",
            InfixOp::In => "in",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Ident(Ident),
    Int {
        pos: Pos,
        value: i64,
    },
    Str {
        pos: Pos,
        value: String,
    },
    Bool {
        pos: Pos,
        value: bool,
    },
    Null {
        pos: Pos,
    },
    Prefix {
        pos: Pos,
        op: PrefixOp,
        right: Box<Expr>,
    },
    Infix {
        pos: Pos,
        op: InfixOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    If {
        pos: Pos,
        condition: Box<Expr>,
        consequence: Block,
        alternative: Option<Block>,
    },
    Array {
        pos: Pos,
        elements: Vec<Expr>,
    },
    Hash {
        pos: Pos,
        pairs: Vec<(Expr, Expr)>,
    },
    Index {
        pos: Pos,
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Property {
        pos: Pos,
        value: Box<Expr>,
        name: Ident,
    },
    Call {
        pos: Pos,
        function: Box<Expr>,
        args: Vec<Expr>,
    },
    Function {
        pos: Pos,
        params: Vec<Parameter>,
        return_ty: Option<Ident>,
        body: Block,
    },
    Assign {
        pos: Pos,
        target: Box<Expr>,
        value: Box<Expr>,
    },
}

impl Expr {
    pub fn pos(&self) -> Pos {
        match self {
            Expr::Ident(ident) => ident.pos,
            Expr::Int { pos, .. }
            | Expr::Str { pos, .. }
            | Expr::Bool { pos, .. }
            | Expr::Null { pos }
            | Expr::Prefix { pos, .. }
            | Expr::Infix { pos, .. }
            | Expr::If { pos, .. }
            | Expr::Array { pos, .. }
            | Expr::Hash { pos, .. }
            | Expr::Index { pos, .. }
            | Expr::Property { pos, .. }
            | Expr::Call { pos, .. }
            | Expr::Function { pos, .. }
            | Expr::Assign { pos, .. } => *pos,
        }
    }
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ident(ident) => write!(f, "{ident}"),
            Expr::Int { value, .. } => write!(f, "{value}"),
            Expr::Str { value, .. } => write!(f, "\"{value}\""),
            Expr::Bool { value, .. } => write!(f, "{value}"),
            Expr::Null { .. } => f.write_str("null"),
            Expr::Prefix { op, right, .. } => write!(f, "({op}{right})"),
            Expr::Infix {
                op, left, right, ..
            } => write!(f, "({left} {op} {right})"),
            Expr::If {
                condition,
                consequence,
                alternative,
                ..
            } => {
                write!(f, "if {condition} {{ {consequence} }}")?;
                if let Some(alt) = alternative {
                    write!(f, " else {{ {alt} }}")?;
                }
                Ok(())
            }
            Expr::Array { elements, .. } => {
                f.write_str("[")?;
                write_joined(f, elements, ", ")?;
                f.write_str("]")
            }
            Expr::Hash { pairs, .. } => {
                f.write_str("{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Expr::Index { value, index, .. } => write!(f, "({value}[{index}])"),
            Expr::Property { value, name, .. } => write!(f, "({value}.{name})"),
            Expr::Call { function, args, .. } => {
                write!(f, "{function}(")?;
                write_joined(f, args, ", ")?;
                f.write_str(")")
            }
            Expr::Function {
                params,
                return_ty,
                body,
                ..
            } => {
                f.write_str("fn(")?;
                write_joined(f, params, ", ")?;
                f.write_str(")")?;
                if let Some(ty) = return_ty {
                    write!(f, ": {ty}")?;
                }
                write!(f, " {{ {body} }}")
            }
            Expr::Assign { target, value, .. } => write!(f, "({target} = {value})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub pos: Pos,
    pub statements: Vec<Stmt>,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.statements, " ")
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SwitchCase {
    pub pos: Pos,
    pub value: Expr,
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    Let {
        pos: Pos,
        name: Ident,
        ty: Option<Ident>,
        value: Expr,
    },
    Return {
        pos: Pos,
        value: Option<Expr>,
    },
    Expr {
        pos: Pos,
        expr: Expr,
    },
    Function {
        pos: Pos,
        name: Ident,
        params: Vec<Parameter>,
        return_ty: Option<Ident>,
        body: Block,
    },
    While {
        pos: Pos,
        condition: Expr,
        body: Block,
    },
    Switch {
        pos: Pos,
        value: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
    },
    Import {
        pos: Pos,
        path: String,
        /// Parsed lazily by whichever backend first evaluates the import.
        #[serde(skip)]
        program: RefCell<Option<Program>>,
    },
    Package {
        pos: Pos,
        name: Ident,
    },
    Debugger {
        pos: Pos,
    },
}

impl Stmt {
    pub fn pos(&self) -> Pos {
        match self {
            Stmt::Let { pos, .. }
            | Stmt::Return { pos, .. }
            | Stmt::Expr { pos, .. }
            | Stmt::Function { pos, .. }
            | Stmt::While { pos, .. }
            | Stmt::Switch { pos, .. }
            | Stmt::Import { pos, .. }
            | Stmt::Package { pos, .. }
            | Stmt::Debugger { pos } => *pos,
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Let {
                name, ty, value, ..
            } => match ty {
                Some(ty) => write!(f, "let {name}: {ty} = {value};"),
                None => write!(f, "let {name} = {value};"),
            },
            Stmt::Return { value, .. } => match value {
                Some(value) => write!(f, "return {value};"),
                None => f.write_str("return;"),
            },
            Stmt::Expr { expr, .. } => write!(f, "{expr}"),
            Stmt::Function {
                name,
                params,
                return_ty,
                body,
                ..
            } => {
                write!(f, "function {name}(")?;
                write_joined(f, params, ", ")?;
                f.write_str(")")?;
                if let Some(ty) = return_ty {
                    write!(f, ": {ty}")?;
                }
                write!(f, " {{ {body} }}")
            }
            Stmt::While {
                condition, body, ..
            } => write!(f, "while {condition} {{ {body} }}"),
            Stmt::Switch {
                value,
                cases,
                default,
                ..
            } => {
                write!(f, "switch {value} {{")?;
                for case in cases {
                    write!(f, " case {}:", case.value)?;
                    for stmt in &case.statements {
                        write!(f, " {stmt}")?;
                    }
                }
                if let Some(default) = default {
                    f.write_str(" default:")?;
                    for stmt in default {
                        write!(f, " {stmt}")?;
                    }
                }
                f.write_str(" }")
            }
            Stmt::Import { path, .. } => write!(f, "import \"{path}\";"),
            Stmt::Package { name, .. } => write!(f, "package {name};"),
            Stmt::Debugger { .. } => f.write_str("debugger;"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.statements, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn let_statement_renders_source_form() {
        let stmt = Stmt::Let {
            pos: Pos::new(1, 1),
            name: Ident {
                pos: Pos::new(1, 5),
                name: "myVar".to_string(),
            },
            ty: None,
            value: Expr::Ident(Ident {
                pos: Pos::new(1, 13),
                name: "anotherVar".to_string(),
            }),
        };
        assert_eq!(stmt.to_string(), "let myVar = anotherVar;");
    }

    #[test]
    fn typed_let_renders_annotation() {
        let stmt = Stmt::Let {
            pos: Pos::new(1, 1),
            name: Ident {
                pos: Pos::new(1, 5),
                name: "x".to_string(),
            },
            ty: Some(Ident {
                pos: Pos::new(1, 8),
                name: "int".to_string(),
            }),
            value: Expr::Int {
                pos: Pos::new(1, 14),
                value: 5,
            },
        };
        assert_eq!(stmt.to_string(), "let x: int = 5;");
    }

    #[test]
    fn infix_renders_parenthesized() {
        let expr = Expr::Infix {
            pos: Pos::new(1, 3),
            op: InfixOp::Add,
            left: Box::new(Expr::Int {
                pos: Pos::new(1, 1),
                value: 1,
            }),
            right: Box::new(Expr::Int {
                pos: Pos::new(1, 5),
                value: 2,
            }),
        };
        assert_eq!(expr.to_string(), "(1 + 2)");
    }

    #[test]
    fn every_expr_reports_a_position() {
        let pos = Pos::new(3, 7);
        let exprs = vec![
            Expr::Null { pos },
            Expr::Int { pos, value: 1 },
            Expr::Array {
                pos,
                elements: vec![],
            },
            Expr::Hash { pos, pairs: vec![] },
        ];
        for expr in exprs {
            assert_eq!(expr.pos(), pos);
        }
    }
}
