use std::fmt;
use std::rc::Rc;

use tern_runtime::{
    hash_get, hash_set, lookup_builtin, Env, FunctionValue, Value,
};
use tern_syntax::{Block, Expr, InfixOp, Parameter, PrefixOp, Program, Stmt, SwitchCase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for EvalError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EvalError {}

/// Evaluate a whole program. The final statement's value is the program's
/// value; a top-level `return` unwinds early.
pub fn eval_program(program: &Program, env: &Env) -> Result<Value, EvalError> {
    let mut last = Value::Null;
    for stmt in &program.statements {
        last = eval_stmt(stmt, env)?;
        if let Value::Return(value) = last {
            return Ok(value.as_ref().clone());
        }
    }
    Ok(last)
}

/// Convenience: parse and evaluate a source string in a fresh environment.
pub fn eval_source(source: &str) -> Result<Value, EvalError> {
    let program =
        tern_parser::parse(source).map_err(|err| EvalError::new(err.to_string()))?;
    eval_program(&program, &Env::new(None))
}

fn eval_stmt(stmt: &Stmt, env: &Env) -> Result<Value, EvalError> {
    match stmt {
        Stmt::Expr { expr, .. } => eval_expr(expr, env),
        Stmt::Let {
            name, ty, value, ..
        } => {
            let value = eval_expr(value, env)?;
            env.set_typed(
                name.name.clone(),
                value,
                ty.as_ref().map(|ty| ty.name.clone()),
            )?;
            Ok(Value::Null)
        }
        Stmt::Return { value, .. } => {
            let value = match value {
                Some(value) => eval_expr(value, env)?,
                None => Value::Null,
            };
            Ok(Value::Return(Rc::new(value)))
        }
        Stmt::Function {
            name, params, body, ..
        } => {
            env.set(
                name.name.clone(),
                Value::Function(Rc::new(FunctionValue {
                    params: params.clone(),
                    body: body.clone(),
                    env: env.clone(),
                })),
            );
            Ok(Value::Null)
        }
        Stmt::While {
            condition, body, ..
        } => {
            loop {
                let condition = eval_expr(condition, env)?;
                if !condition.is_truthy() {
                    break;
                }
                let result = eval_block(body, env)?;
                if matches!(result, Value::Return(_)) {
                    return Ok(result);
                }
            }
            Ok(Value::Null)
        }
        Stmt::Switch {
            value,
            cases,
            default,
            ..
        } => eval_switch(value, cases, default.as_deref(), env),
        Stmt::Import { path, program, .. } => {
            let cached = program.borrow().clone();
            let parsed = match cached {
                Some(parsed) => parsed,
                None => {
                    let source = std::fs::read_to_string(path)
                        .map_err(|err| EvalError::new(format!("import: {err}")))?;
                    let parsed = tern_parser::parse(&source)
                        .map_err(|err| EvalError::new(format!("import: {err}")))?;
                    *program.borrow_mut() = Some(parsed.clone());
                    parsed
                }
            };
            eval_program(&parsed, env)
        }
        Stmt::Package { .. } | Stmt::Debugger { .. } => Ok(Value::Null),
    }
}

/// Blocks share the enclosing environment; only function application
/// introduces a new one.
fn eval_block(block: &Block, env: &Env) -> Result<Value, EvalError> {
    eval_stmts(&block.statements, env)
}

fn eval_stmts(stmts: &[Stmt], env: &Env) -> Result<Value, EvalError> {
    let mut last = Value::Null;
    for stmt in stmts {
        last = eval_stmt(stmt, env)?;
        if matches!(last, Value::Return(_)) {
            return Ok(last);
        }
    }
    Ok(last)
}

/// The subject is evaluated once; the first case whose value equals it by
/// key form runs. A `return` inside a case unwinds through the switch.
fn eval_switch(
    value: &Expr,
    cases: &[SwitchCase],
    default: Option<&[Stmt]>,
    env: &Env,
) -> Result<Value, EvalError> {
    let subject = eval_expr(value, env)?;
    for case in cases {
        let candidate = eval_expr(&case.value, env)?;
        if candidate == subject {
            return eval_stmts(&case.statements, env);
        }
    }
    match default {
        Some(statements) => eval_stmts(statements, env),
        None => Ok(Value::Null),
    }
}

fn eval_expr(expr: &Expr, env: &Env) -> Result<Value, EvalError> {
    match expr {
        Expr::Int { value, .. } => Ok(Value::Int(*value)),
        Expr::Str { value, .. } => Ok(Value::string(value.clone())),
        Expr::Bool { value, .. } => Ok(Value::Bool(*value)),
        Expr::Null { .. } => Ok(Value::Null),
        Expr::Ident(ident) => {
            if let Some(builtin) = lookup_builtin(&ident.name) {
                return Ok(Value::Builtin(builtin));
            }
            env.get(&ident.name)
                .ok_or_else(|| EvalError::new(format!("identifier not found: {}", ident.name)))
        }
        Expr::Prefix { op, right, .. } => {
            let right = eval_expr(right, env)?;
            eval_prefix(*op, right)
        }
        Expr::Infix {
            op, left, right, ..
        } => eval_infix(*op, left, right, env),
        Expr::If {
            condition,
            consequence,
            alternative,
            ..
        } => {
            let condition = eval_expr(condition, env)?;
            if condition.is_truthy() {
                eval_block(consequence, env)
            } else if let Some(alternative) = alternative {
                eval_block(alternative, env)
            } else {
                Ok(Value::Null)
            }
        }
        Expr::Array { elements, .. } => {
            let mut values = Vec::with_capacity(elements.len());
            for element in elements {
                values.push(eval_expr(element, env)?);
            }
            Ok(Value::array(values))
        }
        Expr::Hash { pairs, .. } => {
            let hash = Value::hash();
            if let Value::Hash(entries) = &hash {
                for (key, value) in pairs {
                    let key = eval_expr(key, env)?;
                    let value = eval_expr(value, env)?;
                    hash_set(entries, key, value);
                }
            }
            Ok(hash)
        }
        Expr::Index { value, index, .. } => {
            let value = eval_expr(value, env)?;
            let index = eval_expr(index, env)?;
            eval_index(&value, &index)
        }
        Expr::Property { value, name, .. } => {
            let value = eval_expr(value, env)?;
            match &value {
                Value::Hash(pairs) => {
                    Ok(hash_get(pairs, &Value::string(name.name.clone())).unwrap_or(Value::Null))
                }
                other => Err(EvalError::new(format!(
                    "cannot index into {}",
                    other.type_name()
                ))),
            }
        }
        Expr::Call { function, args, .. } => {
            let function = eval_expr(function, env)?;
            let mut arguments = Vec::with_capacity(args.len());
            for arg in args {
                arguments.push(eval_expr(arg, env)?);
            }
            apply_function(&function, arguments)
        }
        Expr::Function { params, body, .. } => Ok(Value::Function(Rc::new(FunctionValue {
            params: params.clone(),
            body: body.clone(),
            env: env.clone(),
        }))),
        Expr::Assign { target, value, .. } => eval_assign(target, value, env),
    }
}

fn apply_function(function: &Value, args: Vec<Value>) -> Result<Value, EvalError> {
    match function {
        Value::Builtin(builtin) => (builtin.func)(args).map_err(EvalError::from),
        Value::Function(function) => {
            if function.params.len() != args.len() {
                return Err(EvalError::new("invalid number of function parameters"));
            }
            let env = Env::new(Some(function.env.clone()));
            for (param, arg) in function.params.iter().zip(args) {
                bind_parameter(param, arg, &env)?;
            }
            let result = eval_block(&function.body, &env)?;
            match result {
                Value::Return(value) => Ok(value.as_ref().clone()),
                other => Ok(other),
            }
        }
        other => Err(EvalError::new(format!(
            "not a function: {}",
            other.type_name()
        ))),
    }
}

fn bind_parameter(param: &Parameter, arg: Value, env: &Env) -> Result<(), EvalError> {
    env.set_typed(
        param.name.name.clone(),
        arg,
        param.ty.as_ref().map(|ty| ty.name.clone()),
    )?;
    Ok(())
}

fn eval_prefix(op: PrefixOp, right: Value) -> Result<Value, EvalError> {
    match op {
        PrefixOp::Bang => Ok(Value::Bool(!right.is_truthy())),
        PrefixOp::Minus => match right {
            Value::Int(value) => Ok(Value::Int(value.wrapping_neg())),
            other => Err(EvalError::new(format!(
                "unknown operator: -{}",
                other.type_name()
            ))),
        },
    }
}

fn eval_infix(op: InfixOp, left: &Expr, right: &Expr, env: &Env) -> Result<Value, EvalError> {
    // && and || short-circuit on truthiness and produce canonical booleans
    if op == InfixOp::And {
        let left = eval_expr(left, env)?;
        if !left.is_truthy() {
            return Ok(Value::Bool(false));
        }
        let right = eval_expr(right, env)?;
        return Ok(Value::Bool(right.is_truthy()));
    }
    if op == InfixOp::Or {
        let left = eval_expr(left, env)?;
        if left.is_truthy() {
            return Ok(Value::Bool(true));
        }
        let right = eval_expr(right, env)?;
        return Ok(Value::Bool(right.is_truthy()));
    }

    let left = eval_expr(left, env)?;
    let right = eval_expr(right, env)?;

    if op == InfixOp::In {
        return eval_in(&left, &right);
    }

    match (&left, &right) {
        (Value::Int(l), Value::Int(r)) => eval_integer_infix(op, *l, *r),
        (Value::Str(l), Value::Str(r)) => eval_string_infix(op, l, r),
        _ if left.type_name() != right.type_name() => Err(EvalError::new(format!(
            "type mismatch: {} {} {}",
            left.type_name(),
            op,
            right.type_name()
        ))),
        _ => match op {
            InfixOp::Eq => Ok(Value::Bool(left == right)),
            InfixOp::NotEq => Ok(Value::Bool(left != right)),
            _ => Err(EvalError::new(format!(
                "unknown operator: {} {} {}",
                left.type_name(),
                op,
                right.type_name()
            ))),
        },
    }
}

fn eval_integer_infix(op: InfixOp, left: i64, right: i64) -> Result<Value, EvalError> {
    let value = match op {
        InfixOp::Add => Value::Int(left.wrapping_add(right)),
        InfixOp::Sub => Value::Int(left.wrapping_sub(right)),
        InfixOp::Mul => Value::Int(left.wrapping_mul(right)),
        InfixOp::Div => {
            if right == 0 {
                return Err(EvalError::new("division by zero"));
            }
            Value::Int(left.wrapping_div(right))
        }
        InfixOp::Lt => Value::Bool(left < right),
        InfixOp::Gt => Value::Bool(left > right),
        InfixOp::LtEq => Value::Bool(left <= right),
        InfixOp::GtEq => Value::Bool(left >= right),
        InfixOp::Eq => Value::Bool(left == right),
        InfixOp::NotEq => Value::Bool(left != right),
        other => {
            return Err(EvalError::new(format!(
                "unknown operator: INTEGER {other} INTEGER"
            )))
        }
    };
    Ok(value)
}

fn eval_string_infix(op: InfixOp, left: &str, right: &str) -> Result<Value, EvalError> {
    let value = match op {
        InfixOp::Add => Value::string(format!("{left}{right}")),
        InfixOp::Eq => Value::Bool(left == right),
        InfixOp::NotEq => Value::Bool(left != right),
        InfixOp::Lt => Value::Bool(left < right),
        InfixOp::Gt => Value::Bool(left > right),
        InfixOp::LtEq => Value::Bool(left <= right),
        InfixOp::GtEq => Value::Bool(left >= right),
        other => {
            return Err(EvalError::new(format!(
                "unknown operator: STRING {other} STRING"
            )))
        }
    };
    Ok(value)
}

/// Membership: linear key-form equality over arrays, key presence in hashes.
fn eval_in(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match right {
        Value::Array(elements) => Ok(Value::Bool(elements.borrow().iter().any(|el| el == left))),
        Value::Hash(pairs) => Ok(Value::Bool(pairs.borrow().contains_key(&left.key()))),
        other => Err(EvalError::new(format!(
            "unknown operator: {} in {}",
            left.type_name(),
            other.type_name()
        ))),
    }
}

fn eval_index(value: &Value, index: &Value) -> Result<Value, EvalError> {
    match value {
        Value::Hash(pairs) => Ok(hash_get(pairs, index).unwrap_or(Value::Null)),
        Value::Array(elements) => match index {
            Value::Int(i) => {
                let elements = elements.borrow();
                if *i < 0 || *i >= elements.len() as i64 {
                    return Err(EvalError::new(format!("index out of range {i}")));
                }
                Ok(elements[*i as usize].clone())
            }
            other => Err(EvalError::new(format!(
                "index must be an integer {}",
                other.type_name()
            ))),
        },
        Value::Str(s) => match index {
            Value::Int(i) => {
                let bytes = s.as_bytes();
                if *i < 0 || *i >= bytes.len() as i64 {
                    return Err(EvalError::new(format!("index out of range {i}")));
                }
                Ok(Value::string(
                    String::from_utf8_lossy(&[bytes[*i as usize]]).into_owned(),
                ))
            }
            other => Err(EvalError::new(format!(
                "index must be an integer {}",
                other.type_name()
            ))),
        },
        other => Err(EvalError::new(format!(
            "cannot index into {}",
            other.type_name()
        ))),
    }
}

fn eval_assign(target: &Expr, value: &Expr, env: &Env) -> Result<Value, EvalError> {
    match target {
        Expr::Ident(ident) => {
            let value = eval_expr(value, env)?;
            env.update(&ident.name, value)?;
        }
        Expr::Index {
            value: container,
            index,
            ..
        } => {
            let container = eval_expr(container, env)?;
            let index = eval_expr(index, env)?;
            let value = eval_expr(value, env)?;
            assign_index(&container, &index, value)?;
        }
        Expr::Property {
            value: container,
            name,
            ..
        } => {
            let container = eval_expr(container, env)?;
            let value = eval_expr(value, env)?;
            match &container {
                Value::Hash(pairs) => hash_set(pairs, Value::string(name.name.clone()), value),
                other => {
                    return Err(EvalError::new(format!(
                        "cannot index into {}",
                        other.type_name()
                    )))
                }
            }
        }
        _ => return Err(EvalError::new("invalid assignment target")),
    }
    Ok(Value::Null)
}

fn assign_index(container: &Value, index: &Value, value: Value) -> Result<(), EvalError> {
    match container {
        Value::Array(elements) => match index {
            Value::Int(i) => {
                let mut elements = elements.borrow_mut();
                if *i < 0 || *i >= elements.len() as i64 {
                    return Err(EvalError::new(format!("index out of range {i}")));
                }
                elements[*i as usize] = value;
                Ok(())
            }
            other => Err(EvalError::new(format!(
                "index must be an integer {}",
                other.type_name()
            ))),
        },
        Value::Hash(pairs) => {
            hash_set(pairs, index.clone(), value);
            Ok(())
        }
        other => Err(EvalError::new(format!(
            "cannot index into {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str) -> Value {
        eval_source(input).expect("evaluate program")
    }

    fn run_err(input: &str) -> String {
        eval_source(input).expect_err("expected eval error").message
    }

    #[test]
    fn evaluates_integer_arithmetic() {
        let cases = [
            ("5", 5),
            ("-5", -5),
            ("1 + 4 * 2", 9),
            ("(5 + 10 * 2 + 15 / 3) * 2 + -10", 50),
            ("50 / 2 * 2 + 10", 60),
        ];
        for (input, expected) in cases {
            assert_eq!(run(input), Value::Int(expected), "input: {input}");
        }
    }

    #[test]
    fn evaluates_boolean_expressions() {
        let cases = [
            ("true", true),
            ("1 < 2", true),
            ("1 > 2", false),
            ("1 <= 1", true),
            ("1 >= 2", false),
            ("1 == 1", true),
            ("1 != 2", true),
            ("true == true", true),
            ("true != false", true),
            ("!true", false),
            ("!!5", true),
            ("!null", true),
            (r#""a" < "b""#, true),
            (r#""b" >= "b""#, true),
            ("true && true", true),
            ("true && false", false),
            ("false || true", true),
            ("null || false", false),
            ("1 && 2", true),
        ];
        for (input, expected) in cases {
            assert_eq!(run(input), Value::Bool(expected), "input: {input}");
        }
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!(run("false && missing"), Value::Bool(false));
        assert_eq!(run("true || missing"), Value::Bool(true));
        assert_eq!(run_err("true && missing"), "identifier not found: missing");
    }

    #[test]
    fn evaluates_conditionals() {
        let cases = [
            ("if true { 10 }", Value::Int(10)),
            ("if false { 10 }", Value::Null),
            ("if 1 > 2 { 10 } else { 20 }", Value::Int(20)),
            ("if (1 > 2) { 10 } else { 20 }; 3333", Value::Int(3333)),
        ];
        for (input, expected) in cases {
            assert_eq!(run(input), expected, "input: {input}");
        }
    }

    #[test]
    fn evaluates_let_and_identifiers() {
        let cases = [
            ("let a = 5; a", 5),
            ("let a = 5 * 5; a", 25),
            ("let a = 5; let b = a; let c = a + b + 5; c", 15),
        ];
        for (input, expected) in cases {
            assert_eq!(run(input), Value::Int(expected), "input: {input}");
        }
    }

    #[test]
    fn let_evaluates_to_null() {
        assert_eq!(run("let a = 5"), Value::Null);
    }

    #[test]
    fn typed_let_checks_tags_at_runtime() {
        assert_eq!(run("let a: int = 5; a"), Value::Int(5));
        assert_eq!(
            run_err(r#"let a: int = "five";"#),
            "type mismatch: expected INTEGER, got STRING"
        );
        assert_eq!(
            run_err(r#"let a: string = "ok"; a = 5;"#),
            "type mismatch: expected STRING, got INTEGER"
        );
    }

    #[test]
    fn typed_parameters_check_arguments() {
        assert_eq!(run("fn(a: int) { a }(5)"), Value::Int(5));
        assert_eq!(
            run_err(r#"fn(a: int) { a }("x")"#),
            "type mismatch: expected INTEGER, got STRING"
        );
    }

    #[test]
    fn evaluates_return_statements() {
        let cases = [
            ("return 10;", 10),
            ("return 10; 9", 10),
            ("return 2 * 5; 9", 10),
            ("9; return 10; 9", 10),
            ("if true { if true { return 10 } return 1 }", 10),
        ];
        for (input, expected) in cases {
            assert_eq!(run(input), Value::Int(expected), "input: {input}");
        }
        assert_eq!(run("return;"), Value::Null);
    }

    #[test]
    fn evaluates_functions_and_closures() {
        let cases = [
            ("let identity = fn(x) { x }; identity(5)", 5),
            ("let double = fn(x) { x * 2 }; double(5)", 10),
            ("let add = fn(a, b) { a + b }; add(5, add(5, 5))", 15),
            ("fn(a, b) { a + b }(2, 8)", 10),
            ("let one = fn() { 1 }; one() + one()", 2),
            ("let make = fn(a) { fn() { a } }; make(1)()", 1),
            (
                "let adder = fn(x) { fn(y) { x + y } }; let add2 = adder(2); add2(3)",
                5,
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(run(input), Value::Int(expected), "input: {input}");
        }
    }

    #[test]
    fn function_statements_support_recursion() {
        let input = "
            function fib(n) {
                if n < 2 { return n }
                return fib(n - 1) + fib(n - 2);
            }
            fib(10)
        ";
        assert_eq!(run(input), Value::Int(55));
    }

    #[test]
    fn let_bound_functions_recurse_through_the_environment() {
        let input = "let f = fn(n) { if n == 0 { 0 } else { f(n - 1) } }; f(3)";
        assert_eq!(run(input), Value::Int(0));
    }

    #[test]
    fn evaluates_strings() {
        assert_eq!(
            run(r#""hello" + " " + "world""#),
            Value::string("hello world")
        );
        assert_eq!(run(r#""hello"[1]"#), Value::string("e"));
        assert_eq!(run_err(r#""hi" - "h""#), "unknown operator: STRING - STRING");
    }

    #[test]
    fn evaluates_arrays() {
        let result = run("[1, 2 * 2, 3 + 3]");
        if let Value::Array(elements) = &result {
            assert_eq!(
                *elements.borrow(),
                vec![Value::Int(1), Value::Int(4), Value::Int(6)]
            );
        } else {
            panic!("not an array: {result:?}");
        }
        assert_eq!(run("[1, 2, 3][0]"), Value::Int(1));
        assert_eq!(run("let i = 2; [1, 2, 3][i]"), Value::Int(3));
        assert_eq!(run_err("[1][3]"), "index out of range 3");
        assert_eq!(run_err("[1][true]"), "index must be an integer BOOLEAN");
    }

    #[test]
    fn evaluates_hashes() {
        assert_eq!(run(r#"{"a": 1, "b": 2}["b"]"#), Value::Int(2));
        assert_eq!(run("{1: 10}[1]"), Value::Int(10));
        assert_eq!(run("{true: 1}[true]"), Value::Int(1));
        assert_eq!(run("{1: 10}[2]"), Value::Null);
        // empty hash parses and evaluates as an expression
        match run("{}") {
            Value::Hash(pairs) => assert!(pairs.borrow().is_empty()),
            other => panic!("not a hash: {other:?}"),
        }
    }

    #[test]
    fn evaluates_property_access() {
        assert_eq!(run(r#"let h = {"name": "tern"}; h.name"#), Value::string("tern"));
        assert_eq!(run(r#"let h = {}; h.absent"#), Value::Null);
        assert_eq!(run_err("5.name"), "cannot index into INTEGER");
    }

    #[test]
    fn evaluates_assignment() {
        assert_eq!(run("let x = 1; x = 2; x"), Value::Int(2));
        assert_eq!(run("let x = 1; x = 2"), Value::Null);
        assert_eq!(run("let x = [1]; x[0] = 2; x[0]"), Value::Int(2));
        assert_eq!(run(r#"let h = {}; h["k"] = 1; h["k"]"#), Value::Int(1));
        assert_eq!(run(r#"let h = {}; h.k = 1; h.k"#), Value::Int(1));
        assert_eq!(run_err("zz = 1"), "'zz' is not defined");
    }

    #[test]
    fn assignment_reaches_outer_scopes() {
        let input = "
            let counter = 0;
            let bump = fn() { counter = counter + 1 };
            bump(); bump(); bump();
            counter
        ";
        assert_eq!(run(input), Value::Int(3));
    }

    #[test]
    fn evaluates_while_loops() {
        let input = "let i = 0; let total = 0; while i < 5 { total = total + i; i = i + 1; } total";
        assert_eq!(run(input), Value::Int(10));
    }

    #[test]
    fn while_propagates_return() {
        let input = "
            let find = fn() {
                let i = 0;
                while true {
                    if i == 3 { return i }
                    i = i + 1;
                }
            };
            find()
        ";
        assert_eq!(run(input), Value::Int(3));
    }

    #[test]
    fn evaluates_switch_statements() {
        let input = r#"switch "yes" { case "yes": 1 case "no": 2 default: 3 }"#;
        assert_eq!(run(input), Value::Int(1));
        let input = r#"switch "nope" { case "yes": 1 case "no": 2 default: 3 }"#;
        assert_eq!(run(input), Value::Int(3));
        assert_eq!(run("switch 9 { case 1: 1 }"), Value::Null);
    }

    #[test]
    fn switch_return_exits_enclosing_function() {
        let input = r#"
            let pick = fn(v) {
                switch v {
                    case "yes": return 1
                    case "no": return 2
                }
                return 3;
            };
            pick("yes") + pick("no") + pick("other")
        "#;
        assert_eq!(run(input), Value::Int(6));
    }

    #[test]
    fn evaluates_in_operator() {
        let cases = [
            ("1 in [1, 2]", true),
            ("3 in [1, 2]", false),
            (r#""a" in ["a"]"#, true),
            (r#""k" in {"k": 1}"#, true),
            (r#""x" in {"k": 1}"#, false),
            ("1 in {1: true}", true),
        ];
        for (input, expected) in cases {
            assert_eq!(run(input), Value::Bool(expected), "input: {input}");
        }
        assert_eq!(run_err("1 in 2"), "unknown operator: INTEGER in INTEGER");
    }

    #[test]
    fn locals_reads_the_current_frame() {
        let input = r#"
            let top = 1;
            let f = fn() {
                let inner = 2;
                locals
            };
            f()["inner"]
        "#;
        assert_eq!(run(input), Value::Int(2));
        assert_eq!(run(r#"let f = fn() { locals }; f()["top"]"#), Value::Null);
    }

    #[test]
    fn evaluates_builtins() {
        assert_eq!(run("len([1, 2])"), Value::Int(2));
        assert_eq!(run("let a = []; append(a, 1); len(a)"), Value::Int(1));
        assert_eq!(run(r#"type([])"#), Value::string("ARRAY"));
        assert_eq!(run("str(5)"), Value::string("5"));
        assert_eq!(run_err("len(5)"), "len: invalid argument type INTEGER");
    }

    #[test]
    fn reports_error_messages() {
        let cases = [
            ("foobar", "identifier not found: foobar"),
            ("5 + true", "type mismatch: INTEGER + BOOLEAN"),
            ("5 + true; 5", "type mismatch: INTEGER + BOOLEAN"),
            ("-true", "unknown operator: -BOOLEAN"),
            ("true + false", "unknown operator: BOOLEAN + BOOLEAN"),
            ("1 / 0", "division by zero"),
            ("5(1)", "not a function: INTEGER"),
            ("fn(a) { a }()", "invalid number of function parameters"),
            ("[1, 2][5]", "index out of range 5"),
        ];
        for (input, expected) in cases {
            assert_eq!(run_err(input), expected, "input: {input}");
        }
    }

    #[test]
    fn package_and_debugger_are_no_ops() {
        assert_eq!(run("package main; debugger; 5"), Value::Int(5));
    }

    #[test]
    fn import_evaluates_the_file_in_the_current_env() {
        let dir = std::env::temp_dir().join(format!(
            "tern_eval_import_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("lib.tn");
        std::fs::write(&path, "let shared = 40;").expect("write module");
        let source = format!("import \"{}\"; shared + 2", path.display());
        assert_eq!(run(&source), Value::Int(42));
        let _ = std::fs::remove_dir_all(&dir);
    }

    // The evaluator is the behavioral oracle for the bytecode pipeline:
    // both backends must agree by key-form equality on the shared surface.
    #[test]
    fn vm_and_evaluator_agree() {
        let sources = [
            "1 + 4 * 2",
            "(2 + 3) * -4",
            "if (1 > 2) { 10 } else { 20 }; 3333",
            "!if false { 5 }",
            "let one = fn() { 1 }; one() + one()",
            "fn(a, b) { a + b }(2, 8)",
            "let make = fn(a) { fn() { a } }; make(1)()",
            "let x = [1]; x[0] = 2; x[0]",
            r#""hello" + " " + "world""#,
            "len([])",
            "append([], 1)[0]",
            "{1: 2, 3: 4}[3]",
            r#"{"k": 1}["missing"]"#,
            "true && false || true",
            "1 <= 2",
            "3 >= 3",
            "let i = 0; while i < 4 { i = i + 1; } i",
            r#"let out = 0; switch "yes" { case "yes": out = 1 case "no": out = 2 default: out = 3 } out"#,
            "return 7; 8",
        ];
        for source in sources {
            let program = tern_parser::parse(source).expect("parse program");
            let expected =
                eval_program(&program, &Env::new(None)).expect("evaluate program");
            let bytecode = tern_vm::Compiler::new()
                .compile(&program)
                .expect("compile program");
            let mut vm = tern_vm::Vm::new(bytecode);
            vm.run().expect("run program");
            let got = vm.last_popped();
            assert_eq!(
                got.key(),
                expected.key(),
                "backends disagree on: {source}"
            );
        }
    }
}
