use std::env;
use std::process;

use tern_runtime::{Env, Value};
use tern_syntax::Program;
use tern_vm::{disassemble, Compiler, Vm, GLOBALS_SIZE};

fn print_usage() {
    eprintln!("tern - a small dynamic language");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  tern <file.tn>           Compile and run a file on the VM");
    eprintln!("  tern run <file.tn>       Same as above");
    eprintln!("  tern eval <file.tn>      Run a file on the tree-walking evaluator");
    eprintln!("  tern ast <file.tn>       Print the parsed AST as JSON");
    eprintln!("  tern dis <file.tn>       Print compiled constants and disassembly");
    eprintln!("  tern repl                Start an interactive session");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -h, --help     Show this help message");
    eprintln!("  -V, --version  Show version information");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h") {
        print_usage();
        process::exit(0);
    }
    if args.len() > 1 && (args[1] == "--version" || args[1] == "-V") {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }

    let result = match args.get(1).map(String::as_str) {
        None | Some("repl") => repl(),
        Some("run") => match args.get(2) {
            Some(path) => run_file(path),
            None => usage_error(),
        },
        Some("eval") => match args.get(2) {
            Some(path) => eval_file(path),
            None => usage_error(),
        },
        Some("ast") => match args.get(2) {
            Some(path) => ast_file(path),
            None => usage_error(),
        },
        Some("dis") => match args.get(2) {
            Some(path) => dis_file(path),
            None => usage_error(),
        },
        Some(path) => run_file(path),
    };

    if let Err(message) = result {
        eprintln!("ERROR: {message}");
        process::exit(1);
    }
}

fn usage_error() -> Result<(), String> {
    print_usage();
    process::exit(1);
}

fn load_program(path: &str) -> Result<Program, String> {
    let source = std::fs::read_to_string(path).map_err(|err| format!("{path}: {err}"))?;
    tern_parser::parse(&source).map_err(|err| err.to_string())
}

fn run_file(path: &str) -> Result<(), String> {
    let program = load_program(path)?;
    let bytecode = Compiler::new()
        .compile(&program)
        .map_err(|err| err.to_string())?;
    let mut vm = Vm::new(bytecode);
    vm.run().map_err(|err| err.to_string())
}

fn eval_file(path: &str) -> Result<(), String> {
    let program = load_program(path)?;
    let env = Env::new(None);
    tern_eval::eval_program(&program, &env).map_err(|err| err.to_string())?;
    Ok(())
}

fn ast_file(path: &str) -> Result<(), String> {
    let program = load_program(path)?;
    let json = serde_json::to_string_pretty(&program).map_err(|err| err.to_string())?;
    println!("{json}");
    Ok(())
}

fn dis_file(path: &str) -> Result<(), String> {
    let program = load_program(path)?;
    let bytecode = Compiler::new()
        .compile(&program)
        .map_err(|err| err.to_string())?;
    for (index, constant) in bytecode.constants.iter().enumerate() {
        match constant {
            Value::Compiled(func) => {
                println!(
                    "CONSTANT {index} <fn params={} locals={}>:",
                    func.num_parameters, func.num_locals
                );
                for line in disassemble(&func.instructions).lines() {
                    println!("  {line}");
                }
            }
            other => println!("CONSTANT {index}: {}", other.inspect()),
        }
    }
    println!();
    print!("{}", disassemble(&bytecode.instructions));
    Ok(())
}

/// Line-oriented session. Each line is parsed and compiled against the
/// symbol table, constant pool, and globals of the lines before it.
fn repl() -> Result<(), String> {
    let mut editor = rustyline::DefaultEditor::new().map_err(|err| err.to_string())?;
    let mut symbols = tern_vm::SymbolTable::with_builtins();
    let mut constants = Vec::new();
    let mut globals = vec![Value::Null; GLOBALS_SIZE];

    loop {
        let line = match editor.readline(">> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(err) => return Err(err.to_string()),
        };
        if line.trim() == "exit" {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(&line);

        let program = match tern_parser::parse(&line) {
            Ok(program) => program,
            Err(err) => {
                eprintln!("ERROR: {err}");
                continue;
            }
        };

        let mut compiler = Compiler::with_state(symbols, constants);
        match compiler.compile(&program) {
            Ok(bytecode) => {
                let mut vm = Vm::with_globals(bytecode, globals);
                match vm.run() {
                    Ok(()) => println!("{}", vm.last_popped().inspect()),
                    Err(err) => eprintln!("ERROR: {err}"),
                }
                globals = vm.into_globals();
            }
            Err(err) => eprintln!("ERROR: {err}"),
        }
        (symbols, constants) = compiler.into_state();
    }
    Ok(())
}
