use std::{env, fs, path::Path};

use tracing_subscriber::EnvFilter;

use kiln::bytecode::compile;
use kiln::bytecode::disasm::print_program;
use kiln::config::CodegenConfig;
use kiln::lang::node::{BinaryOp, CompareOp, Expr, Stmt};
use kiln::lang::program::Program;
use kiln::lang::types::{IntType, Param, Type};
use kiln::runtime::Vm;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        return;
    }

    let show_bytecode = args.contains(&"--bc".to_string()) || args.contains(&"--bytecode".to_string());
    let config = CodegenConfig {
        optimize: !args.contains(&"--no-opt".to_string()),
        null_checks: !args.contains(&"--no-null-checks".to_string()),
        debug_info: !args.contains(&"--no-debug".to_string()),
        ..CodegenConfig::default()
    };
    let output = value_of(&args, "-o");

    if let Some(path) = value_of(&args, "--write-demo") {
        write_file(path, demo_program().to_bytes());
        return;
    }

    // first non-flag argument that is not a flag value is the input
    let filename = args
        .iter()
        .enumerate()
        .skip(1)
        .find(|(i, a)| !a.starts_with('-') && !matches!(args[i - 1].as_str(), "-o" | "--write-demo"))
        .map(|(_, a)| a);

    let program = match filename {
        Some(filename) => {
            ensure_extension(filename);
            load_program(filename)
        }
        None => {
            if args.len() > 1 && output.is_none() && !show_bytecode {
                print_usage();
                std::process::exit(1);
            }
            println!("demo mode: factorial of 10");
            demo_program()
        }
    };

    run(&program, config, show_bytecode, output);
}

fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let index = args.iter().position(|a| a == flag)?;
    match args.get(index + 1) {
        Some(value) => Some(value.as_str()),
        None => {
            eprintln!("Error: {} needs a file name", flag);
            std::process::exit(1);
        }
    }
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("kir") {
        eprintln!("Error: expected a .kir file, got {}", filename);
        std::process::exit(1);
    }
}

fn load_program(filename: &str) -> Program {
    let bytes = match fs::read(filename) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", filename, e);
            std::process::exit(1);
        }
    };
    match Program::from_bytes(&bytes) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Error in '{}': {}", filename, e);
            std::process::exit(1);
        }
    }
}

fn write_file<E: std::fmt::Display>(path: &str, bytes: Result<Vec<u8>, E>) {
    let bytes = match bytes {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = fs::write(path, bytes) {
        eprintln!("Failed to write '{}': {}", path, e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("KILN - bytecode backend for resolved programs");
    println!();
    println!("Usage:");
    println!("  kiln                        Compile and run the demo program");
    println!("  kiln <file.kir>             Compile and run a serialized program");
    println!("  kiln --bc <file.kir>        Also print the disassembly");
    println!("  kiln -o <out> <file.kir>    Write the linked bytecode instead of running it");
    println!("  kiln --write-demo <out>     Write the demo program as a .kir file");
    println!();
    println!("Options:");
    println!("  --no-opt                    Disable the peephole optimizer");
    println!("  --no-null-checks            Do not trap on null dereference");
    println!("  --no-debug                  Omit line, scope and function tables");
    println!("  --help, -h                  Show this help");
    println!();
    println!("Set RUST_LOG=kiln=debug for compiler and interpreter logs.");
}

fn run(program: &Program, config: CodegenConfig, show_bytecode: bool, output: Option<&str>) {
    let compiled = match compile(program, config) {
        Ok(compiled) => compiled,
        Err(diagnostics) => {
            eprintln!("{}", diagnostics);
            std::process::exit(1);
        }
    };
    for warning in &compiled.warnings {
        eprintln!("{}", warning);
    }

    if show_bytecode {
        print_program(&compiled.program);
    }

    if let Some(path) = output {
        write_file(path, compiled.program.to_bytes());
        return;
    }

    let mut vm = Vm::new();
    match vm.run_program(&compiled.program) {
        Ok(code) => {
            println!("exit code {}", code);
            std::process::exit(code as i32);
        }
        Err(e) => {
            let function = e.at().and_then(|at| compiled.program.function_at(at));
            match function {
                Some(name) => eprintln!("Runtime error in '{}': {}", name, e),
                None => eprintln!("Runtime error: {}", e),
            }
            std::process::exit(1);
        }
    }
}

/// `fact(n)` computed recursively, checked against a loop.
fn demo_program() -> Program {
    let i64_ty = Type::Int(IntType::I64);
    let mut p = Program::new();

    let fact = p.declare_function("fact", vec![Param::new("n", i64_ty.clone())], i64_ty.clone());
    let n = || Expr::param(0, Type::Int(IntType::I64));
    p.define_function(
        fact,
        vec![
            Stmt::if_(
                Expr::compare(CompareOp::Le, n(), Expr::i64(1)),
                vec![Stmt::ret(Some(Expr::i64(1)))],
                None,
            ),
            Stmt::ret(Some(Expr::binary(
                BinaryOp::Mul,
                n(),
                Expr::call(
                    fact,
                    vec![Expr::binary(BinaryOp::Sub, n(), Expr::i64(1))],
                    i64_ty.clone(),
                ),
            ))),
        ],
    );

    let acc = p.add_local("acc", i64_ty.clone());
    let i = p.add_local("i", i64_ty.clone());
    let acc_var = || Expr::local(acc, Type::Int(IntType::I64));
    let i_var = || Expr::local(i, Type::Int(IntType::I64));

    p.push_main(Stmt::let_(acc, Some(Expr::i64(1))));
    p.push_main(Stmt::for_(
        Some(Stmt::let_(i, Some(Expr::i64(2)))),
        Some(Expr::compare(CompareOp::Le, i_var(), Expr::i64(10))),
        Some(Stmt::assign(i_var(), Expr::binary(BinaryOp::Add, i_var(), Expr::i64(1)))),
        vec![Stmt::assign(acc_var(), Expr::binary(BinaryOp::Mul, acc_var(), i_var()))],
    ));
    // exit code 0 when both agree
    p.push_main(Stmt::ret(Some(Expr::binary(
        BinaryOp::Sub,
        Expr::call(fact, vec![Expr::i64(10)], i64_ty),
        acc_var(),
    ))));
    p
}
