use std::{env, fs, io, process};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cinder::bytecode::compile::{CompileOptions, Compiler};
use cinder::bytecode::disasm::{print_program, print_program_stats};
use cinder::bytecode::ir::ProgramBc;
use cinder::lang::build::*;
use cinder::lang::node::{BinaryOp, StoreOp};
use cinder::lang::program::Program;
use cinder::lang::types::VarType;
use cinder::runtime::{HostValue, HostVar, NativeTable, VmBc, VmBcConfig};

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let options = match Options::parse(args.get(1..).unwrap_or_default()) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            process::exit(2);
        }
    };

    if let Some(path) = &options.load {
        run_image(path, &options);
        return;
    }

    let selected: Vec<&Demo> = match &options.demo {
        Some(name) => match DEMOS.iter().find(|d| d.name == name) {
            Some(demo) => vec![demo],
            None => {
                eprintln!("Unknown demo '{}'", name);
                print_usage();
                process::exit(2);
            }
        },
        None => DEMOS.iter().collect(),
    };

    for demo in selected {
        run_demo(demo, &options);
    }
}

struct Options {
    bytecode: bool,
    stats: bool,
    strict: bool,
    emit: Option<String>,
    load: Option<String>,
    max_steps: Option<u64>,
    demo: Option<String>,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut options = Options {
            bytecode: false,
            stats: false,
            strict: false,
            emit: None,
            load: None,
            max_steps: None,
            demo: None,
        };

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--bc" | "--bytecode" => options.bytecode = true,
                "--stats" => options.stats = true,
                "--strict" => options.strict = true,
                "--emit" => options.emit = Some(value_of(&mut iter, "--emit")?),
                "--load" => options.load = Some(value_of(&mut iter, "--load")?),
                "--max-steps" => {
                    let raw = value_of(&mut iter, "--max-steps")?;
                    let steps = raw
                        .parse()
                        .map_err(|_| format!("--max-steps expects a number, got '{}'", raw))?;
                    options.max_steps = Some(steps);
                }
                flag if flag.starts_with('-') => return Err(format!("unknown flag '{}'", flag)),
                name => options.demo = Some(name.to_string()),
            }
        }
        Ok(options)
    }

    fn vm_config(&self) -> VmBcConfig {
        VmBcConfig {
            max_steps: self.max_steps,
            ..VmBcConfig::default()
        }
    }
}

fn value_of<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<String, String> {
    iter.next()
        .cloned()
        .ok_or_else(|| format!("{} expects a value", flag))
}

fn print_usage() {
    println!("CINDER - typed AST to stack bytecode translator and interpreter");
    println!();
    println!("Usage:");
    println!("  cinder                    Run every demo program");
    println!("  cinder <demo>             Run one demo ({})", demo_names());
    println!("  cinder --bc <demo>        Print the bytecode before running");
    println!("  cinder --stats <demo>     Print opcode statistics");
    println!("  cinder --strict <demo>    Check return types while translating");
    println!("  cinder --emit <path> <demo>  Write the compiled image to <path>");
    println!("  cinder --load <path>      Run a compiled image");
    println!("  cinder --max-steps <n>    Stop after n instructions");
    println!("  cinder --help, -h         Show this help");
    println!();
    println!("Set RUST_LOG=cinder=debug (or trace) for translator and VM logs.");
}

fn demo_names() -> String {
    DEMOS.iter().map(|d| d.name).collect::<Vec<_>>().join(", ")
}

// =============================================================================
// Running
// =============================================================================

fn run_demo(demo: &Demo, options: &Options) {
    println!("── {} ──", demo.name);
    let program = (demo.build)();

    let compiler = Compiler::with_options(CompileOptions {
        strict_returns: options.strict,
    });
    let compiled = match compiler.compile_program(&program) {
        Ok(compiled) => compiled,
        Err(e) => {
            eprintln!("Compile error: {}", e);
            process::exit(1);
        }
    };

    if let Some(path) = &options.emit {
        emit_image(&compiled, path);
    }

    execute(&compiled, options, demo.host_vars);
    println!();
}

fn emit_image(compiled: &ProgramBc, path: &str) {
    let bytes = match compiled.to_image() {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = fs::write(path, &bytes) {
        eprintln!("Failed to write '{}': {}", path, e);
        process::exit(1);
    }
    println!("wrote {} bytes to {}", bytes.len(), path);
}

fn run_image(path: &str, options: &Options) {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", path, e);
            process::exit(1);
        }
    };
    match ProgramBc::from_image(&bytes) {
        Ok(compiled) => execute(&compiled, options, &[]),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn execute(compiled: &ProgramBc, options: &Options, host_vars: &[(&str, i64)]) {
    if options.bytecode {
        print_program(compiled);
    }
    if options.stats {
        print_program_stats(compiled);
    }

    let mut vars: Vec<HostVar> = host_vars
        .iter()
        .map(|(name, value)| HostVar::new(name, HostValue::Int(*value)))
        .collect();
    let mut natives = NativeTable::with_math();
    let mut vm = VmBc::with_config(options.vm_config());

    if let Err(e) = vm.run(compiled, &mut vars, &mut natives) {
        println!();
        eprintln!("{}", e);
        process::exit(1);
    }

    for var in &vars {
        println!("[host] {} = {}", var.name, var.value);
    }
}

// =============================================================================
// Demo programs
// =============================================================================

struct Demo {
    name: &'static str,
    build: fn() -> Program,
    host_vars: &'static [(&'static str, i64)],
}

const DEMOS: &[Demo] = &[
    Demo {
        name: "loops",
        build: loops,
        host_vars: &[],
    },
    Demo {
        name: "fib",
        build: fib,
        host_vars: &[],
    },
    Demo {
        name: "mixed",
        build: mixed,
        host_vars: &[],
    },
    Demo {
        name: "natives",
        build: natives,
        host_vars: &[],
    },
    Demo {
        name: "host",
        build: host,
        host_vars: &[("n", 10), ("sum", 0)],
    },
];

/// `for (i in 1..5) print(i);` then a countdown with `while`.
fn loops() -> Program {
    let mut program = Program::new();
    let top = program.top_scope();
    program
        .declare_var(top, "i", VarType::Integer)
        .declare_var(top, "k", VarType::Integer);
    let for_body = program.add_scope(top);
    let while_body = program.add_scope(top);

    program.define_top(vec![
        for_loop(
            "i",
            range(int(1), int(5)),
            block(for_body, vec![print(vec![load("i")])]),
        ),
        print(vec![string("\n")]),
        assign("k", int(3)),
        while_loop(
            binary(BinaryOp::Gt, load("k"), int(0)),
            block(
                while_body,
                vec![
                    print(vec![load("k"), string(" ")]),
                    store("k", StoreOp::SubAssign, int(1)),
                ],
            ),
        ),
    ]);
    program
}

/// Recursive Fibonacci over 0..15.
fn fib() -> Program {
    let mut program = Program::new();
    let top = program.top_scope();
    program.declare_var(top, "i", VarType::Integer);

    let body = program.declare_function(top, "fib", VarType::Integer, &[("n", VarType::Integer)]);
    let base = program.add_scope(body);
    program.define(
        body,
        vec![
            if_else(
                binary(BinaryOp::Lt, load("n"), int(2)),
                block(base, vec![ret(Some(load("n")))]),
                None,
            ),
            ret(Some(add(
                call("fib", vec![sub(load("n"), int(1))]),
                call("fib", vec![sub(load("n"), int(2))]),
            ))),
        ],
    );

    let loop_body = program.add_scope(top);
    program.define_top(vec![for_loop(
        "i",
        range(int(0), int(15)),
        block(
            loop_body,
            vec![print(vec![call("fib", vec![load("i")]), string(" ")])],
        ),
    )]);
    program
}

/// Int/double promotion and numeric coercion on assignment.
fn mixed() -> Program {
    let mut program = Program::new();
    let top = program.top_scope();
    program
        .declare_var(top, "r", VarType::Integer)
        .declare_var(top, "area", VarType::Double)
        .declare_var(top, "whole", VarType::Integer);

    program.define_top(vec![
        assign("r", int(3)),
        assign("area", mul(mul(load("r"), load("r")), double(3.14159))),
        assign("whole", load("area")),
        print(vec![
            string("area of r=3: "),
            load("area"),
            string(", truncated: "),
            load("whole"),
        ]),
    ]);
    program
}

/// Host functions reached through `CALLNATIVE`.
fn natives() -> Program {
    let mut program = Program::new();
    let top = program.top_scope();
    program.declare_native(top, "sqrt", VarType::Double, &[("x", VarType::Double)], "sqrt");
    program.declare_native(top, "strlen", VarType::Integer, &[("s", VarType::String)], "strlen");

    program.define_top(vec![print(vec![
        string("sqrt(2) = "),
        call("sqrt", vec![int(2)]),
        string(", strlen(\"cinder\") = "),
        call("strlen", vec![string("cinder")]),
    ])]);
    program
}

/// Sum 1..n where `n` comes from the host and `sum` goes back to it.
fn host() -> Program {
    let mut program = Program::new();
    let top = program.top_scope();
    program
        .declare_var(top, "n", VarType::Integer)
        .declare_var(top, "sum", VarType::Integer)
        .declare_var(top, "i", VarType::Integer);
    let body = program.add_scope(top);

    program.define_top(vec![for_loop(
        "i",
        range(int(1), load("n")),
        block(body, vec![store("sum", StoreOp::AddAssign, load("i"))]),
    )]);
    program
}
