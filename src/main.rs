use std::{env, fs};

use bvm::bytecode::disasm::disassemble;
use bvm::lang::node::{BinaryOp, Node, VarDef};
use bvm::lang::types::Type;
use bvm::lang::value::Value;
use bvm::runtime::host::EnvItem;
use bvm::{Vm, VmSettings};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    match args.get(1).map(String::as_str) {
        None => run_demo(None),
        Some("demo") => run_demo(flag_values(&args, "--save").first().copied()),
        Some("run") => match args.get(2) {
            Some(file) => run_artifact(file, &args),
            None => fail("run: missing artifact file"),
        },
        Some("disasm") => match args.get(2) {
            Some(file) => {
                let vm = load(file, Vec::new());
                for contract in vm.contracts() {
                    print!("{}", disassemble(contract));
                }
            }
            None => fail("disasm: missing artifact file"),
        },
        Some(_) => print_usage(),
    }
}

fn print_usage() {
    println!("BVM - contract compiler and bytecode VM");
    println!();
    println!("Usage:");
    println!("  bvm                                Run the demo contract");
    println!("  bvm demo [--save <file>]           Run the demo, optionally saving its artifact");
    println!("  bvm run <file> [options]           Run a compiled artifact");
    println!("      --gas <n>                      Gas limit (default 100000)");
    println!("      --param <name>=<value>         Contract parameter (repeatable)");
    println!("      --env <name>:<type>=<value>    Environment item (repeatable, in declaration order)");
    println!("      --bc                           Print the disassembly before running");
    println!("  bvm disasm <file>                  Disassemble a compiled artifact");
    println!("  bvm --help, -h                     Show this help");
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

/// Values following every occurrence of `flag`.
fn flag_values<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].as_str())
        .collect()
}

fn load(file: &str, env: Vec<EnvItem>) -> Vm {
    let bytes = match fs::read(file) {
        Ok(bytes) => bytes,
        Err(e) => fail(&format!("failed to read '{}': {}", file, e)),
    };
    let mut vm = Vm::new(VmSettings {
        env,
        ..VmSettings::default()
    });
    if let Err(e) = vm.load_artifact(&bytes) {
        fail(&format!("'{}': {}", file, e));
    }
    vm
}

fn run_artifact(file: &str, args: &[String]) {
    let gas = match flag_values(args, "--gas").last() {
        Some(text) => match text.parse::<i64>() {
            Ok(gas) => gas,
            Err(_) => fail(&format!("invalid gas limit '{}'", text)),
        },
        None => VmSettings::default().gas_limit,
    };

    let mut env_items = Vec::new();
    let mut env_values = Vec::new();
    for spec in flag_values(args, "--env") {
        let Some((decl, text)) = spec.split_once('=') else {
            fail(&format!("expected --env name:type=value, got '{}'", spec));
        };
        let Some((name, ty)) = decl.split_once(':').and_then(|(n, t)| Some((n, Type::parse(t)?))) else {
            fail(&format!("invalid environment declaration '{}'", decl));
        };
        match Value::from_text(ty, text) {
            Ok(value) => env_values.push((name.to_string(), value)),
            Err(e) => fail(&e.to_string()),
        }
        env_items.push(EnvItem::new(name, ty));
    }

    let mut vm = load(file, env_items);
    for (name, value) in env_values {
        if let Err(e) = vm.set_env(&name, value) {
            fail(&e.to_string());
        }
    }
    let Some(contract) = vm.contracts().first().cloned() else {
        fail("artifact holds no contract");
    };

    if args.iter().any(|a| a == "--bc") {
        print!("{}", disassemble(&contract));
    }

    let mut params = Vec::new();
    for spec in flag_values(args, "--param") {
        let Some((name, text)) = spec.split_once('=') else {
            fail(&format!("expected --param name=value, got '{}'", spec));
        };
        let Some(info) = contract.params.get(name) else {
            fail(&format!("contract {} doesn't have {} parameter", contract.name, name));
        };
        match Value::from_text(info.ty, text) {
            Ok(value) => params.push((name, value)),
            Err(e) => fail(&e.to_string()),
        }
    }

    match vm.call(&contract.name, &params, gas) {
        Ok(outcome) => {
            println!("gas used: {}", outcome.gas_used);
            match outcome.error {
                Some(e) => fail(&format!("runtime error: {}", e)),
                None => println!("{}", outcome.result),
            }
        }
        Err(e) => fail(&e.to_string()),
    }
}

/// `fib(n)` computed recursively.
fn demo_contract() -> Node {
    use BinaryOp::{Add, Lt, Sub};

    let fib = Node::func(
        "fib",
        vec![VarDef::param("n", Type::INT)],
        Some(Type::INT),
        vec![
            Node::if_else(
                Node::binary(Lt, Node::var("n"), Node::int(2)),
                vec![Node::ret(Some(Node::var("n")))],
                None,
            ),
            Node::ret(Some(Node::binary(
                Add,
                Node::call("fib", vec![Node::binary(Sub, Node::var("n"), Node::int(1))]),
                Node::call("fib", vec![Node::binary(Sub, Node::var("n"), Node::int(2))]),
            ))),
        ],
    );
    Node::contract(
        "Fib",
        false,
        vec![VarDef::param("n", Type::INT)],
        vec![fib, Node::ret(Some(Node::call("fib", vec![Node::var("n")])))],
    )
}

fn run_demo(save: Option<&str>) {
    let mut vm = Vm::new(VmSettings::default());
    if let Err(e) = vm.load(&demo_contract()) {
        fail(&format!("compile error: {}", e));
    }
    if let Some(contract) = vm.contract("Fib") {
        print!("{}", disassemble(contract));
    }

    for n in [1, 5, 10, 15] {
        match vm.call_default("Fib", &[("n", Value::Int(n))]) {
            Ok(outcome) => match outcome.error {
                Some(e) => println!("fib({}) failed after {} gas: {}", n, outcome.gas_used, e),
                None => println!("fib({}) = {} ({} gas)", n, outcome.result, outcome.gas_used),
            },
            Err(e) => fail(&e.to_string()),
        }
    }

    if let Some(file) = save {
        match vm.artifact("Fib") {
            Ok(bytes) => match fs::write(file, bytes) {
                Ok(()) => println!("saved {}", file),
                Err(e) => fail(&format!("failed to write '{}': {}", file, e)),
            },
            Err(e) => fail(&e.to_string()),
        }
    }
}
