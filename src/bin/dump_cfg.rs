//! CFG dumping tool for debugging the AST lowering

use std::env;
use std::fs;

use leaklint::ast::ProgramAst;
use leaklint::cfg::Cfg;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: dump_cfg <program.json>");
        std::process::exit(1);
    }

    let file_path = &args[1];
    let source = fs::read_to_string(file_path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", file_path, e);
        std::process::exit(1);
    });

    let program: ProgramAst = serde_json::from_str(&source).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", file_path, e);
        std::process::exit(1);
    });

    println!("CFGs for {}:", file_path);
    println!("================");
    for function in &program.functions {
        match Cfg::build(function) {
            Ok(cfg) => print!("{}", cfg.render()),
            Err(err) => println!("fn {}: {}", function.name, err),
        }
        println!();
    }
}
