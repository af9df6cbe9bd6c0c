mod bytecode;
mod frontend;
mod lang;
mod runtime;

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::{env, fs};

use crate::bytecode::disasm::print_function;
use crate::bytecode::{compile::compile, image};
use crate::frontend::lexer::Lexer;
use crate::frontend::token_dumper::TokenDumper;
use crate::runtime::vm::{InterpretError, Vm};

const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        return;
    }

    let tokens_only = args.contains(&"--tokens".to_string());
    let no_color = args.contains(&"--no-color".to_string());
    let disasm = args.contains(&"--disasm".to_string());
    let emit_bc = args.contains(&"--emit-bc".to_string());

    // first non-flag argument is the filename
    let filename = args.iter().skip(1).find(|a| !a.starts_with('-'));

    match filename {
        Some(filename) => {
            ensure_extension(filename);

            if filename.ends_with(".cinb") {
                run_image_file(filename);
                return;
            }

            let source = match fs::read_to_string(filename) {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("failed to read '{}': {}", filename, e);
                    std::process::exit(1);
                }
            };

            if tokens_only {
                dump_tokens(&source, no_color);
            } else if emit_bc {
                emit_bytecode(&source, filename);
            } else {
                run_source(&source, disasm);
            }
        }
        None => repl(),
    }
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    let ext = path.extension().and_then(|e| e.to_str());
    if ext != Some("cin") && ext != Some("cinb") {
        eprintln!("error: expected a .cin or .cinb file, got {}", filename);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("CINDER - a small scripting language on a bytecode VM");
    println!();
    println!("Usage:");
    println!("  cinder                     Start interactive REPL");
    println!("  cinder <file.cin>          Run a script");
    println!("  cinder <file.cinb>         Run a compiled bytecode image");
    println!("  cinder --disasm <file>     Print disassembly, then run");
    println!("  cinder --emit-bc <file>    Compile to a .cinb image next to the source");
    println!("  cinder --tokens <file>     Show tokens only");
    println!("  cinder --help, -h          Show this help");
}

fn dump_tokens(source: &str, no_color: bool) {
    let tokens = Lexer::new(source).tokenize();

    let mut dumper = TokenDumper::new();
    if no_color {
        dumper = dumper.no_color();
    }
    dumper.dump(&tokens);
}

fn run_source(source: &str, disasm: bool) {
    let mut vm = Vm::new();

    if disasm {
        let function = match compile(source, vm.heap_mut()) {
            Ok(function) => function,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(EXIT_COMPILE_ERROR);
            }
        };
        print_function(vm.heap(), function);

        let mut stdout = io::stdout();
        if let Err(e) = vm.run_function(function, &mut stdout) {
            eprintln!("{}", e);
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
        return;
    }

    let mut stdout = io::stdout();
    match vm.interpret(source, &mut stdout) {
        Ok(()) => {}
        Err(InterpretError::Compile(e)) => {
            eprintln!("{}", e);
            std::process::exit(EXIT_COMPILE_ERROR);
        }
        Err(InterpretError::Runtime(e)) => {
            eprintln!("{}", e);
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}

fn emit_bytecode(source: &str, filename: &str) {
    let mut vm = Vm::new();
    let function = match compile(source, vm.heap_mut()) {
        Ok(function) => function,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(EXIT_COMPILE_ERROR);
        }
    };

    let bytes = match image::freeze(vm.heap(), function) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let out_path = Path::new(filename).with_extension("cinb");
    if let Err(e) = fs::write(&out_path, bytes) {
        eprintln!("failed to write '{}': {}", out_path.display(), e);
        std::process::exit(1);
    }
    println!("wrote {}", out_path.display());
}

fn run_image_file(filename: &str) {
    let bytes = match fs::read(filename) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("failed to read '{}': {}", filename, e);
            std::process::exit(1);
        }
    };

    let mut vm = Vm::new();
    let function = match image::thaw(vm.heap_mut(), &bytes) {
        Ok(function) => function,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(EXIT_COMPILE_ERROR);
        }
    };

    let mut stdout = io::stdout();
    if let Err(e) = vm.run_function(function, &mut stdout) {
        eprintln!("{}", e);
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

/// Line-at-a-time session against one persistent VM: globals and interned
/// strings carry over, errors are reported and the session continues.
fn repl() {
    let mut vm = Vm::new();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    print!("> ");
    let _ = stdout.flush();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                eprintln!("read error: {}", e);
                break;
            }
        };

        if !line.trim().is_empty() {
            if let Err(e) = vm.interpret(&line, &mut stdout) {
                eprintln!("{}", e);
            }
        }

        print!("> ");
        let _ = stdout.flush();
    }
    println!();
}
