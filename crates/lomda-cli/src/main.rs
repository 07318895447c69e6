use std::{
    fs,
    io::{self, BufRead, Write},
    process::ExitCode,
};

use lomda::{config, run_suite, LomdaError, Runner, StdPrint};

const USAGE: &str = "\
usage: lomda [options] [file.lom]

options:
  -c <program>          execute the literal program, then exit
  -h, --help            print this message and exit
  -O, --optimize        enable the optimizer pass
  -t                    run the built-in test suite; exit code is the failure count
      --use-module-caching
                        cache evaluated modules between imports
      --use-types       report inferred types alongside results
      --verbose         enable proof-step and debug logging
  -v, --version         print the version and exit
      --werror          treat warnings as errors

with no file, lomda starts an interactive session";

fn print_version() {
    println!("Lomda v{}", env!("CARGO_PKG_VERSION"));
}

fn report(err: &LomdaError) {
    eprintln!("\x1b[31m\x1b[1m{} error:\x1b[0m {}", err.category, err.message);
}

/// Parses and runs one program, printing its final value.
fn execute(code: &str, script_name: &str) -> ExitCode {
    let runner = match Runner::new(code, script_name) {
        Ok(r) => r,
        Err(e) => {
            report(&e);
            return ExitCode::FAILURE;
        }
    };
    if config::use_types() {
        match runner.type_check() {
            Ok(t) => println!(": {t}"),
            Err(e) => {
                if config::werror() {
                    report(&e);
                    return ExitCode::FAILURE;
                }
                eprintln!("\x1b[33mtype warning:\x1b[0m {}", e.message);
            }
        }
    }
    match runner.run(&mut StdPrint) {
        Ok(v) => {
            println!("{v}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn repl() -> ExitCode {
    print_version();
    println!("Enter a program and press <enter> to execute, or one of the following:");
    println!("'exit' - exit the interpreter");
    println!("'q/quit' - exit the interpreter");

    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return ExitCode::SUCCESS,
            Ok(_) => {}
        }
        let program = line.trim();
        match program {
            "" => {}
            "exit" | "quit" | "q" => return ExitCode::SUCCESS,
            _ => {
                let _ = execute(program, "<stdin>");
            }
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut file: Option<String> = None;
    let mut literal: Option<String> = None;
    let mut run_tests = false;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" => {
                let Some(program) = iter.next() else {
                    eprintln!("\x1b[31m\x1b[1merror:\x1b[0m -c requires a program argument");
                    return ExitCode::FAILURE;
                };
                literal = Some(program);
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            "-O" | "--optimize" => config::set_optimize(true),
            "-t" => run_tests = true,
            "--use-module-caching" => config::set_use_module_caching(true),
            "--use-types" => config::set_use_types(true),
            "--verbose" => config::set_verbosity(true),
            "-v" | "--version" => {
                print_version();
                return ExitCode::SUCCESS;
            }
            "--werror" => config::set_werror(true),
            other if other.starts_with('-') => {
                eprintln!("\x1b[31m\x1b[1merror:\x1b[0m unrecognized flag '{other}'");
                eprintln!("{USAGE}");
                return ExitCode::FAILURE;
            }
            other => file = Some(other.to_owned()),
        }
    }

    if run_tests {
        let failures = run_suite();
        return ExitCode::from(failures.min(255) as u8);
    }

    if let Some(program) = literal {
        return execute(&program, "<command-line>");
    }

    let Some(path) = file else {
        return repl();
    };
    if !path.ends_with(".lom") {
        eprintln!("\x1b[31m\x1b[1merror:\x1b[0m file '{path}' does not have extension '.lom'");
        return ExitCode::FAILURE;
    }
    let code = match fs::read_to_string(&path) {
        Ok(code) => code,
        Err(_) => {
            eprintln!("\x1b[31m\x1b[1merror:\x1b[0m could not load program from '{path}'");
            return ExitCode::FAILURE;
        }
    };
    execute(&code, &path)
}
