//! jsgate REPL
//!
//! Interactive JavaScript shell and script runner.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use jsgate::{Context, ContextOptions, Error, Value};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jsgate", version, about = "Run JavaScript in an isolated QuickJS context")]
struct Args {
    /// Script to run; starts an interactive shell when omitted
    file: Option<PathBuf>,

    /// Abort each evaluation after this many milliseconds (0 disables)
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    /// Engine heap limit in bytes
    #[arg(long)]
    max_memory: Option<usize>,
}

fn main() -> ExitCode {
    install_tracing();
    let args = Args::parse();

    let mut options = ContextOptions::default().with_timeout(Duration::from_millis(args.timeout_ms));
    if let Some(bytes) = args.max_memory {
        options = options.with_max_memory(bytes);
    }
    let ctx = match Context::with_options(options) {
        Ok(ctx) => ctx,
        Err(e) => {
            report(&e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = ctx.attach("print", print) {
        report(&e);
        return ExitCode::FAILURE;
    }

    match args.file {
        Some(path) => run_file(&ctx, &path),
        None => run_repl(&ctx),
    }
}

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// `print(...)` for scripts
fn print(args: &[Value]) -> Result<Value, jsgate::BoxError> {
    let line: Vec<String> = args
        .iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    println!("{}", line.join(" "));
    Ok(Value::Nil)
}

fn run_file(ctx: &Context, path: &PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match ctx.eval(&source) {
        Ok(result) => {
            if !result.is_nil() {
                println!("{}", result);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn run_repl(ctx: &Context) -> ExitCode {
    println!("jsgate {}", jsgate::VERSION);
    println!("Type JavaScript code to evaluate, Ctrl+D to exit.\n");

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Error starting line editor: {}", e);
            return ExitCode::FAILURE;
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                match ctx.eval(line) {
                    Ok(result) => println!("{}", result),
                    Err(e) => report(&e),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

fn report(e: &Error) {
    eprintln!("{}", e);
    for frame in e.backtrace() {
        eprintln!("    {}", frame);
    }
    if let Some(cause) = e.host_error() {
        eprintln!("caused by: {}", cause);
    }
}
