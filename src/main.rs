use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::debug;

use cinder::bytecode::disasm::print_program;
use cinder::frontend::{shape_source, token_dumper::TokenDumper};
use cinder::runtime::VmConfig;
use cinder::{Dump, Error, Session, SessionConfig};

#[derive(Parser)]
#[command(name = "cinder")]
#[command(about = "Compile and run Go-flavoured programs on a stack VM", long_about = None)]
struct Cli {
    /// Program to run (.go); `main` is called when it declares one
    file: Option<PathBuf>,

    /// Evaluate a snippet instead of a file
    #[arg(short, long, conflicts_with = "file")]
    eval: Option<String>,

    /// Start an interactive session
    #[arg(short = 'i', long)]
    repl: bool,

    /// Print the shaped token stream and exit
    #[arg(long)]
    tokens: bool,

    /// Disable colors in token output
    #[arg(long)]
    no_color: bool,

    /// Print the compiled program after running
    #[arg(long, alias = "bc")]
    bytecode: bool,

    /// Stop after this many executed instructions
    #[arg(long)]
    max_steps: Option<usize>,

    /// Restore globals from a snapshot before calling `main`
    #[arg(long, value_name = "PATH")]
    load: Option<PathBuf>,

    /// Write a snapshot of the globals when done
    #[arg(long, value_name = "PATH")]
    save: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        })
    });
    let formatter = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_level(true);
    tracing_subscriber::registry().with(formatter).with(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = SessionConfig {
        vm: VmConfig {
            max_steps: cli.max_steps,
            ..VmConfig::default()
        },
    };
    let mut session = Session::with_config(config);

    let source = match (&cli.file, &cli.eval) {
        (Some(path), _) => match read_source(path) {
            Ok(source) => Some(source),
            Err(message) => {
                eprintln!("{}", message);
                return ExitCode::FAILURE;
            }
        },
        (None, Some(snippet)) => Some(snippet.clone()),
        (None, None) => None,
    };

    let Some(source) = source else {
        return repl(&mut session);
    };

    if cli.tokens {
        return dump_tokens(&source, cli.no_color);
    }

    let outcome = run(&mut session, &source, &cli);
    if cli.bytecode {
        print_program(session.program());
    }
    match outcome {
        Ok(()) if cli.repl => repl(&mut session),
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}

fn read_source(path: &Path) -> Result<String, String> {
    if path.extension().and_then(|e| e.to_str()) != Some("go") {
        return Err(format!("Error: expected a .go file, got {}", path.display()));
    }
    fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path.display(), e))
}

fn dump_tokens(source: &str, no_color: bool) -> ExitCode {
    let mut labels = 0;
    match shape_source(source, &mut labels) {
        Ok(tokens) => {
            let mut dumper = TokenDumper::new();
            if no_color {
                dumper = dumper.no_color();
            }
            dumper.dump(&tokens);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(session: &mut Session, source: &str, cli: &Cli) -> Result<(), String> {
    let result = session.eval(source).map_err(|e| e.to_string())?;

    if let Some(path) = &cli.load {
        let bytes = fs::read(path).map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
        let dump = Dump::from_bytes(&bytes).map_err(|e| e.to_string())?;
        session.apply_dump(&dump).map_err(|e| e.to_string())?;
        debug!(records = dump.records.len(), "snapshot loaded");
    }

    if cli.file.is_some() && session.has_func("main") {
        session.call("main").map_err(|e| e.to_string())?;
    } else if let Some(value) = result {
        if cli.eval.is_some() {
            println!("{}", value);
        }
    }

    if let Some(path) = &cli.save {
        let bytes = session
            .dump()
            .and_then(|d| d.to_bytes().map_err(Error::from))
            .map_err(|e| e.to_string())?;
        fs::write(path, bytes).map_err(|e| format!("Failed to write '{}': {}", path.display(), e))?;
    }
    Ok(())
}

/// Reads chunks line by line; an open block or string keeps the chunk
/// going until it is closed.
fn repl(session: &mut Session) -> ExitCode {
    println!("cinder - type Go statements, Ctrl-D to exit");
    let stdin = io::stdin();
    let mut chunk = String::new();
    let mut lines = stdin.lock().lines();

    loop {
        print!("{}", if chunk.is_empty() { "> " } else { "... " });
        if io::stdout().flush().is_err() {
            return ExitCode::FAILURE;
        }
        let Some(Ok(line)) = lines.next() else {
            println!();
            return ExitCode::SUCCESS;
        };
        chunk.push_str(&line);
        chunk.push('\n');

        match session.eval(&chunk) {
            Ok(Some(value)) => println!("{}", value),
            Ok(None) => {}
            Err(e) if e.is_incomplete() => continue,
            Err(e) => eprintln!("{}", e),
        }
        chunk.clear();
    }
}
