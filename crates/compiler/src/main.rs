//! Rill CLI
//!
//! Command-line driver: compile and run a Rill program, or just parse
//! and type-check it with `--check`. Options from a `rill.toml` next to
//! the main module are applied first; command-line flags override them.

use clap::Parser as ClapParser;
use rill_runtime::TraceOptions;
use rillc::{run_program, FlagLevel, Options};
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "rillc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A small and simple interpreted language", long_about = None)]
struct Cli {
    /// The module from which to start execution
    #[arg(long)]
    main: PathBuf,

    /// Do not run the code, only parse and type check it
    #[arg(long)]
    check: bool,

    /// Dump the contents of the AST after parsing and typechecking
    #[arg(long)]
    dump_ast: bool,

    /// Warning/error about implicit conversion between float and int
    #[arg(long, value_name = "warn|error|none")]
    implicit_float_int: Option<FlagLevel>,

    /// Gate the comma operator
    #[arg(long, value_name = "warn|error|none")]
    comma_operator: Option<FlagLevel>,

    /// Gate the ternary operator
    #[arg(long, value_name = "warn|error|none")]
    ternary_operator: Option<FlagLevel>,

    /// Gate assignment used as an expression
    #[arg(long, value_name = "warn|error|none")]
    assignment_expr: Option<FlagLevel>,

    /// Enable constant folding (default: on)
    #[arg(long, value_name = "on|off", value_parser = ["on", "off"])]
    fold_constants: Option<String>,

    /// Do not colorize output (accepted for compatibility; output is
    /// plain text)
    #[arg(long)]
    no_colorize_output: bool,

    /// Disassemble the byte code produced for the VM
    #[arg(long)]
    disassemble_code: bool,

    /// Print information during execution
    #[arg(long, value_name = "stack|frame|module|insn|module_init",
          value_parser = ["stack", "frame", "module", "insn", "module_init"])]
    trace_exec: Vec<String>,
}

fn build_options(cli: &Cli) -> Result<Options, String> {
    let mut options = Options::default();

    // File-level configuration first, CLI flags win
    if let Some(file) = rillc::load_options_file(&cli.main)? {
        options.merge_file(file);
    }

    if let Some(level) = cli.implicit_float_int {
        options.implicit_float_int = level;
    }
    if let Some(level) = cli.comma_operator {
        options.comma_operator = level;
    }
    if let Some(level) = cli.ternary_operator {
        options.ternary_operator = level;
    }
    if let Some(level) = cli.assignment_expr {
        options.assignment_expr = level;
    }
    if let Some(fold) = &cli.fold_constants {
        options.fold_constants = fold == "on";
    }
    options.check_only = cli.check;
    options.dump_ast = cli.dump_ast;
    options.disassemble_code = cli.disassemble_code;
    options.trace = TraceOptions {
        stack: cli.trace_exec.iter().any(|t| t == "stack"),
        frame: cli.trace_exec.iter().any(|t| t == "frame"),
        module: cli.trace_exec.iter().any(|t| t == "module"),
        insn: cli.trace_exec.iter().any(|t| t == "insn"),
        module_init: cli.trace_exec.iter().any(|t| t == "module_init"),
    };
    Ok(options)
}

fn main() {
    let cli = Cli::parse();

    // Execution traces are emitted at debug level on rill::trace
    let default_filter = if cli.trace_exec.is_empty() {
        "warn"
    } else {
        "warn,rill=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = match build_options(&cli) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("Error: {}", message);
            process::exit(1);
        }
    };

    match run_program(&cli.main, options, Box::new(std::io::stdout())) {
        Ok(outcome) => {
            outcome.reporter.print_to_stderr();
            if let Some(error) = &outcome.runtime_error {
                eprintln!("{}", error);
            }
            if !outcome.succeeded() {
                process::exit(1);
            }
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            process::exit(1);
        }
    }
}
