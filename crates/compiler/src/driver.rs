//! Driver
//!
//! Orchestrates the pipeline across modules: resolve the main path,
//! parse and type-check it (imports recurse depth-first and register
//! themselves on the way), topologically order the parsed modules by
//! decreasing import depth, compile each to a `RuntimeModule`, and hand
//! the list to the VM with the main module last.
//!
//! Re-importing an already parsed module only raises its recorded depth
//! (to the maximum over all import paths), which keeps the dependency
//! order correct without parsing anything twice.

use crate::ast::Stmt;
use crate::codegen;
use crate::config::{Options, OptionsFile};
use crate::diagnostics::DiagnosticReporter;
use crate::dump;
use crate::resolver;
use crate::scanner::Scanner;
use crate::types::TypeDesc;
use rill_runtime::{RuntimeError, RuntimeModule, VirtualMachine};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FunctionSig {
    pub params: Vec<TypeDesc>,
    pub return_type: TypeDesc,
}

#[derive(Debug, Default)]
pub struct ParsedModule {
    pub name: String,
    /// Absolute source path
    pub path: String,
    pub statements: Vec<Stmt>,
    pub functions: HashMap<String, FunctionSig>,
    pub classes: HashSet<String>,
    /// Indices into the context's parsed-module list
    pub imported: Vec<usize>,
    /// Module-frame slots that survive to teardown, in slot order
    pub globals: Vec<TypeDesc>,
}

impl ParsedModule {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        ParsedModule {
            name: name.into(),
            path: path.into(),
            ..ParsedModule::default()
        }
    }
}

pub struct CompilerContext {
    pub reporter: DiagnosticReporter,
    pub options: Options,
    /// Parent directory of the main module; import lookups are rooted here
    pub root_path: PathBuf,
    /// Modules in parse order, each with its import depth
    pub parsed_modules: Vec<(ParsedModule, usize)>,
    /// Absolute path -> index into `parsed_modules`
    pub module_paths: HashMap<String, usize>,
    /// Modules whose parse has started but not finished, to reject
    /// import cycles instead of recursing forever
    importing: HashSet<String>,
}

impl CompilerContext {
    pub fn new(options: Options) -> Self {
        CompilerContext {
            reporter: DiagnosticReporter::new(),
            options,
            root_path: PathBuf::new(),
            parsed_modules: Vec::new(),
            module_paths: HashMap::new(),
            importing: HashSet::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        CompilerContext::new(Options::default())
    }
}

/// Resolve, read, parse and type-check one module file, registering it in
/// the context. Returns `(absolute path, module index)`.
///
/// Called for the main module by [`check_program`] and recursively by the
/// parser for every `import` statement.
pub(crate) fn import_module(
    ctx: &mut CompilerContext,
    path: &str,
    depth: usize,
) -> Result<(String, usize), String> {
    let full_path = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        ctx.root_path.join(path)
    };

    if full_path.is_dir() {
        return Err(format!(
            "'{}' represents a directory, not a file",
            full_path.display()
        ));
    }
    if !full_path.exists() {
        return Err(format!("No such file: '{}'", full_path.display()));
    }
    let absolute = std::fs::canonicalize(&full_path)
        .map_err(|e| format!("Unable to resolve '{}': {}", full_path.display(), e))?;
    let absolute_str = absolute.to_string_lossy().into_owned();

    // Already imported: only the recorded depth may need raising
    if let Some(&index) = ctx.module_paths.get(&absolute_str) {
        if ctx.parsed_modules[index].1 < depth {
            raise_module_depth(ctx, index, depth);
        }
        return Ok((absolute_str, index));
    }

    if ctx.importing.contains(&absolute_str) {
        return Err(format!(
            "Circular import of module '{}'",
            absolute.display()
        ));
    }
    ctx.importing.insert(absolute_str.clone());

    let source = std::fs::read_to_string(&absolute).map_err(|e| {
        format!("Unable to open module '{}': {}", absolute.display(), e)
    })?;
    let name = absolute
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| absolute_str.clone());

    let mut module = ParsedModule::new(name.clone(), absolute_str.clone());
    let scanner = Scanner::new(&source, &name);
    let statements = {
        let mut parser = crate::parser::Parser::new(ctx, &mut module, scanner, depth);
        parser.program()
    };
    module.statements = statements;

    resolver::resolve_module(
        &mut ctx.reporter,
        &ctx.options,
        &ctx.parsed_modules,
        &mut module,
    );

    ctx.importing.remove(&absolute_str);
    let index = ctx.parsed_modules.len();
    ctx.module_paths.insert(absolute_str.clone(), index);
    ctx.parsed_modules.push((module, depth));
    Ok((absolute_str, index))
}

fn raise_module_depth(ctx: &mut CompilerContext, index: usize, depth: usize) {
    ctx.parsed_modules[index].1 = depth;
    let imported = ctx.parsed_modules[index].0.imported.clone();
    for child in imported {
        if ctx.parsed_modules[child].1 < depth + 1 {
            raise_module_depth(ctx, child, depth + 1);
        }
    }
}

/// Load `rill.toml` next to the main module, if present.
pub fn load_options_file(main_path: &Path) -> Result<Option<OptionsFile>, String> {
    let directory = main_path.parent().unwrap_or_else(|| Path::new("."));
    let config_path = directory.join("rill.toml");
    if !config_path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("Unable to read '{}': {}", config_path.display(), e))?;
    OptionsFile::from_toml(&text).map(Some)
}

/// Parse and type-check the main module and everything it imports.
pub fn check_program(main_path: &Path, options: Options) -> Result<CompilerContext, String> {
    let mut ctx = CompilerContext::new(options);

    if main_path.is_dir() {
        return Err(format!(
            "'{}' represents a directory, not a file",
            main_path.display()
        ));
    }
    if !main_path.exists() {
        return Err(format!("No such file: '{}'", main_path.display()));
    }
    let absolute = std::fs::canonicalize(main_path)
        .map_err(|e| format!("Unable to resolve '{}': {}", main_path.display(), e))?;
    ctx.root_path = absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    import_module(&mut ctx, &absolute.to_string_lossy(), 0)?;
    Ok(ctx)
}

/// Compile every parsed module in dependency order (imports before
/// importers, main last). Returns the modules ready for the VM.
pub fn compile_program(ctx: &CompilerContext) -> Vec<RuntimeModule> {
    let mut order: Vec<usize> = (0..ctx.parsed_modules.len()).collect();
    // Stable sort: ties stay in parse order
    order.sort_by_key(|&index| std::cmp::Reverse(ctx.parsed_modules[index].1));

    let final_index: HashMap<String, usize> = order
        .iter()
        .enumerate()
        .map(|(position, &index)| (ctx.parsed_modules[index].0.path.clone(), position))
        .collect();

    order
        .iter()
        .enumerate()
        .map(|(position, &index)| {
            let (module, depth) = &ctx.parsed_modules[index];
            codegen::compile_module(ctx, module, &final_index, position, *depth == 0)
        })
        .collect()
}

/// Everything the CLI needs to know about one program run.
pub struct ProgramOutcome {
    pub reporter: DiagnosticReporter,
    pub runtime_error: Option<RuntimeError>,
    /// False when diagnostics (or `--check`) prevented execution
    pub ran: bool,
}

impl ProgramOutcome {
    pub fn succeeded(&self) -> bool {
        !self.reporter.had_error() && self.runtime_error.is_none()
    }
}

/// The whole pipeline: check, compile, run. Program output goes to
/// `output` (stdout for the CLI, a buffer in tests).
pub fn run_program(
    main_path: &Path,
    options: Options,
    output: Box<dyn Write>,
) -> Result<ProgramOutcome, String> {
    let check_only = options.check_only;
    let dump_ast = options.dump_ast;
    let disassemble = options.disassemble_code;
    let trace = options.trace;

    let ctx = check_program(main_path, options)?;

    if dump_ast {
        for (module, _) in &ctx.parsed_modules {
            println!("{}", dump::format_ast(module));
        }
    }

    if ctx.reporter.had_error() || check_only {
        return Ok(ProgramOutcome {
            reporter: ctx.reporter,
            runtime_error: None,
            ran: false,
        });
    }

    let modules = compile_program(&ctx);
    if disassemble {
        for module in &modules {
            println!("{}", dump::disassemble_module(module));
        }
    }

    let mut vm = VirtualMachine::with_output(output);
    vm.set_trace(trace);
    let runtime_error = vm.run(modules).err();

    Ok(ProgramOutcome {
        reporter: ctx.reporter,
        runtime_error,
        ran: true,
    })
}
