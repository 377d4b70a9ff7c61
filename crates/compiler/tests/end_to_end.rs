//! End-to-end pipeline tests: source text through scanner, parser,
//! resolver, code generator and the VM, with program output captured
//! through the VM's injectable sink.

use rill_runtime::VirtualMachine;
use rillc::{check_program, compile_program, run_program, Options};
use std::cell::RefCell;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use tempfile::TempDir;

/// Shared buffer handed to the VM as its output sink.
#[derive(Clone, Default)]
struct Sink(Rc<RefCell<Vec<u8>>>);

impl Sink {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn write_module(dir: &TempDir, name: &str, source: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, source).expect("failed to write test module");
    path
}

/// Run a single-module program and return its output.
fn run_source(source: &str) -> String {
    let dir = TempDir::new().expect("tempdir");
    let path = write_module(&dir, "main.rill", source);
    let sink = Sink::default();
    let outcome = run_program(&path, Options::default(), Box::new(sink.clone()))
        .expect("driver should not fail");
    assert!(
        outcome.succeeded(),
        "program failed:\n{}{}",
        outcome.reporter.format_all(),
        outcome
            .runtime_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default()
    );
    sink.contents()
}

fn run_source_expecting_runtime_error(source: &str) -> rill_runtime::RuntimeError {
    let dir = TempDir::new().expect("tempdir");
    let path = write_module(&dir, "main.rill", source);
    let sink = Sink::default();
    let outcome = run_program(&path, Options::default(), Box::new(sink.clone()))
        .expect("driver should not fail");
    assert!(
        !outcome.reporter.had_error(),
        "unexpected compile errors:\n{}",
        outcome.reporter.format_all()
    );
    outcome.runtime_error.expect("expected a runtime error")
}

#[test]
fn test_arithmetic_with_folding() {
    let output = run_source(
        "fn main() -> int { var x: int = 2 + 3 * 4; print(x); return 0; }\n",
    );
    assert_eq!(output, "14");
}

#[test]
fn test_string_concatenation() {
    let output = run_source(
        "fn main() -> int { var s: string = \"hello, \" + \"world\"; print(s); return 0; }\n",
    );
    assert_eq!(output, "hello, world");
}

#[test]
fn test_list_literal_and_assignment() {
    let output = run_source(
        "fn main() -> int { var xs: [int] = [1, 2, 3]; xs[1] = 42; print(xs); return 0; }\n",
    );
    assert_eq!(output, "[1, 42, 3]");
}

#[test]
fn test_recursive_factorial() {
    let output = run_source(
        "fn f(x: int) -> int { if (x == 0) { return 1; } return x * f(x-1); } \
         fn main() -> int { print(f(5)); return 0; }\n",
    );
    assert_eq!(output, "120");
}

#[test]
fn test_for_loop_desugaring() {
    let output = run_source(
        "fn main() -> int { var i: int = 0; \
         for (var j: int = 0; j < 3; j += 1) { i += j; } \
         print(i); return 0; }\n",
    );
    assert_eq!(output, "3");
}

#[test]
fn test_division_by_zero_is_a_runtime_error() {
    let error = run_source_expecting_runtime_error(
        "fn main() -> int { var z: int = 0; print(10 / z); return 0; }\n",
    );
    assert_eq!(error.message, "Cannot divide by zero");
    assert_eq!(error.line, 1);
}

#[test]
fn test_negative_shift_is_a_runtime_error() {
    let error = run_source_expecting_runtime_error(
        "fn main() -> int { var n: int = 0 - 2; print(1 << n); return 0; }\n",
    );
    assert_eq!(error.message, "Cannot bitshift with value less than zero");
}

#[test]
fn test_index_out_of_range_is_a_runtime_error() {
    let error = run_source_expecting_runtime_error(
        "fn main() -> int { var xs: [int] = [1]; print(xs[3]); return 0; }\n",
    );
    assert_eq!(error.message, "List index out of range");
}

#[test]
fn test_trap_return() {
    let error = run_source_expecting_runtime_error(
        "fn f() -> int { var x: int = 1; x = 2; } \
         fn main() -> int { print(f()); return 0; }\n",
    );
    assert_eq!(error.message, "Reached end of non-null function");
}

#[test]
fn test_while_with_break_and_continue() {
    let output = run_source(
        "fn main() -> int { var i: int = 0; var total: int = 0; \
         while i < 10 { i += 1; if (i == 3) { continue; } if (i == 6) { break; } total += i; } \
         print(total); return 0; }\n",
    );
    // 1 + 2 + 4 + 5
    assert_eq!(output, "12");
}

#[test]
fn test_switch_statement() {
    let output = run_source(
        "fn describe(x: int) -> int { \
           switch x { \
             1 -> { print(\"one\"); } \
             2 -> { print(\"two\"); } \
             default -> { print(\"many\"); } \
           } \
           return 0; } \
         fn main() -> int { describe(2); describe(9); return 0; }\n",
    );
    assert_eq!(output, "twomany");
}

#[test]
fn test_ref_parameter_mutates_caller_local() {
    let output = run_source(
        "fn bump(x: ref int) -> null { x = x + 1; } \
         fn main() -> int { var v: int = 41; bump(v); print(v); return 0; }\n",
    );
    assert_eq!(output, "42");
}

#[test]
fn test_lists_have_value_semantics_at_assignment() {
    let output = run_source(
        "fn main() -> int { var a: [int] = [1, 2]; var b: [int] = a; \
         b[0] = 9; print(a); print(b); return 0; }\n",
    );
    assert_eq!(output, "[1, 2][9, 2]");
}

#[test]
fn test_move_transfers_list_ownership() {
    let output = run_source(
        "fn main() -> int { var a: [int] = [7]; var b: [int] = move a; print(b); return 0; }\n",
    );
    assert_eq!(output, "[7]");
}

#[test]
fn test_list_repeat_initializer() {
    let output = run_source(
        "fn main() -> int { var xs: [int] = [0; 4]; xs[2] = 5; print(xs); return 0; }\n",
    );
    assert_eq!(output, "[0, 0, 5, 0]");
}

#[test]
fn test_tuple_field_access() {
    let output = run_source(
        "fn main() -> int { var t: {int, string} = {1, \"a\"}; print(t.0); print(t.1); return 0; }\n",
    );
    assert_eq!(output, "1a");
}

#[test]
fn test_native_conversions() {
    let output = run_source(
        "fn main() -> int { print(int(\"41\") + 1); print(string(7) + \"!\"); return 0; }\n",
    );
    assert_eq!(output, "427!");
}

#[test]
fn test_string_ordering_and_equality() {
    let output = run_source(
        "fn main() -> int { var a: string = \"abc\"; var b: string = \"abd\"; \
         if (a < b) { print(\"lt\"); } if (a == a) { print(\"eq\"); } return 0; }\n",
    );
    assert_eq!(output, "lteq");
}

#[test]
fn test_ternary_allowed_when_flag_off() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_module(
        &dir,
        "main.rill",
        "fn main() -> int { var x: int = 1 == 1 ? 5 : 6; print(x); return 0; }\n",
    );
    let sink = Sink::default();
    let mut options = Options::default();
    options.ternary_operator = rillc::FlagLevel::None;
    let outcome =
        run_program(&path, options, Box::new(sink.clone())).expect("driver should not fail");
    assert!(outcome.succeeded(), "{}", outcome.reporter.format_all());
    assert_eq!(sink.contents(), "5");
}

// ----------------------------------------------------------------------
// Imports and module lifecycle
// ----------------------------------------------------------------------

#[test]
fn test_import_initialization_order() {
    let dir = TempDir::new().expect("tempdir");
    write_module(&dir, "util.rill", "print(\"util-init \")\n");
    let main = write_module(
        &dir,
        "main.rill",
        "import \"util.rill\";\nprint(\"main-init\")\n",
    );
    let sink = Sink::default();
    let outcome = run_program(&main, Options::default(), Box::new(sink.clone()))
        .expect("driver should not fail");
    assert!(outcome.succeeded(), "{}", outcome.reporter.format_all());
    // The imported module's top-level code runs before the importer's
    assert_eq!(sink.contents(), "util-init main-init");
}

#[test]
fn test_cross_module_function_call() {
    let dir = TempDir::new().expect("tempdir");
    write_module(
        &dir,
        "util.rill",
        "fn double(x: int) -> int { return x * 2; }\n",
    );
    let main = write_module(
        &dir,
        "main.rill",
        "import \"util.rill\";\nfn main() -> int { print(util::double(21)); return 0; }\n",
    );
    let sink = Sink::default();
    let outcome = run_program(&main, Options::default(), Box::new(sink.clone()))
        .expect("driver should not fail");
    assert!(outcome.succeeded(), "{}", outcome.reporter.format_all());
    assert_eq!(sink.contents(), "42");
}

#[test]
fn test_reimport_is_idempotent_and_depth_is_maxed() {
    let dir = TempDir::new().expect("tempdir");
    write_module(&dir, "leaf.rill", "fn id(x: int) -> int { return x; }\n");
    write_module(&dir, "mid.rill", "import \"leaf.rill\";\n");
    let main = write_module(
        &dir,
        "main.rill",
        "import \"leaf.rill\";\nimport \"mid.rill\";\n",
    );

    let ctx = check_program(&main, Options::default()).expect("check should pass");
    assert!(!ctx.reporter.had_error(), "{}", ctx.reporter.format_all());
    // leaf, mid, main: exactly one entry per module
    assert_eq!(ctx.parsed_modules.len(), 3);

    let leaf_depth = ctx
        .parsed_modules
        .iter()
        .find(|(module, _)| module.name == "leaf")
        .map(|(_, depth)| *depth)
        .expect("leaf parsed");
    // Imported at depth 1 by main and at depth 2 through mid: max wins
    assert_eq!(leaf_depth, 2);
}

// ----------------------------------------------------------------------
// Resource invariants
// ----------------------------------------------------------------------

/// After a legal program runs to completion, every string insert has
/// been matched by a remove and every list has exactly one owner that
/// destroyed it.
#[test]
fn test_cache_and_heap_are_empty_after_execution() {
    let dir = TempDir::new().expect("tempdir");
    let main = write_module(
        &dir,
        "main.rill",
        "var greeting: string = \"hello\"\n\
         var words: [string] = [\"a\", \"b\"]\n\
         fn shout(s: string) -> string { return s + \"!\"; } \
         fn main() -> int { \
           var local: string = greeting + \" there\"; \
           var nested: [[int]] = [[1], [2, 3]]; \
           print(shout(local)); \
           print(nested); \
           return 0; }\n",
    );

    let ctx = check_program(&main, Options::default()).expect("check should pass");
    assert!(!ctx.reporter.had_error(), "{}", ctx.reporter.format_all());
    let modules = compile_program(&ctx);

    let sink = Sink::default();
    let mut vm = VirtualMachine::with_output(Box::new(sink.clone()));
    vm.run(modules).expect("program should run");

    assert_eq!(sink.contents(), "hello there![[1], [2, 3]]");
    assert_eq!(vm.cache_len(), 0, "string cache must be empty");
    assert_eq!(vm.live_lists(), 0, "list heap must be empty");
}

#[test]
fn test_check_only_reports_without_running() {
    let dir = TempDir::new().expect("tempdir");
    let main = write_module(
        &dir,
        "main.rill",
        "fn main() -> int { print(\"side effect\"); return 0; }\n",
    );
    let sink = Sink::default();
    let mut options = Options::default();
    options.check_only = true;
    let outcome =
        run_program(&main, options, Box::new(sink.clone())).expect("driver should not fail");
    assert!(outcome.succeeded());
    assert!(!outcome.ran);
    assert_eq!(sink.contents(), "");
}

#[test]
fn test_type_error_prevents_execution() {
    let dir = TempDir::new().expect("tempdir");
    let main = write_module(
        &dir,
        "main.rill",
        "fn main() -> int { var x: int = \"not an int\"; return 0; }\n",
    );
    let sink = Sink::default();
    let outcome = run_program(&main, Options::default(), Box::new(sink.clone()))
        .expect("driver should not fail");
    assert!(!outcome.succeeded());
    assert!(!outcome.ran);
    assert_eq!(sink.contents(), "");
}

#[test]
fn test_missing_file_is_fatal() {
    let result = run_program(
        std::path::Path::new("/definitely/not/here.rill"),
        Options::default(),
        Box::new(Sink::default()),
    );
    assert!(result.is_err());
}

#[test]
fn test_string_indexing() {
    let output = run_source(
        "fn main() -> int { var s: string = \"abc\"; print(s[1]); return 0; }\n",
    );
    assert_eq!(output, "b");
}

#[test]
fn test_string_index_out_of_range() {
    let error = run_source_expecting_runtime_error(
        "fn main() -> int { var s: string = \"abc\"; print(s[7]); return 0; }\n",
    );
    assert_eq!(error.message, "String index out of range");
}

#[test]
fn test_print_renders_string_list_elements_raw() {
    let output = run_source(
        "fn main() -> int { var xs: [string] = [\"a\", \"b\"]; print(xs); return 0; }\n",
    );
    assert_eq!(output, "[a, b]");
}
