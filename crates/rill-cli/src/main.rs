//! Command-line driver for Rill scripts.
//!
//! Compiles a script (from a file or `-e`), registers the standard host
//! functions plus `nextLine` over the input files, and runs it to
//! completion with blocking async dispatch. `-p`/`-n` wrap the script
//! in the canonical read-line loop with `BEGIN`/`END` blocks as
//! prologue/epilogue.

use clap::Parser;
use codespan_reporting::diagnostic::{Diagnostic, Label};
use codespan_reporting::files::SimpleFile;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rill_engine::{
    compile, CompileOptions, HostFunction, HostRegistry, LoopMode, RuntimeError, StdPrint, Type,
    Value,
};
use rustc_hash::FxHashSet;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "rill",
    about = "Run Rill scripts",
    disable_version_flag = true
)]
struct Args {
    /// Wrap the script in a read-line loop and print `it` after each
    /// iteration
    #[arg(short = 'p', conflicts_with = "loop_only")]
    loop_print: bool,

    /// Wrap the script in a read-line loop without printing
    #[arg(short = 'n', id = "loop_only")]
    loop_only: bool,

    /// Run this inline script instead of a program file
    #[arg(short = 'e', value_name = "SCRIPT")]
    eval: Option<String>,

    /// Pre-set a global: -V name=value (repeatable)
    #[arg(short = 'V', value_name = "NAME=VALUE")]
    vars: Vec<String>,

    /// Verbose error reporting
    #[arg(short = 'v')]
    verbose: bool,

    /// Dump the compiled code before running
    #[arg(short = 'd')]
    debug: bool,

    /// Program file (unless -e), then input files for nextLine()
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Script arguments after `--`, visible as the `args` global
    #[arg(last = true, value_name = "ARGS")]
    script_args: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let (source, name, input_files) = match &args.eval {
        Some(source) => (source.clone(), "<cmdline>".to_string(), args.files.clone()),
        None => {
            let Some((program, inputs)) = args.files.split_first() else {
                eprintln!("rill: no script given (use -e or a program file)");
                return ExitCode::FAILURE;
            };
            match std::fs::read_to_string(program) {
                Ok(source) => (
                    source,
                    program.display().to_string(),
                    inputs.to_vec(),
                ),
                Err(err) => {
                    eprintln!("rill: cannot read {}: {}", program.display(), err);
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    let loop_mode = if args.loop_print {
        LoopMode::LoopPrint
    } else if args.loop_only {
        LoopMode::Loop
    } else {
        LoopMode::Off
    };

    let mut registry = HostRegistry::with_defaults();
    register_next_line(&mut registry, input_files);
    let registry = Arc::new(registry);

    let mut globals = IndexMap::new();
    let mut global_names = FxHashSet::default();
    for entry in &args.vars {
        match entry.split_once('=') {
            Some((key, value)) => {
                global_names.insert(key.to_string());
                globals.insert(key.to_string(), parse_value(value));
            }
            None => {
                eprintln!("rill: -V expects name=value, got '{}'", entry);
                return ExitCode::FAILURE;
            }
        }
    }
    global_names.insert("args".to_string());
    globals.insert(
        "args".to_string(),
        Value::list(args.script_args.iter().map(Value::string).collect()),
    );
    if loop_mode != LoopMode::Off {
        global_names.insert("it".to_string());
    }

    let options = CompileOptions {
        loop_mode,
        globals: global_names,
        allow_implicit_globals: loop_mode != LoopMode::Off,
        ..CompileOptions::default()
    };

    let script = match compile(&source, &name, &registry, options) {
        Ok(script) => script,
        Err(errors) => {
            if args.verbose {
                render_verbose(&name, &source, &errors);
            } else {
                eprint!("{}", errors.render(&source));
            }
            return ExitCode::FAILURE;
        }
    };

    if args.debug {
        eprint!("{}", script.dump());
    }

    let mut writer = StdPrint;
    match script.run_blocking(globals, &mut writer) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            report_runtime_error(&name, &error);
            ExitCode::FAILURE
        }
    }
}

/// `-V` values keep their most specific numeric form.
fn parse_value(text: &str) -> Value {
    if let Ok(n) = text.parse::<i32>() {
        return Value::Int(n);
    }
    if let Ok(n) = text.parse::<i64>() {
        return Value::Long(n);
    }
    if let Ok(n) = text.parse::<f64>() {
        return Value::Double(n);
    }
    match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::string(text),
    }
}

/// Register `nextLine()` over the input files (stdin when none).
fn register_next_line(registry: &mut HostRegistry, files: Vec<PathBuf>) {
    let source = Arc::new(Mutex::new(LineSource::new(files)));
    registry
        .register(HostFunction {
            name: "nextLine".to_string(),
            params: vec![],
            return_type: Type::Str,
            is_async: false,
            varargs: false,
            dispatch: Some(Arc::new(move |_ctx, _args| {
                Ok(source.lock().next_line())
            })),
        })
        .expect("nextLine registration");
}

/// Lines from the input files in order, falling back to stdin.
struct LineSource {
    pending: Vec<PathBuf>,
    current: Option<Box<dyn BufRead + Send>>,
    use_stdin: bool,
}

impl LineSource {
    fn new(files: Vec<PathBuf>) -> Self {
        let use_stdin = files.is_empty();
        let mut pending = files;
        pending.reverse();
        Self {
            pending,
            current: None,
            use_stdin,
        }
    }

    fn next_line(&mut self) -> Value {
        loop {
            if self.current.is_none() {
                if let Some(path) = self.pending.pop() {
                    match std::fs::File::open(&path) {
                        Ok(file) => self.current = Some(Box::new(BufReader::new(file))),
                        Err(_) => continue,
                    }
                } else if self.use_stdin {
                    self.use_stdin = false;
                    self.current = Some(Box::new(BufReader::new(std::io::stdin())));
                } else {
                    return Value::Null;
                }
            }
            let mut line = String::new();
            match self.current.as_mut().map(|r| r.read_line(&mut line)) {
                Some(Ok(0)) | None => {
                    self.current = None;
                    continue;
                }
                Some(Ok(_)) => {
                    while line.ends_with('\n') || line.ends_with('\r') {
                        line.pop();
                    }
                    return Value::string(line);
                }
                Some(Err(_)) => {
                    self.current = None;
                    continue;
                }
            }
        }
    }
}

fn render_verbose(name: &str, source: &str, errors: &rill_engine::CompileErrors) {
    let file = SimpleFile::new(name.to_string(), source.to_string());
    let writer = StandardStream::stderr(ColorChoice::Auto);
    let config = codespan_reporting::term::Config::default();
    for error in &errors.errors {
        let diagnostic = Diagnostic::error()
            .with_message(error.message.clone())
            .with_labels(vec![Label::primary(
                (),
                error.span.start..error.span.end.max(error.span.start + 1),
            )]);
        let _ = codespan_reporting::term::emit(
            &mut writer.lock(),
            &config,
            &file,
            &diagnostic,
        );
    }
}

fn report_runtime_error(name: &str, error: &RuntimeError) {
    match &error.span {
        Some(span) => eprintln!("{}:{}:{}: {}", name, span.line, span.column, error.kind),
        None => eprintln!("{}: {}", name, error.kind),
    }
    for frame in &error.script_stack {
        eprintln!("    at {}", frame);
    }
}
