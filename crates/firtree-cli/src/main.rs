//! `kernelcompile`: compile a kernel source file and print its IR.
//!
//! Exit codes: 0 on success, 1 on usage errors, 2 when compilation fails.

use anyhow::Context;
use firtree_kernel::CompiledKernel;
use std::io::Write;
use std::process::ExitCode;
use tracing::debug;

enum PrintWhat {
    Ir,
    None,
}

struct Options {
    optimize: bool,
    print: PrintWhat,
    filename: String,
}

fn print_usage(out: &mut dyn Write) {
    let _ = writeln!(out, "Usage: kernelcompile [options] filename\n");
    let _ = writeln!(out, "Where [options] are zero or more of:\n");
    let _ = writeln!(out, "\t-help \t\tPrint brief usage information.");
    let _ = writeln!(out, "\t-[no-]opt \tActivate [deactivate] IR optimisation.");
    let _ = writeln!(out, "\t-print \t\tSelect what output to print (Default = IR).");
    let _ = writeln!(out, "\t\t=ir \tPrint the compiled IR module.");
    let _ = writeln!(out, "\t\t=none \tPrint nothing; only report diagnostics.");
}

/// Parse the command line. `Ok(None)` means `-help` was handled.
fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    let mut optimize = true;
    let mut print = PrintWhat::Ir;
    let mut index = 0;
    while index < args.len() && args[index].starts_with('-') {
        let opt = &args[index];
        match opt.as_str() {
            "-help" => return Ok(None),
            "-opt" => optimize = true,
            "-no-opt" => optimize = false,
            _ if opt.starts_with("-print") => {
                let arg = opt
                    .split_once('=')
                    .map(|(_, arg)| arg)
                    .ok_or_else(|| format!("Option {} requires an argument.", opt))?;
                print = match arg {
                    "ir" => PrintWhat::Ir,
                    "none" => PrintWhat::None,
                    other => return Err(format!("Unknown output type: {}.", other)),
                };
            }
            other => return Err(format!("Unknown option: {}", other)),
        }
        index += 1;
    }
    if index + 1 != args.len() {
        return Err("missing source".to_string());
    }
    Ok(Some(Options {
        optimize,
        print,
        filename: args[index].clone(),
    }))
}

fn compile_file(options: &Options) -> anyhow::Result<bool> {
    let source = std::fs::read_to_string(&options.filename)
        .with_context(|| format!("could not open file '{}' for reading", options.filename))?;

    let compiled = CompiledKernel::compile_named(&source, &options.filename);

    let log = compiled.compile_log().lines();
    if !log.is_empty() {
        eprintln!("Log messages:");
        for line in &log {
            eprintln!("{}", line);
        }
    }
    if !compiled.compile_status() {
        return Ok(false);
    }
    debug!(kernels = compiled.kernels().len(), "compilation succeeded");

    match options.print {
        PrintWhat::None => {}
        PrintWhat::Ir => {
            let mut module = compiled.module().clone();
            if options.optimize {
                firtree_ir::optimize_module(&mut module);
            }
            print!("{}", module);
        }
    }
    Ok(true)
}

fn main() -> ExitCode {
    let _ = firtree::log::init_logging("");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => {
            print_usage(&mut std::io::stdout());
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("{}", message);
            print_usage(&mut std::io::stderr());
            return ExitCode::from(1);
        }
    };

    match compile_file(&options) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(args: &[&str]) -> Result<Option<Options>, String> {
        parse_args(&args.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn parses_flags_and_filename() {
        let options = opts(&["-no-opt", "-print=ir", "blur.kernel"]).unwrap().unwrap();
        assert!(!options.optimize);
        assert_eq!(options.filename, "blur.kernel");
    }

    #[test]
    fn help_short_circuits() {
        assert!(opts(&["-help"]).unwrap().is_none());
    }

    #[test]
    fn missing_source_is_a_usage_error() {
        assert!(opts(&["-opt"]).is_err());
        assert!(opts(&[]).is_err());
        assert!(opts(&["a.kernel", "b.kernel"]).is_err());
    }

    #[test]
    fn unknown_options_are_usage_errors() {
        assert!(opts(&["-wibble", "a.kernel"]).is_err());
        assert!(opts(&["-print=glsl", "a.kernel"]).is_err());
    }
}
