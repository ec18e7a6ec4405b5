//! Mexp CLI
//!
//! Incremental macro expansion over a directory of `.mx` sources.

use std::path::Path;

use mexpc::commands::{clean_state, expand_dir, print_stats, ExpandOptions};

fn main() {
    mexpc::tracing_setup::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    let command = &args[1];

    match command.as_str() {
        "expand" => {
            if args.len() < 3 || args[2].starts_with('-') {
                eprintln!("Usage: mexp expand <dir> [options]");
                eprintln!();
                eprintln!("Run `mexp help` for the list of options.");
                std::process::exit(1);
            }
            let options = match ExpandOptions::parse(&args[3..]) {
                Ok(options) => options,
                Err(arg) => {
                    eprintln!("error: unrecognized option '{arg}'");
                    std::process::exit(1);
                }
            };
            expand_dir(&args[2], &options);
        }
        "stats" | "clean" => {
            let Some(state) = args
                .iter()
                .skip(2)
                .find_map(|arg| arg.strip_prefix("--state="))
            else {
                eprintln!("Usage: mexp {command} --state=<file>");
                std::process::exit(1);
            };
            if command == "stats" {
                print_stats(Path::new(state));
            } else {
                clean_state(Path::new(state));
            }
        }
        "help" | "--help" | "-h" => {
            print_usage();
        }
        "version" | "--version" | "-v" => {
            println!("mexp {}", env!("CARGO_PKG_VERSION"));
        }
        _ => {
            eprintln!("Unknown command: {command}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!("mexp - incremental macro expansion");
    println!();
    println!("Usage: mexp <command> [options]");
    println!();
    println!("Commands:");
    println!("  expand <dir>         Expand every macro call in <dir>/**/*.mx");
    println!("  stats --state=<file> Summarize a saved state file");
    println!("  clean --state=<file> Delete a saved state file");
    println!("  help                 Show this help message");
    println!("  version              Show version information");
    println!();
    println!("Expand options:");
    println!("  --limit=<n>          Recursion limit (default: 128)");
    println!("  --jobs=<n>           Worker threads (default: all cores)");
    println!("  --no-parallel        Expand on a single thread");
    println!("  --state=<file>       Resume from and save incremental state");
    println!("  --workspace=<prefix> Only expand files under this path prefix");
    println!("  --print              Print every expansion after the run");
    println!("  --progress           Show progress on stderr");
    println!();
    println!("Environment:");
    println!("  MEXP_LOG             Log filter (falls back to RUST_LOG)");
    println!("  MEXP_RECURSION_LIMIT, MEXP_JOBS, MEXP_CHUNK_SIZE");
    println!();
    println!("Examples:");
    println!("  mexp expand src --state=.mexp-state");
    println!("  mexp expand . --workspace=app/ --print");
    println!("  mexp stats --state=.mexp-state");
}
