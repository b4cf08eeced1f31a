use xreflift::*;

use std::path::PathBuf;

use clap::Parser;
use serialize_ir::Parseable;

/// Clean up lifted machine code
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Strip lifting scaffolding from a textual IR module and optimize it
    Optimize {
        /// Path to the lifted module, in textual IR
        input: PathBuf,
        /// Path to output file for the optimized module (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,
        /// Output the reference graph of the optimized module as a GraphViz `.dot` file to the
        /// given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the optimizer
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<optimizer_config::CommandLineOptimizerConfig>,
    },
}

/// Print `msg` and exit with a failure status
fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("error: {}", msg);
    std::process::exit(1)
}

fn write_file(path: &std::path::Path, contents: &str) {
    if let Err(e) = std::fs::write(path, contents) {
        fail(format_args!("could not write {}: {}", path.display(), e));
    }
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Optimize {
            input,
            output,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let logger = log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            )
            .unwrap_or_else(|e| fail(format_args!("could not set up logging: {}", e)));
            let _log_guard = slog_scope::set_global_logger(logger);

            let config = optimizer_config::OptimizerConfig::from(advanced_config);

            let text = std::fs::read_to_string(&input)
                .unwrap_or_else(|e| fail(format_args!("could not read {}: {}", input.display(), e)));
            let mut module = ir::Module::parse_from(&text)
                .unwrap_or_else(|e| fail(format_args!("{}: {}", input.display(), e)));

            optimize::optimize_module(&mut module, &config);

            if let Some(path) = debug_output_graphviz {
                write_file(&path, &module.generate_dot());
            }

            match output {
                Some(path) => write_file(&path, &module.to_string()),
                None => print!("{}", module),
            }

            log::trace!("Done");
        }
    }
}
