pub mod binary_model;
pub mod constant_folding;
pub mod containers;
pub mod dead_code;
pub mod graphviz;
pub mod inliner;
pub mod instruction_lifter;
pub mod intrinsics;
pub mod ir;
pub mod ir_builder;
pub mod lib_calls;
pub mod loop_unroll;
pub mod optimize;
pub mod optimizer_config;
pub mod pipeline;
pub mod semantics;
pub mod serialize_ir;
pub mod simplify_cfg;
pub mod tail_calls;
#[cfg(test)]
mod tests;

pub mod log {
    //! Structured logging through the global `slog_scope` logger. Without an installed logger
    //! (as in tests), records are discarded.

    pub use slog_scope::{crit, debug, error, info, trace, warn};

    /// A key-value pair that is only logged when present
    pub struct OptionalKV<V: slog::Value>(pub &'static str, pub Option<V>);
    impl<V: slog::Value> slog::KV for OptionalKV<V> {
        fn serialize(
            &self,
            record: &slog::Record,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            if let Some(v) = &self.1 {
                v.serialize(record, self.0, serializer)
            } else {
                Ok(())
            }
        }
    }

    /// Severity shown at the given number of `-d` flags: 0-warn, 1-info, 2-debug, 3-trace
    pub fn severity(debug_level: usize) -> sloggers::types::Severity {
        match debug_level {
            0 => sloggers::types::Severity::Warning,
            1 => sloggers::types::Severity::Info,
            2 => sloggers::types::Severity::Debug,
            _ => sloggers::types::Severity::Trace,
        }
    }

    /// Compact logging to stderr, plus optional JSON logging to a file. With a file, the terminal
    /// only shows errors.
    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        pub fn new(
            debug_level: usize,
            disable_terminal_logging: bool,
            force_block: bool,
            path: Option<std::path::PathBuf>,
        ) -> sloggers::Result<slog::Logger> {
            use sloggers::Build;

            let debug_level = severity(debug_level);

            let term_drain = if disable_terminal_logging {
                sloggers::null::NullLoggerBuilder.build()?
            } else {
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(if path.is_none() {
                        debug_level
                    } else {
                        sloggers::types::Severity::Error
                    })
                    .overflow_strategy(if force_block || path.is_none() {
                        sloggers::types::OverflowStrategy::Block
                    } else {
                        sloggers::types::OverflowStrategy::DropAndReport
                    })
                    .format(sloggers::types::Format::Compact)
                    .build()?
            };

            let file_drain = match path {
                Some(path) => Some(
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(debug_level)
                        .overflow_strategy(sloggers::types::OverflowStrategy::Block)
                        .format(sloggers::types::Format::Json)
                        .build()?,
                ),
                None => None,
            };

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!("crate" => "xreflift"),
            ))
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(
            &self,
            r: &slog::Record<'_>,
            kv: &slog::OwnedKVList,
        ) -> Result<<Self as slog::Drain>::Ok, <Self as slog::Drain>::Err> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)?;
            Ok(())
        }
    }
}
