//! Pass options.
//!
//! The pass itself is driven by an external tool; these options are the
//! interface it crosses. Flags mirror the documented command line:
//!
//! - `--target-functions=<csv>`: record file naming modules and mangled
//!   symbols to instrument
//! - `--augmentum-python=<script>`: external should-instrument script;
//!   the embedding itself stays outside this crate, see
//!   [`CallbackInstrument`](crate::predicate::CallbackInstrument)
//! - `--instrumentation-stats-output=<dir>`: statistics sink directory
//! - `--dry-run`: collect full statistics, transform nothing
//! - `--emit-transformed-ir=<dir>`: write `.ll` files of transformed
//!   modules

use std::path::PathBuf;

/// Parsed pass options.
#[derive(Debug, Clone, Default)]
pub struct PassOptions {
    /// Path to a record file of target modules and functions.
    pub target_functions: Option<PathBuf>,
    /// Path to an external should-instrument script. Carried for the
    /// driver; the pass itself only sees the callback predicate the
    /// driver installs.
    pub python_script: Option<PathBuf>,
    /// Directory for the statistics sinks. Statistics are collected only
    /// when this is set.
    pub stats_output: Option<PathBuf>,
    /// Collect a comprehensive set of statistics but perform no
    /// transformation.
    pub dry_run: bool,
    /// Directory where transformed modules are written as textual IR.
    pub emit_ir: Option<PathBuf>,
}

impl PassOptions {
    /// Parse options from command-line style arguments. Unrecognised
    /// arguments are returned untouched for the caller to deal with.
    pub fn from_args<I>(args: I) -> (Self, Vec<String>)
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = PassOptions::default();
        let mut rest = Vec::new();
        for arg in args {
            if let Some(value) = arg.strip_prefix("--target-functions=") {
                options.target_functions = Some(PathBuf::from(value));
            } else if let Some(value) = arg.strip_prefix("--augmentum-python=") {
                options.python_script = Some(PathBuf::from(value));
            } else if let Some(value) = arg.strip_prefix("--instrumentation-stats-output=") {
                options.stats_output = Some(PathBuf::from(value));
            } else if arg == "--dry-run" {
                options.dry_run = true;
            } else if let Some(value) = arg.strip_prefix("--emit-transformed-ir=") {
                options.emit_ir = Some(PathBuf::from(value));
            } else {
                rest.push(arg);
            }
        }
        (options, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_defaults() {
        let (options, rest) = PassOptions::from_args(args(&[]));
        assert!(options.target_functions.is_none());
        assert!(options.python_script.is_none());
        assert!(options.stats_output.is_none());
        assert!(!options.dry_run);
        assert!(options.emit_ir.is_none());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_all_flags() {
        let (options, rest) = PassOptions::from_args(args(&[
            "--target-functions=targets.csv",
            "--augmentum-python=hook.py",
            "--instrumentation-stats-output=/tmp/stats",
            "--dry-run",
            "--emit-transformed-ir=/tmp/ir",
        ]));
        assert_eq!(
            options.target_functions.as_deref(),
            Some(std::path::Path::new("targets.csv"))
        );
        assert_eq!(
            options.python_script.as_deref(),
            Some(std::path::Path::new("hook.py"))
        );
        assert_eq!(
            options.stats_output.as_deref(),
            Some(std::path::Path::new("/tmp/stats"))
        );
        assert!(options.dry_run);
        assert_eq!(
            options.emit_ir.as_deref(),
            Some(std::path::Path::new("/tmp/ir"))
        );
        assert!(rest.is_empty());
    }

    #[test]
    fn test_unrecognised_args_pass_through() {
        let (options, rest) =
            PassOptions::from_args(args(&["--dry-run", "-O2", "input.bc"]));
        assert!(options.dry_run);
        assert_eq!(rest, vec!["-O2".to_owned(), "input.bc".to_owned()]);
    }
}
