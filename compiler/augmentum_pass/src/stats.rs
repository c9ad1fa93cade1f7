//! The statistics sink.
//!
//! Two CSV-like appenders record what the pass saw and decided:
//!
//! - `<prefix>_function_stats.csv`: module, mangled name, demangled
//!   name, instruction count, argument count, serialised type,
//!   can-instrument tag, should-instrument tag
//! - `<prefix>_named_struct_stats.csv`: module, struct name, serialised
//!   layout, IR name, attribute blob
//!
//! Fields are double-quoted with embedded quotes replaced by
//! apostrophes, `;`-delimited; a header is written only when the sink
//! file is empty and rows are appended otherwise. Unwritable paths are
//! logged and skipped — statistics never abort compilation.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use inkwell::module::Module;
use inkwell::values::FunctionValue;
use rustc_hash::FxHashMap;
use tracing::error;

use crate::serialise::TypeSerialiser;
use crate::utils::{count_instructions, demangle};

const FUNCTION_STATS_FILE: &str = "function_stats.csv";
const NAMED_STRUCT_STATS_FILE: &str = "named_struct_stats.csv";

const FUNCTION_STATS_HEADER: &str =
    "MODULE;FNAME;FNAMED;ICOUNT;PCOUNT;FUNCTIONTY;CAN_INSTR;SHOULD_INSTR";
const NAMED_STRUCT_STATS_HEADER: &str = "MODULE;STRUCT_NAME;TYPE;LLVM_NAME;EXTRA";

/// The `(can_instrument, should_instrument)` tag pair recorded when the
/// pass is transforming rather than surveying.
pub(crate) const INSTRUMENTATION_INFO_NA: (&str, &str) = ("NA", "NA");

struct FunctionData {
    module_name: String,
    function_name: String,
    function_name_demangled: String,
    /// Instruction count before rewriting; -1 means not collected.
    instruction_count: i64,
    parameter_count: i64,
    type_serialisation: String,
    can_instr: String,
    should_instr: String,
}

struct NamedStructData {
    module_name: String,
    struct_name: String,
    serialised_type: String,
    llvm_name: String,
    extra: String,
}

/// Collects per-function and per-struct records during a pass run and
/// appends them to the sink files on request.
#[derive(Default)]
pub struct InstrumentationStats {
    function_statistics: FxHashMap<String, FunctionData>,
    named_struct_statistics: FxHashMap<String, NamedStructData>,
    serialiser: TypeSerialiser,
    full_stats: bool,
}

impl InstrumentationStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect everything, including serialised types and instruction
    /// counts. Used by dry runs.
    pub fn collect_full_stats(&mut self) {
        self.full_stats = true;
    }

    /// Collect only identity and decision tags.
    pub fn collect_reduced_stats(&mut self) {
        self.full_stats = false;
    }

    /// Record one function. Records are de-duplicated by mangled name;
    /// the first sighting wins.
    pub fn record_function_stats(
        &mut self,
        module: &Module,
        function: FunctionValue,
        instr_info: (&str, &str),
    ) {
        let function_name = function.get_name().to_string_lossy().into_owned();
        if self.function_statistics.contains_key(&function_name) {
            return;
        }
        let module_name = module.get_name().to_string_lossy().into_owned();
        let data = if self.full_stats {
            FunctionData {
                module_name,
                function_name_demangled: demangle(&function_name),
                instruction_count: count_instructions(function) as i64,
                parameter_count: i64::from(function.count_params()),
                type_serialisation: self.serialiser.serialise_function(module, function),
                can_instr: instr_info.0.to_owned(),
                should_instr: instr_info.1.to_owned(),
                function_name: function_name.clone(),
            }
        } else {
            FunctionData {
                module_name,
                function_name_demangled: "NA".to_owned(),
                instruction_count: -1,
                parameter_count: -1,
                type_serialisation: "NA".to_owned(),
                can_instr: instr_info.0.to_owned(),
                should_instr: instr_info.1.to_owned(),
                function_name: function_name.clone(),
            }
        };
        self.function_statistics.insert(function_name, data);
    }

    /// Record every named struct the serialiser has met so far.
    pub fn record_named_struct_stats(&mut self, module: &Module) {
        let module_name = module.get_name().to_string_lossy().into_owned();
        for (tag, record) in self.serialiser.named_structs() {
            if self.named_struct_statistics.contains_key(tag) {
                continue;
            }
            let extra = format!(
                "named:{}#packed:{}#literal:{}#opaque:{}",
                record.named, record.packed, record.literal, record.opaque
            );
            self.named_struct_statistics.insert(
                tag.clone(),
                NamedStructData {
                    module_name: module_name.clone(),
                    struct_name: record.struct_name.clone(),
                    serialised_type: record.layout.clone(),
                    llvm_name: record.llvm_name.clone(),
                    extra,
                },
            );
        }
    }

    /// Append both sinks under `out_dir` with the given file prefix.
    /// Failures are logged, never propagated.
    pub fn emit_statistics(&self, out_dir: &Path, prefix: &str) {
        if !out_dir.exists() {
            error!(
                path = %out_dir.display(),
                "[augmentum] opening output stream to emit statistics failed; path invalid"
            );
            return;
        }

        let function_rows: Vec<String> = self
            .function_statistics
            .values()
            .map(|entry| {
                csv_row(&[
                    &entry.module_name,
                    &entry.function_name,
                    &entry.function_name_demangled,
                    &count_field(entry.instruction_count),
                    &count_field(entry.parameter_count),
                    &entry.type_serialisation,
                    &entry.can_instr,
                    &entry.should_instr,
                ])
            })
            .collect();
        let function_path = out_dir.join(format!("{prefix}_{FUNCTION_STATS_FILE}"));
        if let Err(err) = append_rows(&function_path, FUNCTION_STATS_HEADER, &function_rows) {
            error!(
                path = %function_path.display(),
                %err,
                "[augmentum] writing function statistics failed"
            );
        }

        let struct_rows: Vec<String> = self
            .named_struct_statistics
            .values()
            .map(|entry| {
                csv_row(&[
                    &entry.module_name,
                    &entry.struct_name,
                    &entry.serialised_type,
                    &entry.llvm_name,
                    &entry.extra,
                ])
            })
            .collect();
        let struct_path = out_dir.join(format!("{prefix}_{NAMED_STRUCT_STATS_FILE}"));
        if let Err(err) = append_rows(&struct_path, NAMED_STRUCT_STATS_HEADER, &struct_rows) {
            error!(
                path = %struct_path.display(),
                %err,
                "[augmentum] writing named struct statistics failed"
            );
        }
    }
}

fn count_field(count: i64) -> String {
    if count >= 0 {
        count.to_string()
    } else {
        "NA".to_owned()
    }
}

/// Quote a field, replacing embedded double quotes with apostrophes.
fn escape(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "'"))
}

fn csv_row(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|field| escape(field))
        .collect::<Vec<_>>()
        .join(";")
}

/// Append rows to `path`, writing the header first when the file is
/// empty.
fn append_rows(path: &Path, header: &str, rows: &[String]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        writeln!(file, "{header}")?;
    }
    for row in rows {
        writeln!(file, "{row}")?;
    }
    Ok(())
}
