//! CSV export formatter.

use std::fmt::Write as _;

use super::{AnalysisReport, TableFormatter};
use crate::AnalyzerError;

/// Renders each table as a CSV section with a `record` discriminator column.
pub struct CsvFormatter;

impl TableFormatter for CsvFormatter {
    fn format(&self, report: &AnalysisReport<'_>) -> Result<String, AnalyzerError> {
        let mut out = String::new();

        out.push_str("record,address,name,size,value,to,type,function\n");

        for (addr, func) in report.functions {
            let _ = writeln!(
                out,
                "function,0x{:x},{},{},,,,",
                addr,
                escape_csv_field(&func.name),
                func.size
            );
        }

        for s in report.strings {
            let _ = writeln!(
                out,
                "string,0x{:x},,{},{},,,",
                s.address,
                s.length,
                escape_csv_field(&s.value)
            );
        }

        for xref in report.xrefs {
            let _ = writeln!(
                out,
                "xref,0x{:x},,,,0x{:x},{},{}",
                xref.from_address,
                xref.to_address,
                xref.kind,
                escape_csv_field(&xref.from_function_name)
            );
        }

        Ok(out)
    }
}

/// Quote a field that contains a comma, quote or newline.
fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::sample_report;
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn escapes_fields_with_commas() {
        assert_eq!(escape_csv_field("plain"), "plain");
        assert_eq!(escape_csv_field("a,b"), "\"a,b\"");
        assert_eq!(escape_csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn emits_one_line_per_record() {
        let mut functions = BTreeMap::new();
        let mut strings = Vec::new();
        let mut xrefs = Vec::new();
        sample_report(&mut functions, &mut strings, &mut xrefs);
        let report = AnalysisReport {
            build_id: String::new(),
            functions: &functions,
            strings: &strings,
            xrefs: &xrefs,
        };

        let csv = CsvFormatter.format(&report).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4); // header + one of each
        assert!(lines[1].starts_with("function,0x7100000000,FUN_7100000000,8"));
        assert!(lines[2].contains("\"hello, world\""));
        assert!(lines[3].starts_with("xref,0x7100000000"));
    }
}
