//! JSON export formatter.

use serde::{Deserialize, Serialize};

use super::{AnalysisReport, TableFormatter};
use crate::AnalyzerError;

/// Serializable function for JSON output
#[derive(Serialize, Deserialize)]
struct FunctionJson {
    address: String,
    name: String,
    size: u64,
    is_leaf: bool,
    is_thunk: bool,
}

/// Serializable string entry for JSON output
#[derive(Serialize, Deserialize)]
struct StringJson {
    address: String,
    value: String,
    length: u64,
}

/// Serializable cross-reference for JSON output
#[derive(Serialize, Deserialize)]
struct XRefJson {
    from: String,
    to: String,
    #[serde(rename = "type")]
    kind: String,
    function: String,
}

/// Serializable analysis report
#[derive(Serialize, Deserialize)]
struct ReportJson {
    build_id: String,
    functions: Vec<FunctionJson>,
    strings: Vec<StringJson>,
    xrefs: Vec<XRefJson>,
}

/// Renders the whole report as pretty-printed JSON.
pub struct JsonFormatter;

impl TableFormatter for JsonFormatter {
    fn format(&self, report: &AnalysisReport<'_>) -> Result<String, AnalyzerError> {
        let functions = report
            .functions
            .values()
            .map(|f| FunctionJson {
                address: format!("0x{:x}", f.address),
                name: f.name.clone(),
                size: f.size,
                is_leaf: f.is_leaf,
                is_thunk: f.is_thunk,
            })
            .collect();

        let strings = report
            .strings
            .iter()
            .map(|s| StringJson {
                address: format!("0x{:x}", s.address),
                value: s.value.clone(),
                length: s.length,
            })
            .collect();

        let xrefs = report
            .xrefs
            .iter()
            .map(|x| XRefJson {
                from: format!("0x{:x}", x.from_address),
                to: format!("0x{:x}", x.to_address),
                kind: x.kind.to_string(),
                function: x.from_function_name.clone(),
            })
            .collect();

        let doc = ReportJson {
            build_id: report.build_id.clone(),
            functions,
            strings,
            xrefs,
        };

        serde_json::to_string_pretty(&doc)
            .map_err(|e| AnalyzerError::Format(format!("JSON serialization error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::sample_report;
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn output_parses_back_as_json() {
        let mut functions = BTreeMap::new();
        let mut strings = Vec::new();
        let mut xrefs = Vec::new();
        sample_report(&mut functions, &mut strings, &mut xrefs);
        let report = AnalysisReport {
            build_id: "AB".repeat(32),
            functions: &functions,
            strings: &strings,
            xrefs: &xrefs,
        };

        let text = JsonFormatter.format(&report).unwrap();
        let parsed: ReportJson = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.functions.len(), 1);
        assert_eq!(parsed.functions[0].address, "0x7100000000");
        assert_eq!(parsed.strings[0].value, "hello, world");
        assert_eq!(parsed.xrefs[0].kind, "address load");
    }
}
