// ABOUTME: Parser for TypeScript compiler output
// ABOUTME: Extracts structured diagnostics, buckets them by kind and renders a bounded report for the model

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::LazyLock;

/// Most dependency errors shown in a report
pub const MAX_DEPENDENCY_ERRORS: usize = 5;
/// Most dependency plus type errors shown in a report
pub const MAX_REPORTED_ERRORS: usize = 10;

const MISSING_MODULE_CODE: &str = "TS2307";

// `src/index.ts(42,10): error TS2339: message`
static PAREN_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*([^\s(][^(\r\n]*?)\((\d+),(\d+)\):[ \t]*error[ \t]+(TS\d+):[ \t]*([^\r\n]*)")
        .expect("valid diagnostic pattern")
});

// `src/index.ts:42:10 - error TS2339: message`
static COLON_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*([^\s:][^:\r\n]*?):(\d+):(\d+)[ \t]+-[ \t]+error[ \t]+(TS\d+):[ \t]*([^\r\n]*)")
        .expect("valid diagnostic pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DiagnosticError {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticCategory {
    Dependency,
    Type,
    Config,
}

impl DiagnosticCategory {
    pub fn of(code: &str) -> Self {
        if code == MISSING_MODULE_CODE {
            return DiagnosticCategory::Dependency;
        }
        let digits = code.strip_prefix("TS").unwrap_or(code);
        let config_family = digits.len() == 4 && (digits.starts_with('5') || digits.starts_with('6'));
        if config_family || digits == "18003" {
            DiagnosticCategory::Config
        } else {
            DiagnosticCategory::Type
        }
    }
}

/// Diagnostics grouped by category, each keeping parse order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategorizedErrors {
    pub dependency: Vec<DiagnosticError>,
    pub type_errors: Vec<DiagnosticError>,
    pub config: Vec<DiagnosticError>,
}

impl CategorizedErrors {
    pub fn total(&self) -> usize {
        self.dependency.len() + self.type_errors.len() + self.config.len()
    }
}

/// Extract diagnostics from compiler output.
///
/// Files are prefixed with `workspace` unless already under it. Identical
/// diagnostics are reported once, in first-seen order.
pub fn parse(output: &str, workspace: &str) -> Vec<DiagnosticError> {
    let mut found: Vec<(usize, DiagnosticError)> = Vec::new();

    for pattern in [&*PAREN_FORMAT, &*COLON_FORMAT] {
        for caps in pattern.captures_iter(output) {
            let (Ok(line), Ok(column)) = (caps[2].parse::<u32>(), caps[3].parse::<u32>()) else {
                continue;
            };
            let offset = caps.get(0).map(|m| m.start()).unwrap_or_default();
            found.push((
                offset,
                DiagnosticError {
                    file: prefix_workspace(caps[1].trim(), workspace),
                    line,
                    column,
                    code: caps[4].to_string(),
                    message: caps[5].trim_end().to_string(),
                },
            ));
        }
    }

    found.sort_by_key(|(offset, _)| *offset);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .map(|(_, error)| error)
        .filter(|error| seen.insert(error.clone()))
        .collect()
}

fn prefix_workspace(file: &str, workspace: &str) -> String {
    let file = file.trim_start_matches("./");
    let workspace = workspace.trim_end_matches('/');
    if workspace.is_empty() || file == workspace || file.starts_with(&format!("{}/", workspace)) {
        file.to_string()
    } else {
        format!("{}/{}", workspace, file)
    }
}

pub fn categorize(errors: &[DiagnosticError]) -> CategorizedErrors {
    let mut categorized = CategorizedErrors::default();
    for error in errors {
        let bucket = match DiagnosticCategory::of(&error.code) {
            DiagnosticCategory::Dependency => &mut categorized.dependency,
            DiagnosticCategory::Type => &mut categorized.type_errors,
            DiagnosticCategory::Config => &mut categorized.config,
        };
        bucket.push(error.clone());
    }
    categorized
}

/// Render a bounded report suitable for feeding back to the model.
///
/// Dependency errors come first (at most five), type errors fill the slots up
/// to ten in total, and every config error is listed.
pub fn format_for_model(errors: &[DiagnosticError]) -> String {
    if errors.is_empty() {
        return "No TypeScript errors found.".to_string();
    }

    let categorized = categorize(errors);
    let mut report = format!("Found {} TypeScript error(s).\n", errors.len());

    let dependency_shown = categorized.dependency.len().min(MAX_DEPENDENCY_ERRORS);
    if !categorized.dependency.is_empty() {
        report.push_str("\n## Missing dependencies\n");
        render_section(&mut report, &categorized.dependency, dependency_shown);
        report.push_str(
            "Hint: add the missing packages to the workspace package.json dependencies, \
             or fix the import path if the module is local.\n",
        );
    }

    let type_slots = MAX_REPORTED_ERRORS - dependency_shown;
    if !categorized.type_errors.is_empty() {
        let type_shown = categorized.type_errors.len().min(type_slots);
        report.push_str("\n## Type errors\n");
        render_section(&mut report, &categorized.type_errors, type_shown);
    }

    if !categorized.config.is_empty() {
        report.push_str("\n## Configuration errors\n");
        render_section(&mut report, &categorized.config, categorized.config.len());
    }

    report
}

fn render_section(report: &mut String, errors: &[DiagnosticError], shown: usize) {
    for error in errors.iter().take(shown) {
        let _ = writeln!(
            report,
            "- {}:{}:{} {}: {}",
            error.file, error.line, error.column, error.code, error.message
        );
    }
    if errors.len() > shown {
        let _ = writeln!(report, "... and {} more", errors.len() - shown);
    }
}
