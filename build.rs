use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources.
const SOURCE_DIRS: &[&str] = &[
    "evaluate", "cohort", "models", "report", "shared", "src", "tests", "benches",
];

const FORBIDDEN_WORDS: &[&str] = &[
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

/// One source hygiene rule: a line regex plus a filter deciding whether a matched
/// line really is a violation.
struct Rule {
    description: &'static str,
    pattern: String,
    is_violation: fn(&str) -> bool,
    advice: &'static str,
    check_build_script: bool,
}

// Collects every violating line of a single file.
struct ViolationCollector<'a> {
    rule: &'a Rule,
    violations: Vec<String>,
}

impl Sink for ViolationCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.is_violation)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

impl ViolationCollector<'_> {
    fn error_message(&self, file_path: &Path) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.description,
            file_path.display()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(error_msg)
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    Some(match line[start..].find("*/") {
        Some(end) => line[start..start + end].trim(),
        None => line[start..].trim(),
    })
}

// An underscore-prefixed name inside a string literal is text, not a binding.
fn underscore_outside_strings(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn stars_outside_doc_comments(line: &str) -> bool {
    !is_doc_comment(line)
}

fn all_uppercase_comment(line: &str) -> bool {
    let Some(text) = comment_text(line) else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(|c| c.is_uppercase())
}

fn always(line: &str) -> bool {
    !line.is_empty()
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            description: "underscore-prefixed names",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            is_violation: underscore_outside_strings,
            advice: "Underscore-prefixed names are not allowed. Use the binding or remove it.",
            check_build_script: true,
        },
        Rule {
            description: "forbidden comment words",
            pattern: format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            is_violation: always,
            advice: "Comments must describe the code as it is, not its edit history.",
            check_build_script: false,
        },
        Rule {
            description: "'**' markers in regular comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            is_violation: stars_outside_doc_comments,
            advice: "The '**' pattern is only allowed in doc comments.",
            check_build_script: false,
        },
        Rule {
            description: "all-uppercase comments",
            pattern: r"(//|/\*).*".to_string(),
            is_violation: all_uppercase_comment,
            advice: "Comments where every letter is uppercase are not allowed.",
            check_build_script: false,
        },
        Rule {
            description: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            is_violation: always,
            advice: "Use the code or remove it; dead code is never allowed.",
            check_build_script: false,
        },
    ]
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_rule(rule: &Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();
    let build_script = PathBuf::from("build.rs");
    let targets = files
        .iter()
        .chain(rule.check_build_script.then_some(&build_script));

    for path in targets {
        let mut collector = ViolationCollector {
            rule,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.error_message(path) {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let files = source_files();
    for rule in rules() {
        if let Err(e) = check_rule(&rule, &files) {
            // eprintln so cargo shows the offending lines
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
