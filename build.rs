use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source trees owned by this crate. Nothing else under the package root is scanned.
const SOURCE_ROOTS: [&str; 5] = ["tsqr", "src", "shared", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// The kinds of policy violation this script rejects.
#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWord,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWord => format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::AllCapsComment => r"(//|/\*).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn headline(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => "underscore-prefixed identifiers",
            Rule::ForbiddenWord => "comments with forbidden status words",
            Rule::StarsInComment => "'**' in non-doc comments",
            Rule::AllCapsComment => "comments written entirely in uppercase",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> String {
        match self {
            Rule::UnderscorePrefix => {
                "Either use the binding (dropping the underscore) or remove it completely.".into()
            }
            Rule::ForbiddenWord => format!(
                "Comments must not contain any of {}. Remove them rather than commenting them out.",
                FORBIDDEN_WORDS.join(", ")
            ),
            Rule::StarsInComment => "Use '**' only inside doc comments.".into(),
            Rule::AllCapsComment => "Rewrite the comment in sentence case or delete it.".into(),
            Rule::AllowDeadCode => "Either use the code or remove it completely.".into(),
        }
    }

    // Decides whether a line the regex matched is a real violation.
    fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Rule::UnderscorePrefix => {
                let is_comment = trimmed.starts_with("//") || line.contains("/*");
                let in_string = line
                    .split('"')
                    .enumerate()
                    .any(|(i, part)| i % 2 == 1 && part.contains('_'));
                !is_comment && !in_string
            }
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Rule::AllCapsComment => {
                let Some(text) = comment_text(line) else {
                    return false;
                };
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }
        }
    }
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    for prefix in ["///", "//!", "//"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return Some(rest.trim());
        }
    }
    let start = line.find("/*")? + 2;
    let rest = &line[start..];
    Some(rest.find("*/").map_or(rest, |end| &rest[..end]).trim())
}

// Collects every violating line of one file.
struct ViolationCollector {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, searcher: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(searcher.line_number())
    }
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .collect()
}

fn scan(rule: Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = ViolationCollector {
            rule,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            return Err(report(rule, path, &collector.violations).into());
        }
    }
    Ok(())
}

fn report(rule: Rule, path: &Path, violations: &[String]) -> String {
    let mut message = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        violations.len(),
        rule.headline(),
        path.display()
    );
    for violation in violations {
        message.push_str(&format!("   {violation}\n"));
    }
    message.push_str(&format!("\n⚠️ {}\n", rule.advice()));
    message
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let files = source_files();
    let rules = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
