//! Static checks for generated Terraform.
//!
//! A small HCL scanner blanks comments and string bodies so brace matching
//! and block detection work on structure only, then per-block rules produce
//! syntax, semantic, security and style violations. No terraform binary is
//! needed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use walkdir::WalkDir;

use super::models::{Location, Scenario, Severity, ValidationResult, Violation, ViolationType};

static BLOCK_HEADER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*([A-Za-z_][\w-]*)((?:\s*"[^"]*"|\s+[A-Za-z_][\w-]*)*)\s*\{"#).unwrap()
});

static LABEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]*)"|([A-Za-z_][\w-]*)"#).unwrap());

static ATTRIBUTE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z_][\w-]*)\s*=").unwrap());

static REFERENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(var|local|module)\.([A-Za-z_][\w-]*)").unwrap());

static SECRET_ATTR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\s*(password|master_password|admin_password|secret|secret_key|access_key|api_key|token|private_key)\s*=\s*"([^"$]+)""#)
        .unwrap()
});

static AWS_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(AKIA|ASIA)[0-9A-Z]{16}\b").unwrap());

static OPEN_CIDR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"cidr_blocks\s*=\s*\[[^\]]*"0\.0\.0\.0/0""#).unwrap());

static PUBLIC_ACL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*acl\s*=\s*"public-read(-write)?""#).unwrap());

static PUBLICLY_ACCESSIBLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*publicly_accessible\s*=\s*true\b").unwrap());

static UNENCRYPTED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(storage_encrypted|encrypted)\s*=\s*false\b").unwrap());

static SENSITIVE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(password|secret|token|private_key|api_key)").unwrap());

static SNAKE_CASE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());

/// Number of labels each known top-level block takes.
fn expected_labels(kind: &str) -> Option<usize> {
    match kind {
        "resource" | "data" => Some(2),
        "variable" | "output" | "module" | "provider" | "check" => Some(1),
        "terraform" | "locals" | "moved" | "import" | "removed" => Some(0),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum Ctx {
    Str,
    Interp(usize),
}

/// Source split into per-line views with the same line count.
struct Scanned {
    /// Comments blanked, strings kept (used for attribute and reference rules)
    code: Vec<String>,
    /// Comments and string bodies blanked (used for brace depth)
    structure: Vec<String>,
    issues: Vec<(usize, String)>,
}

fn scan(src: &str) -> Scanned {
    let chars: Vec<char> = src.chars().collect();
    let mut code = String::with_capacity(src.len());
    let mut structure = String::with_capacity(src.len());
    let mut issues = Vec::new();
    let mut stack: Vec<Ctx> = Vec::new();
    let mut brackets: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c == '\n' {
            if !stack.is_empty() {
                issues.push((line, "unterminated string".to_string()));
                stack.clear();
            }
            code.push('\n');
            structure.push('\n');
            line += 1;
            i += 1;
            continue;
        }

        match stack.last().copied() {
            Some(Ctx::Str) => {
                code.push(c);
                match c {
                    '\\' => {
                        structure.push(' ');
                        if let Some(n) = next.filter(|n| *n != '\n') {
                            code.push(n);
                            structure.push(' ');
                            i += 1;
                        }
                    }
                    '"' => {
                        structure.push('"');
                        stack.pop();
                    }
                    '$' if next == Some('{') => {
                        code.push('{');
                        structure.push_str("  ");
                        stack.push(Ctx::Interp(0));
                        i += 1;
                    }
                    _ => structure.push(' '),
                }
                i += 1;
            }
            Some(Ctx::Interp(depth)) => {
                code.push(c);
                structure.push(' ');
                match c {
                    '"' => stack.push(Ctx::Str),
                    '{' => {
                        stack.pop();
                        stack.push(Ctx::Interp(depth + 1));
                    }
                    '}' => {
                        stack.pop();
                        if depth > 0 {
                            stack.push(Ctx::Interp(depth - 1));
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
            None => {
                if c == '#' || (c == '/' && next == Some('/')) {
                    while i < chars.len() && chars[i] != '\n' {
                        code.push(' ');
                        structure.push(' ');
                        i += 1;
                    }
                    continue;
                }
                if c == '/' && next == Some('*') {
                    let start = line;
                    let mut closed = false;
                    code.push_str("  ");
                    structure.push_str("  ");
                    i += 2;
                    while i < chars.len() {
                        if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                            code.push_str("  ");
                            structure.push_str("  ");
                            i += 2;
                            closed = true;
                            break;
                        }
                        let blank = if chars[i] == '\n' {
                            line += 1;
                            '\n'
                        } else {
                            ' '
                        };
                        code.push(blank);
                        structure.push(blank);
                        i += 1;
                    }
                    if !closed {
                        issues.push((start, "unterminated block comment".to_string()));
                    }
                    continue;
                }
                if c == '<'
                    && next == Some('<')
                    && let Some((marker, header_len)) = heredoc_marker(&chars[i..])
                {
                    for &h in &chars[i..i + header_len] {
                        code.push(h);
                        structure.push(h);
                    }
                    i += header_len;
                    let start = line;
                    let mut closed = false;
                    while i < chars.len() {
                        code.push('\n');
                        structure.push('\n');
                        line += 1;
                        i += 1;
                        let end = chars[i..]
                            .iter()
                            .position(|&ch| ch == '\n')
                            .map(|p| i + p)
                            .unwrap_or(chars.len());
                        let text: String = chars[i..end].iter().collect();
                        for &h in &chars[i..end] {
                            code.push(h);
                            structure.push(if h.is_whitespace() { h } else { ' ' });
                        }
                        i = end;
                        if text.trim() == marker {
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        issues.push((start, format!("unterminated heredoc <<{}", marker)));
                    }
                    continue;
                }

                code.push(c);
                structure.push(c);
                match c {
                    '"' => stack.push(Ctx::Str),
                    '{' | '[' | '(' => brackets.push((c, line)),
                    '}' | ']' | ')' => {
                        let opener = match c {
                            '}' => '{',
                            ']' => '[',
                            _ => '(',
                        };
                        match brackets.pop() {
                            Some((open, _)) if open == opener => {}
                            Some((open, open_line)) => issues.push((
                                line,
                                format!("mismatched '{}' (opened '{}' at line {})", c, open, open_line),
                            )),
                            None => issues.push((line, format!("unexpected '{}'", c))),
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
        }
    }

    if !stack.is_empty() {
        issues.push((line, "unterminated string".to_string()));
    }
    for (open, open_line) in brackets {
        issues.push((open_line, format!("unclosed '{}'", open)));
    }

    Scanned {
        code: code.split('\n').map(str::to_string).collect(),
        structure: structure.split('\n').map(str::to_string).collect(),
        issues,
    }
}

/// `<<EOF` / `<<-EOF` at the start of `chars`, followed only by whitespace up
/// to the end of the line. Returns the marker and the header length.
fn heredoc_marker(chars: &[char]) -> Option<(String, usize)> {
    let mut j = 2;
    if chars.get(j) == Some(&'-') {
        j += 1;
    }
    let start = j;
    while let Some(&c) = chars.get(j) {
        let ok = if j == start { c.is_ascii_alphabetic() || c == '_' } else { c.is_ascii_alphanumeric() || c == '_' };
        if !ok {
            break;
        }
        j += 1;
    }
    if j == start {
        return None;
    }
    let marker: String = chars[start..j].iter().collect();
    while let Some(&c) = chars.get(j) {
        match c {
            '\n' => break,
            ' ' | '\t' | '\r' => j += 1,
            _ => return None,
        }
    }
    Some((marker, j))
}

#[derive(Debug, Clone)]
pub(crate) struct Block {
    pub(crate) kind: String,
    pub(crate) labels: Vec<String>,
    /// 1-based line of the header
    pub(crate) line: usize,
    /// Code lines after the header, through the closing brace
    pub(crate) body: Vec<String>,
}

impl Block {
    pub(crate) fn has_attribute(&self, name: &str) -> bool {
        self.body
            .iter()
            .filter_map(|l| ATTRIBUTE_REGEX.captures(l))
            .any(|caps| &caps[1] == name)
    }

    fn attribute_is_true(&self, name: &str) -> bool {
        self.body.iter().any(|l| {
            ATTRIBUTE_REGEX
                .captures(l)
                .is_some_and(|caps| &caps[1] == name && l.split('=').nth(1).is_some_and(|v| v.trim() == "true"))
        })
    }

    pub(crate) fn body_lines(&self) -> impl Iterator<Item = (usize, &String)> {
        self.body.iter().enumerate().map(move |(i, l)| (self.line + 1 + i, l))
    }
}

fn parse_blocks(scanned: &Scanned) -> (Vec<Block>, Vec<(usize, String)>) {
    let mut blocks = Vec::new();
    let mut issues = Vec::new();
    let mut depth: usize = 0;
    let mut current: Option<Block> = None;

    for (idx, sline) in scanned.structure.iter().enumerate() {
        let code_line = scanned.code.get(idx).map(String::as_str).unwrap_or("");
        let line_no = idx + 1;

        if depth == 0 {
            let trimmed = code_line.trim();
            if let Some(caps) = BLOCK_HEADER_REGEX.captures(code_line) {
                let labels = caps
                    .get(2)
                    .map(|m| {
                        LABEL_REGEX
                            .captures_iter(m.as_str())
                            .filter_map(|l| l.get(1).or_else(|| l.get(2)))
                            .map(|l| l.as_str().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                current = Some(Block {
                    kind: caps[1].to_string(),
                    labels,
                    line: line_no,
                    body: Vec::new(),
                });
            } else if !trimmed.is_empty() && !trimmed.starts_with('}') {
                let message = if ATTRIBUTE_REGEX.is_match(code_line) {
                    "attribute outside of a block".to_string()
                } else {
                    format!("unexpected content outside of a block: {}", truncate(trimmed, 40))
                };
                issues.push((line_no, message));
            }
        } else if let Some(block) = current.as_mut() {
            block.body.push(code_line.to_string());
        }

        for ch in sline.chars() {
            match ch {
                '{' | '[' | '(' => depth += 1,
                '}' | ']' | ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        if depth == 0
            && let Some(block) = current.take()
        {
            blocks.push(block);
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    (blocks, issues)
}

/// Top-level blocks of one file, comments stripped.
pub(crate) fn top_level_blocks(content: &str) -> Vec<Block> {
    parse_blocks(&scan(content)).0
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

fn violation(
    error_type: ViolationType,
    severity: Severity,
    message: impl Into<String>,
    file: &str,
    line: Option<usize>,
    suggestion: Option<&str>,
) -> Violation {
    Violation {
        error_type,
        severity,
        message: message.into(),
        location: Some(Location {
            file: file.to_string(),
            line,
        }),
        suggestion: suggestion.map(str::to_string),
    }
}

/// Declarations collected across all files, for duplicate and reference checks.
#[derive(Default)]
struct Declarations {
    seen: HashMap<(String, String), (String, usize)>,
    variables: HashSet<String>,
    locals: HashSet<String>,
    modules: HashSet<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Validator {
    /// Undeclared `var.`/`local.`/`module.` references are errors rather than
    /// warnings. Off when the file set is only part of a configuration.
    strict_references: bool,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self { strict_references: true }
    }

    pub fn lenient() -> Self {
        Self { strict_references: false }
    }

    /// Scenarios that produce a complete configuration get strict reference checks.
    pub fn for_scenario(scenario: Scenario) -> Self {
        match scenario {
            Scenario::NewResource | Scenario::NewModule => Self::new(),
            Scenario::ModifyResource | Scenario::NewVariables | Scenario::NewOutputs => Self::lenient(),
        }
    }

    pub fn validate(&self, files: &BTreeMap<String, String>) -> ValidationResult {
        let mut violations = Vec::new();
        let mut decls = Declarations::default();
        let mut parsed: Vec<(&str, Vec<Block>)> = Vec::new();

        for (name, content) in files {
            // Nothing was generated for this file; that alone does not fail the set.
            if content.trim().is_empty() {
                violations.push(violation(
                    ViolationType::Semantic,
                    Severity::Warning,
                    "file is empty",
                    name,
                    None,
                    Some("generate the file content"),
                ));
                continue;
            }

            let scanned = scan(content);
            let (blocks, stray) = parse_blocks(&scanned);
            let syntax: Vec<_> = scanned.issues.iter().chain(stray.iter()).collect();
            for (line, message) in &syntax {
                violations.push(violation(
                    ViolationType::Syntax,
                    Severity::Error,
                    message.clone(),
                    name,
                    Some(*line),
                    None,
                ));
            }
            if content.contains('\t') {
                violations.push(violation(
                    ViolationType::Style,
                    Severity::Info,
                    "tab indentation",
                    name,
                    None,
                    Some("indent with two spaces (terraform fmt)"),
                ));
            }
            // Structural rules need a well-formed file.
            if !syntax.is_empty() {
                continue;
            }

            for block in &blocks {
                self.check_block(name, block, &mut decls, &mut violations);
            }
            parsed.push((name.as_str(), blocks));
        }

        for (file, blocks) in &parsed {
            for block in blocks {
                self.check_references(file, block, &decls, &mut violations);
            }
        }

        ValidationResult::from_violations(violations, files.len())
    }

    /// Validate every `*.tf` file directly inside `dir`.
    pub fn validate_dir(&self, dir: &Path) -> Result<ValidationResult> {
        Ok(self.validate(&read_tf_files(dir)?))
    }

    fn check_block(&self, file: &str, block: &Block, decls: &mut Declarations, out: &mut Vec<Violation>) {
        let kind = block.kind.as_str();
        let Some(wanted) = expected_labels(kind) else {
            out.push(violation(
                ViolationType::Semantic,
                Severity::Error,
                format!("unknown block type '{}'", kind),
                file,
                Some(block.line),
                None,
            ));
            return;
        };
        if block.labels.len() != wanted {
            out.push(violation(
                ViolationType::Syntax,
                Severity::Error,
                format!("{} block takes {} label(s), found {}", kind, wanted, block.labels.len()),
                file,
                Some(block.line),
                None,
            ));
            return;
        }

        if wanted > 0 {
            let key = (kind.to_string(), block.labels.join("."));
            if let Some((other_file, other_line)) = decls.seen.get(&key) {
                out.push(violation(
                    ViolationType::Semantic,
                    Severity::Error,
                    format!(
                        "duplicate {} \"{}\" (first declared at {}:{})",
                        kind,
                        block.labels.join("."),
                        other_file,
                        other_line
                    ),
                    file,
                    Some(block.line),
                    None,
                ));
            } else {
                decls.seen.insert(key, (file.to_string(), block.line));
            }
        }

        match kind {
            "variable" => {
                let name = &block.labels[0];
                decls.variables.insert(name.clone());
                if !block.has_attribute("description") {
                    out.push(violation(
                        ViolationType::Style,
                        Severity::Warning,
                        format!("variable \"{}\" has no description", name),
                        file,
                        Some(block.line),
                        Some("add a description"),
                    ));
                }
                if !block.has_attribute("type") {
                    out.push(violation(
                        ViolationType::Style,
                        Severity::Warning,
                        format!("variable \"{}\" has no type", name),
                        file,
                        Some(block.line),
                        Some("declare an explicit type"),
                    ));
                }
                if SENSITIVE_NAME_REGEX.is_match(name) && !block.attribute_is_true("sensitive") {
                    out.push(violation(
                        ViolationType::Security,
                        Severity::Warning,
                        format!("variable \"{}\" looks secret but is not marked sensitive", name),
                        file,
                        Some(block.line),
                        Some("set sensitive = true"),
                    ));
                }
                self.check_naming(file, block, name, out);
            }
            "output" => {
                let name = &block.labels[0];
                if !block.has_attribute("description") {
                    out.push(violation(
                        ViolationType::Style,
                        Severity::Info,
                        format!("output \"{}\" has no description", name),
                        file,
                        Some(block.line),
                        Some("add a description"),
                    ));
                }
                if !block.has_attribute("value") {
                    out.push(violation(
                        ViolationType::Semantic,
                        Severity::Error,
                        format!("output \"{}\" has no value", name),
                        file,
                        Some(block.line),
                        None,
                    ));
                }
            }
            "locals" => {
                for line in &block.body {
                    if let Some(caps) = ATTRIBUTE_REGEX.captures(line) {
                        decls.locals.insert(caps[1].to_string());
                    }
                }
                self.check_security(file, block, out);
            }
            "module" => {
                decls.modules.insert(block.labels[0].clone());
                if !block.has_attribute("source") {
                    out.push(violation(
                        ViolationType::Semantic,
                        Severity::Error,
                        format!("module \"{}\" has no source", block.labels[0]),
                        file,
                        Some(block.line),
                        None,
                    ));
                }
                self.check_security(file, block, out);
            }
            "resource" | "data" => {
                let name = block.labels[1].clone();
                self.check_naming(file, block, &name, out);
                self.check_security(file, block, out);
            }
            "provider" => self.check_security(file, block, out),
            _ => {}
        }
    }

    fn check_naming(&self, file: &str, block: &Block, name: &str, out: &mut Vec<Violation>) {
        if !SNAKE_CASE_REGEX.is_match(name) {
            out.push(violation(
                ViolationType::Style,
                Severity::Info,
                format!("{} name \"{}\" is not snake_case", block.kind, name),
                file,
                Some(block.line),
                Some("use lower_snake_case names"),
            ));
        }
    }

    fn check_security(&self, file: &str, block: &Block, out: &mut Vec<Violation>) {
        for (line_no, line) in block.body_lines() {
            if let Some(caps) = SECRET_ATTR_REGEX.captures(line) {
                out.push(violation(
                    ViolationType::Security,
                    Severity::Error,
                    format!("hard-coded secret in attribute '{}'", &caps[1]),
                    file,
                    Some(line_no),
                    Some("pass the value through a variable marked sensitive"),
                ));
            } else if AWS_KEY_REGEX.is_match(line) {
                out.push(violation(
                    ViolationType::Security,
                    Severity::Error,
                    "hard-coded AWS access key id",
                    file,
                    Some(line_no),
                    Some("use the provider credential chain"),
                ));
            }
            if OPEN_CIDR_REGEX.is_match(line) {
                out.push(violation(
                    ViolationType::Security,
                    Severity::Warning,
                    "rule open to 0.0.0.0/0",
                    file,
                    Some(line_no),
                    Some("restrict cidr_blocks to known ranges"),
                ));
            }
            if PUBLIC_ACL_REGEX.is_match(line) {
                out.push(violation(
                    ViolationType::Security,
                    Severity::Warning,
                    "public bucket ACL",
                    file,
                    Some(line_no),
                    Some("keep buckets private and block public access"),
                ));
            }
            if PUBLICLY_ACCESSIBLE_REGEX.is_match(line) {
                out.push(violation(
                    ViolationType::Security,
                    Severity::Warning,
                    "resource is publicly accessible",
                    file,
                    Some(line_no),
                    None,
                ));
            }
            if UNENCRYPTED_REGEX.is_match(line) {
                out.push(violation(
                    ViolationType::Security,
                    Severity::Warning,
                    "encryption at rest is disabled",
                    file,
                    Some(line_no),
                    Some("enable encryption"),
                ));
            }
        }
    }

    fn check_references(&self, file: &str, block: &Block, decls: &Declarations, out: &mut Vec<Violation>) {
        let severity = if self.strict_references { Severity::Error } else { Severity::Warning };
        let mut reported = HashSet::new();
        for (line_no, line) in block.body_lines() {
            for caps in REFERENCE_REGEX.captures_iter(line) {
                let (scope, name) = (&caps[1], caps[2].to_string());
                let declared = match scope {
                    "var" => decls.variables.contains(&name),
                    "local" => decls.locals.contains(&name),
                    _ => decls.modules.contains(&name),
                };
                if declared || !reported.insert((scope.to_string(), name.clone())) {
                    continue;
                }
                let noun = match scope {
                    "var" => "variable",
                    "local" => "local value",
                    _ => "module",
                };
                out.push(violation(
                    ViolationType::Semantic,
                    severity,
                    format!("reference to undeclared {} '{}.{}'", noun, scope, name),
                    file,
                    Some(line_no),
                    Some("declare it or fix the reference"),
                ));
            }
        }
    }
}

/// Read every `*.tf` file directly inside `dir`, keyed by file name.
pub fn read_tf_files(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("tf") {
            continue;
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        files.insert(entry.file_name().to_string_lossy().to_string(), content);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(name: &str, content: &str) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        files.insert(name.to_string(), content.to_string());
        files
    }

    fn has(result: &ValidationResult, kind: ViolationType, needle: &str) -> bool {
        result
            .violations
            .iter()
            .any(|v| v.error_type == kind && v.message.contains(needle))
    }

    const GOOD: &str = r#"
variable "bucket_name" {
  description = "Name of the bucket"
  type        = string
}

resource "aws_s3_bucket" "logs" {
  bucket = var.bucket_name # trailing comment with { brace
  tags = {
    Name = "${var.bucket_name}-logs"
  }
}

output "bucket_arn" {
  description = "ARN"
  value       = aws_s3_bucket.logs.arn
}
"#;

    #[test]
    fn test_clean_configuration_passes() {
        let result = Validator::new().validate(&one("main.tf", GOOD));
        assert!(result.passed, "{:?}", result.violations);
        assert_eq!(result.error_count, 0);
        assert_eq!(result.warning_count, 0);
        assert_eq!(result.files_checked, 1);
    }

    #[test]
    fn test_unbalanced_braces() {
        let result = Validator::new().validate(&one("main.tf", "resource \"a\" \"b\" {\n  x = 1\n"));
        assert!(!result.passed);
        let v = result.errors().next().unwrap();
        assert_eq!(v.error_type, ViolationType::Syntax);
        assert!(v.message.contains("unclosed '{'"));
        assert_eq!(v.location.as_ref().unwrap().line, Some(1));

        let extra = Validator::new().validate(&one("main.tf", "locals {\n}\n}\n"));
        assert!(has(&extra, ViolationType::Syntax, "unexpected '}'"));
    }

    #[test]
    fn test_braces_in_strings_heredocs_and_comments_ignored() {
        let src = r#"
locals {
  a = "{ not a block"
  /* } */
  b = <<-EOT
    {{{
  EOT
  // }
}
"#;
        let result = Validator::new().validate(&one("main.tf", src));
        assert!(result.passed, "{:?}", result.violations);
    }

    #[test]
    fn test_unterminated_constructs() {
        let s = Validator::new().validate(&one("main.tf", "locals {\n  a = \"oops\n}\n"));
        assert!(has(&s, ViolationType::Syntax, "unterminated string"));
        let h = Validator::new().validate(&one("main.tf", "locals {\n  a = <<EOT\n  text\n}\n"));
        assert!(has(&h, ViolationType::Syntax, "unterminated heredoc"));
    }

    #[test]
    fn test_block_label_counts_and_stray_content() {
        let result = Validator::new().validate(&one(
            "main.tf",
            "resource \"aws_instance\" {\n}\nfoo = 1\nhello world\nwidget \"x\" {\n}\n",
        ));
        assert!(has(&result, ViolationType::Syntax, "attribute outside of a block"));
        assert!(has(&result, ViolationType::Syntax, "unexpected content"));

        let labels = Validator::new().validate(&one("main.tf", "resource \"aws_instance\" {\n}\nwidget \"x\" {\n}\n"));
        assert!(has(&labels, ViolationType::Syntax, "resource block takes 2 label(s), found 1"));
        assert!(has(&labels, ViolationType::Semantic, "unknown block type 'widget'"));
    }

    #[test]
    fn test_duplicates_across_files() {
        let mut files = one("main.tf", "resource \"aws_vpc\" \"main\" {\n}\n");
        files.insert("other.tf".into(), "resource \"aws_vpc\" \"main\" {\n}\n".into());
        let result = Validator::new().validate(&files);
        assert!(has(&result, ViolationType::Semantic, "duplicate resource \"aws_vpc.main\""));
    }

    #[test]
    fn test_undeclared_references_respect_strictness() {
        let src = "resource \"aws_vpc\" \"main\" {\n  cidr_block = var.cidr\n  tags = local.tags\n}\n";
        let strict = Validator::new().validate(&one("main.tf", src));
        assert_eq!(strict.error_count, 2);
        assert!(has(&strict, ViolationType::Semantic, "var.cidr"));

        let lenient = Validator::lenient().validate(&one("main.tf", src));
        assert_eq!(lenient.error_count, 0);
        assert_eq!(lenient.warning_count, 2);
        assert!(lenient.passed);
    }

    #[test]
    fn test_security_findings() {
        let src = r#"
resource "aws_db_instance" "db" {
  password            = "hunter22"
  publicly_accessible = true
  storage_encrypted   = false
}

resource "aws_security_group_rule" "in" {
  cidr_blocks = ["0.0.0.0/0"]
}

resource "aws_s3_bucket_acl" "acl" {
  acl = "public-read"
}

variable "db_password" {
  description = "pw"
  type        = string
}
"#;
        let result = Validator::new().validate(&one("main.tf", src));
        assert!(has(&result, ViolationType::Security, "hard-coded secret in attribute 'password'"));
        assert!(has(&result, ViolationType::Security, "publicly accessible"));
        assert!(has(&result, ViolationType::Security, "encryption at rest"));
        assert!(has(&result, ViolationType::Security, "0.0.0.0/0"));
        assert!(has(&result, ViolationType::Security, "public bucket ACL"));
        assert!(has(&result, ViolationType::Security, "not marked sensitive"));
        assert_eq!(result.error_count, 1);
    }

    #[test]
    fn test_secret_from_variable_is_fine() {
        let src = "resource \"aws_db_instance\" \"db\" {\n  password = var.db_password\n}\nvariable \"db_password\" {\n  description = \"pw\"\n  type = string\n  sensitive = true\n}\n";
        let result = Validator::new().validate(&one("main.tf", src));
        assert!(result.violations.is_empty(), "{:?}", result.violations);
    }

    #[test]
    fn test_style_findings() {
        let src = "variable \"Region\" {\n}\noutput \"id\" {\n  value = 1\n}\n";
        let result = Validator::new().validate(&one("variables.tf", src));
        assert!(has(&result, ViolationType::Style, "has no description"));
        assert!(has(&result, ViolationType::Style, "has no type"));
        assert!(has(&result, ViolationType::Style, "not snake_case"));
        assert!(result.passed);
    }

    #[test]
    fn test_empty_file_is_a_warning_not_an_error() {
        let mut files = one("main.tf", GOOD);
        files.insert("outputs.tf".into(), "   \n".into());
        let result = Validator::new().validate(&files);
        assert_eq!(result.error_count, 0);
        assert_eq!(result.warning_count, 1);
        assert_eq!(result.files_checked, 2);
        assert!(result.passed);
        assert!(has(&result, ViolationType::Semantic, "file is empty"));
    }

    #[test]
    fn test_validate_dir_reads_tf_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.tf"), GOOD).unwrap();
        std::fs::write(dir.path().join("README.md"), "# readme").unwrap();
        let result = Validator::new().validate_dir(dir.path()).unwrap();
        assert_eq!(result.files_checked, 1);
        assert!(result.passed);
    }
}
