//! Multi-file extraction from LLM output.
//!
//! The model is asked to emit one `## <file>` header per file followed by a
//! fenced block, but real replies drift: other header styles, prose between
//! files, bare code blocks or a single unlabelled blob. `ResponseParser` runs
//! an ordered list of increasingly lenient [`FileExtractionStrategy`]
//! implementations:
//! - `HeaderSplit`: split on markdown/file headers
//! - `LineScan`: split on short lines mentioning an expected file
//! - `FencedBlocks`: assign fenced blocks to expected files in order
//! - `WholeResponse`: the whole reply becomes the first expected file
//!
//! The output always has exactly the expected key set; files nothing could be
//! attributed to are present with empty content.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

// Header styles tried in order by `HeaderSplit`.
static HEADER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\s*##\s+`?(?P<name>[\w./\\-]+)`?\s*:?\s*$",
        r"^\s*###\s+`?(?P<name>[\w./\\-]+)`?\s*:?\s*$",
        r"^\s*\*\*`?(?P<name>[\w./\\-]+)`?:?\*\*\s*:?\s*$",
        r"(?i)^\s*(?:file|filename)\s*:\s*`?(?P<name>[\w./\\-]+)`?\s*$",
        r"^\s*`?(?P<name>[\w./\\-]+\.\w+)`?:\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static FENCED_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n]*\n(.*?)```").unwrap());

/// Longest line `LineScan` treats as a file indicator.
const MAX_INDICATOR_LEN: usize = 80;

/// Files found by one strategy, plus how many sections it recognized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Only expected file names, only non-empty content
    pub files: BTreeMap<String, String>,
    pub sections: usize,
}

/// Parse progress visible to the next strategy when deciding whether to run.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub expected: usize,
    pub populated: usize,
    pub sections: usize,
}

impl Progress {
    pub fn missing(&self) -> usize {
        self.expected - self.populated
    }
}

pub trait FileExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy should run given what earlier ones found.
    fn applies(&self, progress: &Progress) -> bool {
        progress.populated == 0
    }

    fn extract(&self, text: &str, expected: &[String]) -> Extraction;
}

pub struct HeaderSplit;

impl FileExtractionStrategy for HeaderSplit {
    fn name(&self) -> &'static str {
        "header_split"
    }

    fn applies(&self, _progress: &Progress) -> bool {
        true
    }

    fn extract(&self, text: &str, expected: &[String]) -> Extraction {
        for pattern in HEADER_PATTERNS.iter() {
            let sections = split_on_headers(text, expected, pattern);
            let usable = sections.len() > 1 || (sections.len() == 1 && expected.len() == 1);
            if !usable {
                continue;
            }
            let count = sections.len();
            let mut files = BTreeMap::new();
            for (name, body) in sections {
                if let Some(name) = name {
                    append_content(&mut files, name, &body);
                }
            }
            return Extraction { files, sections: count };
        }
        Extraction::default()
    }
}

/// Split `text` on lines matching `pattern`. Sections under headers that look
/// like files but aren't expected come back with `None` so they still count.
fn split_on_headers(text: &str, expected: &[String], pattern: &Regex) -> Vec<(Option<String>, String)> {
    let mut sections: Vec<(Option<String>, String)> = Vec::new();
    for line in text.lines() {
        let header = pattern
            .captures(line)
            .and_then(|caps| caps.name("name").map(|m| m.as_str().to_string()))
            .filter(|raw| raw.contains('.') || match_expected(raw, expected).is_some());
        match header {
            Some(raw) => sections.push((match_expected(&raw, expected), String::new())),
            None => {
                if let Some((_, body)) = sections.last_mut() {
                    body.push_str(line);
                    body.push('\n');
                }
            }
        }
    }
    sections
}

pub struct LineScan;

impl FileExtractionStrategy for LineScan {
    fn name(&self) -> &'static str {
        "line_scan"
    }

    fn applies(&self, progress: &Progress) -> bool {
        progress.populated == 0 || (progress.missing() > 0 && progress.sections < progress.expected)
    }

    fn extract(&self, text: &str, expected: &[String]) -> Extraction {
        let mut files = BTreeMap::new();
        let mut sections = 0;
        let mut current: Option<String> = None;
        let mut body = String::new();

        for line in text.lines() {
            if let Some(name) = indicator(line, expected) {
                if let Some(prev) = current.take() {
                    append_content(&mut files, prev, &body);
                }
                body.clear();
                current = Some(name);
                sections += 1;
                continue;
            }
            if current.is_some() {
                body.push_str(line);
                body.push('\n');
            }
        }
        if let Some(prev) = current {
            append_content(&mut files, prev, &body);
        }

        Extraction { files, sections }
    }
}

/// An expected file named on a short, non-code line.
fn indicator(line: &str, expected: &[String]) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_INDICATOR_LEN
        || trimmed.contains('=')
        || trimmed.contains('{')
        || trimmed.starts_with("```")
    {
        return None;
    }
    let lower = trimmed.to_lowercase();
    expected.iter().find(|name| {
        let needle = name.to_lowercase();
        lower
            .match_indices(&needle)
            .any(|(idx, _)| is_token_boundary(&lower, idx, needle.len()))
    })
    .cloned()
}

fn is_token_boundary(haystack: &str, start: usize, len: usize) -> bool {
    let is_name_char = |c: char| c.is_alphanumeric() || c == '_' || c == '-';
    let before = haystack[..start].chars().next_back();
    let mut rest = haystack[start + len..].chars();
    let after = match rest.next() {
        // `main.tf.json` is another file; `main.tf.` ends a sentence.
        Some('.') => rest.next(),
        other => other,
    };
    !before.is_some_and(is_name_char) && !after.is_some_and(is_name_char)
}

pub struct FencedBlocks;

impl FileExtractionStrategy for FencedBlocks {
    fn name(&self) -> &'static str {
        "fenced_blocks"
    }

    fn extract(&self, text: &str, expected: &[String]) -> Extraction {
        let blocks: Vec<&str> = FENCED_BLOCK_REGEX
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .filter(|b| !b.is_empty())
            .collect();
        let files = expected
            .iter()
            .zip(blocks.iter())
            .map(|(name, block)| (name.clone(), block.to_string()))
            .collect();
        Extraction { files, sections: blocks.len() }
    }
}

pub struct WholeResponse;

impl FileExtractionStrategy for WholeResponse {
    fn name(&self) -> &'static str {
        "whole_response"
    }

    fn extract(&self, text: &str, expected: &[String]) -> Extraction {
        let content = strip_fences(text);
        let mut files = BTreeMap::new();
        if let Some(first) = expected.first()
            && !content.is_empty()
        {
            files.insert(first.clone(), content);
        }
        Extraction { sections: files.len(), files }
    }
}

/// Runs the strategies in order, merging each result over the previous ones.
pub struct ResponseParser {
    strategies: Vec<Box<dyn FileExtractionStrategy>>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Box::new(HeaderSplit),
                Box::new(LineScan),
                Box::new(FencedBlocks),
                Box::new(WholeResponse),
            ],
        }
    }

    pub fn with_strategies(strategies: Vec<Box<dyn FileExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn parse(&self, text: &str, expected: &[String]) -> BTreeMap<String, String> {
        let mut files: BTreeMap<String, String> = BTreeMap::new();
        if expected.is_empty() {
            return files;
        }

        let mut sections = 0;
        for strategy in &self.strategies {
            let progress = Progress {
                expected: expected.len(),
                populated: files.len(),
                sections,
            };
            if progress.populated == expected.len() || !strategy.applies(&progress) {
                continue;
            }
            let extraction = strategy.extract(text, expected);
            debug!(
                strategy = strategy.name(),
                sections = extraction.sections,
                files = extraction.files.len(),
                "Extraction strategy ran"
            );
            sections = sections.max(extraction.sections);
            for (name, content) in extraction.files {
                files.entry(name).or_insert(content);
            }
        }

        for name in expected {
            files.entry(name.clone()).or_default();
        }
        files
    }
}

/// Map a raw header name onto an expected file name. `Main.TF`, `main`,
/// `./main.tf` and `modules/x/main.tf` all map to `main.tf`.
pub fn match_expected(raw: &str, expected: &[String]) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_matches(|c: char| c == '`' || c == '*' || c == '"' || c == '\'' || c == ':')
        .trim_start_matches("./")
        .replace('\\', "/")
        .to_lowercase();
    let base = cleaned.rsplit('/').next().unwrap_or(&cleaned).to_string();
    let with_ext = |s: &str| {
        if s.contains('.') {
            s.to_string()
        } else {
            format!("{}.tf", s)
        }
    };
    let candidates = [with_ext(&cleaned), with_ext(&base)];
    expected
        .iter()
        .find(|name| {
            let lower = name.to_lowercase();
            !lower.trim().is_empty() && candidates.iter().any(|c| *c == lower)
        })
        .cloned()
}

fn append_content(files: &mut BTreeMap<String, String>, name: String, body: &str) {
    let content = strip_fences(body);
    if content.is_empty() {
        return;
    }
    files
        .entry(name)
        .and_modify(|existing| {
            existing.push('\n');
            existing.push_str(&content);
        })
        .or_insert(content);
}

/// Remove fence marker lines and trim.
pub fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_header_split_basic_example() {
        let text = "## main.tf\nresource \"aws_s3_bucket\" \"x\" {}\n## variables.tf\n";
        let files = ResponseParser::new().parse(text, &names(&["main.tf", "variables.tf"]));
        assert_eq!(files.len(), 2);
        assert_eq!(files["main.tf"], "resource \"aws_s3_bucket\" \"x\" {}");
        assert_eq!(files["variables.tf"], "");
    }

    #[test]
    fn test_header_split_strips_fences_and_prose_headers() {
        let text = "Here you go.\n\n## main.tf\n```hcl\nresource \"a\" \"b\" {}\n```\n\n## `outputs.tf`\n```hcl\noutput \"id\" {\n  value = 1\n}\n```\n";
        let ext = HeaderSplit.extract(text, &names(&["main.tf", "outputs.tf"]));
        assert_eq!(ext.sections, 2);
        assert_eq!(ext.files["main.tf"], "resource \"a\" \"b\" {}");
        assert_eq!(ext.files["outputs.tf"], "output \"id\" {\n  value = 1\n}");
    }

    #[test]
    fn test_header_split_other_styles() {
        let expected = names(&["main.tf", "variables.tf"]);
        let bold = "**main.tf**\nresource \"a\" \"b\" {}\n**variables.tf**\nvariable \"v\" {}\n";
        let ext = HeaderSplit.extract(bold, &expected);
        assert_eq!(ext.files["variables.tf"], "variable \"v\" {}");

        let file_prefix = "File: main.tf\nA\nFILE: ./Variables.TF\nB\n";
        let ext = HeaderSplit.extract(file_prefix, &expected);
        assert_eq!(ext.files["main.tf"], "A");
        assert_eq!(ext.files["variables.tf"], "B");

        let colon = "main.tf:\nA\nvariables.tf:\nB\n";
        assert_eq!(HeaderSplit.extract(colon, &expected).files.len(), 2);
    }

    #[test]
    fn test_header_split_single_section_only_for_single_expected() {
        let text = "## outputs.tf\noutput \"x\" {}\n";
        assert_eq!(HeaderSplit.extract(text, &names(&["outputs.tf"])).files.len(), 1);
        assert!(HeaderSplit.extract(text, &names(&["main.tf", "outputs.tf"])).files.is_empty());
    }

    #[test]
    fn test_unexpected_files_are_dropped() {
        let text = "## main.tf\nA\n## extra.tf\nB\n";
        let files = ResponseParser::new().parse(text, &names(&["main.tf"]));
        assert_eq!(files.len(), 1);
        assert_eq!(files["main.tf"], "A");
    }

    #[test]
    fn test_match_expected_normalizes() {
        let expected = names(&["main.tf", "variables.tf"]);
        assert_eq!(match_expected("Main.TF", &expected).as_deref(), Some("main.tf"));
        assert_eq!(match_expected("main", &expected).as_deref(), Some("main.tf"));
        assert_eq!(match_expected("./main.tf", &expected).as_deref(), Some("main.tf"));
        assert_eq!(match_expected("modules/net/variables.tf", &expected).as_deref(), Some("variables.tf"));
        assert_eq!(match_expected("outputs.tf", &expected), None);
        assert_eq!(match_expected("", &names(&["", "main.tf"])), None);
    }

    #[test]
    fn test_line_scan_finds_prose_indicators() {
        let text = "Here is the main.tf file:\nresource \"a\" \"b\" {}\n\nAnd for variables.tf:\nvariable \"region\" {}\n";
        let ext = LineScan.extract(text, &names(&["main.tf", "variables.tf"]));
        assert_eq!(ext.sections, 2);
        assert_eq!(ext.files["main.tf"], "resource \"a\" \"b\" {}");
        assert_eq!(ext.files["variables.tf"], "variable \"region\" {}");
    }

    #[test]
    fn test_line_scan_ignores_code_lines_mentioning_files() {
        let text = "# main.tf\nmodule \"m\" {\n  source = \"./variables.tf\"\n}\n";
        let ext = LineScan.extract(text, &names(&["main.tf", "variables.tf"]));
        assert_eq!(ext.sections, 1);
        assert!(ext.files["main.tf"].contains("./variables.tf"));
        assert!(!ext.files.contains_key("variables.tf"));
    }

    #[test]
    fn test_line_scan_fills_only_missing_files() {
        let text = "## main.tf\nA\n## notes.md\nignored\nvariables.tf\nB\n";
        let files = ResponseParser::new().parse(text, &names(&["main.tf", "variables.tf", "outputs.tf"]));
        assert_eq!(files["main.tf"], "A");
        assert_eq!(files["variables.tf"], "B");
        assert_eq!(files["outputs.tf"], "");
    }

    #[test]
    fn test_fenced_blocks_positional() {
        let text = "Sure!\n```hcl\nresource \"a\" \"b\" {}\n```\nand\n```\nvariable \"v\" {}\n```\n```\noutput \"o\" {}\n```";
        let files = ResponseParser::new().parse(text, &names(&["main.tf", "variables.tf"]));
        assert_eq!(files["main.tf"], "resource \"a\" \"b\" {}");
        assert_eq!(files["variables.tf"], "variable \"v\" {}");
    }

    #[test]
    fn test_whole_response_fallback() {
        let text = "resource \"aws_vpc\" \"main\" {\n  cidr_block = var.cidr\n}\n";
        let files = ResponseParser::new().parse(text, &names(&["main.tf", "variables.tf"]));
        assert_eq!(files["main.tf"], text.trim());
        assert_eq!(files["variables.tf"], "");
    }

    #[test]
    fn test_empty_inputs() {
        assert!(ResponseParser::new().parse("## main.tf\nA", &[]).is_empty());
        let files = ResponseParser::new().parse("   ", &names(&["main.tf"]));
        assert_eq!(files.len(), 1);
        assert_eq!(files["main.tf"], "");
    }

    #[test]
    fn test_parse_is_idempotent() {
        let parser = ResponseParser::new();
        let expected = names(&["main.tf", "variables.tf", "outputs.tf"]);
        let texts = [
            "## main.tf\nA\n## variables.tf\nB\n",
            "main.tf here\nA\n",
            "```\nA\n```",
            "just text",
        ];
        for text in texts {
            let first = parser.parse(text, &expected);
            let second = parser.parse(text, &expected);
            assert_eq!(first, second);
            assert_eq!(first.keys().cloned().collect::<Vec<_>>(), {
                let mut e = expected.clone();
                e.sort();
                e
            });
        }
    }

    #[test]
    fn test_custom_strategy_list() {
        let parser = ResponseParser::with_strategies(vec![Box::new(WholeResponse)]);
        let files = parser.parse("## main.tf\nA\n## variables.tf\nB", &names(&["main.tf", "variables.tf"]));
        assert!(files["main.tf"].contains("## variables.tf"));
    }
}
