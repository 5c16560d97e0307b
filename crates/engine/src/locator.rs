//! Stylesheet rule and property location
//!
//! A small tokenizer over the raw stylesheet text. It tracks comments, quoted
//! strings, escapes, parentheses and brace depth, which is enough to find a
//! rule's block and the declarations directly inside it without building a
//! syntax tree. Rules nested in `@media`/`@supports` blocks are found too and
//! carry their enclosing at-rule; a top-level rule wins over a nested one
//! with the same selector.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use visfix_common::{Error, Result};

/// A located rule block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleRule {
    pub selector: String,
    pub file: PathBuf,
    /// 1-indexed line where the selector starts
    pub start_line: usize,
    /// 1-indexed line of the closing brace
    pub end_line: usize,
    pub body_lines: Vec<String>,
    /// Number of enclosing blocks
    pub depth: usize,
    /// Nearest enclosing at-rule prelude, e.g. `@media (max-width: 600px)`
    pub at_rule: Option<String>,
    /// Byte range between the braces
    pub body: Range<usize>,
}

/// A located declaration inside a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyLocation {
    pub rule: StyleRule,
    pub property: String,
    /// 1-indexed absolute line of the property name
    pub line: usize,
    pub raw_line: String,
    pub value: String,
    /// Byte range of the value in the stylesheet text
    pub value_span: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Punct {
    Open,
    Close,
    Semi,
    Colon,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    pos: usize,
    punct: Punct,
}

#[derive(Debug, Clone)]
struct Block {
    prelude: String,
    prelude_start: usize,
    open: usize,
    close: usize,
    depth: usize,
    parent: Option<usize>,
}

/// A stylesheet prepared for rule lookup
#[derive(Debug, Clone)]
pub struct Stylesheet {
    path: PathBuf,
    text: String,
    tokens: Vec<Token>,
    comments: Vec<Range<usize>>,
    blocks: Vec<Block>,
    line_starts: Vec<usize>,
}

impl Stylesheet {
    pub fn parse(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        let text = text.into();
        let (tokens, comments) = tokenize(&text);
        let blocks = collect_blocks(&text, &tokens, &comments);
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();

        Self {
            path: path.into(),
            text,
            tokens,
            comments,
            blocks,
            line_starts,
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = visfix_common::fs::read_to_string(path).await?;
        Ok(Self::parse(path, text))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// All rules whose selector list contains `selector`, in document order
    pub fn find_rules(&self, selector: &str) -> Vec<StyleRule> {
        let wanted = normalize_selector(selector);
        if wanted.is_empty() {
            return Vec::new();
        }

        self.blocks
            .iter()
            .filter(|b| !b.prelude.starts_with('@'))
            .filter(|b| {
                split_selector_list(&b.prelude)
                    .iter()
                    .any(|part| normalize_selector(part) == wanted)
            })
            .map(|b| self.rule_for(b, &wanted))
            .collect()
    }

    /// The rule for `selector`: the first top-level match, else the first nested one
    pub fn find_rule(&self, selector: &str) -> Option<StyleRule> {
        let rules = self.find_rules(selector);
        let top_level = rules.iter().position(|r| r.depth == 0);
        match top_level {
            Some(i) => rules.into_iter().nth(i),
            None => rules.into_iter().next(),
        }
    }

    /// First declaration of `property` directly inside `rule`
    pub fn find_property(&self, rule: &StyleRule, property: &str) -> Option<PropertyLocation> {
        let property = property.trim();
        let block = self
            .blocks
            .iter()
            .find(|b| b.open + 1 == rule.body.start && b.close == rule.body.end)?;

        self.declarations(block)
            .into_iter()
            .find(|(name, _, _)| name.eq_ignore_ascii_case(property))
            .map(|(_, name_start, value_span)| {
                let line = self.line_of(name_start);
                PropertyLocation {
                    rule: rule.clone(),
                    property: property.to_string(),
                    line,
                    raw_line: self.line_text(line).to_string(),
                    value: self.text[value_span.clone()].to_string(),
                    value_span,
                }
            })
    }

    /// Locate `property` in the rule for `selector`
    pub fn locate(&self, selector: &str, property: &str) -> Result<PropertyLocation> {
        let rule = self.find_rule(selector).ok_or_else(|| {
            Error::not_found("selector", format!("{} in {}", selector, self.path.display()))
        })?;

        self.find_property(&rule, property).ok_or_else(|| {
            Error::not_found(
                "property",
                format!(
                    "{} in {} ({}:{}-{})",
                    property,
                    selector,
                    self.path.display(),
                    rule.start_line,
                    rule.end_line
                ),
            )
        })
    }

    /// The stylesheet text with only the located value replaced
    pub fn with_value(&self, location: &PropertyLocation, new_value: &str) -> String {
        let span = &location.value_span;
        let mut out = String::with_capacity(self.text.len() + new_value.len());
        out.push_str(&self.text[..span.start]);
        out.push_str(new_value);
        out.push_str(&self.text[span.end..]);
        out
    }

    fn rule_for(&self, block: &Block, selector: &str) -> StyleRule {
        let start_line = self.line_of(block.prelude_start);
        let end_line = self.line_of(block.close);
        let at_rule = std::iter::successors(block.parent, |&i| self.blocks[i].parent)
            .map(|i| &self.blocks[i])
            .find(|b| b.prelude.starts_with('@'))
            .map(|b| b.prelude.clone());

        StyleRule {
            selector: selector.to_string(),
            file: self.path.clone(),
            start_line,
            end_line,
            body_lines: (start_line..=end_line)
                .map(|l| self.line_text(l).to_string())
                .collect(),
            depth: block.depth,
            at_rule,
            body: block.open + 1..block.close,
        }
    }

    /// (name, name start, trimmed value span) for declarations at the block's own level
    fn declarations(&self, block: &Block) -> Vec<(String, usize, Range<usize>)> {
        let first = self.tokens.partition_point(|t| t.pos <= block.open);
        let last = self.tokens.partition_point(|t| t.pos < block.close);

        let mut out = Vec::new();
        let mut depth = 0usize;
        let mut seg_start = block.open + 1;
        let mut colon: Option<usize> = None;

        let mut emit = |seg_start: usize, colon: Option<usize>, end: usize| {
            let Some(colon) = colon else { return };
            let (name, name_start) = strip_comments(&self.text, seg_start..colon, &self.comments);
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return;
            }
            let value = trim_span(&self.text, colon + 1..end, &self.comments);
            out.push((name.to_string(), name_start.unwrap_or(seg_start), value));
        };

        for token in &self.tokens[first..last] {
            match token.punct {
                Punct::Open => {
                    depth += 1;
                    colon = None;
                }
                Punct::Close => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        seg_start = token.pos + 1;
                        colon = None;
                    }
                }
                Punct::Semi if depth == 0 => {
                    emit(seg_start, colon, token.pos);
                    seg_start = token.pos + 1;
                    colon = None;
                }
                Punct::Colon if depth == 0 && colon.is_none() => colon = Some(token.pos),
                _ => {}
            }
        }
        if depth == 0 {
            emit(seg_start, colon, block.close);
        }

        out
    }

    fn line_of(&self, pos: usize) -> usize {
        self.line_starts.partition_point(|&start| start <= pos)
    }

    fn line_text(&self, line: usize) -> &str {
        let start = self.line_starts[line - 1];
        let end = self
            .line_starts
            .get(line)
            .map(|&next| next - 1)
            .unwrap_or(self.text.len());
        self.text[start..end].trim_end_matches('\r')
    }
}

fn tokenize(text: &str) -> (Vec<Token>, Vec<Range<usize>>) {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut comments = Vec::new();
    let mut parens = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = text[i + 2..]
                    .find("*/")
                    .map(|p| i + 2 + p + 2)
                    .unwrap_or(bytes.len());
                comments.push(i..end);
                i = end;
                continue;
            }
            quote @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote && bytes[i] != b'\n' {
                    i += if bytes[i] == b'\\' { 2 } else { 1 };
                }
            }
            b'\\' => i += 1,
            b'(' => parens += 1,
            b')' => parens = parens.saturating_sub(1),
            b'{' => {
                parens = 0;
                tokens.push(Token { pos: i, punct: Punct::Open });
            }
            b'}' => {
                parens = 0;
                tokens.push(Token { pos: i, punct: Punct::Close });
            }
            b';' if parens == 0 => tokens.push(Token { pos: i, punct: Punct::Semi }),
            b':' if parens == 0 => tokens.push(Token { pos: i, punct: Punct::Colon }),
            _ => {}
        }
        i += 1;
    }

    (tokens, comments)
}

fn collect_blocks(text: &str, tokens: &[Token], comments: &[Range<usize>]) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut closed: Vec<bool> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut seg_start = 0;

    for token in tokens {
        match token.punct {
            Punct::Open => {
                let (prelude, start) = strip_comments(text, seg_start..token.pos, comments);
                blocks.push(Block {
                    prelude: prelude.trim().to_string(),
                    prelude_start: start.unwrap_or(token.pos),
                    open: token.pos,
                    close: text.len(),
                    depth: stack.len(),
                    parent: stack.last().copied(),
                });
                closed.push(false);
                stack.push(blocks.len() - 1);
                seg_start = token.pos + 1;
            }
            Punct::Close => {
                if let Some(idx) = stack.pop() {
                    blocks[idx].close = token.pos;
                    closed[idx] = true;
                }
                seg_start = token.pos + 1;
            }
            Punct::Semi => seg_start = token.pos + 1,
            Punct::Colon => {}
        }
    }

    // Unterminated blocks are unusable. Dropping them would shift parent
    // indices, so they stay with an empty prelude that never matches.
    for (block, ok) in blocks.iter_mut().zip(closed) {
        if !ok {
            block.prelude.clear();
        }
    }
    blocks
}

/// Text of `range` with comments removed, and the offset of its first
/// non-whitespace, non-comment byte
fn strip_comments(text: &str, range: Range<usize>, comments: &[Range<usize>]) -> (String, Option<usize>) {
    let mut out = String::new();
    let mut first = None;
    let mut cursor = range.start;

    let mut push = |piece: Range<usize>, out: &mut String| {
        if piece.start >= piece.end {
            return;
        }
        let slice = &text[piece.clone()];
        if first.is_none() {
            if let Some(off) = slice.find(|c: char| !c.is_whitespace()) {
                first = Some(piece.start + off);
            }
        }
        out.push_str(slice);
    };

    for comment in comments
        .iter()
        .filter(|c| c.end > range.start && c.start < range.end)
    {
        push(cursor..comment.start.max(cursor), &mut out);
        cursor = cursor.max(comment.end).min(range.end);
    }
    push(cursor..range.end, &mut out);

    (out, first)
}

/// Shrink `range` past surrounding whitespace and comments
fn trim_span(text: &str, range: Range<usize>, comments: &[Range<usize>]) -> Range<usize> {
    let (mut start, mut end) = (range.start, range.end);
    loop {
        let slice = &text[start..end];
        let trimmed = slice.trim_start();
        start += slice.len() - trimmed.len();
        match comments.iter().find(|c| c.start == start && c.end <= end) {
            Some(c) => start = c.end,
            None => break,
        }
    }
    loop {
        let slice = &text[start..end];
        end = start + slice.trim_end().len();
        match comments.iter().find(|c| c.end == end && c.start >= start) {
            Some(c) => end = c.start,
            None => break,
        }
    }
    start..end
}

pub(crate) fn normalize_selector(selector: &str) -> String {
    selector.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a selector list on commas outside parentheses and brackets
fn split_selector_list(prelude: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in prelude.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&prelude[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&prelude[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const BUTTONS: &str = "\
/* buttons */
.btn {
    padding: 4px 8px;
}

.btn-primary {
    background-color: #3498db;
    color: white;
}
";

    fn sheet(text: &str) -> Stylesheet {
        Stylesheet::parse("styles/main.css", text)
    }

    #[test]
    fn test_find_rule_lines() {
        let css = sheet(BUTTONS);
        let rule = css.find_rule(".btn-primary").unwrap();
        assert_eq!(rule.start_line, 6);
        assert_eq!(rule.end_line, 9);
        assert_eq!(rule.depth, 0);
        assert_eq!(rule.body_lines.first().unwrap(), ".btn-primary {");
        assert_eq!(rule.file, PathBuf::from("styles/main.css"));
    }

    #[test]
    fn test_prefix_selector_does_not_match_longer_one() {
        let css = sheet(BUTTONS);
        let rule = css.find_rule(".btn").unwrap();
        assert_eq!(rule.start_line, 2);
    }

    #[test_case(".a, .b { color: red; }", ".b" ; "second in list")]
    #[test_case(".a,\n.b\n{ color: red; }", ".b" ; "list across lines")]
    #[test_case("nav  >  a { color: red; }", "nav > a" ; "whitespace normalized")]
    #[test_case(":is(.x, .y) .z { color: red; }", ":is(.x, .y) .z" ; "comma inside parens")]
    #[test_case("/* .q { */ .q { color: red; }", ".q" ; "brace in comment")]
    fn test_selector_variants(css: &str, selector: &str) {
        let css = sheet(css);
        let loc = css.locate(selector, "color").unwrap();
        assert_eq!(loc.value, "red");
    }

    #[test]
    fn test_find_property_value_and_line() {
        let css = sheet(BUTTONS);
        let loc = css.locate(".btn-primary", "background-color").unwrap();
        assert_eq!(loc.line, 7);
        assert_eq!(loc.raw_line, "    background-color: #3498db;");
        assert_eq!(loc.value, "#3498db");
        assert_eq!(&css.text()[loc.value_span.clone()], "#3498db");
    }

    #[test]
    fn test_exact_patch_preserves_indentation() {
        let css = sheet(".btn-primary {\n    background-color: #3498db;\n}");
        let loc = css.locate(".btn-primary", "background-color").unwrap();
        let patched = css.with_value(&loc, "#2ecc71");
        assert_eq!(patched.lines().nth(1).unwrap(), "    background-color: #2ecc71;");
        assert_eq!(patched, ".btn-primary {\n    background-color: #2ecc71;\n}");
    }

    #[test]
    fn test_top_level_rule_preferred_over_media() {
        let css = sheet(
            "@media (max-width: 600px) {\n  .card { margin: 0; }\n}\n.card {\n  margin: 16px;\n}\n",
        );
        let rule = css.find_rule(".card").unwrap();
        assert_eq!(rule.depth, 0);
        assert_eq!(rule.start_line, 4);
        assert_eq!(css.locate(".card", "margin").unwrap().value, "16px");

        let all = css.find_rules(".card");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].at_rule.as_deref(), Some("@media (max-width: 600px)"));
    }

    #[test]
    fn test_nested_only_rule_is_found() {
        let css = sheet("@supports (display: grid) {\n  .grid {\n    display: grid;\n  }\n}\n");
        let loc = css.locate(".grid", "display").unwrap();
        assert_eq!(loc.line, 3);
        assert_eq!(loc.rule.depth, 1);
        assert_eq!(loc.value, "grid");
    }

    #[test]
    fn test_property_in_comment_or_nested_block_is_skipped() {
        let css = sheet(
            ".x {\n  /* color: blue; */\n  &:hover { color: green; }\n  color: red;\n}\n",
        );
        let loc = css.locate(".x", "color").unwrap();
        assert_eq!(loc.value, "red");
        assert_eq!(loc.line, 4);
    }

    #[test]
    fn test_property_name_not_matched_as_substring() {
        let css = sheet(".x {\n  border-color: red;\n  color: blue;\n}");
        assert_eq!(css.locate(".x", "color").unwrap().value, "blue");
    }

    #[test]
    fn test_value_with_semicolon_in_url_and_string() {
        let css = sheet(
            ".hero {\n  background: url(data:image/png;base64,AAAA);\n  content: \"a;b\";\n  color: red\n}",
        );
        assert_eq!(css.locate(".hero", "background").unwrap().value, "url(data:image/png;base64,AAAA)");
        assert_eq!(css.locate(".hero", "content").unwrap().value, "\"a;b\"");
        assert_eq!(css.locate(".hero", "color").unwrap().value, "red");
    }

    #[test]
    fn test_value_trailing_comment_excluded() {
        let css = sheet(".x { color: red /* brand */ ; }");
        assert_eq!(css.locate(".x", "color").unwrap().value, "red");
    }

    #[test]
    fn test_escaped_colon_selector() {
        let css = sheet(".sm\\:flex { display: flex; }");
        assert_eq!(css.locate(".sm\\:flex", "display").unwrap().value, "flex");
    }

    #[test]
    fn test_missing_selector_and_property() {
        let css = sheet(BUTTONS);
        match css.locate(".missing", "color") {
            Err(Error::NotFound { kind, id }) => {
                assert_eq!(kind, "selector");
                assert!(id.contains(".missing"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        match css.locate(".btn", "margin") {
            Err(Error::NotFound { kind, id }) => {
                assert_eq!(kind, "property");
                assert!(id.contains("styles/main.css:2-4"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_block_never_matches() {
        let css = sheet(".a { color: red;");
        assert!(css.find_rule(".a").is_none());
    }
}
