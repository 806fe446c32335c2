//! README parsing focused on extracting tagged code blocks.
//!
//! The fence scanner walks the document line by line, collecting every
//! fenced region whose info string carries a `markpact:` tag, and returns
//! structured `Block` records the rest of the pipeline consumes. A second
//! pass over the pulldown-cmark event stream attaches heading context for
//! reporter output.

use pulldown_cmark::{CowStr, Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use serde::Serialize;

use crate::errors::{PactownError, Result};

const TAG_PREFIX: &str = "markpact:";

/// Role a tagged block plays in the document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Source file to materialize; `meta` must carry `path=`.
    File,
    /// Dependency specifiers, one per line.
    Deps,
    /// Shell command that starts the service.
    Run,
    /// Platform/framework hints as `k=v` pairs.
    Target,
    /// Environment variable names the service expects.
    Env,
    /// Tag we do not recognize; kept so callers can warn about it.
    Unknown(String),
}

impl BlockKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "file" => Self::File,
            "deps" => Self::Deps,
            "run" => Self::Run,
            "target" => Self::Target,
            "env" => Self::Env,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::File => "file",
            Self::Deps => "deps",
            Self::Run => "run",
            Self::Target => "target",
            Self::Env => "env",
            Self::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tagged fenced region extracted from the README.
#[derive(Clone, Debug, Serialize)]
pub struct Block {
    pub kind: BlockKind,
    /// Language token when the new info-string dialect provides one;
    /// empty string for the old `markpact:<kind> ...` dialect.
    pub lang: String,
    /// Raw whitespace-separated `k=v` list from the info string.
    pub meta: String,
    /// Exact source text between the fences. Interior newlines are
    /// preserved; only the newline introduced by the closing fence line is
    /// stripped.
    pub body: String,
    /// 1-based line number of the opening fence.
    pub line: usize,
    /// Heading hierarchy enclosing the block, for reporter output.
    pub headings: Vec<String>,
}

impl Block {
    /// Value of a `k=v` pair in `meta`, if present.
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta
            .split_whitespace()
            .filter_map(|token| token.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// `path=` value for `file` blocks.
    pub fn get_path(&self) -> Option<&str> {
        self.meta_value("path")
    }

    /// Dependency specifiers for `deps` blocks: body lines minus blanks
    /// and `#` comments.
    pub fn dep_specs(&self) -> Vec<String> {
        self.body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect()
    }

    /// Reconstruct the fenced region exactly as it appeared in the source.
    pub fn to_markdown(&self) -> String {
        let mut info = String::new();
        if self.lang.is_empty() {
            info.push_str(TAG_PREFIX);
            info.push_str(self.kind.as_str());
        } else {
            info.push_str(&self.lang);
            info.push(' ');
            info.push_str(TAG_PREFIX);
            info.push_str(self.kind.as_str());
        }
        if !self.meta.is_empty() {
            info.push(' ');
            info.push_str(&self.meta);
        }
        format!("```{info}\n{body}\n```\n", body = self.body)
    }
}

/// Parse result: blocks in document order plus non-fatal warnings.
#[derive(Clone, Debug, Default)]
pub struct Document {
    pub blocks: Vec<Block>,
    pub warnings: Vec<String>,
}

/// Extract tagged blocks, discarding parser warnings (they are still logged).
pub fn parse_blocks(content: &str) -> Result<Vec<Block>> {
    parse_document(content).map(|doc| doc.blocks)
}

/// Extract tagged blocks and surface non-fatal warnings to the caller.
///
/// An opening fence without a matching close is a hard error carrying the
/// opening line number; no partial blocks are returned.
pub fn parse_document(content: &str) -> Result<Document> {
    let mut blocks = Vec::new();
    let mut warnings = Vec::new();

    let mut open: Option<(usize, String)> = None;
    let mut body_lines: Vec<&str> = Vec::new();

    for (idx, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim_end_matches('\r');
        match &open {
            None => {
                if let Some(info) = line.strip_prefix("```") {
                    open = Some((idx + 1, info.trim().to_string()));
                    body_lines.clear();
                }
            }
            Some((open_line, info)) => {
                if line.trim_end() == "```" {
                    if let Some(block) =
                        tagged_block(info, *open_line, &body_lines, &mut warnings)
                    {
                        blocks.push(block);
                    }
                    open = None;
                } else {
                    body_lines.push(line);
                }
            }
        }
    }

    if let Some((open_line, _)) = open {
        return Err(PactownError::Parse {
            line: open_line,
            message: "opening fence has no matching close".into(),
        });
    }

    attach_heading_context(content, &mut blocks);

    for warning in &warnings {
        log::warn!("{warning}");
    }

    Ok(Document { blocks, warnings })
}

/// Build a `Block` when the info string carries a `markpact:` tag.
///
/// Two dialects are accepted:
/// - new: `<lang> markpact:<kind> [k=v ...]`
/// - old: `markpact:<kind> [tokens ...]` (no language; everything after the
///   tag becomes `meta`)
fn tagged_block(
    info: &str,
    open_line: usize,
    body_lines: &[&str],
    warnings: &mut Vec<String>,
) -> Option<Block> {
    let tokens: Vec<&str> = info.split_whitespace().collect();
    let first = tokens.first()?;

    let (kind_tag, lang, meta_tokens): (&str, String, Vec<&str>) =
        if let Some(tag) = first.strip_prefix(TAG_PREFIX) {
            (tag, String::new(), tokens[1..].to_vec())
        } else {
            let tag = tokens[1..]
                .iter()
                .find_map(|token| token.strip_prefix(TAG_PREFIX))?;
            let meta = tokens[1..]
                .iter()
                .copied()
                .filter(|token| !token.starts_with(TAG_PREFIX))
                .collect();
            (tag, first.to_string(), meta)
        };

    let kind = BlockKind::from_tag(kind_tag);
    if let BlockKind::Unknown(other) = &kind {
        warnings.push(format!(
            "unknown block kind 'markpact:{other}' at line {open_line}"
        ));
    }

    Some(Block {
        kind,
        lang,
        meta: meta_tokens.join(" "),
        body: body_lines.join("\n"),
        line: open_line,
        headings: Vec::new(),
    })
}

/// The shell command from the first `run` block; later `run` blocks are
/// ignored (at most one is honored per service).
pub fn extract_run_command(blocks: &[Block]) -> Option<String> {
    blocks
        .iter()
        .find(|block| block.kind == BlockKind::Run)
        .map(|block| block.body.trim().to_string())
        .filter(|cmd| !cmd.is_empty())
}

/// Environment variable names declared by `env` blocks. Lines may be bare
/// names or `KEY=...` pairs; only the name is kept.
pub fn extract_env_keys(blocks: &[Block]) -> Vec<String> {
    let mut keys: Vec<String> = blocks
        .iter()
        .filter(|block| block.kind == BlockKind::Env)
        .flat_map(|block| block.body.lines())
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once('=') {
            Some((key, _)) => key.trim().to_string(),
            None => line.to_string(),
        })
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// All dependency specifiers across `deps` blocks, in document order.
pub fn extract_dep_specs(blocks: &[Block]) -> Vec<String> {
    blocks
        .iter()
        .filter(|block| block.kind == BlockKind::Deps)
        .flat_map(|block| block.dep_specs())
        .collect()
}

/// Relative paths declared by `file` blocks, in document order.
pub fn extract_file_paths(blocks: &[Block]) -> Vec<String> {
    blocks
        .iter()
        .filter(|block| block.kind == BlockKind::File)
        .filter_map(|block| block.get_path())
        .map(String::from)
        .collect()
}

/// Walk the markdown event stream once and attach the enclosing heading
/// trail to each block, matching blocks to headings by line number.
fn attach_heading_context(content: &str, blocks: &mut [Block]) {
    if blocks.is_empty() {
        return;
    }

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(content.char_indices().filter_map(|(i, c)| (c == '\n').then_some(i + 1)))
        .collect();
    let line_of = |offset: usize| match line_starts.binary_search(&offset) {
        Ok(idx) => idx + 1,
        Err(idx) => idx,
    };

    let mut headings: Vec<(usize, u32, String)> = Vec::new();
    let mut active: Option<(usize, u32, HeadingBuilder)> = None;

    let parser = Parser::new_ext(content, Options::all());
    for (event, range) in parser.into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                active = Some((line_of(range.start), heading_depth(level), HeadingBuilder::new()));
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, _, builder)) = active.as_mut() {
                    builder.push(&text);
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some((line, depth, builder)) = active.take() {
                    headings.push((line, depth, builder.buffer.trim().to_string()));
                }
            }
            _ => {}
        }
    }

    let mut stack: Vec<(u32, String)> = Vec::new();
    let mut next_heading = 0;
    for block in blocks.iter_mut() {
        while next_heading < headings.len() && headings[next_heading].0 < block.line {
            let (_, depth, ref title) = headings[next_heading];
            stack.retain(|(existing, _)| *existing < depth);
            stack.push((depth, title.clone()));
            next_heading += 1;
        }
        block.headings = stack.iter().map(|(_, title)| title.clone()).collect();
    }
}

#[derive(Debug)]
struct HeadingBuilder {
    buffer: String,
}

impl HeadingBuilder {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn push(&mut self, fragment: &CowStr) {
        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(fragment);
    }
}

fn heading_depth(level: HeadingLevel) -> u32 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_format_includes_lang() {
        let md = "```python markpact:file path=main.py\nprint(\"hi\")\n```";
        let blocks = parse_blocks(md).expect("parse");
        assert_eq!(blocks.len(), 1);

        let block = &blocks[0];
        assert_eq!(block.kind, BlockKind::File);
        assert_eq!(block.meta, "path=main.py");
        assert_eq!(block.lang, "python");
        assert_eq!(block.body, "print(\"hi\")");
        assert_eq!(block.get_path(), Some("main.py"));
    }

    #[test]
    fn old_format_is_supported() {
        let md = "```markpact:file python path=main.py\nprint(\"hi\")\n```";
        let blocks = parse_blocks(md).expect("parse");
        assert_eq!(blocks.len(), 1);

        let block = &blocks[0];
        assert_eq!(block.kind, BlockKind::File);
        assert_eq!(block.meta, "python path=main.py");
        assert_eq!(block.lang, "");
        assert_eq!(block.body, "print(\"hi\")");
        assert_eq!(block.get_path(), Some("main.py"));
    }

    #[test]
    fn dialects_agree_on_everything_but_lang() {
        let new = parse_blocks("```python markpact:file path=m.py\nx = 1\n```").unwrap();
        let old = parse_blocks("```markpact:file python path=m.py\nx = 1\n```").unwrap();
        assert_eq!(new[0].kind, old[0].kind);
        assert_eq!(new[0].body, old[0].body);
        assert_eq!(new[0].get_path(), old[0].get_path());
        assert_eq!(new[0].lang, "python");
        assert_eq!(old[0].lang, "");
    }

    #[test]
    fn run_block_new_format() {
        let md = "```bash markpact:run\necho hi\n```";
        let blocks = parse_blocks(md).expect("parse");
        let block = &blocks[0];
        assert_eq!(block.kind, BlockKind::Run);
        assert_eq!(block.meta, "");
        assert_eq!(block.lang, "bash");
        assert_eq!(block.body, "echo hi");
    }

    #[test]
    fn untagged_blocks_are_ignored() {
        let md = "```bash\necho plain\n```\n\n```python markpact:file path=a.py\npass\n```";
        let blocks = parse_blocks(md).expect("parse");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, BlockKind::File);
    }

    #[test]
    fn unclosed_fence_is_a_hard_error() {
        let md = "# Doc\n\n```python markpact:file path=a.py\nprint('hi')\n";
        let err = parse_blocks(md).expect_err("must fail");
        match err {
            PactownError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unclosed_fence_yields_no_partial_blocks() {
        let md = "```python markpact:file path=a.py\npass\n```\n```bash markpact:run\necho hi\n";
        assert!(parse_blocks(md).is_err());
    }

    #[test]
    fn unknown_kinds_warn_but_do_not_fail() {
        let md = "```python markpact:mystery path=a.py\npass\n```";
        let doc = parse_document(md).expect("parse");
        assert_eq!(doc.blocks.len(), 1);
        assert!(matches!(doc.blocks[0].kind, BlockKind::Unknown(_)));
        assert_eq!(doc.warnings.len(), 1);
        assert!(doc.warnings[0].contains("markpact:mystery"));
        assert!(doc.warnings[0].contains("line 1"));
    }

    #[test]
    fn body_preserves_interior_newlines_and_blank_lines() {
        let md = "```python markpact:file path=a.py\nline1\n\nline3\n\n```";
        let blocks = parse_blocks(md).expect("parse");
        assert_eq!(blocks[0].body, "line1\n\nline3\n");
    }

    #[test]
    fn file_blocks_round_trip_byte_for_byte() {
        let sources = [
            "```python markpact:file path=main.py\nprint(\"hi\")\n```\n",
            "```markpact:file python path=main.py\nprint(\"hi\")\n```\n",
            "```js markpact:file path=app/index.js\nconst x = 1;\n\nmodule.exports = x;\n```\n",
        ];
        for source in sources {
            let blocks = parse_blocks(source).expect("parse");
            assert_eq!(blocks[0].to_markdown(), source);
        }
    }

    #[test]
    fn dep_specs_skip_blanks_and_comments() {
        let md = "```python markpact:deps\nfastapi\n\n# pinned for the proxy\nuvicorn\n```";
        let blocks = parse_blocks(md).expect("parse");
        assert_eq!(blocks[0].dep_specs(), vec!["fastapi", "uvicorn"]);
    }

    #[test]
    fn run_command_honors_only_the_first_run_block() {
        let md = "```bash markpact:run\npython main.py\n```\n```bash markpact:run\nnever\n```";
        let blocks = parse_blocks(md).expect("parse");
        assert_eq!(extract_run_command(&blocks).as_deref(), Some("python main.py"));
    }

    #[test]
    fn env_keys_are_names_only() {
        let md = "```text markpact:env\nAPI_URL\nDB_PASSWORD=unused-here\n```";
        let blocks = parse_blocks(md).expect("parse");
        assert_eq!(extract_env_keys(&blocks), vec!["API_URL", "DB_PASSWORD"]);
    }

    #[test]
    fn blocks_carry_heading_context() {
        let md = "# Service\n\n## Setup\n\n```python markpact:file path=a.py\npass\n```\n";
        let blocks = parse_blocks(md).expect("parse");
        assert_eq!(blocks[0].headings, vec!["Service", "Setup"]);
    }
}
