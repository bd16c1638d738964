use once_cell::sync::Lazy;
use pulldown_cmark::{
    CodeBlockKind, Event as MdEvent, Options, Parser as MdParser, Tag as MdTag,
    TagEnd as MdTagEnd,
};
use regex::Regex;
use std::{ops::Range, path::Path};

use crate::{
    codec::{
        diagnostic::{Diagnostic, DiagnosticCode},
        DocParser, ParseOutput,
    },
    properties::{Block, BlockKind, SourceLocation},
};

pub use pulldown_cmark;

static ENTITY_SIGNATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^entity\s+([A-Za-z_]\w*)\s*:\s*([A-Za-z0-9_][\w\-\.]*)(?:\s+@(\S+))?\s*$")
        .expect("static regex")
});
static MODEL_SIGNATURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^model\s*:\s*([A-Za-z_]\w*)\s*$").expect("static regex"));
static SPEC_SIGNATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^spec(?:\s*:\s*([A-Za-z0-9_][\w\-\.]*))?\s*$").expect("static regex")
});
static CONFIG_SIGNATURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^config(?:\s+(\w+))?\s*$").expect("static regex"));

fn md_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_YAML_STYLE_METADATA_BLOCKS);
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options
}

/// Markdown documents whose fenced code blocks carry typed data.
///
/// Fence info strings select the block kind:
///
/// ````markdown
/// ```model:User
/// name: str
/// ```
///
/// ```entity User: alice @people/alice
/// name: Alice
/// ```
/// ````
///
/// Fences with any other info string are ordinary code and are skipped.
#[derive(Debug, Clone, Default)]
pub struct MdParserCodec;

impl MdParserCodec {
    pub fn new() -> Self {
        MdParserCodec
    }
}

/// Byte offset to 1-based line lookup.
struct LineIndex(Vec<usize>);

impl LineIndex {
    fn new(text: &str) -> Self {
        LineIndex(
            std::iter::once(0)
                .chain(text.match_indices('\n').map(|(i, _)| i + 1))
                .collect(),
        )
    }

    fn line(&self, offset: usize) -> usize {
        match self.0.binary_search(&offset) {
            Ok(line) => line + 1,
            Err(next) => next,
        }
    }

    fn span(&self, range: &Range<usize>) -> (usize, usize) {
        let start = self.line(range.start);
        let end = self.line(range.end.saturating_sub(1).max(range.start));
        (start, end)
    }
}

enum Signature {
    Block(Block),
    Malformed(String),
    Ignored,
}

fn parse_signature(info: &str, spec_count: &mut usize) -> Signature {
    let info = info.trim();
    let keyword = info
        .split(|c: char| c.is_whitespace() || c == ':')
        .next()
        .unwrap_or_default();
    match keyword {
        "entity" => match ENTITY_SIGNATURE.captures(info) {
            Some(caps) => {
                let mut block = Block::new(BlockKind::Instance, &caps[2], "");
                block.type_name = Some(caps[1].to_string());
                block.explicit_id = caps.get(3).map(|m| m.as_str().to_string());
                Signature::Block(block)
            }
            None => Signature::Malformed(format!(
                "expected `entity <Type>: <handle> [@<id>]`, found `{info}`"
            )),
        },
        "model" => match MODEL_SIGNATURE.captures(info) {
            Some(caps) => Signature::Block(Block::new(BlockKind::Schema, &caps[1], "")),
            None => Signature::Malformed(format!("expected `model:<Name>`, found `{info}`")),
        },
        "spec" => match SPEC_SIGNATURE.captures(info) {
            Some(caps) => {
                *spec_count += 1;
                let handle = caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| format!("spec-{spec_count}"));
                Signature::Block(Block::new(BlockKind::Rule, handle, ""))
            }
            None => Signature::Malformed(format!("expected `spec[:<name>]`, found `{info}`")),
        },
        "config" => match CONFIG_SIGNATURE.captures(info) {
            Some(caps) => {
                let mut block = Block::new(BlockKind::ScopeConfig, "config", "");
                block.language = Some(
                    caps.get(1)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_else(|| "toml".to_string()),
                );
                Signature::Block(block)
            }
            None => Signature::Malformed(format!("expected `config [<language>]`, found `{info}`")),
        },
        _ => Signature::Ignored,
    }
}

impl DocParser for MdParserCodec {
    fn parse(&self, path: &Path, text: &str) -> ParseOutput {
        let lines = LineIndex::new(text);
        let mut output = ParseOutput::default();
        let mut spec_count = 0;
        // (signature result, fence range, accumulated body)
        let mut open: Option<(Signature, Range<usize>, String)> = None;
        let mut front_matter: Option<String> = None;
        let mut in_front_matter = false;

        for (event, range) in MdParser::new_ext(text, md_options()).into_offset_iter() {
            match event {
                MdEvent::Start(MdTag::MetadataBlock(_)) => {
                    in_front_matter = true;
                    front_matter = Some(String::new());
                }
                MdEvent::End(MdTagEnd::MetadataBlock(_)) => {
                    in_front_matter = false;
                }
                MdEvent::Start(MdTag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                    open = Some((parse_signature(&info, &mut spec_count), range, String::new()));
                }
                MdEvent::Text(cow_str) => {
                    if let Some((_, _, body)) = open.as_mut() {
                        body.push_str(&cow_str);
                    } else if in_front_matter {
                        if let Some(matter) = front_matter.as_mut() {
                            matter.push_str(&cow_str);
                        }
                    }
                }
                MdEvent::End(MdTagEnd::CodeBlock) => {
                    let Some((signature, fence, body)) = open.take() else {
                        continue;
                    };
                    let (line_start, line_end) = lines.span(&fence);
                    let location = SourceLocation::new(path, line_start, line_end);
                    match signature {
                        Signature::Block(mut block) => {
                            block.raw_body = body;
                            block.location = location;
                            output.blocks.push(block);
                        }
                        Signature::Malformed(message) => {
                            tracing::debug!("[MdParserCodec] {}: {}", location, message);
                            output
                                .diagnostics
                                .push(Diagnostic::new(DiagnosticCode::E0105, message).at(location));
                        }
                        Signature::Ignored => {}
                    }
                }
                _ => {}
            }
        }
        output.front_matter = front_matter;
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    const DOC: &str = r#"---
title: Team
---

# Team

```model:User
name: str
role: str
```

Some prose with `code`.

```entity User: alice @people/alice
name: Alice
role: admin
```

```rust
fn ignored() {}
```

```entity User: bob
manager: [[alice]]
```

```spec
target: User
```

```spec:roles
target: User
```
"#;

    #[test]
    fn test_parse_blocks() {
        let output = MdParserCodec::new().parse(Path::new("team.td"), DOC);
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert_eq!(output.front_matter.as_deref(), Some("title: Team\n"));

        let kinds: Vec<_> = output.blocks.iter().map(|b| (b.kind, b.handle.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (BlockKind::Schema, "User"),
                (BlockKind::Instance, "alice"),
                (BlockKind::Instance, "bob"),
                (BlockKind::Rule, "spec-1"),
                (BlockKind::Rule, "roles"),
            ]
        );

        let alice = &output.blocks[1];
        assert_eq!(alice.type_name.as_deref(), Some("User"));
        assert_eq!(alice.explicit_id.as_deref(), Some("people/alice"));
        assert_eq!(alice.raw_body, "name: Alice\nrole: admin\n");
        assert_eq!(alice.location.line_start, 14);
        assert_eq!(alice.location.line_end, 17);

        let bob = &output.blocks[2];
        assert_eq!(bob.explicit_id, None);
        assert_eq!(bob.raw_body, "manager: [[alice]]\n");
    }

    #[test]
    fn test_parse_is_deterministic() {
        let parser = MdParserCodec::new();
        let a = parser.parse(Path::new("team.td"), DOC);
        let b = parser.parse(Path::new("team.td"), DOC);
        assert_eq!(a.blocks, b.blocks);
    }

    #[test]
    fn test_malformed_signature() {
        let doc = "```entity User alice\nname: x\n```\n\n```config python\nX = 1\n```\n";
        let output = MdParserCodec::new().parse(Path::new("x.td"), doc);
        assert_eq!(output.diagnostics.len(), 1);
        assert_eq!(output.diagnostics[0].code, DiagnosticCode::E0105);
        assert_eq!(output.blocks.len(), 1);
        assert_eq!(output.blocks[0].kind, BlockKind::ScopeConfig);
        assert_eq!(output.blocks[0].language.as_deref(), Some("python"));
    }

    #[test]
    fn test_line_index() {
        let index = LineIndex::new("a\nbb\n\nc");
        assert_eq!(index.line(0), 1);
        assert_eq!(index.line(2), 2);
        assert_eq!(index.line(3), 2);
        assert_eq!(index.line(5), 3);
        assert_eq!(index.line(6), 4);
    }
}
