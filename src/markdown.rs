use pulldown_cmark::{Event, Options, Parser, Tag};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Paragraph,
    Heading(usize),
    ListItem { depth: usize, marker: String },
    Code,
    Rule,
}

/// A markdown block flattened to plain text, ready for a single text widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
}

/// Flatten assistant markdown into display blocks. Inline styling is dropped, structure
/// (headings, list markers, code) is kept. Works on partial input during a reveal.
pub fn flatten(markdown: &str) -> Vec<Block> {
    let parser = Parser::new_ext(markdown, Options::ENABLE_STRIKETHROUGH);

    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;
    // Next number for each open list, `None` for bullet lists.
    let mut lists: Vec<Option<u64>> = Vec::new();

    for event in parser {
        match event {
            Event::Start(Tag::Heading(level, _, _)) => {
                flush(&mut blocks, &mut current);
                current = Some(Block::new(BlockKind::Heading(level as usize)));
            }
            Event::Start(Tag::Paragraph) => {
                if current.is_none() {
                    current = Some(Block::new(BlockKind::Paragraph));
                }
            }
            Event::Start(Tag::List(start)) => {
                flush(&mut blocks, &mut current);
                lists.push(start);
            }
            Event::End(Tag::List(_)) => {
                lists.pop();
            }
            Event::Start(Tag::Item) => {
                flush(&mut blocks, &mut current);
                let marker = match lists.last_mut() {
                    Some(Some(next)) => {
                        let marker = format!("{}.", next);
                        *next += 1;
                        marker
                    }
                    _ => "•".to_string(),
                };
                current = Some(Block::new(BlockKind::ListItem {
                    depth: lists.len().saturating_sub(1),
                    marker,
                }));
            }
            Event::Start(Tag::CodeBlock(_)) => {
                flush(&mut blocks, &mut current);
                current = Some(Block::new(BlockKind::Code));
            }
            Event::End(Tag::Paragraph | Tag::Heading(..) | Tag::Item | Tag::CodeBlock(_)) => {
                flush(&mut blocks, &mut current);
            }
            Event::Text(text) | Event::Code(text) => {
                current
                    .get_or_insert_with(|| Block::new(BlockKind::Paragraph))
                    .text
                    .push_str(&text);
            }
            Event::SoftBreak => {
                if let Some(block) = current.as_mut() {
                    block.text.push(' ');
                }
            }
            Event::HardBreak => {
                if let Some(block) = current.as_mut() {
                    block.text.push('\n');
                }
            }
            Event::Rule => {
                flush(&mut blocks, &mut current);
                blocks.push(Block::new(BlockKind::Rule));
            }
            _ => {}
        }
    }

    flush(&mut blocks, &mut current);
    blocks
}

impl Block {
    fn new(kind: BlockKind) -> Self {
        Block {
            kind,
            text: String::new(),
        }
    }
}

fn flush(blocks: &mut Vec<Block>, current: &mut Option<Block>) {
    let Some(mut block) = current.take() else {
        return;
    };

    if block.kind == BlockKind::Code {
        let trimmed = block.text.trim_end_matches('\n').len();
        block.text.truncate(trimmed);
    } else {
        block.text = block.text.trim().to_string();
    }

    if !block.text.is_empty() {
        blocks.push(block);
    }
}
