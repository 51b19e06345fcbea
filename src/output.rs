//! 分层输出模型。
//!
//! 渲染器按嵌套结构 push/pop 块，每种块只接受特定类型的子项；放不进当前块的子项
//! 沿打开的块栈向上找到第一个接受它的祖先。块内条目按插入顺序去重，重复加入
//! 会移动到末尾。没有内容的块连同头部一起省略。

use crate::error::{LessError, LessResult};
use crate::utils::{collapse_whitespace, indent, BufferPool};
use indexmap::IndexSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Stylesheet,
    Ruleset,
    Media,
    BlockDirective,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Property,
    Ruleset,
    Media,
    BlockDirective,
    Directive,
    Comment,
}

impl BlockKind {
    pub fn accepts(self, entry: EntryKind) -> bool {
        use EntryKind as E;
        match self {
            BlockKind::Stylesheet => matches!(
                entry,
                E::Ruleset | E::Media | E::BlockDirective | E::Directive | E::Comment
            ),
            BlockKind::Ruleset => matches!(entry, E::Property | E::Comment),
            BlockKind::Media => matches!(entry, E::Ruleset | E::BlockDirective | E::Comment),
            BlockKind::BlockDirective => matches!(
                entry,
                E::Property | E::Ruleset | E::Media | E::BlockDirective | E::Comment
            ),
        }
    }

    fn entry_kind(self) -> EntryKind {
        match self {
            BlockKind::Stylesheet | BlockKind::Ruleset => EntryKind::Ruleset,
            BlockKind::Media => EntryKind::Media,
            BlockKind::BlockDirective => EntryKind::BlockDirective,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Entry {
    Property {
        name: String,
        value: String,
        important: bool,
    },
    Directive(String),
    Comment {
        text: String,
        trace: bool,
    },
    Block(usize),
}

#[derive(Debug)]
struct CssBlock {
    kind: BlockKind,
    headers: Vec<String>,
    entries: IndexSet<Entry>,
    populated: bool,
    parent: Option<usize>,
}

#[derive(Debug)]
pub struct CssModel {
    blocks: Vec<CssBlock>,
    open: Vec<usize>,
    compress: bool,
    buffers: BufferPool,
}

impl CssModel {
    pub fn new(compress: bool) -> Self {
        Self {
            blocks: vec![CssBlock {
                kind: BlockKind::Stylesheet,
                headers: Vec::new(),
                entries: IndexSet::new(),
                populated: false,
                parent: None,
            }],
            open: vec![0],
            compress,
            buffers: BufferPool::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    fn accepting(&self, entry: EntryKind) -> LessResult<usize> {
        self.open
            .iter()
            .rev()
            .copied()
            .find(|&id| self.blocks[id].kind.accepts(entry))
            .ok_or_else(|| LessError::internal(format!("没有可以容纳 {entry:?} 的输出块")))
    }

    pub fn accepts_property(&self) -> bool {
        self.accepting(EntryKind::Property).is_ok()
    }

    /// 打开一个新块，挂到最近的可接受祖先下。
    pub fn push(&mut self, kind: BlockKind, headers: Vec<String>) -> LessResult<()> {
        let parent = self.accepting(kind.entry_kind())?;
        let id = self.blocks.len();
        self.blocks.push(CssBlock {
            kind,
            headers,
            entries: IndexSet::new(),
            populated: false,
            parent: Some(parent),
        });
        self.blocks[parent].entries.insert(Entry::Block(id));
        self.open.push(id);
        Ok(())
    }

    pub fn pop(&mut self) -> LessResult<()> {
        if self.open.len() <= 1 {
            return Err(LessError::internal("输出块栈下溢"));
        }
        self.open.pop();
        Ok(())
    }

    pub fn add_property(&mut self, name: &str, value: &str, important: bool) -> LessResult<()> {
        self.add(
            EntryKind::Property,
            Entry::Property {
                name: name.to_string(),
                value: value.to_string(),
                important,
            },
            true,
        )
    }

    pub fn add_directive(&mut self, text: &str) -> LessResult<()> {
        self.add(EntryKind::Directive, Entry::Directive(text.to_string()), true)
    }

    /// 追踪注释不会让块变为有内容。
    pub fn add_comment(&mut self, text: &str, trace: bool) -> LessResult<()> {
        if self.compress && !trace && !text.starts_with("/*!") {
            return Ok(());
        }
        self.add(
            EntryKind::Comment,
            Entry::Comment {
                text: text.to_string(),
                trace,
            },
            !trace,
        )
    }

    fn add(&mut self, kind: EntryKind, entry: Entry, populates: bool) -> LessResult<()> {
        let target = self.accepting(kind)?;
        let block = &mut self.blocks[target];
        block.entries.shift_remove(&entry);
        block.entries.insert(entry);
        if populates {
            self.mark_populated(target);
        }
        Ok(())
    }

    fn mark_populated(&mut self, mut id: usize) {
        loop {
            let block = &mut self.blocks[id];
            if block.populated {
                return;
            }
            block.populated = true;
            match block.parent {
                Some(parent) => id = parent,
                None => return,
            }
        }
    }

    pub fn to_css(&self) -> String {
        let mut output = String::new();
        let root = &self.blocks[0];
        for entry in &root.entries {
            let mut chunk = self.buffers.acquire();
            self.write_entry(entry, 0, &mut chunk);
            if chunk.is_empty() {
                continue;
            }
            output.push_str(&chunk);
            if !self.compress {
                output.push('\n');
            }
        }
        if self.compress {
            output
        } else {
            output.trim().to_string()
        }
    }

    fn write_entry(&self, entry: &Entry, level: usize, out: &mut String) {
        match entry {
            Entry::Property {
                name,
                value,
                important,
            } => {
                if self.compress {
                    out.push_str(name);
                    out.push(':');
                    out.push_str(&collapse_whitespace(value));
                    if *important {
                        out.push_str("!important");
                    }
                    out.push(';');
                } else {
                    out.push_str(&indent(level));
                    out.push_str(name);
                    out.push_str(": ");
                    out.push_str(value);
                    if *important {
                        out.push_str(" !important");
                    }
                    out.push_str(";\n");
                }
            }
            Entry::Directive(text) => {
                if self.compress {
                    out.push_str(&collapse_whitespace(text));
                    out.push(';');
                } else {
                    out.push_str(&indent(level));
                    out.push_str(text);
                    out.push_str(";\n");
                }
            }
            Entry::Comment { text, .. } => {
                if !self.compress {
                    out.push_str(&indent(level));
                }
                out.push_str(text);
                if !self.compress {
                    out.push('\n');
                }
            }
            Entry::Block(id) => self.write_block(*id, level, out),
        }
    }

    fn write_block(&self, id: usize, level: usize, out: &mut String) {
        let block = &self.blocks[id];
        if !block.populated {
            return;
        }
        let mut body = self.buffers.acquire();
        for entry in &block.entries {
            self.write_entry(entry, level + 1, &mut body);
        }
        if self.compress {
            out.push_str(&block.headers.join(","));
            out.push('{');
            if body.ends_with(';') {
                body.pop();
            }
            out.push_str(&body);
            out.push('}');
        } else {
            out.push_str(&indent(level));
            out.push_str(&block.headers.join(", "));
            out.push_str(" {\n");
            out.push_str(&body);
            out.push_str(&indent(level));
            out.push_str("}\n");
        }
    }
}
