use crate::color::{self, Rgba};
use crate::selector::{ExtendTarget, Selector};
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

/// mixin 与规则集的稳定标识，递归计数与闭包都按它记录在旁表中。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefId(u32);

impl DefId {
    pub fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        DefId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// 表示一份完整的 LESS 样式表。
#[derive(Debug, Clone)]
pub struct Stylesheet {
    pub block: Rc<Block>,
}

impl Stylesheet {
    pub fn new(block: Block) -> Self {
        Self {
            block: Rc::new(block),
        }
    }
}

/// 块中的一条规则。载荷都放在 `Rc` 里，复制块时只做浅拷贝。
#[derive(Debug, Clone)]
pub enum Rule {
    Property(Rc<Property>),
    Definition(Rc<Definition>),
    Ruleset(Rc<Ruleset>),
    Mixin(Rc<Mixin>),
    MixinCall(Rc<MixinCall>),
    Media(Rc<Media>),
    BlockDirective(Rc<BlockDirective>),
    Directive(Rc<Directive>),
    Import(Rc<Import>),
    Extend(Rc<ExtendRule>),
    Comment(Rc<Comment>),
}

/// 有序规则序列，附带按需重建的名称索引与 mixin 索引。
#[derive(Debug, Default)]
pub struct Block {
    rules: RefCell<Vec<Rule>>,
    index: RefCell<Option<Rc<BlockIndex>>>,
}

#[derive(Debug, Default)]
struct BlockIndex {
    definitions: HashMap<String, Rc<Definition>>,
    mixins: HashMap<String, Vec<MixinCandidate>>,
}

/// 可被 mixin 调用语法命中的候选。
#[derive(Debug, Clone)]
pub enum MixinCandidate {
    Mixin(Rc<Mixin>),
    /// 规则集以及命中的那条选择器的字面路径。
    Ruleset(Rc<Ruleset>, Vec<String>),
}

impl Block {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: RefCell::new(rules),
            index: RefCell::new(None),
        }
    }

    /// 浅拷贝：规则列表复制一份，规则载荷共享。
    pub fn copy(&self) -> Self {
        Self::new(self.rules.borrow().clone())
    }

    pub fn len(&self) -> usize {
        self.rules.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Rule> {
        self.rules.borrow().get(index).cloned()
    }

    pub fn rules(&self) -> Ref<'_, Vec<Rule>> {
        self.rules.borrow()
    }

    pub fn snapshot(&self) -> Vec<Rule> {
        self.rules.borrow().clone()
    }

    /// 用 `replacement` 替换第 `index` 条规则，并使索引失效。
    pub fn splice(&self, index: usize, replacement: Vec<Rule>) {
        {
            let mut rules = self.rules.borrow_mut();
            rules.splice(index..=index, replacement);
        }
        self.invalidate();
    }

    pub fn insert(&self, index: usize, rule: Rule) {
        self.rules.borrow_mut().insert(index, rule);
        self.invalidate();
    }

    pub fn invalidate(&self) {
        self.index.borrow_mut().take();
    }

    pub fn definition(&self, name: &str) -> Option<Rc<Definition>> {
        self.index().definitions.get(name).cloned()
    }

    pub fn mixin_candidates(&self, key: &str) -> Vec<MixinCandidate> {
        self.index().mixins.get(key).cloned().unwrap_or_default()
    }

    fn index(&self) -> Rc<BlockIndex> {
        if let Some(index) = self.index.borrow().as_ref() {
            return index.clone();
        }
        let built = Rc::new(self.build_index());
        *self.index.borrow_mut() = Some(built.clone());
        built
    }

    fn build_index(&self) -> BlockIndex {
        let mut index = BlockIndex::default();
        for rule in self.rules.borrow().iter() {
            match rule {
                Rule::Definition(def) => {
                    index.definitions.insert(def.name.clone(), def.clone());
                }
                Rule::Mixin(mixin) => {
                    index
                        .mixins
                        .entry(mixin.name.clone())
                        .or_default()
                        .push(MixinCandidate::Mixin(mixin.clone()));
                }
                Rule::Ruleset(ruleset) => {
                    for selector in &ruleset.selectors {
                        if let Some(path) = selector.mixin_path() {
                            index
                                .mixins
                                .entry(path[0].clone())
                                .or_default()
                                .push(MixinCandidate::Ruleset(ruleset.clone(), path));
                        }
                    }
                }
                _ => {}
            }
        }
        index
    }
}

#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub value: Node,
    pub important: bool,
    pub line: usize,
}

/// 变量定义。`evaluating` 在解引用期间置位，用来发现自引用。
#[derive(Debug)]
pub struct Definition {
    pub name: String,
    pub value: Node,
    pub line: usize,
    evaluating: Cell<bool>,
}

impl Definition {
    pub fn new(name: impl Into<String>, value: Node, line: usize) -> Self {
        Self {
            name: name.into(),
            value,
            line,
            evaluating: Cell::new(false),
        }
    }

    /// 标记开始求值；已在求值中则返回 `None`。
    pub fn begin_evaluation(&self) -> Option<EvaluatingGuard<'_>> {
        if self.evaluating.replace(true) {
            return None;
        }
        Some(EvaluatingGuard { flag: &self.evaluating })
    }
}

pub struct EvaluatingGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

#[derive(Debug, Clone)]
pub struct Ruleset {
    pub id: DefId,
    /// 每次经过定义处重新分配，闭包按它记录。
    pub site: DefId,
    pub selectors: Vec<Selector>,
    pub guard: Option<Condition>,
    pub block: Rc<Block>,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct Mixin {
    pub id: DefId,
    pub site: DefId,
    pub name: String,
    pub params: Vec<Parameter>,
    pub guard: Option<Condition>,
    pub block: Rc<Block>,
    pub line: usize,
}

impl Ruleset {
    /// 同一定义的新一次经过：保留 `id`，换新 `site`。
    pub fn revisit(&self) -> Self {
        Self {
            site: DefId::next(),
            ..self.clone()
        }
    }
}

impl Mixin {
    pub fn revisit(&self) -> Self {
        Self {
            site: DefId::next(),
            ..self.clone()
        }
    }
}

/// mixin 形参：具名（可带默认值）、值模式或可变参数。
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: Option<String>,
    pub value: Option<Node>,
    pub variadic: bool,
}

impl Parameter {
    pub fn is_pattern(&self) -> bool {
        self.name.is_none() && !self.variadic
    }

    pub fn is_required(&self) -> bool {
        !self.variadic && (self.name.is_none() || self.value.is_none())
    }
}

#[derive(Debug, Clone)]
pub struct MixinCall {
    pub selector: Selector,
    pub args: Vec<Argument>,
    pub important: bool,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Node,
}

#[derive(Debug)]
pub struct Media {
    pub features: Features,
    pub block: Rc<Block>,
    pub line: usize,
}

/// `@font-face`、`@keyframes`、`@supports` 等带块的 at-rule。
#[derive(Debug)]
pub struct BlockDirective {
    pub name: String,
    pub prelude: Option<Node>,
    pub block: Rc<Block>,
    pub line: usize,
}

impl BlockDirective {
    /// 条件组规则会像 `@media` 一样包裹外层选择器。
    pub fn is_conditional(&self) -> bool {
        matches!(
            self.name.to_ascii_lowercase().as_str(),
            "supports" | "document" | "-moz-document" | "container" | "layer"
        )
    }
}

#[derive(Debug)]
pub struct Directive {
    pub name: String,
    pub value: Option<Node>,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    pub css: bool,
    pub less: bool,
    pub multiple: bool,
    pub optional: bool,
}

#[derive(Debug)]
pub struct Import {
    pub path: Node,
    pub features: Option<Features>,
    pub options: ImportOptions,
    pub line: usize,
}

#[derive(Debug)]
pub struct ExtendRule {
    pub targets: Vec<ExtendTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub text: String,
    /// 追踪注释不计入块的“有内容”判断。
    pub trace: bool,
}

/// 媒体查询列表，逗号分隔的每一项是以 `and` 连接的若干项。
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub queries: Vec<FeatureQuery>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureQuery {
    pub terms: Vec<MediaTerm>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaTerm {
    Keyword(String),
    Feature { name: String, value: Option<Node> },
    Value(Node),
}

/// 表达式节点。
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Dimension(Dimension),
    Color(Color),
    Keyword(String),
    Boolean(bool),
    Quoted(Quoted),
    Variable(Variable),
    Operation(Box<Operation>),
    Negate(Box<Node>),
    /// CSS 简写里的 `a/b`，不做除法。
    Slash(Box<Node>, Box<Node>),
    Paren(Box<Node>),
    Expression(Vec<Node>),
    ExpressionList(Vec<Node>),
    FunctionCall(FunctionCall),
    Url(Box<Node>),
    Anonymous(String),
    Script(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub value: f64,
    pub unit: Option<String>,
}

impl Dimension {
    pub fn new(value: f64, unit: Option<&str>) -> Self {
        Self {
            value,
            unit: unit.map(str::to_string),
        }
    }

    pub fn unitless(value: f64) -> Self {
        Self { value, unit: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Color {
    pub rgba: Rgba,
    /// 未经运算时保留源码写法（`#111`、`red`）。
    pub original: Option<String>,
}

impl Color {
    pub fn new(rgba: Rgba) -> Self {
        Self {
            rgba,
            original: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quoted {
    pub delimiter: char,
    pub escaped: bool,
    pub parts: Vec<Node>,
}

impl Quoted {
    pub fn text(delimiter: char, escaped: bool, value: impl Into<String>) -> Self {
        Self {
            delimiter,
            escaped,
            parts: vec![Node::Anonymous(value.into())],
        }
    }

    /// 去掉引号后的内容。
    pub fn content(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Node::Anonymous(text) => out.push_str(text),
                other => other.repr(&mut out, false),
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub indirect: bool,
    pub curly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operator {
    pub fn symbol(self) -> char {
        match self {
            Operator::Add => '+',
            Operator::Subtract => '-',
            Operator::Multiply => '*',
            Operator::Divide => '/',
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, Operator::Add | Operator::Multiply)
    }

    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            Operator::Add => left + right,
            Operator::Subtract => left - right,
            Operator::Multiply => left * right,
            Operator::Divide => left / right,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op: Operator,
    pub left: Node,
    pub right: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

/// 守卫条件。
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        op: Comparison,
        left: Node,
        right: Node,
    },
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Node {
    pub fn keyword(text: impl Into<String>) -> Self {
        Node::Keyword(text.into())
    }

    pub fn is_constant(&self) -> bool {
        match self {
            Node::Dimension(_)
            | Node::Color(_)
            | Node::Keyword(_)
            | Node::Boolean(_)
            | Node::Anonymous(_) => true,
            Node::Quoted(quoted) => quoted
                .parts
                .iter()
                .all(|part| matches!(part, Node::Anonymous(_))),
            _ => false,
        }
    }

    pub fn to_css(&self, compress: bool) -> String {
        let mut out = String::new();
        self.repr(&mut out, compress);
        out
    }

    pub fn repr(&self, out: &mut String, compress: bool) {
        match self {
            Node::Dimension(dim) => {
                out.push_str(&format_number(dim.value));
                if let Some(unit) = &dim.unit {
                    out.push_str(unit);
                }
            }
            Node::Color(c) => match &c.original {
                Some(original) => out.push_str(original),
                None => out.push_str(&color::format_color(c.rgba, compress)),
            },
            Node::Keyword(text) | Node::Anonymous(text) => out.push_str(text),
            Node::Boolean(value) => out.push_str(if *value { "true" } else { "false" }),
            Node::Quoted(quoted) => {
                if !quoted.escaped {
                    out.push(quoted.delimiter);
                }
                out.push_str(&quoted.content());
                if !quoted.escaped {
                    out.push(quoted.delimiter);
                }
            }
            Node::Variable(var) => {
                out.push('@');
                if var.indirect {
                    out.push('@');
                }
                out.push_str(&var.name);
            }
            Node::Operation(operation) => {
                operation.left.repr(out, compress);
                if compress {
                    out.push(operation.op.symbol());
                } else {
                    out.push(' ');
                    out.push(operation.op.symbol());
                    out.push(' ');
                }
                operation.right.repr(out, compress);
            }
            Node::Negate(inner) => {
                out.push('-');
                inner.repr(out, compress);
            }
            Node::Slash(left, right) => {
                left.repr(out, compress);
                out.push('/');
                right.repr(out, compress);
            }
            Node::Paren(inner) => {
                out.push('(');
                inner.repr(out, compress);
                out.push(')');
            }
            Node::Expression(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push(' ');
                    }
                    item.repr(out, compress);
                }
            }
            Node::ExpressionList(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(if compress { "," } else { ", " });
                    }
                    item.repr(out, compress);
                }
            }
            Node::FunctionCall(call) => {
                out.push_str(&call.name);
                out.push('(');
                for (idx, arg) in call.args.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(if compress { "," } else { ", " });
                    }
                    arg.repr(out, compress);
                }
                out.push(')');
            }
            Node::Url(inner) => {
                out.push_str("url(");
                inner.repr(out, compress);
                out.push(')');
            }
            Node::Script(code) => {
                out.push('`');
                out.push_str(code);
                out.push('`');
            }
        }
    }
}

impl Features {
    pub fn to_css(&self, compress: bool) -> String {
        self.queries
            .iter()
            .map(|query| query.to_css(compress))
            .collect::<Vec<_>>()
            .join(if compress { "," } else { ", " })
    }
}

impl FeatureQuery {
    pub fn to_css(&self, compress: bool) -> String {
        let mut out = String::new();
        for (idx, term) in self.terms.iter().enumerate() {
            if idx > 0 {
                out.push_str(" and ");
            }
            match term {
                MediaTerm::Keyword(text) => out.push_str(text),
                MediaTerm::Feature { name, value } => {
                    out.push('(');
                    out.push_str(name);
                    if let Some(value) = value {
                        out.push_str(if compress { ":" } else { ": " });
                        value.repr(&mut out, compress);
                    }
                    out.push(')');
                }
                MediaTerm::Value(node) => node.repr(&mut out, compress),
            }
        }
        out
    }
}

/// 数值输出：最多保留 8 位小数并去掉多余的 0。
pub fn format_number(value: f64) -> String {
    let mut value = value;
    if value.abs() < 1e-9 {
        value = 0.0;
    }
    let mut formatted = format!("{value:.8}");
    while formatted.contains('.') && formatted.ends_with('0') {
        formatted.pop();
    }
    if formatted.ends_with('.') {
        formatted.pop();
    }
    if formatted == "-0" {
        formatted = "0".to_string();
    }
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str, value: f64) -> Rule {
        Rule::Definition(Rc::new(Definition::new(
            name,
            Node::Dimension(Dimension::unitless(value)),
            0,
        )))
    }

    #[test]
    fn last_definition_wins() {
        let block = Block::new(vec![definition("a", 1.0), definition("a", 2.0)]);
        let def = block.definition("a").unwrap();
        assert_eq!(def.value, Node::Dimension(Dimension::unitless(2.0)));
    }

    #[test]
    fn splice_invalidates_index() {
        let block = Block::new(vec![definition("a", 1.0)]);
        assert!(block.definition("b").is_none());
        block.splice(0, vec![definition("a", 1.0), definition("b", 3.0)]);
        assert!(block.definition("b").is_some());
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn evaluating_flag_resets_on_drop() {
        let def = Definition::new("x", Node::keyword("y"), 0);
        {
            let _guard = def.begin_evaluation().unwrap();
            assert!(def.begin_evaluation().is_none());
        }
        assert!(def.begin_evaluation().is_some());
    }

    #[test]
    fn numbers_drop_trailing_zeros() {
        assert_eq!(format_number(15.0), "15");
        assert_eq!(format_number(0.75), "0.75");
        assert_eq!(format_number(-0.0000000001), "0");
        assert_eq!(format_number(1.0 / 3.0), "0.33333333");
    }
}
