//! 选择器与媒体特性的组合代数。
//!
//! 嵌套规则的选择器与外层选择器做笛卡尔积；含 `&` 的选择器在每个 `&`
//! 位置代入完整的外层集合。嵌套 `@media` 的特性以 `and` 拼接。

use crate::ast::{FeatureQuery, Features};
use crate::error::{LessError, LessResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Combinator {
    Descendant,
    Child,
    Sibling,
    Adjacent,
}

impl Combinator {
    fn push_to(self, out: &mut String, compress: bool) {
        let symbol = match self {
            Combinator::Descendant => {
                out.push(' ');
                return;
            }
            Combinator::Child => '>',
            Combinator::Sibling => '~',
            Combinator::Adjacent => '+',
        };
        if compress {
            out.push(symbol);
        } else {
            out.push(' ');
            out.push(symbol);
            out.push(' ');
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Text(String),
    /// `&`，代表外层选择器。
    Wildcard,
}

/// 选择器的一个简单片段；`combinator` 为 `None` 表示与前一片段紧贴。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Element {
    pub combinator: Option<Combinator>,
    pub kind: ElementKind,
}

impl Element {
    pub fn text(combinator: Option<Combinator>, text: impl Into<String>) -> Self {
        Self {
            combinator,
            kind: ElementKind::Text(text.into()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.kind, ElementKind::Wildcard)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selector {
    pub elements: Vec<Element>,
    pub extends: Vec<ExtendTarget>,
}

/// `:extend(target [all])` 中的一个目标。
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendTarget {
    pub selector: Selector,
    pub all: bool,
}

impl Selector {
    pub fn new(elements: Vec<Element>) -> Self {
        Self {
            elements,
            extends: Vec::new(),
        }
    }

    pub fn has_wildcard(&self) -> bool {
        self.elements.iter().any(Element::is_wildcard)
    }

    /// 仅由类、id 片段以及后代/子代组合符构成时，返回用于 mixin 查找的字面路径。
    pub fn mixin_path(&self) -> Option<Vec<String>> {
        if self.elements.is_empty() {
            return None;
        }
        let mut path = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            match element.combinator {
                None | Some(Combinator::Descendant) | Some(Combinator::Child) => {}
                _ => return None,
            }
            match &element.kind {
                ElementKind::Text(text) if is_path_segment(text) => path.push(text.clone()),
                _ => return None,
            }
        }
        Some(path)
    }

    pub fn to_css(&self, compress: bool) -> String {
        let mut out = String::new();
        for (idx, element) in self.elements.iter().enumerate() {
            if let Some(combinator) = element.combinator {
                if idx == 0 {
                    if combinator != Combinator::Descendant {
                        Combinator::push_to(combinator, &mut out, compress);
                        out = out.trim_start().to_string();
                    }
                } else {
                    combinator.push_to(&mut out, compress);
                }
            }
            match &element.kind {
                ElementKind::Text(text) => out.push_str(text),
                ElementKind::Wildcard => out.push('&'),
            }
        }
        out
    }

    /// 将选择器文本中的 `@{name}` 插值交给回调处理，返回新的选择器。
    pub fn map_text<F>(&self, mut f: F) -> LessResult<Selector>
    where
        F: FnMut(&str) -> LessResult<String>,
    {
        let mut elements = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            let kind = match &element.kind {
                ElementKind::Text(text) if text.contains("@{") => ElementKind::Text(f(text)?),
                other => other.clone(),
            };
            elements.push(Element {
                combinator: element.combinator,
                kind,
            });
        }
        Ok(Selector {
            elements,
            extends: self.extends.clone(),
        })
    }
}

fn is_path_segment(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some('.') | Some('#'))
        && chars.all(|ch| ch.is_alphanumeric() || ch == '-' || ch == '_')
        && text.len() > 1
}

/// 外层选择器集合与当前选择器集合的组合。
pub fn combine(ancestors: &[Selector], current: &[Selector]) -> Vec<Selector> {
    let mut result = Vec::new();
    for selector in current {
        result.extend(combine_one(ancestors, selector));
    }
    result
}

/// 单条选择器与外层集合的组合，结果保持外层集合的顺序。
pub fn combine_one(ancestors: &[Selector], selector: &Selector) -> Vec<Selector> {
    if !selector.has_wildcard() {
        if ancestors.is_empty() {
            return vec![Selector::new(selector.elements.clone())];
        }
        return ancestors
            .iter()
            .map(|ancestor| {
                let mut elements = ancestor.elements.clone();
                let mut tail = selector.elements.clone();
                if let Some(first) = tail.first_mut() {
                    if first.combinator.is_none() {
                        first.combinator = Some(Combinator::Descendant);
                    }
                }
                elements.append(&mut tail);
                Selector::new(elements)
            })
            .collect();
    }

    let mut segments: Vec<Vec<Element>> = vec![Vec::new()];
    for element in &selector.elements {
        if element.is_wildcard() {
            if ancestors.is_empty() {
                continue;
            }
            let mut next = Vec::with_capacity(segments.len() * ancestors.len());
            for segment in &segments {
                for ancestor in ancestors {
                    let mut elements = segment.clone();
                    let mut substituted = ancestor.elements.clone();
                    if let Some(first) = substituted.first_mut() {
                        first.combinator = element.combinator;
                    }
                    elements.append(&mut substituted);
                    next.push(elements);
                }
            }
            segments = next;
        } else {
            for segment in segments.iter_mut() {
                segment.push(element.clone());
            }
        }
    }
    segments
        .into_iter()
        .filter(|elements| !elements.is_empty())
        .map(|mut elements| {
            if let Some(first) = elements.first_mut() {
                if first.combinator == Some(Combinator::Descendant) {
                    first.combinator = None;
                }
            }
            Selector::new(elements)
        })
        .collect()
}

/// 嵌套 `@media` 的特性组合：外层每一项与内层每一项用 `and` 连接。
pub fn combine_features(ancestors: Option<&Features>, current: &Features) -> Features {
    let ancestors = match ancestors {
        Some(features) if !features.queries.is_empty() => features,
        _ => return current.clone(),
    };
    let mut queries = Vec::new();
    for outer in &ancestors.queries {
        for inner in &current.queries {
            let mut terms = outer.terms.clone();
            terms.extend(inner.terms.iter().cloned());
            queries.push(FeatureQuery { terms });
        }
    }
    Features { queries }
}

/// 把一段选择器文本拆成选择器列表（逗号分隔），并识别 `:extend(...)`。
pub fn parse_selectors(source: &str) -> LessResult<Vec<Selector>> {
    let mut selectors = Vec::new();
    for part in split_top_level(source, ',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        selectors.push(parse_selector(trimmed)?);
    }
    if selectors.is_empty() {
        return Err(LessError::parse("缺少合法的选择器", 0));
    }
    Ok(selectors)
}

pub fn parse_selector(source: &str) -> LessResult<Selector> {
    let chars: Vec<char> = source.trim().chars().collect();
    let mut elements = Vec::new();
    let mut extends = Vec::new();
    let mut pending: Option<Combinator> = None;
    let mut saw_space = false;
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];
        if ch.is_whitespace() {
            saw_space = true;
            pos += 1;
            continue;
        }
        let explicit = match ch {
            '>' => Some(Combinator::Child),
            '~' => Some(Combinator::Sibling),
            '+' => Some(Combinator::Adjacent),
            _ => None,
        };
        if let Some(combinator) = explicit {
            pending = Some(combinator);
            saw_space = false;
            pos += 1;
            continue;
        }

        let combinator = match pending.take() {
            Some(combinator) => Some(combinator),
            None if saw_space && !elements.is_empty() => Some(Combinator::Descendant),
            None => None,
        };
        saw_space = false;

        if starts_with_at(&chars, pos, ":extend(") {
            let (inner, next) = read_balanced(&chars, pos + ":extend".len())?;
            extends.extend(parse_extend_targets(&inner)?);
            pos = next;
            continue;
        }

        if ch == '&' {
            elements.push(Element {
                combinator,
                kind: ElementKind::Wildcard,
            });
            pos += 1;
            continue;
        }

        let (text, next) = read_element(&chars, pos)?;
        elements.push(Element::text(combinator, text));
        pos = next;
    }

    if elements.is_empty() && extends.is_empty() {
        return Err(LessError::parse(
            format!("无法解析选择器 `{source}`"),
            0,
        ));
    }
    Ok(Selector { elements, extends })
}

/// 解析 `:extend()` 括号内的目标列表。
pub fn parse_extend_targets(source: &str) -> LessResult<Vec<ExtendTarget>> {
    let mut targets = Vec::new();
    for part in split_top_level(source, ',') {
        let mut text = part.trim();
        let mut all = false;
        if let Some(stripped) = text.strip_suffix(" all") {
            text = stripped.trim_end();
            all = true;
        }
        if text.is_empty() {
            continue;
        }
        targets.push(ExtendTarget {
            selector: parse_selector(text)?,
            all,
        });
    }
    Ok(targets)
}

fn read_element(chars: &[char], start: usize) -> LessResult<(String, usize)> {
    let mut text = String::new();
    let mut pos = start;
    // 首字符可以是任意起始符号，之后遇到新片段的起始符号即结束
    loop {
        if pos >= chars.len() {
            break;
        }
        let ch = chars[pos];
        if pos > start
            && (ch.is_whitespace()
                || matches!(ch, '.' | '#' | '>' | '~' | '+' | '&' | ':' | '[' | '*'))
        {
            if ch == ':' && starts_with_at(chars, pos, ":extend(") {
                break;
            }
            if ch == ':' && text.ends_with(':') {
                text.push(ch);
                pos += 1;
                continue;
            }
            break;
        }
        match ch {
            '[' => {
                let (inner, next) = read_until_close(chars, pos, '[', ']')?;
                text.push_str(&inner);
                pos = next;
                break;
            }
            '(' => {
                let (inner, next) = read_until_close(chars, pos, '(', ')')?;
                text.push_str(&inner);
                pos = next;
            }
            '@' if chars.get(pos + 1) == Some(&'{') => {
                let (inner, next) = read_until_close(chars, pos + 1, '{', '}')?;
                text.push('@');
                text.push_str(&inner);
                pos = next;
            }
            _ => {
                text.push(ch);
                pos += 1;
            }
        }
    }
    Ok((text, pos))
}

fn read_until_close(
    chars: &[char],
    start: usize,
    open: char,
    close: char,
) -> LessResult<(String, usize)> {
    let mut depth = 0usize;
    let mut text = String::new();
    let mut pos = start;
    let mut quote: Option<char> = None;
    while pos < chars.len() {
        let ch = chars[pos];
        text.push(ch);
        pos += 1;
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        if ch == '"' || ch == '\'' {
            quote = Some(ch);
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Ok((text, pos));
            }
        }
    }
    Err(LessError::parse(format!("选择器缺少匹配的 '{close}'"), start))
}

/// 读取 `(` 开头的括号内容，返回去掉外层括号的文本与结束位置。
fn read_balanced(chars: &[char], open: usize) -> LessResult<(String, usize)> {
    let (text, next) = read_until_close(chars, open, '(', ')')?;
    let inner: String = text.chars().skip(1).take(text.chars().count() - 2).collect();
    Ok((inner, next))
}

fn starts_with_at(chars: &[char], pos: usize, pattern: &str) -> bool {
    let mut idx = pos;
    for expected in pattern.chars() {
        match chars.get(idx) {
            Some(&ch) if ch == expected => idx += 1,
            _ => return false,
        }
    }
    true
}

/// 按顶层分隔符切分，忽略括号、方括号与引号内部。
pub fn split_top_level(source: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for ch in source.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            _ if ch == separator && depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{MediaTerm, Node};
    use pretty_assertions::assert_eq;

    fn sel(text: &str) -> Selector {
        parse_selector(text).unwrap()
    }

    fn render(selectors: &[Selector]) -> Vec<String> {
        selectors.iter().map(|s| s.to_css(false)).collect()
    }

    #[test]
    fn parses_compound_and_combinators() {
        let selector = sel(".a.b > li:hover + p ~ [data-x=\"1\"]");
        assert_eq!(selector.to_css(false), ".a.b > li:hover + p ~ [data-x=\"1\"]");
        assert_eq!(selector.to_css(true), ".a.b>li:hover+p~[data-x=\"1\"]");
        assert_eq!(selector.elements.len(), 6);
    }

    #[test]
    fn pseudo_with_arguments_is_one_element() {
        let selector = sel("li:not(.a .b)::before");
        assert_eq!(selector.to_css(false), "li:not(.a .b)::before");
    }

    #[test]
    fn nested_without_ampersand_prepends_ancestors() {
        let ancestors = parse_selectors(".a, .b").unwrap();
        let combined = combine(&ancestors, &[sel(".c"), sel("> .d")]);
        assert_eq!(render(&combined), vec![".a .c", ".b .c", ".a > .d", ".b > .d"]);
    }

    #[test]
    fn ampersand_substitutes_cartesian_product() {
        let ancestors = parse_selectors(".a, .b").unwrap();
        let combined = combine(&ancestors, &[sel("& + &")]);
        assert_eq!(
            render(&combined),
            vec![".a + .a", ".a + .b", ".b + .a", ".b + .b"]
        );
    }

    #[test]
    fn ampersand_suffix_and_prefix() {
        let ancestors = vec![sel(".btn")];
        assert_eq!(render(&combine(&ancestors, &[sel("&-primary")])), vec![".btn-primary"]);
        assert_eq!(render(&combine(&ancestors, &[sel("&:hover")])), vec![".btn:hover"]);
        assert_eq!(render(&combine(&ancestors, &[sel(".theme &")])), vec![".theme .btn"]);
    }

    #[test]
    fn extend_is_lifted_into_metadata() {
        let selector = sel(".x:extend(.b .c all, .d)");
        assert_eq!(selector.to_css(false), ".x");
        assert_eq!(selector.extends.len(), 2);
        assert!(selector.extends[0].all);
        assert_eq!(selector.extends[0].selector.to_css(false), ".b .c");
        assert!(!selector.extends[1].all);
    }

    #[test]
    fn mixin_path_only_for_literal_selectors() {
        assert_eq!(
            sel("#ns > .m").mixin_path(),
            Some(vec!["#ns".to_string(), ".m".to_string()])
        );
        assert_eq!(sel(".a:hover").mixin_path(), None);
        assert_eq!(sel("div").mixin_path(), None);
    }

    #[test]
    fn features_join_with_and() {
        let outer = Features {
            queries: vec![FeatureQuery {
                terms: vec![MediaTerm::Keyword("screen".into())],
            }],
        };
        let inner = Features {
            queries: vec![
                FeatureQuery {
                    terms: vec![MediaTerm::Feature {
                        name: "min-width".into(),
                        value: Some(Node::keyword("768px")),
                    }],
                },
                FeatureQuery {
                    terms: vec![MediaTerm::Keyword("print".into())],
                },
            ],
        };
        let combined = combine_features(Some(&outer), &inner);
        assert_eq!(
            combined.to_css(false),
            "screen and (min-width: 768px), screen and print"
        );
    }
}
