use crate::ast::*;
use crate::color;
use crate::error::{LessError, LessResult};
use crate::selector::{self, split_top_level};
use std::rc::Rc;

/// 这些函数的参数按原样输出，不做运算。
const RAW_FUNCTIONS: &[&str] = &["calc", "-webkit-calc", "-moz-calc", "var", "env"];

/// LESS 解析器，负责把源码转换成 AST。
#[derive(Debug, Default)]
pub struct LessParser;

impl LessParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, input: &str) -> LessResult<Stylesheet> {
        let mut cursor = Cursor::new(input);
        let rules = self.parse_rules(&mut cursor, false)?;
        Ok(Stylesheet::new(Block::new(rules)))
    }

    /// 解析规则序列；`nested` 为真时以 `}` 结束并消费它。
    fn parse_rules(&self, cursor: &mut Cursor<'_>, nested: bool) -> LessResult<Vec<Rule>> {
        let mut rules = Vec::new();
        loop {
            cursor.skip_whitespace_and_line_comments();
            if cursor.starts_with_str("/*") {
                let text = cursor.read_block_comment()?;
                rules.push(Rule::Comment(Rc::new(Comment { text, trace: false })));
                continue;
            }
            match cursor.peek_char() {
                None if nested => {
                    return Err(LessError::parse("缺少匹配的 '}'", cursor.position()));
                }
                None => break,
                Some('}') if nested => {
                    cursor.advance_char();
                    break;
                }
                Some('}') => {
                    return Err(LessError::parse("多余的 '}'", cursor.position()));
                }
                Some(';') => {
                    cursor.advance_char();
                    continue;
                }
                _ => {}
            }
            rules.push(self.parse_rule(cursor)?);
        }
        Ok(rules)
    }

    fn parse_rule(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        if cursor.starts_with('@') && !cursor.starts_with_str("@{") {
            if cursor.lookahead_is_variable_decl()? {
                return self.parse_definition(cursor);
            }
            let keyword = cursor.lookahead_at_keyword();
            if keyword.eq_ignore_ascii_case("import") {
                return self.parse_import(cursor);
            }
            if keyword.eq_ignore_ascii_case("media") {
                return self.parse_media(cursor);
            }
            if cursor.lookahead_is_block_at_rule()? {
                return self.parse_block_directive(cursor);
            }
            return self.parse_directive(cursor);
        }

        if cursor.starts_with_str("&:extend(") {
            return self.parse_extend(cursor);
        }

        if cursor.lookahead_is_mixin_definition()? {
            return self.parse_mixin_definition(cursor);
        }

        if cursor.lookahead_is_mixin_call()? {
            return self.parse_mixin_call(cursor);
        }

        if cursor.lookahead_is_extend_statement() {
            let line = cursor.line();
            let text = cursor.read_value_text(&[';', '}'])?;
            if cursor.peek_char() == Some(';') {
                cursor.advance_char();
            }
            let selectors = selector::parse_selectors(&text)?;
            return Ok(Rule::Ruleset(Rc::new(Ruleset {
                id: DefId::next(),
                site: DefId::next(),
                selectors,
                guard: None,
                block: Rc::new(Block::default()),
                line,
            })));
        }

        match cursor.detect_body_kind() {
            Some(BodyKind::Declaration) => self.parse_declaration(cursor),
            Some(BodyKind::NestedRule) => self.parse_ruleset(cursor),
            None => Err(LessError::parse(
                "无法判断声明或子选择器",
                cursor.position(),
            )),
        }
    }

    fn parse_definition(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        let line = cursor.line();
        cursor.expect_char('@')?;
        let name = cursor.read_identifier();
        cursor.skip_whitespace_and_comments();
        cursor.expect_char(':')?;
        cursor.skip_whitespace_and_comments();
        let raw = cursor.read_value_text(&[';', '}'])?;
        if cursor.peek_char() == Some(';') {
            cursor.advance_char();
        }
        let value = parse_value(&raw)?;
        Ok(Rule::Definition(Rc::new(Definition::new(name, value, line))))
    }

    fn parse_declaration(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        let line = cursor.line();
        let name = cursor.read_property_name();
        cursor.skip_whitespace_and_comments();
        cursor.expect_char(':')?;
        cursor.skip_whitespace_and_comments();
        let raw = cursor.read_value_text(&[';', '}'])?;
        if cursor.peek_char() == Some(';') {
            cursor.advance_char();
        }
        let (raw, important) = strip_important(&raw);
        let value = if name.starts_with("--") {
            Node::Anonymous(raw.trim().to_string())
        } else {
            parse_value(raw)?
        };
        Ok(Rule::Property(Rc::new(Property {
            name,
            value,
            important,
            line,
        })))
    }

    fn parse_ruleset(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        cursor.skip_whitespace_and_comments();
        let line = cursor.line();
        let header = cursor.read_until('{')?;
        cursor.expect_char('{')?;
        let (selector_text, guard_text) = split_guard(&header);
        let selectors = selector::parse_selectors(selector_text)
            .map_err(|_| LessError::parse("缺少合法的选择器", cursor.position()))?;
        let guard = guard_text.map(parse_guard).transpose()?;
        let rules = self.parse_rules(cursor, true)?;
        Ok(Rule::Ruleset(Rc::new(Ruleset {
            id: DefId::next(),
            site: DefId::next(),
            selectors,
            guard,
            block: Rc::new(Block::new(rules)),
            line,
        })))
    }

    fn parse_media(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        let line = cursor.line();
        cursor.expect_char('@')?;
        cursor.read_identifier();
        cursor.skip_whitespace_and_comments();
        let prelude = cursor.read_until('{')?;
        cursor.expect_char('{')?;
        let features = parse_features(prelude.trim())?;
        let rules = self.parse_rules(cursor, true)?;
        Ok(Rule::Media(Rc::new(Media {
            features,
            block: Rc::new(Block::new(rules)),
            line,
        })))
    }

    fn parse_block_directive(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        let line = cursor.line();
        cursor.expect_char('@')?;
        let name = cursor.read_identifier();
        if name.is_empty() {
            return Err(LessError::parse("at-rule 名称不能为空", cursor.position()));
        }
        cursor.skip_whitespace_and_comments();
        let prelude = cursor.read_until('{')?;
        cursor.expect_char('{')?;
        let rules = self.parse_rules(cursor, true)?;
        let prelude = prelude.trim();
        Ok(Rule::BlockDirective(Rc::new(BlockDirective {
            name,
            prelude: (!prelude.is_empty()).then(|| Node::Anonymous(prelude.to_string())),
            block: Rc::new(Block::new(rules)),
            line,
        })))
    }

    fn parse_directive(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        let line = cursor.line();
        cursor.expect_char('@')?;
        let name = cursor.read_identifier();
        if name.is_empty() {
            return Err(LessError::parse("at-rule 名称不能为空", cursor.position()));
        }
        cursor.skip_whitespace_and_comments();
        let raw = cursor.read_value_text(&[';', '}'])?;
        if cursor.peek_char() == Some(';') {
            cursor.advance_char();
        }
        let raw = raw.trim();
        Ok(Rule::Directive(Rc::new(Directive {
            name,
            value: if raw.is_empty() {
                None
            } else {
                Some(parse_value(raw)?)
            },
            line,
        })))
    }

    fn parse_import(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        let line = cursor.line();
        cursor.expect_char('@')?;
        cursor.read_identifier();
        cursor.skip_whitespace_and_comments();

        let mut options = ImportOptions::default();
        if cursor.peek_char() == Some('(') {
            let raw = cursor.read_parenthesized()?;
            for option in raw.split(|c: char| c == ',' || c.is_whitespace()) {
                match option.trim().to_ascii_lowercase().as_str() {
                    "css" => options.css = true,
                    "less" => options.less = true,
                    "multiple" => options.multiple = true,
                    "optional" => options.optional = true,
                    "" | "once" | "reference" | "inline" => {}
                    other => {
                        return Err(LessError::parse(
                            format!("不支持的 @import 选项 `{other}`"),
                            cursor.position(),
                        ))
                    }
                }
            }
            cursor.skip_whitespace_and_comments();
        }

        let spec = cursor.read_value_text(&[';'])?;
        cursor.expect_char(';')?;
        let spec = spec.trim();
        let split = path_end(spec)
            .ok_or_else(|| LessError::parse("@import 缺少路径", cursor.position()))?;
        let path = parse_value(&spec[..split])?;
        let rest = spec[split..].trim();
        let features = if rest.is_empty() {
            None
        } else {
            Some(parse_features(rest)?)
        };
        Ok(Rule::Import(Rc::new(Import {
            path,
            features,
            options,
            line,
        })))
    }

    fn parse_extend(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        cursor.match_str("&:extend");
        let inner = cursor.read_parenthesized()?;
        cursor.skip_whitespace_and_comments();
        if cursor.peek_char() == Some(';') {
            cursor.advance_char();
        }
        Ok(Rule::Extend(Rc::new(ExtendRule {
            targets: selector::parse_extend_targets(&inner)?,
        })))
    }

    fn parse_mixin_definition(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        let line = cursor.line();
        let name = cursor.read_mixin_name()?;
        cursor.skip_whitespace_and_comments();
        let raw_params = cursor.read_parenthesized()?;
        let params = parse_params(&raw_params)?;
        cursor.skip_whitespace_and_comments();
        let header = cursor.read_until('{')?;
        cursor.expect_char('{')?;
        let guard = match header.trim().strip_prefix("when") {
            Some(condition) => Some(parse_guard(condition)?),
            None => None,
        };
        let rules = self.parse_rules(cursor, true)?;
        Ok(Rule::Mixin(Rc::new(Mixin {
            id: DefId::next(),
            site: DefId::next(),
            name,
            params,
            guard,
            block: Rc::new(Block::new(rules)),
            line,
        })))
    }

    fn parse_mixin_call(&self, cursor: &mut Cursor<'_>) -> LessResult<Rule> {
        let line = cursor.line();
        let mut target = String::new();
        while let Some(ch) = cursor.peek_char() {
            if matches!(ch, '(' | ';' | '!' | '}') {
                break;
            }
            target.push(ch);
            cursor.advance_char();
        }
        let selector = selector::parse_selector(target.trim())?;
        let args = if cursor.peek_char() == Some('(') {
            parse_arguments(&cursor.read_parenthesized()?)?
        } else {
            Vec::new()
        };
        cursor.skip_whitespace_and_comments();
        let important = cursor.match_str("!important");
        cursor.skip_whitespace_and_comments();
        if cursor.peek_char() == Some(';') {
            cursor.advance_char();
        }
        Ok(Rule::MixinCall(Rc::new(MixinCall {
            selector,
            args,
            important,
            line,
        })))
    }
}

fn strip_important(raw: &str) -> (&str, bool) {
    let trimmed = raw.trim_end();
    let lowered = trimmed.to_ascii_lowercase();
    if let Some(stripped) = lowered.strip_suffix("!important") {
        return (trimmed[..stripped.len()].trim_end(), true);
    }
    (trimmed, false)
}

/// `@import` 路径部分的结束位置（引号字符串或 `url()`）。
fn path_end(text: &str) -> Option<usize> {
    let first = text.chars().next()?;
    if first == '"' || first == '\'' {
        return text[1..].find(first).map(|idx| idx + 2);
    }
    if text.starts_with("url(") {
        return text.find(')').map(|idx| idx + 1);
    }
    Some(text.find(char::is_whitespace).unwrap_or(text.len()))
}

/// 拆出选择器后的 `when` 守卫。
fn split_guard(header: &str) -> (&str, Option<&str>) {
    match find_keyword(header, "when") {
        Some(idx) => (header[..idx].trim(), Some(header[idx + 4..].trim())),
        None => (header.trim(), None),
    }
}

/// 在括号与引号之外查找独立的关键字。
fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    for (idx, &byte) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if byte == q {
                quote = None;
            }
            continue;
        }
        match byte {
            b'"' | b'\'' => quote = Some(byte),
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            _ if depth == 0 && text[idx..].starts_with(keyword) => {
                let before = idx == 0 || bytes[idx - 1].is_ascii_whitespace();
                let after = bytes
                    .get(idx + keyword.len())
                    .map_or(true, |b| b.is_ascii_whitespace() || *b == b'(');
                if before && after {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_keyword<'a>(text: &'a str, keyword: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(idx) = find_keyword(rest, keyword) {
        parts.push(rest[..idx].trim());
        rest = &rest[idx + keyword.len()..];
    }
    parts.push(rest.trim());
    parts
}

/// 守卫：逗号表示“或”，`and` 表示“且”，`not` 取反。
pub fn parse_guard(text: &str) -> LessResult<Condition> {
    let mut alternatives = Vec::new();
    for alternative in split_top_level(text, ',') {
        let mut terms = Vec::new();
        for term in split_keyword(alternative.trim(), "and") {
            terms.push(parse_guard_term(term)?);
        }
        alternatives.push(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::And(terms)
        });
    }
    if alternatives.len() == 1 {
        return Ok(alternatives.remove(0));
    }
    Ok(Condition::Or(alternatives))
}

fn parse_guard_term(term: &str) -> LessResult<Condition> {
    let term = term.trim();
    if let Some(rest) = term.strip_prefix("not") {
        if rest.starts_with(|c: char| c.is_whitespace() || c == '(') {
            return Ok(Condition::Not(Box::new(parse_guard_term(rest)?)));
        }
    }
    let inner = term
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| LessError::parse(format!("守卫条件必须用括号包裹: `{term}`"), 0))?;
    if inner.trim_start().starts_with('(') && find_comparison(inner).is_none() {
        return parse_guard(inner);
    }
    match find_comparison(inner) {
        Some((idx, len, op)) => Ok(Condition::Compare {
            op,
            left: parse_value(&inner[..idx])?,
            right: parse_value(&inner[idx + len..])?,
        }),
        None => Ok(Condition::Compare {
            op: Comparison::Equal,
            left: parse_value(inner)?,
            right: Node::keyword("true"),
        }),
    }
}

fn find_comparison(text: &str) -> Option<(usize, usize, Comparison)> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    for (idx, &byte) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if byte == q {
                quote = None;
            }
            continue;
        }
        match byte {
            b'"' | b'\'' => quote = Some(byte),
            b'(' => depth += 1,
            b')' => depth -= 1,
            b'>' | b'<' | b'=' if depth == 0 => {
                let next = bytes.get(idx + 1).copied();
                return Some(match (byte, next) {
                    (b'>', Some(b'=')) => (idx, 2, Comparison::GreaterOrEqual),
                    (b'<', Some(b'=')) | (b'=', Some(b'<')) => (idx, 2, Comparison::LessOrEqual),
                    (b'=', Some(b'>')) => (idx, 2, Comparison::GreaterOrEqual),
                    (b'>', _) => (idx, 1, Comparison::Greater),
                    (b'<', _) => (idx, 1, Comparison::Less),
                    _ => (idx, 1, Comparison::Equal),
                });
            }
            _ => {}
        }
    }
    None
}

/// 媒体查询列表：逗号分隔，每项由 `and` 连接。
pub fn parse_features(text: &str) -> LessResult<Features> {
    let mut queries = Vec::new();
    for query in split_top_level(text, ',') {
        let query = query.trim();
        if query.is_empty() {
            continue;
        }
        let mut terms = Vec::new();
        for term in split_keyword(query, "and") {
            if term.is_empty() {
                continue;
            }
            terms.push(parse_media_term(term)?);
        }
        queries.push(FeatureQuery { terms });
    }
    Ok(Features { queries })
}

fn parse_media_term(term: &str) -> LessResult<MediaTerm> {
    if let Some(inner) = term.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        return Ok(match inner.split_once(':') {
            Some((name, value)) => MediaTerm::Feature {
                name: name.trim().to_string(),
                value: Some(parse_value(value.trim())?),
            },
            None => MediaTerm::Feature {
                name: inner.trim().to_string(),
                value: None,
            },
        });
    }
    if term.starts_with('@') {
        return Ok(MediaTerm::Value(parse_value(term)?));
    }
    Ok(MediaTerm::Keyword(term.to_string()))
}

/// 实参与形参列表：出现顶层 `;` 时以分号分隔，否则以逗号分隔。
fn split_arguments(raw: &str) -> Vec<String> {
    let separator = if split_top_level(raw, ';').len() > 1 {
        ';'
    } else {
        ','
    };
    split_top_level(raw, separator)
        .into_iter()
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// `@name:` 前缀，返回名字与剩余部分。
fn named_prefix(part: &str) -> Option<(&str, &str)> {
    let rest = part.strip_prefix('@')?;
    if rest.starts_with('{') || rest.starts_with('@') {
        return None;
    }
    let end = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(rest.len());
    let (name, tail) = rest.split_at(end);
    if name.is_empty() {
        return None;
    }
    Some((name, tail.trim_start()))
}

fn parse_arguments(raw: &str) -> LessResult<Vec<Argument>> {
    let mut args = Vec::new();
    for part in split_arguments(raw) {
        match named_prefix(&part) {
            Some((name, tail)) if tail.starts_with(':') => args.push(Argument {
                name: Some(name.to_string()),
                value: parse_value(&tail[1..])?,
            }),
            _ => args.push(Argument {
                name: None,
                value: parse_value(&part)?,
            }),
        }
    }
    Ok(args)
}

fn parse_params(raw: &str) -> LessResult<Vec<Parameter>> {
    let mut params = Vec::new();
    for part in split_arguments(raw) {
        if part == "..." {
            params.push(Parameter {
                name: None,
                value: None,
                variadic: true,
            });
            continue;
        }
        match named_prefix(&part) {
            Some((name, "...")) => params.push(Parameter {
                name: Some(name.to_string()),
                value: None,
                variadic: true,
            }),
            Some((name, tail)) if tail.starts_with(':') => params.push(Parameter {
                name: Some(name.to_string()),
                value: Some(parse_value(&tail[1..])?),
                variadic: false,
            }),
            Some((name, "")) => params.push(Parameter {
                name: Some(name.to_string()),
                value: None,
                variadic: false,
            }),
            _ => params.push(Parameter {
                name: None,
                value: Some(parse_value(&part)?),
                variadic: false,
            }),
        }
    }
    Ok(params)
}

/// 解析属性值或表达式文本。
pub fn parse_value(raw: &str) -> LessResult<Node> {
    let trimmed = raw.trim();
    let mut parser = ValueParser {
        cursor: Cursor::new(trimmed),
        depth: 0,
    };
    let node = parser.parse_list()?;
    parser.cursor.skip_whitespace();
    if !parser.cursor.is_eof() {
        return Ok(Node::Anonymous(trimmed.to_string()));
    }
    Ok(node)
}

/// 值表达式的递归下降解析。`depth` 记录括号层数：括号外的 `/` 保留为 CSS 简写。
struct ValueParser<'a> {
    cursor: Cursor<'a>,
    depth: usize,
}

impl<'a> ValueParser<'a> {
    fn parse_list(&mut self) -> LessResult<Node> {
        let mut items = vec![self.parse_spaced()?];
        loop {
            self.cursor.skip_whitespace();
            if self.cursor.peek_char() != Some(',') {
                break;
            }
            self.cursor.advance_char();
            items.push(self.parse_spaced()?);
        }
        Ok(collapse(items, Node::ExpressionList))
    }

    fn parse_spaced(&mut self) -> LessResult<Node> {
        let mut items = Vec::new();
        loop {
            self.cursor.skip_whitespace();
            match self.cursor.peek_char() {
                None | Some(',') | Some(')') => break,
                _ => items.push(self.parse_additive()?),
            }
        }
        if items.is_empty() {
            return Ok(Node::Anonymous(String::new()));
        }
        Ok(collapse(items, Node::Expression))
    }

    fn parse_additive(&mut self) -> LessResult<Node> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let save = self.cursor.clone();
            let spaced = self.cursor.skip_whitespace();
            let op = match self.cursor.peek_char() {
                Some('+') => Operator::Add,
                Some('-') => Operator::Subtract,
                _ => {
                    self.cursor = save;
                    break;
                }
            };
            // 空格后紧贴数值的 `-` 是下一个负值
            let glued = self
                .cursor
                .peek_nth(1)
                .map_or(false, |ch| !ch.is_whitespace());
            if spaced && glued {
                self.cursor = save;
                break;
            }
            self.cursor.advance_char();
            self.cursor.skip_whitespace();
            let right = self.parse_multiplicative()?;
            left = Node::Operation(Box::new(Operation { op, left, right }));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> LessResult<Node> {
        let mut left = self.parse_unary()?;
        loop {
            let save = self.cursor.clone();
            self.cursor.skip_whitespace();
            let op = match self.cursor.peek_char() {
                Some('*') => Operator::Multiply,
                Some('/') if self.cursor.peek_nth(1) != Some('*') => Operator::Divide,
                _ => {
                    self.cursor = save;
                    break;
                }
            };
            self.cursor.advance_char();
            self.cursor.skip_whitespace();
            let right = self.parse_unary()?;
            let is_var = |node: &Node| matches!(node, Node::Variable(_));
            left = if op == Operator::Divide && self.depth == 0 && !is_var(&left) && !is_var(&right)
            {
                Node::Slash(Box::new(left), Box::new(right))
            } else {
                Node::Operation(Box::new(Operation { op, left, right }))
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> LessResult<Node> {
        let next = self.cursor.peek_nth(1);
        match self.cursor.peek_char() {
            Some('-') | Some('+') if next.map_or(false, |c| c.is_ascii_digit() || c == '.') => {
                self.parse_number()
            }
            Some('-') if matches!(next, Some('@') | Some('(')) => {
                self.cursor.advance_char();
                Ok(Node::Negate(Box::new(self.parse_operand()?)))
            }
            _ => self.parse_operand(),
        }
    }

    fn parse_operand(&mut self) -> LessResult<Node> {
        let ch = self
            .cursor
            .peek_char()
            .ok_or_else(|| LessError::parse("表达式意外结束", self.cursor.position()))?;
        match ch {
            '(' => {
                self.cursor.advance_char();
                self.depth += 1;
                let inner = self.parse_list()?;
                self.cursor.skip_whitespace();
                self.cursor.expect_char(')')?;
                self.depth -= 1;
                Ok(Node::Paren(Box::new(inner)))
            }
            '"' | '\'' => self.parse_quoted(false),
            '~' if matches!(self.cursor.peek_nth(1), Some('"') | Some('\'')) => {
                self.cursor.advance_char();
                self.parse_quoted(true)
            }
            '`' => {
                self.cursor.advance_char();
                let code = self.cursor.read_until('`')?;
                self.cursor.advance_char();
                Ok(Node::Script(code))
            }
            '@' => self.parse_variable(),
            '#' => {
                self.cursor.advance_char();
                let hex = self.cursor.read_identifier();
                let text = format!("#{hex}");
                Ok(match color::parse_color(&text) {
                    Some(rgba) => Node::Color(Color {
                        rgba,
                        original: Some(text),
                    }),
                    None => Node::Anonymous(text),
                })
            }
            c if c.is_ascii_digit()
                || (c == '.' && self.cursor.peek_nth(1).map_or(false, |n| n.is_ascii_digit())) =>
            {
                self.parse_number()
            }
            c if c.is_alphabetic() || c == '-' || c == '_' => {
                let ident = self.cursor.read_identifier();
                if self.cursor.peek_char() == Some('(') {
                    return self.parse_function(ident);
                }
                Ok(Node::Keyword(ident))
            }
            _ => {
                let mut raw = String::new();
                while let Some(c) = self.cursor.peek_char() {
                    if c.is_whitespace() || matches!(c, ',' | ')') {
                        break;
                    }
                    raw.push(c);
                    self.cursor.advance_char();
                }
                if raw.is_empty() {
                    return Err(LessError::parse(
                        format!("无法解析的字符 '{ch}'"),
                        self.cursor.position(),
                    ));
                }
                Ok(Node::Anonymous(raw))
            }
        }
    }

    fn parse_number(&mut self) -> LessResult<Node> {
        let start = self.cursor.position();
        let mut text = String::new();
        if let Some(sign @ ('-' | '+')) = self.cursor.peek_char() {
            text.push(sign);
            self.cursor.advance_char();
        }
        let mut seen_dot = false;
        while let Some(ch) = self.cursor.peek_char() {
            if ch.is_ascii_digit() {
                text.push(ch);
            } else if ch == '.'
                && !seen_dot
                && self.cursor.peek_nth(1).map_or(false, |n| n.is_ascii_digit())
            {
                seen_dot = true;
                text.push(ch);
            } else {
                break;
            }
            self.cursor.advance_char();
        }
        let value: f64 = text
            .parse()
            .map_err(|_| LessError::parse(format!("无法解析数值 `{text}`"), start))?;
        let mut unit = String::new();
        while let Some(ch) = self.cursor.peek_char() {
            if ch == '%' {
                unit.push(ch);
                self.cursor.advance_char();
                break;
            }
            if !ch.is_ascii_alphabetic() {
                break;
            }
            unit.push(ch);
            self.cursor.advance_char();
        }
        Ok(Node::Dimension(Dimension {
            value,
            unit: (!unit.is_empty()).then_some(unit),
        }))
    }

    fn parse_quoted(&mut self, escaped: bool) -> LessResult<Node> {
        let delimiter = self
            .cursor
            .advance_char()
            .ok_or_else(|| LessError::parse("缺少字符串", self.cursor.position()))?;
        let mut content = String::new();
        loop {
            match self.cursor.advance_char() {
                Some('\\') => {
                    content.push('\\');
                    if let Some(next) = self.cursor.advance_char() {
                        content.push(next);
                    }
                }
                Some(ch) if ch == delimiter => break,
                Some(ch) => content.push(ch),
                None => {
                    return Err(LessError::parse(
                        "字符串缺少结束引号",
                        self.cursor.position(),
                    ))
                }
            }
        }
        Ok(Node::Quoted(Quoted {
            delimiter,
            escaped,
            parts: interpolation_parts(&content),
        }))
    }

    fn parse_variable(&mut self) -> LessResult<Node> {
        self.cursor.expect_char('@')?;
        let (indirect, curly) = match self.cursor.peek_char() {
            Some('@') => {
                self.cursor.advance_char();
                (true, false)
            }
            Some('{') => {
                self.cursor.advance_char();
                (false, true)
            }
            _ => (false, false),
        };
        let name = self.cursor.read_identifier();
        if name.is_empty() {
            return Err(LessError::parse("变量名不能为空", self.cursor.position()));
        }
        if curly {
            self.cursor.expect_char('}')?;
        }
        Ok(Node::Variable(Variable {
            name,
            indirect,
            curly,
        }))
    }

    fn parse_function(&mut self, name: String) -> LessResult<Node> {
        let lowered = name.to_ascii_lowercase();
        if lowered == "url" {
            let inner = self.cursor.read_parenthesized()?;
            let inner = inner.trim();
            let value = if inner.starts_with('"') || inner.starts_with('\'') {
                parse_value(inner)?
            } else {
                Node::Anonymous(inner.to_string())
            };
            return Ok(Node::Url(Box::new(value)));
        }
        if RAW_FUNCTIONS.contains(&lowered.as_str()) {
            let inner = self.cursor.read_parenthesized()?;
            return Ok(Node::Anonymous(format!("{name}({inner})")));
        }
        self.cursor.expect_char('(')?;
        self.depth += 1;
        self.cursor.skip_whitespace();
        let args = if self.cursor.peek_char() == Some(')') {
            Vec::new()
        } else {
            match self.parse_list()? {
                Node::ExpressionList(items) => items,
                single => vec![single],
            }
        };
        self.cursor.skip_whitespace();
        self.cursor.expect_char(')')?;
        self.depth -= 1;
        Ok(Node::FunctionCall(FunctionCall { name, args }))
    }
}

fn collapse(mut items: Vec<Node>, wrap: fn(Vec<Node>) -> Node) -> Node {
    if items.len() == 1 {
        return items.remove(0);
    }
    wrap(items)
}

/// 把字符串内容中的 `@{name}` 拆成变量片段。
fn interpolation_parts(content: &str) -> Vec<Node> {
    let mut parts = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("@{") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        if start > 0 {
            parts.push(Node::Anonymous(rest[..start].to_string()));
        }
        parts.push(Node::Variable(Variable {
            name: rest[start + 2..start + end].to_string(),
            indirect: false,
            curly: true,
        }));
        rest = &rest[start + end + 1..];
    }
    if !rest.is_empty() || parts.is_empty() {
        parts.push(Node::Anonymous(rest.to_string()));
    }
    parts
}

/// 带位置指针的输入游标，提供便捷的字符读取与回退功能。
struct Cursor<'a> {
    source: &'a str,
    len: usize,
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            len: source.len(),
            position: 0,
        }
    }

    fn position(&self) -> usize {
        self.position
    }

    fn line(&self) -> usize {
        self.source[..self.position].matches('\n').count() + 1
    }

    fn is_eof(&self) -> bool {
        self.position >= self.len
    }

    fn starts_with(&self, ch: char) -> bool {
        self.peek_char() == Some(ch)
    }

    fn starts_with_str(&self, prefix: &str) -> bool {
        self.source[self.position..].starts_with(prefix)
    }

    fn peek_char(&self) -> Option<char> {
        self.source[self.position..].chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.source[self.position..].chars().nth(n)
    }

    fn advance_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.position += ch.len_utf8();
        Some(ch)
    }

    fn expect_char(&mut self, expect: char) -> LessResult<()> {
        match self.advance_char() {
            Some(ch) if ch == expect => Ok(()),
            Some(ch) => Err(LessError::parse(
                format!("期待字符 '{expect}', 却得到 '{ch}'"),
                self.position,
            )),
            None => Err(LessError::parse(
                format!("期待字符 '{expect}'"),
                self.position,
            )),
        }
    }

    /// 跳过空白，返回是否跳过了内容。
    fn skip_whitespace(&mut self) -> bool {
        let start = self.position;
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.advance_char();
            } else {
                break;
            }
        }
        self.position > start
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            self.skip_whitespace();
            if self.starts_with('/') && self.consume_comment() {
                continue;
            }
            break;
        }
    }

    /// 语句之间只跳过 `//` 注释，块注释作为规则保留。
    fn skip_whitespace_and_line_comments(&mut self) {
        loop {
            self.skip_whitespace();
            if self.starts_with_str("//") && self.consume_comment() {
                continue;
            }
            break;
        }
    }

    fn consume_comment(&mut self) -> bool {
        if self.match_str("//") {
            while let Some(ch) = self.peek_char() {
                self.advance_char();
                if ch == '\n' {
                    break;
                }
            }
            true
        } else if self.match_str("/*") {
            while self.peek_char().is_some() {
                if self.match_str("*/") {
                    break;
                }
                self.advance_char();
            }
            true
        } else {
            false
        }
    }

    fn read_block_comment(&mut self) -> LessResult<String> {
        let start = self.position;
        self.match_str("/*");
        loop {
            if self.match_str("*/") {
                return Ok(self.source[start..self.position].to_string());
            }
            if self.advance_char().is_none() {
                return Err(LessError::parse("注释缺少结束标记", start));
            }
        }
    }

    fn match_str(&mut self, prefix: &str) -> bool {
        if self.source[self.position..].starts_with(prefix) {
            self.position += prefix.len();
            true
        } else {
            false
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut ident = String::new();
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '-' || ch == '_' {
                ident.push(ch);
                self.advance_char();
            } else {
                break;
            }
        }
        ident
    }

    fn read_property_name(&mut self) -> String {
        let mut name = String::new();
        let mut pending_interpolation = false;
        while let Some(ch) = self.peek_char() {
            if ch == ':' || ch == ';' {
                break;
            }
            if ch == '{' && !pending_interpolation {
                break;
            }
            if ch.is_control() {
                break;
            }
            self.advance_char();
            name.push(ch);
            if ch == '@' {
                pending_interpolation = true;
            } else if ch == '{' && pending_interpolation {
                while let Some(inner) = self.advance_char() {
                    name.push(inner);
                    if inner == '}' {
                        pending_interpolation = false;
                        break;
                    }
                }
            } else if !ch.is_whitespace() {
                pending_interpolation = false;
            }
        }
        name.trim().to_string()
    }

    fn read_until(&mut self, end: char) -> LessResult<String> {
        let mut result = String::new();
        let mut interpolation = false;
        while let Some(ch) = self.peek_char() {
            if ch == '{' && result.ends_with('@') {
                interpolation = true;
            } else if ch == end && !interpolation {
                break;
            } else if ch == '}' {
                interpolation = false;
            }
            result.push(ch);
            self.advance_char();
        }
        if self.peek_char() != Some(end) {
            return Err(LessError::parse(format!("期待字符 '{end}'"), self.position));
        }
        Ok(result)
    }

    /// 读取值文本，直到括号与引号之外的终止符。
    fn read_value_text(&mut self, terminators: &[char]) -> LessResult<String> {
        let mut result = String::new();
        let mut depth = 0usize;
        while let Some(ch) = self.peek_char() {
            if depth == 0 && terminators.contains(&ch) {
                break;
            }
            match ch {
                '"' | '\'' => {
                    result.push(ch);
                    self.advance_char();
                    while let Some(next) = self.advance_char() {
                        result.push(next);
                        if next == '\\' {
                            if let Some(escaped) = self.advance_char() {
                                result.push(escaped);
                            }
                            continue;
                        }
                        if next == ch {
                            break;
                        }
                    }
                    continue;
                }
                '(' | '[' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                '{' if result.ends_with('@') => depth += 1,
                '}' if depth > 0 => depth -= 1,
                _ => {}
            }
            result.push(ch);
            self.advance_char();
        }
        Ok(result)
    }

    /// 读取一对圆括号，返回去掉外层括号的内容。
    fn read_parenthesized(&mut self) -> LessResult<String> {
        self.expect_char('(')?;
        let inner = self.read_value_text(&[')'])?;
        self.expect_char(')')?;
        Ok(inner)
    }

    fn lookahead_at_keyword(&self) -> String {
        let mut lookahead = self.clone();
        lookahead.advance_char();
        lookahead.read_identifier()
    }

    fn lookahead_is_variable_decl(&self) -> LessResult<bool> {
        let mut lookahead = self.clone();
        lookahead.expect_char('@')?;
        if lookahead.read_identifier().is_empty() {
            return Ok(false);
        }
        lookahead.skip_whitespace();
        Ok(lookahead.peek_char() == Some(':'))
    }

    fn lookahead_is_block_at_rule(&self) -> LessResult<bool> {
        let mut lookahead = self.clone();
        if !lookahead.starts_with('@') {
            return Ok(false);
        }
        lookahead.advance_char();
        let ident = lookahead.read_identifier();
        if ident.is_empty() {
            return Ok(false);
        }
        lookahead.skip_whitespace_and_comments();
        let mut paren_depth = 0usize;
        while let Some(ch) = lookahead.peek_char() {
            match ch {
                '{' if paren_depth == 0 => return Ok(true),
                '(' => paren_depth += 1,
                ')' => paren_depth = paren_depth.saturating_sub(1),
                ';' | '}' => return Ok(false),
                _ => {}
            }
            lookahead.advance_char();
        }
        Ok(false)
    }

    fn skip_parenthesized(&mut self) -> bool {
        if self.peek_char() != Some('(') {
            return false;
        }
        self.advance_char();
        let mut depth = 1;
        while let Some(ch) = self.advance_char() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    fn lookahead_is_mixin_definition(&self) -> LessResult<bool> {
        let mut lookahead = self.clone();
        if !matches!(lookahead.peek_char(), Some('.') | Some('#')) {
            return Ok(false);
        }
        lookahead.advance_char();
        if lookahead.read_identifier().is_empty() {
            return Ok(false);
        }
        lookahead.skip_whitespace_and_comments();
        if !lookahead.skip_parenthesized() {
            return Ok(false);
        }
        lookahead.skip_whitespace_and_comments();
        if lookahead.starts_with_str("when") {
            let mut depth = 0usize;
            while let Some(ch) = lookahead.peek_char() {
                match ch {
                    '{' if depth == 0 => break,
                    '(' => depth += 1,
                    ')' => depth = depth.saturating_sub(1),
                    ';' => return Ok(false),
                    _ => {}
                }
                lookahead.advance_char();
            }
        }
        Ok(lookahead.peek_char() == Some('{'))
    }

    fn lookahead_is_mixin_call(&self) -> LessResult<bool> {
        let mut lookahead = self.clone();
        if !matches!(lookahead.peek_char(), Some('.') | Some('#')) {
            return Ok(false);
        }
        while let Some(ch) = lookahead.peek_char() {
            if ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.' | '#' | '>') || ch.is_whitespace()
            {
                lookahead.advance_char();
            } else {
                break;
            }
        }
        if lookahead.peek_char() == Some('(') && !lookahead.skip_parenthesized() {
            return Ok(false);
        }
        lookahead.skip_whitespace_and_comments();
        lookahead.match_str("!important");
        lookahead.skip_whitespace_and_comments();
        Ok(matches!(lookahead.peek_char(), Some(';') | Some('}')))
    }

    /// `.a:extend(.b);` 这种没有块的 extend 声明。
    fn lookahead_is_extend_statement(&self) -> bool {
        let mut lookahead = self.clone();
        match lookahead.read_value_text(&[';', '{', '}']) {
            Ok(text) => lookahead.peek_char() == Some(';') && text.contains(":extend("),
            Err(_) => false,
        }
    }

    fn read_mixin_name(&mut self) -> LessResult<String> {
        match self.peek_char() {
            Some(prefix @ ('.' | '#')) => {
                self.advance_char();
                let ident = self.read_identifier();
                if ident.is_empty() {
                    return Err(LessError::parse("mixin 名称不合法", self.position()));
                }
                Ok(format!("{prefix}{ident}"))
            }
            _ => Err(LessError::parse("期待 mixin 名称", self.position())),
        }
    }

    /// 通过向前查看判断接下来的语句类型（声明或子规则）。
    fn detect_body_kind(&self) -> Option<BodyKind> {
        let mut iter = self.clone();
        iter.skip_whitespace_and_comments();
        let mut saw_colon = false;
        let mut pending_interpolation = false;
        while let Some(ch) = iter.peek_char() {
            match ch {
                '@' => {
                    pending_interpolation = true;
                    iter.advance_char();
                    continue;
                }
                '{' if pending_interpolation => {
                    iter.advance_char();
                    while let Some(inner) = iter.advance_char() {
                        if inner == '}' {
                            break;
                        }
                    }
                    pending_interpolation = false;
                    continue;
                }
                '{' => return Some(BodyKind::NestedRule),
                ';' => return Some(BodyKind::Declaration),
                '}' => {
                    return if saw_colon {
                        Some(BodyKind::Declaration)
                    } else {
                        None
                    }
                }
                ':' => {
                    saw_colon = true;
                }
                _ => {
                    pending_interpolation = false;
                }
            }
            iter.advance_char();
        }
        if saw_colon {
            Some(BodyKind::Declaration)
        } else {
            None
        }
    }
}

impl<'a> Clone for Cursor<'a> {
    fn clone(&self) -> Self {
        Self {
            source: self.source,
            len: self.len,
            position: self.position,
        }
    }
}

enum BodyKind {
    Declaration,
    NestedRule,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Vec<Rule> {
        LessParser::new().parse(source).unwrap().block.snapshot()
    }

    fn value(raw: &str) -> String {
        parse_value(raw).unwrap().to_css(false)
    }

    #[test]
    fn slash_outside_parens_is_shorthand() {
        assert!(matches!(parse_value("12px/1.5").unwrap(), Node::Slash(_, _)));
        assert!(matches!(parse_value("(12px/2)").unwrap(), Node::Paren(_)));
        assert!(matches!(parse_value("@a/2").unwrap(), Node::Operation(_)));
    }

    #[test]
    fn minus_after_space_starts_negative_value() {
        match parse_value("1px -2px").unwrap() {
            Node::Expression(items) => assert_eq!(items.len(), 2),
            other => panic!("期待空格列表，得到 {other:?}"),
        }
        assert!(matches!(parse_value("1px - 2px").unwrap(), Node::Operation(_)));
        assert!(matches!(parse_value("-@x").unwrap(), Node::Negate(_)));
    }

    #[test]
    fn values_render_back() {
        assert_eq!(value("1px solid #333"), "1px solid #333");
        assert_eq!(value("Arial, sans-serif"), "Arial, sans-serif");
        assert_eq!(value("url(\"a.png\") no-repeat"), "url(\"a.png\") no-repeat");
        assert_eq!(value("calc(100% - 10px)"), "calc(100% - 10px)");
        assert_eq!(value("translate(-50%, -50%)"), "translate(-50%, -50%)");
    }

    #[test]
    fn quoted_interpolation_parts() {
        match parse_value("~\"@{a}px\"").unwrap() {
            Node::Quoted(quoted) => {
                assert!(quoted.escaped);
                assert_eq!(quoted.parts.len(), 2);
            }
            other => panic!("期待字符串，得到 {other:?}"),
        }
    }

    #[test]
    fn parses_mixin_definition_and_call() {
        let rules = parse(".m(@a; @b: 2px) when (@a > 1) { width: @a; }\n.x { .m(1; @b: 3px) !important; }");
        match &rules[0] {
            Rule::Mixin(mixin) => {
                assert_eq!(mixin.name, ".m");
                assert_eq!(mixin.params.len(), 2);
                assert!(mixin.params[1].value.is_some());
                assert!(mixin.guard.is_some());
            }
            other => panic!("期待 mixin，得到 {other:?}"),
        }
        match &rules[1] {
            Rule::Ruleset(ruleset) => match ruleset.block.get(0) {
                Some(Rule::MixinCall(call)) => {
                    assert_eq!(call.args.len(), 2);
                    assert_eq!(call.args[1].name.as_deref(), Some("b"));
                    assert!(call.important);
                }
                other => panic!("期待 mixin 调用，得到 {other:?}"),
            },
            other => panic!("期待规则集，得到 {other:?}"),
        }
    }

    #[test]
    fn comma_separated_params_without_semicolon() {
        let rules = parse(".m(@a, @rest...) {}\n.p(dark, @c) {}\n.v(...) {}");
        let params: Vec<Vec<Parameter>> = rules
            .iter()
            .filter_map(|rule| match rule {
                Rule::Mixin(mixin) => Some(mixin.params.clone()),
                _ => None,
            })
            .collect();
        assert!(params[0][1].variadic);
        assert_eq!(params[0][1].name.as_deref(), Some("rest"));
        assert!(params[1][0].is_pattern());
        assert!(params[2][0].variadic && params[2][0].name.is_none());
    }

    #[test]
    fn parses_media_import_and_extend() {
        let rules = parse(
            "@import (css) \"base.css\" screen;\n@media screen and (min-width: 768px), print { .a { color: red } }\n.b { &:extend(.a all); }\n.r:extend(.x);",
        );
        assert!(matches!(&rules[0], Rule::Import(import) if import.options.css && import.features.is_some()));
        match &rules[1] {
            Rule::Media(media) => {
                assert_eq!(
                    media.features.to_css(false),
                    "screen and (min-width: 768px), print"
                );
            }
            other => panic!("期待 @media，得到 {other:?}"),
        }
        match &rules[2] {
            Rule::Ruleset(ruleset) => {
                assert!(matches!(ruleset.block.get(0), Some(Rule::Extend(ext)) if ext.targets[0].all));
            }
            other => panic!("期待规则集，得到 {other:?}"),
        }
        match &rules[3] {
            Rule::Ruleset(ruleset) => assert_eq!(ruleset.selectors[0].extends.len(), 1),
            other => panic!("期待 extend 声明，得到 {other:?}"),
        }
    }

    #[test]
    fn guards_support_and_or_not() {
        let guard = parse_guard("(@a > 1) and not (@b = 2), (@c)").unwrap();
        match guard {
            Condition::Or(alternatives) => {
                assert_eq!(alternatives.len(), 2);
                assert!(matches!(&alternatives[0], Condition::And(terms) if terms.len() == 2));
                assert!(matches!(
                    &alternatives[1],
                    Condition::Compare { op: Comparison::Equal, right, .. } if *right == Node::keyword("true")
                ));
            }
            other => panic!("期待 or 条件，得到 {other:?}"),
        }
    }

    #[test]
    fn interpolated_selector_header() {
        let rules = parse("@i: 1;\n.w-@{i} { w: 1; }\n.m(@n) when (@n > 0) { .col-@{n} { x: 1; } }");
        assert_eq!(rules.len(), 3);
        match &rules[1] {
            Rule::Ruleset(ruleset) => {
                assert_eq!(ruleset.selectors[0].to_css(false), ".w-@{i}");
                assert_eq!(ruleset.block.len(), 1);
            }
            other => panic!("期待规则集，得到 {other:?}"),
        }
        match &rules[2] {
            Rule::Mixin(mixin) => {
                assert!(matches!(mixin.block.get(0), Some(Rule::Ruleset(inner)) if inner.selectors[0].to_css(false) == ".col-@{n}"));
            }
            other => panic!("期待 mixin，得到 {other:?}"),
        }
    }

    #[test]
    fn block_comments_are_kept() {
        let rules = parse("/* head */\n// gone\n.a { color: red; }");
        assert!(matches!(&rules[0], Rule::Comment(comment) if comment.text == "/* head */"));
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn unbalanced_braces_fail() {
        assert!(LessParser::new().parse(".a { color: red;").is_err());
        assert!(LessParser::new().parse(".a { color: red; } }").is_err());
    }
}
