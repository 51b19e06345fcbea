//! mixin 调用解析：按字面路径搜索候选、形参模式匹配与实参绑定。
//!
//! 递归计数与闭包按 `DefId` 存放在 [`MixinState`] 旁表中，
//! 进入与退出通过 [`EntryGuard`] 成对发生。

use crate::arith;
use crate::ast::{
    Argument, Block, DefId, Definition, MixinCandidate, Mixin, Node, Parameter, Rule, Ruleset,
};
use crate::env::{Closure, ExecEnv};
use crate::error::{ErrorKind, LessError, LessResult};
use crate::value;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::debug;

/// 一次成功的候选匹配，附带沿路径经过的命名空间块（由外向内）。
#[derive(Debug, Clone)]
pub enum MixinMatch {
    Mixin {
        mixin: Rc<Mixin>,
        namespaces: Vec<Rc<Block>>,
    },
    Ruleset {
        ruleset: Rc<Ruleset>,
        namespaces: Vec<Rc<Block>>,
    },
}

impl MixinMatch {
    pub fn id(&self) -> DefId {
        match self {
            MixinMatch::Mixin { mixin, .. } => mixin.id,
            MixinMatch::Ruleset { ruleset, .. } => ruleset.id,
        }
    }

    pub fn site(&self) -> DefId {
        match self {
            MixinMatch::Mixin { mixin, .. } => mixin.site,
            MixinMatch::Ruleset { ruleset, .. } => ruleset.site,
        }
    }

    pub fn namespaces(&self) -> &[Rc<Block>] {
        match self {
            MixinMatch::Mixin { namespaces, .. } | MixinMatch::Ruleset { namespaces, .. } => {
                namespaces
            }
        }
    }
}

/// 按调用路径在作用域栈中查找候选；某一帧有结果即停止。
pub fn resolve(env: &ExecEnv, path: &[String], args: &[Argument]) -> LessResult<Vec<MixinMatch>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let found = env.resolve_mixins(|block| {
        let mut matches = Vec::new();
        let mut namespaces = Vec::new();
        search(env, block, path, 0, args, &mut namespaces, &mut matches)?;
        Ok(matches)
    })?;
    debug!(path = %path.join(" "), matches = found.len(), "mixin 候选解析完成");
    Ok(found)
}

fn search(
    env: &ExecEnv,
    block: &Rc<Block>,
    path: &[String],
    index: usize,
    args: &[Argument],
    namespaces: &mut Vec<Rc<Block>>,
    matches: &mut Vec<MixinMatch>,
) -> LessResult<()> {
    let remaining = &path[index..];
    for candidate in block.mixin_candidates(&path[index]) {
        match candidate {
            MixinCandidate::Mixin(mixin) => {
                if remaining.len() == 1 && pattern_match(env, &mixin.params, args)? {
                    matches.push(MixinMatch::Mixin {
                        mixin,
                        namespaces: namespaces.clone(),
                    });
                }
            }
            MixinCandidate::Ruleset(ruleset, own_path) => {
                if own_path.len() > remaining.len() || remaining[..own_path.len()] != own_path[..] {
                    continue;
                }
                if own_path.len() == remaining.len() {
                    if args.is_empty() {
                        matches.push(MixinMatch::Ruleset {
                            ruleset,
                            namespaces: namespaces.clone(),
                        });
                    }
                    continue;
                }
                if let Some(guard) = &ruleset.guard {
                    if !value::eval_condition(env, guard)? {
                        continue;
                    }
                }
                namespaces.push(ruleset.block.clone());
                let result = search(
                    env,
                    &ruleset.block,
                    path,
                    index + own_path.len(),
                    args,
                    namespaces,
                    matches,
                );
                namespaces.pop();
                result?;
            }
        }
    }
    Ok(())
}

/// 参数个数检查与值模式比较。失败表示这个重载不适用，不是错误。
pub fn pattern_match(env: &ExecEnv, params: &[Parameter], args: &[Argument]) -> LessResult<bool> {
    let required = params.iter().filter(|p| p.is_required()).count();
    let variadic = params.iter().any(|p| p.variadic);
    let param_count = params.iter().filter(|p| !p.variadic).count();
    if args.len() < required || (!variadic && args.len() > param_count) {
        return Ok(false);
    }
    let positional: Vec<&Argument> = args.iter().filter(|arg| arg.name.is_none()).collect();
    for (param, arg) in params.iter().zip(positional.iter()) {
        if !param.is_pattern() {
            continue;
        }
        let Some(pattern) = &param.value else {
            continue;
        };
        let expected = value::eval(env, pattern)?;
        if !same_value(&expected, &arg.value) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// 结构相等，无法按结构比较时退回到输出文本比较。
pub fn same_value(left: &Node, right: &Node) -> bool {
    let left = arith::coerce_color(left.clone());
    let right = arith::coerce_color(right.clone());
    match (&left, &right) {
        (Node::Dimension(l), Node::Dimension(r)) => l.value == r.value && l.unit == r.unit,
        (Node::Color(l), Node::Color(r)) => l.rgba.same_as(&r.rgba),
        (Node::Quoted(l), Node::Quoted(r)) => l.content() == r.content(),
        _ => left.to_css(false) == right.to_css(false),
    }
}

/// 绑定结果：每个具名形参一条定义，外加 `@arguments`。
///
/// 实参已在调用方作用域中求值；默认值保持未求值，在 mixin 作用域内按需计算。
/// 返回 `None` 表示无法绑定（缺少必需参数或严格模式下参数过多）。
pub fn bind(env: &ExecEnv, params: &[Parameter], args: &[Argument], line: usize) -> LessResult<Option<Block>> {
    // 阶段一：默认值与待绑定队列
    let mut slots: Vec<Option<Node>> = params.iter().map(|p| p.value.clone()).collect();
    let mut queue: VecDeque<usize> = params
        .iter()
        .enumerate()
        .filter(|(_, p)| p.name.is_some() && !p.variadic)
        .map(|(idx, _)| idx)
        .collect();
    let variadic = params.iter().position(|p| p.variadic);
    let mut rest: Vec<Node> = Vec::new();

    // 阶段二：具名实参
    for arg in args {
        let Some(name) = &arg.name else {
            continue;
        };
        let position = params
            .iter()
            .position(|p| !p.variadic && p.name.as_deref() == Some(name.as_str()))
            .ok_or_else(|| {
                LessError::kind(
                    ErrorKind::ArgNamedNotFound,
                    format!("找不到名为 @{name} 的形参"),
                )
            })?;
        slots[position] = Some(arg.value.clone());
        queue.retain(|&idx| idx != position);
    }

    // 阶段三：位置实参
    let positional = args.iter().filter(|arg| arg.name.is_none());
    for (index, arg) in positional.enumerate() {
        match params.get(index) {
            Some(param) if param.variadic => rest.push(arg.value.clone()),
            Some(param) if param.is_pattern() => {}
            _ => {
                if let Some(slot) = queue.pop_front() {
                    slots[slot] = Some(arg.value.clone());
                } else if variadic.is_some() {
                    rest.push(arg.value.clone());
                } else if env.is_strict() {
                    return Ok(None);
                } else {
                    env.warn(
                        ErrorKind::ArgTooMany,
                        format!("实参过多，已忽略 `{}`", arg.value.to_css(false)),
                    )?;
                }
            }
        }
    }

    // 阶段四：输出定义
    let mut rules = Vec::new();
    let mut arguments = Vec::new();
    for (idx, param) in params.iter().enumerate() {
        if param.variadic {
            continue;
        }
        let Some(value) = slots[idx].take() else {
            // 必需形参没有得到实参
            return Ok(None);
        };
        arguments.push(value.clone());
        if let Some(name) = &param.name {
            rules.push(Rule::Definition(Rc::new(Definition::new(name.clone(), value, line))));
        }
    }
    if let Some(position) = variadic {
        if let Some(name) = &params[position].name {
            let collected = Node::Expression(rest.clone());
            rules.push(Rule::Definition(Rc::new(Definition::new(name.clone(), collected, line))));
        }
    }
    arguments.extend(rest);
    rules.push(Rule::Definition(Rc::new(Definition::new(
        "arguments",
        Node::Expression(arguments),
        line,
    ))));
    Ok(Some(Block::new(rules)))
}

/// mixin 与规则集的递归计数和闭包。
#[derive(Debug, Default)]
pub struct MixinState {
    entries: RefCell<HashMap<DefId, usize>>,
    closures: RefCell<HashMap<DefId, Closure>>,
}

impl MixinState {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// 首次经过定义处时捕获闭包，之后不再覆盖。
    pub fn capture(&self, id: DefId, env: &ExecEnv) {
        self.closures
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| env.capture());
    }

    pub fn closure(&self, id: DefId) -> Option<Closure> {
        self.closures.borrow().get(&id).cloned()
    }

    pub fn entries(&self, id: DefId) -> usize {
        self.entries.borrow().get(&id).copied().unwrap_or(0)
    }

    /// 没有任何 mixin 处于展开中。
    pub fn is_idle(&self) -> bool {
        self.entries.borrow().values().all(|&count| count == 0)
    }

    pub fn enter(self: &Rc<Self>, id: DefId) -> EntryGuard {
        *self.entries.borrow_mut().entry(id).or_insert(0) += 1;
        EntryGuard {
            state: self.clone(),
            id,
        }
    }
}

/// 离开作用域时计数减一，错误路径同样生效。
pub struct EntryGuard {
    state: Rc<MixinState>,
    id: DefId,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        let mut entries = self.state.entries.borrow_mut();
        if let Some(count) = entries.get_mut(&self.id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Dimension;

    fn named(name: &str, default: Option<Node>) -> Parameter {
        Parameter {
            name: Some(name.into()),
            value: default,
            variadic: false,
        }
    }

    fn pattern(value: Node) -> Parameter {
        Parameter {
            name: None,
            value: Some(value),
            variadic: false,
        }
    }

    fn rest(name: Option<&str>) -> Parameter {
        Parameter {
            name: name.map(str::to_string),
            value: None,
            variadic: true,
        }
    }

    fn arg(value: Node) -> Argument {
        Argument { name: None, value }
    }

    fn named_arg(name: &str, value: Node) -> Argument {
        Argument {
            name: Some(name.into()),
            value,
        }
    }

    fn num(value: f64) -> Node {
        Node::Dimension(Dimension::unitless(value))
    }

    fn rendered(block: &Block, name: &str) -> String {
        block.definition(name).unwrap().value.to_css(false)
    }

    #[test]
    fn value_pattern_must_match() {
        let env = ExecEnv::new(false);
        let params = vec![pattern(Node::keyword("false"))];
        assert!(!pattern_match(&env, &params, &[arg(Node::keyword("true"))]).unwrap());
        assert!(pattern_match(&env, &params, &[arg(Node::keyword("false"))]).unwrap());
    }

    #[test]
    fn variadic_accepts_any_arity() {
        let env = ExecEnv::new(false);
        let params = vec![rest(Some("a"))];
        assert!(pattern_match(&env, &params, &[]).unwrap());
        let many: Vec<Argument> = (0..5).map(|i| arg(num(i as f64))).collect();
        assert!(pattern_match(&env, &params, &many).unwrap());
    }

    #[test]
    fn excess_arity_fails_match() {
        let env = ExecEnv::new(false);
        let params = vec![named("a", None)];
        assert!(!pattern_match(&env, &params, &[arg(num(1.0)), arg(num(2.0))]).unwrap());
        assert!(!pattern_match(&env, &params, &[]).unwrap());
    }

    #[test]
    fn bind_named_positional_and_defaults() {
        let env = ExecEnv::new(false);
        let params = vec![named("a", None), named("b", Some(num(2.0))), named("c", None)];
        let args = vec![named_arg("c", num(3.0)), arg(num(1.0))];
        let block = bind(&env, &params, &args, 1).unwrap().unwrap();
        assert_eq!(rendered(&block, "a"), "1");
        assert_eq!(rendered(&block, "b"), "2");
        assert_eq!(rendered(&block, "c"), "3");
        assert_eq!(rendered(&block, "arguments"), "1 2 3");
    }

    #[test]
    fn bind_is_deterministic() {
        let env = ExecEnv::new(false);
        let params = vec![pattern(Node::keyword("dark")), named("x", None), rest(Some("more"))];
        let args = vec![
            arg(Node::keyword("dark")),
            arg(num(1.0)),
            arg(num(2.0)),
            arg(num(3.0)),
        ];
        let first = bind(&env, &params, &args, 1).unwrap().unwrap();
        let second = bind(&env, &params, &args, 1).unwrap().unwrap();
        for name in ["x", "more", "arguments"] {
            assert_eq!(rendered(&first, name), rendered(&second, name));
        }
        assert_eq!(rendered(&first, "more"), "2 3");
        assert_eq!(rendered(&first, "arguments"), "dark 1 2 3");
    }

    #[test]
    fn unknown_named_argument_is_fatal() {
        let env = ExecEnv::new(false);
        let err = bind(&env, &[named("a", None)], &[named_arg("b", num(1.0))], 1).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::ArgNamedNotFound));
    }

    #[test]
    fn missing_required_is_no_bind() {
        let env = ExecEnv::new(false);
        let params = vec![named("a", None), named("b", None)];
        assert!(bind(&env, &params, &[arg(num(1.0))], 1).unwrap().is_none());
    }

    #[test]
    fn entry_guard_restores_counter() {
        let state = MixinState::new();
        let id = DefId::next();
        {
            let _outer = state.enter(id);
            let _inner = state.enter(id);
            assert_eq!(state.entries(id), 2);
        }
        assert_eq!(state.entries(id), 0);
    }

    #[test]
    fn closure_is_captured_once() {
        let state = MixinState::new();
        let id = DefId::next();
        let mut env = ExecEnv::new(false);
        state.capture(id, &env);
        env.push(Rc::new(Block::default()));
        state.capture(id, &env);
        assert!(state.closure(id).unwrap().frames().is_empty());
    }
}
