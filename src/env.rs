//! 求值期间的作用域栈。
//!
//! 帧以持久单链表保存，`fork` 只复制栈顶指针；各帧的 `Block` 通过 `Rc`
//! 共享，因此分叉出的栈可以独立 push/pop 而不影响原栈。

use crate::ast::{Block, Definition};
use crate::error::{ErrorKind, LessError, LessResult, LessWarning};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug)]
struct Frame {
    block: Rc<Block>,
    parent: Option<Rc<Frame>>,
}

/// 定义处捕获的作用域快照，捕获后不再改变。
#[derive(Debug, Clone, Default)]
pub struct Closure {
    top: Option<Rc<Frame>>,
}

impl Closure {
    /// 自底向上的帧列表。
    pub fn frames(&self) -> Vec<Rc<Block>> {
        collect_frames(&self.top)
    }
}

#[derive(Debug, Clone)]
pub struct ExecEnv {
    top: Option<Rc<Frame>>,
    depth: usize,
    strict: bool,
    warnings: Rc<RefCell<Vec<LessWarning>>>,
}

impl ExecEnv {
    pub fn new(strict: bool) -> Self {
        Self {
            top: None,
            depth: 0,
            strict,
            warnings: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn push(&mut self, block: Rc<Block>) {
        let parent = self.top.take();
        self.top = Some(Rc::new(Frame { block, parent }));
        self.depth += 1;
    }

    pub fn pop(&mut self) -> LessResult<Rc<Block>> {
        let frame = self
            .top
            .take()
            .ok_or_else(|| LessError::internal("作用域栈下溢"))?;
        self.top = frame.parent.clone();
        self.depth -= 1;
        Ok(frame.block.clone())
    }

    pub fn top(&self) -> Option<Rc<Block>> {
        self.top.as_ref().map(|frame| frame.block.clone())
    }

    /// 独立的栈副本，警告通道仍然共享。
    pub fn fork(&self) -> ExecEnv {
        self.clone()
    }

    pub fn capture(&self) -> Closure {
        Closure {
            top: self.top.clone(),
        }
    }

    /// 把闭包的帧按原顺序叠到当前栈顶，之后压入的参数帧位于其上。
    pub fn append(&mut self, closure: &Closure) {
        for block in closure.frames() {
            self.push(block);
        }
    }

    /// 自顶向下查找，返回第一个定义了该名字的帧中的定义。
    pub fn resolve_definition(&self, name: &str) -> Option<Rc<Definition>> {
        let mut cursor = self.top.as_ref();
        while let Some(frame) = cursor {
            if let Some(def) = frame.block.definition(name) {
                return Some(def);
            }
            cursor = frame.parent.as_ref();
        }
        None
    }

    /// 自顶向下逐帧搜索，某一帧产生了结果就停止，不与外层合并。
    pub fn resolve_mixins<T, F>(&self, mut search: F) -> LessResult<Vec<T>>
    where
        F: FnMut(&Rc<Block>) -> LessResult<Vec<T>>,
    {
        let mut cursor = self.top.as_ref();
        while let Some(frame) = cursor {
            let found = search(&frame.block)?;
            if !found.is_empty() {
                return Ok(found);
            }
            cursor = frame.parent.as_ref();
        }
        Ok(Vec::new())
    }

    /// 记录可恢复的问题；严格模式下直接返回对应错误。
    pub fn warn<S: Into<String>>(&self, kind: ErrorKind, message: S) -> LessResult<()> {
        let warning = LessWarning::new(kind, message);
        if self.strict {
            return Err(warning.into_error());
        }
        self.warnings.borrow_mut().push(warning);
        Ok(())
    }

    pub fn take_warnings(&self) -> Vec<LessWarning> {
        std::mem::take(&mut *self.warnings.borrow_mut())
    }

    pub fn warnings(&self) -> Vec<LessWarning> {
        self.warnings.borrow().clone()
    }
}

fn collect_frames(top: &Option<Rc<Frame>>) -> Vec<Rc<Block>> {
    let mut frames = Vec::new();
    let mut cursor = top.as_ref();
    while let Some(frame) = cursor {
        frames.push(frame.block.clone());
        cursor = frame.parent.as_ref();
    }
    frames.reverse();
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Dimension, Node, Rule};

    fn block_with(name: &str, value: f64) -> Rc<Block> {
        Rc::new(Block::new(vec![Rule::Definition(Rc::new(Definition::new(
            name,
            Node::Dimension(Dimension::unitless(value)),
            0,
        )))]))
    }

    fn value_of(env: &ExecEnv, name: &str) -> Option<Node> {
        env.resolve_definition(name).map(|def| def.value.clone())
    }

    #[test]
    fn nearest_frame_shadows_outer() {
        let mut env = ExecEnv::new(false);
        env.push(block_with("a", 1.0));
        env.push(block_with("a", 2.0));
        assert_eq!(
            value_of(&env, "a"),
            Some(Node::Dimension(Dimension::unitless(2.0)))
        );
        env.pop().unwrap();
        assert_eq!(
            value_of(&env, "a"),
            Some(Node::Dimension(Dimension::unitless(1.0)))
        );
    }

    #[test]
    fn fork_is_independent() {
        let mut env = ExecEnv::new(false);
        env.push(block_with("a", 1.0));
        let mut forked = env.fork();
        forked.push(block_with("b", 2.0));
        assert!(value_of(&forked, "b").is_some());
        assert!(value_of(&env, "b").is_none());
        assert_eq!(env.depth(), 1);
        assert_eq!(forked.depth(), 2);
    }

    #[test]
    fn closure_frames_sit_below_new_frames() {
        let mut definition_site = ExecEnv::new(false);
        definition_site.push(block_with("x", 10.0));
        let closure = definition_site.capture();

        let mut call_site = ExecEnv::new(false);
        call_site.push(block_with("x", 1.0));
        call_site.append(&closure);
        assert_eq!(
            value_of(&call_site, "x"),
            Some(Node::Dimension(Dimension::unitless(10.0)))
        );
        call_site.push(block_with("x", 99.0));
        assert_eq!(
            value_of(&call_site, "x"),
            Some(Node::Dimension(Dimension::unitless(99.0)))
        );
    }

    #[test]
    fn resolve_mixins_stops_at_first_hit() {
        let mut env = ExecEnv::new(false);
        env.push(block_with("outer", 1.0));
        env.push(block_with("inner", 2.0));
        let mut visited = 0;
        let found = env
            .resolve_mixins(|block| {
                visited += 1;
                Ok(block.definition("inner").into_iter().collect())
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(visited, 1);
    }

    #[test]
    fn strict_mode_promotes_warnings() {
        let env = ExecEnv::new(true);
        let err = env.warn(ErrorKind::IncompatibleUnits, "单位不兼容").unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::IncompatibleUnits));

        let lenient = ExecEnv::new(false);
        lenient.warn(ErrorKind::ArgTooMany, "参数过多").unwrap();
        assert_eq!(lenient.fork().take_warnings().len(), 1);
        assert!(lenient.warnings().is_empty());
    }

    #[test]
    fn pop_on_empty_stack_is_internal_error() {
        let mut env = ExecEnv::new(false);
        assert!(matches!(env.pop(), Err(LessError::Internal(_))));
    }
}
