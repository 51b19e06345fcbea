use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

/// 压缩多余空白字符，主要用于输出压缩模式。
pub fn collapse_whitespace(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                result.push(' ');
                last_was_space = true;
            }
        } else {
            result.push(ch);
            last_was_space = false;
        }
    }
    result.trim().to_string()
}

/// 保持相对缩进的辅助函数。
pub fn indent(level: usize) -> String {
    const INDENT: &str = "  ";
    (0..level).map(|_| INDENT).collect()
}

/// 输出时复用的临时字符串缓冲区。
#[derive(Debug, Default)]
pub struct BufferPool {
    free: RefCell<Vec<String>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buffer = self.free.borrow_mut().pop().unwrap_or_default();
        PooledBuffer { pool: self, buffer }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.free.borrow().len()
    }
}

/// 借出的缓冲区，离开作用域时清空并归还。
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buffer: String,
}

impl Deref for PooledBuffer<'_> {
    type Target = String;

    fn deref(&self) -> &String {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut String {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        self.pool.free.borrow_mut().push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(collapse_whitespace("  a \n\t b  "), "a b");
        assert_eq!(indent(2), "    ");
    }

    #[test]
    fn buffers_return_to_pool_cleared() {
        let pool = BufferPool::new();
        {
            let mut outer = pool.acquire();
            outer.push_str("outer");
            {
                let mut inner = pool.acquire();
                inner.push_str("inner");
            }
            assert_eq!(pool.available(), 1);
            assert_eq!(outer.as_str(), "outer");
        }
        assert_eq!(pool.available(), 2);
        assert!(pool.acquire().is_empty());
    }
}
