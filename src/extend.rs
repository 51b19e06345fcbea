//! `:extend` 索引。
//!
//! 声明按目标选择器的片段序列存入两棵前缀树：精确树要求整条选择器相同，
//! 部分树（`all`）匹配任意连续子序列。共享前缀的目标只比较一次。

use crate::selector::{Combinator, Element, ElementKind, ExtendTarget, Selector};
use indexmap::IndexMap;
use tracing::trace;

type PartKey = (Option<Combinator>, ElementKind);

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: IndexMap<PartKey, TrieNode>,
    replacements: Vec<Selector>,
}

impl TrieNode {
    fn insert(&mut self, target: &Selector, extender: &Selector) -> bool {
        let mut node = self;
        for (idx, element) in target.elements.iter().enumerate() {
            node = node.children.entry(part_key(element, idx == 0)).or_default();
        }
        let rendered = extender.to_css(false);
        if node
            .replacements
            .iter()
            .any(|existing| existing.to_css(false) == rendered)
        {
            return false;
        }
        node.replacements.push(Selector::new(extender.elements.clone()));
        true
    }
}

fn part_key(element: &Element, first: bool) -> PartKey {
    let combinator = if first { None } else { element.combinator };
    (combinator, element.kind.clone())
}

#[derive(Debug, Clone, Default)]
pub struct ExtendIndex {
    exact: TrieNode,
    partial: TrieNode,
    /// 扩展者输出文本 → 它声明的目标，用于解析“扩展的扩展”。
    owners: IndexMap<String, Vec<ExtendTarget>>,
    declared: Vec<(Selector, ExtendTarget)>,
}

impl ExtendIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    /// 登记 `extender` 扩展 `target`。
    pub fn add(&mut self, extender: &Selector, target: &ExtendTarget) {
        if target.selector.elements.is_empty() || extender.elements.is_empty() {
            return;
        }
        let tree = if target.all {
            &mut self.partial
        } else {
            &mut self.exact
        };
        if !tree.insert(&target.selector, extender) {
            return;
        }
        trace!(
            extender = %extender.to_css(false),
            target = %target.selector.to_css(false),
            all = target.all,
            "登记 extend"
        );
        self.owners
            .entry(extender.to_css(false))
            .or_default()
            .push(target.clone());
        self.declared
            .push((Selector::new(extender.elements.clone()), target.clone()));
    }

    /// 精确匹配：返回需要追加到该选择器上的扩展者。
    pub fn resolve(&self, selector: &Selector) -> Vec<Selector> {
        let mut node = &self.exact;
        for (idx, element) in selector.elements.iter().enumerate() {
            match node.children.get(&part_key(element, idx == 0)) {
                Some(next) => node = next,
                None => return Vec::new(),
            }
        }
        node.replacements.clone()
    }

    /// 子序列匹配：每个匹配区间与每个扩展者各生成一条新选择器。
    pub fn search_replace(&self, selector: &Selector) -> Vec<Selector> {
        let parts = &selector.elements;
        let mut results = Vec::new();
        for start in 0..parts.len() {
            let mut node = &self.partial;
            for end in start..parts.len() {
                match node.children.get(&part_key(&parts[end], end == start)) {
                    Some(next) => node = next,
                    None => break,
                }
                for replacement in &node.replacements {
                    let mut elements = parts[..start].to_vec();
                    let mut spliced = replacement.elements.clone();
                    if let Some(first) = spliced.first_mut() {
                        first.combinator = parts[start].combinator;
                    }
                    elements.append(&mut spliced);
                    elements.extend_from_slice(&parts[end + 1..]);
                    results.push(Selector::new(elements));
                }
            }
        }
        results
    }

    /// 扩展者本身又是别的 extend 的目标时，把那些目标也登记给它，直到不再变化。
    pub fn resolve_extends_of_extends(&mut self) {
        loop {
            let mut pending = Vec::new();
            for (extender, target) in &self.declared {
                let Some(inherited) = self.owners.get(&target.selector.to_css(false)) else {
                    continue;
                };
                for next in inherited {
                    if next.selector.to_css(false) == extender.to_css(false) {
                        continue;
                    }
                    pending.push((extender.clone(), next.clone()));
                }
            }
            let before = self.declared.len();
            for (extender, target) in pending {
                self.add(&extender, &target);
            }
            if self.declared.len() == before {
                break;
            }
        }
    }

    /// 选择器列表加上所有扩展结果，按输出文本去重并保持顺序。
    pub fn apply(&self, selectors: &[Selector]) -> Vec<Selector> {
        if self.is_empty() {
            return selectors.to_vec();
        }
        let mut seen = IndexMap::new();
        for selector in selectors {
            let mut candidates = vec![selector.clone()];
            candidates.extend(self.resolve(selector));
            candidates.extend(self.search_replace(selector));
            for candidate in candidates {
                seen.entry(candidate.to_css(false)).or_insert(candidate);
            }
        }
        seen.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{parse_extend_targets, parse_selector};
    use pretty_assertions::assert_eq;

    fn sel(text: &str) -> Selector {
        parse_selector(text).unwrap()
    }

    fn declare(index: &mut ExtendIndex, extender: &str, targets: &str) {
        for target in parse_extend_targets(targets).unwrap() {
            index.add(&sel(extender), &target);
        }
    }

    fn render(selectors: Vec<Selector>) -> Vec<String> {
        selectors.into_iter().map(|s| s.to_css(false)).collect()
    }

    #[test]
    fn exact_match_requires_whole_selector() {
        let mut index = ExtendIndex::new();
        declare(&mut index, ".x", ".b .c");
        assert_eq!(render(index.resolve(&sel(".b .c"))), vec![".x"]);
        assert!(index.resolve(&sel(".a .b .c")).is_empty());
        assert!(index.resolve(&sel(".b")).is_empty());
    }

    #[test]
    fn partial_match_splices_subsequence() {
        let mut index = ExtendIndex::new();
        declare(&mut index, ".x", ".b .c all");
        assert_eq!(render(index.search_replace(&sel(".a .b .c"))), vec![".a .x"]);
        assert_eq!(render(index.search_replace(&sel(".b .c > .d"))), vec![".x > .d"]);
        assert_eq!(render(index.search_replace(&sel(".a > .b .c"))), vec![".a > .x"]);
    }

    #[test]
    fn partial_matches_compound_element() {
        let mut index = ExtendIndex::new();
        declare(&mut index, ".y", ".b all");
        assert_eq!(
            render(index.apply(&[sel(".a.b"), sel(".b:hover")])),
            vec![".a.b", ".a.y", ".b:hover", ".y:hover"]
        );
    }

    #[test]
    fn extends_of_extends_are_transitive() {
        let mut index = ExtendIndex::new();
        declare(&mut index, ".x", ".b .c all");
        declare(&mut index, ".replace", ".x");
        index.resolve_extends_of_extends();
        assert_eq!(
            render(index.apply(&[sel(".a .b .c")])),
            vec![".a .b .c", ".a .x", ".a .replace"]
        );
        assert_eq!(render(index.apply(&[sel(".x")])), vec![".x", ".replace"]);
    }

    #[test]
    fn chained_exact_extends_reach_fixpoint() {
        let mut index = ExtendIndex::new();
        declare(&mut index, ".b", ".a");
        declare(&mut index, ".c", ".b");
        declare(&mut index, ".d", ".c");
        index.resolve_extends_of_extends();
        assert_eq!(render(index.apply(&[sel(".a")])), vec![".a", ".b", ".c", ".d"]);
    }

    #[test]
    fn duplicate_declarations_are_ignored() {
        let mut index = ExtendIndex::new();
        declare(&mut index, ".x", ".a");
        declare(&mut index, ".x", ".a");
        assert_eq!(render(index.apply(&[sel(".a")])), vec![".a", ".x"]);
    }
}
