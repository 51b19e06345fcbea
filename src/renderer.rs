//! 把求值后的 AST 渲染成 CSS 文本。
//!
//! 先收集所有 `:extend` 声明建立索引，再按嵌套结构驱动 [`CssModel`]：
//! 选择器与外层组合，`@media` 特性与外层特性组合，结果块由输出模型负责提升与去重。

use crate::ast::{Features, Rule, Stylesheet};
use crate::error::{LessError, LessResult};
use crate::extend::ExtendIndex;
use crate::output::{BlockKind, CssModel};
use crate::selector::{combine, combine_one, combine_features, Selector};

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderContext {
    pub compress: bool,
    /// 在每个规则集开头输出来源行号注释。
    pub tracing: bool,
}

pub fn render(ctx: &RenderContext, stylesheet: &Stylesheet) -> LessResult<String> {
    let rules = stylesheet.block.snapshot();
    let mut extends = ExtendIndex::new();
    collect_extends(&rules, &[], &mut extends);
    extends.resolve_extends_of_extends();

    let mut renderer = Renderer {
        ctx: *ctx,
        model: CssModel::new(ctx.compress),
        features: None,
    };
    // 透传的 @import 必须位于样式表开头
    let (imports, rest): (Vec<Rule>, Vec<Rule>) = rules
        .into_iter()
        .partition(|rule| matches!(rule, Rule::Import(_)));
    renderer.render_rules(&imports, &[], &extends)?;
    renderer.render_rules(&rest, &[], &extends)?;
    Ok(renderer.model.to_css())
}

/// 收集规则集上的 extend 声明。`@media` 与条件块内的声明只在各自范围内生效，这里不进入。
fn collect_extends(rules: &[Rule], ancestors: &[Selector], index: &mut ExtendIndex) {
    for rule in rules {
        let Rule::Ruleset(ruleset) = rule else {
            continue;
        };
        let mut combined_all = Vec::new();
        for selector in &ruleset.selectors {
            let combined = combine_one(ancestors, selector);
            for target in &selector.extends {
                for extender in &combined {
                    index.add(extender, target);
                }
            }
            combined_all.extend(combined);
        }
        let children = ruleset.block.snapshot();
        for child in &children {
            if let Rule::Extend(extend) = child {
                for target in &extend.targets {
                    for extender in &combined_all {
                        index.add(extender, target);
                    }
                }
            }
        }
        collect_extends(&children, &combined_all, index);
    }
}

struct Renderer {
    ctx: RenderContext,
    model: CssModel,
    features: Option<Features>,
}

impl Renderer {
    fn render_rules(
        &mut self,
        rules: &[Rule],
        ancestors: &[Selector],
        extends: &ExtendIndex,
    ) -> LessResult<()> {
        let compress = self.ctx.compress;
        for rule in rules {
            match rule {
                Rule::Property(property) => {
                    if !self.model.accepts_property() {
                        return Err(LessError::eval(format!(
                            "属性必须位于选择器块内: {}",
                            property.name
                        )));
                    }
                    self.model.add_property(
                        &property.name,
                        &property.value.to_css(compress),
                        property.important,
                    )?;
                }
                Rule::Ruleset(ruleset) => {
                    let combined = combine(ancestors, &ruleset.selectors);
                    if combined.is_empty() {
                        continue;
                    }
                    let headers = self.headers(extends, &combined);
                    self.model.push(BlockKind::Ruleset, headers)?;
                    if self.ctx.tracing {
                        self.model
                            .add_comment(&format!("/* line {} */", ruleset.line), true)?;
                    }
                    self.render_rules(&ruleset.block.snapshot(), &combined, extends)?;
                    self.model.pop()?;
                }
                Rule::Media(media) => {
                    let features = combine_features(self.features.as_ref(), &media.features);
                    let header = format!("@media {}", features.to_css(compress));
                    let children = media.block.snapshot();
                    let saved = self.features.replace(features);
                    let result =
                        self.render_scoped(BlockKind::Media, header, &children, ancestors, extends);
                    self.features = saved;
                    result?;
                }
                Rule::BlockDirective(directive) => {
                    let header = match &directive.prelude {
                        Some(prelude) => {
                            format!("@{} {}", directive.name, prelude.to_css(compress))
                        }
                        None => format!("@{}", directive.name),
                    };
                    let children = directive.block.snapshot();
                    let ancestors: &[Selector] = if directive.is_conditional() {
                        ancestors
                    } else {
                        &[]
                    };
                    self.render_scoped(
                        BlockKind::BlockDirective,
                        header,
                        &children,
                        ancestors,
                        extends,
                    )?;
                }
                Rule::Directive(directive) => {
                    let text = match &directive.value {
                        Some(value) => format!("@{} {}", directive.name, value.to_css(compress)),
                        None => format!("@{}", directive.name),
                    };
                    self.model.add_directive(&text)?;
                }
                Rule::Import(import) => {
                    let mut text = format!("@import {}", import.path.to_css(compress));
                    if let Some(features) = &import.features {
                        text.push(' ');
                        text.push_str(&features.to_css(compress));
                    }
                    self.model.add_directive(&text)?;
                }
                Rule::Comment(comment) => self.model.add_comment(&comment.text, comment.trace)?,
                Rule::Definition(_)
                | Rule::Mixin(_)
                | Rule::MixinCall(_)
                | Rule::Extend(_) => {}
            }
        }
        Ok(())
    }

    /// `@media` 与条件块：块内的 extend 只作用于块内，外层选择器重新包裹子属性。
    fn render_scoped(
        &mut self,
        kind: BlockKind,
        header: String,
        children: &[Rule],
        ancestors: &[Selector],
        extends: &ExtendIndex,
    ) -> LessResult<()> {
        let mut scoped = extends.clone();
        collect_extends(children, ancestors, &mut scoped);
        scoped.resolve_extends_of_extends();

        self.model.push(kind, vec![header])?;
        if ancestors.is_empty() {
            self.render_rules(children, ancestors, &scoped)?;
        } else {
            let headers = self.headers(&scoped, ancestors);
            self.model.push(BlockKind::Ruleset, headers)?;
            self.render_rules(children, ancestors, &scoped)?;
            self.model.pop()?;
        }
        self.model.pop()
    }

    fn headers(&self, extends: &ExtendIndex, selectors: &[Selector]) -> Vec<String> {
        extends
            .apply(selectors)
            .iter()
            .map(|selector| selector.to_css(self.ctx.compress))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{EvalOptions, Evaluator};
    use crate::importer::MemoryImporter;
    use crate::parser::LessParser;
    use pretty_assertions::assert_eq;

    fn compile(source: &str, ctx: RenderContext) -> LessResult<String> {
        let mut importer = MemoryImporter::new();
        let stylesheet = LessParser::new().parse(source)?;
        let evaluated = Evaluator::new(EvalOptions::default(), &mut importer).evaluate(stylesheet)?;
        render(&ctx, &evaluated)
    }

    fn pretty(source: &str) -> String {
        compile(source, RenderContext::default()).unwrap()
    }

    #[test]
    fn nested_rulesets_are_flattened() {
        assert_eq!(
            pretty(".a { color: red; .b { margin: 0; } padding: 1px; }"),
            ".a {\n  color: red;\n  padding: 1px;\n}\n\n.a .b {\n  margin: 0;\n}"
        );
    }

    #[test]
    fn media_inside_ruleset_wraps_ancestors() {
        assert_eq!(
            pretty(".a { @media screen { @media (min-width: 768px) { color: red; } } }"),
            "@media screen and (min-width: 768px) {\n  .a {\n    color: red;\n  }\n}"
        );
    }

    #[test]
    fn extend_inside_media_stays_scoped() {
        let css = pretty(".a { color: red; }\n@media print { .a { x: 1; } .b { &:extend(.a); } }");
        assert_eq!(
            css,
            ".a {\n  color: red;\n}\n\n@media print {\n  .a, .b {\n    x: 1;\n  }\n}"
        );
    }

    #[test]
    fn keyframes_reset_ancestors() {
        assert_eq!(
            pretty("@keyframes spin { from { opacity: 0; } to { opacity: 1; } }"),
            "@keyframes spin {\n  from {\n    opacity: 0;\n  }\n  to {\n    opacity: 1;\n  }\n}"
        );
    }

    #[test]
    fn top_level_property_is_user_error() {
        let err = compile("color: red;", RenderContext::default()).unwrap_err();
        assert!(matches!(err, LessError::Eval { .. }));
    }

    #[test]
    fn tracing_prefixes_line_comments() {
        let css = compile(
            "\n.a { color: red; }",
            RenderContext {
                compress: false,
                tracing: true,
            },
        )
        .unwrap();
        assert_eq!(css, ".a {\n  /* line 2 */\n  color: red;\n}");
    }

    #[test]
    fn compressed_output() {
        let css = compile(
            ".a, .b { color: #ff0000; margin: 0 auto; }\n@media screen { .c { x: 1; } }",
            RenderContext {
                compress: true,
                tracing: false,
            },
        )
        .unwrap();
        assert_eq!(css, ".a,.b{color:#ff0000;margin:0 auto}@media screen{.c{x:1}}");
    }
}
