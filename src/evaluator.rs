//! 语义求值：展开 `@import`、mixin 调用，计算变量与表达式。
//!
//! 每个块分两个阶段求值。第一阶段捕获块内 mixin/规则集的闭包并展开 mixin 调用，
//! 把结果拼回块中，使返回的定义在同一帧内可见；第二阶段逐条求值剩余规则。

use crate::ast::*;
use crate::env::ExecEnv;
use crate::error::{ErrorKind, LessError, LessResult, LessWarning};
use crate::importer::Importer;
use crate::mixin::{self, MixinMatch, MixinState};
use crate::selector::Selector;
use crate::value;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// 求值阶段的开关。
#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub strict: bool,
    pub hide_warnings: bool,
    /// 在输出中插入行号与警告注释。
    pub tracing: bool,
    pub mixin_recursion_limit: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            strict: false,
            hide_warnings: false,
            tracing: false,
            mixin_recursion_limit: 64,
        }
    }
}

enum ImportAction {
    Keep,
    Skip,
    Inline(Vec<Rule>),
}

pub struct Evaluator<'a> {
    options: EvalOptions,
    importer: &'a mut dyn Importer,
    mixins: Rc<MixinState>,
    warnings: Vec<LessWarning>,
    import_stack: Vec<PathBuf>,
    current_dir: Option<PathBuf>,
}

impl<'a> Evaluator<'a> {
    pub fn new(options: EvalOptions, importer: &'a mut dyn Importer) -> Self {
        Self {
            options,
            importer,
            mixins: MixinState::new(),
            warnings: Vec::new(),
            import_stack: Vec::new(),
            current_dir: None,
        }
    }

    /// 设置入口文件；相对 `@import` 以它所在目录为起点。
    pub fn with_entry(mut self, path: &Path) -> Self {
        self.current_dir = path.parent().map(Path::to_path_buf);
        self.import_stack.push(path.to_path_buf());
        self
    }

    pub fn with_current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn warnings(&self) -> &[LessWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<LessWarning> {
        std::mem::take(&mut self.warnings)
    }

    pub fn evaluate(&mut self, stylesheet: Stylesheet) -> LessResult<Stylesheet> {
        let mut env = ExecEnv::new(self.options.strict);
        let root = stylesheet.block;
        env.push(root.clone());
        let current_dir = self.current_dir.clone();
        self.expand_imports(&env, &root, current_dir.as_deref())?;
        env.pop()?;

        let rules = self.eval_block(&mut env, Rc::new(root.copy()), false)?;
        self.drain_warnings(&env, &mut Vec::new());
        Ok(Stylesheet::new(Block::new(rules)))
    }

    fn expand_imports(
        &mut self,
        env: &ExecEnv,
        block: &Rc<Block>,
        current_dir: Option<&Path>,
    ) -> LessResult<()> {
        let mut index = 0;
        while let Some(rule) = block.get(index) {
            match &rule {
                Rule::Import(import) => match self.load_import(env, import, current_dir)? {
                    ImportAction::Keep => index += 1,
                    ImportAction::Skip => block.splice(index, Vec::new()),
                    ImportAction::Inline(rules) => {
                        let count = rules.len();
                        block.splice(index, rules);
                        index += count;
                    }
                },
                Rule::Ruleset(ruleset) => {
                    self.expand_imports(env, &ruleset.block, current_dir)?;
                    index += 1;
                }
                Rule::Mixin(mixin) => {
                    self.expand_imports(env, &mixin.block, current_dir)?;
                    index += 1;
                }
                Rule::Media(media) => {
                    self.expand_imports(env, &media.block, current_dir)?;
                    index += 1;
                }
                Rule::BlockDirective(directive) => {
                    self.expand_imports(env, &directive.block, current_dir)?;
                    index += 1;
                }
                _ => index += 1,
            }
        }
        Ok(())
    }

    fn load_import(
        &mut self,
        env: &ExecEnv,
        import: &Import,
        current_dir: Option<&Path>,
    ) -> LessResult<ImportAction> {
        let path = value::eval(env, &import.path)?;
        if matches!(path, Node::Url(_)) || import.features.is_some() || import.options.css {
            return Ok(ImportAction::Keep);
        }
        let target = value::text_of(&path);
        let remote = ["http://", "https://", "//"]
            .iter()
            .any(|prefix| target.starts_with(prefix));
        if remote || (target.ends_with(".css") && !import.options.less) {
            return Ok(ImportAction::Keep);
        }

        let frame = format!("@import \"{target}\"");
        let resolved = match self.importer.resolve_path(&target, current_dir) {
            Ok(resolved) => resolved,
            Err(err) if import.options.optional => {
                debug!(target = %target, error = %err, "跳过可选的 @import");
                return Ok(ImportAction::Skip);
            }
            Err(err) => return Err(err.with_frame(frame)),
        };
        if self.importer.should_suppress_import(&resolved) && !import.options.multiple {
            debug!(path = %resolved.display(), "@import 已导入过，跳过");
            return Ok(ImportAction::Skip);
        }
        if self.import_stack.contains(&resolved) {
            return Err(LessError::kind(
                ErrorKind::Import,
                format!("检测到循环导入: {}", resolved.display()),
            )
            .with_frame(frame));
        }

        self.importer.record_import(&resolved);
        let stylesheet = self
            .importer
            .load_source(&resolved)
            .map_err(|err| err.with_frame(frame.clone()))?;
        debug!(path = %resolved.display(), rules = stylesheet.block.len(), "展开 @import");

        self.import_stack.push(resolved.clone());
        let result = self.expand_imports(env, &stylesheet.block, resolved.parent());
        self.import_stack.pop();
        result.map_err(|err| err.with_frame(frame))?;

        let mut rules = Vec::new();
        if self.options.tracing {
            rules.push(trace_comment(format!("/* @import {} */", resolved.display())));
        }
        rules.extend(stylesheet.block.snapshot());
        Ok(ImportAction::Inline(rules))
    }

    /// 求值一个块并返回输出规则。`keep_definitions` 为真时保留定义与 mixin，
    /// 用于把 mixin 体的结果交回调用方。
    fn eval_block(
        &mut self,
        env: &mut ExecEnv,
        block: Rc<Block>,
        keep_definitions: bool,
    ) -> LessResult<Vec<Rule>> {
        env.push(block.clone());
        let result = self.eval_pushed(env, &block, keep_definitions);
        env.pop()?;
        result
    }

    fn eval_pushed(
        &mut self,
        env: &mut ExecEnv,
        block: &Rc<Block>,
        keep_definitions: bool,
    ) -> LessResult<Vec<Rule>> {
        // 每次经过定义处都换上新的 site，闭包属于这一次的作用域
        for index in 0..block.len() {
            let revisited = match block.get(index) {
                Some(Rule::Mixin(mixin)) => {
                    let mixin = Rc::new(mixin.revisit());
                    self.mixins.capture(mixin.site, env);
                    Rule::Mixin(mixin)
                }
                Some(Rule::Ruleset(ruleset)) => {
                    let ruleset = Rc::new(ruleset.revisit());
                    self.mixins.capture(ruleset.site, env);
                    Rule::Ruleset(ruleset)
                }
                _ => continue,
            };
            block.splice(index, vec![revisited]);
        }

        let mut index = 0;
        while let Some(rule) = block.get(index) {
            let Rule::MixinCall(call) = rule else {
                index += 1;
                continue;
            };
            let mut produced = self.call_mixin(env, &call)?;
            produced.retain(|rule| match rule {
                Rule::Definition(def) => block.definition(&def.name).is_none(),
                _ => true,
            });
            if self.options.tracing {
                produced.insert(
                    0,
                    trace_comment(format!(
                        "/* mixin {} line {} */",
                        call.selector.to_css(false),
                        call.line
                    )),
                );
            }
            let count = produced.len();
            block.splice(index, produced);
            index += count;
        }

        let mut output = Vec::new();
        for rule in block.snapshot() {
            self.eval_rule(env, rule, keep_definitions, &mut output)?;
            self.drain_warnings(env, &mut output);
        }
        Ok(output)
    }

    fn eval_rule(
        &mut self,
        env: &mut ExecEnv,
        rule: Rule,
        keep_definitions: bool,
        output: &mut Vec<Rule>,
    ) -> LessResult<()> {
        match rule {
            Rule::Property(property) => {
                output.push(Rule::Property(Rc::new(Property {
                    name: value::interpolate(env, &property.name)?,
                    value: value::eval(env, &property.value)?,
                    important: property.important,
                    line: property.line,
                })));
            }
            Rule::Definition(def) => {
                if self.options.tracing && !keep_definitions {
                    output.push(trace_comment(format!("/* @{} line {} */", def.name, def.line)));
                }
                if keep_definitions {
                    let evaluated = value::eval(env, &def.value)?;
                    output.push(Rule::Definition(Rc::new(Definition::new(
                        def.name.clone(),
                        evaluated,
                        def.line,
                    ))));
                }
            }
            Rule::Ruleset(ruleset) => {
                if let Some(guard) = &ruleset.guard {
                    if !value::eval_condition(env, guard)? {
                        return Ok(());
                    }
                }
                let selectors = ruleset
                    .selectors
                    .iter()
                    .map(|selector| selector.map_text(|text| value::interpolate(env, text)))
                    .collect::<LessResult<Vec<_>>>()?;
                let rules = self.eval_block(env, Rc::new(ruleset.block.copy()), false)?;
                output.push(Rule::Ruleset(Rc::new(Ruleset {
                    id: ruleset.id,
                    site: ruleset.site,
                    selectors,
                    guard: None,
                    block: Rc::new(Block::new(rules)),
                    line: ruleset.line,
                })));
            }
            Rule::Mixin(_) => {
                if keep_definitions {
                    output.push(rule);
                }
            }
            Rule::Media(media) => {
                let features = eval_features(env, &media.features)?;
                let rules = self.eval_block(env, Rc::new(media.block.copy()), false)?;
                output.push(Rule::Media(Rc::new(Media {
                    features,
                    block: Rc::new(Block::new(rules)),
                    line: media.line,
                })));
            }
            Rule::BlockDirective(directive) => {
                let prelude = match &directive.prelude {
                    Some(Node::Anonymous(text)) => {
                        Some(Node::Anonymous(value::interpolate(env, text)?))
                    }
                    Some(other) => Some(value::eval(env, other)?),
                    None => None,
                };
                let rules = self.eval_block(env, Rc::new(directive.block.copy()), false)?;
                output.push(Rule::BlockDirective(Rc::new(BlockDirective {
                    name: directive.name.clone(),
                    prelude,
                    block: Rc::new(Block::new(rules)),
                    line: directive.line,
                })));
            }
            Rule::Directive(directive) => {
                let value = directive
                    .value
                    .as_ref()
                    .map(|value| value::eval(env, value))
                    .transpose()?;
                output.push(Rule::Directive(Rc::new(Directive {
                    name: directive.name.clone(),
                    value,
                    line: directive.line,
                })));
            }
            Rule::Import(import) => {
                let features = import
                    .features
                    .as_ref()
                    .map(|features| eval_features(env, features))
                    .transpose()?;
                output.push(Rule::Import(Rc::new(Import {
                    path: value::eval(env, &import.path)?,
                    features,
                    options: import.options,
                    line: import.line,
                })));
            }
            Rule::MixinCall(_) => {}
            Rule::Extend(_) | Rule::Comment(_) => output.push(rule),
        }
        Ok(())
    }

    fn call_mixin(&mut self, env: &ExecEnv, call: &MixinCall) -> LessResult<Vec<Rule>> {
        let path = call.selector.mixin_path().ok_or_else(|| {
            LessError::kind(
                ErrorKind::MixinUndefined,
                format!("`{}` 不是合法的 mixin 调用", call.selector.to_css(false)),
            )
        })?;
        let args = call
            .args
            .iter()
            .map(|arg| {
                Ok(Argument {
                    name: arg.name.clone(),
                    value: value::eval(env, &arg.value)?,
                })
            })
            .collect::<LessResult<Vec<_>>>()?;
        let call_repr = describe_call(&call.selector, &args);

        let matches = mixin::resolve(env, &path, &args)?;
        if matches.is_empty() {
            return Err(LessError::kind(
                ErrorKind::MixinUndefined,
                format!("未找到匹配的 mixin `{call_repr}`"),
            ));
        }

        let mut output = Vec::new();
        let mut bound = false;
        for found in matches {
            let id = found.id();
            let mut scope = env.fork();
            match self.mixins.closure(found.site()) {
                Some(closure) => scope.append(&closure),
                None => {
                    for namespace in found.namespaces() {
                        scope.push(namespace.clone());
                    }
                }
            }

            let body = match &found {
                MixinMatch::Mixin { mixin, .. } => {
                    let Some(bindings) = mixin::bind(env, &mixin.params, &args, call.line)?
                    else {
                        continue;
                    };
                    bound = true;
                    scope.push(Rc::new(bindings));
                    if let Some(guard) = &mixin.guard {
                        if !value::eval_condition(&scope, guard)? {
                            continue;
                        }
                    }
                    mixin.block.clone()
                }
                MixinMatch::Ruleset { ruleset, .. } => {
                    bound = true;
                    if let Some(guard) = &ruleset.guard {
                        if !value::eval_condition(&scope, guard)? {
                            continue;
                        }
                    }
                    ruleset.block.clone()
                }
            };

            if self.mixins.entries(id) >= self.options.mixin_recursion_limit {
                return Err(LessError::kind(
                    ErrorKind::MixinRecursion,
                    format!(
                        "mixin `{call_repr}` 递归超过 {} 层",
                        self.options.mixin_recursion_limit
                    ),
                ));
            }
            let _entry = self.mixins.enter(id);
            debug!(mixin = %call_repr, depth = scope.depth(), "展开 mixin");
            let rules = self
                .eval_block(&mut scope, Rc::new(body.copy()), true)
                .map_err(|err| err.with_frame(call_repr.clone()))?;
            output.extend(rules);
        }

        // 守卫不成立只是不执行，参数无法绑定才是错误
        if !bound {
            return Err(LessError::kind(
                ErrorKind::MixinUndefined,
                format!("`{call_repr}` 没有可以绑定参数的定义"),
            ));
        }
        if call.important {
            output = mark_important(output);
        }
        Ok(output)
    }

    fn drain_warnings(&mut self, env: &ExecEnv, output: &mut Vec<Rule>) {
        for warning in env.take_warnings() {
            if self.options.tracing && !self.options.hide_warnings {
                output.push(trace_comment(format!("/* {warning} */")));
            }
            self.warnings.push(warning);
        }
    }
}

fn trace_comment(text: String) -> Rule {
    Rule::Comment(Rc::new(Comment { text, trace: true }))
}

/// 带实参值的调用描述，用于错误路径。
fn describe_call(selector: &Selector, args: &[Argument]) -> String {
    let args = args
        .iter()
        .map(|arg| match &arg.name {
            Some(name) => format!("@{name}: {}", arg.value.to_css(false)),
            None => arg.value.to_css(false),
        })
        .collect::<Vec<_>>()
        .join("; ");
    format!("{}({args})", selector.to_css(false))
}

fn eval_features(env: &ExecEnv, features: &Features) -> LessResult<Features> {
    let mut queries = Vec::with_capacity(features.queries.len());
    for query in &features.queries {
        let mut terms = Vec::with_capacity(query.terms.len());
        for term in &query.terms {
            terms.push(match term {
                MediaTerm::Keyword(text) => MediaTerm::Keyword(value::interpolate(env, text)?),
                MediaTerm::Feature { name, value } => MediaTerm::Feature {
                    name: name.clone(),
                    value: value
                        .as_ref()
                        .map(|value| value::eval(env, value))
                        .transpose()?,
                },
                MediaTerm::Value(node) => MediaTerm::Value(value::eval(env, node)?),
            });
        }
        queries.push(FeatureQuery { terms });
    }
    Ok(Features { queries })
}

/// `.mixin() !important` 把结果中的所有属性标记为 important。
fn mark_important(rules: Vec<Rule>) -> Vec<Rule> {
    rules
        .into_iter()
        .map(|rule| match rule {
            Rule::Property(property) => Rule::Property(Rc::new(Property {
                important: true,
                ..(*property).clone()
            })),
            Rule::Ruleset(ruleset) => Rule::Ruleset(Rc::new(Ruleset {
                id: ruleset.id,
                site: ruleset.site,
                selectors: ruleset.selectors.clone(),
                guard: None,
                block: Rc::new(Block::new(mark_important(ruleset.block.snapshot()))),
                line: ruleset.line,
            })),
            Rule::Media(media) => Rule::Media(Rc::new(Media {
                features: media.features.clone(),
                block: Rc::new(Block::new(mark_important(media.block.snapshot()))),
                line: media.line,
            })),
            Rule::BlockDirective(directive) => Rule::BlockDirective(Rc::new(BlockDirective {
                name: directive.name.clone(),
                prelude: directive.prelude.clone(),
                block: Rc::new(Block::new(mark_important(directive.block.snapshot()))),
                line: directive.line,
            })),
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::MemoryImporter;
    use crate::parser::LessParser;
    use crate::renderer::{render, RenderContext};
    use pretty_assertions::assert_eq;

    fn run_with(
        source: &str,
        options: EvalOptions,
        importer: &mut dyn Importer,
    ) -> LessResult<(String, Vec<LessWarning>)> {
        let stylesheet = LessParser::new().parse(source)?;
        let mut evaluator = Evaluator::new(options, importer);
        let evaluated = evaluator.evaluate(stylesheet)?;
        let css = render(&RenderContext::default(), &evaluated)?;
        Ok((css, evaluator.take_warnings()))
    }

    fn run(source: &str) -> LessResult<String> {
        let mut importer = MemoryImporter::new();
        run_with(source, EvalOptions::default(), &mut importer).map(|(css, _)| css)
    }

    #[test]
    fn recursion_limit_raises_one_error() {
        let mut importer = MemoryImporter::new();
        let stylesheet = LessParser::new()
            .parse(".loop() { .loop(); }\n.a { .loop(); }")
            .unwrap();
        let mut evaluator = Evaluator::new(
            EvalOptions {
                mixin_recursion_limit: 8,
                ..EvalOptions::default()
            },
            &mut importer,
        );
        let err = evaluator.evaluate(stylesheet).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::MixinRecursion));
        assert_eq!(err.call_stack().len(), 8);
        assert!(evaluator.mixins.is_idle());
    }

    #[test]
    fn mixin_sees_definition_scope_first() {
        let css = run("@c: blue;\n.m() { color: @c; }\n.a { @c: red; .m(); }").unwrap();
        assert_eq!(css, ".a {\n  color: blue;\n}");
    }

    #[test]
    fn mixin_falls_back_to_caller_scope() {
        let css = run(".m() { width: @w; }\n.a { @w: 10px; .m(); }").unwrap();
        assert_eq!(css, ".a {\n  width: 10px;\n}");
    }

    #[test]
    fn returned_definitions_do_not_override_caller() {
        let css =
            run(".m() { @r: 1; @s: 2; }\n.a { @r: 5; .m(); one: @r; two: @s; }").unwrap();
        assert_eq!(css, ".a {\n  one: 5;\n  two: 2;\n}");
    }

    #[test]
    fn guards_select_overload() {
        let css = run(
            ".m(@a) when (@a > 10) { size: big; }\n.m(@a) when not (@a > 10) { size: small; }\n.x { .m(20); }\n.y { .m(5); }",
        )
        .unwrap();
        assert_eq!(css, ".x {\n  size: big;\n}\n\n.y {\n  size: small;\n}");
    }

    #[test]
    fn failed_guard_is_not_an_error() {
        let css = run(".m(@a) when (@a > 10) { size: big; }\n.y { .m(5); color: red; }").unwrap();
        assert_eq!(css, ".y {\n  color: red;\n}");
    }

    #[test]
    fn nested_mixin_sees_each_calls_arguments() {
        let css = run(
            ".outer(@x) { .inner() { v: @x; } .inner(); }\n.a { .outer(1); }\n.b { .outer(2); }",
        )
        .unwrap();
        assert_eq!(css, ".a {\n  v: 1;\n}\n\n.b {\n  v: 2;\n}");
    }

    #[test]
    fn important_reaches_nested_media() {
        let css = run(".m() { @media print { c: 1; } }\n.x { .m() !important; }").unwrap();
        assert_eq!(css, "@media print {\n  .x {\n    c: 1 !important;\n  }\n}");
    }

    #[test]
    fn returned_definition_errors_are_reported() {
        let err = run(".m() { @r: @undefined; }\n.x { .m(); v: @r; }").unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::VarUndefined));
        assert!(err.to_string().contains("@undefined"));
        assert_eq!(err.call_stack(), [".m()".to_string()]);
    }

    #[test]
    fn namespaced_call_and_important() {
        let css = run("#ns { .m() { color: red; } }\n.a { #ns > .m() !important; }").unwrap();
        assert_eq!(css, ".a {\n  color: red !important;\n}");
    }

    #[test]
    fn undefined_mixin_is_fatal() {
        let err = run(".a { .missing(); }").unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::MixinUndefined));
    }

    #[test]
    fn excess_arity_rejects_overload() {
        let err = run(".n(@a) { w: @a; }\n.a { .n(1; 2); }").unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::MixinUndefined));
    }

    #[test]
    fn imports_inline_once() {
        let mut importer = MemoryImporter::new()
            .with_file("vars.less", "@brand: #333;")
            .with_file("base.less", "@import \"vars\";\n.base { color: @brand; }");
        let (css, _) = run_with(
            "@import \"base.less\";\n@import \"base.less\";\n@import (css) \"print.css\";\n@import (optional) \"missing.less\";",
            EvalOptions::default(),
            &mut importer,
        )
        .unwrap();
        assert_eq!(
            css,
            "@import \"print.css\";\n\n.base {\n  color: #333;\n}"
        );
        assert_eq!(importer.imported(), 2);
    }

    #[test]
    fn multiple_import_repeats_content() {
        let mut importer = MemoryImporter::new().with_file("a.less", ".a { x: 1; }");
        let (css, _) = run_with(
            "@import (multiple) \"a.less\";\n.b { y: 2; }\n@import (multiple) \"a.less\";",
            EvalOptions::default(),
            &mut importer,
        )
        .unwrap();
        assert_eq!(
            css,
            ".a {\n  x: 1;\n}\n\n.b {\n  y: 2;\n}\n\n.a {\n  x: 1;\n}"
        );
    }

    #[test]
    fn missing_import_carries_frame() {
        let err = run("@import \"nope.less\";").unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::Import));
        assert_eq!(err.call_stack(), &["@import \"nope.less\"".to_string()]);
    }

    #[test]
    fn strict_mode_turns_warnings_into_errors() {
        let mut importer = MemoryImporter::new();
        let options = EvalOptions {
            strict: true,
            ..EvalOptions::default()
        };
        let err = run_with(".a { c: #111 + 2px; }", options, &mut importer).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::IncompatibleUnits));
    }

    #[test]
    fn tracing_emits_warning_comments() {
        let mut importer = MemoryImporter::new();
        let options = EvalOptions {
            tracing: true,
            ..EvalOptions::default()
        };
        let (css, warnings) =
            run_with(".a { c: #111 + 2px; }", options, &mut importer).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(css.contains("/* [INCOMPATIBLE_UNITS]"));
    }
}
