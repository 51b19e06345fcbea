//! less_forge 库入口，提供面向 Rust 与 Node.js 的 LESS 编译能力。
//! 内部分为三个阶段：解析（Parser）→ 语义求值（Evaluator）→ CSS 渲染（Renderer）。

pub mod arith;
pub mod ast;
pub mod color;
pub mod env;
pub mod error;
pub mod evaluator;
pub mod extend;
pub mod functions;
pub mod importer;
pub mod mixin;
pub mod output;
pub mod parser;
pub mod renderer;
pub mod selector;
pub mod units;
mod utils;
pub mod value;

pub use crate::ast::Stylesheet;
pub use crate::error::{ErrorKind, LessError, LessResult, LessWarning};
pub use crate::evaluator::{EvalOptions, Evaluator};
pub use crate::importer::{FileImporter, Importer, MemoryImporter};
pub use crate::renderer::{render, RenderContext};

use crate::parser::LessParser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// LESS 编译配置。
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// 严格模式下警告直接视为错误。
    pub strict: bool,
    /// 不向日志输出警告。
    pub hide_warnings: bool,
    /// 是否输出压缩后的 CSS。
    pub compress: bool,
    /// 在输出中保留来源行号注释。
    pub tracing: bool,
    pub mixin_recursion_limit: usize,
    /// 当前源文件所在目录，用于解析相对 @import。
    pub current_dir: Option<PathBuf>,
    /// 额外的检索目录。
    pub include_paths: Vec<PathBuf>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            strict: false,
            hide_warnings: false,
            compress: false,
            tracing: false,
            mixin_recursion_limit: 64,
            current_dir: None,
            include_paths: Vec::new(),
        }
    }
}

impl CompileOptions {
    fn eval_options(&self) -> EvalOptions {
        EvalOptions {
            strict: self.strict,
            hide_warnings: self.hide_warnings,
            tracing: self.tracing,
            mixin_recursion_limit: self.mixin_recursion_limit,
        }
    }

    fn render_context(&self) -> RenderContext {
        RenderContext {
            compress: self.compress,
            tracing: self.tracing,
        }
    }
}

/// 编译结果：CSS 文本与求值期间记录的警告。
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub css: String,
    pub warnings: Vec<LessWarning>,
}

/// 解析 LESS 源码。
pub fn parse(source: &str) -> LessResult<Stylesheet> {
    LessParser::new().parse(source)
}

/// 编译 LESS 源码为 CSS 文本。
///
/// # 参数
/// * `source` - 待编译的 LESS 字符串
/// * `options` - 编译配置
pub fn compile(source: &str, options: CompileOptions) -> LessResult<String> {
    compile_with_warnings(source, options).map(|output| output.css)
}

/// 编译并返回警告列表。
pub fn compile_with_warnings(source: &str, options: CompileOptions) -> LessResult<CompileOutput> {
    let mut importer = FileImporter::new(&options.include_paths);
    compile_entry(source, None, &options, &mut importer)
}

/// 使用自定义导入器编译。
pub fn compile_with_importer(
    source: &str,
    options: CompileOptions,
    importer: &mut dyn Importer,
) -> LessResult<CompileOutput> {
    compile_entry(source, None, &options, importer)
}

/// 从文件路径编译 LESS，自动处理 @import。
pub fn compile_file<P: AsRef<Path>>(path: P, mut options: CompileOptions) -> LessResult<String> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|err| {
        LessError::kind(
            ErrorKind::Import,
            format!("读取文件 {} 失败: {err}", path.display()),
        )
    })?;
    let entry = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if options.current_dir.is_none() {
        options.current_dir = entry.parent().map(Path::to_path_buf);
    }
    let mut importer = FileImporter::new(&options.include_paths);
    compile_entry(&source, Some(&entry), &options, &mut importer).map(|output| output.css)
}

fn compile_entry(
    source: &str,
    entry: Option<&Path>,
    options: &CompileOptions,
    importer: &mut dyn Importer,
) -> LessResult<CompileOutput> {
    let stylesheet = parse(source)?;
    let mut evaluator = Evaluator::new(options.eval_options(), importer);
    if let Some(entry) = entry {
        evaluator = evaluator.with_entry(entry);
    } else if let Some(dir) = &options.current_dir {
        evaluator = evaluator.with_current_dir(dir);
    }
    let evaluated = evaluator.evaluate(stylesheet)?;
    let warnings = evaluator.take_warnings();
    if !options.hide_warnings {
        for warning in &warnings {
            warn!(kind = %warning.kind, "{}", warning.message);
        }
    }
    let css = render(&options.render_context(), &evaluated)?;
    Ok(CompileOutput { css, warnings })
}

#[cfg(feature = "node")]
use napi::{Error, Result};
#[cfg(feature = "node")]
use napi_derive::napi;

/// Node.js 侧的编译选项对象。
#[cfg(feature = "node")]
#[napi(object)]
pub struct JsCompileOptions {
    /// 是否压缩输出 CSS。
    pub compress: Option<bool>,
    /// 是否启用严格模式。
    pub strict: Option<bool>,
    /// 源文件路径，用于解析 @import。
    pub filename: Option<String>,
}

/// 暴露给 Node.js 的编译函数。
#[cfg(feature = "node")]
#[napi]
pub fn compile_less(source: String, options: Option<JsCompileOptions>) -> Result<String> {
    let opt = options.unwrap_or(JsCompileOptions {
        compress: None,
        strict: None,
        filename: None,
    });
    let mut compile_options = CompileOptions {
        compress: opt.compress.unwrap_or(false),
        strict: opt.strict.unwrap_or(false),
        ..CompileOptions::default()
    };
    if let Some(filename) = opt.filename {
        let path = PathBuf::from(&filename);
        if let Some(parent) = path.parent() {
            let dir = parent.to_path_buf();
            compile_options.current_dir = Some(dir.clone());
            compile_options.include_paths.push(dir);
        }
    }
    let result =
        compile(&source, compile_options).map_err(|err| Error::from_reason(err.to_string()))?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_basic_variable() {
        let src = r"@base: #111;
body {
  color: @base;
}";
        let css = compile(src, CompileOptions::default()).unwrap();
        assert!(css.contains("color: #111"));
    }

    #[test]
    fn compile_nested_selectors() {
        let src = r".btn {
  color: #fff;
  &:hover {
    color: #000;
  }
}";
        let css = compile(src, CompileOptions::default()).unwrap();
        assert!(css.contains(".btn:hover"));
        assert!(css.contains("color: #000"));
    }

    #[test]
    fn compile_important_flag() {
        let src = r"@base: 10px;
.box {
  margin: @base !important;
}";
        let css = compile(
            src,
            CompileOptions {
                compress: true,
                ..CompileOptions::default()
            },
        )
        .unwrap();
        assert!(css.contains("margin:10px!important"));
        assert!(!css.contains("!important!important"));
    }

    #[test]
    fn compile_color_functions() {
        let src = r"@brand: #336699;
.btn {
  background: lighten(@brand, 20%);
  border-color: darken(@brand, 10%);
  color: fade(#ffffff, 40%);
}";
        let css = compile(src, CompileOptions::default()).unwrap();
        assert!(css.contains("background: #6699cc"));
        assert!(css.contains("border-color: #264c73"));
        assert!(css.contains("color: rgba(255, 255, 255, 0.4)"));
    }

    #[test]
    fn compile_import_statement() {
        let src = r#"@color: #000;
body {
  color: @color;
}
@import "reset.css";"#;
        let pretty = compile(src, CompileOptions::default()).unwrap();
        assert!(pretty.trim_start().starts_with("@import \"reset.css\";"));
        assert!(pretty.contains("body {"));

        let minified = compile(
            src,
            CompileOptions {
                compress: true,
                ..CompileOptions::default()
            },
        )
        .unwrap();
        assert!(minified.starts_with("@import \"reset.css\";"));
        assert!(minified.contains("body{color:#000}"));
    }

    #[test]
    fn importer_resolves_from_current_dir() {
        let mut importer = MemoryImporter::new()
            .with_file("styles/base.less", ".base { a: 1; }")
            .with_file("styles/skip.less", ".skip { b: 2; }");
        let output = compile_with_importer(
            "@import \"base\";\n@import (optional) \"missing\";",
            CompileOptions {
                current_dir: Some(PathBuf::from("styles")),
                ..CompileOptions::default()
            },
            &mut importer,
        )
        .unwrap();
        assert_eq!(output.css, ".base {\n  a: 1;\n}");
        assert_eq!(importer.imported(), 1);
    }

    #[test]
    fn tracing_comments_follow_hide_warnings() {
        let src = ".a { c: #111 + 2px; }";
        let traced = compile(
            src,
            CompileOptions {
                tracing: true,
                ..CompileOptions::default()
            },
        )
        .unwrap();
        assert!(traced.contains("/* line 1 */"));
        assert!(traced.contains("/* [INCOMPATIBLE_UNITS]"));

        let quiet = compile_with_warnings(
            src,
            CompileOptions {
                tracing: true,
                hide_warnings: true,
                ..CompileOptions::default()
            },
        )
        .unwrap();
        assert!(!quiet.css.contains("INCOMPATIBLE_UNITS"));
        assert_eq!(quiet.warnings.len(), 1);
    }

    #[test]
    fn strict_mode_and_recursion_limit() {
        let err = compile(
            ".a { c: #111 + 2px; }",
            CompileOptions {
                strict: true,
                ..CompileOptions::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::IncompatibleUnits));

        let err = compile(
            ".r() { .r(); }\n.x { .r(); }",
            CompileOptions {
                mixin_recursion_limit: 3,
                ..CompileOptions::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::MixinRecursion));
        assert_eq!(err.call_stack().len(), 3);
    }

    #[test]
    fn warnings_are_returned() {
        let output =
            compile_with_warnings(".a { c: #111 + 2px; }", CompileOptions::default()).unwrap();
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(output.warnings[0].kind, ErrorKind::IncompatibleUnits);
        assert!(output.css.contains("c: #131313"));
    }
}
