use std::fmt::{self, Display};
use thiserror::Error;

/// 语义求值阶段的致命错误分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    VarUndefined,
    VarCircularRef,
    MixinUndefined,
    MixinRecursion,
    ArgNamedNotFound,
    ArgTooMany,
    IncompatibleUnits,
    InvalidOperation,
    DivideByZero,
    ScriptUnsupported,
    FunctionArgs,
    Import,
    General,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::VarUndefined => "VAR_UNDEFINED",
            ErrorKind::VarCircularRef => "VAR_CIRCULAR_REFERENCE",
            ErrorKind::MixinUndefined => "MIXIN_UNDEFINED",
            ErrorKind::MixinRecursion => "MIXIN_RECURSE",
            ErrorKind::ArgNamedNotFound => "ARG_NAMED_NOTFOUND",
            ErrorKind::ArgTooMany => "ARG_TOO_MANY",
            ErrorKind::IncompatibleUnits => "INCOMPATIBLE_UNITS",
            ErrorKind::InvalidOperation => "INVALID_OPERATION",
            ErrorKind::DivideByZero => "DIVIDE_BY_ZERO",
            ErrorKind::ScriptUnsupported => "EXPRESSIONS_UNSUPPORTED",
            ErrorKind::FunctionArgs => "FUNCTION_ARGS",
            ErrorKind::Import => "IMPORT",
            ErrorKind::General => "GENERAL",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 编译过程中统一的错误类型。
#[derive(Debug, Error)]
pub enum LessError {
    #[error("解析失败: {message} (位置 {position})")]
    ParseError { message: String, position: usize },
    #[error("语义求值失败 [{kind}]: {message}{}", format_stack(.call_stack))]
    Eval {
        kind: ErrorKind,
        message: String,
        /// 出错位置外层的 mixin 调用与 @import 路径，由内向外。
        call_stack: Vec<String>,
    },
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type LessResult<T> = Result<T, LessError>;

impl LessError {
    pub fn parse<S: Into<String>>(message: S, position: usize) -> Self {
        LessError::ParseError {
            message: message.into(),
            position,
        }
    }

    pub fn eval<S: Into<String>>(message: S) -> Self {
        Self::kind(ErrorKind::General, message)
    }

    pub fn kind<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        LessError::Eval {
            kind,
            message: message.into(),
            call_stack: Vec::new(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        LessError::Internal(message.into())
    }

    /// 错误向外传播时附加一层调用/导入路径。
    pub fn with_frame<S: Into<String>>(mut self, frame: S) -> Self {
        if let LessError::Eval { call_stack, .. } = &mut self {
            call_stack.push(frame.into());
        }
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            LessError::Eval { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn call_stack(&self) -> &[String] {
        match self {
            LessError::Eval { call_stack, .. } => call_stack,
            _ => &[],
        }
    }
}

fn format_stack(stack: &[String]) -> String {
    let mut out = String::new();
    for frame in stack {
        out.push_str("\n    在 ");
        out.push_str(frame);
    }
    out
}

/// 可恢复的问题，非严格模式下只记录不中断求值。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessWarning {
    pub kind: ErrorKind,
    pub message: String,
}

impl LessWarning {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 严格模式下警告升级为同类错误。
    pub fn into_error(self) -> LessError {
        LessError::kind(self.kind, self.message)
    }
}

impl Display for LessWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_accumulate_in_order() {
        let err = LessError::kind(ErrorKind::VarUndefined, "未定义的变量 @x")
            .with_frame(".inner()")
            .with_frame(".outer(1px)");
        assert_eq!(err.call_stack(), &[".inner()", ".outer(1px)"]);
        let text = err.to_string();
        assert!(text.contains("VAR_UNDEFINED"));
        assert!(text.contains(".outer(1px)"));
    }

    #[test]
    fn parse_errors_ignore_frames() {
        let err = LessError::parse("缺少 '}'", 3).with_frame("a.less");
        assert!(err.call_stack().is_empty());
        assert_eq!(err.error_kind(), None);
    }
}
