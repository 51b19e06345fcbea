//! 表达式求值：变量解引用、插值、运算与守卫条件。

use crate::arith;
use crate::ast::{Condition, Dimension, FunctionCall, Node, Quoted};
use crate::env::ExecEnv;
use crate::error::{ErrorKind, LessError, LessResult};
use crate::functions;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static INTERPOLATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\{([\w-]+)\}").expect("插值正则编译失败"));

/// 在当前作用域中求值；常量原样返回。
pub fn eval(env: &ExecEnv, node: &Node) -> LessResult<Node> {
    match node {
        Node::Dimension(_)
        | Node::Color(_)
        | Node::Keyword(_)
        | Node::Boolean(_)
        | Node::Anonymous(_) => Ok(node.clone()),
        Node::Quoted(quoted) => eval_quoted(env, quoted),
        Node::Variable(var) => {
            let name = if var.indirect {
                text_of(&deref(env, &var.name)?)
            } else {
                var.name.clone()
            };
            deref(env, &name)
        }
        Node::Operation(operation) => {
            let left = eval(env, &operation.left)?;
            let right = eval(env, &operation.right)?;
            arith::operate(env, operation.op, left, right)
        }
        Node::Negate(inner) => match eval(env, inner)? {
            Node::Dimension(dim) => Ok(Node::Dimension(Dimension {
                value: -dim.value,
                unit: dim.unit,
            })),
            other => Ok(Node::Anonymous(format!("-{}", other.to_css(false)))),
        },
        Node::Slash(left, right) => Ok(Node::Slash(
            Box::new(eval(env, left)?),
            Box::new(eval(env, right)?),
        )),
        Node::Paren(inner) => match eval(env, inner)? {
            value @ (Node::Dimension(_) | Node::Color(_)) => Ok(value),
            other => Ok(Node::Paren(Box::new(other))),
        },
        Node::Expression(items) => {
            let values = eval_all(env, items)?;
            Ok(collapse(values, Node::Expression))
        }
        Node::ExpressionList(items) => {
            let values = eval_all(env, items)?;
            Ok(collapse(values, Node::ExpressionList))
        }
        Node::FunctionCall(call) => {
            let args = eval_all(env, &call.args)?;
            match functions::call(env, &call.name, &args)? {
                Some(result) => Ok(result),
                None => Ok(Node::FunctionCall(FunctionCall {
                    name: call.name.clone(),
                    args,
                })),
            }
        }
        Node::Url(inner) => Ok(Node::Url(Box::new(eval(env, inner)?))),
        Node::Script(code) => Err(LessError::kind(
            ErrorKind::ScriptUnsupported,
            format!("不支持内联脚本表达式 `{code}`"),
        )),
    }
}

pub fn eval_all(env: &ExecEnv, nodes: &[Node]) -> LessResult<Vec<Node>> {
    nodes.iter().map(|node| eval(env, node)).collect()
}

fn collapse(mut values: Vec<Node>, wrap: fn(Vec<Node>) -> Node) -> Node {
    if values.len() == 1 {
        return values.remove(0);
    }
    wrap(values)
}

fn eval_quoted(env: &ExecEnv, quoted: &Quoted) -> LessResult<Node> {
    let mut text = String::new();
    for part in &quoted.parts {
        match part {
            Node::Anonymous(raw) => text.push_str(raw),
            other => text.push_str(&text_of(&eval(env, other)?)),
        }
    }
    Ok(Node::Quoted(Quoted::text(quoted.delimiter, quoted.escaped, text)))
}

/// 查找最近的定义并在当前作用域中求值，检测自引用。
pub fn deref(env: &ExecEnv, name: &str) -> LessResult<Node> {
    let definition = env.resolve_definition(name).ok_or_else(|| {
        LessError::kind(ErrorKind::VarUndefined, format!("变量 @{name} 未定义"))
    })?;
    let _guard = definition.begin_evaluation().ok_or_else(|| {
        LessError::kind(
            ErrorKind::VarCircularRef,
            format!("变量 @{name} 存在循环引用"),
        )
    })?;
    eval(env, &definition.value)
}

/// 插值与字符串拼接时使用的文本：字符串取内容，其余按 CSS 输出。
pub fn text_of(node: &Node) -> String {
    match node {
        Node::Quoted(quoted) => quoted.content(),
        other => other.to_css(false),
    }
}

/// 替换文本中的 `@{name}`。
pub fn interpolate(env: &ExecEnv, text: &str) -> LessResult<String> {
    if !text.contains("@{") {
        return Ok(text.to_string());
    }
    let mut failure = None;
    let replaced = INTERPOLATION_RE.replace_all(text, |caps: &Captures<'_>| {
        match deref(env, &caps[1]) {
            Ok(value) => text_of(&value),
            Err(err) => {
                failure.get_or_insert(err);
                String::new()
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(replaced.into_owned()),
    }
}

pub fn eval_condition(env: &ExecEnv, condition: &Condition) -> LessResult<bool> {
    match condition {
        Condition::Compare { op, left, right } => {
            let left = eval(env, left)?;
            let right = eval(env, right)?;
            Ok(arith::test_comparison(*op, arith::compare(&left, &right)))
        }
        Condition::Not(inner) => Ok(!eval_condition(env, inner)?),
        Condition::And(items) => {
            for item in items {
                if !eval_condition(env, item)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Or(items) => {
            for item in items {
                if eval_condition(env, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Block, Comparison, Definition, Operation, Operator, Rule, Variable};
    use std::rc::Rc;

    fn var(name: &str) -> Node {
        Node::Variable(Variable {
            name: name.into(),
            indirect: false,
            curly: false,
        })
    }

    fn px(value: f64) -> Node {
        Node::Dimension(Dimension::new(value, Some("px")))
    }

    fn env_with(defs: Vec<(&str, Node)>) -> ExecEnv {
        let rules = defs
            .into_iter()
            .map(|(name, value)| Rule::Definition(Rc::new(Definition::new(name, value, 0))))
            .collect();
        let mut env = ExecEnv::new(false);
        env.push(Rc::new(Block::new(rules)));
        env
    }

    #[test]
    fn variables_evaluate_lazily_in_current_scope() {
        let env = env_with(vec![
            ("total", Node::Operation(Box::new(Operation {
                op: Operator::Add,
                left: var("base"),
                right: px(2.0),
            }))),
            ("base", px(10.0)),
        ]);
        assert_eq!(eval(&env, &var("total")).unwrap().to_css(false), "12px");
    }

    #[test]
    fn self_reference_is_circular() {
        let env = env_with(vec![("a", var("a"))]);
        let err = eval(&env, &var("a")).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::VarCircularRef));
        let err = eval(&env, &var("missing")).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::VarUndefined));
    }

    #[test]
    fn indirect_variable_lookup() {
        let env = env_with(vec![
            ("name", Node::Quoted(Quoted::text('"', false, "color"))),
            ("color", Node::keyword("red")),
        ]);
        let indirect = Node::Variable(Variable {
            name: "name".into(),
            indirect: true,
            curly: false,
        });
        assert_eq!(eval(&env, &indirect).unwrap(), Node::keyword("red"));
    }

    #[test]
    fn interpolation_replaces_every_reference() {
        let env = env_with(vec![
            ("side", Node::keyword("left")),
            ("prefix", Node::Quoted(Quoted::text('"', false, "my"))),
        ]);
        assert_eq!(
            interpolate(&env, ".@{prefix}-box-@{side}").unwrap(),
            ".my-box-left"
        );
        assert!(interpolate(&env, "@{nope}").is_err());
    }

    #[test]
    fn script_is_rejected() {
        let env = ExecEnv::new(false);
        let err = eval(&env, &Node::Script("1 + 1".into())).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::ScriptUnsupported));
    }

    #[test]
    fn guards_combine() {
        let env = env_with(vec![("w", px(10.0))]);
        let greater = Condition::Compare {
            op: Comparison::Greater,
            left: var("w"),
            right: px(5.0),
        };
        let equal = Condition::Compare {
            op: Comparison::Equal,
            left: var("w"),
            right: px(5.0),
        };
        assert!(eval_condition(&env, &greater).unwrap());
        assert!(!eval_condition(&env, &Condition::And(vec![greater.clone(), equal.clone()])).unwrap());
        assert!(eval_condition(&env, &Condition::Or(vec![equal.clone(), greater])).unwrap());
        assert!(eval_condition(&env, &Condition::Not(Box::new(equal))).unwrap());
    }
}
