//! 数值、颜色运算与比较。

use crate::ast::{Color, Comparison, Dimension, Node, Operator};
use crate::color::{self, Rgba};
use crate::env::ExecEnv;
use crate::error::{ErrorKind, LessError, LessResult};
use crate::units::{self, PERCENT};
use std::cmp::Ordering;

impl Dimension {
    /// 两个数值之间的运算，右操作数按需换算到左操作数的单位。
    pub fn operate(&self, op: Operator, other: &Dimension) -> LessResult<Dimension> {
        let left_percent = units::is_percentage(self.unit.as_deref());
        let right_percent = units::is_percentage(other.unit.as_deref());

        if left_percent {
            if other.unit.is_none() || right_percent {
                let right = match op {
                    Operator::Multiply | Operator::Divide if right_percent => other.value * 0.01,
                    _ => other.value,
                };
                return Ok(Dimension::new(checked(op, self.value, right)?, Some(PERCENT)));
            }
            let unit = other.unit.as_deref().unwrap_or_default();
            if op == Operator::Multiply {
                return Ok(Dimension::new(self.value * 0.01 * other.value, Some(unit)));
            }
            return Err(LessError::kind(
                ErrorKind::IncompatibleUnits,
                format!("百分比不能与 {unit} 做 '{}' 运算", op.symbol()),
            ));
        }

        let unit = self.unit.clone().or_else(|| {
            if right_percent {
                None
            } else {
                other.unit.clone()
            }
        });

        if right_percent {
            let fraction = other.value * 0.01;
            let value = match op {
                Operator::Add => self.value + self.value * fraction,
                Operator::Subtract => self.value - self.value * fraction,
                Operator::Multiply => self.value * fraction,
                Operator::Divide => checked(Operator::Divide, self.value, fraction)?,
            };
            return Ok(Dimension { value, unit });
        }

        let right = match (&self.unit, &other.unit) {
            (Some(from), Some(to)) => {
                let factor = units::conversion_factor(to, from).ok_or_else(|| {
                    LessError::kind(
                        ErrorKind::IncompatibleUnits,
                        format!("无法在 {to} 与 {from} 之间换算"),
                    )
                })?;
                other.value * factor
            }
            _ => other.value,
        };
        Ok(Dimension {
            value: checked(op, self.value, right)?,
            unit,
        })
    }

    /// 换算到左操作数单位后比较；单位无法换算时返回 `None`。
    pub fn compare(&self, other: &Dimension) -> Option<Ordering> {
        let right = match (&self.unit, &other.unit) {
            (Some(from), Some(to)) => other.value * units::conversion_factor(to, from)?,
            _ => other.value,
        };
        self.value.partial_cmp(&right)
    }
}

fn checked(op: Operator, left: f64, right: f64) -> LessResult<f64> {
    if op == Operator::Divide && right == 0.0 {
        return Err(LessError::kind(ErrorKind::DivideByZero, "除数为 0"));
    }
    Ok(op.apply(left, right))
}

/// 颜色关键字（如 `red`）在运算与比较中视为颜色。
pub fn coerce_color(node: Node) -> Node {
    match node {
        Node::Keyword(ref name) => match color::keyword_color(name) {
            Some(rgba) => Node::Color(Color::new(rgba)),
            None => node,
        },
        other => other,
    }
}

/// 对已求值的两个操作数执行运算。
pub fn operate(env: &ExecEnv, op: Operator, left: Node, right: Node) -> LessResult<Node> {
    let left = coerce_color(left);
    let right = coerce_color(right);
    match (left, right) {
        (Node::Dimension(l), Node::Dimension(r)) => Ok(Node::Dimension(l.operate(op, &r)?)),
        (Node::Color(l), Node::Color(r)) => Ok(Node::Color(color_operate(op, l.rgba, r.rgba)?)),
        (Node::Color(l), Node::Dimension(r)) => {
            let r = strip_unit(env, r)?;
            Ok(Node::Color(color_operate(op, l.rgba, gray(r.value))?))
        }
        (Node::Dimension(l), Node::Color(r)) => {
            let l = strip_unit(env, l)?;
            if op.is_commutative() {
                return Ok(Node::Color(color_operate(op, r.rgba, gray(l.value))?));
            }
            env.warn(
                ErrorKind::InvalidOperation,
                format!(
                    "数值与颜色不能做 '{}' 运算，已忽略右操作数",
                    op.symbol()
                ),
            )?;
            Ok(Node::Dimension(l))
        }
        (l, r) => Err(LessError::kind(
            ErrorKind::InvalidOperation,
            format!(
                "无法对 `{}` 与 `{}` 做 '{}' 运算",
                l.to_css(false),
                r.to_css(false),
                op.symbol()
            ),
        )),
    }
}

fn strip_unit(env: &ExecEnv, dim: Dimension) -> LessResult<Dimension> {
    if let Some(unit) = &dim.unit {
        env.warn(
            ErrorKind::IncompatibleUnits,
            format!("颜色运算忽略单位 {unit}"),
        )?;
    }
    Ok(Dimension::unitless(dim.value))
}

fn gray(value: f64) -> Rgba {
    Rgba {
        r: value / 255.0,
        g: value / 255.0,
        b: value / 255.0,
        a: 1.0,
    }
}

fn color_operate(op: Operator, left: Rgba, right: Rgba) -> LessResult<Color> {
    let l = left.channels();
    let r = right.channels();
    let mut out = [0.0; 3];
    for idx in 0..3 {
        out[idx] = checked(op, l[idx], r[idx])?;
    }
    let alpha = left.a * (1.0 - right.a) + right.a;
    Ok(Color::new(Rgba::from_channels(out[0], out[1], out[2], alpha)))
}

/// 比较两个已求值的节点，按左操作数的类型分派；无法比较时返回 `None`。
pub fn compare(left: &Node, right: &Node) -> Option<Ordering> {
    let left = coerce_color(left.clone());
    let right = coerce_color(right.clone());
    match (&left, &right) {
        (Node::Dimension(l), Node::Dimension(r)) => l.compare(r),
        (Node::Dimension(_), _) => None,
        (Node::Color(l), Node::Color(r)) => {
            if l.rgba.same_as(&r.rgba) {
                Some(Ordering::Equal)
            } else {
                None
            }
        }
        (Node::Color(_), _) => None,
        _ => Some(plain_text(&left).cmp(&plain_text(&right))),
    }
}

fn plain_text(node: &Node) -> String {
    match node {
        Node::Quoted(quoted) => quoted.content(),
        other => other.to_css(false),
    }
}

pub fn test_comparison(op: Comparison, ordering: Option<Ordering>) -> bool {
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        Comparison::Equal => ordering == Ordering::Equal,
        Comparison::Greater => ordering == Ordering::Greater,
        Comparison::GreaterOrEqual => ordering != Ordering::Less,
        Comparison::Less => ordering == Ordering::Less,
        Comparison::LessOrEqual => ordering != Ordering::Greater,
    }
}
