//! 内置函数表。启动时构建一次，按小写名字查找。

use crate::arith;
use crate::ast::{Color, Dimension, Node, Quoted};
use crate::color::{self, Rgba};
use crate::env::ExecEnv;
use crate::error::{ErrorKind, LessError, LessResult};
use crate::units::{self, PERCENT};
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::HashMap;

type Builtin = fn(&ExecEnv, &[Node]) -> LessResult<Node>;

static BUILTINS: Lazy<HashMap<&'static str, Builtin>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Builtin> = HashMap::new();
    table.insert("lighten", lighten);
    table.insert("darken", darken);
    table.insert("fade", fade);
    table.insert("overlay", overlay);
    table.insert("mix", mix);
    table.insert("rgb", rgb);
    table.insert("rgba", rgba);
    table.insert("hsl", hsl);
    table.insert("hsla", hsla);
    table.insert("red", |_, args| channel(args, 0));
    table.insert("green", |_, args| channel(args, 1));
    table.insert("blue", |_, args| channel(args, 2));
    table.insert("alpha", alpha);
    table.insert("hue", |_, args| hsl_part(args, 0));
    table.insert("saturation", |_, args| hsl_part(args, 1));
    table.insert("lightness", |_, args| hsl_part(args, 2));
    table.insert("percentage", percentage);
    table.insert("unit", unit);
    table.insert("round", round);
    table.insert("ceil", |_, args| map_number("ceil", args, f64::ceil));
    table.insert("floor", |_, args| map_number("floor", args, f64::floor));
    table.insert("abs", |_, args| map_number("abs", args, f64::abs));
    table.insert("sqrt", |_, args| map_number("sqrt", args, f64::sqrt));
    table.insert("e", escape);
    table.insert("iscolor", |_, args| is(args, |n| matches!(n, Node::Color(_))));
    table.insert("isnumber", |_, args| is(args, |n| matches!(n, Node::Dimension(_))));
    table.insert("isstring", |_, args| is(args, |n| matches!(n, Node::Quoted(_))));
    table.insert("iskeyword", |_, args| is(args, |n| matches!(n, Node::Keyword(_))));
    table.insert("isurl", |_, args| is(args, |n| matches!(n, Node::Url(_))));
    table.insert("ispixel", |_, args| is(args, |n| has_unit(n, "px")));
    table.insert("isem", |_, args| is(args, |n| has_unit(n, "em")));
    table.insert("ispercentage", |_, args| is(args, |n| has_unit(n, PERCENT)));
    table.insert("isunit", isunit);
    table
});

/// 调用内置函数；不认识的名字返回 `None`，由调用方按普通 CSS 函数输出。
pub fn call(env: &ExecEnv, name: &str, args: &[Node]) -> LessResult<Option<Node>> {
    let lowered = name.to_ascii_lowercase();
    match lowered.as_str() {
        "min" => extremum("min", args, Ordering::Less),
        "max" => extremum("max", args, Ordering::Greater),
        other => match BUILTINS.get(other) {
            Some(builtin) => builtin(env, args).map(Some),
            None => Ok(None),
        },
    }
}

fn arity(name: &str, args: &[Node], min: usize, max: usize) -> LessResult<()> {
    if args.len() < min || args.len() > max {
        return Err(LessError::kind(
            ErrorKind::FunctionArgs,
            format!("{name}() 参数个数应为 {min}..={max}，实际为 {}", args.len()),
        ));
    }
    Ok(())
}

fn expect_color(name: &str, node: &Node) -> LessResult<Rgba> {
    match arith::coerce_color(node.clone()) {
        Node::Color(c) => Ok(c.rgba),
        other => Err(LessError::kind(
            ErrorKind::FunctionArgs,
            format!("{name}() 需要颜色参数，得到 `{}`", other.to_css(false)),
        )),
    }
}

fn expect_dimension<'a>(name: &str, node: &'a Node) -> LessResult<&'a Dimension> {
    match node {
        Node::Dimension(dim) => Ok(dim),
        other => Err(LessError::kind(
            ErrorKind::FunctionArgs,
            format!("{name}() 需要数值参数，得到 `{}`", other.to_css(false)),
        )),
    }
}

/// 百分比按 0..=1 的比例解释，纯数字原样使用。
fn fraction(name: &str, node: &Node) -> LessResult<f64> {
    let dim = expect_dimension(name, node)?;
    if units::is_percentage(dim.unit.as_deref()) {
        Ok(dim.value / 100.0)
    } else {
        Ok(dim.value)
    }
}

fn color_node(rgba: Rgba) -> Node {
    Node::Color(Color::new(rgba))
}

fn lighten(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("lighten", args, 2, 2)?;
    let base = expect_color("lighten", &args[0])?;
    Ok(color_node(color::lighten(base, fraction("lighten", &args[1])?)))
}

fn darken(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("darken", args, 2, 2)?;
    let base = expect_color("darken", &args[0])?;
    Ok(color_node(color::darken(base, fraction("darken", &args[1])?)))
}

fn fade(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("fade", args, 2, 2)?;
    let base = expect_color("fade", &args[0])?;
    Ok(color_node(color::fade(base, fraction("fade", &args[1])?)))
}

fn overlay(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("overlay", args, 2, 2)?;
    let top = expect_color("overlay", &args[0])?;
    let bottom = expect_color("overlay", &args[1])?;
    Ok(color_node(color::overlay(top, bottom)))
}

fn mix(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("mix", args, 2, 3)?;
    let first = expect_color("mix", &args[0])?;
    let second = expect_color("mix", &args[1])?;
    let weight = match args.get(2) {
        Some(node) => fraction("mix", node)?,
        None => 0.5,
    };
    Ok(color_node(color::mix(first, second, weight)))
}

fn rgb_channel(name: &str, node: &Node) -> LessResult<f64> {
    let dim = expect_dimension(name, node)?;
    if units::is_percentage(dim.unit.as_deref()) {
        Ok(dim.value * 2.55)
    } else {
        Ok(dim.value)
    }
}

fn rgb(env: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("rgb", args, 3, 3)?;
    rgba(env, args)
}

fn rgba(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    if args.len() == 2 {
        let base = expect_color("rgba", &args[0])?;
        return Ok(color_node(color::fade(base, fraction("rgba", &args[1])?)));
    }
    arity("rgba", args, 3, 4)?;
    let alpha = match args.get(3) {
        Some(node) => fraction("rgba", node)?,
        None => 1.0,
    };
    Ok(color_node(Rgba::from_channels(
        rgb_channel("rgba", &args[0])?,
        rgb_channel("rgba", &args[1])?,
        rgb_channel("rgba", &args[2])?,
        alpha,
    )))
}

fn hsl(env: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("hsl", args, 3, 3)?;
    hsla(env, args)
}

fn hsla(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("hsla", args, 3, 4)?;
    let hue = expect_dimension("hsla", &args[0])?.value;
    let alpha = match args.get(3) {
        Some(node) => fraction("hsla", node)?,
        None => 1.0,
    };
    Ok(color_node(color::from_hsl(
        hue,
        fraction("hsla", &args[1])?,
        fraction("hsla", &args[2])?,
        alpha,
    )))
}

fn channel(args: &[Node], index: usize) -> LessResult<Node> {
    arity("red/green/blue", args, 1, 1)?;
    let rgba = expect_color("red/green/blue", &args[0])?;
    let value = rgba.channels()[index].round();
    Ok(Node::Dimension(Dimension::unitless(value)))
}

fn alpha(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("alpha", args, 1, 1)?;
    let rgba = expect_color("alpha", &args[0])?;
    Ok(Node::Dimension(Dimension::unitless(rgba.a)))
}

fn hsl_part(args: &[Node], index: usize) -> LessResult<Node> {
    arity("hue/saturation/lightness", args, 1, 1)?;
    let (h, s, l) = color::to_hsl(expect_color("hue/saturation/lightness", &args[0])?);
    Ok(Node::Dimension(match index {
        0 => Dimension::unitless(h.round()),
        1 => Dimension::new((s * 100.0).round(), Some(PERCENT)),
        _ => Dimension::new((l * 100.0).round(), Some(PERCENT)),
    }))
}

fn percentage(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("percentage", args, 1, 1)?;
    let dim = expect_dimension("percentage", &args[0])?;
    Ok(Node::Dimension(Dimension::new(dim.value * 100.0, Some(PERCENT))))
}

fn unit(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("unit", args, 1, 2)?;
    let dim = expect_dimension("unit", &args[0])?;
    let unit = match args.get(1) {
        Some(Node::Quoted(quoted)) => Some(quoted.content()),
        Some(other) => Some(other.to_css(false)),
        None => None,
    };
    Ok(Node::Dimension(Dimension {
        value: dim.value,
        unit: unit.filter(|u| !u.is_empty()),
    }))
}

fn round(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("round", args, 1, 2)?;
    let dim = expect_dimension("round", &args[0])?;
    let places = match args.get(1) {
        Some(node) => expect_dimension("round", node)?.value.max(0.0) as i32,
        None => 0,
    };
    let scale = 10f64.powi(places);
    Ok(Node::Dimension(Dimension {
        value: (dim.value * scale).round() / scale,
        unit: dim.unit.clone(),
    }))
}

fn map_number(name: &str, args: &[Node], f: fn(f64) -> f64) -> LessResult<Node> {
    arity(name, args, 1, 1)?;
    let dim = expect_dimension(name, &args[0])?;
    Ok(Node::Dimension(Dimension {
        value: f(dim.value),
        unit: dim.unit.clone(),
    }))
}

/// 单位无法比较或参数不是数值时返回 `None`，按 CSS 的 `min()`/`max()` 原样输出。
fn extremum(name: &str, args: &[Node], wanted: Ordering) -> LessResult<Option<Node>> {
    if args.is_empty() {
        return Err(LessError::kind(
            ErrorKind::FunctionArgs,
            format!("{name}() 至少需要一个参数"),
        ));
    }
    let mut best: Option<&Dimension> = None;
    for node in args {
        let Node::Dimension(candidate) = node else {
            return Ok(None);
        };
        best = match best {
            None => Some(candidate),
            Some(current) => match candidate.compare(current) {
                Some(ordering) if ordering == wanted => Some(candidate),
                Some(_) => Some(current),
                None => return Ok(None),
            },
        };
    }
    Ok(best.cloned().map(Node::Dimension))
}
fn escape(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("e", args, 1, 1)?;
    let text = match &args[0] {
        Node::Quoted(quoted) => quoted.content(),
        other => other.to_css(false),
    };
    Ok(Node::Quoted(Quoted::text('"', true, text)))
}

fn is(args: &[Node], predicate: fn(&Node) -> bool) -> LessResult<Node> {
    arity("is*", args, 1, 1)?;
    let node = arith::coerce_color(args[0].clone());
    Ok(Node::Boolean(predicate(&node)))
}

fn has_unit(node: &Node, unit: &str) -> bool {
    matches!(node, Node::Dimension(dim) if dim.unit.as_deref() == Some(unit))
}

fn isunit(_: &ExecEnv, args: &[Node]) -> LessResult<Node> {
    arity("isunit", args, 2, 2)?;
    let unit = match &args[1] {
        Node::Quoted(quoted) => quoted.content(),
        other => other.to_css(false),
    };
    Ok(Node::Boolean(has_unit(&args[0], &unit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(text: &str) -> Node {
        Node::Color(Color::new(color::parse_color(text).unwrap()))
    }

    fn dim(value: f64, unit: Option<&str>) -> Node {
        Node::Dimension(Dimension::new(value, unit))
    }

    fn run(name: &str, args: &[Node]) -> String {
        let env = ExecEnv::new(false);
        call(&env, name, args).unwrap().unwrap().to_css(false)
    }

    #[test]
    fn color_adjustments() {
        assert_eq!(run("lighten", &[hex("#336699"), dim(20.0, Some("%"))]), "#6699cc");
        assert_eq!(run("darken", &[hex("#336699"), dim(10.0, Some("%"))]), "#264c73");
        assert_eq!(run("fade", &[hex("#000"), dim(50.0, Some("%"))]), "rgba(0, 0, 0, 0.5)");
        assert_eq!(run("mix", &[hex("#fff"), hex("#000")]), "#808080");
    }

    #[test]
    fn constructors_and_accessors() {
        assert_eq!(run("rgb", &[dim(255.0, None), dim(0.0, None), dim(0.0, None)]), "#ff0000");
        assert_eq!(run("hsl", &[dim(0.0, None), dim(100.0, Some("%")), dim(50.0, Some("%"))]), "#ff0000");
        assert_eq!(run("red", &[Node::keyword("orange")]), "255");
        assert_eq!(run("lightness", &[hex("#808080")]), "50%");
    }

    #[test]
    fn number_helpers() {
        assert_eq!(run("percentage", &[dim(0.5, None)]), "50%");
        assert_eq!(run("unit", &[dim(5.0, Some("px")), Node::keyword("em")]), "5em");
        assert_eq!(run("unit", &[dim(5.0, Some("px"))]), "5");
        assert_eq!(run("round", &[dim(1.456, None), dim(2.0, None)]), "1.46");
        assert_eq!(run("max", &[dim(1.0, Some("in")), dim(90.0, Some("px"))]), "1in");
        assert_eq!(run("e", &[Node::Quoted(Quoted::text('"', false, "ms:foo"))]), "ms:foo");
    }

    #[test]
    fn min_max_with_mixed_units_stay_css() {
        let env = ExecEnv::new(false);
        assert!(call(&env, "min", &[dim(100.0, Some("%")), dim(500.0, Some("px"))])
            .unwrap()
            .is_none());
        assert!(call(&env, "max", &[Node::keyword("auto"), dim(1.0, Some("px"))])
            .unwrap()
            .is_none());
        assert_eq!(run("min", &[dim(2.0, Some("cm")), dim(10.0, Some("mm"))]), "10mm");
    }

    #[test]
    fn type_checks() {
        assert_eq!(run("iscolor", &[Node::keyword("red")]), "true");
        assert_eq!(run("ispixel", &[dim(1.0, Some("em"))]), "false");
        assert_eq!(run("isunit", &[dim(1.0, Some("em")), Node::keyword("em")]), "true");
    }

    #[test]
    fn unknown_function_is_passed_through() {
        let env = ExecEnv::new(false);
        assert!(call(&env, "translate", &[]).unwrap().is_none());
        let err = call(&env, "lighten", &[hex("#fff")]).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::FunctionArgs));
    }
}
