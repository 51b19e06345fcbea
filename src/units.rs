//! 单位族与换算系数表。
//!
//! 同一族内的单位可以互相换算，系数表在首次使用时由各族的基准比例生成，
//! 并同时登记正反两个方向。

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::f64::consts::PI;

pub const PERCENT: &str = "%";

/// 每个单位族以其中一个单位为基准，记录其余单位相对基准的大小。
const FAMILIES: &[&[(&str, f64)]] = &[
    // length，以 px 为基准
    &[
        ("px", 1.0),
        ("cm", 96.0 / 2.54),
        ("mm", 96.0 / 25.4),
        ("q", 96.0 / 101.6),
        ("in", 96.0),
        ("pt", 96.0 / 72.0),
        ("pc", 16.0),
    ],
    // time
    &[("s", 1.0), ("ms", 0.001)],
    // frequency
    &[("hz", 1.0), ("khz", 1000.0)],
    // resolution
    &[("dpi", 1.0), ("dpcm", 2.54), ("dppx", 96.0)],
    // angle，以 turn 为基准
    &[
        ("turn", 1.0),
        ("deg", 1.0 / 360.0),
        ("grad", 1.0 / 400.0),
        ("rad", 1.0 / (2.0 * PI)),
    ],
];

static CONVERSIONS: Lazy<HashMap<(&'static str, &'static str), f64>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for family in FAMILIES {
        for &(from, from_base) in family.iter() {
            for &(to, to_base) in family.iter() {
                table.insert((from, to), from_base / to_base);
            }
        }
    }
    table
});

/// 返回把 `from` 单位的数值换算成 `to` 单位所需乘的系数。
///
/// 相同单位（包括表中没有的单位，如 `em`、`vw`）系数为 1；
/// 不同族或未知单位之间没有定义，返回 `None`。
pub fn conversion_factor(from: &str, to: &str) -> Option<f64> {
    if from.eq_ignore_ascii_case(to) {
        return Some(1.0);
    }
    let from = from.to_ascii_lowercase();
    let to = to.to_ascii_lowercase();
    CONVERSIONS.get(&(from.as_str(), to.as_str())).copied()
}

pub fn is_percentage(unit: Option<&str>) -> bool {
    unit == Some(PERCENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn inch_is_ninety_six_pixels() {
        assert!(approx(conversion_factor("in", "px").unwrap(), 96.0));
        assert!(approx(conversion_factor("px", "in").unwrap(), 1.0 / 96.0));
    }

    #[test]
    fn table_is_symmetric() {
        for (from, to) in [("cm", "mm"), ("s", "ms"), ("deg", "rad"), ("dppx", "dpi")] {
            let forward = conversion_factor(from, to).unwrap();
            let backward = conversion_factor(to, from).unwrap();
            assert!(approx(forward * backward, 1.0), "{from} <-> {to}");
        }
    }

    #[test]
    fn cross_family_is_undefined() {
        assert_eq!(conversion_factor("px", "s"), None);
        assert_eq!(conversion_factor("em", "px"), None);
        assert_eq!(conversion_factor("em", "em"), Some(1.0));
    }

    #[test]
    fn unit_names_are_case_insensitive() {
        assert!(approx(conversion_factor("kHz", "Hz").unwrap(), 1000.0));
    }
}
