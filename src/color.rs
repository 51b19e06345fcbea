use once_cell::sync::Lazy;
use std::collections::HashMap;

/// 归一化到 0..=1 的 RGBA 颜色。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rgba {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub a: f64,
}

impl Rgba {
    pub fn from_channels(r: f64, g: f64, b: f64, a: f64) -> Self {
        Self {
            r: r / 255.0,
            g: g / 255.0,
            b: b / 255.0,
            a,
        }
        .clamp()
    }

    /// 0..=255 的通道值，用于逐通道运算。
    pub fn channels(&self) -> [f64; 3] {
        [self.r * 255.0, self.g * 255.0, self.b * 255.0]
    }

    fn clamp(self) -> Self {
        Self {
            r: self.r.clamp(0.0, 1.0),
            g: self.g.clamp(0.0, 1.0),
            b: self.b.clamp(0.0, 1.0),
            a: self.a.clamp(0.0, 1.0),
        }
    }

    /// 按输出精度比较：通道取整后的 RGB 与三位小数的 alpha。
    pub fn same_as(&self, other: &Rgba) -> bool {
        let lhs = self.clamp();
        let rhs = other.clamp();
        to_channel(lhs.r) == to_channel(rhs.r)
            && to_channel(lhs.g) == to_channel(rhs.g)
            && to_channel(lhs.b) == to_channel(rhs.b)
            && format_float(lhs.a) == format_float(rhs.a)
    }
}

pub fn parse_color(input: &str) -> Option<Rgba> {
    let trimmed = input.trim();
    if let Some(stripped) = trimmed.strip_prefix('#') {
        return parse_hex(stripped);
    }
    keyword_color(trimmed)
}

/// 颜色关键字查表，大小写不敏感。
pub fn keyword_color(name: &str) -> Option<Rgba> {
    let lowered = name.to_ascii_lowercase();
    if lowered == "transparent" {
        return Some(Rgba {
            r: 0.0,
            g: 0.0,
            b: 0.0,
            a: 0.0,
        });
    }
    let hex = COLOR_KEYWORDS.get(lowered.as_str())?;
    parse_hex(hex)
}

pub fn is_color_keyword(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    lowered == "transparent" || COLOR_KEYWORDS.contains_key(lowered.as_str())
}

pub fn lighten(color: Rgba, amount: f64) -> Rgba {
    let (h, s, l) = rgb_to_hsl(color);
    let new_l = (l + amount).clamp(0.0, 1.0);
    hsl_to_rgb(h, s, new_l, color.a)
}

pub fn darken(color: Rgba, amount: f64) -> Rgba {
    let (h, s, l) = rgb_to_hsl(color);
    let new_l = (l - amount).clamp(0.0, 1.0);
    hsl_to_rgb(h, s, new_l, color.a)
}

pub fn fade(color: Rgba, amount: f64) -> Rgba {
    Rgba {
        a: amount.clamp(0.0, 1.0),
        ..color
    }
    .clamp()
}

pub fn overlay(top: Rgba, bottom: Rgba) -> Rgba {
    color_blend(blend_overlay, top, bottom)
}

/// 按权重混合两种颜色，`weight` 为第一种颜色所占比例。
pub fn mix(first: Rgba, second: Rgba, weight: f64) -> Rgba {
    let p = weight.clamp(0.0, 1.0);
    let w = p * 2.0 - 1.0;
    let a = first.a - second.a;
    let w1 = if (w * a - -1.0).abs() < f64::EPSILON {
        (w + 1.0) / 2.0
    } else {
        ((w + a) / (1.0 + w * a) + 1.0) / 2.0
    };
    let w2 = 1.0 - w1;
    Rgba {
        r: first.r * w1 + second.r * w2,
        g: first.g * w1 + second.g * w2,
        b: first.b * w1 + second.b * w2,
        a: first.a * p + second.a * (1.0 - p),
    }
    .clamp()
}

/// 色相（度）、饱和度与亮度（0..=1）。
pub fn to_hsl(color: Rgba) -> (f64, f64, f64) {
    let (h, s, l) = rgb_to_hsl(color);
    (h * 360.0, s, l)
}

pub fn from_hsl(h: f64, s: f64, l: f64, alpha: f64) -> Rgba {
    let hue = (h % 360.0 + 360.0) % 360.0 / 360.0;
    hsl_to_rgb(hue, s.clamp(0.0, 1.0), l.clamp(0.0, 1.0), alpha.clamp(0.0, 1.0))
}

pub fn format_hex(color: Rgba) -> String {
    let c = color.clamp();
    format!(
        "#{:02x}{:02x}{:02x}",
        to_channel(c.r),
        to_channel(c.g),
        to_channel(c.b)
    )
}

pub fn format_rgba(color: Rgba, compress: bool) -> String {
    let c = color.clamp();
    let alpha = format_float(c.a);
    let sep = if compress { "," } else { ", " };
    format!(
        "rgba({}{sep}{}{sep}{}{sep}{})",
        to_channel(c.r),
        to_channel(c.g),
        to_channel(c.b),
        alpha
    )
}

/// 不透明输出十六进制，半透明输出 rgba()。
pub fn format_color(color: Rgba, compress: bool) -> String {
    if color.clamp().a < 1.0 {
        format_rgba(color, compress)
    } else {
        format_hex(color)
    }
}

fn parse_hex(hex: &str) -> Option<Rgba> {
    if !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    match hex.len() {
        3 => {
            let r = hex_value(&hex[0..1])?;
            let g = hex_value(&hex[1..2])?;
            let b = hex_value(&hex[2..3])?;
            Some(Rgba {
                r: (r * 17) as f64 / 255.0,
                g: (g * 17) as f64 / 255.0,
                b: (b * 17) as f64 / 255.0,
                a: 1.0,
            })
        }
        6 => {
            let r = hex_value(&hex[0..2])?;
            let g = hex_value(&hex[2..4])?;
            let b = hex_value(&hex[4..6])?;
            Some(Rgba {
                r: r as f64 / 255.0,
                g: g as f64 / 255.0,
                b: b as f64 / 255.0,
                a: 1.0,
            })
        }
        8 => {
            let r = hex_value(&hex[0..2])?;
            let g = hex_value(&hex[2..4])?;
            let b = hex_value(&hex[4..6])?;
            let a = hex_value(&hex[6..8])?;
            Some(Rgba {
                r: r as f64 / 255.0,
                g: g as f64 / 255.0,
                b: b as f64 / 255.0,
                a: a as f64 / 255.0,
            })
        }
        _ => None,
    }
}

fn color_blend<F>(mode: F, bottom: Rgba, top: Rgba) -> Rgba
where
    F: Fn(f64, f64) -> f64 + Copy,
{
    let ab = bottom.a;
    let at = top.a;
    let ar = at + ab * (1.0 - at);
    let bottom_channels = [bottom.r, bottom.g, bottom.b];
    let top_channels = [top.r, top.g, top.b];
    let mut result = [0.0; 3];
    for i in 0..3 {
        let cb = bottom_channels[i];
        let cs = top_channels[i];
        let mut cr = mode(cb, cs);
        if ar > 0.0 {
            cr = (at * cs + ab * (cb - at * (cb + cs - cr))) / ar;
        }
        result[i] = cr;
    }
    Rgba {
        r: result[0],
        g: result[1],
        b: result[2],
        a: ar,
    }
    .clamp()
}

fn blend_multiply(a: f64, b: f64) -> f64 {
    a * b
}

fn blend_screen(a: f64, b: f64) -> f64 {
    a + b - a * b
}

fn blend_overlay(base: f64, overlay: f64) -> f64 {
    if base <= 0.5 {
        blend_multiply(base * 2.0, overlay)
    } else {
        blend_screen(base * 2.0 - 1.0, overlay)
    }
}

fn hex_value(hex: &str) -> Option<u8> {
    u8::from_str_radix(hex, 16).ok()
}

fn rgb_to_hsl(color: Rgba) -> (f64, f64, f64) {
    let r = color.r;
    let g = color.g;
    let b = color.b;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;

    if (max - min).abs() < f64::EPSILON {
        return (0.0, 0.0, l);
    }

    let d = max - min;
    let s = if l > 0.5 {
        d / (2.0 - max - min)
    } else {
        d / (max + min)
    };

    let h = if (max - r).abs() < f64::EPSILON {
        (g - b) / d + if g < b { 6.0 } else { 0.0 }
    } else if (max - g).abs() < f64::EPSILON {
        (b - r) / d + 2.0
    } else {
        (r - g) / d + 4.0
    } / 6.0;

    (h, s, l)
}

fn hsl_to_rgb(h: f64, s: f64, l: f64, alpha: f64) -> Rgba {
    if s <= 0.0 {
        return Rgba {
            r: l,
            g: l,
            b: l,
            a: alpha,
        };
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    Rgba { r, g, b, a: alpha }.clamp()
}

fn hue_to_rgb(p: f64, q: f64, mut t: f64) -> f64 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    match t {
        _ if t < 1.0 / 6.0 => p + (q - p) * 6.0 * t,
        _ if t < 1.0 / 2.0 => q,
        _ if t < 2.0 / 3.0 => p + (q - p) * (2.0 / 3.0 - t) * 6.0,
        _ => p,
    }
}

fn to_channel(value: f64) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

fn format_float(value: f64) -> String {
    let mut formatted = format!("{value:.3}");
    while formatted.contains('.') && formatted.ends_with('0') {
        formatted.pop();
    }
    if formatted.ends_with('.') {
        formatted.pop();
    }
    if formatted.is_empty() {
        "0".to_string()
    } else {
        formatted
    }
}

static COLOR_KEYWORDS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("aliceblue", "f0f8ff"),
        ("antiquewhite", "faebd7"),
        ("aqua", "00ffff"),
        ("aquamarine", "7fffd4"),
        ("azure", "f0ffff"),
        ("beige", "f5f5dc"),
        ("bisque", "ffe4c4"),
        ("black", "000000"),
        ("blanchedalmond", "ffebcd"),
        ("blue", "0000ff"),
        ("blueviolet", "8a2be2"),
        ("brown", "a52a2a"),
        ("burlywood", "deb887"),
        ("cadetblue", "5f9ea0"),
        ("chartreuse", "7fff00"),
        ("chocolate", "d2691e"),
        ("coral", "ff7f50"),
        ("cornflowerblue", "6495ed"),
        ("cornsilk", "fff8dc"),
        ("crimson", "dc143c"),
        ("cyan", "00ffff"),
        ("darkblue", "00008b"),
        ("darkcyan", "008b8b"),
        ("darkgoldenrod", "b8860b"),
        ("darkgray", "a9a9a9"),
        ("darkgrey", "a9a9a9"),
        ("darkgreen", "006400"),
        ("darkkhaki", "bdb76b"),
        ("darkmagenta", "8b008b"),
        ("darkolivegreen", "556b2f"),
        ("darkorange", "ff8c00"),
        ("darkorchid", "9932cc"),
        ("darkred", "8b0000"),
        ("darksalmon", "e9967a"),
        ("darkseagreen", "8fbc8f"),
        ("darkslateblue", "483d8b"),
        ("darkslategray", "2f4f4f"),
        ("darkslategrey", "2f4f4f"),
        ("darkturquoise", "00ced1"),
        ("darkviolet", "9400d3"),
        ("deeppink", "ff1493"),
        ("deepskyblue", "00bfff"),
        ("dimgray", "696969"),
        ("dimgrey", "696969"),
        ("dodgerblue", "1e90ff"),
        ("firebrick", "b22222"),
        ("floralwhite", "fffaf0"),
        ("forestgreen", "228b22"),
        ("fuchsia", "ff00ff"),
        ("gainsboro", "dcdcdc"),
        ("ghostwhite", "f8f8ff"),
        ("gold", "ffd700"),
        ("goldenrod", "daa520"),
        ("gray", "808080"),
        ("grey", "808080"),
        ("green", "008000"),
        ("greenyellow", "adff2f"),
        ("honeydew", "f0fff0"),
        ("hotpink", "ff69b4"),
        ("indianred", "cd5c5c"),
        ("indigo", "4b0082"),
        ("ivory", "fffff0"),
        ("khaki", "f0e68c"),
        ("lavender", "e6e6fa"),
        ("lavenderblush", "fff0f5"),
        ("lawngreen", "7cfc00"),
        ("lemonchiffon", "fffacd"),
        ("lightblue", "add8e6"),
        ("lightcoral", "f08080"),
        ("lightcyan", "e0ffff"),
        ("lightgoldenrodyellow", "fafad2"),
        ("lightgray", "d3d3d3"),
        ("lightgrey", "d3d3d3"),
        ("lightgreen", "90ee90"),
        ("lightpink", "ffb6c1"),
        ("lightsalmon", "ffa07a"),
        ("lightseagreen", "20b2aa"),
        ("lightskyblue", "87cefa"),
        ("lightslategray", "778899"),
        ("lightslategrey", "778899"),
        ("lightsteelblue", "b0c4de"),
        ("lightyellow", "ffffe0"),
        ("lime", "00ff00"),
        ("limegreen", "32cd32"),
        ("linen", "faf0e6"),
        ("magenta", "ff00ff"),
        ("maroon", "800000"),
        ("mediumaquamarine", "66cdaa"),
        ("mediumblue", "0000cd"),
        ("mediumorchid", "ba55d3"),
        ("mediumpurple", "9370db"),
        ("mediumseagreen", "3cb371"),
        ("mediumslateblue", "7b68ee"),
        ("mediumspringgreen", "00fa9a"),
        ("mediumturquoise", "48d1cc"),
        ("mediumvioletred", "c71585"),
        ("midnightblue", "191970"),
        ("mintcream", "f5fffa"),
        ("mistyrose", "ffe4e1"),
        ("moccasin", "ffe4b5"),
        ("navajowhite", "ffdead"),
        ("navy", "000080"),
        ("oldlace", "fdf5e6"),
        ("olive", "808000"),
        ("olivedrab", "6b8e23"),
        ("orange", "ffa500"),
        ("orangered", "ff4500"),
        ("orchid", "da70d6"),
        ("palegoldenrod", "eee8aa"),
        ("palegreen", "98fb98"),
        ("paleturquoise", "afeeee"),
        ("palevioletred", "db7093"),
        ("papayawhip", "ffefd5"),
        ("peachpuff", "ffdab9"),
        ("peru", "cd853f"),
        ("pink", "ffc0cb"),
        ("plum", "dda0dd"),
        ("powderblue", "b0e0e6"),
        ("purple", "800080"),
        ("rebeccapurple", "663399"),
        ("red", "ff0000"),
        ("rosybrown", "bc8f8f"),
        ("royalblue", "4169e1"),
        ("saddlebrown", "8b4513"),
        ("salmon", "fa8072"),
        ("sandybrown", "f4a460"),
        ("seagreen", "2e8b57"),
        ("seashell", "fff5ee"),
        ("sienna", "a0522d"),
        ("silver", "c0c0c0"),
        ("skyblue", "87ceeb"),
        ("slateblue", "6a5acd"),
        ("slategray", "708090"),
        ("slategrey", "708090"),
        ("snow", "fffafa"),
        ("springgreen", "00ff7f"),
        ("steelblue", "4682b4"),
        ("tan", "d2b48c"),
        ("teal", "008080"),
        ("thistle", "d8bfd8"),
        ("tomato", "ff6347"),
        ("turquoise", "40e0d0"),
        ("violet", "ee82ee"),
        ("wheat", "f5deb3"),
        ("white", "ffffff"),
        ("whitesmoke", "f5f5f5"),
        ("yellow", "ffff00"),
        ("yellowgreen", "9acd32"),
    ]
    .into_iter()
    .collect()
});
