//! Answer-shape classification shared by the converters.

use crate::domain::AnswerValue;

/// What an expected-answer string looks like.
#[derive(Clone, Debug, PartialEq)]
pub enum AnswerShape {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Scientific(f64),
    Fraction { num: i64, den: i64 },
    Percentage(f64),
    Currency { symbol: String, amount: f64 },
    Symbolic(String),
    FreeText(String),
}

impl AnswerShape {
    pub fn label(&self) -> &'static str {
        match self {
            AnswerShape::Boolean(_) => "boolean",
            AnswerShape::Integer(_) => "integer",
            AnswerShape::Float(_) => "float",
            AnswerShape::Scientific(_) => "scientific",
            AnswerShape::Fraction { .. } => "fraction",
            AnswerShape::Percentage(_) => "percentage",
            AnswerShape::Currency { .. } => "currency",
            AnswerShape::Symbolic(_) => "symbolic",
            AnswerShape::FreeText(_) => "free_text",
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            AnswerShape::Boolean(_) | AnswerShape::Symbolic(_) | AnswerShape::FreeText(_)
        )
    }

    /// Typed answer. Fractions stay text so no precision is lost.
    pub fn to_value(&self) -> AnswerValue {
        match self {
            AnswerShape::Boolean(b) => AnswerValue::Boolean(*b),
            AnswerShape::Integer(i) => AnswerValue::Integer(*i),
            AnswerShape::Float(x) | AnswerShape::Scientific(x) | AnswerShape::Percentage(x) => {
                AnswerValue::Float(*x)
            }
            AnswerShape::Fraction { num, den } => AnswerValue::Text(format!("{num}/{den}")),
            AnswerShape::Currency { amount, .. } => {
                if amount.fract() == 0.0 && amount.abs() < i64::MAX as f64 {
                    AnswerValue::Integer(*amount as i64)
                } else {
                    AnswerValue::Float(*amount)
                }
            }
            AnswerShape::Symbolic(s) | AnswerShape::FreeText(s) => AnswerValue::Text(s.clone()),
        }
    }

    /// Decimal value where one exists.
    pub fn numeric(&self) -> Option<f64> {
        match self {
            AnswerShape::Integer(i) => Some(*i as f64),
            AnswerShape::Float(x) | AnswerShape::Scientific(x) | AnswerShape::Percentage(x) => Some(*x),
            AnswerShape::Fraction { num, den } => Some(*num as f64 / *den as f64),
            AnswerShape::Currency { amount, .. } => Some(*amount),
            _ => None,
        }
    }
}

/// Text after a GSM8K-style `####` marker, or the whole answer. The second
/// value is the worked reasoning before the marker, if any.
pub fn final_answer(text: &str) -> (&str, Option<&str>) {
    match text.rfind("####") {
        Some(pos) => (text[pos + 4..].trim(), Some(text[..pos].trim())),
        None => (text.trim(), None),
    }
}

pub fn classify_answer(text: &str) -> AnswerShape {
    let s = text.trim();

    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" => return AnswerShape::Boolean(true),
        "false" | "no" => return AnswerShape::Boolean(false),
        _ => {}
    }

    if let Some(n) = parse_number(s) {
        return match n {
            Num::Int(i) => AnswerShape::Integer(i),
            Num::Float(x) => AnswerShape::Float(x),
        };
    }
    if let Some(x) = parse_scientific(s) {
        return AnswerShape::Scientific(x);
    }
    if let Some((num, den)) = parse_fraction(s) {
        return AnswerShape::Fraction { num, den };
    }
    if let Some(body) = s.strip_suffix('%') {
        if let Some(n) = parse_number(body.trim_end()) {
            return AnswerShape::Percentage(n.as_f64());
        }
    }
    if let Some((symbol, amount)) = parse_currency(s) {
        return AnswerShape::Currency { symbol, amount };
    }
    if looks_symbolic(s) {
        return AnswerShape::Symbolic(s.to_string());
    }
    AnswerShape::FreeText(s.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(x) => x,
        }
    }
}

/// Plain decimal with optional sign and `,` thousands groups.
fn parse_number(s: &str) -> Option<Num> {
    let (sign, body) = match s.as_bytes().first()? {
        b'-' => ("-", &s[1..]),
        b'+' => ("", &s[1..]),
        _ => ("", s),
    };
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (body, None),
    };
    if int_part.is_empty() && frac_part.is_none_or(str::is_empty) {
        return None;
    }
    let digits = strip_thousands(int_part)?;
    if let Some(f) = frac_part {
        if !f.bytes().all(|b| b.is_ascii_digit()) || (digits.is_empty() && f.is_empty()) {
            return None;
        }
        let joined = format!("{sign}{}.{f}", if digits.is_empty() { "0" } else { &digits });
        return joined.parse::<f64>().ok().filter(|x| x.is_finite()).map(Num::Float);
    }
    format!("{sign}{digits}").parse::<i64>().ok().map(Num::Int)
}

/// `1234` or `1,234` -> "1234"; rejects misplaced separators.
fn strip_thousands(s: &str) -> Option<String> {
    if !s.bytes().all(|b| b.is_ascii_digit() || b == b',') {
        return None;
    }
    if !s.contains(',') {
        return Some(s.to_string());
    }
    let groups: Vec<&str> = s.split(',').collect();
    let first_ok = (1..=3).contains(&groups[0].len());
    let rest_ok = groups[1..].iter().all(|g| g.len() == 3);
    (first_ok && rest_ok).then(|| groups.concat())
}

fn parse_scientific(s: &str) -> Option<f64> {
    let lower = s.to_ascii_lowercase().replace(' ', "");
    let (mantissa, exp) = if let Some((m, e)) = lower.split_once("x10^") {
        (m.to_string(), e.to_string())
    } else if let Some((m, e)) = lower.split_once("×10^") {
        (m.to_string(), e.to_string())
    } else if let Some((m, e)) = lower.split_once('e') {
        (m.to_string(), e.to_string())
    } else {
        return None;
    };
    let m = parse_number(&mantissa)?.as_f64();
    let e = exp.trim_start_matches('+').parse::<i32>().ok()?;
    let x = m * 10f64.powi(e);
    x.is_finite().then_some(x)
}

fn parse_fraction(s: &str) -> Option<(i64, i64)> {
    let (a, b) = s.split_once('/')?;
    let num = match parse_number(a.trim())? {
        Num::Int(i) => i,
        Num::Float(_) => return None,
    };
    let den = match parse_number(b.trim())? {
        Num::Int(i) if i > 0 => i,
        _ => return None,
    };
    Some((num, den))
}

fn parse_currency(s: &str) -> Option<(String, f64)> {
    const SYMBOLS: &[&str] = &["$", "€", "£", "¥", "₹"];
    let (neg, rest) = match s.strip_prefix('-') {
        Some(r) => (true, r.trim_start()),
        None => (false, s),
    };
    let (symbol, amount) = SYMBOLS
        .iter()
        .find_map(|sym| rest.strip_prefix(*sym).map(|a| (sym.to_string(), a.trim())))
        .or_else(|| {
            // trailing code: "12.50 USD"
            let (a, code) = rest.rsplit_once(' ')?;
            (code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()))
                .then(|| (code.to_string(), a.trim()))
        })?;
    let v = parse_number(amount)?.as_f64();
    Some((symbol, if neg { -v } else { v }))
}

fn looks_symbolic(s: &str) -> bool {
    if s.is_empty() || s.split_whitespace().count() > 6 {
        return false;
    }
    let has_operator = s
        .chars()
        .any(|c| matches!(c, '=' | '^' | '√' | 'π' | '\\' | '*' | '/' | '+' | '(' | ')' | '<' | '>'));
    // coefficient glued to a variable: "3x", "2pi"
    let coefficient = s
        .as_bytes()
        .windows(2)
        .any(|w| w[0].is_ascii_digit() && w[1].is_ascii_alphabetic());
    has_operator || coefficient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_shapes() {
        assert_eq!(classify_answer(" 42 "), AnswerShape::Integer(42));
        assert_eq!(classify_answer("-1,234"), AnswerShape::Integer(-1234));
        assert_eq!(classify_answer("3.25"), AnswerShape::Float(3.25));
        assert_eq!(classify_answer(".5"), AnswerShape::Float(0.5));
        assert_eq!(classify_answer("2.5e3"), AnswerShape::Scientific(2500.0));
        assert_eq!(classify_answer("1.5 x 10^3"), AnswerShape::Scientific(1500.0));
        assert_eq!(classify_answer("3/4"), AnswerShape::Fraction { num: 3, den: 4 });
        assert_eq!(classify_answer("12.5%"), AnswerShape::Percentage(12.5));
        assert_eq!(
            classify_answer("$1,200"),
            AnswerShape::Currency {
                symbol: "$".into(),
                amount: 1200.0
            }
        );
        assert_eq!(
            classify_answer("12.50 USD"),
            AnswerShape::Currency {
                symbol: "USD".into(),
                amount: 12.5
            }
        );
    }

    #[test]
    fn non_numeric_shapes() {
        assert_eq!(classify_answer("Yes"), AnswerShape::Boolean(true));
        assert_eq!(classify_answer("x^2 + 1"), AnswerShape::Symbolic("x^2 + 1".into()));
        assert_eq!(classify_answer("2pi"), AnswerShape::Symbolic("2pi".into()));
        assert_eq!(
            classify_answer("the blue house"),
            AnswerShape::FreeText("the blue house".into())
        );
        // malformed grouping is not a number
        assert!(matches!(classify_answer("12,34"), AnswerShape::FreeText(_)));
        assert!(matches!(classify_answer("1/0"), AnswerShape::Symbolic(_)));
    }

    #[test]
    fn typed_values() {
        assert_eq!(classify_answer("$5").to_value(), AnswerValue::Integer(5));
        assert_eq!(classify_answer("1/3").to_value(), AnswerValue::Text("1/3".into()));
        assert_eq!(classify_answer("50%").numeric(), Some(50.0));
    }

    #[test]
    fn gsm8k_marker() {
        let (ans, work) = final_answer("3 + 2 = 5\n#### 5");
        assert_eq!(ans, "5");
        assert_eq!(work, Some("3 + 2 = 5"));
        assert_eq!(final_answer(" 7 "), ("7", None));
    }
}
