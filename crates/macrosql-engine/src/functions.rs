//! Allow-listed expression functions
//!
//! The only functions callable from macro expressions. Names are matched
//! exactly (lowercase); anything else is rejected by the evaluator.

use crate::error::{MacroError, MacroResult};
use crate::value::{MacroValue, Scalar};

/// Names of every callable function
pub const FUNCTIONS: &[&str] = &[
    "len",
    "lower",
    "upper",
    "trim",
    "replace",
    "concat",
    "coalesce",
    "abs",
    "round",
    "min",
    "max",
    "str",
    "int",
    "contains",
    "starts_with",
    "ends_with",
    "keys",
];

pub fn is_allowed(name: &str) -> bool {
    FUNCTIONS.contains(&name)
}

/// Call an allow-listed function
pub fn call(name: &str, args: Vec<MacroValue>, offset: usize) -> MacroResult<MacroValue> {
    match name {
        "len" => len_function(args, offset),
        "lower" => map_string(name, args, offset, |s| s.to_lowercase()),
        "upper" => map_string(name, args, offset, |s| s.to_uppercase()),
        "trim" => map_string(name, args, offset, |s| s.trim().to_string()),
        "replace" => replace_function(args, offset),
        "concat" => concat_function(args, offset),
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or_else(MacroValue::null)),
        "abs" => abs_function(args, offset),
        "round" => round_function(args, offset),
        "min" | "max" => extremum(name, args, offset),
        "str" => {
            let [value] = exact::<1>(name, args, offset)?;
            Ok(MacroValue::string(value.display_text(offset)?))
        }
        "int" => int_function(args, offset),
        "contains" => contains_function(args, offset),
        "starts_with" => {
            let (s, prefix) = two_strings(name, args, offset)?;
            Ok(MacroValue::bool(s.starts_with(&prefix)))
        }
        "ends_with" => {
            let (s, suffix) = two_strings(name, args, offset)?;
            Ok(MacroValue::bool(s.ends_with(&suffix)))
        }
        "keys" => {
            let [value] = exact::<1>(name, args, offset)?;
            match value {
                MacroValue::Mapping(entries) => Ok(MacroValue::List(
                    entries.into_iter().map(|(k, _)| MacroValue::string(k)).collect(),
                )),
                other => Err(type_mismatch(name, "a mapping", &other, offset)),
            }
        }
        other => Err(MacroError::evaluation(
            format!("Function '{}' is not allowed in macro expressions", other),
            offset,
        )),
    }
}

fn exact<const N: usize>(
    name: &str,
    args: Vec<MacroValue>,
    offset: usize,
) -> MacroResult<[MacroValue; N]> {
    let count = args.len();
    args.try_into().map_err(|_| {
        MacroError::type_error(
            format!("{}() takes {} argument(s), got {}", name, N, count),
            offset,
        )
    })
}

fn type_mismatch(name: &str, expected: &str, got: &MacroValue, offset: usize) -> MacroError {
    MacroError::type_error(
        format!("{}() expects {}, got {}", name, expected, got.type_name()),
        offset,
    )
}

fn expect_string(name: &str, value: MacroValue, offset: usize) -> MacroResult<String> {
    match value {
        MacroValue::Scalar(Scalar::Str(s)) => Ok(s),
        other => Err(type_mismatch(name, "a string", &other, offset)),
    }
}

fn map_string(
    name: &str,
    args: Vec<MacroValue>,
    offset: usize,
    f: impl Fn(&str) -> String,
) -> MacroResult<MacroValue> {
    let [value] = exact::<1>(name, args, offset)?;
    Ok(MacroValue::string(f(&expect_string(name, value, offset)?)))
}

fn two_strings(name: &str, args: Vec<MacroValue>, offset: usize) -> MacroResult<(String, String)> {
    let [a, b] = exact::<2>(name, args, offset)?;
    Ok((expect_string(name, a, offset)?, expect_string(name, b, offset)?))
}

fn len_function(args: Vec<MacroValue>, offset: usize) -> MacroResult<MacroValue> {
    let [value] = exact::<1>("len", args, offset)?;
    let len = match &value {
        MacroValue::Scalar(Scalar::Str(s)) => s.chars().count(),
        MacroValue::List(items) => items.len(),
        MacroValue::Mapping(entries) => entries.len(),
        other => return Err(type_mismatch("len", "a string, list or mapping", other, offset)),
    };
    Ok(MacroValue::int(len as i64))
}

fn replace_function(args: Vec<MacroValue>, offset: usize) -> MacroResult<MacroValue> {
    let [s, from, to] = exact::<3>("replace", args, offset)?;
    let s = expect_string("replace", s, offset)?;
    let from = expect_string("replace", from, offset)?;
    let to = expect_string("replace", to, offset)?;
    Ok(MacroValue::string(s.replace(&from, &to)))
}

fn concat_function(args: Vec<MacroValue>, offset: usize) -> MacroResult<MacroValue> {
    if args.iter().all(|v| matches!(v, MacroValue::List(_))) && !args.is_empty() {
        let items = args
            .into_iter()
            .flat_map(|v| match v {
                MacroValue::List(items) => items,
                _ => Vec::new(),
            })
            .collect();
        return Ok(MacroValue::List(items));
    }

    let mut out = String::new();
    for value in args {
        out.push_str(&value.display_text(offset)?);
    }
    Ok(MacroValue::string(out))
}

fn abs_function(args: Vec<MacroValue>, offset: usize) -> MacroResult<MacroValue> {
    let [value] = exact::<1>("abs", args, offset)?;
    match value {
        MacroValue::Scalar(Scalar::Int(i)) => i
            .checked_abs()
            .map(MacroValue::int)
            .ok_or_else(|| MacroError::evaluation("Integer overflow in abs()", offset)),
        MacroValue::Scalar(Scalar::Float(f)) => Ok(MacroValue::float(f.abs())),
        other => Err(type_mismatch("abs", "a number", &other, offset)),
    }
}

fn round_function(args: Vec<MacroValue>, offset: usize) -> MacroResult<MacroValue> {
    let (value, digits) = match args.len() {
        1 => {
            let [value] = exact::<1>("round", args, offset)?;
            (value, 0)
        }
        _ => {
            let [value, digits] = exact::<2>("round", args, offset)?;
            match digits {
                MacroValue::Scalar(Scalar::Int(d)) if (0..=15).contains(&d) => (value, d as i32),
                other => return Err(type_mismatch("round", "digits between 0 and 15", &other, offset)),
            }
        }
    };

    match value {
        MacroValue::Scalar(Scalar::Int(i)) => Ok(MacroValue::int(i)),
        MacroValue::Scalar(Scalar::Float(f)) if digits == 0 => Ok(MacroValue::float(f.round())),
        MacroValue::Scalar(Scalar::Float(f)) => {
            let factor = 10f64.powi(digits);
            Ok(MacroValue::float((f * factor).round() / factor))
        }
        other => Err(type_mismatch("round", "a number", &other, offset)),
    }
}

fn extremum(name: &str, args: Vec<MacroValue>, offset: usize) -> MacroResult<MacroValue> {
    let items = match <[MacroValue; 1]>::try_from(args) {
        Ok([MacroValue::List(items)]) => items,
        Ok([single]) => vec![single],
        Err(args) => args,
    };

    let mut best: Option<MacroValue> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => {
                let ordering = compare(&item, &current, name, offset)?;
                let take = if name == "min" { ordering.is_lt() } else { ordering.is_gt() };
                if take { item } else { current }
            }
        });
    }
    best.ok_or_else(|| MacroError::evaluation(format!("{}() of an empty collection", name), offset))
}

/// Order two scalars of compatible type
pub(crate) fn compare(
    a: &MacroValue,
    b: &MacroValue,
    what: &str,
    offset: usize,
) -> MacroResult<std::cmp::Ordering> {
    use MacroValue::Scalar as S;
    let ordering = match (a, b) {
        (S(Scalar::Int(x)), S(Scalar::Int(y))) => Some(x.cmp(y)),
        (S(Scalar::Int(x)), S(Scalar::Float(y))) => (*x as f64).partial_cmp(y),
        (S(Scalar::Float(x)), S(Scalar::Int(y))) => x.partial_cmp(&(*y as f64)),
        (S(Scalar::Float(x)), S(Scalar::Float(y))) => x.partial_cmp(y),
        (S(Scalar::Str(x)), S(Scalar::Str(y))) => Some(x.cmp(y)),
        (S(Scalar::Date(x)), S(Scalar::Date(y))) => Some(x.cmp(y)),
        (S(Scalar::Bool(x)), S(Scalar::Bool(y))) => Some(x.cmp(y)),
        _ => None,
    };
    ordering.ok_or_else(|| {
        MacroError::type_error(
            format!("cannot compare {} with {} in {}", a.type_name(), b.type_name(), what),
            offset,
        )
    })
}

fn int_function(args: Vec<MacroValue>, offset: usize) -> MacroResult<MacroValue> {
    let [value] = exact::<1>("int", args, offset)?;
    match value {
        MacroValue::Scalar(Scalar::Int(i)) => Ok(MacroValue::int(i)),
        MacroValue::Scalar(Scalar::Bool(b)) => Ok(MacroValue::int(b as i64)),
        MacroValue::Scalar(Scalar::Float(f)) if f.is_finite() && f.abs() < i64::MAX as f64 => {
            Ok(MacroValue::int(f.trunc() as i64))
        }
        MacroValue::Scalar(Scalar::Str(s)) => s.trim().parse::<i64>().map(MacroValue::int).map_err(|_| {
            MacroError::evaluation(format!("int() cannot parse '{}'", s), offset)
        }),
        other => Err(type_mismatch("int", "a number or numeric string", &other, offset)),
    }
}

fn contains_function(args: Vec<MacroValue>, offset: usize) -> MacroResult<MacroValue> {
    let [haystack, needle] = exact::<2>("contains", args, offset)?;
    match haystack {
        MacroValue::List(items) => Ok(MacroValue::bool(items.contains(&needle))),
        MacroValue::Mapping(entries) => {
            let key = expect_string("contains", needle, offset)?;
            Ok(MacroValue::bool(entries.iter().any(|(k, _)| *k == key)))
        }
        MacroValue::Scalar(Scalar::Str(s)) => {
            let needle = expect_string("contains", needle, offset)?;
            Ok(MacroValue::bool(s.contains(&needle)))
        }
        other => Err(type_mismatch("contains", "a string, list or mapping", &other, offset)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> MacroValue {
        MacroValue::string(v)
    }

    #[test]
    fn string_functions() {
        assert_eq!(call("upper", vec![s("pea")], 0).unwrap(), s("PEA"));
        assert_eq!(call("lower", vec![s("PEA")], 0).unwrap(), s("pea"));
        assert_eq!(call("trim", vec![s("  x ")], 0).unwrap(), s("x"));
        assert_eq!(call("replace", vec![s("a-b"), s("-"), s("_")], 0).unwrap(), s("a_b"));
        assert_eq!(call("concat", vec![s("a"), MacroValue::int(1)], 0).unwrap(), s("a1"));
        assert_eq!(
            call("starts_with", vec![s("carrot"), s("car")], 0).unwrap(),
            MacroValue::bool(true)
        );
    }

    #[test]
    fn len_counts_chars_and_items() {
        assert_eq!(call("len", vec![s("héllo")], 0).unwrap(), MacroValue::int(5));
        let list = MacroValue::List(vec![MacroValue::int(1), MacroValue::int(2)]);
        assert_eq!(call("len", vec![list], 0).unwrap(), MacroValue::int(2));
    }

    #[test]
    fn min_max_over_list_or_args() {
        let list = MacroValue::List(vec![MacroValue::int(3), MacroValue::int(1), MacroValue::int(2)]);
        assert_eq!(call("min", vec![list.clone()], 0).unwrap(), MacroValue::int(1));
        assert_eq!(call("max", vec![list], 0).unwrap(), MacroValue::int(3));
        assert_eq!(
            call("max", vec![MacroValue::int(1), MacroValue::float(1.5)], 0).unwrap(),
            MacroValue::float(1.5)
        );
    }

    #[test]
    fn coalesce_skips_nulls() {
        let args = vec![MacroValue::null(), s("x"), s("y")];
        assert_eq!(call("coalesce", args, 0).unwrap(), s("x"));
    }

    #[test]
    fn wrong_arity_is_type_error() {
        let err = call("upper", vec![s("a"), s("b")], 4).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Type);
        assert_eq!(err.offset(), 4);
    }

    #[test]
    fn unknown_function_is_rejected() {
        assert!(!is_allowed("exec"));
        let err = call("exec", vec![], 0).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Evaluation);
    }

    #[test]
    fn int_parses_strings() {
        assert_eq!(call("int", vec![s(" 42 ")], 0).unwrap(), MacroValue::int(42));
        assert!(call("int", vec![s("x")], 0).is_err());
    }
}
