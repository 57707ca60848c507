//! Compatibility predicate evaluator (§4.G). Grounded in
//! `original_source/conditions.py`.
//!
//! The source implementation evaluates sub-expressions by substituting
//! literal `True`/`False` into the condition string and re-splitting; that
//! string-splice approach is kept here (rather than a separate tokenizing
//! rewrite) since behavior must be byte-for-byte identical and the
//! regex-literal exclusion rule is defined against it (§9).

use crate::error::ConditionError;
use crate::model::SlicerType;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

pub type ConfigMap = HashMap<String, Value>;

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\w+)(?:\[([0-9]+)\])?$").unwrap());
static SPLIT_OP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" (and|or|&&|\|\|) ").unwrap());

const OPERATORS: [&str; 8] = ["=~", "!~", "==", "!=", ">=", "<=", ">", "<"];

pub fn evaluate(
    expr: &str,
    slicer: SlicerType,
    config: &ConfigMap,
    defaults: Option<&ConfigMap>,
) -> Result<bool, ConditionError> {
    let merged = merge_defaults(config, defaults);
    evaluate_merged(expr, slicer, &merged)
}

fn merge_defaults(config: &ConfigMap, defaults: Option<&ConfigMap>) -> ConfigMap {
    let mut merged = defaults.cloned().unwrap_or_default();
    for (k, v) in config {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

fn evaluate_merged(expr: &str, slicer: SlicerType, merged: &ConfigMap) -> Result<bool, ConditionError> {
    let mut working = expr.trim().to_string();
    loop {
        let chars: Vec<char> = working.chars().collect();
        let mask = regex_literal_mask(&chars);
        if !parens_balanced(&chars, &mask) {
            return Err(ConditionError::UnbalancedParens { expr: expr.to_string() });
        }
        match find_first_paren_set(&chars, &mask) {
            Some((start, end)) => {
                let inner: String = chars[start + 1..end].iter().collect();
                let inner_result = evaluate_merged(&inner, slicer, merged)?;
                let replacement = if inner_result { "True" } else { "False" };
                let before: String = chars[..start].iter().collect();
                let after: String = chars[end + 1..].iter().collect();
                working = format!("{before}{replacement}{after}");
            }
            None => break,
        }
    }

    let (terms, ops) = split_terms(&working);
    let results: Vec<bool> = terms.iter().map(|t| evaluate_single(t, slicer, merged)).collect();
    Ok(fold(&results, &ops))
}

/// Mark every character that lies between `=~`/`!~` and its regex literal's
/// delimiting slashes — these must never be examined for parenthesis balance.
fn regex_literal_mask(chars: &[char]) -> Vec<bool> {
    let mut mask = vec![false; chars.len()];
    let mut seeking_open = false;
    let mut in_regex = false;
    for i in 0..chars.len() {
        if in_regex {
            mask[i] = true;
            if chars[i] == '/' {
                in_regex = false;
            }
            continue;
        }
        if seeking_open {
            if chars[i] == '/' {
                mask[i] = true;
                in_regex = true;
                seeking_open = false;
            }
            continue;
        }
        if i >= 1 && ((chars[i - 1] == '=' && chars[i] == '~') || (chars[i - 1] == '!' && chars[i] == '~')) {
            seeking_open = true;
        }
    }
    mask
}

fn parens_balanced(chars: &[char], mask: &[bool]) -> bool {
    let mut depth = 0i32;
    for i in 0..chars.len() {
        if mask[i] {
            continue;
        }
        match chars[i] {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn find_first_paren_set(chars: &[char], mask: &[bool]) -> Option<(usize, usize)> {
    let mut depth = 0i32;
    let mut start = None;
    for i in 0..chars.len() {
        if mask[i] {
            continue;
        }
        match chars[i] {
            '(' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start.unwrap(), i));
                }
            }
            _ => {}
        }
    }
    None
}

fn split_terms(expr: &str) -> (Vec<String>, Vec<String>) {
    let mut terms = Vec::new();
    let mut ops = Vec::new();
    let mut last = 0;
    for caps in SPLIT_OP_RE.captures_iter(expr) {
        let m = caps.get(0).unwrap();
        terms.push(expr[last..m.start()].to_string());
        ops.push(caps.get(1).unwrap().as_str().to_string());
        last = m.end();
    }
    terms.push(expr[last..].to_string());
    (terms, ops)
}

/// AND/OR chains of booleans are associative and commutative, so a plain
/// left fold already produces the spec's "all-AND single false -> false,
/// all-OR single true -> true" short-circuit result without special-casing;
/// the short-circuit rule is an evaluation-order concern that doesn't change
/// outcomes here since terms have no side effects.
fn fold(results: &[bool], ops: &[String]) -> bool {
    if results.is_empty() {
        return false;
    }
    let mut acc = results[0];
    for (i, op) in ops.iter().enumerate() {
        let is_and = op == "and" || op == "&&";
        let rhs = results[i + 1];
        acc = if is_and { acc && rhs } else { acc || rhs };
    }
    acc
}

fn split_operator(term: &str) -> Option<(&str, &str, &str)> {
    for op in OPERATORS {
        if let Some(idx) = term.find(op) {
            return Some((&term[..idx], op, &term[idx + op.len()..]));
        }
    }
    None
}

fn remove_quotes(s: &str) -> &str {
    s.trim().trim_matches('"')
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                n.to_string()
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn count_separated(value: &Value) -> usize {
    match value {
        Value::Array(arr) => arr.len(),
        Value::String(s) => s.split(|c| c == ';' || c == ',').count(),
        _ => 1,
    }
}

fn lookup_value(key: &str, index: Option<usize>, slicer: SlicerType, config: &ConfigMap) -> Option<Value> {
    if key == "num_extruders" && index.is_none() {
        if let Some(v) = config.get("extruders_count") {
            return Some(v.clone());
        }
        if let Some(v) = config.get("nozzle_diameter") {
            return Some(Value::from(count_separated(v)));
        }
        return None;
    }

    let raw = config.get(key)?;
    match index {
        None => {
            if slicer.is_prusaslicer_family() {
                Some(raw.clone())
            } else if let Value::Array(arr) = raw {
                if arr.len() == 1 {
                    Some(arr[0].clone())
                } else {
                    Some(raw.clone())
                }
            } else {
                Some(raw.clone())
            }
        }
        Some(idx) => {
            if let Value::Array(arr) = raw {
                if !slicer.is_prusaslicer_family() {
                    return arr.get(idx).cloned();
                }
            }
            let s = value_to_string(raw);
            s.split(|c| c == ';' || c == ',')
                .nth(idx)
                .map(|p| Value::String(p.to_string()))
        }
    }
}

fn parse_var_ref(term: &str) -> Option<(String, Option<usize>)> {
    let caps = VAR_RE.captures(term.trim())?;
    let key = caps.get(1)?.as_str().to_string();
    let index = caps.get(2).map(|m| m.as_str().parse::<usize>().unwrap_or(0));
    Some((key, index))
}

/// Evaluate one comparison/truthy term. Never errors: any malformed
/// comparison yields `false` so a broken condition never claims
/// compatibility (§7).
fn evaluate_single(term: &str, slicer: SlicerType, config: &ConfigMap) -> bool {
    let mut term = term.trim();
    let mut negate = false;
    if let Some(rest) = term.strip_prefix("! ") {
        negate = true;
        term = rest.trim();
    }

    let result = evaluate_single_inner(term, slicer, config);
    if negate { !result } else { result }
}

fn evaluate_single_inner(term: &str, slicer: SlicerType, config: &ConfigMap) -> bool {
    if term.eq_ignore_ascii_case("true") {
        return true;
    }
    if term.eq_ignore_ascii_case("false") {
        return false;
    }

    if let Some((lhs, op, rhs)) = split_operator(term) {
        let (key, index) = match parse_var_ref(lhs.trim()) {
            Some(v) => v,
            None => return false,
        };
        let Some(value) = lookup_value(&key, index, slicer, config) else {
            return false;
        };
        let value_str = value_to_string(&value);

        match op {
            "==" | "!=" => {
                let rhs_str = remove_quotes(rhs);
                let eq = value_str == rhs_str;
                if op == "==" { eq } else { !eq }
            }
            "=~" | "!~" => {
                let pattern = rhs.trim().trim_matches('/');
                let compiled = Regex::new(&format!("(?s)^(?:{pattern})"));
                let is_match = match compiled {
                    Ok(re) => re.is_match(&value_str),
                    Err(_) => false,
                };
                if op == "=~" { is_match } else { !is_match }
            }
            "<" | "<=" | ">" | ">=" => {
                let lv: Result<f64, _> = value_str.trim().parse();
                let rv: Result<f64, _> = remove_quotes(rhs).parse();
                match (lv, rv) {
                    (Ok(l), Ok(r)) => match op {
                        "<" => l < r,
                        "<=" => l <= r,
                        ">" => l > r,
                        ">=" => l >= r,
                        _ => unreachable!(),
                    },
                    _ => false,
                }
            }
            _ => false,
        }
    } else {
        match parse_var_ref(term) {
            Some((key, index)) => match lookup_value(&key, index, slicer, config) {
                Some(v) => {
                    let s = value_to_string(&v);
                    s == "1" || s == "true"
                }
                None => false,
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(pairs: &[(&str, Value)]) -> ConfigMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn scenario_4_condition() {
        let expr = r#"(nozzle_diameter[0] == 0.4 and printer_model =~ /X1.*/) or printer_settings_id == "test""#;

        let config1 = cfg(&[
            ("nozzle_diameter", Value::from(vec![0.4])),
            ("printer_model", Value::from("X1 Carbon")),
            ("printer_settings_id", Value::from("other")),
        ]);
        assert!(evaluate(expr, SlicerType::BambuStudio, &config1, None).unwrap());

        let config2 = cfg(&[
            ("nozzle_diameter", Value::from(vec![0.6])),
            ("printer_model", Value::from("X1 Carbon")),
            ("printer_settings_id", Value::from("other")),
        ]);
        assert!(!evaluate(expr, SlicerType::BambuStudio, &config2, None).unwrap());

        let config3 = cfg(&[
            ("nozzle_diameter", Value::from(vec![0.6])),
            ("printer_model", Value::from("X1 Carbon")),
            ("printer_settings_id", Value::from("test")),
        ]);
        assert!(evaluate(expr, SlicerType::BambuStudio, &config3, None).unwrap());
    }

    #[test]
    fn unbalanced_parens_is_an_error() {
        let config = cfg(&[]);
        assert!(evaluate("(a == 1", SlicerType::BambuStudio, &config, None).is_err());
    }

    #[test]
    fn malformed_comparison_is_false_not_error() {
        let config = cfg(&[("foo", Value::from("bar"))]);
        assert_eq!(evaluate("1bad$$ref == 1", SlicerType::BambuStudio, &config, None).unwrap(), false);
    }

    #[test]
    fn num_extruders_synthetic_from_nozzle_diameter() {
        let config = cfg(&[("nozzle_diameter", Value::from("0.4;0.6"))]);
        assert!(evaluate("num_extruders == 2", SlicerType::BambuStudio, &config, None).unwrap());
    }

    #[test]
    fn prusaslicer_keeps_semicolon_strings_for_indexing() {
        let config = cfg(&[("nozzle_diameter", Value::from("0.4;0.6"))]);
        assert!(evaluate("nozzle_diameter[1] == 0.6", SlicerType::PrusaSlicer, &config, None).unwrap());
    }

    #[test]
    fn missing_variable_never_claims_compatibility() {
        let config = cfg(&[]);
        assert!(!evaluate("printer_model != \"MK3\"", SlicerType::BambuStudio, &config, None).unwrap());
        assert!(!evaluate("printer_model !~ /MK3/", SlicerType::BambuStudio, &config, None).unwrap());
        assert!(!evaluate("printer_model == \"\"", SlicerType::BambuStudio, &config, None).unwrap());
    }
}
