/*!
Компилятор правил.

Правило в виде JSON-документа превращается в список плоских отображений
«путь через точку → список шаблонов»; каждое отображение — одно
конъюнктивное разворачивание правила. Ключ `$or` раскрывается декартовым
произведением разворачиваний своих ветвей с разворачиваниями соседей.
Ошибки возвращаются значениями с первым обнаруженным дефектом; машина
при этом не меняется.
*/

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::{
    Error, ErrorKind, cidr, input, num,
    pattern::{Pattern, ValueRange, json_quote},
};

// Matcher keys recognized inside leaf array elements. The third $or
// recognition condition checks against exactly this list.
const RESERVED_MATCHERS: [&str; 9] = [
    "prefix",
    "suffix",
    "equals-ignore-case",
    "wildcard",
    "exactly",
    "exists",
    "cidr",
    "numeric",
    "anything-but",
];

/// Компилирует правило в список конъюнктивных разворачиваний:
/// отображений «путь поля → список шаблонов».
pub fn compile(
    rule_json: &str,
) -> Result<Vec<HashMap<String, Vec<Pattern>>>, Error> {
    let value: Value = serde_json::from_str(rule_json).map_err(|err| {
        Error::new(ErrorKind::MalformedJson(err.to_string()))
    })?;
    let Value::Object(ref map) = value else {
        return Err(Error::new(ErrorKind::RuleNotObject));
    };
    compile_object(map, "")
}

/// Проверяет правило и возвращает первую синтаксическую ошибку, если
/// она есть.
///
/// ```
/// use ruler::{ErrorKind, check};
///
/// assert!(check(r#"{"state": ["running"]}"#).is_none());
///
/// let err = check(r#"{"state": []}"#).unwrap();
/// assert_eq!(err.kind(), &ErrorKind::EmptyArrayOrObject);
/// ```
pub fn check(rule_json: &str) -> Option<Error> {
    compile(rule_json).err()
}

fn compile_object(
    map: &Map<String, Value>,
    path: &str,
) -> Result<Vec<HashMap<String, Vec<Pattern>>>, Error> {
    if map.is_empty() {
        return Err(Error::new(ErrorKind::EmptyArrayOrObject));
    }
    let mut expansions: Vec<HashMap<String, Vec<Pattern>>> =
        vec![HashMap::new()];
    for (key, value) in map {
        let alternatives = if key == "$or" {
            match or_branches(value)? {
                Some(branches) => {
                    let mut alternatives = vec![];
                    for branch in branches {
                        alternatives.extend(compile_object(branch, path)?);
                    }
                    alternatives
                }
                None => compile_member(key, value, path)?,
            }
        } else {
            compile_member(key, value, path)?
        };
        expansions = cross(expansions, alternatives);
    }
    Ok(expansions)
}

// $or is a disjunction only when its value is an array of at least two
// objects none of which uses a reserved matcher key; any other shape is
// an ordinary field named "$or", kept for backward compatibility.
fn or_branches(
    value: &Value,
) -> Result<Option<Vec<&Map<String, Value>>>, Error> {
    let Value::Array(items) = value else {
        return Ok(None);
    };
    let mut branches = vec![];
    for item in items {
        let Value::Object(branch) = item else {
            return Ok(None);
        };
        if branch
            .keys()
            .any(|key| RESERVED_MATCHERS.contains(&key.as_str()))
        {
            return Ok(None);
        }
        branches.push(branch);
    }
    if branches.len() < 2 {
        return Err(Error::new(ErrorKind::OrMalformed(
            "требуется не меньше двух ветвей".to_string(),
        )));
    }
    Ok(Some(branches))
}

fn compile_member(
    key: &str,
    value: &Value,
    path: &str,
) -> Result<Vec<HashMap<String, Vec<Pattern>>>, Error> {
    match *value {
        Value::Object(ref nested) => compile_object(nested, &join(path, key)),
        Value::Array(ref items) => {
            let patterns = compile_leaf(items)?;
            Ok(vec![HashMap::from([(join(path, key), patterns)])])
        }
        _ => Err(Error::new(ErrorKind::MalformedPattern(format!(
            "value of field '{}' must be an object or an array",
            key,
        )))),
    }
}

fn compile_leaf(items: &[Value]) -> Result<Vec<Pattern>, Error> {
    if items.is_empty() {
        return Err(Error::new(ErrorKind::EmptyArrayOrObject));
    }
    let mut patterns = vec![];
    for item in items {
        match *item {
            Value::String(ref s) => {
                patterns.push(Pattern::Exact(json_quote(s)));
            }
            Value::Number(ref n) => {
                // Both forms: the canonical one for numeric comparison
                // and the textual one for string equality.
                patterns.push(Pattern::NumericEq(num::canonicalize(
                    n.as_f64().unwrap_or(f64::NAN),
                )?));
                patterns.push(Pattern::Exact(n.to_string()));
            }
            Value::Bool(b) => {
                patterns.push(Pattern::Exact(b.to_string()));
            }
            Value::Null => {
                patterns.push(Pattern::Exact("null".to_string()));
            }
            Value::Object(ref matcher) => {
                patterns.push(compile_matcher(matcher)?);
            }
            Value::Array(_) => {
                return Err(Error::new(ErrorKind::MalformedPattern(
                    "nested arrays are not allowed in a value list"
                        .to_string(),
                )));
            }
        }
    }
    Ok(patterns)
}

fn compile_matcher(matcher: &Map<String, Value>) -> Result<Pattern, Error> {
    if matcher.len() != 1 {
        return Err(Error::new(ErrorKind::MalformedPattern(
            "matcher object must have exactly one key".to_string(),
        )));
    }
    let (key, value) = matcher.iter().next().expect("non-empty object");
    match key.as_str() {
        "prefix" => Ok(Pattern::Prefix(json_quote(expect_string(
            key, value,
        )?))),
        "suffix" => Ok(Pattern::Suffix(json_quote(expect_string(
            key, value,
        )?))),
        "equals-ignore-case" => Ok(Pattern::EqualsIgnoreCase(json_quote(
            expect_string(key, value)?,
        ))),
        "exactly" => Ok(Pattern::Exact(json_quote(expect_string(
            key, value,
        )?))),
        "wildcard" => {
            let quoted = json_quote(expect_string(key, value)?);
            // Escapes are validated here so that additions can't fail.
            input::wildcard_chars(&quoted)?;
            Ok(Pattern::Wildcard(quoted))
        }
        "exists" => match *value {
            Value::Bool(true) => Ok(Pattern::Exists),
            Value::Bool(false) => Ok(Pattern::Absent),
            _ => Err(Error::new(ErrorKind::MalformedPattern(
                "'exists' requires true or false".to_string(),
            ))),
        },
        "cidr" => {
            let text = expect_string(key, value)?;
            Ok(Pattern::NumericRange(cidr::parse_cidr(text)?))
        }
        "numeric" => match *value {
            Value::Array(ref items) => compile_numeric(items),
            _ => Err(Error::new(ErrorKind::MalformedPattern(
                "'numeric' requires an array of comparisons".to_string(),
            ))),
        },
        "anything-but" => compile_anything_but(value),
        unknown => {
            Err(Error::new(ErrorKind::UnknownMatcher(unknown.to_string())))
        }
    }
}

fn compile_numeric(items: &[Value]) -> Result<Pattern, Error> {
    let malformed = |detail: &str| {
        Error::new(ErrorKind::MalformedPattern(detail.to_string()))
    };
    if items.len() != 2 && items.len() != 4 {
        return Err(malformed(
            "'numeric' requires one or two comparator/value pairs",
        ));
    }
    let mut pairs = vec![];
    for chunk in items.chunks(2) {
        let Value::String(ref op) = chunk[0] else {
            return Err(malformed("comparator must be a string"));
        };
        let Some(operand) = chunk[1].as_f64() else {
            return Err(malformed("comparison operand must be a number"));
        };
        pairs.push((op.as_str(), operand));
    }
    if pairs.len() == 1 {
        let (op, operand) = pairs[0];
        return match op {
            "=" => Pattern::numeric_eq(operand),
            ">" => {
                Ok(Pattern::NumericRange(ValueRange::greater_than(
                    operand, true,
                )?))
            }
            ">=" => {
                Ok(Pattern::NumericRange(ValueRange::greater_than(
                    operand, false,
                )?))
            }
            "<" => Ok(Pattern::NumericRange(ValueRange::less_than(
                operand, true,
            )?)),
            "<=" => Ok(Pattern::NumericRange(ValueRange::less_than(
                operand, false,
            )?)),
            _ => Err(malformed("unknown comparator")),
        };
    }
    let (bottom_op, bottom) = pairs[0];
    let (top_op, top) = pairs[1];
    let open_bottom = match bottom_op {
        ">" => true,
        ">=" => false,
        _ => {
            return Err(malformed(
                "a range must open with '>' or '>='",
            ));
        }
    };
    let open_top = match top_op {
        "<" => true,
        "<=" => false,
        _ => return Err(malformed("a range must close with '<' or '<='")),
    };
    Ok(Pattern::NumericRange(ValueRange::between(
        bottom,
        open_bottom,
        top,
        open_top,
    )?))
}

fn compile_anything_but(value: &Value) -> Result<Pattern, Error> {
    let malformed = |detail: &str| {
        Error::new(ErrorKind::MalformedPattern(detail.to_string()))
    };
    match *value {
        Value::String(ref s) => Ok(Pattern::AnythingBut {
            values: [json_quote(s)].into(),
            numeric: false,
        }),
        Value::Number(ref n) => Ok(Pattern::AnythingBut {
            values: [num::canonicalize(n.as_f64().unwrap_or(f64::NAN))?]
                .into(),
            numeric: true,
        }),
        Value::Array(ref items) => {
            if items.is_empty() {
                return Err(malformed("'anything-but' list must not be empty"));
            }
            if items.iter().all(|v| v.is_string()) {
                let values = items
                    .iter()
                    .map(|v| json_quote(v.as_str().expect("checked")))
                    .collect();
                Ok(Pattern::AnythingBut { values, numeric: false })
            } else if items.iter().all(|v| v.is_number()) {
                let mut values = std::collections::BTreeSet::new();
                for v in items {
                    values.insert(num::canonicalize(
                        v.as_f64().unwrap_or(f64::NAN),
                    )?);
                }
                Ok(Pattern::AnythingBut { values, numeric: true })
            } else {
                Err(malformed(
                    "'anything-but' list must be all strings or all numbers",
                ))
            }
        }
        Value::Object(ref variant) => {
            if variant.len() != 1 {
                return Err(malformed(
                    "'anything-but' object must have exactly one key",
                ));
            }
            let (key, payload) =
                variant.iter().next().expect("non-empty object");
            let values = string_set(key, payload)?;
            match key.as_str() {
                "prefix" => Ok(Pattern::AnythingButPrefix(values)),
                "suffix" => Ok(Pattern::AnythingButSuffix(values)),
                "equals-ignore-case" => {
                    Ok(Pattern::AnythingButIgnoreCase(values))
                }
                unknown => Err(Error::new(ErrorKind::UnknownMatcher(
                    format!("anything-but/{}", unknown),
                ))),
            }
        }
        _ => Err(malformed(
            "'anything-but' requires a value, a list or an object",
        )),
    }
}

fn string_set(
    key: &str,
    payload: &Value,
) -> Result<std::collections::BTreeSet<String>, Error> {
    match *payload {
        Value::String(ref s) => Ok([json_quote(s)].into()),
        Value::Array(ref items) if !items.is_empty() => items
            .iter()
            .map(|item| match *item {
                Value::String(ref s) => Ok(json_quote(s)),
                _ => Err(Error::new(ErrorKind::MalformedPattern(format!(
                    "'{}' values must be strings",
                    key,
                )))),
            })
            .collect(),
        _ => Err(Error::new(ErrorKind::MalformedPattern(format!(
            "'{}' requires a string or a non-empty list of strings",
            key,
        )))),
    }
}

fn expect_string<'v>(key: &str, value: &'v Value) -> Result<&'v str, Error> {
    value.as_str().ok_or_else(|| {
        Error::new(ErrorKind::MalformedPattern(format!(
            "'{}' requires a string",
            key,
        )))
    })
}

fn cross(
    left: Vec<HashMap<String, Vec<Pattern>>>,
    right: Vec<HashMap<String, Vec<Pattern>>>,
) -> Vec<HashMap<String, Vec<Pattern>>> {
    let mut product = Vec::with_capacity(left.len() * right.len());
    for base in &left {
        for extension in &right {
            let mut merged = base.clone();
            for (key, patterns) in extension {
                merged
                    .entry(key.clone())
                    .or_default()
                    .extend(patterns.iter().cloned());
            }
            product.push(merged);
        }
    }
    product
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}
