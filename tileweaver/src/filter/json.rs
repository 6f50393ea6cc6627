//! JSON filter grammar.
//!
//! Mirrors the text grammar operator for operator, so both parsers
//! build identical [`FilterExpression`] trees. Every node is an object
//! of the form `{"op": "...", "args": [...]}`; operands are
//! `{"property": "name"}`, `{"bbox": [x1, y1, x2, y2]}`,
//! `{"timestamp": "..."}`, `{"interval": [start, end]}` or plain JSON
//! literals.

use serde_json::Value;

use super::FilterParseError;
use crate::filter::expr::{
    ComparisonOp, FilterExpression, Literal, TemporalOperand, TemporalParseError, TemporalValue,
};
use crate::geo::{BoundingBox, Crs};

/// Parses a filter in the JSON grammar.
pub fn parse_json(input: &str) -> Result<FilterExpression, FilterParseError> {
    let value: Value =
        serde_json::from_str(input).map_err(|e| FilterParseError::InvalidJson(e.to_string()))?;
    parse_node(&value)
}

fn parse_node(value: &Value) -> Result<FilterExpression, FilterParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| FilterParseError::InvalidJson("expected an object node".to_string()))?;
    let op = obj
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| FilterParseError::InvalidJson("node is missing 'op'".to_string()))?;
    let args = obj
        .get("args")
        .and_then(Value::as_array)
        .ok_or_else(|| FilterParseError::InvalidJson("node is missing 'args'".to_string()))?;

    match op {
        "and" | "or" => {
            if args.len() < 2 {
                return Err(bad_args(op, "at least two operands"));
            }
            let parts = args.iter().map(parse_node).collect::<Result<Vec<_>, _>>()?;
            Ok(if op == "and" {
                FilterExpression::And(parts)
            } else {
                FilterExpression::Or(parts)
            })
        }
        "not" => {
            if args.len() != 1 {
                return Err(bad_args(op, "exactly one operand"));
            }
            Ok(FilterExpression::Not(Box::new(parse_node(&args[0])?)))
        }
        "=" | "<>" | "<" | ">" | "<=" | ">=" => {
            let (property, value) = two_args(op, args)?;
            let comparison = match op {
                "=" => ComparisonOp::Eq,
                "<>" => ComparisonOp::Neq,
                "<" => ComparisonOp::Lt,
                ">" => ComparisonOp::Gt,
                "<=" => ComparisonOp::Lte,
                _ => ComparisonOp::Gte,
            };
            Ok(FilterExpression::Comparison {
                op: comparison,
                property: parse_property(property, op)?,
                value: parse_literal(value, op)?,
            })
        }
        "like" => {
            let (property, pattern) = two_args(op, args)?;
            let pattern = pattern
                .as_str()
                .ok_or_else(|| bad_args(op, "a string pattern"))?;
            Ok(FilterExpression::Like {
                property: parse_property(property, op)?,
                pattern: pattern.to_string(),
                wildcard: '%',
            })
        }
        "in" => {
            let (property, list) = two_args(op, args)?;
            let list = list
                .as_array()
                .ok_or_else(|| bad_args(op, "an array of literals"))?;
            let values = list
                .iter()
                .map(|v| parse_literal(v, op))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FilterExpression::In {
                property: parse_property(property, op)?,
                values,
            })
        }
        "intersects" => {
            let (property, geometry) = two_args(op, args)?;
            Ok(FilterExpression::SIntersects {
                property: parse_property(property, op)?,
                envelope: parse_bbox(geometry, op)?,
            })
        }
        "anyinteracts" => {
            let (property, value) = two_args(op, args)?;
            let path = parse_property(property, op)?;
            Ok(FilterExpression::TAnyInteracts {
                operand: TemporalOperand::from_path(&path),
                value: parse_temporal(value, op)?,
            })
        }
        "tequals" => {
            let (property, value) = two_args(op, args)?;
            Ok(FilterExpression::TEquals {
                property: parse_property(property, op)?,
                value: parse_temporal(value, op)?,
            })
        }
        other => Err(FilterParseError::UnknownOperator(other.to_string())),
    }
}

fn two_args<'a>(op: &str, args: &'a [Value]) -> Result<(&'a Value, &'a Value), FilterParseError> {
    if args.len() != 2 {
        return Err(bad_args(op, "exactly two operands"));
    }
    Ok((&args[0], &args[1]))
}

fn bad_args(op: &str, expected: &str) -> FilterParseError {
    FilterParseError::BadArguments {
        op: op.to_string(),
        expected: expected.to_string(),
    }
}

fn parse_property(value: &Value, op: &str) -> Result<String, FilterParseError> {
    value
        .as_object()
        .and_then(|obj| obj.get("property"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| bad_args(op, "a property reference"))
}

fn parse_literal(value: &Value, op: &str) -> Result<Literal, FilterParseError> {
    match value {
        Value::String(s) => Ok(Literal::String(s.clone())),
        Value::Number(n) => n
            .as_f64()
            .map(Literal::Number)
            .ok_or_else(|| bad_args(op, "a finite number")),
        Value::Bool(b) => Ok(Literal::Bool(*b)),
        _ => Err(bad_args(op, "a string, number or boolean literal")),
    }
}

fn parse_bbox(value: &Value, op: &str) -> Result<BoundingBox, FilterParseError> {
    let coords = value
        .as_object()
        .and_then(|obj| obj.get("bbox"))
        .and_then(Value::as_array)
        .ok_or_else(|| bad_args(op, "a bbox operand"))?;
    if coords.len() != 4 {
        return Err(bad_args(op, "a bbox with four coordinates"));
    }
    let mut numbers = [0.0; 4];
    for (slot, coord) in numbers.iter_mut().zip(coords) {
        *slot = coord
            .as_f64()
            .ok_or_else(|| bad_args(op, "numeric bbox coordinates"))?;
    }
    Ok(BoundingBox::new(
        numbers[0],
        numbers[1],
        numbers[2],
        numbers[3],
        Crs::CRS84,
    ))
}

fn parse_temporal(value: &Value, op: &str) -> Result<TemporalValue, FilterParseError> {
    let raw = match value {
        Value::String(s) if s.eq_ignore_ascii_case("now") => return Ok(TemporalValue::Now),
        Value::Object(obj) => {
            if let Some(ts) = obj.get("timestamp").and_then(Value::as_str) {
                ts.to_string()
            } else if let Some(sides) = obj.get("interval").and_then(Value::as_array) {
                if sides.len() != 2 {
                    return Err(bad_args(op, "an interval with two sides"));
                }
                let start = sides[0]
                    .as_str()
                    .ok_or_else(|| bad_args(op, "string interval sides"))?;
                let end = sides[1]
                    .as_str()
                    .ok_or_else(|| bad_args(op, "string interval sides"))?;
                format!("{}/{}", start, end)
            } else {
                return Err(bad_args(op, "a timestamp or interval operand"));
            }
        }
        _ => return Err(bad_args(op, "a timestamp or interval operand")),
    };

    TemporalValue::parse(&raw).map_err(|e| match e {
        TemporalParseError::Unparseable(s) => FilterParseError::InvalidTimestamp(s),
        TemporalParseError::StartAfterEnd { .. } => FilterParseError::InvalidInterval,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::text::parse_text;

    #[test]
    fn test_parse_comparison() {
        let expr = parse_json(r#"{"op": "=", "args": [{"property": "name"}, "main street"]}"#)
            .unwrap();
        assert_eq!(
            expr,
            FilterExpression::Comparison {
                op: ComparisonOp::Eq,
                property: "name".to_string(),
                value: Literal::String("main street".to_string()),
            }
        );
    }

    #[test]
    fn test_both_grammars_build_identical_trees() {
        let text = parse_text("name = 'central' AND lanes >= 4 OR NOT covered = TRUE").unwrap();
        let json = parse_json(
            r#"{
                "op": "or",
                "args": [
                    {"op": "and", "args": [
                        {"op": "=", "args": [{"property": "name"}, "central"]},
                        {"op": ">=", "args": [{"property": "lanes"}, 4]}
                    ]},
                    {"op": "not", "args": [
                        {"op": "=", "args": [{"property": "covered"}, true]}
                    ]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(text, json);
    }

    #[test]
    fn test_parse_intersects_bbox() {
        let expr = parse_json(
            r#"{"op": "intersects", "args": [{"property": "geom"}, {"bbox": [5.0, 50.0, 6.0, 51.0]}]}"#,
        )
        .unwrap();
        match expr {
            FilterExpression::SIntersects { property, envelope } => {
                assert_eq!(property, "geom");
                assert_eq!(envelope.min_x, 5.0);
                assert_eq!(envelope.max_y, 51.0);
            }
            other => panic!("expected SIntersects, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_anyinteracts_open_interval() {
        let expr = parse_json(
            r#"{"op": "anyinteracts", "args": [{"property": "built"}, {"interval": ["2020-01-01T00:00:00Z", ".."]}]}"#,
        )
        .unwrap();
        match expr {
            FilterExpression::TAnyInteracts { operand, value } => {
                assert_eq!(operand, TemporalOperand::Instant("built".to_string()));
                assert!(matches!(
                    value,
                    TemporalValue::Interval { start: Some(_), end: None }
                ));
            }
            other => panic!("expected TAnyInteracts, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_anyinteracts_interval_field_operand() {
        let expr = parse_json(
            r#"{"op": "anyinteracts", "args": [{"property": "start/end"}, {"timestamp": "2020-06-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        match expr {
            FilterExpression::TAnyInteracts { operand, .. } => {
                assert!(operand.is_interval());
            }
            other => panic!("expected TAnyInteracts, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_like_and_in() {
        let expr =
            parse_json(r#"{"op": "like", "args": [{"property": "name"}, "%bridge%"]}"#).unwrap();
        assert!(matches!(expr, FilterExpression::Like { wildcard: '%', .. }));

        let expr = parse_json(
            r#"{"op": "in", "args": [{"property": "class"}, ["primary", "secondary"]]}"#,
        )
        .unwrap();
        assert!(matches!(expr, FilterExpression::In { ref values, .. } if values.len() == 2));
    }

    #[test]
    fn test_error_unknown_operator() {
        let result = parse_json(r#"{"op": "touches", "args": []}"#);
        assert_eq!(
            result.unwrap_err(),
            FilterParseError::UnknownOperator("touches".to_string())
        );
    }

    #[test]
    fn test_error_invalid_json() {
        assert!(matches!(
            parse_json("{not json").unwrap_err(),
            FilterParseError::InvalidJson(_)
        ));
    }

    #[test]
    fn test_error_wrong_arity() {
        let result = parse_json(r#"{"op": "=", "args": [{"property": "a"}]}"#);
        assert!(matches!(
            result.unwrap_err(),
            FilterParseError::BadArguments { .. }
        ));
    }

    #[test]
    fn test_error_interval_start_after_end() {
        let result = parse_json(
            r#"{"op": "tequals", "args": [{"property": "t"}, {"interval": ["2021-01-01T00:00:00Z", "2020-01-01T00:00:00Z"]}]}"#,
        );
        assert_eq!(result.unwrap_err(), FilterParseError::InvalidInterval);
    }
}
