//! SQL-like text filter grammar.
//!
//! Hand-written lexer and recursive-descent parser. Precedence from
//! loosest to tightest: `OR`, `AND`, `NOT`, predicates. Spatial tests
//! use the function form `INTERSECTS(prop, ENVELOPE(x1,y1,x2,y2))`,
//! temporal tests the infix forms `prop ANYINTERACTS a/b` and
//! `prop TEQUALS ts`.

use chrono::{DateTime, Utc};

use super::FilterParseError;
use crate::filter::expr::{
    ComparisonOp, FilterExpression, Literal, TemporalOperand, TemporalValue,
};
use crate::geo::{BoundingBox, Crs};

/// Parses a filter in the text grammar.
pub fn parse_text(input: &str) -> Result<FilterExpression, FilterParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    parser.expect_end()?;
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Timestamp(DateTime<Utc>),
    DotDot,
    LParen,
    RParen,
    Comma,
    Slash,
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(s) => format!("'{}'", s),
            Self::Str(_) => "string literal".to_string(),
            Self::Num(n) => format!("number {}", n),
            Self::Timestamp(_) => "timestamp".to_string(),
            Self::DotDot => "'..'".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Slash => "'/'".to_string(),
            Self::Eq => "'='".to_string(),
            Self::Neq => "'<>'".to_string(),
            Self::Lt => "'<'".to_string(),
            Self::Gt => "'>'".to_string(),
            Self::Lte => "'<='".to_string(),
            Self::Gte => "'>='".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, FilterParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, start));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, start));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, start));
                i += 1;
            }
            '/' => {
                tokens.push((Token::Slash, start));
                i += 1;
            }
            '=' => {
                tokens.push((Token::Eq, start));
                i += 1;
            }
            '<' => {
                i += 1;
                if chars.get(i) == Some(&'=') {
                    tokens.push((Token::Lte, start));
                    i += 1;
                } else if chars.get(i) == Some(&'>') {
                    tokens.push((Token::Neq, start));
                    i += 1;
                } else {
                    tokens.push((Token::Lt, start));
                }
            }
            '>' => {
                i += 1;
                if chars.get(i) == Some(&'=') {
                    tokens.push((Token::Gte, start));
                    i += 1;
                } else {
                    tokens.push((Token::Gt, start));
                }
            }
            '.' => {
                if chars.get(i + 1) == Some(&'.') {
                    tokens.push((Token::DotDot, start));
                    i += 2;
                } else {
                    return Err(FilterParseError::UnexpectedChar { ch: c, pos: start });
                }
            }
            '\'' => {
                let (s, next) = scan_string(&chars, i)?;
                tokens.push((Token::Str(s), start));
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while j < chars.len()
                    && (chars[j].is_ascii_alphanumeric() || chars[j] == '_' || chars[j] == '.')
                {
                    j += 1;
                }
                tokens.push((Token::Ident(chars[i..j].iter().collect()), start));
                i = j;
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let (token, next) = scan_number_or_timestamp(&chars, i)?;
                tokens.push((token, start));
                i = next;
            }
            _ => return Err(FilterParseError::UnexpectedChar { ch: c, pos: start }),
        }
    }

    Ok(tokens)
}

fn scan_string(chars: &[char], start: usize) -> Result<(String, usize), FilterParseError> {
    // chars[start] is the opening quote; '' inside is an escaped quote
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
            } else {
                return Ok((out, i + 1));
            }
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Err(FilterParseError::UnterminatedString(start))
}

fn scan_number_or_timestamp(
    chars: &[char],
    start: usize,
) -> Result<(Token, usize), FilterParseError> {
    let signed = chars[start] == '-' || chars[start] == '+';
    let mut i = start;
    if signed {
        i += 1;
    }

    let digits_start = i;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }

    // Four leading digits followed by '-' start a timestamp (2020-01-...)
    if !signed && i - digits_start == 4 && chars.get(i) == Some(&'-') {
        while i < chars.len()
            && (chars[i].is_ascii_digit()
                || matches!(chars[i], '-' | ':' | '+' | '.' | 'T' | 't' | 'Z' | 'z'))
        {
            i += 1;
        }
        let raw: String = chars[start..i].iter().collect();
        return match TemporalValue::parse(&raw) {
            Ok(TemporalValue::Instant(ts)) => Ok((Token::Timestamp(ts), i)),
            _ => Err(FilterParseError::InvalidTimestamp(raw)),
        };
    }

    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        i += 1;
        if i < chars.len() && (chars[i] == '-' || chars[i] == '+') {
            i += 1;
        }
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }

    let raw: String = chars[start..i].iter().collect();
    raw.parse::<f64>()
        .map(|n| (Token::Num(n), i))
        .map_err(|_| FilterParseError::InvalidNumber(raw))
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if let Some(Token::Ident(word)) = self.peek() {
            if word.eq_ignore_ascii_case(keyword) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), FilterParseError> {
        match self.advance() {
            Some((t, _)) if t == *expected => Ok(()),
            Some((t, pos)) => Err(FilterParseError::Unexpected {
                expected: what.to_string(),
                found: t.describe(),
                pos,
            }),
            None => Err(FilterParseError::UnexpectedEnd(what.to_string())),
        }
    }

    fn expect_end(&mut self) -> Result<(), FilterParseError> {
        match self.tokens.get(self.pos) {
            None => Ok(()),
            Some((_, pos)) => Err(FilterParseError::TrailingInput(*pos)),
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpression, FilterParseError> {
        let mut parts = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            parts.push(self.parse_and()?);
        }
        Ok(collapse(parts, FilterExpression::Or))
    }

    fn parse_and(&mut self) -> Result<FilterExpression, FilterParseError> {
        let mut parts = vec![self.parse_unary()?];
        while self.eat_keyword("AND") {
            parts.push(self.parse_unary()?);
        }
        Ok(collapse(parts, FilterExpression::And))
    }

    fn parse_unary(&mut self) -> Result<FilterExpression, FilterParseError> {
        if self.eat_keyword("NOT") {
            return Ok(FilterExpression::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<FilterExpression, FilterParseError> {
        match self.advance() {
            Some((Token::LParen, _)) => {
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Some((Token::Ident(word), _)) if word.eq_ignore_ascii_case("INTERSECTS") => {
                self.parse_intersects()
            }
            Some((Token::Ident(property), _)) => self.parse_predicate(property),
            Some((t, pos)) => Err(FilterParseError::Unexpected {
                expected: "predicate".to_string(),
                found: t.describe(),
                pos,
            }),
            None => Err(FilterParseError::UnexpectedEnd("predicate".to_string())),
        }
    }

    fn parse_intersects(&mut self) -> Result<FilterExpression, FilterParseError> {
        self.expect(&Token::LParen, "'('")?;
        let property = self.parse_property()?;
        self.expect(&Token::Comma, "','")?;
        if !self.eat_keyword("ENVELOPE") {
            return self.unexpected("ENVELOPE");
        }
        self.expect(&Token::LParen, "'('")?;
        let min_x = self.parse_number()?;
        self.expect(&Token::Comma, "','")?;
        let min_y = self.parse_number()?;
        self.expect(&Token::Comma, "','")?;
        let max_x = self.parse_number()?;
        self.expect(&Token::Comma, "','")?;
        let max_y = self.parse_number()?;
        self.expect(&Token::RParen, "')'")?;
        self.expect(&Token::RParen, "')'")?;

        Ok(FilterExpression::SIntersects {
            property,
            envelope: BoundingBox::new(min_x, min_y, max_x, max_y, Crs::CRS84),
        })
    }

    fn parse_predicate(&mut self, property: String) -> Result<FilterExpression, FilterParseError> {
        let op = match self.peek() {
            Some(Token::Eq) => Some(ComparisonOp::Eq),
            Some(Token::Neq) => Some(ComparisonOp::Neq),
            Some(Token::Lt) => Some(ComparisonOp::Lt),
            Some(Token::Gt) => Some(ComparisonOp::Gt),
            Some(Token::Lte) => Some(ComparisonOp::Lte),
            Some(Token::Gte) => Some(ComparisonOp::Gte),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let value = self.parse_literal()?;
            return Ok(FilterExpression::Comparison {
                op,
                property,
                value,
            });
        }

        if self.eat_keyword("LIKE") {
            let pattern = match self.advance() {
                Some((Token::Str(s), _)) => s,
                Some((t, pos)) => {
                    return Err(FilterParseError::Unexpected {
                        expected: "pattern string".to_string(),
                        found: t.describe(),
                        pos,
                    })
                }
                None => return Err(FilterParseError::UnexpectedEnd("pattern string".to_string())),
            };
            return Ok(FilterExpression::Like {
                property,
                pattern,
                wildcard: '%',
            });
        }

        if self.eat_keyword("IN") {
            self.expect(&Token::LParen, "'('")?;
            let mut values = vec![self.parse_literal()?];
            while self.peek() == Some(&Token::Comma) {
                self.advance();
                values.push(self.parse_literal()?);
            }
            self.expect(&Token::RParen, "')'")?;
            return Ok(FilterExpression::In { property, values });
        }

        if self.eat_keyword("ANYINTERACTS") {
            let value = self.parse_temporal()?;
            return Ok(FilterExpression::TAnyInteracts {
                operand: TemporalOperand::Instant(property),
                value,
            });
        }

        if self.eat_keyword("TEQUALS") {
            let value = self.parse_temporal()?;
            return Ok(FilterExpression::TEquals { property, value });
        }

        self.unexpected("comparison operator, LIKE, IN, ANYINTERACTS or TEQUALS")
    }

    fn parse_temporal(&mut self) -> Result<TemporalValue, FilterParseError> {
        let start = match self.advance() {
            Some((Token::Timestamp(ts), _)) => Some(ts),
            Some((Token::DotDot, _)) => None,
            Some((Token::Ident(word), _)) if word.eq_ignore_ascii_case("NOW") => {
                return Ok(TemporalValue::Now);
            }
            Some((t, pos)) => {
                return Err(FilterParseError::Unexpected {
                    expected: "timestamp, '..' or NOW".to_string(),
                    found: t.describe(),
                    pos,
                })
            }
            None => {
                return Err(FilterParseError::UnexpectedEnd(
                    "timestamp, '..' or NOW".to_string(),
                ))
            }
        };

        if self.peek() != Some(&Token::Slash) {
            // A lone '..' makes no sense outside an interval
            return match start {
                Some(ts) => Ok(TemporalValue::Instant(ts)),
                None => Err(FilterParseError::UnexpectedEnd("'/'".to_string())),
            };
        }
        self.advance();

        let end = match self.advance() {
            Some((Token::Timestamp(ts), _)) => Some(ts),
            Some((Token::DotDot, _)) => None,
            Some((t, pos)) => {
                return Err(FilterParseError::Unexpected {
                    expected: "timestamp or '..'".to_string(),
                    found: t.describe(),
                    pos,
                })
            }
            None => return Err(FilterParseError::UnexpectedEnd("timestamp or '..'".to_string())),
        };

        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(FilterParseError::InvalidInterval);
            }
        }
        Ok(TemporalValue::Interval { start, end })
    }

    fn parse_literal(&mut self) -> Result<Literal, FilterParseError> {
        match self.advance() {
            Some((Token::Str(s), _)) => Ok(Literal::String(s)),
            Some((Token::Num(n), _)) => Ok(Literal::Number(n)),
            Some((Token::Ident(word), pos)) => {
                if word.eq_ignore_ascii_case("TRUE") {
                    Ok(Literal::Bool(true))
                } else if word.eq_ignore_ascii_case("FALSE") {
                    Ok(Literal::Bool(false))
                } else {
                    Err(FilterParseError::Unexpected {
                        expected: "literal".to_string(),
                        found: format!("'{}'", word),
                        pos,
                    })
                }
            }
            Some((t, pos)) => Err(FilterParseError::Unexpected {
                expected: "literal".to_string(),
                found: t.describe(),
                pos,
            }),
            None => Err(FilterParseError::UnexpectedEnd("literal".to_string())),
        }
    }

    fn parse_property(&mut self) -> Result<String, FilterParseError> {
        match self.advance() {
            Some((Token::Ident(name), _)) => Ok(name),
            Some((t, pos)) => Err(FilterParseError::Unexpected {
                expected: "property name".to_string(),
                found: t.describe(),
                pos,
            }),
            None => Err(FilterParseError::UnexpectedEnd("property name".to_string())),
        }
    }

    fn parse_number(&mut self) -> Result<f64, FilterParseError> {
        match self.advance() {
            Some((Token::Num(n), _)) => Ok(n),
            Some((t, pos)) => Err(FilterParseError::Unexpected {
                expected: "number".to_string(),
                found: t.describe(),
                pos,
            }),
            None => Err(FilterParseError::UnexpectedEnd("number".to_string())),
        }
    }

    fn unexpected<T>(&self, expected: &str) -> Result<T, FilterParseError> {
        match self.tokens.get(self.pos) {
            Some((t, pos)) => Err(FilterParseError::Unexpected {
                expected: expected.to_string(),
                found: t.describe(),
                pos: *pos,
            }),
            None => Err(FilterParseError::UnexpectedEnd(expected.to_string())),
        }
    }
}

fn collapse(
    mut parts: Vec<FilterExpression>,
    wrap: fn(Vec<FilterExpression>) -> FilterExpression,
) -> FilterExpression {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        wrap(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_equality() {
        let expr = parse_text("name = 'main street'").unwrap();
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
    fn test_parse_numeric_comparisons() {
        let expr = parse_text("lanes >= 4").unwrap();
        assert_eq!(
            expr,
            FilterExpression::Comparison {
                op: ComparisonOp::Gte,
                property: "lanes".to_string(),
                value: Literal::Number(4.0),
            }
        );

        let expr = parse_text("height < -12.5").unwrap();
        assert!(matches!(
            expr,
            FilterExpression::Comparison {
                op: ComparisonOp::Lt,
                value: Literal::Number(n),
                ..
            } if n == -12.5
        ));
    }

    #[test]
    fn test_parse_and_binds_tighter_than_or() {
        let expr = parse_text("a = 1 AND b = 2 OR c = 3").unwrap();
        match expr {
            FilterExpression::Or(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[0], FilterExpression::And(ref inner) if inner.len() == 2));
            }
            other => panic!("expected OR at top level, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_parentheses_override_precedence() {
        let expr = parse_text("a = 1 AND (b = 2 OR c = 3)").unwrap();
        match expr {
            FilterExpression::And(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[1], FilterExpression::Or(ref inner) if inner.len() == 2));
            }
            other => panic!("expected AND at top level, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_and_chain_flattens() {
        let expr = parse_text("a = 1 AND b = 2 AND c = 3").unwrap();
        assert!(matches!(expr, FilterExpression::And(ref parts) if parts.len() == 3));
    }

    #[test]
    fn test_parse_not() {
        let expr = parse_text("NOT status = 'closed'").unwrap();
        assert!(matches!(expr, FilterExpression::Not(_)));
    }

    #[test]
    fn test_parse_like_and_in() {
        let expr = parse_text("name LIKE '%bridge%'").unwrap();
        assert_eq!(
            expr,
            FilterExpression::Like {
                property: "name".to_string(),
                pattern: "%bridge%".to_string(),
                wildcard: '%',
            }
        );

        let expr = parse_text("class IN ('primary', 'secondary')").unwrap();
        assert!(matches!(expr, FilterExpression::In { ref values, .. } if values.len() == 2));
    }

    #[test]
    fn test_parse_intersects_envelope() {
        let expr = parse_text("INTERSECTS(geom, ENVELOPE(-122.5, 37.7, -122.3, 37.9))").unwrap();
        match expr {
            FilterExpression::SIntersects { property, envelope } => {
                assert_eq!(property, "geom");
                assert_eq!(envelope.min_x, -122.5);
                assert_eq!(envelope.max_y, 37.9);
                assert_eq!(envelope.crs, Crs::CRS84);
            }
            other => panic!("expected SIntersects, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_anyinteracts_interval() {
        let expr = parse_text("built ANYINTERACTS 2020-01-01T00:00:00Z/..").unwrap();
        match expr {
            FilterExpression::TAnyInteracts { operand, value } => {
                assert_eq!(operand, TemporalOperand::Instant("built".to_string()));
                assert!(value.is_interval());
            }
            other => panic!("expected TAnyInteracts, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tequals_instant() {
        let expr = parse_text("observed TEQUALS 2020-06-15T12:00:00Z").unwrap();
        assert!(matches!(
            expr,
            FilterExpression::TEquals { ref value, .. } if !value.is_interval()
        ));
    }

    #[test]
    fn test_parse_case_insensitive_keywords() {
        assert!(parse_text("a = 1 and not b = 2 or c like 'x%'").is_ok());
    }

    #[test]
    fn test_parse_escaped_quote_in_string() {
        let expr = parse_text("name = 'O''Brien'").unwrap();
        assert!(matches!(
            expr,
            FilterExpression::Comparison { value: Literal::String(ref s), .. } if s == "O'Brien"
        ));
    }

    #[test]
    fn test_parse_dotted_property_path() {
        let expr = parse_text("address.city = 'Berlin'").unwrap();
        assert!(matches!(
            expr,
            FilterExpression::Comparison { ref property, .. } if property == "address.city"
        ));
    }

    #[test]
    fn test_error_trailing_input() {
        assert!(matches!(
            parse_text("a = 1 b").unwrap_err(),
            FilterParseError::TrailingInput(_)
        ));
    }

    #[test]
    fn test_error_unterminated_string() {
        assert!(matches!(
            parse_text("name = 'oops").unwrap_err(),
            FilterParseError::UnterminatedString(_)
        ));
    }

    #[test]
    fn test_error_missing_operator() {
        assert!(matches!(
            parse_text("name").unwrap_err(),
            FilterParseError::UnexpectedEnd(_)
        ));
    }

    #[test]
    fn test_error_invalid_interval_order() {
        let result = parse_text("t ANYINTERACTS 2021-01-01T00:00:00Z/2020-01-01T00:00:00Z");
        assert_eq!(result.unwrap_err(), FilterParseError::InvalidInterval);
    }

    #[test]
    fn test_error_bad_character() {
        assert!(matches!(
            parse_text("a = #").unwrap_err(),
            FilterParseError::UnexpectedChar { ch: '#', .. }
        ));
    }
}
