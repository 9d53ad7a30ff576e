//! URI template instantiation
//!
//! Supports the subset of [RFC 6570](https://www.rfc-editor.org/rfc/rfc6570) used by Thing
//! Descriptions: simple expressions (`{name}`, `{a,b}`) and form-style query expressions
//! (`{?a,b}`, `{&a,b}`).

use std::collections::HashMap;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{
    error::{Error, Result},
    payload::PayloadValue,
    schema::{Datatype, Schema},
};

/// Everything but the RFC 3986 unreserved characters
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, PartialEq, Eq)]
enum Operator {
    Simple,
    Query,
    Continuation,
}

#[derive(Debug, PartialEq, Eq)]
enum Part<'a> {
    Literal(&'a str),
    Expression {
        operator: Operator,
        names: Vec<&'a str>,
    },
}

fn parse(template: &str) -> Result<Vec<Part<'_>>> {
    let mut parts = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        if start > 0 {
            parts.push(Part::Literal(&rest[..start]));
        }

        let end = rest[start..].find('}').ok_or_else(|| Error::InvalidUri {
            uri: template.to_owned(),
            reason: "unterminated template expression".to_owned(),
        })? + start;

        let expression = &rest[start + 1..end];
        let (operator, names) = match expression.as_bytes().first() {
            Some(b'?') => (Operator::Query, &expression[1..]),
            Some(b'&') => (Operator::Continuation, &expression[1..]),
            _ => (Operator::Simple, expression),
        };

        let names: Vec<_> = names.split(',').map(str::trim).collect();
        if names.iter().any(|name| name.is_empty()) {
            return Err(Error::InvalidUri {
                uri: template.to_owned(),
                reason: format!("empty variable name in \"{{{expression}}}\""),
            });
        }

        parts.push(Part::Expression { operator, names });
        rest = &rest[end + 1..];
    }

    if !rest.is_empty() {
        parts.push(Part::Literal(rest));
    }

    Ok(parts)
}

/// Variable names referenced by `template`, in order of appearance
pub fn variable_names(template: &str) -> Vec<String> {
    let Ok(parts) = parse(template) else {
        return Vec::new();
    };

    let mut names: Vec<String> = Vec::new();
    for part in parts {
        if let Part::Expression { names: vars, .. } = part {
            for var in vars {
                if !names.iter().any(|name| name == var) {
                    names.push(var.to_owned());
                }
            }
        }
    }

    names
}

/// Expand `template` with `values`, validating each value against its schema when present
pub fn expand<S: Schema>(
    template: &str,
    schemas: &HashMap<String, S>,
    values: &HashMap<String, PayloadValue>,
) -> Result<String> {
    if !template.contains('{') {
        return Ok(template.to_owned());
    }

    let mut out = String::with_capacity(template.len());
    for part in parse(template)? {
        match part {
            Part::Literal(literal) => out.push_str(literal),
            Part::Expression {
                operator: Operator::Simple,
                names,
            } => {
                let expanded = names
                    .into_iter()
                    .map(|name| {
                        let value = values
                            .get(name)
                            .ok_or_else(|| Error::MissingUriVariable(name.to_owned()))?;
                        encode_value(name, value, schemas.get(name))
                    })
                    .collect::<Result<Vec<_>>>()?;

                out.push_str(&expanded.join(","));
            }
            Part::Expression { operator, names } => {
                let mut first = operator == Operator::Query;
                for name in names {
                    let Some(value) = values.get(name) else {
                        continue;
                    };

                    out.push(if first { '?' } else { '&' });
                    first = false;
                    out.push_str(&utf8_percent_encode(name, COMPONENT).to_string());
                    out.push('=');
                    out.push_str(&encode_value(name, value, schemas.get(name))?);
                }
            }
        }
    }

    Ok(out)
}

fn encode_value<S: Schema>(name: &str, value: &PayloadValue, schema: Option<&S>) -> Result<String> {
    let invalid = || Error::InvalidUriVariableType {
        name: name.to_owned(),
        expected: schema.map_or(Datatype::String, |schema| schema.datatype()),
    };

    if let Some(schema) = schema {
        if !schema.validate(value) {
            return Err(invalid());
        }
    }

    let raw = match value {
        PayloadValue::Str(s) => s.clone(),
        PayloadValue::Bool(b) => b.to_string(),
        PayloadValue::Int(i) => i.to_string(),
        PayloadValue::Num(n) => n.to_string(),
        PayloadValue::Null | PayloadValue::Array(_) | PayloadValue::Object(_) => {
            return Err(invalid())
        }
    };

    Ok(utf8_percent_encode(&raw, COMPONENT).to_string())
}
