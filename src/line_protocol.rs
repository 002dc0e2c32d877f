//! InfluxDB line protocol encoding.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp
//! ```
//!
//! The timestamp is an epoch count in whatever unit the write request's
//! `precision` parameter declares.

use std::fmt;

/// A value that can be stored in an InfluxDB field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    /// Renders the value the way the line protocol spells it:
    /// floats bare, integers with an `i` suffix, strings double-quoted
    /// with inner quotes escaped, booleans as `true`/`false`.
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{v}"),
            FieldValue::Integer(v) => format!("{v}i"),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{escaped}\"")
            }
            FieldValue::Boolean(v) => v.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

/// Encodes one point.
///
/// Tags are written sorted by key for a canonical form, and tags with an
/// empty value are dropped entirely: the protocol has no way to express
/// them, and the backend rejects bare `key=`.
///
/// # Panics
/// Panics if `fields` is empty (InfluxDB requires at least one field).
pub fn encode_point(
    measurement: &str,
    tags: &[(&str, &str)],
    fields: &[(&str, FieldValue)],
    timestamp: i64,
) -> String {
    assert!(!fields.is_empty(), "InfluxDB requires at least one field");

    let mut line = escape_measurement(measurement);

    let mut sorted_tags: Vec<_> = tags.iter().filter(|(_, value)| !value.is_empty()).collect();
    sorted_tags.sort_by_key(|(key, _)| *key);
    for (key, value) in sorted_tags {
        line.push(',');
        line.push_str(&escape_tag_part(key));
        line.push('=');
        line.push_str(&escape_tag_part(value));
    }

    line.push(' ');

    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_tag_part(key));
        line.push('=');
        line.push_str(&value.to_line_protocol());
    }

    line.push(' ');
    line.push_str(&timestamp.to_string());

    line
}

/// Spaces and commas in a measurement must be backslash-escaped.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys share one escaping rule:
/// commas, equals signs and spaces are backslash-escaped.
fn escape_tag_part(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_float_fields_bare() {
        assert_eq!(FieldValue::Float(1.005).to_line_protocol(), "1.005");
        assert_eq!(FieldValue::Float(0.0).to_line_protocol(), "0");
    }

    #[test]
    fn renders_integer_fields_with_suffix() {
        assert_eq!(FieldValue::Integer(612).to_line_protocol(), "612i");
    }

    #[test]
    fn quotes_and_escapes_string_fields() {
        assert_eq!(
            FieldValue::String("agent \"Mozilla/5.0\"".to_string()).to_line_protocol(),
            "\"agent \\\"Mozilla/5.0\\\"\""
        );
    }

    #[test]
    fn renders_boolean_fields() {
        assert_eq!(FieldValue::Boolean(true).to_line_protocol(), "true");
        assert_eq!(FieldValue::Boolean(false).to_line_protocol(), "false");
    }

    #[test]
    fn encodes_point_with_sorted_tags() {
        let line = encode_point(
            "nginx_log",
            &[("Status", "200"), ("Method", "GET"), ("Path", "/foo")],
            &[("BytesSent", FieldValue::Integer(612))],
            1_452_220_818,
        );
        assert_eq!(
            line,
            "nginx_log,Method=GET,Path=/foo,Status=200 BytesSent=612i 1452220818"
        );
    }

    #[test]
    fn omits_tags_with_empty_values() {
        let line = encode_point(
            "nginx_log",
            &[("Path", ""), ("Method", "GET")],
            &[("BytesSent", FieldValue::Integer(0))],
            1,
        );
        assert_eq!(line, "nginx_log,Method=GET BytesSent=0i 1");
    }

    #[test]
    fn encodes_multiple_fields_in_order() {
        let line = encode_point(
            "nginx_log",
            &[],
            &[
                ("UpstreamTime", FieldValue::Float(1.005)),
                ("RequestTime", FieldValue::Float(1.854)),
                ("BytesSent", FieldValue::Integer(612)),
            ],
            9,
        );
        assert_eq!(
            line,
            "nginx_log UpstreamTime=1.005,RequestTime=1.854,BytesSent=612i 9"
        );
    }

    #[test]
    fn escapes_special_characters_in_measurement_and_tags() {
        let line = encode_point(
            "nginx log",
            &[("Path", "/search,q=rust lang")],
            &[("BytesSent", FieldValue::Integer(17))],
            3,
        );
        assert_eq!(
            line,
            "nginx\\ log,Path=/search\\,q\\=rust\\ lang BytesSent=17i 3"
        );
    }
}
