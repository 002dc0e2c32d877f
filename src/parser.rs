use chrono::{DateTime, FixedOffset};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Combined log format plus the scheme, x-forwarded-for and timing fields
/// nginx appends with a customized `log_format`:
///
/// `addr ident authuser [time] scheme "request" status bytes "referrer"
///  "agent" "forwarded" upstream_time request_time`
static ACCESS_LOG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?P<addr>[\d\.]+)\s+(?P<ident>[^ \[]+)\s+(?P<authuser>[^ \[]+)\s+\[(?P<time>[^\]]+)\]\s+(?P<scheme>[a-z]+)\s+"(?P<request>[^"]+)"\s+(?P<status>\d{3})\s+(?P<bytes>\d+)\s+"(?P<referrer>[^"]+)"\s+"(?P<agent>.*?)"\s+"(?P<forwarded>[\d\.-]+)"\s+(?P<upstream>[\d\.-]+)\s+(?P<request_time>[\d\.-]+)"#,
    )
    .expect("access log pattern is valid")
});

/// Bracketed time layout, e.g. `08/Jan/2016:10:40:18 +0800`.
const TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// One structured access-log entry, ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Request time normalized to the configured reference offset.
    pub timestamp: DateTime<FixedOffset>,
    pub path: String,
    pub method: String,
    pub scheme: String,
    pub status: String,
    pub bytes_sent: u64,
    pub upstream_time: f64,
    pub request_time: f64,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("non-utf8 line content")]
    NonUtf8,

    #[error("line does not match the access log format")]
    Shape,

    #[error("invalid timestamp {0:?}: {1}")]
    Timestamp(String, chrono::ParseError),

    #[error("request line {0:?} does not split into method/target/protocol")]
    RequestLine(String),
}

/// Turns raw access-log lines into [`LogRecord`]s.
pub struct AccessLogParser {
    zone: FixedOffset,
}

impl AccessLogParser {
    /// `zone` is the fixed offset every record timestamp is normalized to,
    /// independent of the offset the line itself carries.
    pub fn new(zone: FixedOffset) -> Self {
        Self { zone }
    }

    pub fn parse(&self, line: &[u8]) -> Result<LogRecord, ParseError> {
        let text = std::str::from_utf8(line).map_err(|_| ParseError::NonUtf8)?;
        let captures = ACCESS_LOG_RE.captures(text).ok_or(ParseError::Shape)?;

        let raw_time = &captures["time"];
        let timestamp = DateTime::parse_from_str(raw_time, TIME_FORMAT)
            .map_err(|err| ParseError::Timestamp(raw_time.to_string(), err))?
            .with_timezone(&self.zone);

        let request = &captures["request"];
        let request_parts: Vec<&str> = request.split(' ').collect();
        if request_parts.len() != 3 {
            return Err(ParseError::RequestLine(request.to_string()));
        }
        let method = request_parts[0];
        let target = request_parts[1];

        // A garbled target still yields a record; only the path is lost.
        let path = match target.parse::<hyper::Uri>() {
            Ok(uri) => uri.path().to_string(),
            Err(err) => {
                warn!(error = %err, target, "unparseable request target; leaving path empty");
                String::new()
            }
        };

        Ok(LogRecord {
            timestamp,
            path,
            method: method.to_string(),
            scheme: captures["scheme"].to_string(),
            status: captures["status"].to_string(),
            bytes_sent: captures["bytes"].parse().unwrap_or(0),
            upstream_time: captures["upstream"].parse().unwrap_or(0.0),
            request_time: captures["request_time"].parse().unwrap_or(0.0),
        })
    }
}

/// Truncated, lossy rendering of a line for log output.
pub(crate) fn line_preview(line: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(line);
    let mut preview = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}
