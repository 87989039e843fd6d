//! Request parsing: path variables, conditional headers, HTTP dates.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use http::{header, HeaderMap};

use crate::error::{
    CondParseError, CoordParseError, MimeParseError, ParseError, TileJsonParseError,
};
use crate::state::{HttpRequestData, ParseKind, ParseResult, PathVars};
use crate::storage::{Condition, TileJsonFormat};
use crate::tile::TileCoord;

/// The HTTP standard date layout. Outgoing `Last-Modified` values are always
/// rendered in this format, in UTC, with the literal `GMT` suffix.
const HTTP_TIME_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format a timestamp for a `Last-Modified` header.
pub fn format_http_date(ts: &DateTime<Utc>) -> String {
    ts.format(HTTP_TIME_FORMAT).to_string()
}

/// Try the range of date layouts HTTP clients send, in order of preference.
///
/// First success wins. On total failure the reported error is the one from
/// the HTTP standard format.
pub fn parse_http_dates(date: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    // layouts with a literal GMT zone, interpreted as UTC
    const NAIVE_LAYOUTS: &[&str] = &[
        HTTP_TIME_FORMAT,
        "%A, %d-%b-%y %H:%M:%S GMT", // RFC 850
        "%a %b %e %H:%M:%S %Y",      // ANSI C asctime
        "%d %b %y %H:%M:%S GMT",     // RFC 822, GMT
        "%d %b %y %H:%M GMT",
    ];
    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(date, layout) {
            return Ok(naive.and_utc());
        }
    }

    // layouts carrying an offset; rfc2822 also accepts the obsolete zone
    // names RFC 1123 allows
    if let Ok(ts) = DateTime::parse_from_rfc2822(date) {
        return Ok(ts.with_timezone(&Utc));
    }
    for layout in ["%a, %d %b %Y %H:%M:%S %z", "%d %b %y %H:%M %z"] {
        if let Ok(ts) = DateTime::parse_from_str(date, layout) {
            return Ok(ts.with_timezone(&Utc));
        }
    }

    NaiveDateTime::parse_from_str(date, HTTP_TIME_FORMAT).map(|naive| naive.and_utc())
}

/// Collect the request attributes that get logged.
pub fn parse_http_data(
    path: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> HttpRequestData {
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    HttpRequestData {
        path: path.to_string(),
        api_key: query.get("api_key").filter(|v| !v.is_empty()).cloned(),
        user_agent: header_str(header::USER_AGENT),
        referrer: header_str(header::REFERER),
    }
}

/// Parse the conditional headers into a `Condition`.
///
/// An unparseable `If-Modified-Since` yields the partial condition plus the
/// error; the caller records a flag and proceeds without the timestamp.
pub fn parse_condition(headers: &HeaderMap) -> (Condition, Option<CondParseError>) {
    let mut cond = Condition::default();

    if let Some(etag) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        cond.if_none_match = Some(etag.to_string());
    }

    if let Some(date) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        match parse_http_dates(date) {
            Ok(ts) => cond.if_modified_since = Some(ts),
            Err(err) => return (cond, Some(CondParseError(err))),
        }
    }

    (cond, None)
}

// =============================================================================
// Metatile parser
// =============================================================================

/// Derives a `TileCoord`, content type, build id and conditional headers
/// from a metatile request.
pub struct MetatileParser {
    mime_map: HashMap<String, String>,
}

impl MetatileParser {
    pub fn new(mime_map: HashMap<String, String>) -> Self {
        Self { mime_map }
    }

    /// Parse the captured path variables `z`, `x`, `y` and `fmt`.
    ///
    /// Unknown formats are a `Mime` error (404); non-integer coordinates are
    /// a `Coord` error (400). A bad conditional date is *not* an error: it
    /// is recorded on the result and the request continues unconditioned.
    pub fn parse(
        &self,
        path: &str,
        vars: &PathVars,
        query: &HashMap<String, String>,
        headers: &HeaderMap,
    ) -> Result<ParseResult, ParseError> {
        let http_data = parse_http_data(path, query, headers);

        let fmt = vars.get("fmt").cloned().unwrap_or_default();
        let content_type = self
            .mime_map
            .get(&fmt)
            .ok_or_else(|| {
                ParseError::Mime(MimeParseError {
                    bad_format: fmt.clone(),
                })
            })?
            .clone();

        let mut coord_error = CoordParseError::default();
        let parse_var = |name: &str, bad: &mut Option<String>| -> i32 {
            let raw = vars.get(name).cloned().unwrap_or_default();
            match raw.parse() {
                Ok(value) => value,
                Err(_) => {
                    *bad = Some(raw);
                    0
                }
            }
        };
        let z = parse_var("z", &mut coord_error.bad_z);
        let x = parse_var("x", &mut coord_error.bad_x);
        let y = parse_var("y", &mut coord_error.bad_y);
        if coord_error.is_error() {
            return Err(ParseError::Coord(coord_error));
        }

        let (cond, cond_error) = parse_condition(headers);

        Ok(ParseResult {
            kind: ParseKind::Metatile {
                coord: TileCoord::new(z, x, y, fmt),
            },
            cond,
            content_type,
            http_data,
            build_id: query.get("buildid").filter(|v| !v.is_empty()).cloned(),
            cond_error,
        })
    }
}

// =============================================================================
// TileJson parser
// =============================================================================

/// Derives a `TileJsonFormat` from a tilejson request.
pub struct TileJsonParser;

impl TileJsonParser {
    pub fn parse(
        &self,
        path: &str,
        vars: &PathVars,
        query: &HashMap<String, String>,
        headers: &HeaderMap,
    ) -> Result<ParseResult, TileJsonParseError> {
        let http_data = parse_http_data(path, query, headers);

        let name = vars.get("fmt").cloned().unwrap_or_default();
        let format =
            TileJsonFormat::from_name(&name).ok_or(TileJsonParseError::Format(name))?;

        let (cond, cond_error) = parse_condition(headers);

        Ok(ParseResult {
            kind: ParseKind::TileJson { format },
            cond,
            content_type: "application/json".to_string(),
            http_data,
            build_id: query.get("buildid").filter(|v| !v.is_empty()).cloned(),
            cond_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mime_map() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("json".to_string(), "application/json".to_string());
        map.insert("mvt".to_string(), "application/x-protobuf".to_string());
        map
    }

    fn vars(pairs: &[(&str, &str)]) -> PathVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_http_dates_standard() {
        let expected = Utc.with_ymd_and_hms(2016, 11, 17, 12, 27, 0).unwrap();
        assert_eq!(
            parse_http_dates("Thu, 17 Nov 2016 12:27:00 GMT").unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_http_dates_alternates() {
        let expected = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        // RFC 850
        assert_eq!(
            parse_http_dates("Sunday, 06-Nov-94 08:49:37 GMT").unwrap(),
            expected
        );
        // ANSI C asctime
        assert_eq!(
            parse_http_dates("Sun Nov  6 08:49:37 1994").unwrap(),
            expected
        );
        // numeric offset
        assert_eq!(
            parse_http_dates("Sun, 06 Nov 1994 09:49:37 +0100").unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_http_dates_failure() {
        assert!(parse_http_dates("not a date").is_err());
        assert!(parse_http_dates("").is_err());
    }

    #[test]
    fn test_format_http_date() {
        let ts = Utc.with_ymd_and_hms(2016, 11, 17, 12, 27, 0).unwrap();
        assert_eq!(format_http_date(&ts), "Thu, 17 Nov 2016 12:27:00 GMT");
    }

    #[test]
    fn test_date_format_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 1, 23, 59, 59).unwrap();
        assert_eq!(parse_http_dates(&format_http_date(&ts)).unwrap(), ts);
    }

    #[test]
    fn test_parse_condition() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, "\"1234\"".parse().unwrap());
        headers.insert(
            header::IF_MODIFIED_SINCE,
            "Thu, 17 Nov 2016 12:27:00 GMT".parse().unwrap(),
        );

        let (cond, err) = parse_condition(&headers);
        assert!(err.is_none());
        assert_eq!(cond.if_none_match.as_deref(), Some("\"1234\""));
        assert_eq!(
            cond.if_modified_since,
            Some(Utc.with_ymd_and_hms(2016, 11, 17, 12, 27, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_condition_bad_date_keeps_etag() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, "\"1234\"".parse().unwrap());
        headers.insert(header::IF_MODIFIED_SINCE, "yesterday-ish".parse().unwrap());

        let (cond, err) = parse_condition(&headers);
        assert!(err.is_some());
        assert_eq!(cond.if_none_match.as_deref(), Some("\"1234\""));
        assert!(cond.if_modified_since.is_none());
    }

    #[test]
    fn test_metatile_parse_success() {
        let parser = MetatileParser::new(mime_map());
        let mut query = HashMap::new();
        query.insert("buildid".to_string(), "build-9".to_string());
        query.insert("api_key".to_string(), "secret".to_string());

        let result = parser
            .parse(
                "/all/12/637/936.json",
                &vars(&[("z", "12"), ("x", "637"), ("y", "936"), ("fmt", "json")]),
                &query,
                &HeaderMap::new(),
            )
            .unwrap();

        match &result.kind {
            ParseKind::Metatile { coord } => {
                assert_eq!(*coord, TileCoord::new(12, 637, 936, "json"));
            }
            other => panic!("expected metatile kind, got {:?}", other),
        }
        assert_eq!(result.content_type, "application/json");
        assert_eq!(result.build_id.as_deref(), Some("build-9"));
        assert_eq!(result.http_data.api_key.as_deref(), Some("secret"));
        assert!(result.cond_error.is_none());
    }

    #[test]
    fn test_metatile_parse_negative_coords() {
        let parser = MetatileParser::new(mime_map());
        let result = parser
            .parse(
                "/all/1/-1/0.json",
                &vars(&[("z", "1"), ("x", "-1"), ("y", "0"), ("fmt", "json")]),
                &HashMap::new(),
                &HeaderMap::new(),
            )
            .unwrap();
        assert_eq!(result.coord().unwrap().x, -1);
    }

    #[test]
    fn test_metatile_parse_unknown_format() {
        let parser = MetatileParser::new(mime_map());
        let err = parser
            .parse(
                "/all/0/0/0.xyz",
                &vars(&[("z", "0"), ("x", "0"), ("y", "0"), ("fmt", "xyz")]),
                &HashMap::new(),
                &HeaderMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ParseError::Mime(_)));
        assert_eq!(err.to_string(), "invalid format: xyz");
    }

    #[test]
    fn test_metatile_parse_bad_coord() {
        let parser = MetatileParser::new(mime_map());
        let err = parser
            .parse(
                "/all/zero/0/0.json",
                &vars(&[("z", "zero"), ("x", "0"), ("y", "0"), ("fmt", "json")]),
                &HashMap::new(),
                &HeaderMap::new(),
            )
            .unwrap_err();
        match err {
            ParseError::Coord(coord_err) => {
                assert_eq!(coord_err.bad_z.as_deref(), Some("zero"));
                assert!(coord_err.bad_x.is_none());
            }
            other => panic!("expected coord error, got {:?}", other),
        }
    }

    #[test]
    fn test_metatile_parse_bad_condition_is_recoverable() {
        let parser = MetatileParser::new(mime_map());
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MODIFIED_SINCE, "garbage".parse().unwrap());

        let result = parser
            .parse(
                "/all/0/0/0.json",
                &vars(&[("z", "0"), ("x", "0"), ("y", "0"), ("fmt", "json")]),
                &HashMap::new(),
                &headers,
            )
            .unwrap();
        assert!(result.cond_error.is_some());
        assert!(result.cond.if_modified_since.is_none());
    }

    #[test]
    fn test_tilejson_parse() {
        let parser = TileJsonParser;
        let result = parser
            .parse(
                "/tilejson/mapbox.json",
                &vars(&[("fmt", "mapbox")]),
                &HashMap::new(),
                &HeaderMap::new(),
            )
            .unwrap();
        assert!(matches!(
            result.kind,
            ParseKind::TileJson {
                format: TileJsonFormat::Mvt
            }
        ));
        assert_eq!(result.content_type, "application/json");
    }

    #[test]
    fn test_tilejson_parse_unknown_format() {
        let parser = TileJsonParser;
        let err = parser
            .parse(
                "/tilejson/mapzen.json",
                &vars(&[("fmt", "mapzen")]),
                &HashMap::new(),
                &HeaderMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, TileJsonParseError::Format(_)));
    }
}
