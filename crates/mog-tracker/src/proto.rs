//! Wire encoding for the tracker line protocol.
//!
//! Requests are a single line `VERB key=val&key2=val2\r\n`; responses are
//! `OK <urlencoded args>\r\n` or `ERR <errcode> <urlencoded errstr>\r\n`.

use std::collections::HashMap;

use url::form_urlencoded;

use crate::TrackerError;

/// Encodes one request line.
pub fn encode_request(verb: &str, args: &[(&str, String)]) -> String {
    let mut ser = form_urlencoded::Serializer::new(String::new());
    for (key, value) in args {
        ser.append_pair(key, value);
    }
    let body = ser.finish();
    if body.is_empty() {
        format!("{verb}\r\n")
    } else {
        format!("{verb} {body}\r\n")
    }
}

/// Parses one response line into its argument map, or a typed tracker error.
pub fn parse_response(line: &str) -> Result<HashMap<String, String>, TrackerError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == "OK" {
        return Ok(HashMap::new());
    }
    if let Some(rest) = line.strip_prefix("OK ") {
        return Ok(parse_args(rest));
    }
    if let Some(rest) = line.strip_prefix("ERR ") {
        let mut parts = rest.splitn(2, ' ');
        let errcode = parts.next().unwrap_or("unknown").to_string();
        let errstr = parts
            .next()
            .map(decode_component)
            .unwrap_or_else(|| errcode.clone());
        return Err(TrackerError::Tracker { errcode, errstr });
    }
    Err(TrackerError::Protocol(format!(
        "Unrecognized response line: {line:?}"
    )))
}

fn parse_args(encoded: &str) -> HashMap<String, String> {
    form_urlencoded::parse(encoded.as_bytes())
        .into_owned()
        .collect()
}

fn decode_component(raw: &str) -> String {
    form_urlencoded::parse(format!("v={raw}").as_bytes())
        .into_owned()
        .next()
        .map(|(_, v)| v)
        .unwrap_or_else(|| raw.to_string())
}

/// Fetches a required response argument.
pub(crate) fn need<'a>(
    args: &'a HashMap<String, String>,
    key: &str,
) -> Result<&'a str, TrackerError> {
    args.get(key)
        .map(String::as_str)
        .ok_or_else(|| TrackerError::Protocol(format!("Missing response argument {key:?}")))
}

/// Fetches a required numeric response argument.
pub(crate) fn need_u64(args: &HashMap<String, String>, key: &str) -> Result<u64, TrackerError> {
    let raw = need(args, key)?;
    raw.parse()
        .map_err(|_| TrackerError::Protocol(format!("Bad numeric argument {key}={raw:?}")))
}

/// Fetches an optional numeric response argument.
pub(crate) fn maybe_u64(args: &HashMap<String, String>, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request() {
        let line = encode_request("get_paths", &[("domain", "d".into()), ("key", "/a b".into())]);
        assert_eq!(line, "get_paths domain=d&key=%2Fa+b\r\n");

        let bare = encode_request("noop", &[]);
        assert_eq!(bare, "noop\r\n");
    }

    #[test]
    fn test_parse_ok() {
        let args = parse_response("OK paths=2&path1=http%3A%2F%2Fa&path2=http%3A%2F%2Fb\r\n")
            .expect("parses");
        assert_eq!(args.get("paths").map(String::as_str), Some("2"));
        assert_eq!(args.get("path1").map(String::as_str), Some("http://a"));
    }

    #[test]
    fn test_parse_ok_bare() {
        let args = parse_response("OK\r\n").expect("parses");
        assert!(args.is_empty());
    }

    #[test]
    fn test_parse_err() {
        let err = parse_response("ERR unknown_key unknown%20key\r\n").unwrap_err();
        match err {
            TrackerError::Tracker { errcode, errstr } => {
                assert_eq!(errcode, "unknown_key");
                assert_eq!(errstr, "unknown key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(parse_response("ERR unknown_key x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_response("HELLO"),
            Err(TrackerError::Protocol(_))
        ));
    }

    #[test]
    fn test_need_u64() {
        let mut args = HashMap::new();
        args.insert("fid".to_string(), "42".to_string());
        assert_eq!(need_u64(&args, "fid").unwrap(), 42);
        assert!(need_u64(&args, "devid").is_err());
    }
}
