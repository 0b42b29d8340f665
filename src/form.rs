//! Query-string and form-body parsing.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;

use bytes::Bytes;
use percent_encoding::percent_decode;
use url::form_urlencoded;

use crate::error::{Error, HttpError};

/// A multi-valued map of decoded `name=value` pairs. Values for a name keep
/// their order of appearance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values(HashMap<String, Vec<String>>);

impl Values {
    /// Decodes query-string syntax. Decoding never fails; malformed escapes
    /// are kept as-is.
    pub fn parse(input: &[u8]) -> Self {
        let mut values = Self::default();
        for (k, v) in form_urlencoded::parse(input) {
            values.add(k.into_owned(), v.into_owned());
        }
        values
    }

    /// Decodes an `application/x-www-form-urlencoded` body. A broken
    /// percent-escape or a value that is not UTF-8 once decoded is a 400.
    pub fn parse_body(input: &[u8]) -> Result<Self, Error> {
        let mut values = Self::default();
        for pair in input.split(|&b| b == b'&').filter(|p| !p.is_empty()) {
            let (name, value) = match pair.iter().position(|&b| b == b'=') {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, &[][..]),
            };
            values.add(decode_component(name)?, decode_component(value)?);
        }
        Ok(values)
    }

    /// The first value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

fn decode_component(raw: &[u8]) -> Result<String, Error> {
    let malformed = || Error::from(HttpError::BAD_REQUEST.with_message("malformed form body"));

    let mut rest = raw;
    while let Some(i) = rest.iter().position(|&b| b == b'%') {
        let escape = rest.get(i + 1..i + 3).ok_or_else(malformed)?;
        if !escape.iter().all(u8::is_ascii_hexdigit) {
            return Err(malformed());
        }
        rest = &rest[i + 3..];
    }

    let spaced: Vec<u8> = raw.iter().map(|&b| if b == b'+' { b' ' } else { b }).collect();
    percent_decode(&spaced)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| malformed())
}

/// An uploaded file part of a multipart body.
#[derive(Clone, Debug)]
pub struct FormFile {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// A decoded `multipart/form-data` body.
#[derive(Clone, Debug, Default)]
pub struct MultipartForm {
    pub values: Values,
    pub files: Vec<FormFile>,
}

/// Parses a multipart body held in memory. A body larger than `max_memory`
/// is rejected with 413; a malformed one with 400.
pub(crate) fn parse_multipart(
    content_type: &str,
    body: Bytes,
    max_memory: usize,
) -> Result<MultipartForm, Error> {
    let boundary = multer::parse_boundary(content_type).map_err(multipart_error)?;
    let constraints = multer::Constraints::new()
        .size_limit(multer::SizeLimit::new().whole_stream(max_memory as u64));
    let stream = futures::stream::once(async move { Ok::<_, io::Error>(body) });
    let mut multipart = multer::Multipart::with_constraints(stream, boundary, constraints);

    // The whole body is already in memory, so every await below is ready on
    // first poll.
    futures::executor::block_on(async move {
        let mut form = MultipartForm::default();
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_owned();
            match field.file_name().map(str::to_owned) {
                Some(file_name) => {
                    let content_type = field.content_type().map(ToString::to_string);
                    let data = field.bytes().await.map_err(multipart_error)?;
                    form.files.push(FormFile { field: name, file_name, content_type, data });
                }
                None => {
                    let text = field.text().await.map_err(multipart_error)?;
                    form.values.add(name, text);
                }
            }
        }
        Ok::<_, Error>(form)
    })
}

fn multipart_error(e: multer::Error) -> Error {
    let base = match e {
        multer::Error::StreamSizeExceeded { .. } | multer::Error::FieldSizeExceeded { .. } => {
            HttpError::PAYLOAD_TOO_LARGE
        }
        _ => HttpError::BAD_REQUEST,
    };
    base.with_message(e.to_string()).into()
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    const BOUNDARY: &str = "X-BOUNDARY";

    fn multipart_body() -> Bytes {
        Bytes::from(format!(
            "--{b}\r\n\
             Content-Disposition: form-data; name=\"name\"\r\n\r\n\
             Taro\r\n\
             --{b}\r\n\
             Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             file contents\r\n\
             --{b}--\r\n",
            b = BOUNDARY,
        ))
    }

    #[test]
    fn parses_urlencoded_values() {
        let v = Values::parse(b"id=1&name=Taro&tag=a&tag=b&q=hello%20world");
        assert_eq!(v.get("id"), Some("1"));
        assert_eq!(v.get("q"), Some("hello world"));
        assert_eq!(v.get_all("tag"), ["a", "b"]);
        assert_eq!(v.get("missing"), None);
        assert!(v.get_all("missing").is_empty());
    }

    #[test]
    fn form_body_decodes_plus_and_escapes() {
        let v = Values::parse_body(b"q=hello+world%21&empty=&flag&&tag=a&tag=b").unwrap();
        assert_eq!(v.get("q"), Some("hello world!"));
        assert_eq!(v.get("empty"), Some(""));
        assert_eq!(v.get("flag"), Some(""));
        assert_eq!(v.get_all("tag"), ["a", "b"]);
    }

    #[test]
    fn malformed_form_body_is_a_bad_request() {
        for bad in [&b"a=%zz"[..], b"a=%4", b"a%=1", b"a=%ff%fe", b"a=\xff"] {
            match Values::parse_body(bad) {
                Err(Error::Http(he)) => assert_eq!(he.code, StatusCode::BAD_REQUEST),
                other => panic!("{:?}: {other:?}", String::from_utf8_lossy(bad)),
            }
        }
        // The query string stays lenient.
        assert_eq!(Values::parse(b"a=%zz").get("a"), Some("%zz"));
    }

    #[test]
    fn parses_multipart_values_and_files() {
        let ct = format!("multipart/form-data; boundary={BOUNDARY}");
        let form = parse_multipart(&ct, multipart_body(), 1 << 20).unwrap();

        assert_eq!(form.values.get("name"), Some("Taro"));
        assert_eq!(form.files.len(), 1);
        let file = &form.files[0];
        assert_eq!(file.field, "upload");
        assert_eq!(file.file_name, "a.txt");
        assert_eq!(file.content_type.as_deref(), Some("text/plain"));
        assert_eq!(file.data.as_ref(), b"file contents");
    }

    #[test]
    fn multipart_over_threshold_is_413() {
        let ct = format!("multipart/form-data; boundary={BOUNDARY}");
        match parse_multipart(&ct, multipart_body(), 16) {
            Err(Error::Http(he)) => assert_eq!(he.code, StatusCode::PAYLOAD_TOO_LARGE),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn multipart_without_boundary_is_400() {
        match parse_multipart("multipart/form-data", multipart_body(), 1 << 20) {
            Err(Error::Http(he)) => assert_eq!(he.code, StatusCode::BAD_REQUEST),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
