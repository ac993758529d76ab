//! Multipart Form Bodies
//!
//! Builds multipart/form-data bodies with a fixed boundary and a
//! pre-computed byte length, so uploads send an exact Content-Length and
//! stream without chunked encoding. Field names and filenames are encoded
//! the way browsers do: CR, LF and CRLF become `%0D%0A`, double quotes
//! become `%22`, nothing else is touched.

use std::path::PathBuf;

/// Fixed multipart boundary.
pub const BOUNDARY: &str = "-----background_downloader-akjhfw281onqciyhnIk";

const LINE_FEED: &str = "\r\n";

/// One piece of the request body: literal bytes or a file to stream.
#[derive(Debug, Clone)]
pub enum Segment {
    Bytes(Vec<u8>),
    File { path: PathBuf, length: u64 },
}

impl Segment {
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::File { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A fully laid-out multipart body
#[derive(Debug, Clone)]
pub struct MultipartBody {
    pub segments: Vec<Segment>,
    pub content_length: u64,
}

/// One file to include in the body
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub mime_type: String,
    pub path: PathBuf,
    pub length: u64,
}

/// Browser-style encoding for names and filenames inside header values.
pub fn browser_encode(value: &str) -> String {
    value
        .replace("\r\n", "%0D%0A")
        .replace('\r', "%0D%0A")
        .replace('\n', "%0D%0A")
        .replace('"', "%22")
}

/// Full bytes of one scalar field part, including the leading boundary.
fn field_part(name: &str, value: &str) -> Vec<u8> {
    let mut part = String::new();
    part.push_str("--");
    part.push_str(BOUNDARY);
    part.push_str(LINE_FEED);
    part.push_str(&format!(
        "content-disposition: form-data; name=\"{}\"{LINE_FEED}",
        browser_encode(name)
    ));
    if !value.is_ascii() {
        part.push_str("content-type: text/plain; charset=utf-8");
        part.push_str(LINE_FEED);
        part.push_str("content-transfer-encoding: binary");
        part.push_str(LINE_FEED);
    }
    part.push_str(LINE_FEED);
    part.push_str(value);
    part.push_str(LINE_FEED);
    part.into_bytes()
}

/// Header bytes of one file part, up to and including the blank line.
fn file_part_header(field: &str, filename: &str, mime_type: &str) -> Vec<u8> {
    format!(
        "--{BOUNDARY}{LINE_FEED}content-disposition: form-data; name=\"{}\"; filename=\"{}\"{LINE_FEED}content-type: {mime_type}{LINE_FEED}{LINE_FEED}",
        browser_encode(field),
        browser_encode(filename)
    )
    .into_bytes()
}

fn epilogue() -> Vec<u8> {
    format!("--{BOUNDARY}--{LINE_FEED}").into_bytes()
}

/// Lay out a complete body from scalar fields and file parts.
///
/// Fields are emitted in sorted key order so the body is deterministic.
pub fn build(fields: &std::collections::HashMap<String, String>, files: &[FilePart]) -> MultipartBody {
    let mut segments = Vec::new();
    let mut sorted_fields: Vec<(&String, &String)> = fields.iter().collect();
    sorted_fields.sort();
    for (name, value) in sorted_fields {
        segments.push(Segment::Bytes(field_part(name, value)));
    }
    for file in files {
        segments.push(Segment::Bytes(file_part_header(
            &file.field,
            &file.filename,
            &file.mime_type,
        )));
        segments.push(Segment::File {
            path: file.path.clone(),
            length: file.length,
        });
        segments.push(Segment::Bytes(LINE_FEED.as_bytes().to_vec()));
    }
    segments.push(Segment::Bytes(epilogue()));
    let content_length = segments.iter().map(Segment::len).sum();
    MultipartBody {
        segments,
        content_length,
    }
}

/// The Content-Type header value for a built body.
pub fn content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_browser_encode() {
        assert_eq!(browser_encode("plain"), "plain");
        assert_eq!(browser_encode("a\r\nb"), "a%0D%0Ab");
        assert_eq!(browser_encode("a\rb\nc"), "a%0D%0Ab%0D%0Ac");
        assert_eq!(browser_encode("say \"hi\""), "say %22hi%22");
    }

    #[test]
    fn test_ascii_field_part() {
        let part = String::from_utf8(field_part("key", "value")).unwrap();
        assert_eq!(
            part,
            format!(
                "--{BOUNDARY}\r\ncontent-disposition: form-data; name=\"key\"\r\n\r\nvalue\r\n"
            )
        );
    }

    #[test]
    fn test_non_ascii_field_gets_content_type() {
        let part = String::from_utf8(field_part("key", "héllo")).unwrap();
        assert!(part.contains("content-type: text/plain; charset=utf-8\r\n"));
        assert!(part.contains("content-transfer-encoding: binary\r\n"));
    }

    #[test]
    fn test_content_length_matches_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let file_path = tmp.path().join("hello.txt");
        std::fs::write(&file_path, b"hello world").unwrap();

        let fields = HashMap::from([("key".to_string(), "value".to_string())]);
        let files = [FilePart {
            field: "file".to_string(),
            filename: "hello.txt".to_string(),
            mime_type: "text/plain".to_string(),
            path: file_path,
            length: 11,
        }];
        let body = build(&fields, &files);

        // materialize the body and compare byte counts
        let mut actual = Vec::new();
        for segment in &body.segments {
            match segment {
                Segment::Bytes(bytes) => actual.extend_from_slice(bytes),
                Segment::File { path, .. } => {
                    actual.extend_from_slice(&std::fs::read(path).unwrap())
                }
            }
        }
        assert_eq!(actual.len() as u64, body.content_length);
        let text = String::from_utf8(actual).unwrap();
        assert!(text.starts_with(&format!("--{BOUNDARY}\r\n")));
        assert!(text.ends_with(&format!("--{BOUNDARY}--\r\n")));
        assert!(text.contains("name=\"key\"\r\n\r\nvalue\r\n"));
        assert!(text.contains("filename=\"hello.txt\""));
        assert!(text.contains("\r\n\r\nhello world\r\n"));
    }

    #[test]
    fn test_golden_body_for_fixture() {
        let tmp = tempfile::tempdir().unwrap();
        let file_path = tmp.path().join("hello.txt");
        std::fs::write(&file_path, b"hello world").unwrap();
        let fields = HashMap::from([("key".to_string(), "value".to_string())]);
        let files = [FilePart {
            field: "file".to_string(),
            filename: "hello.txt".to_string(),
            mime_type: "text/plain".to_string(),
            path: file_path,
            length: 11,
        }];
        let body = build(&fields, &files);

        let expected = format!(
            "--{BOUNDARY}\r\n\
             content-disposition: form-data; name=\"key\"\r\n\
             \r\n\
             value\r\n\
             --{BOUNDARY}\r\n\
             content-disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
             content-type: text/plain\r\n\
             \r\n\
             hello world\r\n\
             --{BOUNDARY}--\r\n"
        );
        assert_eq!(body.content_length, expected.len() as u64);
    }

    #[test]
    fn test_boundary_constant() {
        assert_eq!(BOUNDARY, "-----background_downloader-akjhfw281onqciyhnIk");
        assert_eq!(
            content_type(),
            "multipart/form-data; boundary=-----background_downloader-akjhfw281onqciyhnIk"
        );
    }
}
