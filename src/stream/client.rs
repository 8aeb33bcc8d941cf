//! Blocking reader for the broadcaster's multipart stream.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

pub struct MjpegReader<R> {
    reader: BufReader<R>,
    status: String,
    headers: Vec<(String, String)>,
    boundary: String,
}

impl MjpegReader<TcpStream> {
    /// Connect, send a minimal GET and consume the response head.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let mut stream =
            TcpStream::connect(addr).with_context(|| format!("failed to connect to {}", addr))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n")?;
        stream.flush()?;
        Self::new(stream)
    }
}

impl<R: Read> MjpegReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        let mut reader = BufReader::new(inner);
        let status = read_line(&mut reader)?.ok_or_else(|| anyhow!("empty response"))?;
        if !status.starts_with("HTTP/1.") || status.split_whitespace().nth(1) != Some("200") {
            bail!("unexpected status line '{}'", status);
        }
        let headers = read_headers(&mut reader)?;
        let boundary = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .and_then(|(_, value)| value.split_once("boundary="))
            .map(|(_, boundary)| boundary.trim().to_string())
            .filter(|boundary| !boundary.is_empty())
            .ok_or_else(|| anyhow!("response has no multipart boundary"))?;

        let mut out = Self {
            reader,
            status,
            headers,
            boundary,
        };
        out.expect_boundary()?;
        Ok(out)
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// First value of a response header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Next JPEG payload, or `None` once the server closes the stream.
    pub fn next_part(&mut self) -> Result<Option<Vec<u8>>> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let headers = read_headers(&mut self.reader)?;
        let length: usize = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .ok_or_else(|| anyhow!("part without Content-Length"))?
            .1
            .parse()
            .context("invalid part Content-Length")?;
        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .context("stream ended inside a part")?;
        match read_line(&mut self.reader)? {
            Some(line) if line.is_empty() => {}
            other => bail!("expected CRLF after part body, got {:?}", other),
        }
        self.expect_boundary()?;
        Ok(Some(body))
    }

    fn expect_boundary(&mut self) -> Result<()> {
        let expected = format!("--{}", self.boundary);
        match read_line(&mut self.reader)? {
            Some(line) if line == expected => Ok(()),
            other => Err(anyhow!("expected '{}', got {:?}", expected, other)),
        }
    }
}

/// One CRLF- or LF-terminated line without its terminator; `None` at EOF.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    Ok(Some(trimmed.to_string()))
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)?.ok_or_else(|| anyhow!("stream ended inside headers"))?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line '{}'", line))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{stream_header, write_part};

    #[test]
    fn reads_parts_written_by_the_broadcaster() {
        let mut wire = stream_header("frame").into_bytes();
        write_part(&mut wire, "frame", b"first").unwrap();
        write_part(&mut wire, "frame", b"sec\r\nond").unwrap();

        let mut reader = MjpegReader::new(wire.as_slice()).unwrap();
        assert_eq!(reader.boundary(), "frame");
        assert_eq!(reader.header("pragma"), Some("no-cache"));
        assert_eq!(reader.next_part().unwrap().unwrap(), b"first");
        assert_eq!(reader.next_part().unwrap().unwrap(), b"sec\r\nond");
        assert!(reader.next_part().unwrap().is_none());
    }

    #[test]
    fn rejects_non_multipart_responses() {
        let wire = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\n".to_vec();
        assert!(MjpegReader::new(wire.as_slice()).is_err());
        let wire = b"HTTP/1.0 404 Not Found\r\n\r\n".to_vec();
        assert!(MjpegReader::new(wire.as_slice()).is_err());
    }

    #[test]
    fn truncated_part_is_an_error() {
        let mut wire = stream_header("b").into_bytes();
        wire.extend_from_slice(b"Content-type: image/jpeg\r\nContent-Length: 10\r\n\r\nabc");
        let mut reader = MjpegReader::new(wire.as_slice()).unwrap();
        assert!(reader.next_part().is_err());
    }
}
