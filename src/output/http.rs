//! Single-client HTTP server

use super::{MultipartSink, SinkError};
use std::io::{self, BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use tracing::{debug, info};

const REQUEST_PREFIX: &[u8] = b"GET /";

/// Most bytes taken from the peer per read; longer lines come in several pieces.
const LINE_CHUNK: u64 = 128;

pub struct HttpListener {
    listener: TcpListener,
}

impl HttpListener {
    /// Listens on all IPv4 interfaces; port 0 picks a free one.
    pub fn bind(port: u16) -> Result<Self, SinkError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).map_err(|source| SinkError::Bind { addr, source })?;
        info!(addr = %listener.local_addr()?, "Waiting for HTTP client");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one client, checks its request and stops listening.
    pub fn accept(self) -> Result<MultipartSink<TcpStream>, SinkError> {
        let (stream, peer) = self.listener.accept()?;
        drop(self.listener);
        info!(%peer, "HTTP client connected");

        let mut reader = BufReader::new(stream.try_clone()?);
        read_request(&mut reader)?;
        MultipartSink::new(stream)
    }
}

/// Checks the request line and skips the headers up to the blank line.
///
/// Lines are handled as raw bytes, so header values in any charset pass.
fn read_request<R: BufRead>(reader: &mut R) -> Result<(), SinkError> {
    let mut line = Vec::with_capacity(LINE_CHUNK as usize);
    read_chunk(reader, &mut line)?;

    let request = String::from_utf8_lossy(&line);
    if !line.starts_with(REQUEST_PREFIX) {
        return Err(SinkError::BadRequest(request.trim_end().to_string()));
    }
    debug!(request = request.trim_end(), "HTTP request");

    while read_chunk(reader, &mut line)? > 0 {
        if line.iter().all(|&b| b == b'\r' || b == b'\n') {
            break;
        }
    }
    Ok(())
}

/// Reads up to the next newline, at most [`LINE_CHUNK`] bytes.
fn read_chunk<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<usize> {
    line.clear();
    reader.by_ref().take(LINE_CHUNK).read_until(b'\n', line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilteredFrame;
    use crate::output::Sink;
    use std::io::{Cursor, Read, Write};
    use std::thread;

    #[test]
    fn test_request_headers_skipped() {
        let mut input = Cursor::new(b"GET /stream HTTP/1.1\r\nHost: cam\r\nAccept: */*\r\n\r\nrest".to_vec());
        read_request(&mut input).unwrap();

        let mut rest = String::new();
        input.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "rest");
    }

    #[test]
    fn test_request_without_headers_end() {
        let mut input = Cursor::new(b"GET / HTTP/1.0\r\n".to_vec());
        assert!(read_request(&mut input).is_ok());
    }

    #[test]
    fn test_non_utf8_header_accepted() {
        let mut input = Cursor::new(b"GET / HTTP/1.0\r\nUser-Agent: caf\xe9\r\n\r\nrest".to_vec());
        read_request(&mut input).unwrap();

        let mut rest = Vec::new();
        input.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn test_long_header_read_in_pieces() {
        let mut request = b"GET /?action=stream HTTP/1.1\r\nCookie: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(1000));
        request.extend_from_slice(b"\r\n\r\nrest");

        let mut input = Cursor::new(request);
        read_request(&mut input).unwrap();

        let mut rest = Vec::new();
        input.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn test_request_line_read_is_bounded() {
        let mut request = b"PUT /".to_vec();
        request.extend(std::iter::repeat(b'x').take(4096));

        let mut input = Cursor::new(request);
        match read_request(&mut input) {
            Err(SinkError::BadRequest(line)) => assert_eq!(line.len(), LINE_CHUNK as usize),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(input.position(), LINE_CHUNK);
    }

    #[test]
    fn test_non_get_rejected() {
        let mut input = Cursor::new(b"POST /upload HTTP/1.1\r\n\r\n".to_vec());
        match read_request(&mut input) {
            Err(SinkError::BadRequest(line)) => assert_eq!(line, "POST /upload HTTP/1.1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_serves_one_client() {
        let listener = HttpListener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .write_all(b"GET / HTTP/1.0\r\nUser-Agent: caf\xe9\r\n\r\n")
                .unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            response
        });

        let mut sink = listener.accept().unwrap();
        let boundary = sink.boundary().to_string();
        sink.put_frame(&mut FilteredFrame::single(b"\xFF\xD8frame\xFF\xD9"))
            .unwrap();
        drop(sink);

        let response = String::from_utf8_lossy(&client.join().unwrap()).into_owned();
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains(&format!("boundary={}\r\n", boundary)));
        assert!(response.contains("Content-length: 9\r\n\r\n"));
        assert!(response.ends_with(&format!("\n--{}\r\n", boundary)));
    }
}
