//! Frame sinks

mod files;
mod http;
mod multipart;
mod stdout;

pub use files::FileSink;
pub use http::HttpListener;
pub use multipart::{boundary_token, MultipartSink, BOUNDARY_LEN, SERVER_NAME};
pub use stdout::StreamSink;

use crate::filter::FilteredFrame;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("unexpected request: {0:?}")]
    BadRequest(String),
}

/// Consumes filtered frames and delivers them somewhere.
pub trait Sink {
    /// Drains `frame` completely and writes it out.
    fn put_frame(&mut self, frame: &mut FilteredFrame<'_>) -> Result<(), SinkError>;
}

/// Where frames go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Raw concatenated JPEGs on stdout
    Stdout,
    /// One numbered file per frame in a directory
    Files(PathBuf),
    /// Multipart HTTP response on stdout, for CGI use
    Cgi,
    /// Multipart HTTP response to the single client accepted on this port
    Http(u16),
}

/// Opens the sink for `target`. Blocks until a client connects for HTTP.
pub fn open(target: &OutputTarget) -> Result<Box<dyn Sink + Send>, SinkError> {
    info!(?target, "Opening output");
    let sink: Box<dyn Sink + Send> = match target {
        OutputTarget::Stdout => Box::new(StreamSink::new(io::stdout())),
        OutputTarget::Files(dir) => Box::new(FileSink::create(dir)?),
        OutputTarget::Cgi => Box::new(MultipartSink::new(io::stdout())?),
        OutputTarget::Http(port) => Box::new(HttpListener::bind(*port)?.accept()?),
    };
    Ok(sink)
}

/// Writes every remaining chunk of `frame`; returns the byte count.
pub(crate) fn write_chunks<W: Write>(out: &mut W, frame: &mut FilteredFrame<'_>) -> io::Result<usize> {
    let mut written = 0;
    loop {
        let chunk = frame.read();
        if chunk.is_empty() {
            return Ok(written);
        }
        out.write_all(chunk)?;
        written += chunk.len();
    }
}

/// Reads `frame` to the end without writing it anywhere.
pub(crate) fn discard(frame: &mut FilteredFrame<'_>) {
    while !frame.read().is_empty() {}
}
