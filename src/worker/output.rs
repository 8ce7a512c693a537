// Line framing for worker pipes. Progress bars redraw with '\r', so both
// carriage return and newline end a line.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{AnyDelimiterCodec, Decoder};
use tracing::{debug, warn};

use crate::config::MAX_OUTPUT_LINE_BYTES;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Read `reader` to EOF, calling `on_line` for every non-empty line.
///
/// A line longer than `MAX_OUTPUT_LINE_BYTES` is dropped up to its next
/// delimiter; framing resumes with the line after it.
pub async fn for_each_line<R, F>(mut reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut codec =
        AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), Vec::new(), MAX_OUTPUT_LINE_BYTES);
    let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);

    loop {
        // The codec keeps discarding after an over-long chunk, so errors are not fatal.
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => emit(&frame, &mut on_line),
                Ok(None) => break,
                Err(e) => debug!("dropping worker output line: {}", e),
            }
        }

        buf.reserve(READ_CHUNK_BYTES);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("reading worker output failed: {}", e);
                return;
            }
        }
    }

    loop {
        match codec.decode_eof(&mut buf) {
            Ok(Some(frame)) => emit(&frame, &mut on_line),
            Ok(None) => break,
            Err(e) => debug!("dropping trailing worker output: {}", e),
        }
    }
}

fn emit<F: FnMut(&str)>(frame: &Bytes, on_line: &mut F) {
    if let Some(line) = decode_line(frame) {
        on_line(&line);
    }
}

/// Lossy UTF-8 text of one frame, trimmed; `None` for a blank frame.
fn decode_line(frame: &Bytes) -> Option<String> {
    let line = String::from_utf8_lossy(frame);
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}
