use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::serial::error::SerialPortError;

/// This codec splits incoming bytes into text lines on a delimiter,
/// and appends the delimiter to each line it encodes.
///
/// A trailing carriage return is removed from decoded lines, since devices
/// commonly terminate lines with `\r\n`.
/// Bad UTF-8 is replaced rather than rejected.
#[derive(Debug, Clone)]
pub struct LinesCodec {
    /// How far we have looked for a delimiter into the buffer
    cursor: usize,

    /// How to delimit incoming byte streams.
    /// This delimiter is not included in the yielded frames.
    read_delimiter: u8,

    /// Which byte to append when writing (encoding) lines.
    write_delimiter: u8,
}

impl LinesCodec {
    /// Create a new codec.
    pub fn new(read_delimiter: u8, write_delimiter: u8) -> Self {
        Self {
            cursor: 0,
            read_delimiter,
            write_delimiter,
        }
    }
}

impl LinesCodec {
    /// Whether `buffer` holds at least one complete line.
    pub fn has_line(&self, buffer: &[u8]) -> bool {
        buffer.contains(&self.read_delimiter)
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', b'\n')
    }
}

impl Decoder for LinesCodec {
    type Item = String;
    type Error = SerialPortError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        let look_at = &src[self.cursor..read_to];

        if let Some(position) = look_at.iter().position(|&byte| byte == self.read_delimiter) {
            // Since we might "start late" in the buffer (from the cursor),
            // the "global" position within the buffer has to be calculated.
            let actual_position = self.cursor + position;

            // Next time we need to start over.
            self.cursor = 0;

            let line = src.split_to(actual_position);

            // Discard the delimiter.
            src.advance(1);

            let line = String::from_utf8_lossy(&line);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            Ok(Some(line.to_owned()))
        } else {
            // Don't re-read the bytes we have already looked at.
            self.cursor = read_to;

            Ok(None)
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => Err(SerialPortError::Disconnected),
        }
    }
}

impl Encoder<String> for LinesCodec {
    type Error = SerialPortError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(&[self.write_delimiter]);

        Ok(())
    }
}
