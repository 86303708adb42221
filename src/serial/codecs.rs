/// Newline delimited text lines.
pub mod lines;
