//! Minimal concrete parsers shipped as worked examples of the contract in
//! [`super`], and as fixtures for dispatcher tests. Real format parsers
//! (RPM, ELF, Dex, ...) are external collaborators and are not part of
//! this crate.

use super::{ByteStream, Parser, ParserDescriptor, ParserError, ParserFactory, Signature};

/// Recognizes a run of a single repeated byte (0x00 or 0xFF) from the
/// current position to end of stream. Signature-less — it only ever
/// fires through the featureless fallback, after every other candidate
/// has rejected the bytes.
#[derive(Default)]
pub struct PaddingParser {
    length: u64,
}

pub struct PaddingParserFactory;

impl ParserFactory for PaddingParserFactory {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            pretty_name: "paddingparser",
            extensions: &[],
            signatures: &[],
            scan_if_featureless: true,
        }
    }

    fn construct(&self) -> Box<dyn Parser> {
        Box::new(PaddingParser::default())
    }
}

impl Parser for PaddingParser {
    fn descriptor(&self) -> ParserDescriptor {
        PaddingParserFactory.descriptor()
    }

    fn parse(&mut self, stream: &mut ByteStream<'_>) -> Result<(), ParserError> {
        use std::io::Read;

        let mut first = [0u8; 1];
        let n = stream
            .read(&mut first)
            .map_err(|e| ParserError::new(e.to_string()))?;
        if n == 0 {
            return Err(ParserError::new("empty stream"));
        }
        let value = first[0];
        if value != 0x00 && value != 0xFF {
            return Err(ParserError::new("not a padding byte"));
        }

        let mut count: u64 = 1;
        let mut buf = [0u8; 4096];
        loop {
            let n = stream
                .read(&mut buf)
                .map_err(|e| ParserError::new(e.to_string()))?;
            if n == 0 {
                break;
            }
            if buf[..n].iter().any(|&b| b != value) {
                return Err(ParserError::new("non-uniform byte run"));
            }
            count += n as u64;
        }
        self.length = count;
        Ok(())
    }

    fn calculate_unpacked_size(&mut self, _stream: &mut ByteStream<'_>) -> u64 {
        self.length
    }

    fn labels(&self) -> Vec<String> {
        vec!["padding".to_string()]
    }
}

/// Recognizes a POSIX shebang line and labels the interpreter, grounded
/// on the original project's line-oriented script check: no fixed magic
/// beyond `#!`, so it also opts into the featureless fallback for inputs
/// whose first two bytes didn't happen to land a signature match (e.g.
/// when registered alongside parsers with overlapping magic).
#[derive(Default)]
pub struct ScriptParser {
    interpreter: Option<String>,
    length: u64,
}

pub struct ScriptParserFactory;

impl ParserFactory for ScriptParserFactory {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            pretty_name: "scriptparser",
            extensions: &["sh", "py", "pl", "rb"],
            signatures: &[Signature {
                offset_within_file: 0,
                magic: b"#!",
            }],
            scan_if_featureless: true,
        }
    }

    fn construct(&self) -> Box<dyn Parser> {
        Box::new(ScriptParser::default())
    }
}

impl Parser for ScriptParser {
    fn descriptor(&self) -> ParserDescriptor {
        ScriptParserFactory.descriptor()
    }

    fn parse(&mut self, stream: &mut ByteStream<'_>) -> Result<(), ParserError> {
        let buf = super::read_remaining(stream).map_err(|e| ParserError::new(e.to_string()))?;
        if !buf.starts_with(b"#!") {
            return Err(ParserError::new("missing shebang"));
        }
        let newline = buf.iter().position(|&b| b == b'\n').unwrap_or(buf.len());
        let first_line = String::from_utf8_lossy(&buf[2..newline]).trim().to_string();
        if first_line.is_empty() {
            return Err(ParserError::new("empty shebang target"));
        }
        self.interpreter = interpreter_name(&first_line);
        self.length = buf.len() as u64;
        Ok(())
    }

    fn calculate_unpacked_size(&mut self, _stream: &mut ByteStream<'_>) -> u64 {
        self.length
    }

    fn labels(&self) -> Vec<String> {
        let mut labels = vec!["script".to_string()];
        if let Some(interpreter) = &self.interpreter {
            labels.push(interpreter.clone());
        }
        labels
    }
}

/// Pulls the interpreter name out of a shebang line, unwrapping the
/// common `/usr/bin/env <interpreter>` indirection and stripping version
/// suffixes (`python3.11` -> `python`).
fn interpreter_name(shebang_line: &str) -> Option<String> {
    let tokens: Vec<&str> = shebang_line.split_whitespace().collect();
    let mut path = (*tokens.first()?).to_string();
    if path.rsplit('/').next() == Some("env") {
        path = (*tokens.get(1)?).to_string();
    }
    let base = path.rsplit('/').next().unwrap_or(&path).to_string();
    let name: String = base
        .trim_end_matches(|c: char| c.is_ascii_digit() || c == '.')
        .to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use crate::offset_stream::OffsetStream;

    fn stream(bytes: &[u8]) -> ByteStream<'_> {
        OffsetStream::new(Cursor::new(bytes), 0).unwrap()
    }

    #[test]
    fn padding_parser_accepts_uniform_run() {
        let data = vec![0xFFu8; 64];
        let mut s = stream(&data);
        let mut p = PaddingParser::default();
        p.parse(&mut s).unwrap();
        assert_eq!(p.calculate_unpacked_size(&mut s), 64);
        assert_eq!(p.labels(), vec!["padding".to_string()]);
    }

    #[test]
    fn padding_parser_rejects_mixed_bytes() {
        let mut data = vec![0x00u8; 32];
        data[16] = 0x01;
        let mut s = stream(&data);
        let mut p = PaddingParser::default();
        assert!(p.parse(&mut s).is_err());
    }

    #[test]
    fn script_parser_extracts_interpreter_via_env() {
        let data = b"#!/usr/bin/env python3\nprint(1)\n".to_vec();
        let mut s = stream(&data);
        let mut p = ScriptParser::default();
        p.parse(&mut s).unwrap();
        assert_eq!(
            p.labels(),
            vec!["script".to_string(), "python".to_string()]
        );
        assert_eq!(p.calculate_unpacked_size(&mut s), data.len() as u64);
    }

    #[test]
    fn script_parser_extracts_interpreter_direct_path() {
        let data = b"#!/bin/bash\necho hi\n".to_vec();
        let mut s = stream(&data);
        let mut p = ScriptParser::default();
        p.parse(&mut s).unwrap();
        assert_eq!(p.labels(), vec!["script".to_string(), "bash".to_string()]);
    }

    #[test]
    fn script_parser_rejects_missing_shebang() {
        let data = b"plain text, no shebang here\n".to_vec();
        let mut s = stream(&data);
        let mut p = ScriptParser::default();
        assert!(p.parse(&mut s).is_err());
    }
}
