//! AT line framer: turns a raw RFCOMM byte stream into whole AT commands, and frames
//! responses in the `\r\n...\r\n` envelope peers expect.

use crate::peer::InputBuffer;

/// Splits buffered input on `\r`, yielding each non-empty segment as one command.
///
/// Bytes after the last `\r` (a partial command) are left in `buffer` for the next call.
/// Returns `Err(())` if `chunk` cannot be appended without overflowing `buffer`'s capacity —
/// the caller must treat this as a fatal, non-recoverable session error (§4.C).
pub fn feed(buffer: &mut InputBuffer, chunk: &[u8]) -> Result<Vec<Vec<u8>>, ()> {
    if !buffer.push(chunk) {
        return Err(());
    }
    let data = buffer.drain_all();
    let mut commands = Vec::new();
    let mut start = 0;
    for (i, b) in data.iter().enumerate() {
        if *b == b'\r' {
            if i > start {
                commands.push(data[start..i].to_vec());
            }
            start = i + 1;
        }
    }
    if start < data.len() {
        let leftover = &data[start..];
        if !buffer.push(leftover) {
            return Err(());
        }
    }
    Ok(commands)
}

/// Frames a single response line in the `\r\n<line>\r\n` envelope.
pub fn frame_line(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 4);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

/// Frames the terminal `OK` response.
pub fn frame_ok() -> Vec<u8> {
    frame_line("OK")
}

/// Frames the terminal plain `ERROR` response.
pub fn frame_error() -> Vec<u8> {
    frame_line("ERROR")
}

/// Frames a `+CME ERROR: <code>` response.
pub fn frame_cme_error(code: u32) -> Vec<u8> {
    frame_line(&format!("+CME ERROR: {code}"))
}

/// Frames an informational response followed immediately by `OK`, per §4.C (e.g. the
/// `+CIND: ...` / `OK` pair).
pub fn frame_info_then_ok(info: &str) -> Vec<u8> {
    let mut out = frame_line(info);
    out.extend_from_slice(&frame_ok());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_splits_on_cr_and_ignores_empty_segments() {
        let mut buf = InputBuffer::with_capacity(InputBuffer::MIN_CAPACITY);
        let commands = feed(&mut buf, b"AT+BRSF=0\r\rAT+CIND=?\r").unwrap();
        assert_eq!(commands, vec![b"AT+BRSF=0".to_vec(), b"AT+CIND=?".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn feed_buffers_partial_command_across_calls() {
        let mut buf = InputBuffer::with_capacity(InputBuffer::MIN_CAPACITY);
        assert_eq!(feed(&mut buf, b"AT+BR").unwrap(), Vec::<Vec<u8>>::new());
        assert_eq!(feed(&mut buf, b"SF=0\r").unwrap(), vec![b"AT+BRSF=0".to_vec()]);
    }

    #[test]
    fn feed_reports_overflow_on_oversized_unterminated_input() {
        let mut buf = InputBuffer::with_capacity(InputBuffer::MIN_CAPACITY);
        let huge = vec![b'A'; InputBuffer::MIN_CAPACITY + 1];
        assert!(feed(&mut buf, &huge).is_err());
    }

    #[test]
    fn frame_info_then_ok_matches_two_envelopes() {
        let framed = frame_info_then_ok("+CIND: (\"service\",(0,1))");
        assert_eq!(framed, b"\r\n+CIND: (\"service\",(0,1))\r\n\r\nOK\r\n");
    }

    #[test]
    fn frame_cme_error_includes_code() {
        assert_eq!(frame_cme_error(30), b"\r\n+CME ERROR: 30\r\n");
    }
}
