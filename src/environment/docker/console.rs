/// Reassembles whole console lines out of the chunked byte stream a
/// container runtime hands back. Chunks may split a line anywhere, including
/// inside a UTF-8 sequence; lines are published without their terminator.
pub(super) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn feed(&mut self, chunk: &[u8], mut publish: impl FnMut(&str)) {
        self.buf.extend_from_slice(chunk);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let mut line = &line[..line.len() - 1];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            publish(&String::from_utf8_lossy(line));
        }
    }

    /// Publishes whatever is left when the stream ends without a newline.
    pub fn flush(&mut self, mut publish: impl FnMut(&str)) {
        if self.buf.is_empty() {
            return;
        }

        let rest = std::mem::take(&mut self.buf);
        publish(&String::from_utf8_lossy(&rest));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&[u8]]) -> Vec<String> {
        let mut buffer = LineBuffer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buffer.feed(chunk, |line| out.push(line.to_string()));
        }
        buffer.flush(|line| out.push(line.to_string()));
        out
    }

    #[test]
    fn splits_complete_lines() {
        let lines = collect(&[b"one\ntwo\nthree\n"]);
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn reassembles_lines_split_across_chunks() {
        let lines = collect(&[b"Done (1.2", b"3s)! For help\nnext"]);
        assert_eq!(lines, vec!["Done (1.23s)! For help", "next"]);
    }

    #[test]
    fn strips_carriage_returns() {
        let lines = collect(&[b"hello\r\nworld\r\n"]);
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn flush_emits_trailing_partial_line() {
        let lines = collect(&[b"no newline"]);
        assert_eq!(lines, vec!["no newline"]);
    }

    #[test]
    fn empty_lines_are_preserved() {
        let lines = collect(&[b"a\n\nb\n"]);
        assert_eq!(lines, vec!["a", "", "b"]);
    }
}
