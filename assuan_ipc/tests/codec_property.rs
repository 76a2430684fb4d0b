use assuan_ipc::codec::{escape_data, unescape_data, DataLineEncoder, LineBuffer, MAX_LINE_LEN};
use proptest::prelude::*;

proptest! {
    #[test]
    fn escaped_data_is_line_safe(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let escaped = escape_data(&payload);
        prop_assert!(!escaped.iter().any(|&b| b == b'\n' || b == b'\r' || b == 0));
        prop_assert_eq!(unescape_data(&escaped).unwrap(), payload);
    }

    #[test]
    fn data_lines_respect_the_limit(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let mut encoder = DataLineEncoder::new();
        let mut lines: Vec<Vec<u8>> = Vec::new();
        encoder.push(&payload, |line| { lines.push(line.to_vec()); Ok(()) }).unwrap();
        encoder.flush(|line| { lines.push(line.to_vec()); Ok(()) }).unwrap();

        let mut decoded = Vec::new();
        for line in &lines {
            prop_assert!(line.len() <= MAX_LINE_LEN);
            prop_assert!(line.starts_with(b"D "));
            decoded.extend(unescape_data(&line[2..]).unwrap());
        }
        prop_assert_eq!(decoded, payload);
    }

    #[test]
    fn lines_split_at_any_chunk_boundary(
        words in proptest::collection::vec("[A-Z]{1,8}( [a-z0-9]{0,20})?", 1..20),
        chunk in 1usize..64,
    ) {
        let stream: Vec<u8> = words.iter().flat_map(|w| format!("{}\n", w).into_bytes()).collect();
        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();
        for piece in stream.chunks(chunk) {
            buffer.extend(piece);
            while let Some(line) = buffer.take_line() {
                lines.push(String::from_utf8(line.unwrap()).unwrap());
            }
        }
        prop_assert!(buffer.is_empty());
        prop_assert_eq!(lines, words);
    }
}
