//! Fuzz target for NDJSON line splitting.
//!
//! Feeds the same body to the splitter whole and in fuzzer-chosen chunks;
//! the lines produced must not depend on the chunking.

#![no_main]

use event_replicator::LineSplitter;
use libfuzzer_sys::fuzz_target;

fn split(chunks: &[&[u8]]) -> (Vec<Vec<u8>>, usize) {
    let mut splitter = LineSplitter::new();
    let mut lines = Vec::new();
    for chunk in chunks {
        lines.extend(splitter.push(chunk));
    }
    let dropped = splitter.finish();
    (lines, dropped)
}

fuzz_target!(|data: (Vec<u8>, Vec<u8>)| {
    let (body, cuts) = data;

    let mut chunks = Vec::new();
    let mut rest = body.as_slice();
    for cut in cuts {
        if rest.is_empty() {
            break;
        }
        let at = (cut as usize) % (rest.len() + 1);
        let (head, tail) = rest.split_at(at);
        chunks.push(head);
        rest = tail;
    }
    chunks.push(rest);

    let whole = split(&[&body]);
    let pieces = split(&chunks);
    assert_eq!(whole, pieces);

    // No line is empty or contains a newline
    for line in &whole.0 {
        assert!(!line.is_empty());
        assert!(!line.contains(&b'\n'));
    }
});
