/// Narrow interface the engine needs from a tokenizer; a real
/// implementation (BPE/SentencePiece/...) is an explicit non-goal here.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;
    fn vocab_size(&self) -> usize;
}

/// Byte-level stand-in used by the mock backend and by tests: each byte of
/// the UTF-8 text is one token id.
#[derive(Debug, Default)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.as_bytes().iter().map(|b| *b as u32).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let bytes: Vec<u8> = tokens.iter().map(|t| *t as u8).collect();
        String::from_utf8_lossy(&bytes).to_string()
    }

    fn vocab_size(&self) -> usize {
        256
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_tokenizer_round_trips_ascii() {
        let tok = ByteTokenizer;
        let ids = tok.encode("hello");
        assert_eq!(tok.decode(&ids), "hello");
    }
}
