//! Sentence boundary detection over a token stream

/// Words that end in a period without ending the sentence
const ABBREVIATIONS: &[&str] = &["mr", "mrs", "ms", "dr", "st", "vs", "e.g", "i.e"];

const fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

const fn is_closing(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '\u{201d}' | '\u{2019}')
}

fn ends_with_abbreviation(text: &str) -> bool {
    let word = text
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or_default()
        .trim_start_matches(['(', '"', '\''])
        .to_lowercase();
    ABBREVIATIONS.contains(&word.as_str())
}

/// Result of scanning the buffer for a sentence end
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Byte offset just past a complete sentence
    Boundary(usize),
    /// No boundary yet; later scans may resume at this offset
    Pending(usize),
}

/// Find the first complete sentence at or after byte offset `from`
///
/// A sentence ends at terminal punctuation (plus any trailing punctuation or
/// closing quotes) followed by whitespace. A punctuation run that reaches the
/// end of the text is undecided, so scanning resumes at its start.
fn find_boundary(text: &str, from: usize) -> Scan {
    let mut chars = text[from..]
        .char_indices()
        .map(|(i, c)| (from + i, c))
        .peekable();

    while let Some((offset, c)) = chars.next() {
        if !is_terminal(c) {
            continue;
        }

        let mut after = None;
        while let Some(&(at, next)) = chars.peek() {
            if is_terminal(next) || is_closing(next) {
                chars.next();
            } else {
                after = Some((at, next));
                break;
            }
        }

        match after {
            None => return Scan::Pending(offset),
            Some((at, next))
                if next.is_whitespace()
                    && !(c == '.' && ends_with_abbreviation(&text[..offset])) =>
            {
                return Scan::Boundary(at);
            }
            Some(_) => {}
        }
    }

    Scan::Pending(text.len())
}

/// Incremental sentence splitter
///
/// Tokens are buffered until a boundary is seen; each complete sentence is
/// returned as soon as it is detected. Each push only scans text that could
/// not be decided before.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
    /// Bytes of `buffer` already known to hold no boundary
    scanned: usize,
}

impl SentenceSplitter {
    /// Create an empty splitter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token and return any sentences it completed
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);

        let mut sentences = Vec::new();
        loop {
            match find_boundary(&self.buffer, self.scanned) {
                Scan::Boundary(end) => {
                    let sentence = self.buffer[..end].trim().to_string();
                    self.buffer = self.buffer[end..].trim_start().to_string();
                    self.scanned = 0;
                    if !sentence.is_empty() {
                        sentences.push(sentence);
                    }
                }
                Scan::Pending(resume) => {
                    self.scanned = resume;
                    return sentences;
                }
            }
        }
    }

    /// Whether text is buffered past the last boundary
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.buffer.trim().is_empty()
    }

    /// End of stream: the buffered fragment, if any
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(tokens: &[&str]) -> (Vec<String>, Option<String>) {
        let mut splitter = SentenceSplitter::new();
        let mut out = Vec::new();
        for token in tokens {
            out.extend(splitter.push(token));
        }
        (out, splitter.finish())
    }

    #[test]
    fn test_three_part_example() {
        let (sentences, rest) = split_all(&["Hello there. How are you? I am fine"]);
        assert_eq!(sentences, vec!["Hello there.", "How are you?"]);
        assert_eq!(rest.as_deref(), Some("I am fine"));
    }

    #[test]
    fn test_boundary_split_across_tokens() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("Hel").is_empty());
        assert!(splitter.push("lo there.").is_empty());
        assert_eq!(splitter.push(" How"), vec!["Hello there."]);
        assert!(splitter.has_pending());
        assert_eq!(splitter.finish().as_deref(), Some("How"));
    }

    #[test]
    fn test_punctuation_runs_and_quotes() {
        let (sentences, rest) = split_all(&["Really?! She said \"yes.\" Then left."]);
        assert_eq!(sentences, vec!["Really?!", "She said \"yes.\""]);
        assert_eq!(rest.as_deref(), Some("Then left."));
    }

    #[test]
    fn test_no_split_inside_numbers_or_abbreviations() {
        let (sentences, rest) = split_all(&["Dr. Smith took 2.5 mg today. Good"]);
        assert_eq!(sentences, vec!["Dr. Smith took 2.5 mg today."]);
        assert_eq!(rest.as_deref(), Some("Good"));
    }

    #[test]
    fn test_resumes_scan_where_it_left_off() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("Take your pills with water").is_empty());
        assert_eq!(splitter.scanned, "Take your pills with water".len());

        // A trailing period is undecided until the next character arrives
        assert!(splitter.push(" after lunch.").is_empty());
        assert_eq!(splitter.scanned, splitter.buffer.len() - 1);
        assert_eq!(splitter.push(" Ok"), vec!["Take your pills with water after lunch."]);
        assert_eq!(splitter.scanned, 2);
    }

    #[test]
    fn test_char_by_char_matches_whole_text() {
        let text = "Mr. Lee called at 3.15 today! He said \"see you soon.\" Call him back? Sure";
        let (whole, whole_rest) = split_all(&[text]);

        let mut splitter = SentenceSplitter::new();
        let mut sentences = Vec::new();
        let mut buf = [0; 4];
        for c in text.chars() {
            sentences.extend(splitter.push(c.encode_utf8(&mut buf)));
        }
        assert_eq!(sentences, whole);
        assert_eq!(splitter.finish(), whole_rest);
        assert_eq!(whole.len(), 3);
    }

    #[test]
    fn test_trailing_whitespace_leaves_nothing() {
        let (sentences, rest) = split_all(&["Done. "]);
        assert_eq!(sentences, vec!["Done."]);
        assert!(rest.is_none());
    }
}
