//! Sentence chunking for long inputs.

/// Characters that may trail a sentence terminator and still belong to the sentence.
fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '»' | '”' | '’')
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '…')
}

/// Split text into sentences, keeping terminators and closing quotes or brackets.
///
/// ```
/// use parrot_core::text::split_by_sentence;
///
/// let sentences = split_by_sentence("Hello world! How are you? I'm fine.");
/// assert_eq!(sentences, vec!["Hello world!", "How are you?", "I'm fine."]);
/// ```
pub fn split_by_sentence(text: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let (_, c) = chars[i];
        i += 1;
        if !is_terminator(c) {
            continue;
        }
        // Runs like "?!" or "..." end together.
        while i < chars.len() && is_terminator(chars[i].1) {
            i += 1;
        }
        while i < chars.len() && is_closer(chars[i].1) {
            i += 1;
        }
        let at_boundary = i == chars.len() || chars[i].1.is_whitespace() || !c.is_ascii();
        if !at_boundary {
            continue;
        }
        let end = chars.get(i).map_or(text.len(), |&(pos, _)| pos);
        push_trimmed(&mut sentences, &text[start..end]);
        start = end;
    }
    push_trimmed(&mut sentences, &text[start..]);
    sentences
}

fn push_trimmed(out: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece.to_string());
    }
}

/// Group sentences into chunks of at most `max_chars` characters.
///
/// A single sentence longer than `max_chars` becomes its own chunk unsplit.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for sentence in split_by_sentence(text) {
        let needed = if current.is_empty() {
            sentence.chars().count()
        } else {
            current.chars().count() + 1 + sentence.chars().count()
        };
        if !current.is_empty() && needed > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
