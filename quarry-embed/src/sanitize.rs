//! Input cleanup applied before text reaches an embedding runtime.

/// Removes characters that tokenizers choke on and normalizes whitespace.
///
/// Drops NUL, the replacement character, control characters other than tab,
/// newline and carriage return, Unicode format characters and private-use
/// characters. Each remaining whitespace character becomes one space; runs
/// are not collapsed and nothing is trimmed, so the output lines up with the
/// input character for character apart from the dropped ones.
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|&ch| !is_stripped(ch))
        .map(|ch| if ch.is_whitespace() { ' ' } else { ch })
        .collect()
}

fn is_stripped(ch: char) -> bool {
    if matches!(ch, '\t' | '\n' | '\r') {
        return false;
    }
    ch == '\u{FFFD}' || ch.is_control() || is_format(ch) || is_private_use(ch)
}

fn is_format(ch: char) -> bool {
    matches!(
        ch,
        '\u{00AD}'
            | '\u{0600}'..='\u{0605}'
            | '\u{061C}'
            | '\u{06DD}'
            | '\u{070F}'
            | '\u{0890}'..='\u{0891}'
            | '\u{08E2}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206F}'
            | '\u{FEFF}'
            | '\u{FFF9}'..='\u{FFFB}'
            | '\u{110BD}'
            | '\u{110CD}'
            | '\u{13430}'..='\u{1343F}'
            | '\u{1BCA0}'..='\u{1BCA3}'
            | '\u{1D173}'..='\u{1D17A}'
            | '\u{E0001}'
            | '\u{E0020}'..='\u{E007F}'
    )
}

fn is_private_use(ch: char) -> bool {
    matches!(
        ch,
        '\u{E000}'..='\u{F8FF}' | '\u{F0000}'..='\u{FFFFD}' | '\u{100000}'..='\u{10FFFD}'
    )
}
