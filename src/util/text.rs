use std::borrow::Cow;

use scraper::Html;

/// Ellipsis marker appended when text is cut to fit a budget.
pub const ELLIPSIS: &str = "..";
/// Character count of [`ELLIPSIS`].
pub const ELLIPSIS_LEN: usize = 2;

/// Converts an HTML fragment (or plain text containing entities) to plain text.
///
/// Entities are decoded, tags are dropped, runs of whitespace collapse to a
/// single space and the result is trimmed. Control characters are removed so
/// feed-supplied text can't smuggle escape sequences into logs or posts.
///
/// # Examples
///
/// ```
/// use feedpost::util::html_to_text;
///
/// assert_eq!(html_to_text("Fish &amp; <b>Chips</b>"), "Fish & Chips");
/// assert_eq!(html_to_text("  spaced\n\tout  "), "spaced out");
/// ```
pub fn html_to_text(input: &str) -> String {
    let decoded: String = if input.contains('<') || input.contains('&') {
        let fragment = Html::parse_fragment(input);
        fragment.root_element().text().collect()
    } else {
        input.to_string()
    };

    normalize_plain(&decoded)
}

/// Tidies text that is already plain: control characters and ANSI escapes
/// are removed and whitespace is collapsed. `<`, `>` and `&` are kept as-is.
///
/// # Examples
///
/// ```
/// use feedpost::util::normalize_plain;
///
/// assert_eq!(normalize_plain(" Why Vec<T>\n beats arrays "), "Why Vec<T> beats arrays");
/// assert_eq!(normalize_plain("&lt;div&gt;"), "&lt;div&gt;");
/// ```
pub fn normalize_plain(input: &str) -> String {
    strip_control_chars(input)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncates `s` to at most `max_chars` characters.
///
/// When the input is longer than the budget, the kept prefix is trimmed of
/// trailing whitespace and [`ELLIPSIS`] is appended; the ellipsis counts
/// against the budget. Returns `Cow::Borrowed` when no truncation is needed.
///
/// Budgets too small to hold a character plus the ellipsis return a bare
/// prefix without the marker.
///
/// # Examples
///
/// ```
/// use feedpost::util::truncate_chars;
///
/// assert_eq!(truncate_chars("Short", 10), "Short");
/// assert_eq!(truncate_chars("Hello World", 8), "Hello..");
/// assert_eq!(truncate_chars("Test", 2), "Te");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        return Cow::Borrowed(s);
    }

    if max_chars <= ELLIPSIS_LEN {
        return Cow::Owned(s.chars().take(max_chars).collect());
    }

    let keep = max_chars - ELLIPSIS_LEN;
    let cut = s
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len());
    Cow::Owned(format!("{}{}", s[..cut].trim_end(), ELLIPSIS))
}

/// Strip terminal control characters and ANSI escape sequences from text.
///
/// Strips:
/// - ASCII control chars: 0x00-0x08, 0x0B-0x0C, 0x0E-0x1F, 0x7F
/// - ANSI CSI sequences: `\x1b[` ... (terminal byte 0x40-0x7E)
/// - ANSI OSC sequences: `\x1b]` ... (until BEL 0x07 or ST `\x1b\\`)
/// - Bare ESC (0x1b) not followed by `[` or `]`
///
/// Preserves: tab (0x09), newline (0x0A), carriage return (0x0D).
///
/// Returns `Cow::Borrowed` when the input contains no control characters (common case).
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    let len = bytes.len();

    let is_control = |b: u8| b == 0x7f || (b < 0x20 && b != 0x09 && b != 0x0a && b != 0x0d);

    if !bytes.iter().any(|&b| b == 0x1b || is_control(b)) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(len);
    let mut i = 0;

    while i < len {
        let b = bytes[i];

        if b == 0x1b {
            if i + 1 < len && bytes[i + 1] == b'[' {
                i += 2;
                while i < len {
                    let c = bytes[i];
                    i += 1;
                    if (0x40..=0x7e).contains(&c) {
                        break;
                    }
                }
            } else if i + 1 < len && bytes[i + 1] == b']' {
                i += 2;
                while i < len {
                    if bytes[i] == 0x07 {
                        i += 1;
                        break;
                    }
                    if bytes[i] == 0x1b && i + 1 < len && bytes[i + 1] == b'\\' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            } else {
                i += 1;
            }
        } else if is_control(b) {
            i += 1;
        } else {
            let start = i;
            i += 1;
            while i < len && bytes[i] != 0x1b && !is_control(bytes[i]) {
                i += 1;
            }
            // SAFETY: we only break on ASCII control bytes, which cannot appear
            // mid-codepoint in valid UTF-8, so s[start..i] is valid UTF-8.
            out.push_str(&s[start..i]);
        }
    }

    Cow::Owned(out)
}
