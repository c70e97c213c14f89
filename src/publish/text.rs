use crate::util::{normalize_plain, truncate_chars};

/// Platform ceiling for a post's text, in characters.
pub const POST_CHAR_LIMIT: usize = 300;
/// Characters held back for the separator between title and URL and for the
/// ellipsis marker.
pub const TEXT_RESERVE: usize = 4;

const SEPARATOR: &str = "\n\n";

/// Fits a title into the space left once the URL and reserve are accounted for.
///
/// Titles reach this point already decoded at ingestion, so only whitespace
/// is tidied before measuring; `<`, `>` and `&` are ordinary characters here.
/// The result never exceeds `POST_CHAR_LIMIT - url_len - TEXT_RESERVE`
/// characters and ends in ".." only when it had to be cut.
///
/// # Examples
///
/// ```
/// use feedpost::publish::truncate_title;
///
/// let title = truncate_title("Budget blowout puts councils on notice", 42);
/// assert_eq!(title, "Budget blowout puts councils on notice");
/// ```
pub fn truncate_title(title: &str, url_len: usize) -> String {
    let budget = POST_CHAR_LIMIT
        .saturating_sub(url_len)
        .saturating_sub(TEXT_RESERVE);
    let plain = normalize_plain(title);
    truncate_chars(&plain, budget).into_owned()
}

/// Builds the post text: the fitted title, a blank line, then the URL.
pub fn compose_post_text(title: &str, url: &str) -> String {
    let title = truncate_title(title, url.chars().count());
    if title.is_empty() {
        return url.to_string();
    }
    format!("{title}{SEPARATOR}{url}")
}
