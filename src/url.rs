#![forbid(unsafe_code)]

//! Canonicalization of user-entered channel references.

const YOUTUBE_ORIGIN: &str = "https://www.youtube.com";

/// Tab paths that point at a channel section rather than the channel itself.
const TAB_SUFFIXES: [&str; 6] = [
    "/videos",
    "/about",
    "/playlists",
    "/community",
    "/channels",
    "/featured",
];

const CHANNEL_SEGMENTS: [&str; 4] = ["/@", "/channel/", "/c/", "/user/"];

/// Turns a pasted channel reference into a canonical `https://` URL.
///
/// Text that does not look like a YouTube reference is returned trimmed but
/// otherwise untouched. Applying the function to its own output is a no-op.
pub fn normalize_channel_url(input: &str) -> String {
    let trimmed = input.trim();
    let mut url = if has_scheme(trimmed) {
        trimmed.to_string()
    } else if trimmed.starts_with('@') {
        format!("{YOUTUBE_ORIGIN}/{trimmed}")
    } else if is_bare_youtube_host(trimmed) {
        format!("https://{trimmed}")
    } else {
        return trimmed.to_string();
    };

    if url
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"))
    {
        url = format!("https://{}", &url[7..]);
    }

    loop {
        let before = url.len();
        url.truncate(url.trim_end_matches('/').len());
        if let Some(suffix) = TAB_SUFFIXES
            .iter()
            .find(|suffix| ends_with_ignore_case(&url, suffix))
        {
            url.truncate(url.len() - suffix.len());
        }
        if url.len() == before {
            break;
        }
    }

    url
}

/// True when the normalized URL names a channel by handle, id, custom name or
/// legacy username.
pub fn is_valid_channel_url(input: &str) -> bool {
    let normalized = normalize_channel_url(input).to_ascii_lowercase();
    CHANNEL_SEGMENTS
        .iter()
        .any(|segment| normalized.contains(segment))
}

fn has_scheme(value: &str) -> bool {
    value.contains("://")
}

fn is_bare_youtube_host(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    ["youtube.com", "www.youtube.com"].iter().any(|host| {
        lower == *host || lower.starts_with(&format!("{host}/"))
    })
}

fn ends_with_ignore_case(value: &str, suffix: &str) -> bool {
    value.len() >= suffix.len()
        && value.is_char_boundary(value.len() - suffix.len())
        && value[value.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_get_the_youtube_origin() {
        assert_eq!(
            normalize_channel_url("  @SomeCreator "),
            "https://www.youtube.com/@SomeCreator"
        );
    }

    #[test]
    fn bare_hosts_get_a_scheme() {
        assert_eq!(
            normalize_channel_url("youtube.com/@abc"),
            "https://youtube.com/@abc"
        );
        assert_eq!(
            normalize_channel_url("www.youtube.com/channel/UC123/"),
            "https://www.youtube.com/channel/UC123"
        );
    }

    #[test]
    fn http_is_upgraded() {
        assert_eq!(
            normalize_channel_url("http://www.youtube.com/c/Name"),
            "https://www.youtube.com/c/Name"
        );
    }

    #[test]
    fn tab_suffixes_are_stripped() {
        assert_eq!(
            normalize_channel_url("https://www.youtube.com/@abc/videos/"),
            "https://www.youtube.com/@abc"
        );
        assert_eq!(
            normalize_channel_url("https://www.youtube.com/user/legacy/featured"),
            "https://www.youtube.com/user/legacy"
        );
    }

    #[test]
    fn unrelated_text_is_returned_as_is() {
        assert_eq!(normalize_channel_url(" not a channel "), "not a channel");
        assert_eq!(
            normalize_channel_url("example.org/videos"),
            "example.org/videos"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "@abc",
            "youtube.com/@abc/videos",
            "http://www.youtube.com/channel/UC1//",
            "https://www.youtube.com/@abc/videos/videos",
            "https://www.youtube.com/c/Name/about/",
            "random words",
            "www.youtube.com",
        ];
        for sample in samples {
            let once = normalize_channel_url(sample);
            assert_eq!(normalize_channel_url(&once), once, "input: {sample}");
        }
    }

    #[test]
    fn validity_requires_a_channel_segment() {
        assert!(is_valid_channel_url("@abc"));
        assert!(is_valid_channel_url("https://www.youtube.com/CHANNEL/UC1"));
        assert!(is_valid_channel_url("youtube.com/user/legacy"));
        assert!(!is_valid_channel_url("https://www.youtube.com/watch?v=abc"));
        assert!(!is_valid_channel_url("hello"));
    }
}
