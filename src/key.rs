//! Logical-key derivation.
//!
//! Cache entries are stored under full request URLs; the manifest is keyed by
//! paths relative to the origin. These helpers translate between the two.

/// Logical key of the root document.
pub const ROOT_KEY: &str = "/";

/// Cache-busting query marker appended by the application loader.
const VERSION_QUERY: &str = "?v=";

/// Returns the part of `url` after `origin/`, or `None` if `url` does not
/// belong to `origin`.
fn relative_to<'a>(origin: &str, url: &'a str) -> Option<&'a str> {
    let rest = url.strip_prefix(origin)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix('/')
}

/// Derives the logical key of an incoming request.
///
/// The `?v=` suffix is dropped, and the origin itself, an empty path or a
/// client-side route (`origin/#...`) all map to [`ROOT_KEY`]. Returns `None`
/// for URLs outside `origin`.
#[must_use]
pub fn request_key(origin: &str, url: &str) -> Option<String> {
    let rest = relative_to(origin, url)?;
    let key = rest.split(VERSION_QUERY).next().unwrap_or_default();
    if key.is_empty() || rest.starts_with('#') {
        return Some(ROOT_KEY.to_string());
    }
    Some(key.to_string())
}

/// Derives the logical key of a stored cache entry.
///
/// Unlike [`request_key`] the URL is taken verbatim: an entry stored under a
/// versioned URL does not match its unversioned manifest key.
#[must_use]
pub fn entry_key(origin: &str, url: &str) -> Option<String> {
    let rest = relative_to(origin, url)?;
    if rest.is_empty() {
        Some(ROOT_KEY.to_string())
    } else {
        Some(rest.to_string())
    }
}

/// Returns the request URL for a logical key.
#[must_use]
pub fn url_for_key(origin: &str, key: &str) -> String {
    if key == ROOT_KEY {
        format!("{origin}/")
    } else {
        format!("{origin}/{key}")
    }
}

/// Returns the URL a response for `url` is stored under.
///
/// Fragments never reach the network, so they are not part of the stored
/// URL either. A bare origin is stored as `origin/`.
#[must_use]
pub fn storage_url(origin: &str, url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or_default();
    if without_fragment == origin {
        format!("{origin}/")
    } else {
        without_fragment.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ORIGIN: &str = "https://gym.example.com";

    #[test]
    fn request_key_plain_path() {
        assert_eq!(
            request_key(ORIGIN, "https://gym.example.com/main.dart.js").as_deref(),
            Some("main.dart.js")
        );
        assert_eq!(
            request_key(ORIGIN, "https://gym.example.com/assets/fonts/MaterialIcons-Regular.otf")
                .as_deref(),
            Some("assets/fonts/MaterialIcons-Regular.otf")
        );
    }

    #[test]
    fn request_key_strips_version_query() {
        assert_eq!(
            request_key(ORIGIN, "https://gym.example.com/flutter.js?v=12345").as_deref(),
            Some("flutter.js")
        );
        assert_eq!(
            request_key(ORIGIN, "https://gym.example.com/?v=12345").as_deref(),
            Some(ROOT_KEY)
        );
    }

    #[test]
    fn request_key_root_forms() {
        assert_eq!(request_key(ORIGIN, ORIGIN).as_deref(), Some(ROOT_KEY));
        assert_eq!(
            request_key(ORIGIN, "https://gym.example.com/").as_deref(),
            Some(ROOT_KEY)
        );
        assert_eq!(
            request_key(ORIGIN, "https://gym.example.com/#/workouts/3").as_deref(),
            Some(ROOT_KEY)
        );
    }

    #[test]
    fn other_query_strings_are_kept() {
        assert_eq!(
            request_key(ORIGIN, "https://gym.example.com/main.dart.js?x=1").as_deref(),
            Some("main.dart.js?x=1")
        );
    }

    #[test]
    fn foreign_origins_have_no_key() {
        assert_eq!(request_key(ORIGIN, "https://cdn.example.com/main.dart.js"), None);
        assert_eq!(request_key(ORIGIN, "https://gym.example.com.evil/x.js"), None);
        assert_eq!(entry_key(ORIGIN, "http://gym.example.com/index.html"), None);
    }

    #[test]
    fn entry_key_is_verbatim() {
        assert_eq!(
            entry_key(ORIGIN, "https://gym.example.com/").as_deref(),
            Some(ROOT_KEY)
        );
        assert_eq!(
            entry_key(ORIGIN, "https://gym.example.com/flutter.js?v=1").as_deref(),
            Some("flutter.js?v=1")
        );
    }

    #[test]
    fn storage_url_drops_fragment() {
        assert_eq!(storage_url(ORIGIN, ORIGIN), "https://gym.example.com/");
        assert_eq!(
            storage_url(ORIGIN, "https://gym.example.com/#/settings"),
            "https://gym.example.com/"
        );
        assert_eq!(
            storage_url(ORIGIN, "https://gym.example.com/a.js?v=2"),
            "https://gym.example.com/a.js?v=2"
        );
    }

    proptest! {
        #[test]
        fn url_for_key_inverts_entry_key(key in "[a-z][a-z0-9_./-]{0,40}") {
            let url = url_for_key(ORIGIN, &key);
            prop_assert_eq!(entry_key(ORIGIN, &url), Some(key.clone()));
            prop_assert_eq!(request_key(ORIGIN, &url), Some(key));
        }

        #[test]
        fn version_suffix_never_changes_request_key(
            key in "[a-z][a-z0-9_./-]{0,40}",
            version in "[0-9]{1,12}",
        ) {
            let url = format!("{}?v={version}", url_for_key(ORIGIN, &key));
            prop_assert_eq!(request_key(ORIGIN, &url), Some(key));
        }
    }

    #[test]
    fn root_key_round_trips() {
        let url = url_for_key(ORIGIN, ROOT_KEY);
        assert_eq!(url, "https://gym.example.com/");
        assert_eq!(entry_key(ORIGIN, &url).as_deref(), Some(ROOT_KEY));
    }
}
