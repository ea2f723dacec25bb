pub mod http;
pub mod path;

/// Whether the url points to a m3u8 playlist, judged by its extension only.
pub fn is_m3u8_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(url) => url.path().to_lowercase().ends_with(".m3u8"),
        Err(_) => {
            let path = url.split(['?', '#']).next().unwrap_or_default();
            path.to_lowercase().ends_with(".m3u8")
        }
    }
}
