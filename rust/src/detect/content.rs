use reqwest::header::{HeaderMap, ACCEPT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Markup,
    Stylesheet,
    Script,
    Image,
    Font,
    Other,
}

impl ContentClass {
    /// Executable or structural content that must track the latest deployment.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            ContentClass::Markup | ContentClass::Stylesheet | ContentClass::Script | ContentClass::Image
        )
    }
}

/// Detect content class from the declared `Accept` header.
///
/// Wildcard-only accept values (`*/*`) say nothing and yield `Other`.
pub fn detect_from_accept(headers: &HeaderMap) -> ContentClass {
    let accept = match headers.get(ACCEPT).and_then(|v| v.to_str().ok()) {
        Some(a) => a.to_ascii_lowercase(),
        None => return ContentClass::Other,
    };

    // Order matters: browsers list text/html first for navigations but also
    // append */* to every request.
    if accept.contains("text/html") || accept.contains("application/xhtml+xml") {
        return ContentClass::Markup;
    }
    if accept.contains("text/css") {
        return ContentClass::Stylesheet;
    }
    if accept.contains("javascript") || accept.contains("ecmascript") {
        return ContentClass::Script;
    }
    if accept.contains("image/") {
        return ContentClass::Image;
    }
    if accept.contains("font/") {
        return ContentClass::Font;
    }
    ContentClass::Other
}

/// Detect content class from the path extension.
pub fn detect_from_path(path: &str) -> ContentClass {
    let file = path.rsplit('/').next().unwrap_or("");
    let ext = match file.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return ContentClass::Other,
    };

    match ext.as_str() {
        "html" | "htm" => ContentClass::Markup,
        "css" => ContentClass::Stylesheet,
        "js" | "mjs" => ContentClass::Script,
        "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" | "avif" => ContentClass::Image,
        "woff" | "woff2" | "ttf" | "otf" | "eot" => ContentClass::Font,
        _ => ContentClass::Other,
    }
}

/// Combine both signals. A specific declared type wins over the extension.
pub fn detect_content_class(path: &str, headers: &HeaderMap) -> ContentClass {
    match detect_from_accept(headers) {
        ContentClass::Other => detect_from_path(path),
        class => class,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_navigation_accept_is_markup() {
        let headers = accept("text/html,application/xhtml+xml,*/*;q=0.8");
        assert_eq!(detect_from_accept(&headers), ContentClass::Markup);
    }

    #[test]
    fn test_wildcard_accept_falls_back_to_extension() {
        let headers = accept("*/*");
        assert_eq!(detect_content_class("/app.js", &headers), ContentClass::Script);
        assert_eq!(detect_content_class("/font.woff2", &headers), ContentClass::Font);
    }

    #[test]
    fn test_extension_detection() {
        assert_eq!(detect_from_path("/a/b/logo.PNG"), ContentClass::Image);
        assert_eq!(detect_from_path("/styles.css"), ContentClass::Stylesheet);
        assert_eq!(detect_from_path("/dir.v2/readme"), ContentClass::Other);
        assert_eq!(detect_from_path("/"), ContentClass::Other);
    }
}
