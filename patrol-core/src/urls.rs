use url::Url;

/// Resolves a step address against a target's base URL. Absolute inputs are
/// used as-is; anything else is joined onto the base.
pub fn resolve(base: &Url, candidate: &str) -> Result<Url, url::ParseError> {
    match Url::parse(candidate) {
        Ok(url) => Ok(normalize(url)),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(normalize(base.join(candidate)?)),
        Err(err) => Err(err),
    }
}

/// Normalizes a URL for stable logging and comparison: drops the fragment
/// and any default port. `Url` already lowercases scheme and host.
pub fn normalize(mut url: Url) -> Url {
    url.set_fragment(None);
    if let Some(port) = url.port() {
        let default = match url.scheme() {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        };
        if default == Some(port) {
            let _ = url.set_port(None);
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://shop.example.com/app/").unwrap()
    }

    #[test]
    fn absolute_urls_pass_through() {
        let resolved = resolve(&base(), "https://other.example.org/x").unwrap();
        assert_eq!(resolved.as_str(), "https://other.example.org/x");
    }

    #[test]
    fn relative_urls_join_base() {
        let resolved = resolve(&base(), "catalog?page=2").unwrap();
        assert_eq!(
            resolved.as_str(),
            "https://shop.example.com/app/catalog?page=2"
        );
    }

    #[test]
    fn normalize_strips_fragment_and_default_port() {
        let url = Url::parse("HTTPS://Shop.Example.com:443/a#section").unwrap();
        assert_eq!(normalize(url).as_str(), "https://shop.example.com/a");
    }
}
