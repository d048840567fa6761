//! `Link` header pagination used by the catalog and tag list endpoints.

use http::HeaderMap;
use url::Url;

/// The `rel="next"` target of a `Link` header, resolved against `base`.
///
/// ```rust
/// use registry_client::paginate::next_link;
///
/// let mut headers = http::HeaderMap::new();
/// headers.insert(
///     http::header::LINK,
///     r#"</v2/_catalog?last=b&n=2>; rel="next""#.parse().unwrap(),
/// );
/// let base = url::Url::parse("https://registry.test/v2/_catalog?n=2").unwrap();
/// let next = next_link(&headers, &base).unwrap();
/// assert_eq!(next.as_str(), "https://registry.test/v2/_catalog?last=b&n=2");
/// ```
pub fn next_link(headers: &HeaderMap, base: &Url) -> Option<Url> {
    headers
        .get_all(http::header::LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|link| {
            let (target, params) = link.split_once(';')?;
            let is_next = params
                .split(';')
                .filter_map(|param| param.split_once('='))
                .any(|(key, value)| {
                    key.trim().eq_ignore_ascii_case("rel") && value.trim().trim_matches('"') == "next"
                });
            if !is_next {
                return None;
            }
            let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
            base.join(target).ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_other_relations() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::LINK,
            r#"</v2/a/tags/list?last=1>; rel="prev""#.parse().unwrap(),
        );
        let base = Url::parse("https://r/v2/a/tags/list").unwrap();
        assert!(next_link(&headers, &base).is_none());
    }

    #[test]
    fn absolute_targets_are_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::LINK,
            r#"<https://other/v2/_catalog?last=x>; rel=next"#.parse().unwrap(),
        );
        let base = Url::parse("https://r/v2/_catalog").unwrap();
        assert_eq!(
            next_link(&headers, &base).unwrap().as_str(),
            "https://other/v2/_catalog?last=x"
        );
    }
}
