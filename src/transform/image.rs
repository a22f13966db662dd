// src/transform/image.rs
use once_cell::sync::Lazy;
use regex::Regex;

use super::Transformer;
use crate::error::Result;
use crate::model::NewsItem;

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".svg"];
const IMAGE_HOSTS: &[&str] = &["imgur.com", "flickr.com", "unsplash.com", "pixabay.com"];

static RE_IMG_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<img[^>]+src=["']([^"']+)["'][^>]*>"#).expect("img regex")
});
static RE_IMAGE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://\S+\.(?:jpg|jpeg|png|gif|webp|bmp)").expect("image url regex")
});
static RE_MEDIA_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"https?://\S*(?:media\.cnn\.com|ichef\.bbci\.co\.uk|techcrunch\.com/wp-content)\S*\.(?:jpg|jpeg|png|gif|webp)",
    )
    .expect("media regex")
});

pub fn is_valid_image_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|e| lower.contains(e)) || IMAGE_HOSTS.iter().any(|h| lower.contains(h))
}

/// First usable image reference in `text`: an `<img src>`, then a bare image
/// URL, then a known media CDN URL.
pub fn extract_image(text: &str) -> Option<String> {
    if let Some(src) = RE_IMG_TAG.captures(text).map(|c| c[1].to_string()) {
        if is_valid_image_url(&src) {
            return Some(src);
        }
    }
    RE_IMAGE_URL
        .find(text)
        .or_else(|| RE_MEDIA_URL.find(text))
        .map(|m| m.as_str().to_string())
}

/// Keeps a valid `image_url`, otherwise looks in content, summary and title.
pub struct ImageExtractor;

impl Transformer for ImageExtractor {
    fn name(&self) -> &'static str {
        "image_extractor"
    }

    fn transform(&self, item: &NewsItem) -> Result<NewsItem> {
        let mut out = item.clone();
        if !out.image_url.is_empty() {
            if is_valid_image_url(&out.image_url) {
                return Ok(out);
            }
            tracing::debug!(target: "transform", id = %item.id, url = %out.image_url, "dropping invalid image url");
            out.image_url.clear();
        }
        if let Some(url) = [&item.content, &item.summary, &item.title]
            .into_iter()
            .find_map(|t| extract_image(t))
        {
            out.image_url = url;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_by_extension_or_host() {
        assert!(is_valid_image_url("https://cdn.example.com/a/B.JPG"));
        assert!(is_valid_image_url("https://i.imgur.com/abc"));
        assert!(!is_valid_image_url("https://example.com/page.html"));
    }

    #[test]
    fn extraction_order() {
        let html = r#"see <img class="hero" src="https://x.test/hero.png"> and https://y.test/other.gif"#;
        assert_eq!(extract_image(html).as_deref(), Some("https://x.test/hero.png"));
        assert_eq!(
            extract_image("photo at https://y.test/p/shot.webp?w=300 today").as_deref(),
            Some("https://y.test/p/shot.webp")
        );
        assert_eq!(extract_image("no pictures here"), None);
    }

    #[test]
    fn raw_url_runs_to_the_last_extension() {
        assert_eq!(
            extract_image("via https://x.jpg.cdn.com/a.png today").as_deref(),
            Some("https://x.jpg.cdn.com/a.png")
        );
        assert_eq!(extract_image("HTTPS://Y.TEST/A.JPG"), None);
    }

    #[test]
    fn replaces_invalid_url_from_summary() {
        let item = NewsItem {
            image_url: "https://example.com/article".into(),
            content: "plain text".into(),
            summary: "pic https://img.test/s.jpeg".into(),
            title: "https://img.test/t.png".into(),
            ..Default::default()
        };
        let out = ImageExtractor.transform(&item).unwrap();
        assert_eq!(out.image_url, "https://img.test/s.jpeg");

        let keep = NewsItem {
            image_url: "https://unsplash.com/photos/abc".into(),
            ..item
        };
        assert_eq!(ImageExtractor.transform(&keep).unwrap().image_url, "https://unsplash.com/photos/abc");
    }
}
