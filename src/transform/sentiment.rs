// src/transform/sentiment.rs
use super::Transformer;
use crate::error::Result;
use crate::model::NewsItem;

const POSITIVE: &[&str] = &[
    "good", "great", "excellent", "amazing", "wonderful", "fantastic", "positive", "success",
    "win", "victory", "achievement", "progress", "improvement", "growth", "innovation",
    "breakthrough", "celebrate", "happy", "joy", "optimistic", "hope", "benefit", "advantage",
];

const NEGATIVE: &[&str] = &[
    "bad", "terrible", "awful", "horrible", "negative", "fail", "failure", "loss", "defeat",
    "problem", "issue", "crisis", "disaster", "concern", "worry", "fear", "decline", "drop",
    "fall", "crash", "collapse", "sad", "angry", "disappointed", "frustrated", "concerned",
    "alarmed",
];

const URGENT: &[&str] = &["breaking", "urgent", "alert", "emergency", "crisis"];

const SENTIMENT_TAGS: [&str; 3] = ["positive", "negative", "neutral"];

fn hits(text: &str, words: &[&str]) -> usize {
    words.iter().filter(|w| text.contains(*w)).count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
    Neutral,
}

impl Polarity {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Polarity::Positive => "positive",
            Polarity::Negative => "negative",
            Polarity::Neutral => "neutral",
        }
    }
}

/// Keyword-count sentiment: each listed word found anywhere in the
/// lowercased text counts once.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentimentTagger;

impl SentimentTagger {
    pub fn new() -> Self {
        Self
    }

    /// (positive hits, negative hits).
    pub fn score(&self, text: &str) -> (usize, usize) {
        let text = text.to_lowercase();
        (hits(&text, POSITIVE), hits(&text, NEGATIVE))
    }

    pub fn polarity(&self, text: &str) -> Polarity {
        let (pos, neg) = self.score(text);
        match pos.cmp(&neg) {
            std::cmp::Ordering::Greater => Polarity::Positive,
            std::cmp::Ordering::Less => Polarity::Negative,
            std::cmp::Ordering::Equal => Polarity::Neutral,
        }
    }
}

/// True when lowercased `text` carries a breaking-news keyword.
pub(crate) fn is_urgent(text: &str) -> bool {
    hits(text, URGENT) > 0
}

impl Transformer for SentimentTagger {
    fn name(&self) -> &'static str {
        "sentiment_tagger"
    }

    fn transform(&self, item: &NewsItem) -> Result<NewsItem> {
        let mut out = item.clone();
        let text = format!("{} {}", item.title, item.content).to_lowercase();
        let polarity = self.polarity(&text);
        let urgent = is_urgent(&text);

        out.tags.retain(|t| !SENTIMENT_TAGS.contains(&t.as_str()));
        out.tags.push(polarity.as_tag().to_string());
        if urgent && !out.tags.iter().any(|t| t == "urgent") {
            out.tags.push("urgent".to_string());
        }
        tracing::debug!(target: "transform", id = %item.id, sentiment = polarity.as_tag(), urgent, "sentiment tagged");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_each_keyword_once_by_substring() {
        let t = SentimentTagger::new();
        assert_eq!(t.score("Great growth, a real breakthrough"), (3, 0));
        assert_eq!(t.score("Markets CRASH amid fear"), (0, 2));
        assert_eq!(t.score("This is not a good quarter"), (1, 0));
        // "failures" matches both fail and failure; "growths" matches growth
        assert_eq!(t.score("Two failures despite growths"), (1, 2));
        assert_eq!(t.score("good good good"), (1, 0));
        assert_eq!(t.polarity("win and loss"), Polarity::Neutral);
    }

    #[test]
    fn replaces_sentiment_tag_and_adds_urgent_once() {
        let item = NewsItem {
            title: "Breaking: disaster at the plant".into(),
            content: "An emergency crew responded to the crisis.".into(),
            tags: vec!["positive".into(), "energy".into(), "urgent".into()],
            ..Default::default()
        };
        let out = SentimentTagger::new().transform(&item).unwrap();
        assert_eq!(out.tags, vec!["energy", "urgent", "negative"]);
    }

    #[test]
    fn neutral_when_nothing_matches() {
        let item = NewsItem {
            title: "Council meets on Tuesday".into(),
            ..Default::default()
        };
        let out = SentimentTagger::new().transform(&item).unwrap();
        assert_eq!(out.tags, vec!["neutral"]);
    }
}
