// src/transform/classifier.rs
use super::Transformer;
use crate::error::Result;
use crate::model::NewsItem;

pub const GENERAL: &str = "general";

/// Checked in this order; the order only matters for readability since ties
/// fall back to `general`.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "technology",
        &[
            "tech", "software", "ai", "artificial intelligence", "machine learning", "computer",
            "digital", "startup", "innovation", "app", "mobile", "internet", "cyber", "data",
            "algorithm", "programming", "coding",
        ],
    ),
    (
        "business",
        &[
            "business", "economy", "finance", "market", "stock", "investment", "company",
            "corporate", "revenue", "profit", "earnings", "trade", "commerce", "industry",
            "economic", "financial", "banking",
        ],
    ),
    (
        "sports",
        &[
            "sports", "football", "basketball", "baseball", "soccer", "olympics", "championship",
            "game", "match", "tournament", "athlete", "team", "player", "coach", "league",
            "score", "victory", "defeat",
        ],
    ),
    (
        "politics",
        &[
            "politics", "government", "election", "president", "congress", "senate", "policy",
            "vote", "campaign", "politician", "democracy", "republican", "democrat",
            "parliament", "minister", "law", "legislation",
        ],
    ),
    (
        "health",
        &[
            "health", "medical", "doctor", "hospital", "disease", "treatment", "medicine",
            "healthcare", "patient", "virus", "vaccine", "drug", "therapy", "clinical",
            "diagnosis", "symptoms", "pandemic",
        ],
    ),
    (
        "science",
        &[
            "science", "research", "study", "discovery", "experiment", "scientist", "laboratory",
            "analysis", "theory", "hypothesis", "evidence", "biology", "chemistry", "physics",
            "astronomy", "climate",
        ],
    ),
    (
        "entertainment",
        &[
            "entertainment", "movie", "film", "music", "celebrity", "hollywood", "tv", "show",
            "actor", "actress", "director", "album", "concert", "theater", "comedy", "drama",
            "streaming", "netflix",
        ],
    ),
    (
        "world",
        &[
            "world", "international", "global", "country", "nation", "foreign", "diplomatic",
            "embassy", "border", "immigration", "refugee", "conflict", "war", "peace", "treaty",
            "alliance",
        ],
    ),
];

/// Scores every category by substring keyword hits; a unique top score
/// wins, anything else is `general`.
pub fn classify(text: &str) -> (&'static str, usize) {
    let text = text.to_lowercase();
    let scores: Vec<(&'static str, usize)> = CATEGORY_KEYWORDS
        .iter()
        .map(|(cat, kws)| (*cat, kws.iter().filter(|k| text.contains(*k)).count()))
        .collect();
    let best = scores.iter().map(|(_, s)| *s).max().unwrap_or(0);
    if best == 0 {
        return (GENERAL, 0);
    }
    let mut leaders = scores.iter().filter(|(_, s)| *s == best);
    match (leaders.next(), leaders.next()) {
        (Some((cat, _)), None) => (*cat, best),
        _ => (GENERAL, best),
    }
}

/// Fills in `category` when it is empty or `general`.
pub struct CategoryClassifier;

impl Transformer for CategoryClassifier {
    fn name(&self) -> &'static str {
        "category_classifier"
    }

    fn transform(&self, item: &NewsItem) -> Result<NewsItem> {
        let mut out = item.clone();
        if !out.category.is_empty() && out.category != GENERAL {
            return Ok(out);
        }
        let (category, score) = classify(&format!("{} {}", item.title, item.content));
        tracing::debug!(target: "transform", id = %item.id, category, score, "category classified");
        out.category = category.to_string();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_winner() {
        assert_eq!(classify("Hospital reports new vaccine for the virus").0, "health");
    }

    #[test]
    fn ties_and_zero_fall_back_to_general() {
        // one hit each for sports ("football") and health ("doctor")
        assert_eq!(classify("Football doctor").0, GENERAL);
        assert_eq!(classify("Quiet evening").0, GENERAL);
    }

    #[test]
    fn keeps_existing_specific_category() {
        let item = NewsItem {
            title: "Hospital vaccine virus".into(),
            category: "local".into(),
            ..Default::default()
        };
        assert_eq!(CategoryClassifier.transform(&item).unwrap().category, "local");

        let item = NewsItem {
            category: GENERAL.into(),
            ..item
        };
        assert_eq!(CategoryClassifier.transform(&item).unwrap().category, "health");
    }
}
