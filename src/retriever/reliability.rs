//! Source reliability scoring and search-hit ranking.
//!
//! Scores are coarse domain priors (0.0 to 1.0): official and judicial
//! publishers first, then academic and established news outlets, then the
//! open web, with social platforms last.

use std::collections::HashSet;

use url::Url;

use super::SearchHit;

/// Wire services and outlets with public correction policies
const ESTABLISHED_NEWS: &[&str] = &[
    "reuters.com",
    "apnews.com",
    "bbc.co.uk",
    "bbc.com",
    "afp.com",
    "nytimes.com",
    "theguardian.com",
    "washingtonpost.com",
    "ft.com",
    "economist.com",
    "folha.uol.com.br",
    "estadao.com.br",
    "g1.globo.com",
];

const FACT_CHECKERS: &[&str] = &["politifact.com", "snopes.com", "factcheck.org", "fullfact.org"];

const SOCIAL_PLATFORMS: &[&str] = &[
    "twitter.com",
    "x.com",
    "facebook.com",
    "instagram.com",
    "tiktok.com",
    "reddit.com",
    "youtube.com",
    "t.me",
];

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Reliability prior of a source URL
pub fn reliability_score(url: &Url) -> f64 {
    let host = match url.host_str() {
        Some(h) => h.to_lowercase(),
        None => return 0.0,
    };

    if host.ends_with(".gov")
        || host.contains(".gov.")
        || host.ends_with(".jus.br")
        || host.ends_with(".europa.eu")
        || host.contains("court")
        || host.contains("tribunal")
    {
        return 0.9;
    }
    if host.ends_with(".edu") || host.contains(".ac.") || host.ends_with(".int") {
        return 0.85;
    }
    if ESTABLISHED_NEWS.iter().any(|d| host_matches(&host, d)) {
        return 0.8;
    }
    if FACT_CHECKERS.iter().any(|d| host_matches(&host, d)) {
        return 0.75;
    }
    if host_matches(&host, "wikipedia.org") {
        return 0.65;
    }
    if SOCIAL_PLATFORMS.iter().any(|d| host_matches(&host, d)) {
        return 0.3;
    }
    0.5
}

fn hit_score(hit: &SearchHit) -> f64 {
    Url::parse(&hit.url).map(|u| reliability_score(&u)).unwrap_or(0.0)
}

/// Deduplicate hits by URL (first occurrence wins) and sort by reliability, best first.
/// Equal scores keep search-engine order.
pub fn rank_hits(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    let mut hits: Vec<SearchHit> = hits
        .into_iter()
        .filter(|h| seen.insert(h.url.clone()))
        .collect();

    hits.sort_by(|a, b| hit_score(b).total_cmp(&hit_score(a)));
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceCategory;

    fn hit(url: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            snippet: String::new(),
            title: None,
            category: SourceCategory::StandardSearch,
            grounding: None,
        }
    }

    #[test]
    fn test_domain_priors() {
        let score = |u: &str| reliability_score(&Url::parse(u).unwrap());
        assert_eq!(score("https://www.tse.jus.br/noticias"), 0.9);
        assert_eq!(score("https://www.reuters.com/world"), 0.8);
        assert_eq!(score("https://en.wikipedia.org/wiki/X"), 0.65);
        assert_eq!(score("https://x.com/someone/status/1"), 0.3);
        assert_eq!(score("https://blog.example.net/post"), 0.5);
        // Suffix match only on label boundaries
        assert_eq!(score("https://notreuters.com/a"), 0.5);
    }

    #[test]
    fn test_rank_hits_sorts_and_dedups() {
        let ranked = rank_hits(vec![
            hit("https://blog.example.net/a"),
            hit("https://www.reuters.com/b"),
            hit("https://blog.example.net/a"),
            hit("https://stf.jus.br/c"),
            hit("https://other.example.net/d"),
        ]);

        let urls: Vec<&str> = ranked.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://stf.jus.br/c",
                "https://www.reuters.com/b",
                "https://blog.example.net/a",
                "https://other.example.net/d",
            ]
        );
    }
}
