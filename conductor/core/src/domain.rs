//! Analysis Domains
//!
//! Every task belongs to exactly one domain. The domain selects which
//! providers are eligible (through the registry's per-domain fallback chain).
//!
//! Callers normally name the domain explicitly. When they don't, the prompt is
//! classified by keyword scoring over each domain's vocabulary.

use serde::{Deserialize, Serialize};

/// Domain of an analysis request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Medical and health questions
    Healthcare,
    /// Markets, investment and personal finance
    Financial,
    /// Games, players, predictions
    Sports,
    /// Process automation and strategy
    Business,
    /// Anything else
    General,
}

impl Default for Domain {
    fn default() -> Self {
        Self::General
    }
}

const HEALTHCARE_KEYWORDS: &[&str] = &[
    "pain", "symptom", "doctor", "medical", "health", "sick", "hurt", "medication", "headache",
    "fever", "chest", "stomach", "joint", "muscle", "blood", "pressure", "diabetes", "heart",
    "lung", "kidney", "liver", "brain", "anxiety", "depression", "mental", "therapy", "treatment",
    "diagnosis", "disease", "infection",
];

const FINANCIAL_KEYWORDS: &[&str] = &[
    "invest", "stock", "money", "finance", "portfolio", "market", "trading", "buy", "sell",
    "price", "return", "profit", "loss", "dividend", "bond", "fund", "retirement", "savings",
    "budget", "loan", "mortgage", "insurance", "tax", "crypto", "bitcoin", "ethereum", "nasdaq",
    "sp500", "dow", "recession",
];

const SPORTS_KEYWORDS: &[&str] = &[
    "game", "team", "player", "score", "bet", "odds", "prediction", "fantasy", "football",
    "basketball", "baseball", "soccer", "hockey", "tennis", "golf", "nfl", "nba", "mlb", "nhl",
    "fifa", "stats", "season", "playoffs", "championship",
];

const BUSINESS_KEYWORDS: &[&str] = &[
    "business", "company", "workflow", "process", "automation", "management", "strategy",
    "project", "efficiency", "productivity", "operations", "marketing", "sales", "customer",
    "revenue", "growth", "startup", "enterprise", "optimize", "scale", "leadership", "meeting",
    "deadline", "roi",
];

impl Domain {
    /// All domains, in classification tie-break order
    pub const ALL: [Domain; 5] = [
        Self::Healthcare,
        Self::Financial,
        Self::Sports,
        Self::Business,
        Self::General,
    ];

    /// Lowercase identifier used in configuration and on the wire
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthcare => "healthcare",
            Self::Financial => "financial",
            Self::Sports => "sports",
            Self::Business => "business",
            Self::General => "general",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::Healthcare => HEALTHCARE_KEYWORDS,
            Self::Financial => FINANCIAL_KEYWORDS,
            Self::Sports => SPORTS_KEYWORDS,
            Self::Business => BUSINESS_KEYWORDS,
            Self::General => &[],
        }
    }

    /// Classify free text into a domain
    ///
    /// Counts keyword hits per domain. The highest count wins; ties go to the
    /// domain listed first in [`Domain::ALL`]. No hits at all means
    /// [`Domain::General`].
    #[must_use]
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();

        let mut best = Self::General;
        let mut best_score = 0usize;
        for domain in Self::ALL {
            let score = domain
                .keywords()
                .iter()
                .filter(|kw| lower.contains(*kw))
                .count();
            if score > best_score {
                best = domain;
                best_score = score;
            }
        }
        best
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a domain name
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown domain: {0}")]
pub struct UnknownDomain(pub String);

impl std::str::FromStr for Domain {
    type Err = UnknownDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "healthcare" | "health" | "medical" => Ok(Self::Healthcare),
            "financial" | "finance" => Ok(Self::Financial),
            "sports" | "sport" => Ok(Self::Sports),
            "business" => Ok(Self::Business),
            "general" => Ok(Self::General),
            other => Err(UnknownDomain(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_keywords() {
        assert_eq!(
            Domain::classify("I have a headache and a fever since Monday"),
            Domain::Healthcare
        );
        assert_eq!(
            Domain::classify("Should I rebalance my portfolio before the recession?"),
            Domain::Financial
        );
        assert_eq!(
            Domain::classify("Who wins the NBA playoffs this season?"),
            Domain::Sports
        );
        assert_eq!(
            Domain::classify("How do we automate our onboarding workflow?"),
            Domain::Business
        );
    }

    #[test]
    fn test_classify_without_hits_is_general() {
        assert_eq!(Domain::classify("Tell me about the moon"), Domain::General);
        assert_eq!(Domain::classify(""), Domain::General);
    }

    #[test]
    fn test_classify_tie_prefers_earlier_domain() {
        // one healthcare hit ("doctor"), one financial hit ("tax")
        assert_eq!(Domain::classify("doctor tax"), Domain::Healthcare);
    }

    #[test]
    fn test_parse_roundtrip_names() {
        for domain in Domain::ALL {
            assert_eq!(domain.as_str().parse::<Domain>(), Ok(domain));
        }
        assert_eq!("Finance".parse::<Domain>(), Ok(Domain::Financial));
        assert!("astrology".parse::<Domain>().is_err());
    }
}
