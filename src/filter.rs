use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::KeywordSettings;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Contain,
    Exact,
    Fuzzy,
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "contain" | "contains" => Ok(MatchMode::Contain),
            "exact" => Ok(MatchMode::Exact),
            "fuzzy" => Ok(MatchMode::Fuzzy),
            other => Err(format!("unknown match mode '{}'", other)),
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchMode::Contain => "contain",
            MatchMode::Exact => "exact",
            MatchMode::Fuzzy => "fuzzy",
        };
        f.write_str(name)
    }
}

// Characters OCR engines commonly produce in place of the intended glyph.
const OCR_CONFUSIONS: &[(char, char)] = &[
    ('欵', '款'),
    ('吿', '告'),
    ('訴', '诉'),
    ('単', '单'),
    ('扴', '打'),
    ('収', '收'),
    ('発', '发'),
    ('貨', '货'),
    ('価', '价'),
    ('扱', '投'),
];

#[derive(Debug, Clone)]
pub struct KeywordFilter {
    keywords: Vec<String>,
    mode: MatchMode,
    case_sensitive: bool,
    fuzzy_threshold: f64,
}

impl KeywordFilter {
    /// Blank keywords are dropped and duplicates keep their first position.
    pub fn new(
        keywords: Vec<String>,
        mode: MatchMode,
        case_sensitive: bool,
        fuzzy_threshold: f64,
    ) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(keywords.len());
        for keyword in keywords {
            let keyword = keyword.trim().to_string();
            if !keyword.is_empty() && !unique.contains(&keyword) {
                unique.push(keyword);
            }
        }

        Self {
            keywords: unique,
            mode,
            case_sensitive,
            fuzzy_threshold,
        }
    }

    pub fn from_settings(keywords: Vec<String>, settings: &KeywordSettings) -> Self {
        Self::new(
            keywords,
            settings.match_mode,
            settings.case_sensitive,
            settings.fuzzy_threshold,
        )
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Every keyword the text satisfies, in keyword-list order.
    pub fn matches(&self, content: &str) -> Vec<String> {
        let content = content.trim();
        if content.is_empty() {
            return Vec::new();
        }

        let folded_content = self.fold(content);
        self.keywords
            .iter()
            .filter(|keyword| self.keyword_matches(&folded_content, keyword))
            .cloned()
            .collect()
    }

    /// Runs the filter over a message and records the result on it.
    pub fn apply(&self, message: &mut Message) -> bool {
        message.matched_keywords = self.matches(&message.content);
        message.is_matched()
    }

    pub fn score(&self, content: &str, keyword: &str) -> f64 {
        similarity(&self.fold(content.trim()), &self.fold(keyword))
    }

    fn keyword_matches(&self, folded_content: &str, keyword: &str) -> bool {
        let folded_keyword = self.fold(keyword);
        match self.mode {
            MatchMode::Contain => {
                folded_content.contains(&folded_keyword)
                    || ocr_tolerant_contains(folded_content, &folded_keyword)
            }
            MatchMode::Exact => folded_content == folded_keyword,
            MatchMode::Fuzzy => {
                folded_content.contains(&folded_keyword)
                    || similarity(folded_content, &folded_keyword) >= self.fuzzy_threshold
            }
        }
    }

    fn fold(&self, text: &str) -> String {
        if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        }
    }
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn correct_ocr(text: &str) -> String {
    text.chars()
        .map(|c| {
            OCR_CONFUSIONS
                .iter()
                .find(|(wrong, _)| *wrong == c)
                .map(|(_, right)| *right)
                .unwrap_or(c)
        })
        .collect()
}

/// Containment after removing whitespace ("退 款") and correcting common
/// OCR glyph confusions ("退欵").
fn ocr_tolerant_contains(content: &str, keyword: &str) -> bool {
    let keyword = strip_whitespace(keyword);
    if keyword.is_empty() {
        return false;
    }
    let content = strip_whitespace(content);
    content.contains(&keyword) || correct_ocr(&content).contains(&keyword)
}

/// Similarity ratio in [0, 1]: twice the longest common subsequence over the
/// combined length, computed over chars.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    (2 * prev[b.len()]) as f64 / total as f64
}
