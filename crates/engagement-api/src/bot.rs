use regex_lite::Regex;

use crate::error::{ApiError, ApiResult};

const DEFAULT_BOT_PATTERN: &str = r"(?i)(bot\b|bot/|crawl|spider|slurp|archiver|curl/|wget/|python-requests|python-urllib|httpclient|go-http-client|java/|libwww|scrapy|headless|phantomjs|puppeteer|playwright|lighthouse|facebookexternalhit|preview)";

/// Classifies user agents that should never count as a view.
#[derive(Debug, Clone)]
pub struct BotFilter {
    pattern: Regex,
}

impl BotFilter {
    /// # Errors
    /// Returns [`ApiError::Config`] when `pattern` is not a valid regular expression.
    pub fn with_pattern(pattern: &str) -> ApiResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|err| ApiError::Config(format!("invalid bot pattern: {err}")))?;
        Ok(Self { pattern })
    }

    /// Missing or blank agents are treated as automated.
    #[must_use]
    pub fn is_likely_bot(&self, user_agent: Option<&str>) -> bool {
        match user_agent.map(str::trim) {
            None | Some("") => true,
            Some(agent) => self.pattern.is_match(agent),
        }
    }
}

impl Default for BotFilter {
    fn default() -> Self {
        match Regex::new(DEFAULT_BOT_PATTERN) {
            Ok(pattern) => Self { pattern },
            Err(_) => unreachable!("default bot pattern is valid"),
        }
    }
}
