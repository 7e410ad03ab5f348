//! Register table extraction
//!
//! Device status pages list registers as table rows: a label cell followed by
//! a value cell such as `1234.5 W`. The extractor sums every row whose label
//! matches a pattern.

use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    /// The page parsed but no register row carried the expected label
    #[error("no rows matching '{0}' found in device page")]
    NoMatchingRows(String),

    #[error("device page is not valid UTF-8")]
    InvalidEncoding,

    #[error("extractor setup failed: {0}")]
    Setup(String),
}

/// Turns a raw device response body into a numeric reading
pub trait ReadingExtractor: Send + Sync {
    /// Parse the body and return the summed value in watts
    fn extract(&self, raw_body: &[u8]) -> Result<f64, ExtractError>;
}

/// Sums `<tr><td>label</td><td>value W</td></tr>` rows whose label contains a pattern
pub struct RegisterTableExtractor {
    label_pattern: String,
    row_selector: Selector,
    cell_selector: Selector,
    value_pattern: Regex,
}

impl RegisterTableExtractor {
    pub fn new(label_pattern: &str) -> Result<Self, ExtractError> {
        let row_selector =
            Selector::parse("tr").map_err(|e| ExtractError::Setup(e.to_string()))?;
        let cell_selector =
            Selector::parse("td").map_err(|e| ExtractError::Setup(e.to_string()))?;
        let value_pattern = Regex::new(r"(-?\d+(?:\.\d+)?)\s*(k?)W")
            .map_err(|e| ExtractError::Setup(e.to_string()))?;

        Ok(Self {
            label_pattern: label_pattern.trim().to_lowercase(),
            row_selector,
            cell_selector,
            value_pattern,
        })
    }

    /// Numeric watts in a value cell; `None` when the cell has no unit-suffixed number
    fn parse_watts(&self, value_text: &str) -> Option<f64> {
        let captures = self.value_pattern.captures(value_text)?;
        let value: f64 = captures.get(1)?.as_str().parse().ok()?;
        let scale = match captures.get(2).map(|m| m.as_str()) {
            Some("k") => 1000.0,
            _ => 1.0,
        };
        Some(value * scale)
    }
}

impl ReadingExtractor for RegisterTableExtractor {
    fn extract(&self, raw_body: &[u8]) -> Result<f64, ExtractError> {
        let html = std::str::from_utf8(raw_body).map_err(|_| ExtractError::InvalidEncoding)?;
        let document = Html::parse_document(html);

        let mut total_watts = 0.0;
        let mut found = false;

        for row in document.select(&self.row_selector) {
            let cells: Vec<String> = row
                .select(&self.cell_selector)
                .map(|cell| cell.text().collect::<String>().trim().to_string())
                .collect();
            if cells.len() < 2 {
                continue;
            }

            if !cells[0].to_lowercase().contains(&self.label_pattern) {
                continue;
            }

            found = true;
            match self.parse_watts(&cells[1]) {
                Some(watts) => {
                    debug!("Found register '{}': {} W", cells[0], watts);
                    total_watts += watts;
                }
                None => debug!("Register '{}' has no numeric value: {}", cells[0], cells[1]),
            }
        }

        if !found {
            return Err(ExtractError::NoMatchingRows(self.label_pattern.clone()));
        }

        Ok(total_watts)
    }
}
