//! Process-wide display settings.
//!
//! Settings are set once at startup and then updated in place by
//! `settings` messages. A message only carries the keys that changed.

use serde::{Deserialize, Serialize};

/// Numeric, image and language options read by every runner that formats output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Number of decimals shown in results.
    pub num_decimals: usize,
    /// Fixed decimals instead of significant digits.
    pub fixed_decimals: bool,
    /// Show exact p-values instead of `< .001`.
    pub exact_p_values: bool,
    /// Switch to scientific notation for very small or large magnitudes.
    pub normalized_notation: bool,
    /// Image resolution in pixels per inch.
    pub ppi: u32,
    /// Image background colour.
    pub image_background: String,
    /// Font used for results and plots.
    pub result_font: Option<String>,
    /// Language code for translated output.
    pub language: String,
    /// Developer mode, enables more verbose runtime output.
    pub developer_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_decimals: 3,
            fixed_decimals: false,
            exact_p_values: false,
            normalized_notation: true,
            ppi: 96,
            image_background: "white".to_string(),
            result_font: None,
            language: "en".to_string(),
            developer_mode: false,
        }
    }
}

/// A partial settings tree as sent by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_decimals: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_decimals: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_p_values: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_notation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppi: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_mode: Option<bool>,
}

impl Settings {
    /// Merge an update into these settings.
    ///
    /// Returns `true` if any value changed.
    pub fn absorb(&mut self, update: &SettingsUpdate) -> bool {
        let before = self.clone();

        if let Some(v) = update.num_decimals {
            self.num_decimals = v;
        }
        if let Some(v) = update.fixed_decimals {
            self.fixed_decimals = v;
        }
        if let Some(v) = update.exact_p_values {
            self.exact_p_values = v;
        }
        if let Some(v) = update.normalized_notation {
            self.normalized_notation = v;
        }
        if let Some(v) = update.ppi {
            self.ppi = v;
        }
        if let Some(v) = &update.image_background {
            self.image_background = v.clone();
        }
        if let Some(v) = &update.result_font {
            self.result_font = Some(v.clone());
        }
        if let Some(v) = &update.language {
            self.language = v.clone();
        }
        if let Some(v) = update.developer_mode {
            self.developer_mode = v;
        }

        *self != before
    }

    /// Render a number for display.
    pub fn format_number(&self, value: f64) -> String {
        if value.is_nan() {
            return "NaN".to_string();
        }
        if value.is_infinite() {
            return if value > 0.0 { "Inf" } else { "-Inf" }.to_string();
        }
        if value == 0.0 {
            return "0".to_string();
        }

        let magnitude = value.abs();
        if self.normalized_notation && (magnitude >= 1e6 || magnitude < 10f64.powi(-(self.num_decimals as i32))) {
            return format!("{:.*e}", self.num_decimals.saturating_sub(1), value);
        }

        if self.fixed_decimals {
            return format!("{:.*}", self.num_decimals, value);
        }

        // Significant digits: keep `num_decimals` digits after the leading one.
        let leading = magnitude.log10().floor() as i32;
        let decimals = (self.num_decimals as i32 - 1 - leading).max(0) as usize;
        let text = format!("{:.*}", decimals, value);
        if text.contains('.') {
            text.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            text
        }
    }

    /// Render a p-value for display.
    pub fn format_p_value(&self, p: f64) -> String {
        if !self.exact_p_values && p < 0.001 {
            "< .001".to_string()
        } else {
            self.format_number(p)
        }
    }
}
