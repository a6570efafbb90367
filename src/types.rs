// =============================================================================
// Shared types used across the marketroom game core
// =============================================================================
//
// Wire forms follow the public API contract: enums serialize to the exact
// strings clients see (`"sync_auto"`, `"STRONG_BUY"`, ...), dates are
// `YYYY-MM-DD`, timestamps RFC 3339.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Room clock modes and lifecycle
// =============================================================================

/// How a room's clock advances: per-student, teacher-manual, or timer-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    Async,
    Sync,
    SyncAuto,
}

impl std::fmt::Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async => write!(f, "async"),
            Self::Sync => write!(f, "sync"),
            Self::SyncAuto => write!(f, "sync_auto"),
        }
    }
}

impl std::str::FromStr for GameMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "async" => Ok(Self::Async),
            "sync" => Ok(Self::Sync),
            "sync_auto" => Ok(Self::SyncAuto),
            other => Err(format!("unknown game mode: {other}")),
        }
    }
}

/// Room lifecycle status. Monotone: waiting < in_progress < finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    InProgress,
    Finished,
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

impl std::str::FromStr for RoomStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "in_progress" => Ok(Self::InProgress),
            "finished" => Ok(Self::Finished),
            other => Err(format!("unknown room status: {other}")),
        }
    }
}

/// Grading difficulty. Shifts every grade threshold by -100 / 0 / +100 points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Medium => write!(f, "medium"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

impl std::str::FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            other => Err(format!("unknown difficulty: {other}")),
        }
    }
}

// =============================================================================
// Trades and recommendations
// =============================================================================

/// Direction of a student trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unknown trade action: {other}")),
        }
    }
}

/// The agent pipeline's daily call on a ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecAction {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl RecAction {
    /// Whether buying is permitted on a day carrying this recommendation.
    pub fn permits_buy(&self) -> bool {
        matches!(self, Self::StrongBuy | Self::Buy)
    }
}

impl std::fmt::Display for RecAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongBuy => write!(f, "STRONG_BUY"),
            Self::Buy => write!(f, "BUY"),
            Self::Hold => write!(f, "HOLD"),
            Self::Sell => write!(f, "SELL"),
            Self::StrongSell => write!(f, "STRONG_SELL"),
        }
    }
}

impl std::str::FromStr for RecAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STRONG_BUY" => Ok(Self::StrongBuy),
            "BUY" => Ok(Self::Buy),
            "HOLD" => Ok(Self::Hold),
            "SELL" => Ok(Self::Sell),
            "STRONG_SELL" => Ok(Self::StrongSell),
            other => Err(format!("unknown recommendation action: {other}")),
        }
    }
}

/// Per-lens signal label attached to a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalLabel {
    Bullish,
    Neutral,
    Bearish,
}

impl std::str::FromStr for SignalLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BULLISH" => Ok(Self::Bullish),
            "NEUTRAL" => Ok(Self::Neutral),
            "BEARISH" => Ok(Self::Bearish),
            other => Err(format!("unknown signal label: {other}")),
        }
    }
}

/// Risk label attached to a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// One recommendation for (ticker, date), as produced by the offline agents.
///
/// `synthetic` marks the HOLD-with-zero-confidence value the slice builder
/// falls back to when the store has nothing for the day or any prior day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: RecAction,
    pub confidence: f64,
    pub technical_signal: SignalLabel,
    pub sentiment_signal: SignalLabel,
    pub risk_level: RiskLevel,
    pub rationale_summary: String,
    #[serde(default)]
    pub synthetic: bool,
}

impl Recommendation {
    /// The neutral last-resort value used when the store has no data at all.
    pub fn synthetic_hold() -> Self {
        Self {
            action: RecAction::Hold,
            confidence: 0.0,
            technical_signal: SignalLabel::Neutral,
            sentiment_signal: SignalLabel::Neutral,
            risk_level: RiskLevel::Medium,
            rationale_summary: "No recommendation available for this day".to_string(),
            synthetic: true,
        }
    }
}

// =============================================================================
// Historical market data
// =============================================================================

/// One OHLCV bar. Presence in the store implies all five fields are defined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDay {
    pub date: NaiveDate,
    pub ticker: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Per (ticker, date) indicator values computed by the offline feature
/// pipeline. Absence of the whole snapshot means "not computed" and is
/// treated as a neutral signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TechnicalSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_14: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_9: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_21: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr_14: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bollinger_width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roc_14: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zscore_20: Option<f64>,
}

/// A news item with its offline-scored sentiment, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub ticker: String,
    pub published_at: DateTime<Utc>,
    pub headline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub source: String,
    /// Sentiment in [-1, 1], or null when not scored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
}

// =============================================================================
// Game configuration
// =============================================================================

/// Fixed, typed game configuration. Validated at the edge; rooms never carry
/// free-form extension fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub initial_cash: f64,
    /// Calendar days requested. The slice may contain fewer trading days.
    pub num_days: usize,
    pub tickers: Vec<String>,
    pub difficulty: Difficulty,
}

impl GameConfig {
    /// Maximum game length in calendar days.
    pub const MAX_DAYS: usize = 90;

    /// Validate shape constraints and normalize tickers to upper case.
    /// Returns a human-readable reason on failure.
    pub fn normalize(&mut self) -> Result<(), String> {
        if !(self.initial_cash > 0.0) {
            return Err("initial_cash must be positive".to_string());
        }
        if self.num_days < 1 || self.num_days > Self::MAX_DAYS {
            return Err(format!(
                "num_days must be in [1, {}], got {}",
                Self::MAX_DAYS,
                self.num_days
            ));
        }
        if self.tickers.is_empty() {
            return Err("tickers must be non-empty".to_string());
        }
        for t in &mut self.tickers {
            *t = t.trim().to_uppercase();
        }
        let mut seen = std::collections::HashSet::new();
        for t in &self.tickers {
            if t.is_empty() {
                return Err("tickers must not contain empty symbols".to_string());
            }
            if !seen.insert(t.clone()) {
                return Err(format!("duplicate ticker: {t}"));
            }
        }
        Ok(())
    }
}
