// =============================================================================
// Settings — environment-keyed configuration, validated once at startup
// =============================================================================
//
// Every tunable lives here and is threaded explicitly into the subsystems
// that need it; no module reads the environment after startup. All keys are
// optional except the exchange credentials when starting the trading loop.
//
// Key prefix is MERIDIAN_; exchange credentials keep the vendor prefix
// (BINANCE_API_KEY / BINANCE_API_SECRET / BINANCE_USE_TESTNET).
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::market::Interval;
use crate::types::ExchangeKind;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTC".to_string(),
        "ETH".to_string(),
        "SOL".to_string(),
        "BNB".to_string(),
        "XRP".to_string(),
    ]
}

fn default_database_path() -> String {
    "meridian.db".to_string()
}

// =============================================================================
// TradingStrategy — selects the (primary, confirm, filter) timeframe triple
// =============================================================================

/// Named timeframe profile for the regime classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TradingStrategy {
    UltraShort,
    Aggressive,
    Balanced,
    Conservative,
    SwingTrend,
}

impl TradingStrategy {
    /// The (primary, confirm, filter) candle intervals this profile analyses.
    pub fn timeframes(self) -> (Interval, Interval, Interval) {
        match self {
            Self::UltraShort => (Interval::M1, Interval::M5, Interval::M15),
            Self::Aggressive => (Interval::M3, Interval::M15, Interval::H1),
            Self::Balanced => (Interval::M5, Interval::M30, Interval::H4),
            Self::Conservative => (Interval::M15, Interval::H1, Interval::H4),
            Self::SwingTrend => (Interval::H1, Interval::H4, Interval::D1),
        }
    }
}

impl FromStr for TradingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ultra-short" => Ok(Self::UltraShort),
            "aggressive" => Ok(Self::Aggressive),
            "balanced" => Ok(Self::Balanced),
            "conservative" => Ok(Self::Conservative),
            "swing-trend" => Ok(Self::SwingTrend),
            other => Err(format!(
                "unknown trading strategy '{other}' \
                 (expected ultra-short|aggressive|balanced|conservative|swing-trend)"
            )),
        }
    }
}

impl std::fmt::Display for TradingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UltraShort => "ultra-short",
            Self::Aggressive => "aggressive",
            Self::Balanced => "balanced",
            Self::Conservative => "conservative",
            Self::SwingTrend => "swing-trend",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Parameter groups
// =============================================================================

/// Stop-loss engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossParams {
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub lookback_period: usize,
    /// Buffer beyond the structural level, in percent of that level.
    pub buffer_pct: f64,
    /// Floor for the stop distance, percent of entry.
    pub min_stop_pct: f64,
    /// Hard cap on the stop distance, percent of entry.
    pub max_stop_pct: f64,
    /// Minimum quality score required by the open-gate.
    pub min_quality_score: f64,
}

impl Default for StopLossParams {
    fn default() -> Self {
        Self {
            atr_period: 14,
            atr_multiplier: 2.0,
            lookback_period: 20,
            buffer_pct: 0.5,
            min_stop_pct: 1.0,
            max_stop_pct: 5.0,
            min_quality_score: 40.0,
        }
    }
}

/// RSI thresholds for the momentum axis of the regime classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeThresholds {
    pub oversold_extreme: f64,
    pub oversold_mild: f64,
    pub overbought_mild: f64,
    pub overbought_extreme: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            oversold_extreme: 20.0,
            oversold_mild: 30.0,
            overbought_mild: 70.0,
            overbought_extreme: 80.0,
        }
    }
}

/// A single staged take-profit tier: trigger at `r_multiple`, close `fraction`
/// of the remaining quantity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TpStage {
    pub r_multiple: f64,
    pub fraction: f64,
}

/// Staged take-profit plan plus the far "extreme" tier used for the initial
/// protective take-profit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialTpParams {
    pub stages: Vec<TpStage>,
    /// R-multiple for the far take-profit order placed at open.
    pub extreme_r: f64,
}

impl Default for PartialTpParams {
    fn default() -> Self {
        Self {
            stages: vec![
                TpStage { r_multiple: 1.0, fraction: 0.33 },
                TpStage { r_multiple: 2.0, fraction: 0.33 },
                TpStage { r_multiple: 3.0, fraction: 0.34 },
            ],
            extreme_r: 5.0,
        }
    }
}

/// Account-level drawdown thresholds. Only the warning tier acts by default;
/// the other two are reserved and must be switched on by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownParams {
    pub warning_pct: f64,
    pub no_new_position_pct: f64,
    pub force_close_pct: f64,
    pub enable_no_new_position: bool,
    pub enable_force_close: bool,
}

impl Default for DrawdownParams {
    fn default() -> Self {
        Self {
            warning_pct: 10.0,
            no_new_position_pct: 15.0,
            force_close_pct: 20.0,
            enable_no_new_position: false,
            enable_force_close: false,
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Fully validated engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub exchange: ExchangeKind,
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
    pub use_testnet: bool,
    pub database_path: String,

    pub trading_interval_minutes: u64,
    pub price_order_check_interval_secs: u64,
    pub trading_strategy: TradingStrategy,
    pub symbols: Vec<String>,
    pub max_positions: usize,
    pub max_leverage: f64,
    pub max_holding_hours: i64,
    pub initial_balance: f64,

    pub enable_scientific_stop_loss: bool,
    pub enable_stop_loss_filter: bool,
    pub enable_trailing_stop_loss: bool,

    pub stop_loss: StopLossParams,
    pub regime: RegimeThresholds,
    pub min_opportunity_score: f64,
    pub max_opportunities_to_show: usize,
    pub partial_tp: PartialTpParams,
    pub drawdown: DrawdownParams,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exchange: ExchangeKind::Linear,
            api_key: String::new(),
            api_secret: String::new(),
            use_testnet: false,
            database_path: default_database_path(),
            trading_interval_minutes: 5,
            price_order_check_interval_secs: 30,
            trading_strategy: TradingStrategy::Balanced,
            symbols: default_symbols(),
            max_positions: 5,
            max_leverage: 10.0,
            max_holding_hours: 36,
            initial_balance: 1000.0,
            enable_scientific_stop_loss: true,
            enable_stop_loss_filter: true,
            enable_trailing_stop_loss: true,
            stop_loss: StopLossParams::default(),
            regime: RegimeThresholds::default(),
            min_opportunity_score: 40.0,
            max_opportunities_to_show: 5,
            partial_tp: PartialTpParams::default(),
            drawdown: DrawdownParams::default(),
        }
    }
}

impl Settings {
    /// Read every setting from the environment, falling back to defaults.
    ///
    /// Returns `ConfigError` for malformed values; missing keys fall back to
    /// defaults except the credentials, which `require_credentials` checks
    /// separately so that `db init` can run without them.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut s = Self::default();

        if let Some(v) = read("MERIDIAN_EXCHANGE") {
            s.exchange = parse_key("MERIDIAN_EXCHANGE", &v)?;
        }
        s.api_key = read("BINANCE_API_KEY").unwrap_or_default();
        s.api_secret = read("BINANCE_API_SECRET").unwrap_or_default();
        if let Some(v) = read("BINANCE_USE_TESTNET") {
            s.use_testnet = parse_bool("BINANCE_USE_TESTNET", &v)?;
        }
        if let Some(v) = read("MERIDIAN_DATABASE_PATH") {
            s.database_path = v;
        }
        if let Some(v) = read("MERIDIAN_TRADING_INTERVAL_MINUTES") {
            s.trading_interval_minutes = parse_key("MERIDIAN_TRADING_INTERVAL_MINUTES", &v)?;
        }
        if let Some(v) = read("MERIDIAN_PRICE_ORDER_CHECK_INTERVAL") {
            s.price_order_check_interval_secs = parse_key("MERIDIAN_PRICE_ORDER_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = read("MERIDIAN_TRADING_STRATEGY") {
            s.trading_strategy = parse_key("MERIDIAN_TRADING_STRATEGY", &v)?;
        }
        if let Some(v) = read("MERIDIAN_SYMBOLS") {
            let symbols: Vec<String> = v
                .split(',')
                .map(|x| x.trim().to_uppercase())
                .filter(|x| !x.is_empty())
                .collect();
            if symbols.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "MERIDIAN_SYMBOLS".into(),
                    value: v,
                    reason: "watch-list must contain at least one symbol".into(),
                });
            }
            s.symbols = symbols;
        }
        if let Some(v) = read("MERIDIAN_MAX_POSITIONS") {
            s.max_positions = parse_key("MERIDIAN_MAX_POSITIONS", &v)?;
        }
        if let Some(v) = read("MERIDIAN_MAX_LEVERAGE") {
            s.max_leverage = parse_key("MERIDIAN_MAX_LEVERAGE", &v)?;
        }
        if let Some(v) = read("MERIDIAN_MAX_HOLDING_HOURS") {
            s.max_holding_hours = parse_key("MERIDIAN_MAX_HOLDING_HOURS", &v)?;
        }
        if let Some(v) = read("MERIDIAN_INITIAL_BALANCE") {
            s.initial_balance = parse_key("MERIDIAN_INITIAL_BALANCE", &v)?;
        }

        if let Some(v) = read("MERIDIAN_ENABLE_SCIENTIFIC_STOP_LOSS") {
            s.enable_scientific_stop_loss = parse_bool("MERIDIAN_ENABLE_SCIENTIFIC_STOP_LOSS", &v)?;
        }
        if let Some(v) = read("MERIDIAN_ENABLE_STOP_LOSS_FILTER") {
            s.enable_stop_loss_filter = parse_bool("MERIDIAN_ENABLE_STOP_LOSS_FILTER", &v)?;
        }
        if let Some(v) = read("MERIDIAN_ENABLE_TRAILING_STOP_LOSS") {
            s.enable_trailing_stop_loss = parse_bool("MERIDIAN_ENABLE_TRAILING_STOP_LOSS", &v)?;
        }

        if let Some(v) = read("MERIDIAN_ATR_PERIOD") {
            s.stop_loss.atr_period = parse_key("MERIDIAN_ATR_PERIOD", &v)?;
        }
        if let Some(v) = read("MERIDIAN_ATR_MULTIPLIER") {
            s.stop_loss.atr_multiplier = parse_key("MERIDIAN_ATR_MULTIPLIER", &v)?;
        }
        if let Some(v) = read("MERIDIAN_SUPPORT_RESISTANCE_LOOKBACK") {
            s.stop_loss.lookback_period = parse_key("MERIDIAN_SUPPORT_RESISTANCE_LOOKBACK", &v)?;
        }
        if let Some(v) = read("MERIDIAN_SUPPORT_RESISTANCE_BUFFER") {
            s.stop_loss.buffer_pct = parse_key("MERIDIAN_SUPPORT_RESISTANCE_BUFFER", &v)?;
        }
        if let Some(v) = read("MERIDIAN_MIN_STOP_LOSS_PERCENT") {
            s.stop_loss.min_stop_pct = parse_key("MERIDIAN_MIN_STOP_LOSS_PERCENT", &v)?;
        }
        if let Some(v) = read("MERIDIAN_MAX_STOP_LOSS_PERCENT") {
            s.stop_loss.max_stop_pct = parse_key("MERIDIAN_MAX_STOP_LOSS_PERCENT", &v)?;
        }
        if let Some(v) = read("MERIDIAN_MIN_STOP_LOSS_QUALITY_SCORE") {
            s.stop_loss.min_quality_score = parse_key("MERIDIAN_MIN_STOP_LOSS_QUALITY_SCORE", &v)?;
        }

        if let Some(v) = read("MERIDIAN_OVERSOLD_EXTREME_THRESHOLD") {
            s.regime.oversold_extreme = parse_key("MERIDIAN_OVERSOLD_EXTREME_THRESHOLD", &v)?;
        }
        if let Some(v) = read("MERIDIAN_OVERSOLD_MILD_THRESHOLD") {
            s.regime.oversold_mild = parse_key("MERIDIAN_OVERSOLD_MILD_THRESHOLD", &v)?;
        }
        if let Some(v) = read("MERIDIAN_OVERBOUGHT_MILD_THRESHOLD") {
            s.regime.overbought_mild = parse_key("MERIDIAN_OVERBOUGHT_MILD_THRESHOLD", &v)?;
        }
        if let Some(v) = read("MERIDIAN_OVERBOUGHT_EXTREME_THRESHOLD") {
            s.regime.overbought_extreme = parse_key("MERIDIAN_OVERBOUGHT_EXTREME_THRESHOLD", &v)?;
        }

        if let Some(v) = read("MERIDIAN_MIN_OPPORTUNITY_SCORE") {
            s.min_opportunity_score = parse_key("MERIDIAN_MIN_OPPORTUNITY_SCORE", &v)?;
        }
        if let Some(v) = read("MERIDIAN_MAX_OPPORTUNITIES_TO_SHOW") {
            s.max_opportunities_to_show = parse_key("MERIDIAN_MAX_OPPORTUNITIES_TO_SHOW", &v)?;
        }

        if let Some(v) = read("MERIDIAN_PARTIAL_TP_STAGES") {
            s.partial_tp.stages = parse_tp_stages(&v)?;
        }
        if let Some(v) = read("MERIDIAN_PARTIAL_TP_EXTREME_R") {
            s.partial_tp.extreme_r = parse_key("MERIDIAN_PARTIAL_TP_EXTREME_R", &v)?;
        }

        if let Some(v) = read("MERIDIAN_DRAWDOWN_WARNING_PCT") {
            s.drawdown.warning_pct = parse_key("MERIDIAN_DRAWDOWN_WARNING_PCT", &v)?;
        }
        if let Some(v) = read("MERIDIAN_DRAWDOWN_NO_NEW_POSITION_PCT") {
            s.drawdown.no_new_position_pct = parse_key("MERIDIAN_DRAWDOWN_NO_NEW_POSITION_PCT", &v)?;
        }
        if let Some(v) = read("MERIDIAN_DRAWDOWN_FORCE_CLOSE_PCT") {
            s.drawdown.force_close_pct = parse_key("MERIDIAN_DRAWDOWN_FORCE_CLOSE_PCT", &v)?;
        }
        if let Some(v) = read("MERIDIAN_ENABLE_DRAWDOWN_NO_NEW_POSITION") {
            s.drawdown.enable_no_new_position =
                parse_bool("MERIDIAN_ENABLE_DRAWDOWN_NO_NEW_POSITION", &v)?;
        }
        if let Some(v) = read("MERIDIAN_ENABLE_DRAWDOWN_FORCE_CLOSE") {
            s.drawdown.enable_force_close = parse_bool("MERIDIAN_ENABLE_DRAWDOWN_FORCE_CLOSE", &v)?;
        }

        s.validate()?;

        info!(
            exchange = %s.exchange,
            strategy = %s.trading_strategy,
            symbols = ?s.symbols,
            max_positions = s.max_positions,
            tick_minutes = s.trading_interval_minutes,
            "settings loaded"
        );

        Ok(s)
    }

    /// Credentials are only mandatory when the trading loop starts.
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.api_key.is_empty() {
            return Err(ConfigError::Missing("BINANCE_API_KEY".into()));
        }
        if self.api_secret.is_empty() {
            return Err(ConfigError::Missing("BINANCE_API_SECRET".into()));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.trading_interval_minutes == 0 {
            return Err(invalid("MERIDIAN_TRADING_INTERVAL_MINUTES", "0", "must be >= 1"));
        }
        if self.price_order_check_interval_secs == 0 {
            return Err(invalid("MERIDIAN_PRICE_ORDER_CHECK_INTERVAL", "0", "must be >= 1"));
        }
        if self.max_leverage < 1.0 {
            return Err(invalid(
                "MERIDIAN_MAX_LEVERAGE",
                &self.max_leverage.to_string(),
                "must be >= 1",
            ));
        }
        if self.stop_loss.min_stop_pct <= 0.0 || self.stop_loss.max_stop_pct <= self.stop_loss.min_stop_pct
        {
            return Err(invalid(
                "MERIDIAN_MAX_STOP_LOSS_PERCENT",
                &self.stop_loss.max_stop_pct.to_string(),
                "stop bounds must satisfy 0 < min < max",
            ));
        }
        let total: f64 = self.partial_tp.stages.iter().map(|t| t.fraction).sum();
        if self.partial_tp.stages.is_empty() || total > 1.0 + 1e-9 {
            return Err(invalid(
                "MERIDIAN_PARTIAL_TP_STAGES",
                &format!("{:?}", self.partial_tp.stages),
                "stage fractions must be non-empty and sum to <= 1.0",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

fn read(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_key<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| invalid(key, value, &e.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

/// Parse stage definitions of the form "1.0:0.33,2.0:0.33,3.0:0.34".
fn parse_tp_stages(value: &str) -> Result<Vec<TpStage>, ConfigError> {
    let mut stages = Vec::new();
    for part in value.split(',') {
        let (r, f) = part
            .split_once(':')
            .ok_or_else(|| invalid("MERIDIAN_PARTIAL_TP_STAGES", value, "expected R:fraction pairs"))?;
        stages.push(TpStage {
            r_multiple: parse_key("MERIDIAN_PARTIAL_TP_STAGES", r)?,
            fraction: parse_key("MERIDIAN_PARTIAL_TP_STAGES", f)?,
        });
    }
    Ok(stages)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.trading_interval_minutes, 5);
        assert_eq!(s.price_order_check_interval_secs, 30);
        assert_eq!(s.max_positions, 5);
        assert_eq!(s.max_holding_hours, 36);
        assert_eq!(s.trading_strategy, TradingStrategy::Balanced);
        assert_eq!(s.stop_loss.atr_period, 14);
        assert!((s.min_opportunity_score - 40.0).abs() < f64::EPSILON);
        assert_eq!(s.partial_tp.stages.len(), 3);
        assert!((s.partial_tp.extreme_r - 5.0).abs() < f64::EPSILON);
        assert!(!s.drawdown.enable_no_new_position);
        assert!(!s.drawdown.enable_force_close);
    }

    #[test]
    fn strategy_timeframe_triples() {
        let (p, c, f) = TradingStrategy::Balanced.timeframes();
        assert_eq!((p, c, f), (Interval::M5, Interval::M30, Interval::H4));

        let (p, _, f) = TradingStrategy::SwingTrend.timeframes();
        assert_eq!(p, Interval::H1);
        assert_eq!(f, Interval::D1);
    }

    #[test]
    fn strategy_parse_roundtrip() {
        for name in ["ultra-short", "aggressive", "balanced", "conservative", "swing-trend"] {
            let st: TradingStrategy = name.parse().unwrap();
            assert_eq!(st.to_string(), name);
        }
        assert!("yolo".parse::<TradingStrategy>().is_err());
    }

    #[test]
    fn tp_stage_parsing() {
        let stages = parse_tp_stages("1.0:0.5,2.5:0.5").unwrap();
        assert_eq!(stages.len(), 2);
        assert!((stages[1].r_multiple - 2.5).abs() < f64::EPSILON);
        assert!(parse_tp_stages("nonsense").is_err());
    }

    #[test]
    fn validation_rejects_bad_stop_bounds() {
        let mut s = Settings::default();
        s.stop_loss.max_stop_pct = 0.5; // below min_stop_pct
        assert!(s.validate().is_err());
    }

    #[test]
    fn credentials_gate() {
        let mut s = Settings::default();
        assert!(s.require_credentials().is_err());
        s.api_key = "k".into();
        s.api_secret = "s".into();
        assert!(s.require_credentials().is_ok());
    }
}
