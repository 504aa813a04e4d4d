pub mod classifier;
pub mod history;

pub use classifier::{
    MarketRegime, MomentumState, RegimeAnalysis, RegimeClassifier, TimeframeAlignment,
    TrendScores, TrendStrength, VolatilityState,
};
pub use history::TrendScoreHistory;
