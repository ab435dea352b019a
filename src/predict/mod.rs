//! Scheduling predictors: Monte-Carlo completion forecasting and n-gram
//! next-action suggestion.

pub mod forecast;
pub mod next_action;
pub mod resample;

pub use forecast::{Forecast, ForecastInputs, forecast};
pub use next_action::{BiGramPredictor, TriGramPredictor};
pub use resample::AliasTable;
