pub mod moneyline;
pub mod provider;
pub mod theoddsapi;

pub use provider::OddsProvider;
pub use theoddsapi::TheOddsApi;
