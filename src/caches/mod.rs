//! Read-mostly caches: symbol metadata, prices and per-address balances.

pub mod balance;
pub mod price;
pub mod symbol;

pub use balance::PositionBalanceCache;
pub use price::PriceCache;
pub use symbol::{SymbolCache, SymbolLoader};
