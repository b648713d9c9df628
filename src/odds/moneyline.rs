//! American moneyline helpers.
//!
//! A moneyline price is either negative (stake needed to win 100) or
//! positive (profit on a 100 stake). Prices with |p| < 100 do not exist.
//!
//! To measure movement we map prices onto a continuous "cents" line where
//! -100 and +100 meet at zero:
//!
//!   +p  →  p − 100
//!   −p  →  −(p − 100)
//!
//! so −110 → +110 is a 20-cent move and −150 → +120 is 70 cents.

/// Largest price magnitude accepted; keeps cents arithmetic inside `i32`.
pub const MAX_PRICE: u32 = 100_000;

/// Whether `price` is a valid American moneyline price.
pub fn is_valid_price(price: i32) -> bool {
    (100..=MAX_PRICE).contains(&price.unsigned_abs())
}

/// Implied win probability of an American price (0.0–1.0).
pub fn implied_probability(price: i32) -> f64 {
    let p = price as f64;
    if p > 0.0 {
        100.0 / (p + 100.0)
    } else {
        -p / (-p + 100.0)
    }
}

/// Position of `price` on the continuous cents line.
pub fn to_cents(price: i32) -> i32 {
    if price >= 0 {
        price - 100
    } else {
        price + 100
    }
}

/// Signed movement from `prior` to `current` in cents.
///
/// Positive means the price lengthened (side less likely), negative means
/// it shortened (side more likely).
pub fn movement_cents(prior: i32, current: i32) -> i32 {
    to_cents(current) - to_cents(prior)
}
