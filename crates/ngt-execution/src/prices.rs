//! Integer-micros prices.
//!
//! Every price stored or compared by the core is an `i64` in micros
//! (1 unit = 1_000_000 micros). Text and `f64` only appear at the edges:
//! operator input and JSON execution files ([`parse_price_micros`]) and
//! display ([`format_micros`]).

pub const MICROS_PER_UNIT: i64 = 1_000_000;

const DECIMALS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
    /// Overflows `i64` after scaling.
    OutOfRange,
    /// Not a plain decimal with at most six fractional digits.
    Malformed(String),
}

impl std::fmt::Display for PricingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PricingError::OutOfRange => write!(f, "price out of i64 micros range"),
            PricingError::Malformed(s) => write!(f, "malformed price: {s:?}"),
        }
    }
}

impl std::error::Error for PricingError {}

/// Exact decimal text → micros. Accepts `"187.25"`, `"-0.5"`, `"42"`.
pub fn parse_price_micros(text: &str) -> Result<i64, PricingError> {
    let malformed = || PricingError::Malformed(text.to_string());
    let s = text.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(malformed());
    }
    if frac.len() > DECIMALS
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(malformed());
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| PricingError::OutOfRange)?
    };
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<DECIMALS$}")
            .parse()
            .map_err(|_| malformed())?
    };
    let magnitude = whole
        .checked_mul(MICROS_PER_UNIT)
        .and_then(|w| w.checked_add(frac))
        .ok_or(PricingError::OutOfRange)?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// `187_250_000` → `"187.25"`; trailing zeros trimmed, at least two decimals.
pub fn format_micros(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let unit = MICROS_PER_UNIT as u64;
    let mut frac = format!("{:06}", abs % unit);
    while frac.len() > 2 && frac.ends_with('0') {
        frac.pop();
    }
    format!("{sign}{}.{frac}", abs / unit)
}
