use anyhow::{bail, Result};

use crate::Mutez;

/// Apply a signed delta to a non-negative amount, with fences
pub fn update_value_with_delta(value: &mut Mutez, delta: Mutez) -> Result<()> {
    let Some(updated) = value.checked_add(delta) else {
        bail!("Value overflow - was {}, delta {}", *value, delta);
    };
    if updated < 0 {
        bail!("Value underflow - was {}, delta {}", *value, delta);
    }
    *value = updated;
    Ok(())
}

/// Apply a signed delta to a counter, with fences
pub fn update_count_with_delta(value: &mut i32, delta: i32) -> Result<()> {
    let Some(updated) = value.checked_add(delta) else {
        bail!("Counter overflow - was {}, delta {}", *value, delta);
    };
    if updated < 0 {
        bail!("Counter underflow - was {}, delta {}", *value, delta);
    }
    *value = updated;
    Ok(())
}

/// `amount * numerator / denominator` without intermediate overflow, rounding down
pub fn mul_div(amount: Mutez, numerator: i64, denominator: i64) -> Result<Mutez> {
    if denominator == 0 {
        bail!("Division by zero scaling {amount} by {numerator}/0");
    }
    let scaled = (amount as i128) * (numerator as i128) / (denominator as i128);
    match Mutez::try_from(scaled) {
        Ok(v) => Ok(v),
        Err(_) => bail!("Scaled value {scaled} does not fit in mutez"),
    }
}
