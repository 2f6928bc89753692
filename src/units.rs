use std::sync::Arc;

/// Pluggable per-entry cost model.
///
/// The cache multiplies nothing into the result; whatever this returns is
/// the entry's unit count, summed into `current_units` and bounded by
/// `high_units`. Implementations should be cheap since the calculator runs
/// on every insert and update.
///
/// # Examples
///
/// ```
/// use cachette::UnitCalculator;
///
/// struct ByLength;
///
/// impl UnitCalculator<String, String> for ByLength {
///     fn calculate_units(&self, _key: &String, value: &String) -> i64 {
///         value.len().max(1) as i64
///     }
/// }
/// ```
pub trait UnitCalculator<K, V>: Send + Sync {
    /// Returns the cost of holding `value` under `key`, in units. Must be
    /// non-negative.
    fn calculate_units(&self, key: &K, value: &V) -> i64;
}

/// Unit calculator selection: the fixed built-in or an injected
/// implementation.
#[derive(Clone)]
pub enum UnitCalculatorKind<K, V> {
    /// Every entry costs exactly one unit. The default.
    Fixed,
    /// Delegate to an external calculator.
    External(Arc<dyn UnitCalculator<K, V>>),
}

impl<K, V> UnitCalculatorKind<K, V> {
    /// Computes the unit cost of an entry under this calculator.
    ///
    /// Negative results from an external calculator are clamped to zero so
    /// a misbehaving implementation cannot corrupt unit accounting.
    pub fn units_for(&self, key: &K, value: &V) -> i64 {
        match self {
            UnitCalculatorKind::Fixed => 1,
            UnitCalculatorKind::External(calc) => calc.calculate_units(key, value).max(0),
        }
    }
}

impl<K, V> std::fmt::Debug for UnitCalculatorKind<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitCalculatorKind::Fixed => write!(f, "Fixed"),
            UnitCalculatorKind::External(_) => write!(f, "External"),
        }
    }
}
